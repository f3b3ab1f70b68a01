//! One-shot retry decisions.
//!
//! Auth challenge handlers and retry policies answer asynchronously through a
//! [`Decision`]. The handle is consumed by [`Decision::complete`], so a
//! decision can never be answered twice. A handle dropped without an answer
//! resolves to "do not retry".

use tokio::sync::oneshot;

/// Which extension point a decision was handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecisionSource {
    Auth,
    RetryPolicy,
}

impl DecisionSource {
    fn as_str(self) -> &'static str {
        match self {
            DecisionSource::Auth => "auth",
            DecisionSource::RetryPolicy => "retry_policy",
        }
    }
}

/// Completion handle for an asynchronous retry decision.
///
/// May be moved to any thread or task and completed later. The task stays
/// suspended until it is completed (or dropped), unless the task is canceled
/// first, in which case the answer is discarded.
#[must_use = "dropping a Decision without completing it declines the retry"]
pub struct Decision {
    tx: Option<oneshot::Sender<bool>>,
    task_id: u64,
    source: DecisionSource,
}

impl Decision {
    pub(crate) fn channel(task_id: u64, source: DecisionSource) -> (Self, DecisionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Some(tx),
                task_id,
                source,
            },
            DecisionReceiver(rx),
        )
    }

    /// Answer the decision: `true` issues a new attempt, `false` finalizes
    /// the task with the error that triggered the decision.
    pub fn complete(mut self, retry: bool) {
        if let Some(tx) = self.tx.take() {
            // Receiver is gone when the task was canceled meanwhile.
            tx.send(retry).ok();
        }
    }

    /// Id of the task waiting on this decision
    #[must_use]
    pub fn task_id(&self) -> u64 {
        self.task_id
    }
}

impl std::fmt::Debug for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decision")
            .field("task_id", &self.task_id)
            .field("source", &self.source.as_str())
            .field("pending", &self.tx.is_some())
            .finish()
    }
}

impl Drop for Decision {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::warn!(
                task_id = self.task_id,
                source = self.source.as_str(),
                "retry decision dropped without completion; treating as no retry"
            );
            tx.send(false).ok();
        }
    }
}

/// Executor side of a [`Decision`].
pub(crate) struct DecisionReceiver(oneshot::Receiver<bool>);

impl DecisionReceiver {
    /// Wait for the answer. A sender that vanished without sending counts as
    /// "do not retry".
    pub(crate) async fn wait(self) -> bool {
        self.0.await.unwrap_or(false)
    }
}
