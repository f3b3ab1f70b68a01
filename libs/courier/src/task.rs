//! Per-request task state.

use crate::auth::Auth;
use crate::executor;
use crate::queue::CompletionQueue;
use crate::request::PreparedRequest;
use crate::retry::RetryPolicy;
use crate::taxonomy::{Completion, Expectations};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Built but not resumed yet
    Created,
    /// Attempts in progress or a decision pending
    Running,
    /// Canceled; the sink received (or will receive) `Canceled`
    Canceled,
    /// Finished with success or failure
    Completed,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Canceled | TaskState::Completed)
    }
}

/// Receives the untyped completion; wraps the caller's parse step and callback.
pub(crate) type Sink = Box<dyn FnOnce(Completion) + Send>;

/// Everything a task needs, captured when the request is built.
pub(crate) struct TaskConfig {
    pub(crate) request: PreparedRequest,
    pub(crate) auth: Option<Arc<dyn Auth>>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) expectations: Expectations,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) queue: CompletionQueue,
    pub(crate) runtime: Handle,
}

struct Inner {
    state: TaskState,
    generic_retry_attempt: u32,
    auth_retry_used: bool,
    attempt: Option<AbortHandle>,
    attempts: u32,
    sink: Option<Sink>,
}

struct Shared {
    id: u64,
    config: TaskConfig,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

/// One logical request, executed as one or more network attempts.
///
/// Cheap to clone; clones refer to the same task. The completion sink
/// fires exactly once: with the final outcome, or with `Canceled` if
/// [`cancel`](Task::cancel) wins.
#[derive(Clone)]
pub struct Task {
    shared: Arc<Shared>,
}

impl Task {
    pub(crate) fn new(config: TaskConfig, sink: Sink) -> Self {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(task_id = id, method = %config.request.method(), url = %config.request.url(), "task created");
        Self {
            shared: Arc::new(Shared {
                id,
                config,
                cancel: CancellationToken::new(),
                inner: Mutex::new(Inner {
                    state: TaskState::Created,
                    generic_retry_attempt: 0,
                    auth_retry_used: false,
                    attempt: None,
                    attempts: 0,
                    sink: Some(sink),
                }),
            }),
        }
    }

    /// Process-unique task id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.shared.inner.lock().state
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state() == TaskState::Canceled
    }

    /// The request as built, before auth headers are applied
    #[must_use]
    pub fn request(&self) -> &PreparedRequest {
        &self.shared.config.request
    }

    /// Auth attached to this task, if any
    #[must_use]
    pub fn auth(&self) -> Option<&Arc<dyn Auth>> {
        self.shared.config.auth.as_ref()
    }

    #[must_use]
    pub fn retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.shared.config.retry_policy.as_ref()
    }

    /// Generic retries performed so far
    #[must_use]
    pub fn generic_retry_attempt(&self) -> u32 {
        self.shared.inner.lock().generic_retry_attempt
    }

    /// Whether the single auth retry was already used
    #[must_use]
    pub fn auth_retry_used(&self) -> bool {
        self.shared.inner.lock().auth_retry_used
    }

    /// Network attempts issued so far
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.shared.inner.lock().attempts
    }

    /// Start executing. Only the first call has an effect.
    pub fn resume(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != TaskState::Created {
                return;
            }
            inner.state = TaskState::Running;
        }

        let request = self.request();
        let span = tracing::debug_span!(
            "courier.task",
            task_id = self.id(),
            method = %request.method(),
            host = request.url().host_str().unwrap_or_default(),
        );
        self.shared
            .config
            .runtime
            .spawn(executor::drive(self.clone()).instrument(span));
    }

    /// Cancel the task. Idempotent; no effect once the task has finished.
    ///
    /// Aborts the attempt in flight. Decisions answered afterwards are
    /// discarded and the sink receives `Canceled`.
    pub fn cancel(&self) {
        let (sink, attempt) = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = TaskState::Canceled;
            (inner.sink.take(), inner.attempt.take())
        };

        self.shared.cancel.cancel();
        if let Some(attempt) = attempt {
            attempt.abort();
        }
        tracing::debug!(task_id = self.id(), "task canceled");

        if let Some(sink) = sink {
            self.deliver(sink, Completion::Canceled);
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.shared.config.runtime
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.config.transport
    }

    pub(crate) fn expectations(&self) -> &Expectations {
        &self.shared.config.expectations
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Register the attempt in flight. Returns `false` (and aborts the
    /// attempt) when the task is no longer running.
    pub(crate) fn begin_attempt(&self, attempt: AbortHandle) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state != TaskState::Running {
            drop(inner);
            attempt.abort();
            return false;
        }
        inner.attempt = Some(attempt);
        inner.attempts += 1;
        true
    }

    pub(crate) fn end_attempt(&self) {
        self.shared.inner.lock().attempt = None;
    }

    /// Record the auth retry. `false` when canceled meanwhile.
    pub(crate) fn commit_auth_retry(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state != TaskState::Running {
            return false;
        }
        inner.auth_retry_used = true;
        true
    }

    /// Record a generic retry. `false` when canceled meanwhile.
    pub(crate) fn commit_generic_retry(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state != TaskState::Running {
            return false;
        }
        inner.generic_retry_attempt += 1;
        true
    }

    /// Deliver the final completion unless cancellation already did.
    pub(crate) fn finish(&self, completion: Completion) {
        let sink = {
            let mut inner = self.shared.inner.lock();
            if inner.state != TaskState::Running {
                return;
            }
            inner.state = TaskState::Completed;
            inner.attempt = None;
            inner.sink.take()
        };

        tracing::debug!(task_id = self.id(), outcome = completion.label(), "task finished");
        if let Some(sink) = sink {
            self.deliver(sink, completion);
        }
    }

    fn deliver(&self, sink: Sink, completion: Completion) {
        tracing::trace!(task_id = self.id(), queue = ?self.shared.config.queue, "dispatching completion");
        self.shared
            .config
            .queue
            .dispatch(Box::new(move || sink(completion)));
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("method", self.request().method())
            .field("url", &self.request().url().as_str())
            .finish_non_exhaustive()
    }
}
