use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Job run on a completion queue
pub type CompletionJob = Box<dyn FnOnce() + Send>;

/// Where a task's completion sink (and its parse step) runs.
#[derive(Clone)]
pub enum CompletionQueue {
    /// Blocking thread pool of the given runtime. Parse steps may do CPU
    /// work here without stalling the runtime's workers.
    Runtime(Handle),
    /// Directly on the executor task that finished the request
    Inline,
    /// Caller-provided dispatcher, e.g. a channel into a UI loop
    Custom(Arc<dyn Fn(CompletionJob) + Send + Sync>),
}

impl CompletionQueue {
    pub fn custom<F>(dispatch: F) -> Self
    where
        F: Fn(CompletionJob) + Send + Sync + 'static,
    {
        CompletionQueue::Custom(Arc::new(dispatch))
    }

    pub(crate) fn dispatch(&self, job: CompletionJob) {
        match self {
            CompletionQueue::Runtime(handle) => {
                // Detached; the job owns everything it needs.
                drop(handle.spawn_blocking(job));
            }
            CompletionQueue::Inline => job(),
            CompletionQueue::Custom(dispatch) => dispatch(job),
        }
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionQueue::Runtime(_) => f.write_str("CompletionQueue::Runtime"),
            CompletionQueue::Inline => f.write_str("CompletionQueue::Inline"),
            CompletionQueue::Custom(_) => f.write_str("CompletionQueue::Custom"),
        }
    }
}
