use thiserror::Error;

/// Failures reported by a chain adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("chain source unavailable: {0}")]
    Unavailable(String),
    #[error("height {0} is not present on the chain")]
    NotFound(u64),
}

/// Failures reported by the storage facade. A missing record is expressed
/// as `Ok(None)` by lookups, not as an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chain {0} is not registered")]
    UnknownChain(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Failures while validating or persisting a single block.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid block at height {height}: {reason}")]
    Invalid { height: u64, reason: &'static str },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Submission-side errors of the task pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The bounded work queue had no free slot within the submit deadline.
    /// This is the backpressure signal; the caller retries the same task.
    #[error("work queue is full")]
    QueueFull,
    #[error("task pool is stopped")]
    Stopped,
}

/// Outcome-side errors carried by a task outcome.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("batch partially failed: {processed} processed, {failed} failed")]
    Partial { processed: usize, failed: usize },
    #[error("task cancelled before execution")]
    Cancelled,
    #[error("task handler panicked: {0}")]
    Panicked(String),
}

/// Gap detection and recovery errors.
#[derive(Debug, Error)]
pub enum GapError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("fetching blocks {start}..={end} failed: {source}")]
    Fetch {
        start: u64,
        end: u64,
        #[source]
        source: AdapterError,
    },
    #[error("processing blocks {start}..={end} failed for {failed} of {total} blocks")]
    Process { start: u64, end: u64, failed: usize, total: usize },
    #[error("gap recovery incomplete: {recovered} of {total} gaps recovered")]
    Partial { recovered: usize, total: usize },
}

/// Lifecycle contract violations of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("indexer is already running")]
    AlreadyRunning,
    #[error("indexer is not running")]
    NotRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
}
