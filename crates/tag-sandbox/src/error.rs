//! Host-side errors for the tagbox sandboxes.
//!
//! Failures attributable to the script (throws, timeouts, heap exhaustion,
//! protocol breakage by a worker) are never errors: they are classified into
//! [`crate::ExecutionResult`]. `SandboxError` covers what is left, the host
//! being unable to start an execution at all.

use thiserror::Error;

/// Errors that prevent a sandbox from producing a result.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Too many concurrent isolate executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// The worker binary could not be located or is unsafe to run.
    #[error("worker binary unavailable: {0}")]
    WorkerBinary(String),

    /// A worker process could not be started or never announced its socket.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// No worker became available within the acquire timeout.
    #[error("timed out after {timeout_ms}ms waiting for a free worker")]
    AcquireTimeout {
        /// Configured acquire timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The pool has been shut down.
    #[error("worker pool is shut down")]
    PoolShutdown,

    /// Generic host failure (thread spawn, runtime construction).
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}
