//! Error types for stagepipe.
//!
//! A single crate-wide enum keeps the failure taxonomy in one place:
//! channel setup, task runtime rejections, and completion-channel loss
//! each get their own variant so callers can tell fatal from non-fatal
//! outcomes apart.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type StagepipeResult<T> = Result<T, StagepipeError>;

#[derive(Debug, Error)]
pub enum StagepipeError {
    /// Channel / FIFO setup failed (missing directory, name collision).
    #[error("channel allocation failed: {0}")]
    Allocation(String),

    /// Write attempted after the write end was closed.
    #[error("channel write end is closed")]
    ClosedChannel,

    /// The task runtime rejected stage creation.
    #[error("task creation failed: {0}")]
    Creation(String),

    /// The task runtime rejected a start call.
    #[error("task start failed: {0}")]
    Start(String),

    /// The runtime-level stdin-close signal could not be delivered.
    ///
    /// Non-fatal: the coordinator records it and keeps waiting for the
    /// downstream stage, which may still observe EOF through the channel.
    #[error("stdin close failed: {0}")]
    Close(String),

    /// The completion channel itself failed (runtime connection lost).
    #[error("wait failed: {0}")]
    Wait(String),

    /// The caller-supplied deadline elapsed before the pipeline completed.
    #[error("pipeline deadline elapsed")]
    Timeout,

    /// Invariant violation inside the crate.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
