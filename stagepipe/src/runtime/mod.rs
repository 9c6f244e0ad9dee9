//! Task runtime contract.
//!
//! The external collaborator that owns process/container lifecycle.
//! stagepipe consumes this contract and never implements a real one;
//! [`testing`] provides an in-process simulation for tests.
//!
//! Lifecycle methods live on the task handle (`start`/`wait`/
//! `close_stdin`/`delete`), with the runtime itself responsible only
//! for image pulls and task creation.

pub mod testing;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::config::StageSpec;
use crate::errors::StagepipeResult;
use crate::pipeline::IoBinding;

/// Exit status of a completed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Resolves once the stage's process exits.
///
/// A dropped sender means the completion channel itself failed
/// (runtime connection lost) and maps to [`crate::StagepipeError::Wait`].
pub type WaitHandle = oneshot::Receiver<ExitStatus>;

/// External process/container lifecycle owner.
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    /// Fetch the image backing a stage. May block on network I/O.
    async fn pull(&self, image: &str) -> StagepipeResult<()>;

    /// Instantiate a stage as a runtime task, attached to the given
    /// I/O binding. The task is created stopped; `start` launches it.
    async fn create_task(
        &self,
        spec: &StageSpec,
        io: &IoBinding,
    ) -> StagepipeResult<Box<dyn TaskHandle>>;
}

/// Handle to one created task.
#[async_trait]
pub trait TaskHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Launch the task's process.
    async fn start(&self) -> StagepipeResult<()>;

    /// Register a completion wait-handle.
    ///
    /// Must be registered before `start`: a task completing between
    /// `start` and a later `wait` could have its signal missed.
    async fn wait(&self) -> StagepipeResult<WaitHandle>;

    /// Runtime-level close of the task's stdin descriptor. Distinct
    /// from the byte-channel half-close; the runtime may hold its own
    /// copy of the descriptor.
    async fn close_stdin(&self) -> StagepipeResult<()>;

    /// Best-effort teardown of the task and its runtime resources.
    async fn delete(&self) -> StagepipeResult<()>;
}
