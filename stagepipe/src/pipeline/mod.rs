//! Stage I/O wiring.
//!
//! A `StagePipeline` owns the two channels backing a two-stage pipeline
//! and hands out per-stage [`IoBinding`]s for the task runtime to attach:
//!
//! ```text
//! stage A stdout ──→ "left" FIFO ──→ stage B stdin
//! stage B stdout ──→ "right" FIFO ──→ consumer drain
//! ```
//!
//! The cross-wiring (right stdin = left stdout) is fixed at build time,
//! strictly before either stage process exists; data written before the
//! wire-up would otherwise be lost.

use std::path::{Path, PathBuf};

use tokio::net::unix::pipe;

use crate::channel::PipeChannel;
use crate::errors::{StagepipeError, StagepipeResult};

/// Stream attach points for one stage, addressed by FIFO path.
///
/// A capability object handed to the task runtime at task creation; the
/// runtime decides when the process-side descriptors are actually
/// opened. `None` means the runtime's default sink for that stream.
#[derive(Debug, Clone)]
pub struct IoBinding {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// The pre-wired I/O for both stages of a pipeline run.
#[derive(Debug)]
pub struct StagePipeline {
    /// Shared data path: left stage stdout, right stage stdin.
    left: PipeChannel,
    /// Right stage stdout, drained by the coordinator.
    right: PipeChannel,
}

impl StagePipeline {
    /// Allocate both channels under `base_dir` and wire them.
    ///
    /// The right stage gets no writer of its own on the shared FIFO: the
    /// independent stdin write end is opened and dropped here, so the
    /// only live write end left is the parent-held one the coordinator
    /// closes after the left stage completes.
    pub fn build(base_dir: &Path) -> StagepipeResult<Self> {
        let left = PipeChannel::open(base_dir, "left")?;
        let right = PipeChannel::open(base_dir, "right")?;

        let stdin_writer = pipe::OpenOptions::new()
            .open_sender(left.path())
            .map_err(|e| {
                StagepipeError::Allocation(format!(
                    "open right stdin writer {}: {}",
                    left.path().display(),
                    e
                ))
            })?;
        drop(stdin_writer);

        tracing::debug!(
            shared = %left.path().display(),
            output = %right.path().display(),
            "stage pipeline wired"
        );

        Ok(Self { left, right })
    }

    /// Binding for the upstream stage: stdout feeds the shared channel.
    pub fn left_binding(&self, stage_id: &str) -> IoBinding {
        tracing::trace!(stage_id, "left binding requested");
        IoBinding {
            stdin: None,
            stdout: Some(self.left.path().to_path_buf()),
            stderr: None,
        }
    }

    /// Binding for the downstream stage: stdin reads the shared channel.
    pub fn right_binding(&self, stage_id: &str) -> IoBinding {
        tracing::trace!(stage_id, "right binding requested");
        IoBinding {
            stdin: Some(self.left.path().to_path_buf()),
            stdout: Some(self.right.path().to_path_buf()),
            stderr: None,
        }
    }

    /// Half-close the shared channel: EOF for the right stage's stdin
    /// once buffered bytes are consumed. Idempotent.
    pub fn half_close(&mut self) {
        self.left.close_write();
    }

    /// Detach the read end of the right stage's stdout for a drain task.
    pub fn take_right_output(&mut self) -> Option<pipe::Receiver> {
        self.right.take_reader()
    }

    /// Release the parent-held write end of the right stage's stdout so
    /// the drain observes EOF once that stage has exited. Idempotent.
    pub fn release_right_output(&mut self) {
        self.right.close_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn right_stdin_wired_to_left_stdout() {
        let dir = TempDir::new().unwrap();
        let pipeline = StagePipeline::build(dir.path()).unwrap();

        let left = pipeline.left_binding("a");
        let right = pipeline.right_binding("b");

        assert!(left.stdin.is_none());
        assert_eq!(left.stdout, right.stdin, "cross-wiring must exist at build time");
        assert_ne!(right.stdout, right.stdin);
    }

    #[tokio::test]
    async fn build_in_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent");
        let err = StagePipeline::build(&missing).unwrap_err();
        assert!(matches!(err, StagepipeError::Allocation(_)));
    }

    #[tokio::test]
    async fn fifos_removed_when_pipeline_drops() {
        let dir = TempDir::new().unwrap();
        let (left, right) = {
            let pipeline = StagePipeline::build(dir.path()).unwrap();
            (
                pipeline.left_binding("a").stdout.unwrap(),
                pipeline.right_binding("b").stdout.unwrap(),
            )
        };
        assert!(!left.exists());
        assert!(!right.exists());
    }
}
