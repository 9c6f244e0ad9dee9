//! End-to-end pipeline sequencing.
//!
//! The coordinator drives one run:
//!
//! ```text
//! Built → Created → WaitRegistered → Started → LeftDone
//!       → RightSignaled → Completed
//! ```
//!
//! Ordering is load-bearing:
//! - channel wiring precedes any process start;
//! - wait handles for BOTH stages are registered before either start, so
//!   a fast-completing task cannot have its signal missed;
//! - the shared channel's write end closes only after the left stage's
//!   completion is observed;
//! - the right stage is awaited regardless of whether the stdin-close
//!   signal could be delivered.
//!
//! Any fatal error short-circuits to cleanup: created tasks deleted
//! most-recently-created first, pipeline resources released, first error
//! surfaced to the caller.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

use crate::config::PipelineOptions;
use crate::errors::{StagepipeError, StagepipeResult};
use crate::pipeline::StagePipeline;
use crate::runtime::{ExitStatus, TaskHandle, TaskRuntime};

/// Where a run currently is; carried in tracing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Built,
    Created,
    WaitRegistered,
    Started,
    LeftDone,
    RightSignaled,
    Completed,
}

/// Outcome of a completed pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// The right (downstream) stage's exit status.
    pub exit: ExitStatus,
    /// Everything the right stage wrote to stdout, drained to the last
    /// byte before the run is declared complete.
    pub stdout: Vec<u8>,
    /// Set when the runtime-level stdin-close signal failed. Non-fatal;
    /// the run still completed.
    pub stdin_close_error: Option<String>,
}

/// Drives two runtime tasks connected by a [`StagePipeline`].
pub struct PipelineCoordinator {
    runtime: Arc<dyn TaskRuntime>,
    options: PipelineOptions,
}

impl PipelineCoordinator {
    pub fn new(runtime: Arc<dyn TaskRuntime>, options: PipelineOptions) -> Self {
        Self { runtime, options }
    }

    /// Execute the pipeline to completion.
    ///
    /// Returns the right stage's exit result, or the first fatal error.
    /// Teardown (task deletion, channel release, scratch-dir removal)
    /// runs on both paths, including deadline expiry.
    pub async fn run(&self) -> StagepipeResult<PipelineReport> {
        let mut scratch: Option<TempDir> = None;
        let base_dir = match &self.options.fifo_dir {
            Some(dir) => dir.clone(),
            None => {
                let dir = tempfile::tempdir().map_err(|e| {
                    StagepipeError::Allocation(format!("scratch dir: {}", e))
                })?;
                let path = dir.path().to_path_buf();
                scratch = Some(dir);
                path
            }
        };

        let mut pipeline = StagePipeline::build(&base_dir)?;
        let mut tasks: Vec<Box<dyn TaskHandle>> = Vec::new();

        let driven = self.drive(&mut pipeline, &mut tasks);
        let result = match self.options.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, driven).await {
                Ok(result) => result,
                Err(_) => Err(StagepipeError::Timeout),
            },
            None => driven.await,
        };

        // Best-effort teardown on success and failure alike, deleting
        // most-recently-created first. Teardown errors are logged; the
        // drive result is what the caller sees.
        while let Some(task) = tasks.pop() {
            if let Err(e) = task.delete().await {
                tracing::warn!(stage_id = task.id(), error = %e, "task delete failed in teardown");
            }
        }
        drop(pipeline);
        drop(scratch);

        match &result {
            Ok(report) => tracing::info!(code = report.exit.code, "pipeline completed"),
            Err(e) => tracing::error!(error = %e, "pipeline failed"),
        }
        result
    }

    async fn drive(
        &self,
        pipeline: &mut StagePipeline,
        tasks: &mut Vec<Box<dyn TaskHandle>>,
    ) -> StagepipeResult<PipelineReport> {
        let mut phase = Phase::Built;
        tracing::debug!(?phase, "pipeline wired");

        self.runtime.pull(&self.options.left.image).await?;
        if self.options.right.image != self.options.left.image {
            self.runtime.pull(&self.options.right.image).await?;
        }

        let left_io = pipeline.left_binding(&self.options.left.id);
        tasks.push(self.runtime.create_task(&self.options.left, &left_io).await?);
        let right_io = pipeline.right_binding(&self.options.right.id);
        tasks.push(self.runtime.create_task(&self.options.right, &right_io).await?);
        phase = Phase::Created;
        tracing::debug!(?phase, "stage tasks created");

        // Both waits before either start.
        let left_wait = tasks[0].wait().await?;
        let right_wait = tasks[1].wait().await?;
        phase = Phase::WaitRegistered;
        tracing::debug!(?phase, "wait handles registered");

        // The drain owns the read end of the right stage's stdout and
        // must run before the producer starts, or a full undrained pipe
        // blocks it.
        let output = pipeline.take_right_output().ok_or_else(|| {
            StagepipeError::Internal("right stage output already drained".into())
        })?;
        let drain = spawn_stdout_drain(output);

        // Fixed start order: left, then right.
        for task in tasks.iter() {
            task.start().await?;
        }
        phase = Phase::Started;
        tracing::debug!(?phase, "stage tasks started");

        let left_exit = left_wait
            .await
            .map_err(|_| StagepipeError::Wait("left completion channel dropped".into()))?;
        phase = Phase::LeftDone;
        tracing::debug!(?phase, code = left_exit.code, "left stage completed");

        // EOF for the right stage: half-close the shared channel, then
        // ask the runtime to close its own copy of the stdin descriptor.
        // The latter failing is non-fatal; the stage can still observe
        // EOF through the channel itself.
        pipeline.half_close();
        let stdin_close_error = match tasks[1].close_stdin().await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(stage_id = tasks[1].id(), error = %e, "stdin close signal failed");
                Some(e.to_string())
            }
        };
        phase = Phase::RightSignaled;
        tracing::debug!(?phase, "right stage signalled");

        let exit = right_wait
            .await
            .map_err(|_| StagepipeError::Wait("right completion channel dropped".into()))?;

        // Join the drain before declaring completion so trailing output
        // cannot be lost on a fast exit.
        pipeline.release_right_output();
        let stdout = drain
            .await
            .map_err(|e| StagepipeError::Internal(format!("stdout drain failed: {}", e)))?;

        phase = Phase::Completed;
        tracing::debug!(?phase, code = exit.code, "pipeline run complete");

        Ok(PipelineReport {
            exit,
            stdout,
            stdin_close_error,
        })
    }
}

/// Drain a detached read end to a buffer until EOF.
fn spawn_stdout_drain(mut output: pipe::Receiver) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match output.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(e) => {
                    tracing::warn!(error = %e, "stdout drain read failed");
                    break;
                }
            }
        }
        collected
    })
}
