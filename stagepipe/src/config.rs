//! Run configuration.
//!
//! Image references, stage identity, and scratch locations are explicit
//! options passed into the coordinator at construction, not ambient
//! process-wide globals.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the task runtime needs to instantiate one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage identity, also used as the task id at the runtime.
    pub id: String,
    /// Image reference the runtime pulls before creation.
    pub image: String,
    /// Process argv inside the task.
    pub args: Vec<String>,
}

impl StageSpec {
    pub fn new(
        id: impl Into<String>,
        image: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Options for one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Upstream stage (its stdout feeds the pipe).
    pub left: StageSpec,
    /// Downstream stage (its stdin reads the pipe).
    pub right: StageSpec,
    /// Directory for the named-pipe pair. `None` allocates a fresh
    /// scratch directory per run, removed at teardown.
    #[serde(default)]
    pub fifo_dir: Option<PathBuf>,
    /// Overall deadline for the run. On expiry the coordinator takes the
    /// same cleanup path as a fatal error.
    #[serde(default)]
    pub deadline: Option<Duration>,
}

impl PipelineOptions {
    pub fn new(left: StageSpec, right: StageSpec) -> Self {
        Self {
            left,
            right,
            fifo_dir: None,
            deadline: None,
        }
    }
}
