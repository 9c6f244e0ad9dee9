//! stagepipe: shell-pipe semantics across two externally-managed tasks.
//!
//! Reproduces `A | B` where each side is a process owned by an external
//! task runtime (e.g. a container engine). The runtime creates and
//! starts the processes; this crate owns the part that is easy to get
//! wrong: wiring the inter-stage channel before either process exists,
//! sequencing create/wait/start so no completion signal is missed, and
//! propagating EOF downstream at exactly the right moment.
//!
//! ## Architecture
//!
//! ```text
//! PipelineCoordinator ──→ StagePipeline ──→ PipeChannel (x2)
//!         │
//!         └──→ dyn TaskRuntime (external: create/start/wait/delete)
//!
//! stage A stdout ──→ shared FIFO ──→ stage B stdin
//! stage B stdout ──→ output FIFO ──→ coordinator drain
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stagepipe::{PipelineCoordinator, PipelineOptions, StageSpec};
//!
//! let options = PipelineOptions::new(
//!     StageSpec::new("ls", "docker.io/library/alpine:latest", ["ls", "-la"]),
//!     StageSpec::new("grep", "docker.io/library/alpine:latest", ["grep", "bin"]),
//! );
//! let coordinator = PipelineCoordinator::new(runtime, options);
//! let report = coordinator.run().await?;
//! assert!(report.exit.success());
//! ```

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod errors;
mod logging;
pub mod pipeline;
pub mod runtime;

pub use channel::{ChannelState, PipeChannel};
pub use config::{PipelineOptions, StageSpec};
pub use coordinator::{PipelineCoordinator, PipelineReport};
pub use errors::{StagepipeError, StagepipeResult};
pub use logging::init_logging;
pub use pipeline::{IoBinding, StagePipeline};
pub use runtime::{ExitStatus, TaskHandle, TaskRuntime, WaitHandle};
