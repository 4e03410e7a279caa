//! The togomak pipeline engine.
//!
//! A pipeline file declares stages, data sources, macros, locals and imports.
//! The engine expands imports and locals, builds a dependency graph from
//! expression traversals plus explicit `depends_on` edges, and executes the
//! graph layer by layer: every runnable in a layer runs concurrently, outputs
//! publish into the shared evaluation context, and the next layer starts once
//! all non-daemon runnables of the previous one have returned.

pub mod blocks;
pub mod config;
pub mod error;
pub mod filter;
pub mod globals;
pub mod graph;
pub mod handler;
pub mod outputs;
pub mod pipeline;
pub mod providers;
pub mod resolver;
pub mod runtime;
pub mod scheduler;

pub use config::{Behavior, Child, Config, Paths};
pub use error::{EngineError, Result};
pub use pipeline::Pipeline;
pub use scheduler::Orchestrator;

use crate::runtime::container::ContainerRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use togomak_expr::SharedContext;
use uuid::Uuid;

/// Shared per-run state threaded through the scheduler, stage runtime and
/// providers.
pub struct RunContext {
    pub ctx: SharedContext,
    pub config: Config,
    pub tempdir: PathBuf,
    pub pipeline_id: Uuid,
    pub container: Arc<dyn ContainerRuntime>,
    /// Run-wide graceful cancellation (first interrupt, or post-failure
    /// daemon drain in unattended mode).
    pub terminate: tokio_util::sync::CancellationToken,
    /// Run-wide forceful cancellation (second interrupt).
    pub kill: tokio_util::sync::CancellationToken,
}

pub type SharedRun = Arc<RunContext>;
