//! The isolated worker execution context and its lifecycle.

mod engine;
mod env;
mod lifecycle;
mod sink;
mod stdio;

use thiserror::Error;

pub use engine::{
    Collaborators, EngineExit, ReconstitutionEngine, RenderStateStore, StandardWorkerFactory,
    WorkerFactory,
};
pub use env::{Condition, EnvParseError, ExecutionMode, WorkerEnv};
pub use lifecycle::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_SHUTDOWN_GRACE, StartupError, Termination, WORKER_SUBCOMMAND,
    WorkerEntry, WorkerHandle, WorkerSpec, create_worker,
};
pub use sink::OutputSink;
pub use stdio::serve_stdio;

/// Failures of the worker process itself, as opposed to per-route failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Env(#[from] EnvParseError),
    #[error("worker startup failed: {0}")]
    Startup(String),
}
