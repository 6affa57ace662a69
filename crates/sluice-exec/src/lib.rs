//! Task execution engine for the Sluice workflow system.
//!
//! The [`Executioner`] drains a queue of ready tasks and runs each one
//! through a pluggable [`Backend`]: directly on the local machine, on a pool
//! of ssh nodes, or through a batch scheduler's command-line clients.
//! Progress is observable via broadcast [`EngineEvent`]s.

pub mod backend;
pub mod batch;
pub mod config;
pub mod events;
pub mod executioner;
pub mod local;
pub mod ssh;

pub use backend::{Backend, CmdSpec};
pub use batch::BatchBackend;
pub use config::{BackendKind, EngineConfig};
pub use events::{EngineEvent, EventEmitter};
pub use executioner::{backend_from_config, Executioner, RunSummary};
pub use local::LocalBackend;
pub use ssh::SshBackend;
