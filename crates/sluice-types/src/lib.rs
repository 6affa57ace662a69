//! Shared types for the Sluice workflow engine.
//!
//! This crate provides the foundation used across all other Sluice crates:
//! - `SluiceError`: unified error taxonomy
//! - `fields`: the tab-separated checkpoint record codec

pub mod fields;

/// Unified error type for all Sluice subsystems.
#[derive(Debug, thiserror::Error)]
pub enum SluiceError {
    // === Task state machine errors ===
    #[error("Task '{task}': cannot jump from state '{from}' to state '{to}'")]
    IllegalTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Circular dependency on task '{task}'")]
    CircularDependency { task: String },

    // === Registry errors ===
    #[error("Output file '{path}' already registered by task '{registered}', rejecting task '{task}'")]
    DuplicateOutput {
        path: String,
        task: String,
        registered: String,
    },

    #[error("Task id '{id}' already registered")]
    DuplicateTaskId { id: String },

    // === Backend errors ===
    #[error("Failed to start task '{task}': {message}")]
    SpawnFailed { task: String, message: String },

    #[error("Backend '{backend}' failed on task '{task}': {message}")]
    BackendError {
        backend: String,
        task: String,
        message: String,
    },

    // === Checkpoint errors ===
    #[error("Malformed checkpoint record at line {line}: {message}")]
    RecordError { line: usize, message: String },

    // === Configuration ===
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl SluiceError {
    /// Returns `true` for configuration/programmer errors that must abort the
    /// run: an illegal state transition, a dependency cycle, or a registry
    /// collision indicates a scheduler or workflow bug, not a task failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SluiceError::IllegalTransition { .. }
                | SluiceError::CircularDependency { .. }
                | SluiceError::DuplicateOutput { .. }
                | SluiceError::DuplicateTaskId { .. }
                | SluiceError::RecordError { .. }
                | SluiceError::ConfigError(_)
        )
    }

    /// Returns `true` for transient backend failures where a retry decision
    /// belongs to the executioner.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SluiceError::SpawnFailed { .. } | SluiceError::BackendError { .. }
        )
    }
}

/// A convenience alias for `Result<T, SluiceError>`.
pub type Result<T> = std::result::Result<T, SluiceError>;
