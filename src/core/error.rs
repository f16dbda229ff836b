use crate::store::StoreError;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Port '{port}' not found on {side} of '{process}'")]
    PortNotFound {
        process: String,
        side: &'static str,
        port: String,
    },

    #[error("Type mismatch on port '{port}': {found} is not accepted (expected one of {expected})")]
    TypeMismatch {
        port: String,
        found: String,
        expected: String,
    },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Protocol '{0}' is locked: it is running, finished or validated")]
    ProtocolLocked(String),

    #[error("No experiment bound to the job of protocol '{0}'")]
    MissingExperiment(String),

    #[error("Experiment '{uri}' cannot run: {reason}")]
    ExperimentState { uri: String, reason: String },

    #[error("The queue is full (max length {0})")]
    QueueFull(usize),

    #[error("Process '{0}' not found")]
    ProcessNotFound(String),

    #[error("Unknown process type '{0}'")]
    UnknownProcessType(String),

    #[error("Invalid graph: {0}")]
    Graph(String),

    #[error("Task of '{process}' failed: {reason}")]
    Task { process: String, reason: String },

    #[error("Failed to save {what}: {source}")]
    SaveFailed {
        what: String,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub(crate) fn save_failed(what: impl Into<String>, source: StoreError) -> Self {
        EngineError::SaveFailed {
            what: what.into(),
            source,
        }
    }

    /// Shorthand for task bodies reporting a domain failure.
    pub fn task(process: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Task {
            process: process.into(),
            reason: reason.into(),
        }
    }
}
