//! Error types for Crucible.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors. These are unrecoverable: the owning entity is
    // finalized as aborted rather than retried.
    #[error("Missing plan for job: {0}")]
    MissingPlan(String),

    #[error("Invalid build step configuration: {0}")]
    InvalidStepConfig(String),

    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    // Entity lookup errors
    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    // Expansion errors
    #[error("Invalid expansion manifest: {0}")]
    InvalidManifest(String),

    // Backend errors
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Signal bus error: {0}")]
    SignalBus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that no amount of retrying can fix. The task runner
    /// finalizes the owning entity as aborted instead of rescheduling.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Error::MissingPlan(_) | Error::InvalidStepConfig(_) | Error::UnsupportedBackend(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
