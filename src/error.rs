use thiserror::Error;

use crate::adaptors::galaxy::GalaxyError;
use crate::state_machine::{FailureKind, JobStatus};

#[derive(Debug, Error)]
pub enum WavesError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Unknown adaptor: {0}")]
    UnknownAdaptor(String),

    #[error("Job {slug} is {status}, '{action}' is not allowed")]
    InconsistentState {
        slug: String,
        status: JobStatus,
        action: String,
    },

    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    #[error("Adaptor error: {0}")]
    Adaptor(#[from] AdaptorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors raised by adaptor implementations.
#[derive(Debug, Error)]
pub enum AdaptorError {
    /// The back-end could not be reached or the session broke.
    #[error("connection error: {0}")]
    Connect(String),

    /// A remote command or API call ran but failed.
    #[error("execution error: {0}")]
    Exec(String),

    /// The back-end refused or lost track of the job.
    #[error("job error: {0}")]
    Job(String),

    #[error("adaptor is not ready: {0}")]
    NotReady(String),

    /// Job inputs the command line cannot be built from.
    #[error("invalid job input: {0}")]
    Input(String),

    /// Missing or malformed initialization parameter.
    #[error("adaptor init error: {0}")]
    Init(String),

    #[error("unexpected init param: {0}")]
    UnexpectedParam(String),

    #[error("galaxy: {0}")]
    Galaxy(#[from] GalaxyError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl AdaptorError {
    /// Whether the runner should retry the step that raised this error.
    pub fn is_transient(&self) -> bool {
        match self {
            AdaptorError::Connect(_)
            | AdaptorError::Exec(_)
            | AdaptorError::Job(_)
            | AdaptorError::Io(_) => true,
            AdaptorError::Galaxy(e) => e.is_transient(),
            AdaptorError::NotReady(_)
            | AdaptorError::Input(_)
            | AdaptorError::Init(_)
            | AdaptorError::UnexpectedParam(_) => false,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        if self.is_transient() {
            FailureKind::Transient(self.to_string())
        } else {
            FailureKind::Fatal(self.to_string())
        }
    }
}

impl WavesError {
    /// Maps a runner-side error onto the retry policy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            WavesError::Adaptor(e) => e.failure_kind(),
            WavesError::Io(e) => FailureKind::Transient(format!("IO error: {e}")),
            other => FailureKind::Fatal(other.to_string()),
        }
    }
}
