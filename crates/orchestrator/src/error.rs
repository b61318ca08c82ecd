use thiserror::Error;
use transport::ClientError;

/// Failure of one step or one target, caught at the step boundary and
/// recorded as a string in the owner's exception list.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Operation failed: {detail}")]
    MonitorFailed { detail: String },

    #[error("Operation timed out: {detail}")]
    MonitorTimedOut { detail: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Response has no value at {pointer}")]
    MissingField { pointer: String },

    #[error("Template variable not found: {0}")]
    MissingVariable(String),

    #[error("{0}")]
    Failed(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether this was a monitor timeout as opposed to a reported failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::MonitorTimedOut { .. })
    }
}

/// Programming or configuration errors raised while a pipeline is being
/// assembled, before any step's own error boundary exists.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Duplicate target identifier: {0}")]
    DuplicateTarget(String),

    #[error("Missing required configuration key: {0}")]
    MissingConfig(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
