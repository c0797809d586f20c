use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Unknown command key or malformed/unmatched arguments. Nothing executes.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Process spawn failure or non-zero exit.
    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Timed out: {0}")]
    TimeoutError(String),

    /// Push, delivery, or result report could not reach the controller.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Download or install failure. The update is aborted and the running
    /// installation is untouched.
    #[error("Update error: {0}")]
    UpdateError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::TransportError(err.to_string())
    }
}
