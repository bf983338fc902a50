//! Error types shared by the front end, the workers and the operator tooling
//!
//! Each variant corresponds to one failure class of the grading pipeline. The
//! HTTP layer maps them onto status codes, the worker records them into the
//! settings blob or the published test result, and the binaries surface them
//! as fatal startup errors.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AutotestError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Authorization failed: {0}")]
    AuthError(String),
    #[error("{0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("create tester environment failed:\n{0}")]
    TesterCreationError(String),
    #[error("{0}")]
    TestExecutionError(String),
    #[error("Key-value store unavailable: {0}")]
    KvUnavailable(String),
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Download failed: {0}")]
    FetchError(String),
    #[error("Archive error: {0}")]
    ArchiveError(String),
    #[error("Command failed: {0}")]
    CommandFailed(String),
    #[error("Installer error: {0}")]
    InstallerError(String),
    #[error("Resource error: {0}")]
    ResourceError(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for AutotestError {
    fn from(err: std::io::Error) -> Self {
        AutotestError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for AutotestError {
    fn from(err: reqwest::Error) -> Self {
        AutotestError::FetchError(err.to_string())
    }
}

impl From<redis::RedisError> for AutotestError {
    fn from(err: redis::RedisError) -> Self {
        AutotestError::KvUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AutotestError {
    fn from(err: serde_json::Error) -> Self {
        AutotestError::ParsingError(err.to_string())
    }
}

impl From<zip::result::ZipError> for AutotestError {
    fn from(err: zip::result::ZipError) -> Self {
        AutotestError::ArchiveError(err.to_string())
    }
}

impl From<sqlx::Error> for AutotestError {
    fn from(err: sqlx::Error) -> Self {
        AutotestError::ResourceError(err.to_string())
    }
}
