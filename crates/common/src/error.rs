//! Error types for Ocular

use crate::types::TestResults;
use thiserror::Error;

/// Result type alias using the Ocular Error
pub type Result<T> = std::result::Result<T, Error>;

/// Ocular error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Error in request {name}: {reason}")]
    Request { name: String, reason: String },

    #[error("Incorrect API Key")]
    IncorrectApiKey,

    #[error("The server task has gone")]
    ServerGone,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("A test is already running")]
    TestAlreadyRunning,

    #[error("No test is currently open")]
    NotOpen,

    #[error("Test '{}' of '{}' is new! Please approve the new baseline at {}",
        .results.name, .results.app_name, .results.review_url())]
    NewTest { results: TestResults },

    #[error("Test '{}' of '{}' detected differences! See details at: {}",
        .results.name, .results.app_name, .results.review_url())]
    DiffsFound { results: TestResults },

    #[error("Test '{}' of '{}' failed! See details at {}",
        .results.name, .results.app_name, .results.review_url())]
    TestFailed { results: TestResults },

    #[error("Mismatch found in '{test_name}' of '{app_name}'")]
    MismatchImmediate { app_name: String, test_name: String },

    #[error("Render error: {0}")]
    Render(String),

    #[error("Render status error: {0}")]
    RenderStatus(String),

    #[error("Fatal test error: {0}")]
    Fatal(String),

    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Test aborted")]
    Aborted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Typed test-outcome error for a classified result, or `None` when the
    /// results do not represent a failure.
    pub fn from_test_results(results: &TestResults) -> Option<Error> {
        use crate::types::TestStatus;
        match results.status {
            Some(TestStatus::Unresolved) if results.is_new => Some(Error::NewTest {
                results: results.clone(),
            }),
            Some(TestStatus::Unresolved) => Some(Error::DiffsFound {
                results: results.clone(),
            }),
            Some(TestStatus::Failed) => Some(Error::TestFailed {
                results: results.clone(),
            }),
            _ => None,
        }
    }

    /// The TestResults payload carried by test-outcome errors.
    pub fn test_results(&self) -> Option<&TestResults> {
        match self {
            Error::NewTest { results }
            | Error::DiffsFound { results }
            | Error::TestFailed { results } => Some(results),
            _ => None,
        }
    }
}
