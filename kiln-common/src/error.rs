use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum KilnError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    /// Malformed recipe. Fatal for the formula it came from only.
    #[error("Parsing Error in {0}: {1}")]
    ParseError(String, String),

    #[error("Unresolved dependency '{dependency}' (required by '{required_by}')")]
    UnresolvedDependency {
        dependency: String,
        required_by: String,
    },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Integrity Error: {0}")]
    Integrity(String),

    #[error("Installation Error: {0}")]
    InstallFailure(String),

    #[error("Dependency '{0}' failed")]
    DependencyFailed(String),

    #[error("Cancelled before start")]
    Cancelled,

    #[error("DownloadError: Failed to download '{0}' from '{1}': {2}")]
    DownloadError(String, String, String),

    /// Unreadable or unremovable bottle cache entry.
    #[error("Cache Error: {0}")]
    Cache(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Build environment setup failed: {0}")]
    BuildEnvError(String),

    #[error("Failed to execute command: {0}")]
    CommandExecError(String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        KilnError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Json(Arc::new(err))
    }
}

impl<T> From<std::sync::PoisonError<T>> for KilnError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        KilnError::Generic(format!("lock poisoned: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
