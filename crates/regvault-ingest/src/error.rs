//! Error types for the harvesting pipeline.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while harvesting.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP client error outside of a gateway request.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite checkpoint store error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding an upstream record failed.
    #[error("Record error: {0}")]
    Record(#[from] regvault_core::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Object storage backend error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Search backend error.
    #[error("Search backend error: {0}")]
    Search(String),

    /// Upstream request failed in a way the caller cannot recover from.
    #[error("Upstream error: {0}")]
    Upstream(#[from] crate::gateway::FetchError),

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// A background task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Task(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A supervised component failed more often than its restart budget allows.
    #[error("{component} exceeded its restart budget ({restarts} restarts within {window:?})")]
    RestartBudgetExhausted {
        /// Name of the component that gave up.
        component: String,
        /// Restarts observed inside the window.
        restarts: usize,
        /// Length of the sliding window.
        window: Duration,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}
