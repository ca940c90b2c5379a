//! Error types shared by the regvault data model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding or validating upstream records.
#[derive(Error, Debug)]
pub enum Error {
    /// A content tag string did not match any known tag shape.
    #[error("invalid content tag '{tag}': {reason}")]
    InvalidTag {
        /// The tag as received.
        tag: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// An upstream record is missing a required field or has the wrong shape.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
