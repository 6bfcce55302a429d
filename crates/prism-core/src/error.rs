//! Error types for prism.

use thiserror::Error;

/// The main error type for engine-agnostic prism operations.
#[derive(Error, Debug)]
pub enum PrismError {
    /// An option value is outside its accepted range.
    #[error("invalid option '{name}': {reason}")]
    InvalidOption { name: &'static str, reason: String },

    /// Mesh data is inconsistent (e.g. an index points past the vertex list).
    #[error("invalid mesh '{0}': {1}")]
    InvalidMesh(String, String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A specialized Result type for prism core operations.
pub type Result<T> = std::result::Result<T, PrismError>;
