//! # Error Handling Module
//!
//! ## Purpose
//! Centralized error handling for the mirror, providing structured error
//! types and conversion utilities for all system components.
//!
//! ## Input/Output Specification
//! - **Input**: Error conditions from storage, parsing, network, and config
//! - **Output**: Structured error types with context and error chains
//! - **Error Categories**: Upstream, Storage, Parsing, Configuration
//!
//! ## Key Features
//! - Single error enum shared across the crate
//! - Automatic conversion from library error types
//! - Structured logging integration via error categories

use thiserror::Error;

/// Result type used throughout the application
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Error types for the mirror service
///
/// Upstream fetch outcomes (transient / not-found / auth) are classified
/// separately by [`crate::upstream::FetchError`] because the worker reacts
/// to each class differently; everything else funnels through this enum.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedded database errors
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// Binary row encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Raw document parsing errors
    #[error("Failed to parse document for aid {aid}: {details}")]
    DocumentParse { aid: crate::AnimeId, details: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation failed for field '{field}': {reason}")]
    ValidationFailed { field: String, reason: String },

    /// Raw store and index disagree; resolved by reconciliation
    #[error("Storage inconsistency: {details}")]
    StorageInconsistency { details: String },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MirrorError {
    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            MirrorError::Io(_) | MirrorError::Database(_) | MirrorError::Serialization(_) => {
                "storage"
            }
            MirrorError::StorageInconsistency { .. } => "storage",
            MirrorError::Http(_) => "upstream",
            MirrorError::DocumentParse { .. } => "parsing",
            MirrorError::Config { .. } | MirrorError::ValidationFailed { .. } => "configuration",
            MirrorError::Internal { .. } => "generic",
        }
    }
}

impl From<toml::de::Error> for MirrorError {
    fn from(err: toml::de::Error) -> Self {
        MirrorError::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}
