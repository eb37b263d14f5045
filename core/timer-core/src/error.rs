//! Error types for timer-core operations.

use std::path::PathBuf;

/// All errors that can occur in timer-core operations.
///
/// Engine operations surface store failures through this type rather than
/// retrying; the caller decides how to notify the user.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    // ─────────────────────────────────────────────────────────────────────
    // Validation Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Store operation failed: {context}: {details}")]
    Store { context: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TimerError {
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        TimerError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn store(context: &str, details: impl std::fmt::Display) -> Self {
        TimerError::Store {
            context: context.to_string(),
            details: details.to_string(),
        }
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            TimerError::Validation { .. } => "validation_error",
            TimerError::Store { .. } => "store_error",
            TimerError::ConfigMalformed { .. } => "config_error",
            TimerError::Io { .. } => "io_error",
            TimerError::Json { .. } => "serialization_error",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, TimerError::Validation { .. })
    }
}

/// Convenience type alias for Results using TimerError.
pub type Result<T> = std::result::Result<T, TimerError>;

// Conversion for string error compatibility
impl From<TimerError> for String {
    fn from(err: TimerError) -> String {
        err.to_string()
    }
}
