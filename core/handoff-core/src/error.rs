//! Error types for handoff-core operations.
//!
//! Monitoring loops never surface these: each failure is converted at its
//! origin into an absent signal, a skipped record, or a log line. They exist
//! for the persistence/config APIs that callers may want to inspect.

use std::path::PathBuf;

/// All errors that can occur in handoff-core operations.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

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

    // ─────────────────────────────────────────────────────────────────────
    // External Command Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Command execution failed: {command}: {details}")]
    CommandFailed { command: String, details: String },

    #[error("Command timed out after {timeout_secs}s: {command}")]
    CommandTimedOut { command: String, timeout_secs: u64 },

    // ─────────────────────────────────────────────────────────────────────
    // Probe Errors
    // ─────────────────────────────────────────────────────────────────────
    /// A probe produced data it could not vouch for.
    #[error("Probe {probe} produced an invalid reading: {details}")]
    ProbeInvalid { probe: String, details: String },
}

impl HandoffError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HandoffError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        HandoffError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using HandoffError.
pub type Result<T> = std::result::Result<T, HandoffError>;

impl From<HandoffError> for String {
    fn from(err: HandoffError) -> String {
        err.to_string()
    }
}
