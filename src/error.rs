//! Error handling module for the installer
//!
//! Provides the typed error used by the library. Most failures during an
//! install run are reported and absorbed by the orchestrator; the variants
//! below are the ones that actually cross a function boundary.

use thiserror::Error;

/// Main error type for the installer
#[derive(Error, Debug)]
pub enum InstallerError {
    /// IO errors (file operations, terminal, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The numerical runtime (or the interpreter hosting it) is unusable
    #[error("Runtime missing: {0}")]
    RuntimeMissing(String),

    /// An external command could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An interrupt signal arrived while a command was running
    #[error("Interrupted by signal")]
    Interrupted,

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallerError>;

impl InstallerError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a missing-runtime error
    pub fn runtime_missing(msg: impl Into<String>) -> Self {
        Self::RuntimeMissing(msg.into())
    }

    /// Create a spawn error for `program`
    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }

    /// Returns true if this error was caused by an interrupt signal
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
