//! Error types for the migration system.

use std::path::PathBuf;

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// No driver is registered for the URL scheme.
    #[error("Unknown driver for scheme '{0}'")]
    UnknownDriver(String),

    /// The connection URL could not be understood.
    #[error("Invalid connection URL '{url}': {message}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        message: String,
    },

    /// The backend is unreachable or misconfigured.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The migration file set is malformed or incomplete.
    #[error("Invalid migration file '{file}': {message}")]
    Discovery {
        /// File name (or version) the problem was found at.
        file: String,
        /// Error message.
        message: String,
    },

    /// A script could not be loaded from its file store.
    #[error("Failed to read migration file '{path}': {source}")]
    ContentRead {
        /// Path of the script.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The version ledger could not be read.
    #[error("Failed to query version: {0}")]
    VersionQuery(String),

    /// The stored version matches no discovered migration.
    #[error("Version {0} does not match any migration file")]
    UnknownVersion(u64),

    /// A script failed to apply.
    #[error("Migration '{file}' failed: {message}")]
    Step {
        /// File name of the failed script.
        file: String,
        /// Error message.
        message: String,
    },

    /// Releasing backend resources failed.
    #[error("Failed to close driver: {0}")]
    Close(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading/writing migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    pub(crate) fn discovery(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Discovery {
            file: file.into(),
            message: message.into(),
        }
    }

    pub(crate) fn step(file: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Step {
            file: file.into(),
            message: message.to_string(),
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
