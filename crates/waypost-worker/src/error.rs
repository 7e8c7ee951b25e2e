//! Error types for the worker binary.
//!
//! [`WorkerError`] wraps every failure that can stop the worker during
//! startup or shutdown.

/// Top-level error for the worker binary.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: waypost_core::config::ConfigError,
    },

    /// Storage or queue connection failed.
    #[error("storage error: {source}")]
    Storage {
        /// The underlying data layer error.
        #[from]
        source: waypost_db::DbError,
    },

    /// Logging could not be initialized.
    #[error("logging error: {message}")]
    Logging {
        /// Description of the failure.
        message: String,
    },
}
