//! Error types for the engine binary.
//!
//! [`EngineError`] wraps every failure `main` can propagate with `?`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: sapling_core::config::ConfigError,
    },

    /// A session operation failed.
    #[error("session error: {source}")]
    Session {
        /// The underlying session error.
        #[from]
        source: sapling_session::SessionError,
    },

    /// The hibernated demo session could not be found again.
    #[error("resume error: {message}")]
    Resume {
        /// Description of the failure.
        message: String,
    },

    /// The inbox was not drained in time.
    #[error("inbox error: {message}")]
    Inbox {
        /// Description of the failure.
        message: String,
    },
}
