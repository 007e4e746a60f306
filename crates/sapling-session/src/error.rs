//! Error types for session execution.
//!
//! [`SessionError`] is what an [`ExecutionHandle`](crate::handle::ExecutionHandle)
//! resolves to on failure. It is `Clone` so every holder of a handle sees
//! the same outcome.

use sapling_core::{Aborted, CompileError, LifecycleError, LifecyclePhase};

/// Errors surfaced by a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No capability answers to the dispatched name.
    #[error("Unknown command: {name}")]
    UnknownCommand {
        /// Name that was dispatched.
        name: String,
    },

    /// A capability handler returned something other than a string or a
    /// list of content blocks.
    #[error("Unexpected tool result type")]
    InvalidToolResult,

    /// The execution was cancelled.
    #[error("aborted: {reason}")]
    Aborted {
        /// Reason given to the abort signal.
        reason: String,
    },

    /// A data cell fetch rejected during a compile pass.
    #[error("data fetch \"{key}\" failed: {message}")]
    Fetch {
        /// Cache key of the fetch.
        key: String,
        /// Rejection message.
        message: String,
    },

    /// A lifecycle callback failed.
    #[error("{phase} callback {owner} failed: {message}")]
    LifecycleCallback {
        /// Registry the callback belongs to.
        phase: LifecyclePhase,
        /// `<node path>:<key>` of the registration.
        owner: String,
        /// Message from the callback.
        message: String,
    },

    /// Any other compile failure.
    #[error("compile failed: {0}")]
    Compile(CompileError),

    /// The model adapter failed.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// A capability handler failed.
    #[error("capability {name} failed: {message}")]
    Tool {
        /// Capability name.
        name: String,
        /// Handler message.
        message: String,
    },

    /// The session store failed.
    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    /// A snapshot could not be used.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// An inbox entry could not be interpreted.
    #[error("invalid inbox entry: {0}")]
    InvalidInboxEntry(String),

    /// The call needs a tokio runtime and none is running.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

impl SessionError {
    /// Whether this is a cooperative cancellation.
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl From<Aborted> for SessionError {
    fn from(aborted: Aborted) -> Self {
        Self::Aborted {
            reason: aborted.reason,
        }
    }
}

impl From<LifecycleError> for SessionError {
    fn from(err: LifecycleError) -> Self {
        Self::LifecycleCallback {
            phase: err.phase,
            owner: err.owner,
            message: err.message,
        }
    }
}

impl From<CompileError> for SessionError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Fetch { key, message } => Self::Fetch { key, message },
            CompileError::Callback(e) => e.into(),
            CompileError::Aborted(e) => e.into(),
            other => Self::Compile(other),
        }
    }
}

/// Errors from a [`ModelAdapter`](crate::model::ModelAdapter).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// The backend call failed.
    #[error("model backend error: {0}")]
    Backend(String),

    /// A scripted model ran out of responses.
    #[error("scripted model has no response left for call {call}")]
    Exhausted {
        /// 1-based number of the unanswered call.
        call: usize,
    },
}

/// Errors from a [`SessionStore`](crate::store::SessionStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing storage failed.
    #[error("I/O error on {path}: {message}")]
    Io {
        /// File or directory involved.
        path: String,
        /// Underlying error text.
        message: String,
    },

    /// A stored snapshot could not be encoded or decoded.
    #[error("snapshot encoding error: {0}")]
    Serde(String),
}
