//! Session execution for the Sapling agent runtime.
//!
//! A [`Session`] owns one component tree and drives it tick by tick: each
//! tick settles the tree, calls the model through a [`ModelAdapter`],
//! runs the capabilities the model asks for, and commits everything to the
//! session's timeline. Callers follow an execution through its
//! [`ExecutionHandle`]. Sessions hibernate into snapshots kept by a
//! [`SessionStore`] and resume from them, and they drain an attached
//! [`Inbox`](sapling_inbox::Inbox) of externally written messages and
//! dispatches.
//!
//! # Modules
//!
//! - [`drain`] -- Inbox attachment and the serialized per-session drain.
//! - [`error`] -- Session, model, and store error types.
//! - [`handle`] -- [`ExecutionHandle`]: status, event stream, result, abort.
//! - [`model`] -- The [`ModelAdapter`] seam and [`ScriptedModel`].
//! - [`session`] -- [`Session`]: ticks, queueing, mount, dispatch,
//!   hibernate and resume.
//! - [`store`] -- [`SessionStore`] with in-memory (LRU) and file backends.
//!
//! [`ModelAdapter`]: model::ModelAdapter
//! [`ScriptedModel`]: model::ScriptedModel
//! [`SessionStore`]: store::SessionStore

pub mod drain;
pub mod error;
pub mod handle;
pub mod model;
pub mod session;
pub mod store;

pub use drain::{DrainHalt, DrainReport};
pub use error::{ModelError, SessionError, StoreError};
pub use handle::{ExecutionHandle, ExecutionOutput};
pub use model::{ModelAdapter, ModelRequest, ModelResponse, ScriptedModel};
pub use session::{Session, SessionOptions, TickInput, normalize_result};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
