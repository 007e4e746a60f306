//! Per-session message inbox for the Sapling agent runtime.
//!
//! External writers (webhooks, schedulers, other agents) append
//! [`NewInboxMessage`](sapling_types::NewInboxMessage)s to a session's
//! inbox. Subscribers are notified synchronously on every write; the
//! session's drain loop is the usual subscriber.
//!
//! # Modules
//!
//! - [`inbox`] -- The [`Inbox`](inbox::Inbox) store and its subscriptions
//! - [`error`] -- Inbox error types

pub mod error;
pub mod inbox;

pub use error::InboxError;
pub use inbox::{Inbox, InboxSubscriber, InboxSubscription};
