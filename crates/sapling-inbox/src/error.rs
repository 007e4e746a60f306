//! Error types for the inbox.

/// Errors raised around the inbox.
///
/// Writes themselves never fail; these are returned by subscribers and
/// are isolated by [`Inbox::write`](crate::inbox::Inbox::write).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboxError {
    /// A subscriber could not handle a notification.
    #[error("inbox subscriber failed: {0}")]
    Subscriber(String),

    /// A subscriber panicked while handling a notification.
    #[error("inbox subscriber panicked: {0}")]
    SubscriberPanicked(String),
}
