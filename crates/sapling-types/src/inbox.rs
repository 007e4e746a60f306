//! Inbox message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::{MessageId, SessionId};

/// How a drained inbox entry is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum InboxMessageKind {
    /// Fed into the conversation as input.
    Message,
    /// Invokes a named capability directly, bypassing the model.
    Dispatch,
}

/// A message as submitted by a writer, before the inbox assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct NewInboxMessage {
    /// Free-form origin label (e.g. `"webhook"`, `"scheduler"`).
    pub source: String,
    /// Interpretation of the payload.
    pub kind: InboxMessageKind,
    /// For [`InboxMessageKind::Message`], `{"text": ..}` or content blocks;
    /// for [`InboxMessageKind::Dispatch`], `{"name": .., "input": ..}`.
    pub payload: serde_json::Value,
}

impl NewInboxMessage {
    /// Build a conversation message carrying plain text.
    pub fn text(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind: InboxMessageKind::Message,
            payload: serde_json::json!({ "text": text.into() }),
        }
    }

    /// Build a dispatch of the named capability.
    pub fn dispatch(
        source: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            source: source.into(),
            kind: InboxMessageKind::Dispatch,
            payload: serde_json::json!({ "name": name.into(), "input": input }),
        }
    }
}

/// A stored inbox entry. Destroyed when marked done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct InboxMessage {
    /// Unique identifier.
    pub id: MessageId,
    /// Owning session.
    pub session_id: SessionId,
    /// Origin label.
    pub source: String,
    /// Interpretation of the payload.
    pub kind: InboxMessageKind,
    /// Message payload.
    pub payload: serde_json::Value,
    /// When the message was written.
    pub timestamp: DateTime<Utc>,
}

impl InboxMessage {
    /// Capability name of a dispatch entry.
    pub fn dispatch_name(&self) -> Option<&str> {
        self.payload.get("name").and_then(serde_json::Value::as_str)
    }

    /// Capability input of a dispatch entry (`null` when absent).
    pub fn dispatch_input(&self) -> serde_json::Value {
        self.payload
            .get("input")
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    /// Text of a message entry, if the payload carries one.
    pub fn text(&self) -> Option<&str> {
        self.payload
            .get("text")
            .and_then(serde_json::Value::as_str)
            .or_else(|| self.payload.as_str())
    }
}
