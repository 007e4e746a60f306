//! Conversation content: blocks, roles, timeline entries, prompt sections,
//! and capability descriptors.
//!
//! These are the plain-data building blocks of a [`CompiledOutput`] and of
//! the session timeline. Nothing here carries behavior; the capability
//! handlers themselves live in `sapling-core`.
//!
//! [`CompiledOutput`]: crate::tick::CompiledOutput

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::EntryId;

/// One unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text body.
        text: String,
    },
    /// Arbitrary structured data.
    Json {
        /// The JSON payload.
        value: serde_json::Value,
    },
    /// A model request to invoke a capability.
    ToolUse {
        /// Model-assigned identifier used to correlate the result.
        id: String,
        /// Capability name (or alias) the model asked for.
        name: String,
        /// Input arguments.
        input: serde_json::Value,
    },
    /// The result of a capability invocation.
    ToolResult {
        /// The `id` of the [`ContentBlock::ToolUse`] this answers.
        tool_use_id: String,
        /// Normalized handler output.
        content: Vec<ContentBlock>,
        /// Whether the invocation failed.
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Build a [`ContentBlock::Text`] block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Return the text body if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Author of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Role {
    /// Instructions injected by the agent program.
    System,
    /// External input (conversation messages, inbox messages).
    User,
    /// Model output.
    Assistant,
    /// Capability results.
    Tool,
}

/// A committed conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TimelineEntry {
    /// Unique entry identifier.
    pub id: EntryId,
    /// Tick in which the entry was committed.
    pub tick: u64,
    /// Who produced the entry.
    pub role: Role,
    /// Entry content.
    pub content: Vec<ContentBlock>,
    /// Wall-clock commit time.
    pub timestamp: DateTime<Utc>,
}

impl TimelineEntry {
    /// Create an entry with the given role and content.
    pub fn new(tick: u64, role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: EntryId::new(),
            tick,
            role,
            content,
            timestamp: Utc::now(),
        }
    }

    /// Create a single-text-block user entry.
    pub fn user_text(tick: u64, text: impl Into<String>) -> Self {
        Self::new(tick, Role::User, vec![ContentBlock::text(text)])
    }

    /// Concatenate all text blocks of this entry.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Iterate over the tool-use blocks of this entry.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }
}

/// A named block of instructions contributed by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Section {
    /// Section identifier; later contributions with the same id replace earlier ones.
    pub id: String,
    /// Instruction text.
    pub content: String,
}

/// Who may see and invoke a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Audience {
    /// Exposed to the model and dispatchable by users.
    #[default]
    All,
    /// Exposed to the model only.
    Model,
    /// Dispatchable by users only; hidden from the model.
    User,
}

impl Audience {
    /// Whether the model should be offered this capability.
    pub const fn visible_to_model(self) -> bool {
        matches!(self, Self::All | Self::Model)
    }
}

/// Serializable description of a declared capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CapabilitySpec {
    /// Canonical, case-sensitive name.
    pub name: String,
    /// Alternative names that resolve to the same handler.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Visibility.
    #[serde(default)]
    pub audience: Audience,
    /// Human-readable description offered to the model.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the input.
    #[serde(default)]
    pub input_schema: serde_json::Value,
}
