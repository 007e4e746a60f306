//! Per-tick data: the tick state handed to the tree, the compiled output it
//! produces, and the result recorded when the tick ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::content::{CapabilitySpec, ContentBlock, Section, TimelineEntry};
use crate::ids::MessageId;

/// A message waiting to be fed into the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct QueuedMessage {
    /// Identifier assigned when the message was queued.
    pub id: MessageId,
    /// Where the message came from (e.g. `"user"`, `"inbox"`).
    pub source: String,
    /// Message body.
    pub content: Vec<ContentBlock>,
    /// When the message was queued.
    pub queued_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Create a text message from the given source.
    pub fn text(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            source: source.into(),
            content: vec![ContentBlock::text(text)],
            queued_at: Utc::now(),
        }
    }
}

/// State visible to the tree during one tick. Replaced every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TickState {
    /// Tick number (1-based within a session; 0 for mount-only passes).
    pub tick: u64,
    /// Entries committed so far, oldest first.
    pub timeline: Vec<TimelineEntry>,
    /// Messages queued for this tick, in arrival order.
    pub queued_messages: Vec<QueuedMessage>,
    /// Whether the enclosing execution has been aborted.
    pub aborted: bool,
}

impl TickState {
    /// Create the state for the given tick.
    pub const fn new(tick: u64, timeline: Vec<TimelineEntry>) -> Self {
        Self {
            tick,
            timeline,
            queued_messages: Vec::new(),
            aborted: false,
        }
    }
}

/// Token accounting reported by the model adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

impl Usage {
    /// Sum two usage records, saturating on overflow.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
        }
    }

    /// Total tokens in both directions.
    pub const fn total(self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum StopReason {
    /// The model finished its turn.
    EndTurn,
    /// The model requested one or more capability invocations.
    ToolUse,
    /// The output token limit was reached.
    MaxTokens,
}

/// Outcome of one tick, handed to tick-end callbacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TickResult {
    /// Tick number.
    pub tick: u64,
    /// Model stop reason, if the model was called.
    pub stop_reason: Option<StopReason>,
    /// Entries committed during this tick.
    pub new_entries: Vec<TimelineEntry>,
    /// Usage reported during this tick.
    pub usage: Usage,
    /// Whether another tick is needed (tool results pending a model turn).
    pub should_continue: bool,
}

/// The externally visible projection of the tree for one compile pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CompiledOutput {
    /// Instruction sections, in tree order.
    pub sections: Vec<Section>,
    /// Capabilities declared by mounted nodes, in tree order.
    pub tools: Vec<CapabilitySpec>,
    /// Conversation entries contributed by the tree (in addition to the timeline).
    pub entries: Vec<TimelineEntry>,
}

impl CompiledOutput {
    /// Join all sections into a single instruction string.
    pub fn system_prompt(&self) -> String {
        self.sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Capabilities the model is allowed to see.
    pub fn model_tools(&self) -> Vec<CapabilitySpec> {
        self.tools
            .iter()
            .filter(|t| t.audience.visible_to_model())
            .cloned()
            .collect()
    }
}
