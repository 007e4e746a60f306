//! Shared type definitions for the Sapling agent runtime.
//!
//! This crate is the single source of truth for the plain-data types that
//! cross crate and process boundaries: what a session emits, what it
//! persists, and what writers put in its inbox. Types flow downstream to
//! `TypeScript` via `ts-rs` for external consumers of the event stream.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for sessions, messages, executions
//! - [`content`] -- Content blocks, timeline entries, sections, capability specs
//! - [`tick`] -- Tick state, compiled output, tick results, usage
//! - [`events`] -- Execution status and the ordered stream event sequence
//! - [`snapshot`] -- Serialized tree and session snapshot formats
//! - [`inbox`] -- Inbox message types

pub mod content;
pub mod events;
pub mod ids;
pub mod inbox;
pub mod snapshot;
pub mod tick;

// Re-export all public types at crate root for convenience.
pub use content::{Audience, CapabilitySpec, ContentBlock, Role, Section, TimelineEntry};
pub use events::{ExecutionStatus, StreamEvent};
pub use ids::{EntryId, ExecutionId, MessageId, SessionId};
pub use inbox::{InboxMessage, InboxMessageKind, NewInboxMessage};
pub use snapshot::{
    CellKind, SNAPSHOT_VERSION, SerializedCell, SerializedNode, SessionSnapshot, child_segment,
};
pub use tick::{CompiledOutput, QueuedMessage, StopReason, TickResult, TickState, Usage};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation for the externally consumed types.

    #[test]
    fn export_bindings() {
        use ts_rs::TS;

        let _ = crate::ids::SessionId::export_all();
        let _ = crate::ids::MessageId::export_all();
        let _ = crate::ids::ExecutionId::export_all();
        let _ = crate::ids::EntryId::export_all();

        let _ = crate::content::ContentBlock::export_all();
        let _ = crate::content::Role::export_all();
        let _ = crate::content::TimelineEntry::export_all();
        let _ = crate::content::Section::export_all();
        let _ = crate::content::Audience::export_all();
        let _ = crate::content::CapabilitySpec::export_all();

        let _ = crate::tick::QueuedMessage::export_all();
        let _ = crate::tick::TickState::export_all();
        let _ = crate::tick::Usage::export_all();
        let _ = crate::tick::StopReason::export_all();
        let _ = crate::tick::TickResult::export_all();
        let _ = crate::tick::CompiledOutput::export_all();

        let _ = crate::events::ExecutionStatus::export_all();
        let _ = crate::events::StreamEvent::export_all();

        let _ = crate::snapshot::CellKind::export_all();
        let _ = crate::snapshot::SerializedCell::export_all();
        let _ = crate::snapshot::SerializedNode::export_all();
        let _ = crate::snapshot::SessionSnapshot::export_all();

        let _ = crate::inbox::InboxMessageKind::export_all();
        let _ = crate::inbox::NewInboxMessage::export_all();
        let _ = crate::inbox::InboxMessage::export_all();
    }
}
