//! Serialized tree and session snapshot formats.
//!
//! A [`SessionSnapshot`] is what a session writes when it hibernates: the
//! serialized node tree (cell values per node), the committed timeline, and
//! accumulated usage. Snapshots are immutable once written and are
//! superseded by later snapshots for the same session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::content::TimelineEntry;
use crate::ids::SessionId;
use crate::tick::Usage;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Kind of a per-node cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum CellKind {
    /// Persistent value with a setter.
    State,
    /// Cached derived value.
    Memo,
    /// Mutable box that never triggers recompute.
    Ref,
    /// Post-commit side effect.
    Effect,
    /// Asynchronously fetched value.
    Data,
    /// Reactive signal.
    Signal,
}

impl core::fmt::Display for CellKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::State => "state",
            Self::Memo => "memo",
            Self::Ref => "ref",
            Self::Effect => "effect",
            Self::Data => "data",
            Self::Signal => "signal",
        };
        f.write_str(name)
    }
}

/// One serialized cell.
///
/// Effects never carry their callback; only whether they had mounted and
/// their last dependency list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SerializedCell {
    /// Cell key within its node.
    pub key: String,
    /// Cell kind.
    pub kind: CellKind,
    /// Stored value (absent for effects).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Last dependency list, if the cell has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps: Option<Vec<serde_json::Value>>,
    /// Effect status marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounted: Option<bool>,
    /// Tick at which a data cell's value was fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at_tick: Option<u64>,
}

/// One serialized node with its cells and children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SerializedNode {
    /// Component type tag.
    pub type_tag: String,
    /// Optional key given by the parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Cells in key order.
    pub cells: Vec<SerializedCell>,
    /// Children in render order.
    pub children: Vec<SerializedNode>,
}

/// Path segment of a child: `#key` when keyed, `@n` for the n-th unkeyed child.
pub fn child_segment(key: Option<&str>, unkeyed_index: usize) -> String {
    key.map_or_else(|| format!("@{unkeyed_index}"), |k| format!("#{k}"))
}

impl SerializedNode {
    /// Look up a cell by key.
    pub fn cell(&self, key: &str) -> Option<&SerializedCell> {
        self.cells.iter().find(|c| c.key == key)
    }

    /// Find the child that occupies the given path segment.
    pub fn child_at(&self, segment: &str) -> Option<&Self> {
        let mut unkeyed = 0_usize;
        for child in &self.children {
            let seg = child_segment(child.key.as_deref(), unkeyed);
            if child.key.is_none() {
                unkeyed = unkeyed.saturating_add(1);
            }
            if seg == segment {
                return Some(child);
            }
        }
        None
    }

    /// Total number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        self.children
            .iter()
            .fold(1_usize, |acc, c| acc.saturating_add(c.node_count()))
    }
}

/// A hibernated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SessionSnapshot {
    /// Format version; see [`SNAPSHOT_VERSION`].
    pub version: u32,
    /// Session the snapshot belongs to.
    pub session_id: SessionId,
    /// Last completed tick.
    pub tick: u64,
    /// Serialized node tree, if the session had mounted.
    pub tree: Option<SerializedNode>,
    /// Committed timeline.
    pub timeline: Vec<TimelineEntry>,
    /// Accumulated usage.
    pub usage: Usage,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn node(type_tag: &str, key: Option<&str>, children: Vec<SerializedNode>) -> SerializedNode {
        SerializedNode {
            type_tag: type_tag.to_owned(),
            key: key.map(ToOwned::to_owned),
            cells: Vec::new(),
            children,
        }
    }

    #[test]
    fn segments_distinguish_keyed_and_positional() {
        assert_eq!(child_segment(Some("a"), 3), "#a");
        assert_eq!(child_segment(None, 3), "@3");
    }

    #[test]
    fn child_lookup_counts_only_unkeyed_siblings() {
        let root = node(
            "Root",
            None,
            vec![
                node("A", None, Vec::new()),
                node("B", Some("k"), Vec::new()),
                node("C", None, Vec::new()),
            ],
        );
        assert_eq!(root.child_at("@0").map(|n| n.type_tag.as_str()), Some("A"));
        assert_eq!(root.child_at("#k").map(|n| n.type_tag.as_str()), Some("B"));
        assert_eq!(root.child_at("@1").map(|n| n.type_tag.as_str()), Some("C"));
        assert!(root.child_at("@2").is_none());
        assert_eq!(root.node_count(), 4);
    }

    #[test]
    fn effect_cells_omit_values_when_serialized() {
        let cell = SerializedCell {
            key: String::from("setup"),
            kind: CellKind::Effect,
            value: None,
            deps: Some(Vec::new()),
            mounted: Some(true),
            fetched_at_tick: None,
        };
        let json = serde_json::to_value(&cell).unwrap();
        assert!(json.get("value").is_none());
        assert_eq!(json.get("mounted"), Some(&serde_json::json!(true)));
    }
}
