//! Node arena entries and path construction.
//!
//! Nodes live in a flat map keyed by path. The root is `root`; a child's
//! path is its parent's path plus `/#key` (keyed) or `/@n` (the n-th
//! unkeyed child), so a node keeps its identity as long as its parent,
//! its position among unkeyed siblings (or its key), and its type stay the
//! same.

use std::collections::{BTreeMap, HashSet};

use sapling_types::child_segment;
use tracing::trace;

use crate::cell::CellSlot;
use crate::element::Element;

/// Path of the root node.
pub const ROOT_PATH: &str = "root";

/// Path of the child of `parent` occupying `segment`.
pub fn child_path(parent: &str, segment: &str) -> String {
    format!("{parent}/{segment}")
}

/// Segments for a list of sibling elements, in order.
///
/// Returns the first repeated key as the error.
pub(crate) fn child_segments(children: &[Element]) -> Result<Vec<String>, String> {
    let mut keys = HashSet::new();
    let mut unkeyed = 0_usize;
    let mut segments = Vec::with_capacity(children.len());
    for child in children {
        match child.key() {
            Some(key) => {
                if !keys.insert(key) {
                    return Err(key.to_owned());
                }
                segments.push(child_segment(Some(key), unkeyed));
            }
            None => {
                segments.push(child_segment(None, unkeyed));
                unkeyed = unkeyed.saturating_add(1);
            }
        }
    }
    Ok(segments)
}

/// One live node.
pub(crate) struct NodeState {
    pub(crate) type_tag: &'static str,
    pub(crate) key: Option<String>,
    pub(crate) parent: Option<String>,
    pub(crate) cells: BTreeMap<String, CellSlot>,
    pub(crate) children: Vec<String>,
}

impl NodeState {
    pub(crate) fn new(element: &Element, parent: Option<&str>) -> Self {
        Self {
            type_tag: element.type_tag(),
            key: element.key().map(ToOwned::to_owned),
            parent: parent.map(ToOwned::to_owned),
            cells: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Drop cells the last render did not declare, cleaning up effects.
    pub(crate) fn prune_cells(&mut self, path: &str, declared: &HashSet<String>) {
        let stale: Vec<String> = self
            .cells
            .keys()
            .filter(|k| !declared.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(slot) = self.cells.remove(&key) {
                trace!(path, cell = %key, kind = %slot.kind(), "cell dropped");
                run_cleanup(path, &key, slot);
            }
        }
    }

    /// Run every pending effect cleanup. Called once, on unmount.
    pub(crate) fn teardown(self, path: &str) {
        for (key, slot) in self.cells {
            run_cleanup(path, &key, slot);
        }
    }
}

fn run_cleanup(path: &str, key: &str, slot: CellSlot) {
    if let CellSlot::Effect(effect) = slot {
        if let Some(cleanup) = effect.cleanup {
            trace!(path, effect = key, "effect cleanup");
            cleanup();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::RenderContext;
    use crate::element::{Component, RenderError};

    struct Leaf;

    impl Component for Leaf {
        fn render(&self, _cx: &mut RenderContext<'_>) -> Result<Vec<Element>, RenderError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn segments_mix_keyed_and_positional() {
        let children = vec![
            Element::new(Leaf),
            Element::new(Leaf).keyed("a"),
            Element::new(Leaf),
        ];
        assert_eq!(
            child_segments(&children).unwrap(),
            vec!["@0", "#a", "@1"]
        );
        assert_eq!(child_path(ROOT_PATH, "#a"), "root/#a");
    }

    #[test]
    fn duplicate_keys_are_reported() {
        let children = vec![Element::new(Leaf).keyed("x"), Element::new(Leaf).keyed("x")];
        assert_eq!(child_segments(&children), Err(String::from("x")));
    }
}
