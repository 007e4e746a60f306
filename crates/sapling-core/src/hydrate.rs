//! Tree serialization and hydration.
//!
//! [`Reconciler::serialize`] walks the live tree depth-first and records,
//! per node, its type tag, key, cells and children. Effects are recorded
//! only as a mounted marker plus their last dependency list.
//!
//! [`Reconciler::hydrate`] installs a serialized tree as the hydration
//! context for the following passes. A node is seeded only while its live
//! type matches the stored one at the same path; on a mismatch that node and
//! all its descendants start fresh. Seeds apply when a cell is created, so
//! hydration never overwrites live values. Mount-only effects (empty
//! dependency list) that had mounted are not run again; effects with
//! dependencies always run on the hydrating pass.

use sapling_types::{SerializedCell, SerializedNode};
use tracing::{debug, info};

use crate::cell::CellSlot;
use crate::data::DataCache;
use crate::reconciler::Reconciler;
use crate::tree::ROOT_PATH;

impl Reconciler {
    /// Serialize the live tree. `None` before the first pass.
    pub fn serialize(&self) -> Option<SerializedNode> {
        let tree = self.serialize_node(ROOT_PATH);
        if let Some(root) = tree.as_ref() {
            debug!(nodes = root.node_count(), "tree serialized");
        }
        tree
    }

    fn serialize_node(&self, path: &str) -> Option<SerializedNode> {
        let node = self.nodes.get(path)?;
        Some(SerializedNode {
            type_tag: node.type_tag.to_owned(),
            key: node.key.clone(),
            cells: node
                .cells
                .iter()
                .map(|(key, slot)| serialize_cell(key, slot, &self.data))
                .collect(),
            children: node
                .children
                .iter()
                .filter_map(|child| self.serialize_node(child))
                .collect(),
        })
    }

    /// Restore cells from `tree` on the following passes.
    pub fn hydrate(&mut self, tree: SerializedNode) {
        info!(
            nodes = tree.node_count(),
            root = %tree.type_tag,
            "hydration context installed"
        );
        self.hydration = Some(tree);
    }

    /// Leave hydration mode; later passes compile normally.
    pub fn complete_hydration(&mut self) {
        if self.hydration.take().is_some() {
            debug!("hydration complete");
        }
    }

    /// Whether a hydration context is installed.
    pub const fn is_hydrating(&self) -> bool {
        self.hydration.is_some()
    }
}

fn serialize_cell(key: &str, slot: &CellSlot, data: &DataCache) -> SerializedCell {
    let mut cell = SerializedCell {
        key: key.to_owned(),
        kind: slot.kind(),
        value: None,
        deps: None,
        mounted: None,
        fetched_at_tick: None,
    };
    match slot {
        CellSlot::State(value) => {
            cell.value = Some(
                value
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone(),
            );
        }
        CellSlot::Memo { value, deps } => {
            cell.value = Some(value.clone());
            cell.deps = Some(deps.clone());
        }
        CellSlot::Ref(typed) | CellSlot::Signal(typed) => {
            cell.value = (typed.snapshot)();
        }
        CellSlot::Effect(effect) => {
            cell.mounted = Some(effect.mounted);
            cell.deps.clone_from(&effect.deps);
        }
        CellSlot::Data { key: data_key } => {
            if let Some(entry) = data.get(data_key) {
                cell.value = Some(entry.value);
                cell.deps = entry.deps;
                cell.fetched_at_tick = Some(entry.tick);
            }
        }
    }
    cell
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sapling_types::TickState;
    use serde_json::json;

    use super::*;
    use crate::element::Element;

    #[tokio::test]
    async fn serializes_every_cell_kind() {
        let root = Element::from_fn(|cx| {
            cx.use_state("count", || 7_i32)?;
            cx.use_memo("double", vec![json!(7)], || 14_i32)?;
            cx.use_ref("seen", || vec![1_u8])?;
            cx.use_signal("mood", || String::from("ok"))?;
            cx.use_effect_sync("setup", Some(Vec::new()), || None)?;
            Ok(Vec::new())
        });
        let mut reconciler = Reconciler::new(root);
        reconciler.compile(&TickState::new(1, Vec::new())).await.unwrap();

        let tree = reconciler.serialize().unwrap();
        assert!(tree.type_tag.contains("FnComponent"));
        assert_eq!(tree.cell("count").unwrap().value, Some(json!(7)));
        assert_eq!(tree.cell("double").unwrap().deps, Some(vec![json!(7)]));
        assert_eq!(tree.cell("seen").unwrap().value, Some(json!([1])));
        assert_eq!(tree.cell("mood").unwrap().value, Some(json!("ok")));
        let setup = tree.cell("setup").unwrap();
        assert_eq!(setup.mounted, Some(true));
        assert_eq!(setup.value, None);
    }

    #[test]
    fn unmounted_tree_serializes_to_nothing() {
        let reconciler = Reconciler::new(Element::from_fn(|_cx| Ok(Vec::new())));
        assert!(reconciler.serialize().is_none());
    }
}
