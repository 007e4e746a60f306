//! The reconciliation engine.
//!
//! A [`Reconciler`] owns one tree: the root element, the node arena, the
//! lifecycle registries, and the recompile handle. Each compile pass runs
//! these phases in order:
//!
//! 1. **Render walk** (depth-first): mount new nodes, re-render existing
//!    ones, replace nodes whose type changed, collect output and queue
//!    effects in post-order.
//! 2. **Unmount** every node the walk did not reach, children first,
//!    running effect cleanups and dropping lifecycle registrations.
//! 3. **Data**: await every fetch started during the walk; results land in
//!    the data cache and request another pass.
//! 4. **Catch-up** for tick-start callbacks registered during this tick.
//! 5. **Effects**, sequentially, in the queued (bottom-up) order.
//!
//! [`Reconciler::compile_until_stable`] repeats passes while something
//! requested a recompile, up to a bound.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use sapling_types::{CellKind, CompiledOutput, SerializedNode, TickState};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::abort::{AbortSignal, Aborted};
use crate::capability::CapabilityRegistry;
use crate::cell::CellSlot;
use crate::context::{Pass, RenderContext, ScheduledEffect};
use crate::data::{CachedData, DataCache, PendingFetch};
use crate::element::{Element, RenderError};
use crate::lifecycle::{AfterCompileInfo, LifecycleError, LifecycleNotifier};
use crate::scheduler::RecompileHandle;
use crate::tree::{NodeState, ROOT_PATH, child_path, child_segments};

/// Errors that abort a compile pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// A component's render failed.
    #[error("render failed at {path}: {source}")]
    Render {
        /// Node path.
        path: String,
        /// Underlying failure.
        source: RenderError,
    },

    /// Two siblings share a key.
    #[error("duplicate key \"{key}\" among children of {path}")]
    DuplicateKey {
        /// Parent path.
        path: String,
        /// Repeated key.
        key: String,
    },

    /// A cell key was reused with a different kind.
    #[error("cell {path}:{key} declared as {declared} but stored as {stored}")]
    CellKindMismatch {
        /// Node path.
        path: String,
        /// Cell key.
        key: String,
        /// Kind requested by the render.
        declared: CellKind,
        /// Kind already stored.
        stored: CellKind,
    },

    /// A data fetch rejected. Not retried.
    #[error("data fetch \"{key}\" failed: {message}")]
    Fetch {
        /// Cache key of the fetch.
        key: String,
        /// Rejection message.
        message: String,
    },

    /// An effect callback failed.
    #[error("effect {owner} failed: {message}")]
    Effect {
        /// `<node path>:<key>` of the effect.
        owner: String,
        /// Failure message.
        message: String,
    },

    /// A lifecycle callback failed.
    #[error(transparent)]
    Callback(#[from] LifecycleError),

    /// The abort signal fired between iterations.
    #[error(transparent)]
    Aborted(#[from] Aborted),
}

impl CompileError {
    fn render(path: &str, source: RenderError) -> Self {
        match source {
            RenderError::CellKindMismatch {
                key,
                declared,
                stored,
            } => Self::CellKindMismatch {
                path: path.to_owned(),
                key,
                declared,
                stored,
            },
            source => Self::Render {
                path: path.to_owned(),
                source,
            },
        }
    }
}

/// Output of one pass.
#[derive(Debug, Clone)]
pub struct Compiled {
    /// Data projection for the model layer.
    pub output: CompiledOutput,
    /// Live capabilities declared during the pass.
    pub capabilities: CapabilityRegistry,
}

/// Output of [`Reconciler::compile_until_stable`].
#[derive(Debug, Clone)]
pub struct CompileReport {
    /// Output of the last pass.
    pub output: CompiledOutput,
    /// Capabilities of the last pass.
    pub capabilities: CapabilityRegistry,
    /// Passes run.
    pub iterations: u32,
    /// Whether the loop stopped at the iteration bound with a recompile
    /// still requested.
    pub forced_stable: bool,
    /// Distinct recompile reasons, in first-seen order.
    pub recompile_reasons: Vec<String>,
}

/// Owner of one live tree.
pub struct Reconciler {
    pub(crate) root: Element,
    pub(crate) props: Value,
    pub(crate) nodes: HashMap<String, NodeState>,
    pub(crate) notifier: LifecycleNotifier,
    pub(crate) recompile: RecompileHandle,
    pub(crate) data: DataCache,
    pub(crate) hydration: Option<SerializedNode>,
    pub(crate) passes: u64,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("root", &self.root)
            .field("nodes", &self.nodes.len())
            .field("passes", &self.passes)
            .field("hydrating", &self.hydration.is_some())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler for `root`. Nothing is rendered until the first
    /// compile.
    pub fn new(root: Element) -> Self {
        Self {
            root,
            props: Value::Null,
            nodes: HashMap::new(),
            notifier: LifecycleNotifier::new(),
            recompile: RecompileHandle::new(),
            data: DataCache::new(),
            hydration: None,
            passes: 0,
        }
    }

    /// Use `props` as root props.
    #[must_use]
    pub fn with_props(mut self, props: Value) -> Self {
        self.props = props;
        self
    }

    /// Share an existing data cache.
    #[must_use]
    pub fn with_data_cache(mut self, data: DataCache) -> Self {
        self.data = data;
        self
    }

    /// Replace root props for subsequent passes.
    pub fn set_props(&mut self, props: Value) {
        self.props = props;
    }

    /// Root props.
    pub const fn props(&self) -> &Value {
        &self.props
    }

    /// Handle for requesting a recompile of this tree.
    pub fn recompile_handle(&self) -> RecompileHandle {
        self.recompile.clone()
    }

    /// Data cache used by this tree's data cells.
    pub fn data_cache(&self) -> DataCache {
        self.data.clone()
    }

    /// Lifecycle registries.
    pub const fn lifecycle(&self) -> &LifecycleNotifier {
        &self.notifier
    }

    /// Mutable lifecycle registries, for tick-level notifications.
    pub const fn lifecycle_mut(&mut self) -> &mut LifecycleNotifier {
        &mut self.notifier
    }

    /// Whether at least one pass has rendered the root.
    pub fn is_mounted(&self) -> bool {
        self.nodes.contains_key(ROOT_PATH)
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Paths of live nodes, sorted.
    pub fn node_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.nodes.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Passes run since creation.
    pub const fn passes(&self) -> u64 {
        self.passes
    }

    /// Run one compile pass.
    pub async fn compile(&mut self, state: &TickState) -> Result<Compiled, CompileError> {
        self.passes = self.passes.saturating_add(1);
        let mut pass = Pass::new(
            state.clone(),
            self.props.clone(),
            self.recompile.clone(),
            self.data.clone(),
            self.hydration.is_some(),
        );
        trace!(pass = self.passes, tick = state.tick, "compile pass start");

        let mut visited = HashSet::new();
        let root = self.root.clone();
        let hydration = self.hydration.take();
        let walked = self.render_node(
            &mut pass,
            &mut visited,
            ROOT_PATH,
            None,
            &root,
            hydration.as_ref(),
        );
        self.hydration = hydration;
        walked?;

        self.unmount_stale(&visited);
        self.resolve_fetches(std::mem::take(&mut pass.fetches), state.tick)
            .await?;
        self.notifier.catch_up().await?;
        self.run_effects(std::mem::take(&mut pass.effects)).await?;

        debug!(
            pass = self.passes,
            tick = state.tick,
            nodes = self.nodes.len(),
            sections = pass.sections.len(),
            capabilities = pass.capabilities.len(),
            "compile pass finished"
        );
        Ok(Compiled {
            output: pass.output(),
            capabilities: pass.capabilities,
        })
    }

    /// Compile until no recompile is requested, or `max_iterations` passes.
    ///
    /// Requests made before the first pass are discarded: the first pass
    /// already observes every change they announce.
    pub async fn compile_until_stable(
        &mut self,
        state: &TickState,
        max_iterations: u32,
        abort: &AbortSignal,
    ) -> Result<CompileReport, CompileError> {
        let max_iterations = max_iterations.max(1);
        if let Some(stale) = self.recompile.take() {
            trace!(count = stale.len(), "discarding recompile requests from before the pass");
        }
        let mut reasons: Vec<String> = Vec::new();
        let mut iteration = 0_u32;
        loop {
            abort.check()?;
            iteration = iteration.saturating_add(1);
            let compiled = self.compile(state).await?;
            let info = AfterCompileInfo {
                iteration,
                recompile: self.recompile.clone(),
            };
            self.notifier
                .notify_after_compile(&compiled.output, state, &info)
                .await?;

            let Some(requested) = self.recompile.take() else {
                debug!(tick = state.tick, iterations = iteration, "compile stable");
                return Ok(report(compiled, iteration, false, reasons));
            };
            for reason in requested {
                if !reasons.contains(&reason) {
                    reasons.push(reason);
                }
            }
            if iteration >= max_iterations {
                warn!(
                    tick = state.tick,
                    iterations = iteration,
                    reasons = ?reasons,
                    "compile did not settle; forcing stable"
                );
                return Ok(report(compiled, iteration, true, reasons));
            }
            debug!(tick = state.tick, iteration, "recompile requested");
        }
    }

    /// Unmount the whole tree, running every cleanup.
    pub fn unmount(&mut self) {
        let mut roots: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(path, _)| path.clone())
            .collect();
        roots.sort();
        for path in roots {
            self.unmount_subtree(&path);
        }
        let leftovers: Vec<String> = self.nodes.keys().cloned().collect();
        for path in leftovers {
            self.unmount_subtree(&path);
        }
        info!("tree unmounted");
    }

    fn render_node(
        &mut self,
        pass: &mut Pass,
        visited: &mut HashSet<String>,
        path: &str,
        parent: Option<&str>,
        element: &Element,
        hydration: Option<&SerializedNode>,
    ) -> Result<(), CompileError> {
        let mut node = match self.nodes.remove(path) {
            Some(existing) if existing.type_tag == element.type_tag() => existing,
            Some(existing) => {
                debug!(
                    path,
                    from = existing.type_tag,
                    to = element.type_tag(),
                    "node type changed; remounting"
                );
                self.nodes.insert(path.to_owned(), existing);
                self.unmount_subtree(path);
                NodeState::new(element, parent)
            }
            None => {
                trace!(path, type_tag = element.type_tag(), "mount");
                NodeState::new(element, parent)
            }
        };

        let hydration = hydration.filter(|snapshot| {
            let matches = snapshot.type_tag == element.type_tag();
            if !matches {
                debug!(
                    path,
                    stored = %snapshot.type_tag,
                    live = element.type_tag(),
                    "snapshot type differs; subtree starts fresh"
                );
            }
            matches
        });

        let rendered = {
            let mut cx = RenderContext::new(path, &mut node, pass, hydration);
            match element.component().render(&mut cx) {
                Ok(children) => Ok((children, cx.finish())),
                Err(e) => Err(e),
            }
        };
        let (children, outcome) = match rendered {
            Ok(done) => done,
            Err(e) => {
                self.nodes.insert(path.to_owned(), node);
                return Err(CompileError::render(path, e));
            }
        };

        node.prune_cells(path, &outcome.declared);
        self.notifier.sync_node(path, outcome.registrations);
        visited.insert(path.to_owned());

        let segments = match child_segments(&children) {
            Ok(segments) => segments,
            Err(key) => {
                self.nodes.insert(path.to_owned(), node);
                return Err(CompileError::DuplicateKey {
                    path: path.to_owned(),
                    key,
                });
            }
        };

        let mut child_paths = Vec::with_capacity(children.len());
        let mut walked = Ok(());
        for (child, segment) in children.iter().zip(&segments) {
            let child_at = child_path(path, segment);
            let child_hydration = hydration.and_then(|s| s.child_at(segment));
            walked = self.render_node(pass, visited, &child_at, Some(path), child, child_hydration);
            if walked.is_err() {
                break;
            }
            child_paths.push(child_at);
        }
        if walked.is_ok() {
            node.children = child_paths;
        }
        self.nodes.insert(path.to_owned(), node);
        walked?;

        pass.effects.extend(outcome.effects);
        Ok(())
    }

    fn unmount_subtree(&mut self, path: &str) {
        let Some(node) = self.nodes.remove(path) else {
            return;
        };
        for child in &node.children {
            self.unmount_subtree(child);
        }
        self.notifier.unmount(path);
        debug!(path, type_tag = node.type_tag, "unmount");
        node.teardown(path);
    }

    fn unmount_stale(&mut self, visited: &HashSet<String>) {
        let mut stale_roots: Vec<String> = self
            .nodes
            .iter()
            .filter(|(path, _)| !visited.contains(*path))
            .filter(|(_, node)| {
                node.parent
                    .as_ref()
                    .is_none_or(|parent| visited.contains(parent))
            })
            .map(|(path, _)| path.clone())
            .collect();
        stale_roots.sort();
        for path in stale_roots {
            self.unmount_subtree(&path);
        }
        let orphans: Vec<String> = self
            .nodes
            .keys()
            .filter(|path| !visited.contains(*path))
            .cloned()
            .collect();
        for path in orphans {
            self.unmount_subtree(&path);
        }
    }

    async fn resolve_fetches(
        &mut self,
        fetches: Vec<PendingFetch>,
        tick: u64,
    ) -> Result<(), CompileError> {
        if fetches.is_empty() {
            return Ok(());
        }
        debug!(count = fetches.len(), "awaiting data fetches");
        let (meta, futures): (Vec<_>, Vec<_>) = fetches
            .into_iter()
            .map(|f| ((f.key, f.deps), f.future))
            .unzip();
        let results = join_all(futures).await;
        for ((key, deps), result) in meta.into_iter().zip(results) {
            match result {
                Ok(value) => {
                    self.data.insert(key.clone(), CachedData { value, tick, deps });
                    self.recompile.request(format!("data \"{key}\" resolved"));
                }
                Err(e) => {
                    warn!(data = %key, error = %e, "data fetch failed");
                    return Err(CompileError::Fetch {
                        key,
                        message: e.message,
                    });
                }
            }
        }
        Ok(())
    }

    async fn run_effects(&mut self, effects: Vec<ScheduledEffect>) -> Result<(), CompileError> {
        for effect in effects {
            let owner = format!("{}:{}", effect.path, effect.key);
            let previous = self
                .effect_slot(&effect.path, &effect.key)
                .and_then(|slot| slot.cleanup.take());
            if let Some(cleanup) = previous {
                trace!(effect = %owner, "cleanup before re-run");
                cleanup();
            }
            trace!(effect = %owner, "effect run");
            let cleanup = (effect.run)().await.map_err(|e| CompileError::Effect {
                owner: owner.clone(),
                message: e.message,
            })?;
            if let Some(slot) = self.effect_slot(&effect.path, &effect.key) {
                slot.cleanup = cleanup;
                slot.mounted = true;
                slot.deps = effect.deps;
            } else if let Some(cleanup) = cleanup {
                // The node went away while the effect ran; clean up at once.
                cleanup();
            }
        }
        Ok(())
    }

    fn effect_slot(&mut self, path: &str, key: &str) -> Option<&mut crate::cell::EffectSlot> {
        match self.nodes.get_mut(path)?.cells.get_mut(key)? {
            CellSlot::Effect(slot) => Some(slot),
            _ => None,
        }
    }
}

fn report(
    compiled: Compiled,
    iterations: u32,
    forced_stable: bool,
    reasons: Vec<String>,
) -> CompileReport {
    CompileReport {
        output: compiled.output,
        capabilities: compiled.capabilities,
        iterations,
        forced_stable,
        recompile_reasons: reasons,
    }
}
