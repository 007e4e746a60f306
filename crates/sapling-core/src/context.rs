//! The per-node render context: cell hooks, output contributions, and
//! lifecycle registration.
//!
//! Every cell is addressed by a string key unique within its node. A key
//! keeps its kind for the node's lifetime; declaring it again with another
//! kind fails the render. Cells not declared by a render are dropped
//! (effect cleanups run) once the render returns.

use std::collections::HashSet;
use std::collections::btree_map::Entry;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use sapling_types::{
    CellKind, CompiledOutput, QueuedMessage, Section, SerializedCell, SerializedNode,
    TickResult, TickState, TimelineEntry,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use crate::capability::{Capability, CapabilityRegistry};
use crate::cell::{
    CellSlot, Cleanup, Deps, EffectSlot, RefHandle, StateHandle, TypedCell, decode, deps_changed,
    encode,
};
use crate::data::{CachedData, DataCache, FetchError, FetchFuture, PendingFetch};
use crate::element::RenderError;
use crate::lifecycle::{AfterCompileInfo, CallbackError, NodeRegistrations};
use crate::scheduler::RecompileHandle;
use crate::signal::{Dependency, Invalidate, Signal};
use crate::tree::NodeState;

/// Deferred effect body.
pub(crate) type EffectRun =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Option<Cleanup>, CallbackError>> + Send>;

/// An effect queued for the post-commit phase.
pub(crate) struct ScheduledEffect {
    pub(crate) path: String,
    pub(crate) key: String,
    pub(crate) deps: Option<Deps>,
    pub(crate) run: EffectRun,
}

fn erase_fetch<T, Fut>(future: Fut) -> FetchFuture
where
    T: Serialize + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    future
        .map(|result| {
            result.and_then(|value| {
                serde_json::to_value(value).map_err(|e| FetchError::new(e.to_string()))
            })
        })
        .boxed()
}

/// Cell payload for `use_signal`: the signal plus the edge that keeps its
/// recompile request alive.
struct OwnedSignal<T> {
    signal: Signal<T>,
    _watcher: Arc<SignalRecompile>,
}

/// Requests a recompile from inside `Signal::set`.
struct SignalRecompile {
    recompile: RecompileHandle,
    reason: String,
}

impl Invalidate for SignalRecompile {
    fn invalidate(&self) {
        self.recompile.request(self.reason.clone());
    }
}

/// Everything one compile pass accumulates across nodes.
pub(crate) struct Pass {
    pub(crate) tick: TickState,
    pub(crate) props: Value,
    pub(crate) recompile: RecompileHandle,
    pub(crate) data: DataCache,
    pub(crate) hydrating: bool,
    pub(crate) sections: Vec<Section>,
    pub(crate) entries: Vec<TimelineEntry>,
    pub(crate) capabilities: CapabilityRegistry,
    pub(crate) fetches: Vec<PendingFetch>,
    pub(crate) effects: Vec<ScheduledEffect>,
}

impl Pass {
    pub(crate) fn new(
        tick: TickState,
        props: Value,
        recompile: RecompileHandle,
        data: DataCache,
        hydrating: bool,
    ) -> Self {
        Self {
            tick,
            props,
            recompile,
            data,
            hydrating,
            sections: Vec::new(),
            entries: Vec::new(),
            capabilities: CapabilityRegistry::new(),
            fetches: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub(crate) fn output(&self) -> CompiledOutput {
        CompiledOutput {
            sections: self.sections.clone(),
            tools: self.capabilities.specs(),
            entries: self.entries.clone(),
        }
    }
}

/// What a finished render leaves behind for the reconciler.
pub(crate) struct RenderOutcome {
    pub(crate) declared: HashSet<String>,
    pub(crate) registrations: NodeRegistrations,
    pub(crate) effects: Vec<ScheduledEffect>,
}

/// Handle a component receives while rendering.
pub struct RenderContext<'a> {
    path: &'a str,
    node: &'a mut NodeState,
    pass: &'a mut Pass,
    hydration: Option<&'a SerializedNode>,
    declared: HashSet<String>,
    registrations: NodeRegistrations,
    effects: Vec<ScheduledEffect>,
}

impl<'a> RenderContext<'a> {
    pub(crate) fn new(
        path: &'a str,
        node: &'a mut NodeState,
        pass: &'a mut Pass,
        hydration: Option<&'a SerializedNode>,
    ) -> Self {
        Self {
            path,
            node,
            pass,
            hydration,
            declared: HashSet::new(),
            registrations: NodeRegistrations::default(),
            effects: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> RenderOutcome {
        RenderOutcome {
            declared: self.declared,
            registrations: self.registrations,
            effects: self.effects,
        }
    }

    /// Path of the node being rendered.
    pub const fn path(&self) -> &str {
        self.path
    }

    /// Props given to the root.
    pub fn props(&self) -> &Value {
        &self.pass.props
    }

    /// Root props decoded into `T`.
    pub fn props_as<T: DeserializeOwned>(&self) -> Result<T, RenderError> {
        Ok(decode(self.pass.props.clone())?)
    }

    /// State of the tick being compiled.
    pub fn tick_state(&self) -> &TickState {
        &self.pass.tick
    }

    /// Whether this pass restores cells from a snapshot.
    pub fn is_hydrating(&self) -> bool {
        self.pass.hydrating
    }

    /// Handle for requesting another pass from outside the render.
    pub fn recompile_handle(&self) -> RecompileHandle {
        self.pass.recompile.clone()
    }

    /// The session's data cache.
    pub fn data_cache(&self) -> DataCache {
        self.pass.data.clone()
    }

    // -- cells --------------------------------------------------------------

    fn declare(&mut self, key: &str, kind: CellKind) -> Result<(), RenderError> {
        if !self.declared.insert(key.to_owned()) {
            return Err(RenderError::DuplicateCell {
                key: key.to_owned(),
            });
        }
        if let Some(existing) = self.node.cells.get(key) {
            let stored = existing.kind();
            if stored != kind {
                return Err(RenderError::CellKindMismatch {
                    key: key.to_owned(),
                    declared: kind,
                    stored,
                });
            }
        }
        Ok(())
    }

    fn seed(&self, key: &str, kind: CellKind) -> Option<&'a SerializedCell> {
        self.hydration
            .and_then(|node| node.cell(key))
            .filter(|cell| cell.kind == kind)
    }

    fn label(&self, key: &str) -> String {
        format!("{}:{key}", self.path)
    }

    /// Persistent value plus a setter.
    ///
    /// `init` runs only when the cell is created (and no snapshot value
    /// for it is being restored).
    pub fn use_state<T>(
        &mut self,
        key: &str,
        init: impl FnOnce() -> T,
    ) -> Result<(T, StateHandle<T>), RenderError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.declare(key, CellKind::State)?;
        let seeded = self.seeded_value::<T>(key, CellKind::State);
        let cell = match self.node.cells.entry(key.to_owned()) {
            Entry::Occupied(entry) => match entry.get() {
                CellSlot::State(cell) => Arc::clone(cell),
                other => {
                    return Err(RenderError::CellKindMismatch {
                        key: key.to_owned(),
                        declared: CellKind::State,
                        stored: other.kind(),
                    });
                }
            },
            Entry::Vacant(entry) => {
                let initial = match seeded {
                    Some(value) => value,
                    None => encode(&init())?,
                };
                let cell = Arc::new(Mutex::new(initial));
                entry.insert(CellSlot::State(Arc::clone(&cell)));
                cell
            }
        };
        let handle = StateHandle::new(cell, self.pass.recompile.clone(), &self.label(key));
        let value = handle.get()?;
        Ok((value, handle))
    }

    /// Cached derived value, recomputed only when `deps` change.
    pub fn use_memo<T>(
        &mut self,
        key: &str,
        deps: Deps,
        compute: impl FnOnce() -> T,
    ) -> Result<T, RenderError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.declare(key, CellKind::Memo)?;
        if !self.node.cells.contains_key(key) {
            let restored = self
                .seed(key, CellKind::Memo)
                .filter(|cell| cell.deps.as_ref() == Some(&deps))
                .and_then(|cell| cell.value.clone());
            if let Some(value) = restored {
                trace!(path = self.path, memo = key, "memo restored");
                self.node
                    .cells
                    .insert(key.to_owned(), CellSlot::Memo { value, deps: deps.clone() });
            }
        }
        if let Some(CellSlot::Memo { value, deps: prev }) = self.node.cells.get(key) {
            if !deps_changed(Some(prev.as_slice()), Some(deps.as_slice())) {
                return Ok(decode(value.clone())?);
            }
        }
        let fresh = compute();
        let value = encode(&fresh)?;
        self.node
            .cells
            .insert(key.to_owned(), CellSlot::Memo { value, deps });
        Ok(fresh)
    }

    /// Mutable box that survives across passes without causing recompiles.
    pub fn use_ref<T>(
        &mut self,
        key: &str,
        init: impl FnOnce() -> T,
    ) -> Result<RefHandle<T>, RenderError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.declare(key, CellKind::Ref)?;
        let seeded = self.seeded_value::<T>(key, CellKind::Ref);
        if let Some(CellSlot::Ref(typed)) = self.node.cells.get(key) {
            return typed
                .handle
                .downcast_ref::<RefHandle<T>>()
                .cloned()
                .ok_or_else(|| self.wrong_type(key));
        }
        let initial = match seeded {
            Some(value) => decode(value)?,
            None => init(),
        };
        let handle = RefHandle::new(initial);
        let snapshot = handle.clone();
        self.node.cells.insert(
            key.to_owned(),
            CellSlot::Ref(TypedCell {
                handle: Arc::new(handle.clone()),
                snapshot: Arc::new(move || snapshot.snapshot()),
            }),
        );
        Ok(handle)
    }

    /// Reactive signal owned by this node.
    ///
    /// A change requests a recompile before `set` returns, so a set from an
    /// effect is seen by the next pass of the same tick.
    pub fn use_signal<T>(
        &mut self,
        key: &str,
        init: impl FnOnce() -> T,
    ) -> Result<Signal<T>, RenderError>
    where
        T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        self.declare(key, CellKind::Signal)?;
        let seeded = self.seeded_value::<T>(key, CellKind::Signal);
        if let Some(CellSlot::Signal(typed)) = self.node.cells.get(key) {
            return typed
                .handle
                .downcast_ref::<OwnedSignal<T>>()
                .map(|owned| owned.signal.clone())
                .ok_or_else(|| self.wrong_type(key));
        }
        let initial = match seeded {
            Some(value) => decode(value)?,
            None => init(),
        };
        let signal = Signal::new(initial);
        let watcher = Arc::new(SignalRecompile {
            recompile: self.pass.recompile.clone(),
            reason: format!("signal {} changed", self.label(key)),
        });
        let weak: Weak<dyn Invalidate> = Arc::downgrade(&watcher) as Weak<SignalRecompile>;
        signal.add_dependent(weak);
        let snapshot = signal.clone();
        self.node.cells.insert(
            key.to_owned(),
            CellSlot::Signal(TypedCell {
                handle: Arc::new(OwnedSignal {
                    signal: signal.clone(),
                    _watcher: watcher,
                }),
                snapshot: Arc::new(move || serde_json::to_value(snapshot.get()).ok()),
            }),
        );
        Ok(signal)
    }

    /// Side effect run after the pass commits, children before parents.
    ///
    /// `deps == None` runs after every pass; `Some(vec![])` runs once on
    /// mount. The returned cleanup runs before the next run and on unmount.
    pub fn use_effect<F, Fut>(
        &mut self,
        key: &str,
        deps: Option<Deps>,
        effect: F,
    ) -> Result<(), RenderError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Cleanup>, CallbackError>> + Send + 'static,
    {
        self.declare(key, CellKind::Effect)?;
        if !self.node.cells.contains_key(key) {
            let restored_mount = deps.as_ref().is_some_and(Vec::is_empty)
                && self.seed(key, CellKind::Effect).is_some_and(|cell| {
                    cell.mounted == Some(true) && cell.deps.as_ref().is_some_and(Vec::is_empty)
                });
            self.node.cells.insert(
                key.to_owned(),
                CellSlot::Effect(EffectSlot {
                    deps: if restored_mount { Some(Vec::new()) } else { None },
                    mounted: restored_mount,
                    cleanup: None,
                }),
            );
            if restored_mount {
                debug!(path = self.path, effect = key, "mount-only effect already satisfied");
                return Ok(());
            }
        }
        let due = match self.node.cells.get(key) {
            Some(CellSlot::Effect(slot)) => {
                !slot.mounted || deps_changed(slot.deps.as_deref(), deps.as_deref())
            }
            _ => true,
        };
        if due {
            self.effects.push(ScheduledEffect {
                path: self.path.to_owned(),
                key: key.to_owned(),
                deps,
                run: Box::new(move || effect().boxed()),
            });
        }
        Ok(())
    }

    /// Synchronous form of [`use_effect`](Self::use_effect).
    pub fn use_effect_sync<F>(
        &mut self,
        key: &str,
        deps: Option<Deps>,
        effect: F,
    ) -> Result<(), RenderError>
    where
        F: FnOnce() -> Option<Cleanup> + Send + 'static,
    {
        self.use_effect(key, deps, move || async move { Ok::<_, CallbackError>(effect()) })
    }

    /// Asynchronously fetched value, cached per session under `key`.
    ///
    /// Returns the cached value when one exists. A fetch starts when there
    /// is no entry for `key` or it was fetched with different `deps`; it is
    /// awaited after the render walk, and its result becomes visible on the
    /// next pass. While a refetch is pending the previous value is returned.
    pub fn use_data<T, F, Fut>(
        &mut self,
        key: &str,
        deps: Option<Deps>,
        fetcher: F,
    ) -> Result<Option<T>, RenderError>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.declare(key, CellKind::Data)?;
        if !self.node.cells.contains_key(key) {
            if let Some(seed) = self.seed(key, CellKind::Data) {
                if let (Some(value), None) = (seed.value.clone(), self.pass.data.get(key)) {
                    trace!(path = self.path, data = key, "data cell restored");
                    self.pass.data.insert(
                        key,
                        CachedData {
                            value,
                            tick: seed.fetched_at_tick.unwrap_or_default(),
                            deps: seed.deps.clone(),
                        },
                    );
                }
            }
            self.node.cells.insert(
                key.to_owned(),
                CellSlot::Data {
                    key: key.to_owned(),
                },
            );
        }

        let cached = self.pass.data.get(key);
        let fresh = self.pass.data.is_fresh(key, deps.as_deref());
        let already_pending = self.pass.fetches.iter().any(|f| f.key == key);
        if !fresh && !already_pending {
            trace!(path = self.path, data = key, "data fetch scheduled");
            self.pass.fetches.push(PendingFetch {
                key: key.to_owned(),
                deps,
                future: erase_fetch(fetcher()),
            });
        }
        cached
            .map(|entry| decode(entry.value))
            .transpose()
            .map_err(RenderError::from)
    }

    fn seeded_value<T: DeserializeOwned>(&self, key: &str, kind: CellKind) -> Option<Value> {
        if self.node.cells.contains_key(key) {
            return None;
        }
        let value = self.seed(key, kind)?.value.clone()?;
        // A snapshot value that no longer decodes falls back to the default.
        match decode::<T>(value.clone()) {
            Ok(_) => Some(value),
            Err(e) => {
                debug!(path = self.path, cell = key, error = %e, "snapshot value ignored");
                None
            }
        }
    }

    fn wrong_type(&self, key: &str) -> RenderError {
        RenderError::Cell(crate::cell::CellError::Decode {
            message: format!("cell \"{}\" holds a different type", self.label(key)),
        })
    }

    // -- output -------------------------------------------------------------

    /// Contribute an instruction section.
    pub fn section(&mut self, id: impl Into<String>, content: impl Into<String>) {
        self.pass.sections.push(Section {
            id: id.into(),
            content: content.into(),
        });
    }

    /// Contribute a conversation entry.
    pub fn entry(&mut self, entry: TimelineEntry) {
        self.pass.entries.push(entry);
    }

    /// Contribute a capability.
    pub fn capability(&mut self, capability: Capability) {
        self.pass.capabilities.register(capability);
    }

    // -- lifecycle ----------------------------------------------------------

    /// Run `callback` at the start of every tick, and once on mount if the
    /// node mounts after the tick started.
    pub fn on_tick_start<F, Fut>(&mut self, key: &str, callback: F)
    where
        F: Fn(TickState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.registrations
            .tick_start
            .insert(key.to_owned(), Arc::new(move |state: TickState| callback(state).boxed()));
    }

    /// Run `callback` at the end of every tick.
    pub fn on_tick_end<F, Fut>(&mut self, key: &str, callback: F)
    where
        F: Fn(TickState, TickResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.registrations.tick_end.insert(
            key.to_owned(),
            Arc::new(move |state: TickState, result: TickResult| callback(state, result).boxed()),
        );
    }

    /// Run `callback` after every compile pass.
    pub fn on_after_compile<F, Fut>(&mut self, key: &str, callback: F)
    where
        F: Fn(CompiledOutput, TickState, AfterCompileInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.registrations.after_compile.insert(
            key.to_owned(),
            Arc::new(move |output: CompiledOutput, state: TickState, info: AfterCompileInfo| {
                callback(output, state, info).boxed()
            }),
        );
    }

    /// Receive messages queued while the session is running.
    pub fn on_message<F, Fut>(&mut self, key: &str, callback: F)
    where
        F: Fn(QueuedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.registrations
            .message
            .insert(
                key.to_owned(),
                Arc::new(move |message: QueuedMessage| callback(message).boxed()),
            );
    }
}
