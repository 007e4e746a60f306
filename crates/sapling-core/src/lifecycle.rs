//! Lifecycle notification around compile passes.
//!
//! Nodes register callbacks while they render (see
//! [`RenderContext::on_tick_start`](crate::context::RenderContext::on_tick_start)
//! and friends). Registrations belong to the node path that declared them:
//! a re-render replaces that node's set, and unmounting the node removes it
//! from every registry before any later notification can reach it.
//!
//! Tick-start has catch-up semantics. [`LifecycleNotifier::notify_tick_start`]
//! fires every registered callback and remembers which ones it reached.
//! Callbacks registered afterwards during the same tick (their node mounted
//! mid-tick) get exactly one synthetic call from
//! [`LifecycleNotifier::catch_up`]; the remembered set grows with each
//! catch-up and is only dropped at tick end, so later recompile passes in
//! the same tick never fire the same callback twice.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use sapling_types::{CompiledOutput, QueuedMessage, TickResult, TickState};
use tracing::{debug, trace};

use crate::scheduler::RecompileHandle;

/// Failure returned by a lifecycle or effect callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CallbackError {
    /// Human-readable failure.
    pub message: String,
}

impl CallbackError {
    /// Build a callback error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Which registry a callback lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// Start of a tick, before the first compile.
    TickStart,
    /// End of a tick, after the model call settled.
    TickEnd,
    /// After every compile pass.
    AfterCompile,
    /// A message was queued while the session was running.
    Message,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TickStart => "tick_start",
            Self::TickEnd => "tick_end",
            Self::AfterCompile => "after_compile",
            Self::Message => "message",
        })
    }
}

/// A callback failure, tagged with where it happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{phase} callback {owner} failed: {message}")]
pub struct LifecycleError {
    /// Registry the failing callback belongs to.
    pub phase: LifecyclePhase,
    /// `<node path>:<key>` of the registration.
    pub owner: String,
    /// Message from the callback.
    pub message: String,
}

/// Extra context handed to after-compile callbacks.
#[derive(Debug, Clone)]
pub struct AfterCompileInfo {
    /// 1-based iteration of the current `compile_until_stable` loop.
    pub iteration: u32,
    /// Request another pass.
    pub recompile: RecompileHandle,
}

/// Result of an async lifecycle callback.
pub type CallbackFuture = BoxFuture<'static, Result<(), CallbackError>>;

/// Tick-start callback.
pub type TickStartCallback = Arc<dyn Fn(TickState) -> CallbackFuture + Send + Sync>;
/// Tick-end callback.
pub type TickEndCallback = Arc<dyn Fn(TickState, TickResult) -> CallbackFuture + Send + Sync>;
/// After-compile callback.
pub type AfterCompileCallback =
    Arc<dyn Fn(CompiledOutput, TickState, AfterCompileInfo) -> CallbackFuture + Send + Sync>;
/// Queued-message consumer.
pub type MessageCallback = Arc<dyn Fn(QueuedMessage) -> CallbackFuture + Send + Sync>;

/// Callbacks one node declared during a render, by registration key.
#[derive(Default)]
pub(crate) struct NodeRegistrations {
    pub(crate) tick_start: BTreeMap<String, TickStartCallback>,
    pub(crate) tick_end: BTreeMap<String, TickEndCallback>,
    pub(crate) after_compile: BTreeMap<String, AfterCompileCallback>,
    pub(crate) message: BTreeMap<String, MessageCallback>,
}

type Registry<C> = BTreeMap<String, BTreeMap<String, C>>;

/// Registries plus the tick-start catch-up bookkeeping for one tree.
#[derive(Default)]
pub struct LifecycleNotifier {
    tick_start: Registry<TickStartCallback>,
    tick_end: Registry<TickEndCallback>,
    after_compile: Registry<AfterCompileCallback>,
    message: Registry<MessageCallback>,
    current_tick: Option<TickState>,
    tick_start_seen: Option<BTreeSet<(String, String)>>,
}

impl fmt::Debug for LifecycleNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleNotifier")
            .field("tick_start", &count(&self.tick_start))
            .field("tick_end", &count(&self.tick_end))
            .field("after_compile", &count(&self.after_compile))
            .field("message", &count(&self.message))
            .field("in_tick", &self.current_tick.is_some())
            .finish()
    }
}

fn count<C>(registry: &Registry<C>) -> usize {
    registry.values().map(BTreeMap::len).sum()
}

fn flatten<C: Clone>(registry: &Registry<C>) -> Vec<(String, C)> {
    registry
        .iter()
        .flat_map(|(path, callbacks)| {
            callbacks
                .iter()
                .map(move |(key, cb)| (format!("{path}:{key}"), cb.clone()))
        })
        .collect()
}

fn replace<C>(registry: &mut Registry<C>, path: &str, declared: BTreeMap<String, C>) {
    if declared.is_empty() {
        registry.remove(path);
    } else {
        registry.insert(path.to_owned(), declared);
    }
}

fn failed(phase: LifecyclePhase, owner: String, err: CallbackError) -> LifecycleError {
    LifecycleError {
        phase,
        owner,
        message: err.message,
    }
}

impl LifecycleNotifier {
    /// Create empty registries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registrations of the node at `path`.
    pub(crate) fn sync_node(&mut self, path: &str, declared: NodeRegistrations) {
        replace(&mut self.tick_start, path, declared.tick_start);
        replace(&mut self.tick_end, path, declared.tick_end);
        replace(&mut self.after_compile, path, declared.after_compile);
        replace(&mut self.message, path, declared.message);
    }

    /// Drop every registration of the node at `path`.
    pub(crate) fn unmount(&mut self, path: &str) {
        let removed = [
            self.tick_start.remove(path).is_some(),
            self.tick_end.remove(path).is_some(),
            self.after_compile.remove(path).is_some(),
            self.message.remove(path).is_some(),
        ];
        if removed.iter().any(|r| *r) {
            trace!(path, "lifecycle registrations removed");
        }
    }

    /// Number of registered tick-start callbacks.
    pub fn tick_start_count(&self) -> usize {
        count(&self.tick_start)
    }

    /// Number of registered tick-end callbacks.
    pub fn tick_end_count(&self) -> usize {
        count(&self.tick_end)
    }

    /// Number of registered after-compile callbacks.
    pub fn after_compile_count(&self) -> usize {
        count(&self.after_compile)
    }

    /// Whether any node consumes queued messages.
    pub fn has_message_consumers(&self) -> bool {
        !self.message.is_empty()
    }

    /// Fire every tick-start callback and remember which ones were reached.
    pub async fn notify_tick_start(&mut self, state: &TickState) -> Result<(), LifecycleError> {
        self.current_tick = Some(state.clone());
        self.tick_start_seen = Some(
            self.tick_start
                .iter()
                .flat_map(|(path, cbs)| cbs.keys().map(move |k| (path.clone(), k.clone())))
                .collect(),
        );
        let callbacks = flatten(&self.tick_start);
        debug!(tick = state.tick, callbacks = callbacks.len(), "notify tick start");
        for (owner, cb) in callbacks {
            cb(state.clone())
                .await
                .map_err(|e| failed(LifecyclePhase::TickStart, owner, e))?;
        }
        Ok(())
    }

    /// Give tick-start callbacks registered since the last notification
    /// (or catch-up) their single call for the current tick.
    ///
    /// A no-op outside a tick.
    pub async fn catch_up(&mut self) -> Result<usize, LifecycleError> {
        let (Some(state), Some(seen)) = (self.current_tick.as_ref(), self.tick_start_seen.as_mut())
        else {
            return Ok(0);
        };
        let mut due = Vec::new();
        for (path, cbs) in &self.tick_start {
            for (key, cb) in cbs {
                if seen.insert((path.clone(), key.clone())) {
                    due.push((format!("{path}:{key}"), cb.clone()));
                }
            }
        }
        let state = state.clone();
        let fired = due.len();
        for (owner, cb) in due {
            debug!(owner = %owner, tick = state.tick, "tick start catch-up");
            cb(state.clone())
                .await
                .map_err(|e| failed(LifecyclePhase::TickStart, owner, e))?;
        }
        Ok(fired)
    }

    /// Fire every after-compile callback.
    pub async fn notify_after_compile(
        &self,
        output: &CompiledOutput,
        state: &TickState,
        info: &AfterCompileInfo,
    ) -> Result<(), LifecycleError> {
        for (owner, cb) in flatten(&self.after_compile) {
            cb(output.clone(), state.clone(), info.clone())
                .await
                .map_err(|e| failed(LifecyclePhase::AfterCompile, owner, e))?;
        }
        Ok(())
    }

    /// Fire every tick-end callback and close the tick.
    pub async fn notify_tick_end(
        &mut self,
        state: &TickState,
        result: &TickResult,
    ) -> Result<(), LifecycleError> {
        self.current_tick = None;
        self.tick_start_seen = None;
        let callbacks = flatten(&self.tick_end);
        debug!(tick = state.tick, callbacks = callbacks.len(), "notify tick end");
        for (owner, cb) in callbacks {
            cb(state.clone(), result.clone())
                .await
                .map_err(|e| failed(LifecyclePhase::TickEnd, owner, e))?;
        }
        Ok(())
    }

    /// Hand a queued message to every consumer. Returns how many there were.
    pub async fn notify_message(&self, message: &QueuedMessage) -> Result<usize, LifecycleError> {
        self.message_consumers().deliver(message).await
    }

    /// Current queued-message consumers, detached from the registries.
    pub fn message_consumers(&self) -> MessageConsumers {
        MessageConsumers {
            callbacks: flatten(&self.message),
        }
    }
}

/// Queued-message consumers taken from a [`LifecycleNotifier`].
///
/// Lets a session surface messages to the tree while a tick holds the
/// reconciler.
#[derive(Clone, Default)]
pub struct MessageConsumers {
    callbacks: Vec<(String, MessageCallback)>,
}

impl fmt::Debug for MessageConsumers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.callbacks.iter().map(|(owner, _)| owner))
            .finish()
    }
}

impl MessageConsumers {
    /// Number of consumers.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether there are no consumers.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Call every consumer in registration order. Returns how many ran.
    pub async fn deliver(&self, message: &QueuedMessage) -> Result<usize, LifecycleError> {
        for (owner, cb) in &self.callbacks {
            cb(message.clone())
                .await
                .map_err(|e| failed(LifecyclePhase::Message, owner.clone(), e))?;
        }
        Ok(self.callbacks.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    fn counting(hits: &Arc<AtomicUsize>) -> TickStartCallback {
        let hits = Arc::clone(hits);
        Arc::new(move |_: TickState| {
            hits.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), CallbackError>(()) }.boxed()
        })
    }

    fn declare(key: &str, cb: TickStartCallback) -> NodeRegistrations {
        let mut regs = NodeRegistrations::default();
        regs.tick_start.insert(key.to_owned(), cb);
        regs
    }

    fn result(tick: u64) -> TickResult {
        TickResult {
            tick,
            stop_reason: None,
            new_entries: Vec::new(),
            usage: sapling_types::Usage::default(),
            should_continue: false,
        }
    }

    #[tokio::test]
    async fn catch_up_fires_once_per_tick() {
        let mut notifier = LifecycleNotifier::new();
        let early = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicUsize::new(0));
        notifier.sync_node("root", declare("start", counting(&early)));

        let state = TickState::new(1, Vec::new());
        notifier.notify_tick_start(&state).await.unwrap();
        assert_eq!(early.load(Ordering::SeqCst), 1);

        notifier.sync_node("root/@0", declare("start", counting(&late)));
        assert_eq!(notifier.catch_up().await.unwrap(), 1);
        assert_eq!(notifier.catch_up().await.unwrap(), 0);
        assert_eq!(early.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 1);

        notifier.notify_tick_end(&state, &result(1)).await.unwrap();
        assert_eq!(notifier.catch_up().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unmount_removes_from_every_registry() {
        let mut notifier = LifecycleNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut regs = declare("start", counting(&hits));
        regs.tick_end.insert(
            String::from("end"),
            Arc::new(|_: TickState, _: TickResult| {
                async { Err::<(), _>(CallbackError::new("must not run")) }.boxed()
            }),
        );
        notifier.sync_node("root/#a", regs);
        assert_eq!(notifier.tick_end_count(), 1);

        notifier.unmount("root/#a");
        let state = TickState::new(1, Vec::new());
        notifier.notify_tick_start(&state).await.unwrap();
        notifier.notify_tick_end(&state, &result(1)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.tick_start_count(), 0);
    }

    #[tokio::test]
    async fn callback_errors_propagate_with_owner() {
        let mut notifier = LifecycleNotifier::new();
        notifier.sync_node(
            "root",
            declare(
                "boom",
                Arc::new(|_: TickState| {
                    async { Err::<(), _>(CallbackError::new("nope")) }.boxed()
                }),
            ),
        );
        let err = notifier
            .notify_tick_start(&TickState::new(3, Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.phase, LifecyclePhase::TickStart);
        assert_eq!(err.owner, "root:boom");
        assert_eq!(err.to_string(), "tick_start callback root:boom failed: nope");
    }

    #[tokio::test]
    async fn redeclaring_replaces_node_set() {
        let mut notifier = LifecycleNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));
        notifier.sync_node("root", declare("a", counting(&hits)));
        notifier.sync_node("root", declare("b", counting(&hits)));
        assert_eq!(notifier.tick_start_count(), 1);
        notifier.sync_node("root", NodeRegistrations::default());
        assert_eq!(notifier.tick_start_count(), 0);
    }
}
