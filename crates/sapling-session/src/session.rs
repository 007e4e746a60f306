//! The session: one live tree, its committed timeline, and the execution
//! loop that drives it.
//!
//! A session is idle or running. [`Session::tick`] from idle starts an
//! execution on the ambient tokio runtime and returns its
//! [`ExecutionHandle`]; while running, every further call joins the same
//! handle and merges its abort signal. Each tick commits queued messages,
//! settles the tree, calls the model, runs any capabilities it asked for,
//! and commits the results. Executions end when the model stops asking for
//! capabilities or the tick budget runs out. Messages queued while running
//! start a fresh execution once the current one completes.
//!
//! Three locks, never held across each other's awaits:
//!
//! - `core` (async) guards the reconciler and timeline; held for compile
//!   and commit phases, released around model and capability calls.
//! - `run` (sync) guards the idle/running state and the message queue.
//! - `inbox` (sync) guards the inbox attachment.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use sapling_core::config::SessionConfig;
use sapling_core::{
    AbortSignal, CapabilityRegistry, DataCache, Element, Invalidation, MessageConsumers,
    Reconciler,
};
use sapling_inbox::{Inbox, InboxSubscription};
use sapling_types::{
    CapabilitySpec, ContentBlock, ExecutionId, QueuedMessage, Role, SNAPSHOT_VERSION, SessionId,
    SessionSnapshot, StreamEvent, TickResult, TickState, TimelineEntry, Usage,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::handle::{ExecutionHandle, ExecutionOutput};
use crate::model::{ModelAdapter, ModelRequest};
use crate::store::SessionStore;

/// Collaborators and settings for a session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Loop limits and snapshot cadence.
    pub config: SessionConfig,
    /// Model backend.
    pub model: Arc<dyn ModelAdapter>,
    /// Where snapshots go. `None` keeps them in the caller's hands.
    pub store: Option<Arc<dyn SessionStore>>,
    /// Inbox to subscribe to on creation.
    pub inbox: Option<Arc<Inbox>>,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("config", &self.config)
            .field("model", &self.model.name())
            .field("store", &self.store.is_some())
            .field("inbox", &self.inbox.is_some())
            .finish()
    }
}

impl SessionOptions {
    /// Default configuration, no store, no inbox.
    pub fn new(model: Arc<dyn ModelAdapter>) -> Self {
        Self {
            config: SessionConfig::default(),
            model,
            store: None,
            inbox: None,
        }
    }

    /// Use `config`.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist snapshots to `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Subscribe to `inbox`.
    #[must_use]
    pub fn with_inbox(mut self, inbox: Arc<Inbox>) -> Self {
        self.inbox = Some(inbox);
        self
    }
}

/// Arguments of [`Session::tick`].
#[derive(Debug, Clone, Default)]
pub struct TickInput {
    /// New root props, applied at the next tick.
    pub props: Option<Value>,
    /// Message to queue.
    pub message: Option<QueuedMessage>,
    /// Extra signal that aborts the execution when it fires.
    pub abort: Option<AbortSignal>,
}

impl TickInput {
    /// No props, no message, no extra abort signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace root props.
    #[must_use]
    pub fn with_props(mut self, props: Value) -> Self {
        self.props = Some(props);
        self
    }

    /// Queue `message`.
    #[must_use]
    pub fn with_message(mut self, message: QueuedMessage) -> Self {
        self.message = Some(message);
        self
    }

    /// Abort the execution when `abort` fires.
    #[must_use]
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = Some(abort);
        self
    }
}

pub(crate) struct SessionCore {
    reconciler: Reconciler,
    timeline: Vec<TimelineEntry>,
    tick: u64,
    usage: Usage,
    mounted: bool,
    capabilities: CapabilityRegistry,
}

impl SessionCore {
    fn commit(&mut self, handle: &ExecutionHandle, entry: TimelineEntry) {
        handle.emit(StreamEvent::EntryCommitted {
            tick: entry.tick,
            entry: entry.clone(),
        });
        self.timeline.push(entry);
    }

    fn snapshot(&self, session_id: SessionId) -> SessionSnapshot {
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id,
            tick: self.tick,
            tree: self.reconciler.serialize(),
            timeline: self.timeline.clone(),
            usage: self.usage,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
pub(crate) struct RunState {
    current: Option<ExecutionHandle>,
    queue: VecDeque<QueuedMessage>,
    props: Option<Value>,
    consumers: MessageConsumers,
    consumer_error: Option<SessionError>,
}

pub(crate) struct InboxAttachment {
    pub(crate) inbox: Arc<Inbox>,
    pub(crate) subscription: InboxSubscription,
}

#[derive(Default)]
pub(crate) struct DrainFlags {
    pub(crate) active: AtomicBool,
    pub(crate) again: AtomicBool,
}

pub(crate) struct SessionInner {
    pub(crate) id: SessionId,
    config: SessionConfig,
    model: Arc<dyn ModelAdapter>,
    store: Option<Arc<dyn SessionStore>>,
    data: DataCache,
    core: tokio::sync::Mutex<SessionCore>,
    run: Mutex<RunState>,
    pub(crate) drain: DrainFlags,
    pub(crate) inbox: Mutex<Option<InboxAttachment>>,
}

impl SessionInner {
    fn lock_run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_inbox(&self) -> MutexGuard<'_, Option<InboxAttachment>> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What one tick handed back to the execution loop.
struct TickOutcome {
    usage: Usage,
    output: Option<String>,
    should_continue: bool,
}

/// A durable, resumable agent session. Clones share the session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create an idle session around `root`. Nothing renders until the
    /// first tick or [`mount`](Self::mount).
    pub fn new(id: SessionId, root: Element, options: SessionOptions) -> Self {
        Self::build(id, root, options, None)
    }

    /// Rebuild a hibernated session. The tree hydrates on its first compile.
    pub fn resume(
        snapshot: SessionSnapshot,
        root: Element,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SessionError::Snapshot(format!(
                "snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        info!(
            session_id = %snapshot.session_id,
            tick = snapshot.tick,
            entries = snapshot.timeline.len(),
            "resuming session from snapshot"
        );
        Ok(Self::build(snapshot.session_id, root, options, Some(snapshot)))
    }

    /// Resume `id` from the configured store. `Ok(None)` if nothing is
    /// stored for it.
    pub fn load(
        id: SessionId,
        root: Element,
        options: SessionOptions,
    ) -> Result<Option<Self>, SessionError> {
        let Some(store) = options.store.clone() else {
            return Err(SessionError::Snapshot(String::from(
                "no session store configured",
            )));
        };
        let Some(snapshot) = store.load(id)? else {
            debug!(session_id = %id, "no stored snapshot");
            return Ok(None);
        };
        Self::resume(snapshot, root, options).map(Some)
    }

    fn build(
        id: SessionId,
        root: Element,
        options: SessionOptions,
        restore: Option<SessionSnapshot>,
    ) -> Self {
        let SessionOptions {
            config,
            model,
            store,
            inbox,
        } = options;
        let data = DataCache::new();
        let mut core = SessionCore {
            reconciler: Reconciler::new(root).with_data_cache(data.clone()),
            timeline: Vec::new(),
            tick: 0,
            usage: Usage::default(),
            mounted: false,
            capabilities: CapabilityRegistry::new(),
        };
        if let Some(snapshot) = restore {
            core.tick = snapshot.tick;
            core.timeline = snapshot.timeline;
            core.usage = snapshot.usage;
            if let Some(tree) = snapshot.tree {
                core.reconciler.hydrate(tree);
            }
        }
        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                config,
                model,
                store,
                data,
                core: tokio::sync::Mutex::new(core),
                run: Mutex::new(RunState::default()),
                drain: DrainFlags::default(),
                inbox: Mutex::new(None),
            }),
        };
        if let Some(inbox) = inbox {
            session.attach_inbox(inbox);
        }
        session
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Whether an execution is in flight.
    pub fn is_running(&self) -> bool {
        self.inner.lock_run().current.is_some()
    }

    /// Handle of the execution in flight, if any.
    pub fn current_execution(&self) -> Option<ExecutionHandle> {
        self.inner.lock_run().current.clone()
    }

    /// Messages waiting for the next tick.
    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.inner.lock_run().queue.iter().cloned().collect()
    }

    /// Committed timeline, oldest first.
    pub async fn timeline(&self) -> Vec<TimelineEntry> {
        self.inner.core.lock().await.timeline.clone()
    }

    /// Usage accumulated over the session's lifetime.
    pub async fn usage(&self) -> Usage {
        self.inner.core.lock().await.usage
    }

    /// Last tick started.
    pub async fn current_tick(&self) -> u64 {
        self.inner.core.lock().await.tick
    }

    /// Capabilities declared by the last settled tree.
    pub async fn capabilities(&self) -> Vec<CapabilitySpec> {
        self.inner.core.lock().await.capabilities.specs()
    }

    /// Start an execution, or join the one in flight.
    ///
    /// Joining merges `input.abort` into the running execution's signal,
    /// queues `input.message` as [`queue_message`](Self::queue_message)
    /// would, and defers `input.props` to the next tick.
    pub fn tick(&self, input: TickInput) -> ExecutionHandle {
        let TickInput {
            props,
            message,
            abort,
        } = input;
        let mut run = self.inner.lock_run();
        if props.is_some() {
            run.props = props;
        }

        if let Some(current) = run.current.clone() {
            if let Some(abort) = abort.as_ref() {
                current.abort_signal().follow(abort);
            }
            if let Some(message) = message {
                self.surface(&mut run, &current, message);
            }
            debug!(
                session_id = %self.inner.id,
                execution_id = %current.id(),
                "execution in flight; joining"
            );
            return current;
        }

        let handle = ExecutionHandle::new(self.inner.id);
        if let Some(abort) = abort.as_ref() {
            handle.abort_signal().follow(abort);
        }
        if let Some(message) = message {
            run.queue.push_back(message);
        }
        run.current = Some(handle.clone());
        drop(run);
        self.start(handle.clone());
        handle
    }

    /// Queue a user text message and tick.
    pub fn send(&self, text: impl Into<String>) -> ExecutionHandle {
        self.tick(TickInput::new().with_message(QueuedMessage::text("user", text)))
    }

    /// Queue `message` for the next tick. While running, it is also handed
    /// to the tree's message consumers and announced on the event stream.
    pub fn queue_message(&self, message: QueuedMessage) {
        let mut run = self.inner.lock_run();
        match run.current.clone() {
            Some(current) => self.surface(&mut run, &current, message),
            None => {
                debug!(
                    session_id = %self.inner.id,
                    message_id = %message.id,
                    "message queued while idle"
                );
                run.queue.push_back(message);
            }
        }
    }

    /// Abort the execution in flight. Returns whether a signal fired.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.current_execution()
            .is_some_and(|handle| handle.abort(reason))
    }

    /// Settle the tree once without calling the model, registering its
    /// capabilities. A no-op once mounted.
    pub async fn mount(&self) -> Result<(), SessionError> {
        let mut core = self.inner.core.lock().await;
        if core.mounted {
            return Ok(());
        }
        let state = TickState::new(core.tick, core.timeline.clone());
        let report = core
            .reconciler
            .compile_until_stable(
                &state,
                self.inner.config.max_compile_iterations,
                &AbortSignal::new(),
            )
            .await?;
        core.reconciler.complete_hydration();
        core.capabilities = report.capabilities;
        core.mounted = true;
        self.inner.lock_run().consumers = core.reconciler.lifecycle().message_consumers();
        info!(
            session_id = %self.inner.id,
            capabilities = core.capabilities.len(),
            iterations = report.iterations,
            "session mounted"
        );
        Ok(())
    }

    /// Invoke a capability by name or alias, bypassing the model.
    ///
    /// Mounts first if needed. The handler's answer is normalized with
    /// [`normalize_result`].
    pub async fn dispatch(
        &self,
        name: &str,
        input: Value,
    ) -> Result<Vec<ContentBlock>, SessionError> {
        self.mount().await?;
        let capability = {
            let core = self.inner.core.lock().await;
            core.capabilities
                .resolve(name)
                .filter(|c| c.dispatchable())
                .cloned()
        };
        let Some(capability) = capability else {
            warn!(session_id = %self.inner.id, command = name, "unknown command");
            return Err(SessionError::UnknownCommand {
                name: name.to_owned(),
            });
        };
        debug!(
            session_id = %self.inner.id,
            command = name,
            capability = capability.name(),
            "dispatching"
        );
        let value = capability
            .invoke(input)
            .await
            .map_err(|e| SessionError::Tool {
                name: capability.name().to_owned(),
                message: e.message,
            })?;
        normalize_result(value)
    }

    /// Serialize the session. Saved to the store when one is configured.
    pub async fn hibernate(&self) -> Result<SessionSnapshot, SessionError> {
        let snapshot = self.inner.core.lock().await.snapshot(self.inner.id);
        if let Some(store) = self.inner.store.as_ref() {
            store.save(&snapshot)?;
        }
        info!(
            session_id = %self.inner.id,
            tick = snapshot.tick,
            nodes = snapshot.tree.as_ref().map_or(0, |t| t.node_count()),
            "session hibernated"
        );
        Ok(snapshot)
    }

    /// Drop cached data-cell values. Returns how many entries went.
    pub fn invalidate_data(&self, which: &Invalidation) -> usize {
        let removed = self.inner.data.invalidate(which);
        debug!(session_id = %self.inner.id, removed, "data cache invalidated");
        removed
    }

    /// Detach from the inbox, abort any execution, and unmount the tree.
    pub async fn close(&self) {
        let attachment = self.inner.lock_inbox().take();
        if let Some(attachment) = attachment {
            attachment.subscription.unsubscribe();
        }
        self.abort("session closed");
        let mut core = self.inner.core.lock().await;
        core.reconciler.unmount();
        core.mounted = false;
        info!(session_id = %self.inner.id, "session closed");
    }

    fn surface(&self, run: &mut RunState, current: &ExecutionHandle, message: QueuedMessage) {
        run.queue.push_back(message.clone());
        current.emit(StreamEvent::MessageQueued {
            message: message.clone(),
        });
        if run.consumers.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.inner.id, "no tokio runtime; message consumers skipped");
            return;
        };
        let consumers = run.consumers.clone();
        let session = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            match consumers.deliver(&message).await {
                Ok(count) => {
                    debug!(message_id = %message.id, consumers = count, "message surfaced");
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "message consumer failed");
                    if let Some(inner) = session.upgrade() {
                        inner.lock_run().consumer_error.get_or_insert(e.into());
                    }
                }
            }
        });
    }

    fn start(&self, handle: ExecutionHandle) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let session = self.clone();
                runtime.spawn(async move { session.execute(handle).await });
            }
            Err(e) => {
                warn!(session_id = %self.inner.id, "no tokio runtime; execution cannot start");
                self.release(handle.id());
                handle.finish(
                    0,
                    Usage::default(),
                    Err(SessionError::NoRuntime(e.to_string())),
                );
            }
        }
    }

    fn release(&self, execution: ExecutionId) {
        let mut run = self.inner.lock_run();
        if run.current.as_ref().is_some_and(|c| c.id() == execution) {
            run.current = None;
        }
    }

    async fn execute(self, first: ExecutionHandle) {
        let mut handle = first;
        loop {
            let (ticks, usage, result) = self.run_execution(&handle).await;
            // Go idle (or hand over to the next execution) before finishing,
            // so a caller woken by the result can tick straight away.
            let next = {
                let mut run = self.inner.lock_run();
                if run.current.as_ref().is_some_and(|c| c.id() == handle.id()) {
                    run.current = None;
                }
                let resume = result.is_ok()
                    && self.inner.config.auto_resume
                    && run.current.is_none()
                    && !run.queue.is_empty();
                resume.then(|| {
                    let next = ExecutionHandle::new(self.inner.id);
                    run.current = Some(next.clone());
                    next
                })
            };
            match &result {
                Ok(_) => info!(
                    session_id = %self.inner.id,
                    execution_id = %handle.id(),
                    ticks,
                    "execution completed"
                ),
                Err(e) if e.is_abort() => info!(
                    session_id = %self.inner.id,
                    execution_id = %handle.id(),
                    reason = %e,
                    "execution aborted"
                ),
                Err(e) => warn!(
                    session_id = %self.inner.id,
                    execution_id = %handle.id(),
                    error = %e,
                    "execution failed"
                ),
            }
            handle.finish(ticks, usage, result);
            let Some(next) = next else {
                return;
            };
            info!(
                session_id = %self.inner.id,
                execution_id = %next.id(),
                "messages queued during execution; auto-resuming"
            );
            handle = next;
        }
    }

    async fn run_execution(
        &self,
        handle: &ExecutionHandle,
    ) -> (u64, Usage, Result<ExecutionOutput, SessionError>) {
        handle.emit(StreamEvent::ExecutionStart {
            execution_id: handle.id(),
            session_id: self.inner.id,
        });
        info!(session_id = %self.inner.id, execution_id = %handle.id(), "execution start");

        let abort = handle.abort_signal();
        let max_ticks = u64::from(self.inner.config.max_ticks.max(1));
        let mut ticks = 0_u64;
        let mut usage = Usage::default();
        let mut output = None;
        let result = loop {
            if ticks >= max_ticks {
                warn!(session_id = %self.inner.id, max_ticks, "tick budget exhausted");
                break Ok(());
            }
            ticks = ticks.saturating_add(1);
            match self.run_tick(handle, &abort).await {
                Ok(outcome) => {
                    usage = usage.add(outcome.usage);
                    if outcome.output.is_some() {
                        output = outcome.output;
                    }
                    if !outcome.should_continue {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        let result = result.and_then(|()| self.take_consumer_error()).map(|()| ExecutionOutput {
            execution_id: handle.id(),
            output,
            ticks,
            usage,
        });
        (ticks, usage, result)
    }

    fn take_consumer_error(&self) -> Result<(), SessionError> {
        self.inner
            .lock_run()
            .consumer_error
            .take()
            .map_or(Ok(()), Err)
    }

    #[allow(clippy::too_many_lines)]
    async fn run_tick(
        &self,
        handle: &ExecutionHandle,
        abort: &AbortSignal,
    ) -> Result<TickOutcome, SessionError> {
        abort.check()?;
        self.take_consumer_error()?;
        let session_id = self.inner.id;

        let mut core = self.inner.core.lock().await;
        core.tick = core.tick.saturating_add(1);
        let tick = core.tick;
        handle.set_tick(tick);
        handle.emit(StreamEvent::TickStart { tick });
        debug!(session_id = %session_id, tick, "tick start");

        let (queued, props) = {
            let mut run = self.inner.lock_run();
            (run.queue.drain(..).collect::<Vec<_>>(), run.props.take())
        };
        let mut new_entries = Vec::new();
        for message in &queued {
            let entry = TimelineEntry::new(tick, Role::User, message.content.clone());
            core.commit(handle, entry.clone());
            new_entries.push(entry);
        }
        if let Some(props) = props {
            core.reconciler.set_props(props);
        }

        let mut state = TickState::new(tick, core.timeline.clone());
        state.queued_messages = queued;
        state.aborted = abort.is_aborted();
        core.reconciler.lifecycle_mut().notify_tick_start(&state).await?;
        let report = core
            .reconciler
            .compile_until_stable(&state, self.inner.config.max_compile_iterations, abort)
            .await?;
        core.reconciler.complete_hydration();
        core.mounted = true;
        handle.emit(StreamEvent::Compiled {
            tick,
            iterations: report.iterations,
            forced_stable: report.forced_stable,
        });
        self.inner.lock_run().consumers = core.reconciler.lifecycle().message_consumers();
        core.capabilities = report.capabilities;

        let mut messages = core.timeline.clone();
        messages.extend(report.output.entries.iter().cloned());
        let request = ModelRequest {
            session_id,
            tick,
            system: report.output.system_prompt(),
            tools: report.output.model_tools(),
            messages,
        };
        drop(core);

        abort.check()?;
        debug!(
            session_id = %session_id,
            tick,
            model = self.inner.model.name(),
            tools = request.tools.len(),
            "calling model"
        );
        let response = tokio::select! {
            biased;
            () = abort.cancelled() => return Err(aborted(abort)),
            response = self.inner.model.generate(request) => response?,
        };
        abort.check()?;

        let mut core = self.inner.core.lock().await;
        core.usage = core.usage.add(response.usage);
        let assistant = TimelineEntry::new(tick, Role::Assistant, response.message);
        let calls: Vec<(String, String, Value)> = assistant
            .tool_uses()
            .map(|(id, name, input)| (id.to_owned(), name.to_owned(), input.clone()))
            .collect();
        let text = assistant.text();
        core.commit(handle, assistant.clone());
        new_entries.push(assistant);
        let capabilities = core.capabilities.clone();
        drop(core);

        let should_continue = !calls.is_empty();
        let mut results = Vec::with_capacity(calls.len());
        for (id, name, input) in calls {
            results.push(invoke_for_model(&capabilities, id, &name, input).await);
        }

        let mut core = self.inner.core.lock().await;
        if !results.is_empty() {
            let entry = TimelineEntry::new(tick, Role::Tool, results);
            core.commit(handle, entry.clone());
            new_entries.push(entry);
        }
        state.timeline = core.timeline.clone();
        let result = TickResult {
            tick,
            stop_reason: Some(response.stop_reason),
            new_entries,
            usage: response.usage,
            should_continue,
        };
        core.reconciler
            .lifecycle_mut()
            .notify_tick_end(&state, &result)
            .await?;
        handle.emit(StreamEvent::TickEnd {
            tick,
            stop_reason: result.stop_reason,
            usage: result.usage,
        });
        self.periodic_snapshot(&core, tick);
        drop(core);
        info!(
            session_id = %session_id,
            tick,
            stop_reason = ?response.stop_reason,
            tokens = response.usage.total(),
            should_continue,
            "tick end"
        );

        Ok(TickOutcome {
            usage: response.usage,
            output: (!text.is_empty()).then_some(text),
            should_continue,
        })
    }

    fn periodic_snapshot(&self, core: &SessionCore, tick: u64) {
        let Some(store) = self.inner.store.as_ref() else {
            return;
        };
        if tick.checked_rem(self.inner.config.snapshot_every_ticks) != Some(0) {
            return;
        }
        match store.save(&core.snapshot(self.inner.id)) {
            Ok(()) => debug!(session_id = %self.inner.id, tick, "periodic snapshot saved"),
            Err(e) => {
                warn!(session_id = %self.inner.id, tick, error = %e, "periodic snapshot failed");
            }
        }
    }
}

fn aborted(abort: &AbortSignal) -> SessionError {
    SessionError::Aborted {
        reason: abort.reason().unwrap_or_default(),
    }
}

/// Run one capability the model asked for. Failures become error results
/// the model can read; they never fail the tick.
async fn invoke_for_model(
    capabilities: &CapabilityRegistry,
    tool_use_id: String,
    name: &str,
    input: Value,
) -> ContentBlock {
    let outcome = match capabilities.resolve(name).filter(|c| c.visible_to_model()) {
        Some(capability) => capability
            .invoke(input)
            .await
            .map_err(|e| SessionError::Tool {
                name: capability.name().to_owned(),
                message: e.message,
            })
            .and_then(normalize_result),
        None => Err(SessionError::UnknownCommand {
            name: name.to_owned(),
        }),
    };
    let (content, is_error) = match outcome {
        Ok(content) => (content, false),
        Err(e) => {
            warn!(capability = name, error = %e, "model capability call failed");
            (vec![ContentBlock::text(e.to_string())], true)
        }
    };
    ContentBlock::ToolResult {
        tool_use_id,
        content,
        is_error,
    }
}

/// Normalize a handler's answer into content blocks.
///
/// A string becomes one text block. A list passes through, with string
/// items read as text blocks and objects as content blocks. Anything else
/// is [`SessionError::InvalidToolResult`].
pub fn normalize_result(value: Value) -> Result<Vec<ContentBlock>, SessionError> {
    match value {
        Value::String(text) => Ok(vec![ContentBlock::text(text)]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => Ok(ContentBlock::text(text)),
                other @ Value::Object(_) => serde_json::from_value(other).map_err(|e| {
                    debug!(error = %e, "list item is not a content block");
                    SessionError::InvalidToolResult
                }),
                _ => Err(SessionError::InvalidToolResult),
            })
            .collect(),
        _ => Err(SessionError::InvalidToolResult),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn strings_become_one_text_block() {
        assert_eq!(
            normalize_result(json!("x")).unwrap(),
            vec![ContentBlock::text("x")]
        );
    }

    #[test]
    fn lists_pass_through() {
        let blocks = normalize_result(json!([
            {"type": "text", "text": "a"},
            "b",
            {"type": "json", "value": {"n": 1}},
        ]))
        .unwrap();
        assert_eq!(
            blocks,
            vec![
                ContentBlock::text("a"),
                ContentBlock::text("b"),
                ContentBlock::Json {
                    value: json!({"n": 1})
                },
            ]
        );
    }

    #[test]
    fn other_shapes_are_rejected() {
        for value in [json!(null), json!({"text": "x"}), json!(3), json!([1]), json!(true)] {
            let err = normalize_result(value).unwrap_err();
            assert_eq!(err, SessionError::InvalidToolResult);
            assert_eq!(err.to_string(), "Unexpected tool result type");
        }
    }
}
