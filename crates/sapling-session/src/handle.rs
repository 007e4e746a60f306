//! Execution handles.
//!
//! An [`ExecutionHandle`] is shared by everyone who started or joined one
//! execution of a session. It carries the execution's status, its ordered
//! event log, the final result, and the abort signal. State lives in a
//! `tokio::sync::watch` channel so any number of holders can await the
//! result or follow the event stream without coordinating.

use std::sync::Arc;

use futures::Stream;
use sapling_core::AbortSignal;
use sapling_types::{ExecutionId, ExecutionStatus, SessionId, StreamEvent, Usage};
use tokio::sync::watch;
use tracing::debug;

use crate::error::SessionError;

/// What a completed execution produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// Text of the last assistant entry.
    pub output: Option<String>,
    /// Ticks run.
    pub ticks: u64,
    /// Usage accumulated during the execution.
    pub usage: Usage,
}

#[derive(Debug, Clone)]
struct HandleState {
    status: ExecutionStatus,
    current_tick: u64,
    events: Vec<StreamEvent>,
    result: Option<Result<ExecutionOutput, SessionError>>,
}

struct HandleInner {
    id: ExecutionId,
    session_id: SessionId,
    abort: AbortSignal,
    state: watch::Sender<HandleState>,
}

/// Shared handle to one execution.
#[derive(Clone)]
pub struct ExecutionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.inner.id)
            .field("session_id", &self.inner.session_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ExecutionHandle {
    /// A new running execution of `session_id`.
    pub(crate) fn new(session_id: SessionId) -> Self {
        let (state, _) = watch::channel(HandleState {
            status: ExecutionStatus::Running,
            current_tick: 0,
            events: Vec::new(),
            result: None,
        });
        Self {
            inner: Arc::new(HandleInner {
                id: ExecutionId::new(),
                session_id,
                abort: AbortSignal::new(),
                state,
            }),
        }
    }

    /// Execution identifier.
    pub fn id(&self) -> ExecutionId {
        self.inner.id
    }

    /// Owning session.
    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    /// Current status.
    pub fn status(&self) -> ExecutionStatus {
        self.inner.state.borrow().status
    }

    /// Tick in progress, or the last one run.
    pub fn current_tick(&self) -> u64 {
        self.inner.state.borrow().current_tick
    }

    /// Whether the execution reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Events emitted so far, in order.
    pub fn events(&self) -> Vec<StreamEvent> {
        self.inner.state.borrow().events.clone()
    }

    /// Every event from the start of the execution, ending after the
    /// final `result` event.
    pub fn event_stream(&self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let rx = self.inner.state.subscribe();
        futures::stream::unfold((rx, 0_usize), |(mut rx, next)| async move {
            loop {
                let (event, done) = {
                    let state = rx.borrow_and_update();
                    (state.events.get(next).cloned(), state.result.is_some())
                };
                if let Some(event) = event {
                    return Some((event, (rx, next.saturating_add(1))));
                }
                if done || rx.changed().await.is_err() {
                    return None;
                }
            }
        })
    }

    /// Wait for the execution to finish.
    pub async fn result(&self) -> Result<ExecutionOutput, SessionError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|state| state.result.is_some())
            .await
            .map_err(|e| SessionError::Aborted {
                reason: format!("execution dropped: {e}"),
            })?;
        state.result.clone().unwrap_or_else(|| {
            Err(SessionError::Aborted {
                reason: String::from("execution finished without a result"),
            })
        })
    }

    /// Request cancellation. Observed at the execution's next suspension
    /// point. Returns `true` if this call fired the signal.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        debug!(execution_id = %self.inner.id, reason = %reason, "abort requested");
        self.inner.abort.abort(reason)
    }

    /// The execution's abort signal.
    pub fn abort_signal(&self) -> AbortSignal {
        self.inner.abort.clone()
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        self.inner.state.send_modify(|state| state.events.push(event));
    }

    pub(crate) fn set_tick(&self, tick: u64) {
        self.inner.state.send_modify(|state| state.current_tick = tick);
    }

    /// Record the outcome and the closing `execution_end` and `result`
    /// events, and unlink the abort signal from merged caller signals.
    /// Later calls are ignored.
    pub(crate) fn finish(
        &self,
        ticks: u64,
        usage: Usage,
        result: Result<ExecutionOutput, SessionError>,
    ) {
        self.inner.abort.detach();
        let status = match &result {
            Ok(_) => ExecutionStatus::Completed,
            Err(e) if e.is_abort() => ExecutionStatus::Aborted,
            Err(_) => ExecutionStatus::Failed,
        };
        let id = self.inner.id;
        self.inner.state.send_if_modified(|state| {
            if !state.status.can_transition_to(status) {
                return false;
            }
            state.status = status;
            state.events.push(StreamEvent::ExecutionEnd {
                execution_id: id,
                status,
                ticks,
            });
            let (output, error) = match &result {
                Ok(done) => (done.output.clone(), None),
                Err(e) => (None, Some(e.to_string())),
            };
            state.events.push(StreamEvent::Result {
                execution_id: id,
                output,
                usage,
                error,
            });
            state.result = Some(result);
            true
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn output(handle: &ExecutionHandle) -> ExecutionOutput {
        ExecutionOutput {
            execution_id: handle.id(),
            output: Some(String::from("done")),
            ticks: 1,
            usage: Usage::default(),
        }
    }

    #[tokio::test]
    async fn stream_replays_from_the_start_and_ends_after_result() {
        let handle = ExecutionHandle::new(SessionId::new());
        handle.emit(StreamEvent::TickStart { tick: 1 });
        let stream = handle.event_stream();
        handle.emit(StreamEvent::TickEnd {
            tick: 1,
            stop_reason: None,
            usage: Usage::default(),
        });
        handle.finish(1, Usage::default(), Ok(output(&handle)));

        let names: Vec<&str> = stream.map(|e| e.name()).collect().await;
        assert_eq!(names, vec!["tick_start", "tick_end", "execution_end", "result"]);
        assert_eq!(handle.status(), ExecutionStatus::Completed);
        assert_eq!(handle.result().await.unwrap().output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let handle = ExecutionHandle::new(SessionId::new());
        handle.finish(
            0,
            Usage::default(),
            Err(SessionError::Aborted {
                reason: String::from("stop"),
            }),
        );
        handle.finish(0, Usage::default(), Ok(output(&handle)));

        assert_eq!(handle.status(), ExecutionStatus::Aborted);
        assert!(handle.result().await.unwrap_err().is_abort());
        assert_eq!(handle.events().len(), 2);
    }

    #[tokio::test]
    async fn result_waits_for_finish() {
        let handle = ExecutionHandle::new(SessionId::new());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.result().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        handle.finish(
            2,
            Usage::default(),
            Err(SessionError::Model(crate::error::ModelError::Backend(String::from("503")))),
        );
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "model error: model backend error: 503");
        assert_eq!(handle.status(), ExecutionStatus::Failed);
    }

    #[test]
    fn abort_fires_the_shared_signal_once() {
        let handle = ExecutionHandle::new(SessionId::new());
        let signal = handle.abort_signal();
        assert!(handle.abort("user cancelled"));
        assert!(!handle.clone().abort("again"));
        assert_eq!(signal.reason().as_deref(), Some("user cancelled"));
    }
}
