//! The model adapter seam.
//!
//! A session turns each settled [`CompiledOutput`](sapling_types::CompiledOutput)
//! into a [`ModelRequest`] and hands it to a [`ModelAdapter`]. The adapter
//! returns the assistant message, token usage, and a stop reason; capability
//! calls requested by the model come back as tool-use content blocks.
//!
//! Adapters return boxed futures so they can live behind `Arc<dyn _>`.
//! [`ScriptedModel`] replays canned responses and records every request; it
//! backs the tests and the demo binary.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use sapling_types::{CapabilitySpec, ContentBlock, SessionId, StopReason, TimelineEntry, Usage};
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

use crate::error::ModelError;

/// Everything the model sees for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Session making the call.
    pub session_id: SessionId,
    /// Tick the call belongs to.
    pub tick: u64,
    /// Joined instruction sections.
    pub system: String,
    /// Capabilities visible to the model.
    pub tools: Vec<CapabilitySpec>,
    /// Conversation so far: committed timeline, then tree-contributed entries.
    pub messages: Vec<TimelineEntry>,
}

/// What the model answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    /// Assistant message content.
    pub message: Vec<ContentBlock>,
    /// Tokens used by this call.
    pub usage: Usage,
    /// Why generation stopped.
    pub stop_reason: StopReason,
}

impl ModelResponse {
    /// A plain text answer that ends the turn.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message: vec![ContentBlock::text(text)],
            usage: Usage::default(),
            stop_reason: StopReason::EndTurn,
        }
    }

    /// A request to invoke one capability.
    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            message: vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            }],
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
        }
    }

    /// Attach usage figures.
    #[must_use]
    pub const fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Usage {
            input_tokens,
            output_tokens,
        };
        self
    }
}

/// A model backend.
pub trait ModelAdapter: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Produce the next assistant message.
    fn generate(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'static, Result<ModelResponse, ModelError>>;
}

/// Replays a fixed list of responses in order.
///
/// Optionally gated: with [`ScriptedModel::gated`] every call waits for a
/// permit from [`ScriptedModel::release`] before answering. Clones share
/// the script and the request log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedModel {
    inner: Arc<ScriptedInner>,
}

#[derive(Debug, Default)]
struct ScriptedInner {
    responses: Mutex<VecDeque<ModelResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
    called: Notify,
    gate: Option<Semaphore>,
}

impl ScriptedModel {
    /// Answer calls with `responses`, in order.
    pub fn new(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self {
            inner: Arc::new(ScriptedInner {
                responses: Mutex::new(responses.into_iter().collect()),
                ..ScriptedInner::default()
            }),
        }
    }

    /// Like [`new`](Self::new), but each call blocks until released.
    pub fn gated(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self {
            inner: Arc::new(ScriptedInner {
                responses: Mutex::new(responses.into_iter().collect()),
                gate: Some(Semaphore::new(0)),
                ..ScriptedInner::default()
            }),
        }
    }

    /// Let `calls` gated calls proceed.
    pub fn release(&self, calls: usize) {
        if let Some(gate) = self.inner.gate.as_ref() {
            gate.add_permits(calls);
        }
    }

    /// Queue another response.
    pub fn push(&self, response: ModelResponse) {
        self.inner
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls received so far.
    pub fn calls(&self) -> usize {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait until at least `calls` calls have arrived.
    pub async fn wait_for_calls(&self, calls: usize) {
        loop {
            let notified = self.inner.called.notified();
            if self.calls() >= calls {
                return;
            }
            notified.await;
        }
    }
}

impl ModelAdapter for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(
        &self,
        request: ModelRequest,
    ) -> BoxFuture<'static, Result<ModelResponse, ModelError>> {
        let inner = Arc::clone(&self.inner);
        async move {
            let call = {
                let mut requests = inner.requests.lock().unwrap_or_else(PoisonError::into_inner);
                requests.push(request);
                requests.len()
            };
            inner.called.notify_waiters();
            if let Some(gate) = inner.gate.as_ref() {
                gate.acquire()
                    .await
                    .map_err(|e| ModelError::Backend(e.to_string()))?
                    .forget();
            }
            let response = inner
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            debug!(call, answered = response.is_some(), "scripted model call");
            response.ok_or(ModelError::Exhausted { call })
        }
        .boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(tick: u64) -> ModelRequest {
        ModelRequest {
            session_id: SessionId::new(),
            tick,
            system: String::new(),
            tools: Vec::new(),
            messages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_runs_out() {
        let model = ScriptedModel::new([ModelResponse::text("a"), ModelResponse::text("b")]);
        let first = model.generate(request(1)).await.unwrap();
        let second = model.generate(request(2)).await.unwrap();
        assert_eq!(first.message, vec![ContentBlock::text("a")]);
        assert_eq!(second.message, vec![ContentBlock::text("b")]);
        assert_eq!(
            model.generate(request(3)).await.unwrap_err(),
            ModelError::Exhausted { call: 3 }
        );
        let ticks: Vec<u64> = model.requests().iter().map(|r| r.tick).collect();
        assert_eq!(ticks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn gated_calls_wait_for_release() {
        let model = Arc::new(ScriptedModel::gated([ModelResponse::text("late")]));
        let call = {
            let model = Arc::clone(&model);
            tokio::spawn(async move { model.generate(request(1)).await })
        };
        model.wait_for_calls(1).await;
        assert!(!call.is_finished());
        model.release(1);
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }
}
