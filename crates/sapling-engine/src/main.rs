//! Demo binary for the Sapling agent runtime.
//!
//! Wires configuration, logging, the snapshot store, and an inbox around a
//! small todo agent, then walks one session through its whole life.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `sapling-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Build the snapshot store and the inbox
//! 4. Create the demo session and mount it
//! 5. Dispatch a capability by its alias
//! 6. Run a tick that makes the model call a tool
//! 7. Write to the inbox and wait for the drain
//! 8. Hibernate, then resume into a fresh session and tick again
//! 9. Log the result

mod agent;
mod error;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sapling_core::config::{EngineConfig, LogFormat, LoggingConfig};
use sapling_inbox::Inbox;
use sapling_session::{ModelResponse, ScriptedModel, Session, SessionOptions, store};
use sapling_types::{NewInboxMessage, SessionId};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::todo_agent;
use crate::error::EngineError;

/// How long to wait for the inbox drain before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration loading or any session step fails.
#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!(
        max_ticks = config.session.max_ticks,
        max_compile_iterations = config.session.max_compile_iterations,
        snapshot_every_ticks = config.session.snapshot_every_ticks,
        auto_resume = config.session.auto_resume,
        store_backend = ?config.store.backend,
        "sapling-engine starting"
    );

    // 3. Store and inbox.
    let store = store::from_config(&config.store);
    let inbox = Arc::new(Inbox::new());

    // 4. Demo session.
    let model = ScriptedModel::new([
        ModelResponse::tool_use("call-1", "add_todo", json!({"title": "buy eggs"}))
            .with_usage(120, 18),
        ModelResponse::text("Added eggs. You now have milk and eggs on your list.")
            .with_usage(160, 14),
        ModelResponse::text("Noted that the order shipped.").with_usage(180, 9),
    ]);
    let session_id = SessionId::new();
    let options = SessionOptions::new(Arc::new(model.clone()))
        .with_config(config.session.clone())
        .with_store(Arc::clone(&store))
        .with_inbox(Arc::clone(&inbox));
    let session = Session::new(session_id, todo_agent(), options);

    session.mount().await?;
    let capabilities = session.capabilities().await;
    info!(
        session_id = %session_id,
        capabilities = capabilities.len(),
        "session mounted"
    );

    // 5. Dispatch through an alias.
    let blocks = session
        .dispatch("todo.add", json!({"title": "buy milk"}))
        .await?;
    info!(session_id = %session_id, result = ?blocks, "dispatched todo.add");

    // 6. Tick with a tool round-trip.
    let done = session.send("Please add eggs too.").result().await?;
    info!(
        session_id = %session_id,
        execution_id = %done.execution_id,
        ticks = done.ticks,
        output = done.output.as_deref().unwrap_or_default(),
        "execution finished"
    );

    // 7. Inbox write and drain.
    inbox.write(
        session_id,
        NewInboxMessage::dispatch("ops", "todo.add", json!({"title": "call the plumber"})),
    );
    inbox.write(session_id, NewInboxMessage::text("webhook", "Your order shipped."));
    wait_for_drain(&session, &inbox).await?;
    while let Some(handle) = session.current_execution() {
        handle.result().await?;
    }
    info!(
        session_id = %session_id,
        timeline_entries = session.timeline().await.len(),
        "inbox drained"
    );

    // 8. Hibernate and resume.
    let snapshot = session.hibernate().await?;
    info!(
        session_id = %session_id,
        tick = snapshot.tick,
        version = snapshot.version,
        "session hibernated"
    );
    session.close().await;

    let revived_model = ScriptedModel::new([ModelResponse::text(
        "You have milk, eggs, and calling the plumber on your list.",
    )]);
    let revived_options = SessionOptions::new(Arc::new(revived_model))
        .with_config(config.session.clone())
        .with_store(Arc::clone(&store));
    let revived = Session::load(session_id, todo_agent(), revived_options)?.ok_or_else(|| {
        EngineError::Resume {
            message: format!("no snapshot stored for session {session_id}"),
        }
    })?;
    let answer = revived.send("What is on my list?").result().await?;

    // 9. Log the result.
    let usage = revived.usage().await;
    info!(
        session_id = %session_id,
        tick = revived.current_tick().await,
        output = answer.output.as_deref().unwrap_or_default(),
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        model_calls = model.calls(),
        "sapling-engine finished"
    );
    revived.close().await;

    Ok(())
}

/// Load `sapling-config.yaml` from the working directory, falling back to
/// defaults when it is absent.
fn load_config() -> Result<EngineConfig, EngineError> {
    let config_path = Path::new("sapling-config.yaml");
    if config_path.exists() {
        Ok(EngineConfig::from_file(config_path)?)
    } else {
        let mut config = EngineConfig::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

/// Install the tracing subscriber. `RUST_LOG` wins over the configured
/// level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }
}

/// Wait until the session's inbox queue is empty and no drain is running.
async fn wait_for_drain(session: &Session, inbox: &Inbox) -> Result<(), EngineError> {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while !inbox.is_empty(session.id()) || session.is_draining() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if drained.is_err() {
        let pending = inbox.len(session.id());
        warn!(session_id = %session.id(), pending, "inbox drain timed out");
        return Err(EngineError::Inbox {
            message: format!("{pending} entries still pending after {DRAIN_TIMEOUT:?}"),
        });
    }
    Ok(())
}
