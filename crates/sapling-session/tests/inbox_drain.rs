//! Draining an attached inbox: ordering, halting on failure, and
//! non-reentrancy.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sapling_core::{Capability, Element, ToolError};
use sapling_inbox::Inbox;
use sapling_session::{ModelResponse, ScriptedModel, Session, SessionError, SessionOptions};
use sapling_types::{MessageId, NewInboxMessage, Role, SessionId};
use serde_json::{Value, json};
use tokio::sync::Semaphore;

type Log = Arc<Mutex<Vec<String>>>;

struct Gate {
    permits: Semaphore,
    entered: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Gate {
    fn closed() -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(0),
            entered: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

fn agent(log: Log, gate: Arc<Gate>) -> Element {
    Element::from_fn(move |cx| {
        let done = Arc::clone(&log);
        cx.capability(Capability::new("record", move |input: Value| {
            let done = Arc::clone(&done);
            async move {
                done.lock().unwrap().push(input["label"].as_str().unwrap_or_default().to_owned());
                Ok::<_, ToolError>(json!("ok"))
            }
        }));
        cx.capability(Capability::new("fail", |_input: Value| async move {
            Err::<Value, _>(ToolError::new("downstream rejected"))
        }));
        let gate = Arc::clone(&gate);
        let slow_log = Arc::clone(&log);
        cx.capability(Capability::new("slow", move |input: Value| {
            let gate = Arc::clone(&gate);
            let slow_log = Arc::clone(&slow_log);
            async move {
                gate.entered.fetch_add(1, Ordering::SeqCst);
                let now = gate.in_flight.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                gate.max_in_flight.fetch_max(now, Ordering::SeqCst);
                gate.permits.acquire().await.unwrap().forget();
                let label = input["label"].as_str().unwrap_or_default().to_owned();
                slow_log.lock().unwrap().push(label);
                gate.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ToolError>(json!("ok"))
            }
        }));
        Ok(Vec::new())
    })
}

struct Fixture {
    session: Session,
    inbox: Arc<Inbox>,
    model: ScriptedModel,
    log: Log,
    gate: Arc<Gate>,
}

fn fixture(responses: Vec<ModelResponse>) -> Fixture {
    let inbox = Arc::new(Inbox::new());
    let model = ScriptedModel::new(responses);
    let log = Log::default();
    let gate = Gate::closed();
    let session = Session::new(
        SessionId::new(),
        agent(Arc::clone(&log), Arc::clone(&gate)),
        SessionOptions::new(Arc::new(model.clone())).with_inbox(Arc::clone(&inbox)),
    );
    Fixture {
        session,
        inbox,
        model,
        log,
        gate,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    assert!(condition(), "condition never became true");
}

async fn settle(session: &Session) {
    while let Some(handle) = session.current_execution() {
        handle.result().await.ok();
    }
}

fn pending_ids(fx: &Fixture) -> Vec<MessageId> {
    fx.inbox
        .pending(fx.session.id())
        .iter()
        .map(|m| m.id)
        .collect()
}

#[tokio::test]
async fn a_failed_entry_halts_the_drain_and_stays_pending() {
    let fx = fixture(Vec::new());
    let id = fx.session.id();
    let fail = fx
        .inbox
        .write(id, NewInboxMessage::dispatch("ops", "fail", json!({})));
    let succeed = fx.inbox.write(
        id,
        NewInboxMessage::dispatch("ops", "record", json!({"label": "succeed"})),
    );

    let report = fx.session.drain_inbox().await.unwrap();
    assert_eq!(report.processed, 0);
    let halt = report.halted.unwrap();
    assert_eq!(halt.message_id, fail);
    assert_eq!(
        halt.error,
        SessionError::Tool {
            name: String::from("fail"),
            message: String::from("downstream rejected"),
        }
    );

    // Drains scheduled by the writes halt at the same entry.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(pending_ids(&fx), vec![fail, succeed]);
    assert!(fx.log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn entries_are_processed_in_write_order() {
    let fx = fixture(vec![ModelResponse::text("got it")]);
    let id = fx.session.id();
    for label in ["a", "b"] {
        fx.inbox.write(
            id,
            NewInboxMessage::dispatch("ops", "record", json!({"label": label})),
        );
    }
    fx.inbox.write(id, NewInboxMessage::text("webhook", "order shipped"));
    fx.inbox.write(
        id,
        NewInboxMessage::dispatch("ops", "record", json!({"label": "c"})),
    );

    wait_until(|| fx.inbox.is_empty(id)).await;
    fx.model.wait_for_calls(1).await;
    settle(&fx.session).await;

    assert_eq!(*fx.log.lock().unwrap(), vec!["a", "b", "c"]);
    let timeline = fx.session.timeline().await;
    let user: Vec<String> = timeline
        .iter()
        .filter(|e| e.role == Role::User)
        .map(|e| e.text())
        .collect();
    assert_eq!(user, vec!["order shipped"]);
    assert_eq!(fx.model.calls(), 1);
}

#[tokio::test]
async fn writes_during_an_active_drain_are_coalesced() {
    let fx = fixture(Vec::new());
    let id = fx.session.id();
    fx.inbox.write(
        id,
        NewInboxMessage::dispatch("ops", "slow", json!({"label": "first"})),
    );
    wait_until(|| fx.gate.entered.load(Ordering::SeqCst) == 1).await;

    // The drain started by the write is parked inside the handler.
    assert!(fx.session.drain_inbox().await.is_none());
    for label in ["second", "third"] {
        fx.inbox.write(
            id,
            NewInboxMessage::dispatch("ops", "slow", json!({"label": label})),
        );
    }
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(fx.gate.entered.load(Ordering::SeqCst), 1);

    fx.gate.permits.add_permits(3);
    wait_until(|| fx.inbox.is_empty(id)).await;
    assert_eq!(*fx.log.lock().unwrap(), vec!["first", "second", "third"]);
    assert_eq!(fx.gate.max_in_flight.load(Ordering::SeqCst), 1);

    wait_until(|| !fx.session.is_draining()).await;
    let report = fx.session.drain_inbox().await.unwrap();
    assert_eq!(report.passes, 1);
    assert_eq!(report.processed, 0);
    assert!(report.halted.is_none());
}

#[tokio::test]
async fn entries_written_before_attach_are_drained_on_attach() {
    let inbox = Arc::new(Inbox::new());
    let id = SessionId::new();
    inbox.write(
        id,
        NewInboxMessage::dispatch("ops", "record", json!({"label": "early"})),
    );

    let log = Log::default();
    let session = Session::new(
        id,
        agent(Arc::clone(&log), Gate::closed()),
        SessionOptions::new(Arc::new(ScriptedModel::default())),
    );
    assert!(session.drain_inbox().await.is_none());
    session.attach_inbox(Arc::clone(&inbox));

    wait_until(|| inbox.is_empty(id)).await;
    assert_eq!(*log.lock().unwrap(), vec!["early"]);
    assert_eq!(inbox.subscriber_count(id), 1);

    session.close().await;
    assert_eq!(inbox.subscriber_count(id), 0);
}

#[tokio::test]
async fn malformed_entries_halt_the_drain() {
    let fx = fixture(Vec::new());
    let id = fx.session.id();
    let bad = fx.inbox.write(
        id,
        NewInboxMessage {
            source: String::from("ops"),
            kind: sapling_types::InboxMessageKind::Dispatch,
            payload: json!({"input": {}}),
        },
    );

    let report = fx.session.drain_inbox().await.unwrap();
    let halt = report.halted.unwrap();
    assert_eq!(halt.message_id, bad);
    assert!(matches!(halt.error, SessionError::InvalidInboxEntry(_)));
    assert_eq!(pending_ids(&fx), vec![bad]);
}
