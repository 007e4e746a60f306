//! Mounting and direct capability dispatch.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use sapling_core::{Capability, Element, ToolError};
use sapling_session::{ScriptedModel, Session, SessionError, SessionOptions};
use sapling_types::{Audience, ContentBlock, SessionId};
use serde_json::{Value, json};

type Calls = Arc<Mutex<Vec<Value>>>;

fn todo_agent(calls: Calls) -> Element {
    Element::from_fn(move |cx| {
        cx.section("role", "You keep the todo list.");
        let added = Arc::clone(&calls);
        cx.capability(
            Capability::new("add_todo", move |input: Value| {
                let added = Arc::clone(&added);
                async move {
                    added.lock().unwrap().push(input);
                    Ok::<_, ToolError>(json!("added"))
                }
            })
            .alias("todo.add")
            .alias("add"),
        );
        cx.capability(Capability::new("echo", |input: Value| async move {
            Ok::<_, ToolError>(input)
        }));
        cx.capability(Capability::new("broken", |_input: Value| async move {
            Err::<Value, _>(ToolError::new("disk full"))
        }));
        cx.capability(
            Capability::new("plan", |_input: Value| async move {
                Ok::<_, ToolError>(json!("planned"))
            })
            .audience(Audience::Model),
        );
        Ok(Vec::new())
    })
}

fn session(calls: &Calls) -> (Session, ScriptedModel) {
    let model = ScriptedModel::default();
    let session = Session::new(
        SessionId::new(),
        todo_agent(Arc::clone(calls)),
        SessionOptions::new(Arc::new(model.clone())),
    );
    (session, model)
}

#[tokio::test]
async fn mounting_twice_registers_once_and_never_calls_the_model() {
    let calls = Calls::default();
    let (session, model) = session(&calls);

    session.mount().await.unwrap();
    let first = session.dispatch("add_todo", json!({"title": "milk"})).await.unwrap();
    session.mount().await.unwrap();
    let second = session.dispatch("add_todo", json!({"title": "eggs"})).await.unwrap();

    assert_eq!(first, second);
    let names: Vec<String> = session
        .capabilities()
        .await
        .into_iter()
        .map(|spec| spec.name)
        .collect();
    assert_eq!(names, vec!["add_todo", "echo", "broken", "plan"]);
    assert_eq!(model.calls(), 0);
    assert_eq!(session.current_tick().await, 0);
    assert!(session.timeline().await.is_empty());
}

#[tokio::test]
async fn every_alias_reaches_the_same_handler() {
    let calls = Calls::default();
    let (session, _model) = session(&calls);

    for name in ["add_todo", "todo.add", "add"] {
        let result = session.dispatch(name, json!({"via": name})).await.unwrap();
        assert_eq!(result, vec![ContentBlock::text("added")]);
    }
    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            json!({"via": "add_todo"}),
            json!({"via": "todo.add"}),
            json!({"via": "add"}),
        ]
    );
}

#[tokio::test]
async fn dispatch_mounts_implicitly() {
    let calls = Calls::default();
    let (session, _model) = session(&calls);
    assert!(session.capabilities().await.is_empty());

    session.dispatch("add", json!({})).await.unwrap();
    assert_eq!(session.capabilities().await.len(), 4);
}

#[tokio::test]
async fn unknown_names_fail_with_the_command_name() {
    let calls = Calls::default();
    let (session, _model) = session(&calls);

    let err = session.dispatch("Add_Todo", json!({})).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::UnknownCommand {
            name: String::from("Add_Todo")
        }
    );
    assert_eq!(err.to_string(), "Unknown command: Add_Todo");

    // Model-only capabilities cannot be dispatched.
    let err = session.dispatch("plan", json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "Unknown command: plan");
}

#[tokio::test]
async fn results_are_normalized() {
    let calls = Calls::default();
    let (session, _model) = session(&calls);

    assert_eq!(
        session.dispatch("echo", json!("x")).await.unwrap(),
        vec![ContentBlock::text("x")]
    );
    assert_eq!(
        session
            .dispatch("echo", json!([{"type": "text", "text": "a"}, "b"]))
            .await
            .unwrap(),
        vec![ContentBlock::text("a"), ContentBlock::text("b")]
    );
    for bad in [Value::Null, json!({"text": "x"}), json!(42)] {
        let err = session.dispatch("echo", bad).await.unwrap_err();
        assert_eq!(err, SessionError::InvalidToolResult);
        assert_eq!(err.to_string(), "Unexpected tool result type");
    }
}

#[tokio::test]
async fn handler_failures_name_the_capability() {
    let calls = Calls::default();
    let (session, _model) = session(&calls);

    let err = session.dispatch("broken", json!({})).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::Tool {
            name: String::from("broken"),
            message: String::from("disk full"),
        }
    );
}
