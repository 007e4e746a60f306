//! The demo todo agent.
//!
//! One component holding the todo list in a state cell. It tells the model
//! what is on the list, exposes `add_todo` (alias `todo.add`) and
//! `clear_todos`, and logs messages that arrive while it is running.

use sapling_core::{CallbackError, Capability, Element, ToolError};
use sapling_types::{ContentBlock, QueuedMessage, TickResult, TickState};
use serde_json::{Value, json};
use tracing::info;

/// Instructions given to the model on every tick.
const ROLE: &str = "You keep a todo list for the user. Use add_todo to add items.";

/// Build the root element of the demo agent.
pub fn todo_agent() -> Element {
    Element::from_fn(|cx| {
        let (todos, handle) = cx.use_state("todos", Vec::<String>::new)?;
        cx.section("role", ROLE);
        cx.section("todos", render_list(&todos));

        let add = handle.clone();
        cx.capability(
            Capability::new("add_todo", move |input: Value| {
                let add = add.clone();
                async move {
                    let title = input
                        .get("title")
                        .and_then(Value::as_str)
                        .filter(|t| !t.trim().is_empty())
                        .ok_or_else(|| ToolError::new("add_todo needs a non-empty title"))?
                        .to_owned();
                    add.update(|mut list| {
                        list.push(title.clone());
                        list
                    })
                    .map_err(|e| ToolError::new(e.to_string()))?;
                    Ok::<_, ToolError>(json!(format!("added \"{title}\"")))
                }
            })
            .alias("todo.add")
            .description("Add an item to the todo list.")
            .input_schema(json!({
                "type": "object",
                "properties": {"title": {"type": "string"}},
                "required": ["title"]
            })),
        );

        cx.capability(
            Capability::new("clear_todos", move |_input: Value| {
                let handle = handle.clone();
                async move {
                    handle
                        .set(Vec::new())
                        .map_err(|e| ToolError::new(e.to_string()))?;
                    Ok::<_, ToolError>(json!("cleared"))
                }
            })
            .description("Remove every item from the todo list."),
        );

        cx.on_message("log", |message: QueuedMessage| async move {
            let text: String = message.content.iter().filter_map(ContentBlock::as_text).collect();
            info!(source = %message.source, text = %text, "message arrived mid-execution");
            Ok::<(), CallbackError>(())
        });

        cx.on_tick_end("log", |state: TickState, result: TickResult| async move {
            info!(
                tick = state.tick,
                new_entries = result.new_entries.len(),
                should_continue = result.should_continue,
                "tick finished"
            );
            Ok::<(), CallbackError>(())
        });

        Ok(Vec::new())
    })
}

fn render_list(todos: &[String]) -> String {
    if todos.is_empty() {
        return String::from("The todo list is empty.");
    }
    let items: Vec<String> = todos.iter().map(|t| format!("- {t}")).collect();
    format!("Todo list:\n{}", items.join("\n"))
}
