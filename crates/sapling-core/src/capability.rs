//! Capabilities declared by the tree.
//!
//! A component contributes a [`Capability`] during render; the compile pass
//! collects them into a [`CapabilityRegistry`] that the session uses for
//! direct dispatch and for resolving model tool calls. Lookup is by exact,
//! case-sensitive name or by any declared alias.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use sapling_types::{Audience, CapabilitySpec};
use serde_json::Value;
use tracing::warn;

/// Failure raised by a capability handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    /// Human-readable failure.
    pub message: String,
}

impl ToolError {
    /// Build a tool error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Type-erased async handler.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

/// A named, invocable capability.
#[derive(Clone)]
pub struct Capability {
    name: String,
    aliases: Vec<String>,
    audience: Audience,
    description: String,
    input_schema: Value,
    handler: Handler,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl Capability {
    /// Declare a capability backed by an async `handler`.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            audience: Audience::All,
            description: String::new(),
            input_schema: Value::Object(serde_json::Map::new()),
            handler: Arc::new(move |input| handler(input).boxed()),
        }
    }

    /// Add an alternative name.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Restrict who may see the capability.
    #[must_use]
    pub const fn audience(mut self, audience: Audience) -> Self {
        self.audience = audience;
        self
    }

    /// Describe the capability for the model.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the JSON schema of the input.
    #[must_use]
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Canonical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared aliases.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Whether `name` is the canonical name or an alias.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }

    /// Whether the model may see and call this capability.
    pub const fn visible_to_model(&self) -> bool {
        self.audience.visible_to_model()
    }

    /// Whether users may dispatch this capability directly.
    pub const fn dispatchable(&self) -> bool {
        !matches!(self.audience, Audience::Model)
    }

    /// Run the handler.
    pub fn invoke(&self, input: Value) -> BoxFuture<'static, Result<Value, ToolError>> {
        (self.handler)(input)
    }

    /// Data description of this capability.
    pub fn spec(&self) -> CapabilitySpec {
        CapabilitySpec {
            name: self.name.clone(),
            aliases: self.aliases.clone(),
            audience: self.audience,
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// Capabilities from one compile pass, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: Vec<Capability>,
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability. Names and aliases already taken are rejected.
    ///
    /// Returns whether the capability was added.
    pub fn register(&mut self, capability: Capability) -> bool {
        let taken = std::iter::once(capability.name())
            .chain(capability.aliases().iter().map(String::as_str))
            .find(|n| self.index.contains_key(*n))
            .map(str::to_owned);
        if let Some(name) = taken {
            warn!(
                capability = capability.name(),
                conflict = %name,
                "capability name already registered; ignoring duplicate"
            );
            return false;
        }
        let position = self.entries.len();
        self.index.insert(capability.name().to_owned(), position);
        for alias in capability.aliases() {
            self.index.insert(alias.clone(), position);
        }
        self.entries.push(capability);
        true
    }

    /// Look up by exact name or alias.
    pub fn resolve(&self, name: &str) -> Option<&Capability> {
        self.index.get(name).and_then(|&i| self.entries.get(i))
    }

    /// Specs of every capability, in declaration order.
    pub fn specs(&self) -> Vec<CapabilitySpec> {
        self.entries.iter().map(Capability::spec).collect()
    }

    /// Canonical names, in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(Capability::name).collect()
    }

    /// Number of capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no capability is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo(name: &str) -> Capability {
        Capability::new(name, |input| async move { Ok(input) })
    }

    #[tokio::test]
    async fn resolves_by_name_and_alias() {
        let mut registry = CapabilityRegistry::new();
        assert!(registry.register(echo("add_todo").alias("add").alias("todo.add")));

        let by_name = registry.resolve("add_todo").unwrap();
        let by_alias = registry.resolve("todo.add").unwrap();
        assert_eq!(by_name.name(), by_alias.name());
        assert!(registry.resolve("ADD").is_none());

        let out = by_alias.invoke(json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[test]
    fn conflicting_names_are_rejected() {
        let mut registry = CapabilityRegistry::new();
        assert!(registry.register(echo("a").alias("b")));
        assert!(!registry.register(echo("b")));
        assert!(!registry.register(echo("c").alias("a")));
        assert_eq!(registry.names(), vec!["a"]);
    }

    #[test]
    fn spec_carries_metadata() {
        let spec = echo("search")
            .audience(Audience::Model)
            .description("find things")
            .input_schema(json!({"type": "object"}))
            .spec();
        assert_eq!(spec.audience, Audience::Model);
        assert_eq!(spec.description, "find things");
        assert_eq!(spec.input_schema, json!({"type": "object"}));
    }
}
