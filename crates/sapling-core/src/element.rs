//! Components and the elements that describe a tree.
//!
//! A [`Component`] renders into child [`Element`]s and, through its
//! [`RenderContext`], declares cells and contributes output. An element's
//! type tag is the component's Rust type name; together with the optional
//! key and the parent path it forms the node's identity.

use std::fmt;
use std::sync::Arc;

use sapling_types::CellKind;

use crate::cell::CellError;
use crate::context::RenderContext;

/// Failure raised while rendering a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// A cell could not be read or written.
    #[error(transparent)]
    Cell(#[from] CellError),

    /// A cell key was reused with a different kind.
    #[error("cell \"{key}\" declared as {declared} but stored as {stored}")]
    CellKindMismatch {
        /// Cell key.
        key: String,
        /// Kind requested by this render.
        declared: CellKind,
        /// Kind already stored under the key.
        stored: CellKind,
    },

    /// The same cell key was declared twice in one render.
    #[error("cell \"{key}\" declared twice in one render")]
    DuplicateCell {
        /// Cell key.
        key: String,
    },

    /// The component gave up.
    #[error("{message}")]
    Failed {
        /// Human-readable failure.
        message: String,
    },
}

impl RenderError {
    /// Build a render failure from any message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// A unit of the agent program.
pub trait Component: Send + Sync + 'static {
    /// Declare cells, contribute output, and return children.
    fn render(&self, cx: &mut RenderContext<'_>) -> Result<Vec<Element>, RenderError>;
}

/// A component rendered from a plain function.
pub struct FnComponent<F>(F);

impl<F> Component for FnComponent<F>
where
    F: Fn(&mut RenderContext<'_>) -> Result<Vec<Element>, RenderError> + Send + Sync + 'static,
{
    fn render(&self, cx: &mut RenderContext<'_>) -> Result<Vec<Element>, RenderError> {
        (self.0)(cx)
    }
}

/// A component instance placed in the tree.
#[derive(Clone)]
pub struct Element {
    type_tag: &'static str,
    key: Option<String>,
    component: Arc<dyn Component>,
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("type_tag", &self.type_tag)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Element {
    /// Place `component`, tagged by its type.
    pub fn new<C: Component>(component: C) -> Self {
        Self {
            type_tag: std::any::type_name::<C>(),
            key: None,
            component: Arc::new(component),
        }
    }

    /// Place a function component. Each closure is its own type.
    pub fn from_fn<F>(render: F) -> Self
    where
        F: Fn(&mut RenderContext<'_>) -> Result<Vec<Element>, RenderError> + Send + Sync + 'static,
    {
        Self::new(FnComponent(render))
    }

    /// Give the element a key, distinguishing it among its siblings.
    #[must_use]
    pub fn keyed(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Type tag (the component's type name).
    pub const fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    /// Key, if any.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub(crate) fn component(&self) -> &dyn Component {
        self.component.as_ref()
    }
}
