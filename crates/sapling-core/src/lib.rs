//! State cells, reconciliation, lifecycle notification, and hydration for
//! the Sapling agent runtime.
//!
//! An agent program is a tree of [`Component`]s. Each compile pass renders
//! the tree, diffs it against the live node arena, and produces a
//! [`CompiledOutput`](sapling_types::CompiledOutput) (instructions,
//! capabilities, conversation entries) for the model layer. Per-node state
//! lives in keyed cells that persist across passes, ticks, and, through
//! serialization, process restarts.
//!
//! # Modules
//!
//! - [`abort`] -- Cooperative cancellation signal.
//! - [`capability`] -- [`Capability`] declarations and their registry.
//! - [`cell`] -- Cell storage, [`StateHandle`] and [`RefHandle`].
//! - [`config`] -- Configuration loading from `sapling-config.yaml`.
//! - [`context`] -- [`RenderContext`]: cell hooks, output, lifecycle
//!   registration.
//! - [`data`] -- Per-session [`DataCache`] behind data cells.
//! - [`element`] -- [`Component`] trait and [`Element`].
//! - [`hydrate`] -- Tree serialization and hydration.
//! - [`lifecycle`] -- Tick-start (with catch-up), tick-end, after-compile,
//!   and message callbacks.
//! - [`reconciler`] -- The compile pass and the stabilization loop.
//! - [`scheduler`] -- Coalesced recompile requests.
//! - [`signal`] -- Reactive [`Signal`] and [`Computed`] values.
//! - [`tree`] -- Node paths.
//!
//! [`Capability`]: capability::Capability
//! [`StateHandle`]: cell::StateHandle
//! [`RefHandle`]: cell::RefHandle
//! [`RenderContext`]: context::RenderContext
//! [`DataCache`]: data::DataCache
//! [`Component`]: element::Component
//! [`Element`]: element::Element
//! [`Signal`]: signal::Signal
//! [`Computed`]: signal::Computed

pub mod abort;
pub mod capability;
pub mod cell;
pub mod config;
pub mod context;
pub mod data;
pub mod element;
pub mod hydrate;
pub mod lifecycle;
pub mod reconciler;
pub mod scheduler;
pub mod signal;
pub mod tree;

pub use abort::{AbortSignal, Aborted};
pub use capability::{Capability, CapabilityRegistry, ToolError};
pub use cell::{CellError, Cleanup, Deps, RefHandle, StateHandle};
pub use context::RenderContext;
pub use data::{CachedData, DataCache, FetchError, Invalidation};
pub use element::{Component, Element, RenderError};
pub use lifecycle::{
    AfterCompileInfo, CallbackError, LifecycleError, LifecycleNotifier, LifecyclePhase,
    MessageConsumers,
};
pub use reconciler::{CompileError, CompileReport, Compiled, Reconciler};
pub use scheduler::RecompileHandle;
pub use signal::{Computed, Signal, SubscriptionId};

/// Build a dependency list from serializable values.
///
/// ```
/// let count = 3;
/// let deps = sapling_core::deps![count, "label"];
/// assert_eq!(deps.len(), 2);
/// ```
#[macro_export]
macro_rules! deps {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::cell::dep(&$value)),*]
    };
}
