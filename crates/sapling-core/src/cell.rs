//! Per-node cell storage and the handles components use to touch it.
//!
//! Cells are addressed by an explicit string key within their node, so a
//! component may declare them conditionally or in any order. Values of
//! state and memo cells are stored in their serialized form
//! ([`serde_json::Value`]); that gives value-equality for free and makes
//! them trivially snapshotable. Ref and signal cells keep their typed
//! value and carry a snapshot closure instead.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use sapling_types::CellKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::scheduler::RecompileHandle;

/// A dependency list. Compared elementwise by value.
pub type Deps = Vec<Value>;

/// Cleanup returned by an effect; runs before the next run or on unmount.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Errors raised while encoding or decoding cell values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    /// The value could not be serialized.
    #[error("failed to encode cell value: {message}")]
    Encode {
        /// Serializer error text.
        message: String,
    },

    /// The stored value does not match the requested type.
    #[error("failed to decode cell value: {message}")]
    Decode {
        /// Deserializer error text.
        message: String,
    },
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value, CellError> {
    serde_json::to_value(value).map_err(|e| CellError::Encode {
        message: e.to_string(),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, CellError> {
    serde_json::from_value(value).map_err(|e| CellError::Decode {
        message: e.to_string(),
    })
}

/// Serialize one dependency value. Unserializable values become `null`.
pub fn dep<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Whether an effect or memo with `next` deps must re-run given `prev`.
///
/// `next == None` means "no dependency list": always re-run.
pub fn deps_changed(prev: Option<&[Value]>, next: Option<&[Value]>) -> bool {
    match (prev, next) {
        (_, None) | (None, Some(_)) => true,
        (Some(prev), Some(next)) => prev != next,
    }
}

/// Setter (and getter) for a state cell.
///
/// Cloneable and `Send`, so it can be moved into effects and capability
/// handlers. Setting a value equal to the current one is a no-op; any other
/// value requests a recompile of the owning tree.
pub struct StateHandle<T> {
    cell: Arc<Mutex<Value>>,
    recompile: RecompileHandle,
    label: Arc<str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for StateHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            recompile: self.recompile.clone(),
            label: Arc::clone(&self.label),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for StateHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl<T: Serialize + DeserializeOwned> StateHandle<T> {
    pub(crate) fn new(cell: Arc<Mutex<Value>>, recompile: RecompileHandle, label: &str) -> Self {
        Self {
            cell,
            recompile,
            label: Arc::from(label),
            _marker: PhantomData,
        }
    }

    /// Read the current value.
    pub fn get(&self) -> Result<T, CellError> {
        let value = self
            .cell
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        decode(value)
    }

    /// Replace the value. Returns whether it changed.
    pub fn set(&self, value: T) -> Result<bool, CellError> {
        let encoded = encode(&value)?;
        self.store(encoded)
    }

    /// Apply `f` to a copy of the current value and store the result.
    /// Returns whether it changed.
    ///
    /// The cell is not locked while `f` runs, so `f` may read this handle.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> Result<bool, CellError> {
        let next = f(self.get()?);
        self.set(next)
    }

    fn store(&self, encoded: Value) -> Result<bool, CellError> {
        {
            let mut slot = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
            if *slot == encoded {
                return Ok(false);
            }
            *slot = encoded;
        }
        self.recompile
            .request(format!("state {} changed", self.label));
        Ok(true)
    }
}

/// A mutable box that survives across passes. Mutation never triggers a
/// recompile.
pub struct RefHandle<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for RefHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for RefHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefHandle").finish_non_exhaustive()
    }
}

impl<T> RefHandle<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Replace the boxed value.
    pub fn set(&self, value: T) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Run `f` with mutable access to the boxed value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<T: Serialize> RefHandle<T> {
    pub(crate) fn snapshot(&self) -> Option<Value> {
        serde_json::to_value(&*self.inner.lock().unwrap_or_else(PoisonError::into_inner)).ok()
    }
}

impl<T: Clone> RefHandle<T> {
    /// Clone the boxed value out.
    pub fn get(&self) -> T {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Type-erased cell holding a typed handle plus a way to snapshot it.
pub(crate) struct TypedCell {
    pub(crate) handle: Arc<dyn Any + Send + Sync>,
    pub(crate) snapshot: Arc<dyn Fn() -> Option<Value> + Send + Sync>,
}

/// Effect bookkeeping kept between passes.
pub(crate) struct EffectSlot {
    pub(crate) deps: Option<Deps>,
    pub(crate) mounted: bool,
    pub(crate) cleanup: Option<Cleanup>,
}

/// Storage for one cell.
pub(crate) enum CellSlot {
    State(Arc<Mutex<Value>>),
    Memo { value: Value, deps: Deps },
    Ref(TypedCell),
    Effect(EffectSlot),
    Data { key: String },
    Signal(TypedCell),
}

impl CellSlot {
    pub(crate) const fn kind(&self) -> CellKind {
        match self {
            Self::State(_) => CellKind::State,
            Self::Memo { .. } => CellKind::Memo,
            Self::Ref(_) => CellKind::Ref,
            Self::Effect(_) => CellKind::Effect,
            Self::Data { .. } => CellKind::Data,
            Self::Signal(_) => CellKind::Signal,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn handle(initial: i64) -> (StateHandle<i64>, RecompileHandle) {
        let recompile = RecompileHandle::new();
        let cell = Arc::new(Mutex::new(encode(&initial).unwrap()));
        (
            StateHandle::new(cell, recompile.clone(), "root:count"),
            recompile,
        )
    }

    #[test]
    fn equal_set_is_a_no_op() {
        let (state, recompile) = handle(5);
        assert!(!state.set(5).unwrap());
        assert!(recompile.take().is_none());
    }

    #[test]
    fn unequal_set_requests_recompile() {
        let (state, recompile) = handle(5);
        assert!(state.set(6).unwrap());
        assert_eq!(state.get().unwrap(), 6);
        assert_eq!(
            recompile.take(),
            Some(vec![String::from("state root:count changed")])
        );
    }

    #[test]
    fn update_applies_function() {
        let (state, recompile) = handle(1);
        assert!(state.update(|n| n + 1).unwrap());
        assert_eq!(state.get().unwrap(), 2);
        assert!(recompile.take().is_some());
        assert!(!state.update(|n| n).unwrap());
    }

    #[test]
    fn update_closure_can_read_the_same_handle() {
        let (state, recompile) = handle(3);
        let reader = state.clone();
        assert!(
            state
                .update(|n| n.saturating_add(reader.get().unwrap()))
                .unwrap()
        );
        assert_eq!(state.get().unwrap(), 6);
        assert!(recompile.take().is_some());
    }

    #[test]
    fn deps_comparison_is_elementwise() {
        let a = vec![serde_json::json!(1), serde_json::json!("x")];
        let b = vec![serde_json::json!(1), serde_json::json!("x")];
        let c = vec![serde_json::json!(1)];
        assert!(!deps_changed(Some(a.as_slice()), Some(b.as_slice())));
        assert!(deps_changed(Some(a.as_slice()), Some(c.as_slice())));
        assert!(deps_changed(None, Some(a.as_slice())));
        assert!(deps_changed(Some(a.as_slice()), None));
    }

    #[test]
    fn ref_mutation_is_silent() {
        let r = RefHandle::new(vec![1_u8]);
        r.with_mut(|v| v.push(2));
        assert_eq!(r.get(), vec![1, 2]);
        r.set(Vec::new());
        assert!(r.get().is_empty());
    }
}
