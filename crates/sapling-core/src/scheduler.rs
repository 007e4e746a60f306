//! Recompile requests.
//!
//! Anything that learns the tree is out of date (a state setter, a resolved
//! data fetch, an after-compile callback) calls [`RecompileHandle::request`]
//! with a human-readable reason. Requests are coalesced: any number of
//! requests made during one pass result in exactly one further pass.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

/// Shared, cloneable handle for requesting a recompile of one tree.
#[derive(Debug, Clone, Default)]
pub struct RecompileHandle {
    inner: Arc<Mutex<Pending>>,
}

#[derive(Debug, Default)]
struct Pending {
    requested: bool,
    reasons: Vec<String>,
}

impl RecompileHandle {
    /// Create a handle with no pending request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request another compile pass.
    pub fn request(&self, reason: impl Into<String>) {
        let reason = reason.into();
        trace!(reason = %reason, "recompile requested");
        let mut pending = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        pending.requested = true;
        pending.reasons.push(reason);
    }

    /// Whether a request is pending.
    pub fn is_requested(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requested
    }

    /// Consume the pending request, returning its reasons.
    ///
    /// Returns `None` when nothing was requested since the last call.
    pub fn take(&self) -> Option<Vec<String>> {
        let mut pending = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.requested {
            return None;
        }
        pending.requested = false;
        Some(std::mem::take(&mut pending.reasons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_coalesce_until_taken() {
        let handle = RecompileHandle::new();
        assert!(handle.take().is_none());

        handle.request("a");
        handle.clone().request("b");
        assert!(handle.is_requested());

        assert_eq!(
            handle.take(),
            Some(vec![String::from("a"), String::from("b")])
        );
        assert!(handle.take().is_none());
        assert!(!handle.is_requested());
    }
}
