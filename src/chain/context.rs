// SPDX-License-Identifier: MIT OR Apache-2.0

//! The context threaded alongside a [`crate::mechanism::Connection`] through
//! every chain element: the postponed context.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/* ---------------------------------------------------------------------------------------------- */

/// Carries the per-request deadline, a small string->string value bag (trace
/// IDs, request source), and a cancellation flag elements can poll before
/// starting expensive or blocking work.
#[derive(Debug, Clone)]
pub struct RequestContext {
    values: HashMap<String, String>,
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Default for RequestContext {
    fn default() -> Self {
        RequestContext::new()
    }
}

impl RequestContext {
    pub fn new() -> RequestContext {
        RequestContext {
            values: HashMap::new(),
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> RequestContext {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> RequestContext {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Derives a context for work that must continue after the caller's own
    /// context has expired or been cancelled (the token stage's background
    /// close-on-disconnect and the resource stage's re-request both need
    /// this). The derived context carries the same values, a fresh
    /// cancellation flag, and a deadline bounded by `bound` from now,
    /// independent of the parent's remaining budget.
    pub fn postpone(&self, bound: Duration) -> RequestContext {
        RequestContext {
            values: self.values.clone(),
            deadline: Some(Instant::now() + bound),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postponed_context_is_independent_of_parent_cancellation() {
        let parent = RequestContext::new().with_value("trace", "abc");
        parent.cancel();

        let child = parent.postpone(Duration::from_secs(5));
        assert!(!child.is_cancelled());
        assert_eq!(child.value("trace"), Some("abc"));
    }

    #[test]
    fn expiry_is_detected_after_deadline_passes() {
        let ctx = RequestContext::new().with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(ctx.is_expired());
    }
}

/* ---------------------------------------------------------------------------------------------- */
