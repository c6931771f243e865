// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ripcord::AbortToken;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TASK_ORDINAL: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one dispatched call.
///
/// Used for worker-side correlation: the same id travels with the
/// dispatch, with a best-effort `cancel`, and in executor bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Identifies one registered task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(Arc<str>);

impl TaskId {
    /// Creates an id from a caller-supplied string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh process-unique id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Arc::from(format!(
            "task-{}",
            NEXT_TASK_ORDINAL.fetch_add(1, Ordering::Relaxed)
        )))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One call as relayed to a worker.
///
/// The args shape is opaque to the runtime; only the worker interprets it.
#[derive(Debug)]
pub struct CallRequest<A> {
    /// Correlation id for this call.
    pub call_id: CallId,
    /// The worker method to route to.
    pub method: Arc<str>,
    /// The arguments, relayed untouched.
    pub args: A,
    /// The cancellation key derived for this call, if any.
    pub key: Option<Arc<str>>,

    // Held for cancel forwarding while the call is on a worker; workers
    // observe cancellation through `cancel(call_id)`, not through this.
    pub(crate) abort: Option<AbortToken>,
}

/// Per-dispatch options accepted by an executor.
#[derive(Debug, Default)]
pub struct CallOptions {
    /// Cancellation token composed for this call.
    pub abort: Option<AbortToken>,
    /// Cancellation key derived from the arguments, if any.
    pub key: Option<Arc<str>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_unique_and_ordered() {
        let a = CallId::next();
        let b = CallId::next();
        assert!(a < b);
    }

    #[test]
    fn generated_task_ids_differ() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn task_id_displays_its_string() {
        assert_eq!(TaskId::new("resize").to_string(), "resize");
    }
}
