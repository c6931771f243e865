// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::{CallId, CallRequest, FaultCause, Result};

/// One isolated execution unit reached by message passing.
///
/// The runtime treats workers as opaque: it relays calls by method name,
/// forwards best-effort cancellation, and reacts to fault signals raised
/// by the worker's host. A worker can be a child process, a thread with a
/// mailbox, or a member of a subprocess supervisor; the runtime does not
/// care.
pub trait Worker<A, R>: Send + Sync {
    /// Routes one call to the worker and returns its eventual outcome.
    ///
    /// Errors raised by the worker method surface to the original caller
    /// unchanged.
    fn dispatch(&self, request: Arc<CallRequest<A>>) -> BoxFuture<'static, Result<R>>;

    /// Requests cancellation of one outstanding call. Idempotent and
    /// best-effort; the runtime does not wait for an acknowledgment.
    fn cancel(&self, call_id: CallId);

    /// Tears the worker down. Called once, during deliberate shutdown or
    /// after a crash has been recorded.
    fn terminate(&self);
}

/// Creates workers for executor slots.
pub trait WorkerFactory<A, R>: Send + Sync {
    /// Spawns the worker for `slot` and hands it the fault endpoint its
    /// host must invoke on abnormal termination.
    fn spawn_worker(&self, slot: usize, faults: FaultHook) -> Result<Arc<dyn Worker<A, R>>>;
}

/// The fault-signal endpoint of one worker.
///
/// A worker's host calls [`raise`][Self::raise] when the worker terminates
/// abnormally (an uncaught error, a broken message channel). The executor
/// that created the hook treats the signal as a crash of that worker's
/// slot; signals raised after the slot has been deliberately torn down are
/// ignored.
#[derive(Clone)]
pub struct FaultHook {
    raise: Arc<dyn Fn(FaultCause) + Send + Sync>,
}

impl FaultHook {
    pub(crate) fn new(raise: impl Fn(FaultCause) + Send + Sync + 'static) -> Self {
        Self {
            raise: Arc::new(raise),
        }
    }

    /// Reports an abnormal termination of the worker.
    pub fn raise(&self, cause: FaultCause) {
        (self.raise)(cause);
    }
}

impl fmt::Debug for FaultHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultHook").finish_non_exhaustive()
    }
}
