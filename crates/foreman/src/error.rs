// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::TaskId;

/// A specialized `Result` type for task runtime operations that return a
/// task runtime [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error delivered to the caller of a task dispatch.
///
/// This is an umbrella type for every way a call can fail inside the
/// runtime. Errors raised by the worker method itself pass through
/// unchanged as [`User`][Error::User]; everything else originates in the
/// queue or the executor. The type is cheap to clone because a single
/// failure (a crash, a disposal) is delivered to many callers at once.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The call's cancellation token fired. Carries the phase the call
    /// occupied at that moment.
    #[error("call aborted while {0}")]
    Aborted(AbortPhase),

    /// The call was refused or displaced by the queue's overflow policy.
    #[error("call dropped by the {0} overflow policy")]
    Dropped(OverflowPolicy),

    /// The task (or its queue) was torn down while the call was
    /// outstanding, or before it was accepted.
    #[error("the task has been disposed")]
    Disposed,

    /// The worker hosting this call terminated abnormally.
    #[error("worker {slot} of task {task} crashed: {cause}")]
    WorkerCrashed {
        /// The task whose worker crashed.
        task: TaskId,
        /// The pool slot the worker occupied.
        slot: usize,
        /// What the worker's host reported.
        cause: FaultCause,
    },

    /// Every pool slot is in restart backoff and none became available in
    /// time to take the call.
    #[error("no worker available to execute the call")]
    NoWorkers,

    /// An error raised by the worker method, forwarded unchanged.
    #[error(transparent)]
    User(#[from] Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error as a worker-method failure.
    pub fn user(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::User(Arc::new(error))
    }
}

/// The phase a call occupied when its cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortPhase {
    /// Waiting for a pending permit (block policy only).
    Waiting,
    /// Admitted and awaiting dispatch.
    Queued,
    /// Executing on a worker.
    InFlight,
}

impl fmt::Display for AbortPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Waiting => "waiting",
            Self::Queued => "queued",
            Self::InFlight => "in flight",
        })
    }
}

/// What a full queue does with the call that does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Suspend the caller until capacity frees up.
    Block,
    /// Refuse the new call.
    Reject,
    /// Refuse the new call; the variant only changes the reported reason.
    DropLatest,
    /// Displace the oldest pending call and admit the new one.
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Block => "block",
            Self::Reject => "reject",
            Self::DropLatest => "drop-latest",
            Self::DropOldest => "drop-oldest",
        })
    }
}

/// What a worker's host reported when the worker terminated abnormally.
///
/// The cause is reduced to a message so that crash errors stay cheap to
/// clone and comparable in snapshots; the full upstream error belongs to
/// the transport layer that raised the fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultCause {
    message: Arc<str>,
}

impl FaultCause {
    /// Creates a cause from a message.
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Creates a cause from an arbitrary error's rendering.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(error.to_string())
    }

    /// The reported message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Error: Send, Sync, Clone);
        static_assertions::assert_impl_all!(FaultCause: Send, Sync, Clone);
    }

    #[test]
    fn user_error_passes_through_display() {
        let error = Error::user(std::io::Error::other("disk on fire"));
        assert_eq!(error.to_string(), "disk on fire");
    }

    #[test]
    fn crash_error_renders_task_slot_and_cause() {
        let error = Error::WorkerCrashed {
            task: TaskId::new("thumbnails"),
            slot: 2,
            cause: FaultCause::new("segfault"),
        };
        assert_eq!(
            error.to_string(),
            "worker 2 of task thumbnails crashed: segfault"
        );
    }

    #[test]
    fn phases_and_policies_render_in_kebab_case() {
        assert_eq!(AbortPhase::InFlight.to_string(), "in flight");
        assert_eq!(OverflowPolicy::DropOldest.to_string(), "drop-oldest");
    }
}
