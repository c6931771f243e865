// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{AbortPhase, Error, QueueState};

/// Lifecycle callbacks of a [`DispatchQueue`][crate::DispatchQueue].
///
/// Each hook is an optional function field; the queue calls each if
/// present, after its own state transition has completed and its lock has
/// been released. Absent hooks cost nothing and never affect behavior.
pub struct QueueHooks<T> {
    /// An entry was admitted into Pending (including requeues).
    pub on_queued: Option<Box<dyn Fn(&Arc<T>) + Send + Sync>>,
    /// An entry was handed to the run function; carries the queue wait.
    pub on_dispatch: Option<Box<dyn Fn(&Arc<T>, Duration) + Send + Sync>>,
    /// An entry was refused, displaced, crashed out, or disposed.
    pub on_reject: Option<Box<dyn Fn(&Arc<T>, &Error) + Send + Sync>>,
    /// An entry's cancellation token fired; carries the phase.
    pub on_cancel: Option<Box<dyn Fn(&Arc<T>, AbortPhase) + Send + Sync>>,
    /// The observable counters changed.
    pub on_state_change: Option<Box<dyn Fn(&QueueState) + Send + Sync>>,
    /// The queue transitioned to having no work at all.
    pub on_idle: Option<Box<dyn Fn() + Send + Sync>>,
    /// The queue transitioned from idle to having work.
    pub on_active: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<T> Default for QueueHooks<T> {
    fn default() -> Self {
        Self {
            on_queued: None,
            on_dispatch: None,
            on_reject: None,
            on_cancel: None,
            on_state_change: None,
            on_idle: None,
            on_active: None,
        }
    }
}

impl<T> fmt::Debug for QueueHooks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHooks")
            .field("on_queued", &self.on_queued.is_some())
            .field("on_dispatch", &self.on_dispatch.is_some())
            .field("on_reject", &self.on_reject.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_idle", &self.on_idle.is_some())
            .field("on_active", &self.on_active.is_some())
            .finish()
    }
}
