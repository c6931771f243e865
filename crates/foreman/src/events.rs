// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::Level;

use crate::{AbortPhase, CallId, CallRequest, Error, FaultCause, QueueState, TaskId};

/// Identifying metadata of one call, carried by events instead of the
/// (generically typed) arguments.
#[derive(Debug, Clone)]
pub struct CallLabel {
    /// Correlation id of the call.
    pub call_id: CallId,
    /// The worker method the call targets.
    pub method: Arc<str>,
}

impl CallLabel {
    pub(crate) fn of<A>(request: &CallRequest<A>) -> Self {
        Self {
            call_id: request.call_id,
            method: Arc::clone(&request.method),
        }
    }
}

/// Lifecycle events emitted by a task's executor.
///
/// Consumers subscribe through an [`EventSink`] at task registration;
/// emission order matches the program order of the underlying transitions,
/// and the runtime never depends on a consumer being attached.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TaskEvent {
    /// A call was admitted into the queue (including requeues).
    Queued { task: TaskId, call: CallLabel },
    /// A call was handed to a worker; carries the time spent queued.
    Dispatched {
        task: TaskId,
        call: CallLabel,
        queue_wait: Duration,
    },
    /// A call was refused, displaced, crashed out, or disposed.
    Rejected {
        task: TaskId,
        call: CallLabel,
        error: Error,
    },
    /// A call's cancellation token fired in the given phase.
    Canceled {
        task: TaskId,
        call: CallLabel,
        phase: AbortPhase,
    },
    /// The queue's observable counters changed.
    StateChanged { task: TaskId, queue: QueueState },
    /// The queue ran out of work.
    Idle { task: TaskId },
    /// The queue went from idle to having work.
    Active { task: TaskId },
    /// A worker was installed into a slot.
    WorkerSpawned { task: TaskId, slot: usize },
    /// A worker was deliberately torn down.
    WorkerTerminated { task: TaskId, slot: usize },
    /// A worker terminated abnormally.
    WorkerCrashed {
        task: TaskId,
        slot: usize,
        cause: FaultCause,
    },
}

/// Callback receiving every [`TaskEvent`] of one task.
pub type EventSink = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Counters derived from the event stream, exposed through state
/// snapshots.
#[derive(Debug, Default)]
pub struct TaskCounters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
}

impl TaskCounters {
    /// Point-in-time view of the counters.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a task's derived counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CounterSnapshot {
    /// Calls handed to a worker (retries count again).
    pub dispatched: u64,
    /// Calls that resolved with a value.
    pub succeeded: u64,
    /// Calls that failed with a worker error or a crash.
    pub failed: u64,
    /// Calls cancelled in any phase.
    pub canceled: u64,
    /// Calls refused, displaced, or disposed.
    pub rejected: u64,
    /// Calls moved back to Pending by crash recovery or a worker stop.
    pub requeued: u64,
}

/// Per-task emission point: fans events out to the optional sink, records
/// the derived counters, and writes the tracing records that accompany
/// lifecycle decisions.
#[derive(Clone)]
pub(crate) struct Events {
    task: TaskId,
    sink: Option<EventSink>,
    counters: Arc<TaskCounters>,
}

impl Events {
    pub(crate) fn new(task: TaskId, sink: Option<EventSink>) -> Self {
        Self {
            task,
            sink,
            counters: Arc::new(TaskCounters::default()),
        }
    }

    pub(crate) fn task(&self) -> &TaskId {
        &self.task
    }

    pub(crate) fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    fn send(&self, event: &TaskEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    pub(crate) fn queued(&self, call: CallLabel) {
        self.send(&TaskEvent::Queued {
            task: self.task.clone(),
            call,
        });
    }

    pub(crate) fn dispatched(&self, call: CallLabel, queue_wait: Duration) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.send(&TaskEvent::Dispatched {
            task: self.task.clone(),
            call,
            queue_wait,
        });
    }

    pub(crate) fn rejected(&self, call: CallLabel, error: &Error) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        self.send(&TaskEvent::Rejected {
            task: self.task.clone(),
            call,
            error: error.clone(),
        });
    }

    pub(crate) fn canceled(&self, call: CallLabel, phase: AbortPhase) {
        self.counters.canceled.fetch_add(1, Ordering::Relaxed);
        self.send(&TaskEvent::Canceled {
            task: self.task.clone(),
            call,
            phase,
        });
    }

    pub(crate) fn state_changed(&self, queue: QueueState) {
        self.send(&TaskEvent::StateChanged {
            task: self.task.clone(),
            queue,
        });
    }

    pub(crate) fn idle(&self) {
        self.send(&TaskEvent::Idle {
            task: self.task.clone(),
        });
    }

    pub(crate) fn active(&self) {
        self.send(&TaskEvent::Active {
            task: self.task.clone(),
        });
    }

    pub(crate) fn call_succeeded(&self) {
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn call_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn requeued(&self, count: usize) {
        self.counters
            .requeued
            .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub(crate) fn worker_spawned(&self, slot: usize) {
        tracing::event!(Level::DEBUG, task = %self.task, slot, "worker spawned");
        self.send(&TaskEvent::WorkerSpawned {
            task: self.task.clone(),
            slot,
        });
    }

    pub(crate) fn worker_terminated(&self, slot: usize) {
        tracing::event!(Level::DEBUG, task = %self.task, slot, "worker terminated");
        self.send(&TaskEvent::WorkerTerminated {
            task: self.task.clone(),
            slot,
        });
    }

    pub(crate) fn worker_crashed(&self, slot: usize, cause: &FaultCause) {
        tracing::event!(Level::WARN, task = %self.task, slot, %cause, "worker crashed");
        self.send(&TaskEvent::WorkerCrashed {
            task: self.task.clone(),
            slot,
            cause: cause.clone(),
        });
    }

    pub(crate) fn restart_scheduled(&self, slot: usize, delay: Duration) {
        tracing::event!(
            Level::DEBUG,
            task = %self.task,
            slot,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "worker restart scheduled"
        );
    }

    pub(crate) fn halted(&self) {
        tracing::event!(Level::WARN, task = %self.task, "task halted after crash escalation");
    }
}
