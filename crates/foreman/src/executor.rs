// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::{CallOptions, CounterSnapshot, CrashInfo, QueueState, Result};

/// When an executor's workers come to life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitMode {
    /// The first dispatch spawns a worker.
    #[default]
    Lazy,
    /// Workers are spawned at executor construction.
    Eager,
}

/// Which kind of executor backs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// A fixed set of worker slots with round-robin dispatch.
    Parallel,
    /// A single worker with serialized dispatch.
    Singleton,
}

/// Point-in-time snapshot of an executor.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct ExecutorState {
    /// Which kind of executor this is.
    pub kind: ExecutorKind,
    /// Configured number of worker slots.
    pub workers_total: usize,
    /// Slots currently holding a running worker.
    pub workers_active: usize,
    /// In-flight call count per slot.
    pub per_worker_in_flight: Vec<usize>,
    /// The queue's observable state.
    pub queue: QueueState,
    /// Metadata of the most recent crash, if any.
    pub last_crash: Option<CrashInfo>,
    /// Whether the task is halted after crash escalation.
    pub halted: bool,
    /// Derived call counters.
    pub counters: CounterSnapshot,
}

/// Common surface of the parallel pool and singleton executors.
///
/// The registry talks to executors exclusively through this trait so that
/// both kinds can back a task interchangeably.
pub trait Executor<A, R>: Send + Sync {
    /// Admits one call and returns a future resolving with its outcome.
    fn dispatch(
        &self,
        method: Arc<str>,
        args: A,
        options: CallOptions,
    ) -> BoxFuture<'static, Result<R>>;

    /// Snapshot of the executor and its queue.
    fn state(&self) -> ExecutorState;

    /// Resumes the queue, clears a halted state, and (for eager tasks)
    /// respawns workers.
    fn start_workers(&self);

    /// Pauses the queue, requeues in-flight work, and tears down workers.
    /// Admission state is preserved; the next `start_workers` picks the
    /// preserved work back up.
    fn stop_workers(&self);

    /// Tears the executor down. Every outstanding call is rejected and
    /// all subsequent dispatches fail.
    fn dispose(&self);
}
