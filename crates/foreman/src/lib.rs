// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A task runtime that schedules calls across message-passing workers.
//!
//! The runtime accepts calls from application code, admits them against
//! explicit capacity limits, dispatches them to workers, and delivers
//! results or failures back to the caller with well-defined ordering,
//! cancellation, and crash-recovery semantics.
//!
//! # Overview
//!
//! - [`DispatchQueue`] - Per-task admission engine: bounded in-flight and
//!   pending capacity, four overflow policies, a non-suspending pump, and
//!   three-phase cancellation (waiting / queued / in-flight).
//! - [`Pool`] - Executor spreading work across N workers with round-robin
//!   balancing, per-slot bookkeeping, and restart backoff after crashes.
//! - [`Singleton`] - One-worker executor with identical admission and
//!   crash semantics.
//! - [`Foreman`] - The runtime surface: registers tasks, composes
//!   per-call cancellation tokens from keyed signals, timeouts, and
//!   caller-supplied tokens, and snapshots every task's state.
//! - [`Worker`] / [`WorkerFactory`] - The seam to the actual execution
//!   transport. Workers are opaque: a child process, a thread with a
//!   mailbox, anything reachable by message passing.
//! - [`TaskEvent`] / [`EventSink`] - Typed lifecycle events with derived
//!   counters, for observability consumers.
//!
//! # Crash recovery
//!
//! Worker faults are reported through the [`FaultHook`] handed to each
//! worker at spawn. The executor applies the configured [`CrashPolicy`]:
//! fail the crashed worker's in-flight calls, requeue them for a retried
//! attempt, or fail the whole task. Respawns back off exponentially, and
//! consecutive crashes past the configured limit halt the task until it
//! is explicitly started again.
//!
//! # Runtime integration
//!
//! The runtime is executor-agnostic: time comes from a [`tick::Clock`]
//! and background futures are spawned through an [`anyspawn::Spawner`],
//! so it runs unchanged on Tokio or any custom runtime, and tests drive
//! time deterministically with `tick`'s `ClockControl`.

mod call;
mod crash;
mod error;
mod events;
mod executor;
mod pool;
mod queue;
mod registry;
mod singleton;
mod worker;

#[cfg(test)]
mod test_support;

pub use call::*;
pub use crash::{CrashInfo, CrashPolicy};
pub use error::*;
pub use events::{CallLabel, CounterSnapshot, EventSink, TaskCounters, TaskEvent};
pub use executor::*;
pub use pool::*;
pub use queue::*;
pub use registry::*;
pub use singleton::*;
pub use worker::*;
