// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, SystemTime};

use crate::worker::WorkerHandle;
use crate::FaultCause;

/// How an executor responds to a worker crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrashPolicy {
    /// Reject the crashed worker's in-flight calls with
    /// [`Error::WorkerCrashed`][crate::Error::WorkerCrashed] and respawn
    /// the worker after backoff. Pending calls are preserved.
    #[default]
    RestartFailInFlight,

    /// Requeue the crashed worker's in-flight calls at the head of
    /// Pending and respawn the worker after backoff. The calls complete
    /// with the outcome of their retried attempt.
    RestartRequeueInFlight,

    /// Reject every outstanding call, terminate all workers, and halt the
    /// task until `start_workers` is called.
    FailTask,
}

/// Metadata of the most recent crash, exposed through state snapshots.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct CrashInfo {
    /// The slot whose worker crashed.
    pub slot: usize,
    /// What the worker's host reported.
    pub cause: FaultCause,
    /// When the crash was recorded.
    pub at: SystemTime,
}

/// Per-slot restart delay: 100 ms, doubling per consecutive crash, capped
/// at 2,000 ms. Reset by any successful dispatch on the slot.
#[derive(Debug)]
pub(crate) struct RestartBackoff {
    next: Duration,
}

impl RestartBackoff {
    const FIRST: Duration = Duration::from_millis(100);
    const CAP: Duration = Duration::from_millis(2_000);

    pub(crate) fn new() -> Self {
        Self { next: Self::FIRST }
    }

    /// The delay to apply before the next respawn attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(Self::CAP);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.next = Self::FIRST;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotLifecycle {
    /// No worker; the next dispatch spawns one lazily.
    Stopped,
    /// A spawn is underway outside the executor lock.
    Starting,
    /// A worker is installed and accepting dispatches.
    Running,
    /// The worker crashed; a restart timer is pending.
    Backoff,
}

/// One position in an executor, owning at most one worker.
pub(crate) struct Slot<A, R> {
    pub(crate) handle: Option<WorkerHandle<A, R>>,
    pub(crate) lifecycle: SlotLifecycle,
    pub(crate) in_flight: usize,
    pub(crate) backoff: RestartBackoff,
    /// Bumped on every spawn and teardown; fault signals and restart
    /// timers carrying a stale epoch are ignored.
    pub(crate) epoch: u64,
}

impl<A, R> Slot<A, R> {
    pub(crate) fn new() -> Self {
        Self {
            handle: None,
            lifecycle: SlotLifecycle::Stopped,
            in_flight: 0,
            backoff: RestartBackoff::new(),
            epoch: 0,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lifecycle == SlotLifecycle::Running
    }

    /// Deliberate teardown: detach the fault listener (epoch bump),
    /// terminate the worker, mark the slot stopped. Returns whether a
    /// worker was actually terminated.
    pub(crate) fn teardown(&mut self) -> bool {
        self.epoch += 1;
        self.lifecycle = SlotLifecycle::Stopped;
        self.in_flight = 0;
        match self.handle.take() {
            Some(handle) => {
                handle.terminate();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut backoff = RestartBackoff::new();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, [100, 200, 400, 800, 1_600, 2_000, 2_000]);
    }

    #[test]
    fn backoff_reset_returns_to_the_first_delay() {
        let mut backoff = RestartBackoff::new();
        _ = backoff.next_delay();
        _ = backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn teardown_without_a_worker_reports_nothing_terminated() {
        let mut slot = Slot::<(), ()>::new();
        let epoch = slot.epoch;

        assert!(!slot.teardown());
        assert_eq!(slot.lifecycle, SlotLifecycle::Stopped);
        assert!(slot.epoch > epoch);
    }
}
