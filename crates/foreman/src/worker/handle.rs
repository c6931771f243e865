// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Worker;

/// Owns one worker instance for the lifetime of its slot.
///
/// The `terminating` flag records a deliberate shutdown so that a fault
/// signal raised while the worker is being torn down is not mistaken for a
/// crash, and so the underlying worker is terminated at most once.
pub(crate) struct WorkerHandle<A, R> {
    worker: Arc<dyn Worker<A, R>>,
    terminating: AtomicBool,
}

impl<A, R> WorkerHandle<A, R> {
    pub(crate) fn new(worker: Arc<dyn Worker<A, R>>) -> Self {
        Self {
            worker,
            terminating: AtomicBool::new(false),
        }
    }

    pub(crate) fn worker(&self) -> &Arc<dyn Worker<A, R>> {
        &self.worker
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }

    /// Terminates the worker. Safe to call multiple times; only the first
    /// call reaches the worker.
    pub(crate) fn terminate(&self) {
        if !self.terminating.swap(true, Ordering::Relaxed) {
            self.worker.terminate();
        }
    }
}
