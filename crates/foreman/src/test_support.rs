// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scripted workers shared by the executor test suites.

use std::collections::HashMap;
use std::sync::Arc;

use futures_channel::oneshot;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::{CallId, CallRequest, Error, FaultCause, FaultHook, Result, Worker, WorkerFactory};

/// Shared script: every dispatch parks on a gate keyed by the call's
/// argument, and crashes are injected through the captured fault hooks.
pub(crate) struct Script {
    gates: Mutex<HashMap<u32, oneshot::Sender<Result<u32>>>>,
    dispatched: Mutex<Vec<(usize, u32)>>,
    cancels: Mutex<Vec<CallId>>,
    spawned: Mutex<Vec<usize>>,
    terminated: Mutex<Vec<usize>>,
    hooks: Mutex<HashMap<usize, FaultHook>>,
}

impl Script {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            gates: Mutex::new(HashMap::new()),
            dispatched: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            hooks: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn resolve(&self, arg: u32, value: u32) {
        let gate = self
            .gates
            .lock()
            .remove(&arg)
            .expect("no worker gate registered for this argument");
        _ = gate.send(Ok(value));
    }

    pub(crate) fn fail(&self, arg: u32, error: Error) {
        let gate = self
            .gates
            .lock()
            .remove(&arg)
            .expect("no worker gate registered for this argument");
        _ = gate.send(Err(error));
    }

    pub(crate) fn has_gate(&self, arg: u32) -> bool {
        self.gates.lock().contains_key(&arg)
    }

    /// Raises a fault on the worker currently installed in `slot`.
    pub(crate) fn crash(&self, slot: usize) {
        let hook = self
            .hooks
            .lock()
            .get(&slot)
            .cloned()
            .expect("no worker was spawned in this slot");
        hook.raise(FaultCause::new("boom"));
    }

    pub(crate) fn dispatched(&self) -> Vec<(usize, u32)> {
        self.dispatched.lock().clone()
    }

    pub(crate) fn cancels(&self) -> Vec<CallId> {
        self.cancels.lock().clone()
    }

    pub(crate) fn spawned(&self) -> Vec<usize> {
        self.spawned.lock().clone()
    }

    pub(crate) fn terminated(&self) -> Vec<usize> {
        self.terminated.lock().clone()
    }
}

pub(crate) struct ScriptWorker {
    slot: usize,
    script: Arc<Script>,
}

impl Worker<u32, u32> for ScriptWorker {
    fn dispatch(&self, request: Arc<CallRequest<u32>>) -> BoxFuture<'static, Result<u32>> {
        let (sender, receiver) = oneshot::channel();
        self.script.gates.lock().insert(request.args, sender);
        self.script.dispatched.lock().push((self.slot, request.args));
        Box::pin(async move { receiver.await.unwrap_or(Err(Error::Disposed)) })
    }

    fn cancel(&self, call_id: CallId) {
        self.script.cancels.lock().push(call_id);
    }

    fn terminate(&self) {
        self.script.terminated.lock().push(self.slot);
    }
}

pub(crate) struct ScriptFactory {
    script: Arc<Script>,
}

impl ScriptFactory {
    pub(crate) fn new(script: &Arc<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::clone(script),
        })
    }
}

impl WorkerFactory<u32, u32> for ScriptFactory {
    fn spawn_worker(&self, slot: usize, faults: FaultHook) -> Result<Arc<dyn Worker<u32, u32>>> {
        self.script.spawned.lock().push(slot);
        self.script.hooks.lock().insert(slot, faults);
        Ok(Arc::new(ScriptWorker {
            slot,
            script: Arc::clone(&self.script),
        }))
    }
}

/// Lets spawned futures and timers make progress on the current-thread
/// test runtime.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
