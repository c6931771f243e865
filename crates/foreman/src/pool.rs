// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyspawn::Spawner;
use futures_channel::oneshot;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tick::{Clock, Delay};

use crate::crash::{Slot, SlotLifecycle};
use crate::events::{CallLabel, Events};
use crate::worker::WorkerHandle;
use crate::{
    CallId, CallOptions, CallRequest, CrashInfo, CrashPolicy, DispatchQueue, Error, EventSink,
    Executor, ExecutorKind, ExecutorState, FaultCause, FaultHook, InitMode, QueueHooks,
    QueueOptions, Result, RunFn, TaskId, Worker, WorkerFactory,
};

/// Configuration of a [`Pool`].
#[derive(Clone)]
pub struct PoolConfig {
    pub(crate) task: TaskId,
    pub(crate) size: usize,
    pub(crate) queue: QueueOptions,
    pub(crate) init: InitMode,
    pub(crate) crash_policy: CrashPolicy,
    pub(crate) crash_max_retries: u32,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) events: Option<EventSink>,
}

impl PoolConfig {
    /// Creates a configuration with the standard defaults: max in-flight
    /// equal to the pool size, pending depth of twice the pool size, the
    /// block overflow policy, lazy worker spawn, restart-fail-in-flight
    /// crash handling with three tolerated consecutive crashes, and no
    /// idle teardown.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn new(task: TaskId, size: usize) -> Self {
        assert!(size >= 1, "pool size must be at least 1");

        Self {
            task,
            queue: QueueOptions::new(size).max_queue_depth(Some(size * 2)),
            size,
            init: InitMode::default(),
            crash_policy: CrashPolicy::default(),
            crash_max_retries: 3,
            idle_timeout: None,
            events: None,
        }
    }

    /// Overrides the admission parameters.
    #[must_use]
    pub fn queue(mut self, queue: QueueOptions) -> Self {
        self.queue = queue;
        self
    }

    /// Selects lazy or eager worker spawn.
    #[must_use]
    pub fn init(mut self, init: InitMode) -> Self {
        self.init = init;
        self
    }

    /// Selects the crash policy.
    #[must_use]
    pub fn crash_policy(mut self, policy: CrashPolicy) -> Self {
        self.crash_policy = policy;
        self
    }

    /// Consecutive crashes tolerated before escalation to
    /// [`CrashPolicy::FailTask`].
    #[must_use]
    pub fn crash_max_retries(mut self, retries: u32) -> Self {
        self.crash_max_retries = retries;
        self
    }

    /// Tears workers down after the queue has been idle this long.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Attaches an event sink.
    #[must_use]
    pub fn events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("task", &self.task)
            .field("size", &self.size)
            .field("queue", &self.queue)
            .field("init", &self.init)
            .field("crash_policy", &self.crash_policy)
            .field("crash_max_retries", &self.crash_max_retries)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Executor dispatching queued work across N workers with round-robin
/// balancing and policy-driven crash recovery.
///
/// The pool composes one [`DispatchQueue`] with a fixed vector of worker
/// slots. Slots spawn lazily (or eagerly, per [`InitMode`]), track their
/// own in-flight counts, and recover from crashes with exponential restart
/// backoff. Consecutive crashes beyond the configured limit escalate to
/// [`CrashPolicy::FailTask`] regardless of the configured policy.
pub struct Pool<A, R> {
    inner: Arc<PoolInner<A, R>>,
}

impl<A, R> Clone for Pool<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> fmt::Debug for Pool<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("task", self.inner.events.task())
            .field("size", &self.inner.size)
            .finish_non_exhaustive()
    }
}

impl<A, R> Pool<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Creates a pool. With [`InitMode::Eager`] every slot spawns its
    /// worker immediately; otherwise the first dispatch does.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn WorkerFactory<A, R>>,
        clock: &Clock,
        spawner: Spawner,
    ) -> Self {
        let events = Events::new(config.task.clone(), config.events.clone());

        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner<A, R>>| {
            let run: RunFn<CallRequest<A>, R> = {
                let weak = Weak::clone(weak);
                Arc::new(move |request, wait| {
                    let weak = Weak::clone(&weak);
                    Box::pin(async move {
                        let Some(inner) = weak.upgrade() else {
                            return Err(Error::Disposed);
                        };
                        inner.execute(request, wait).await
                    })
                })
            };

            let queue = DispatchQueue::new(
                config.queue.clone(),
                clock,
                spawner.clone(),
                run,
                queue_hooks(&events, weak),
            );

            PoolInner {
                size: config.size,
                init: config.init,
                crash_policy: config.crash_policy,
                crash_max_retries: config.crash_max_retries,
                idle_timeout: config.idle_timeout,
                queue,
                factory,
                clock: clock.clone(),
                spawner,
                events: events.clone(),
                state: Mutex::new(PoolState {
                    slots: (0..config.size).map(|_| Slot::new()).collect(),
                    cursor: 0,
                    calls: HashMap::new(),
                    crash_streak: 0,
                    last_crash: None,
                    halted: false,
                    disposed: false,
                    restart_waiters: Vec::new(),
                    idle_epoch: 0,
                }),
            }
        });

        if config.init == InitMode::Eager {
            inner.spawn_all();
        }

        Self { inner }
    }
}

impl<A, R> Executor<A, R> for Pool<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    fn dispatch(
        &self,
        method: Arc<str>,
        args: A,
        options: CallOptions,
    ) -> BoxFuture<'static, Result<R>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            {
                let state = inner.state.lock();
                if state.disposed {
                    return Err(Error::Disposed);
                }
                if state.halted {
                    return Err(inner.halt_error(&state));
                }
            }

            let request = CallRequest {
                call_id: CallId::next(),
                method,
                args,
                key: options.key,
                abort: options.abort.clone(),
            };

            let result = inner.queue.enqueue(request, options.abort).await;
            match &result {
                Ok(_) => inner.events.call_succeeded(),
                Err(Error::User(_) | Error::WorkerCrashed { .. }) => inner.events.call_failed(),
                Err(_) => {}
            }
            result
        })
    }

    fn state(&self) -> ExecutorState {
        self.inner.executor_state(ExecutorKind::Parallel)
    }

    fn start_workers(&self) {
        self.inner.start_workers();
    }

    fn stop_workers(&self) {
        self.inner.stop_workers();
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

fn queue_hooks<A, R>(
    events: &Events,
    weak: &Weak<PoolInner<A, R>>,
) -> QueueHooks<CallRequest<A>>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    QueueHooks {
        on_queued: Some(Box::new({
            let events = events.clone();
            move |request: &Arc<CallRequest<A>>| events.queued(CallLabel::of(request))
        })),
        on_dispatch: Some(Box::new({
            let events = events.clone();
            move |request: &Arc<CallRequest<A>>, wait| {
                events.dispatched(CallLabel::of(request), wait);
            }
        })),
        on_reject: Some(Box::new({
            let events = events.clone();
            move |request: &Arc<CallRequest<A>>, error| {
                events.rejected(CallLabel::of(request), error);
            }
        })),
        on_cancel: Some(Box::new({
            let events = events.clone();
            move |request: &Arc<CallRequest<A>>, phase| {
                events.canceled(CallLabel::of(request), phase);
            }
        })),
        on_state_change: Some(Box::new({
            let events = events.clone();
            move |queue: &crate::QueueState| events.state_changed(queue.clone())
        })),
        on_idle: Some(Box::new({
            let events = events.clone();
            let weak = Weak::clone(weak);
            move || {
                events.idle();
                if let Some(inner) = weak.upgrade() {
                    inner.on_queue_idle();
                }
            }
        })),
        on_active: Some(Box::new({
            let events = events.clone();
            let weak = Weak::clone(weak);
            move || {
                events.active();
                if let Some(inner) = weak.upgrade() {
                    inner.idle_interrupted();
                }
            }
        })),
    }
}

enum Picked<A, R> {
    Ready(usize, Arc<dyn Worker<A, R>>),
    AwaitRestart(oneshot::Receiver<()>),
}

struct PoolState<A, R> {
    slots: Vec<Slot<A, R>>,
    cursor: usize,
    calls: HashMap<CallId, usize>,
    crash_streak: u32,
    last_crash: Option<CrashInfo>,
    halted: bool,
    disposed: bool,
    restart_waiters: Vec<oneshot::Sender<()>>,
    // Bumped whenever idleness is interrupted or workers are managed, so
    // a stale idle-teardown timer cannot fire.
    idle_epoch: u64,
}

struct PoolInner<A, R> {
    size: usize,
    init: InitMode,
    crash_policy: CrashPolicy,
    crash_max_retries: u32,
    idle_timeout: Option<Duration>,
    queue: DispatchQueue<CallRequest<A>, R>,
    factory: Arc<dyn WorkerFactory<A, R>>,
    clock: Clock,
    spawner: Spawner,
    events: Events,
    state: Mutex<PoolState<A, R>>,
}

impl<A, R> PoolInner<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    fn executor_state(&self, kind: ExecutorKind) -> ExecutorState {
        let queue = self.queue.state();
        let state = self.state.lock();
        ExecutorState {
            kind,
            workers_total: state.slots.len(),
            workers_active: state.slots.iter().filter(|slot| slot.is_running()).count(),
            per_worker_in_flight: state.slots.iter().map(|slot| slot.in_flight).collect(),
            queue,
            last_crash: state.last_crash.clone(),
            halted: state.halted,
            counters: self.events.counters(),
        }
    }

    fn halt_error(&self, state: &PoolState<A, R>) -> Error {
        state
            .last_crash
            .as_ref()
            .map_or(Error::NoWorkers, |crash| Error::WorkerCrashed {
                task: self.events.task().clone(),
                slot: crash.slot,
                cause: crash.cause.clone(),
            })
    }

    /// Executes one queued call: picks a worker, tracks the call on its
    /// slot, forwards cancellation, and relays the outcome.
    async fn execute(self: Arc<Self>, request: Arc<CallRequest<A>>, _wait: Duration) -> Result<R> {
        let (slot_index, worker) = self.acquire_worker().await?;

        {
            let mut state = self.state.lock();
            state.calls.insert(request.call_id, slot_index);
            if let Some(slot) = state.slots.get_mut(slot_index) {
                slot.in_flight += 1;
            }
        }

        // Cancel forwarding is best-effort; the guard detaches when the
        // call settles.
        let call_id = request.call_id;
        let _cancel_forward = request.abort.as_ref().map(|token| {
            let worker = Arc::clone(&worker);
            token.on_abort(move || worker.cancel(call_id))
        });

        let result = worker.dispatch(Arc::clone(&request)).await;

        {
            let mut state = self.state.lock();
            state.calls.remove(&request.call_id);
            if let Some(slot) = state.slots.get_mut(slot_index) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
                if result.is_ok() {
                    slot.backoff.reset();
                }
            }
            if result.is_ok() {
                state.crash_streak = 0;
            }
        }

        result
    }

    /// Picks a worker, waiting once for a respawn if every slot is in
    /// restart backoff.
    async fn acquire_worker(self: &Arc<Self>) -> Result<(usize, Arc<dyn Worker<A, R>>)> {
        match self.try_pick()? {
            Picked::Ready(slot, worker) => Ok((slot, worker)),
            Picked::AwaitRestart(waiter) => {
                _ = waiter.await;
                match self.try_pick()? {
                    Picked::Ready(slot, worker) => Ok((slot, worker)),
                    Picked::AwaitRestart(_) => Err(Error::NoWorkers),
                }
            }
        }
    }

    /// Scans slots from the round-robin cursor: the first running slot
    /// wins; with no running slot, the first stopped slot spawns lazily;
    /// with every slot starting or backing off, the caller must await a
    /// respawn.
    fn try_pick(self: &Arc<Self>) -> Result<Picked<A, R>> {
        let prepared = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(Error::Disposed);
            }
            if state.halted {
                return Err(self.halt_error(&state));
            }

            let count = state.slots.len();
            let cursor = state.cursor;
            let mut prepared = None;

            for offset in 0..count {
                let index = (cursor + offset) % count;
                let slot = &state.slots[index];
                if slot.is_running() {
                    if let Some(handle) = &slot.handle {
                        let worker = Arc::clone(handle.worker());
                        state.cursor = (index + 1) % count;
                        return Ok(Picked::Ready(index, worker));
                    }
                }
            }

            for offset in 0..count {
                let index = (cursor + offset) % count;
                if state.slots[index].lifecycle == SlotLifecycle::Stopped {
                    let slot = &mut state.slots[index];
                    slot.lifecycle = SlotLifecycle::Starting;
                    slot.epoch += 1;
                    prepared = Some((index, slot.epoch));
                    break;
                }
            }

            let Some(prepared) = prepared else {
                let (sender, receiver) = oneshot::channel();
                state.restart_waiters.push(sender);
                return Ok(Picked::AwaitRestart(receiver));
            };
            prepared
        };

        let (index, epoch) = prepared;
        let worker = self.spawn_prepared(index, epoch)?;
        Ok(Picked::Ready(index, worker))
    }

    /// Spawns the worker for a slot previously moved into `Starting`.
    fn spawn_prepared(self: &Arc<Self>, index: usize, epoch: u64) -> Result<Arc<dyn Worker<A, R>>> {
        let hook = self.fault_hook(index, epoch);
        match self.factory.spawn_worker(index, hook) {
            Ok(worker) => {
                let installed = {
                    let mut state = self.state.lock();
                    let installed = !state.disposed
                        && state.slots.get(index).is_some_and(|slot| {
                            slot.epoch == epoch && slot.lifecycle == SlotLifecycle::Starting
                        });
                    if installed {
                        if let Some(slot) = state.slots.get_mut(index) {
                            slot.handle = Some(WorkerHandle::new(Arc::clone(&worker)));
                            slot.lifecycle = SlotLifecycle::Running;
                        }
                        for waiter in state.restart_waiters.drain(..) {
                            _ = waiter.send(());
                        }
                    }
                    installed
                };

                if installed {
                    self.events.worker_spawned(index);
                    Ok(worker)
                } else {
                    // The slot was torn down while the factory ran.
                    worker.terminate();
                    Err(Error::Disposed)
                }
            }
            Err(error) => {
                let mut state = self.state.lock();
                if let Some(slot) = state.slots.get_mut(index) {
                    if slot.epoch == epoch && slot.lifecycle == SlotLifecycle::Starting {
                        slot.lifecycle = SlotLifecycle::Stopped;
                    }
                }
                Err(error)
            }
        }
    }

    fn fault_hook(self: &Arc<Self>, index: usize, epoch: u64) -> FaultHook {
        let weak = Arc::downgrade(self);
        FaultHook::new(move |cause| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_crash(index, epoch, cause);
            }
        })
    }

    /// Responds to a fault signal. Idempotent per slot: signals carrying a
    /// stale epoch, or arriving during deliberate teardown, are ignored.
    fn handle_crash(self: &Arc<Self>, index: usize, epoch: u64, cause: FaultCause) {
        let Some((error, policy, affected)) = self.record_crash(index, epoch, &cause) else {
            return;
        };

        self.events.worker_crashed(index, &cause);

        match policy {
            CrashPolicy::RestartFailInFlight => {
                _ = self
                    .queue
                    .reject_in_flight(|request| affected.contains(&request.call_id), &error);
                self.schedule_restart(index);
            }
            CrashPolicy::RestartRequeueInFlight => {
                let requeued = self
                    .queue
                    .requeue_in_flight(|request| affected.contains(&request.call_id));
                self.events.requeued(requeued.len());
                self.schedule_restart(index);
            }
            CrashPolicy::FailTask => {
                self.queue.pause();
                _ = self.queue.reject_all(&error);
                self.halt();
            }
        }
    }

    /// Records the crash under the lock and decides the effective policy.
    /// Returns `None` when the signal must be ignored.
    fn record_crash(
        &self,
        index: usize,
        epoch: u64,
        cause: &FaultCause,
    ) -> Option<(Error, CrashPolicy, HashSet<CallId>)> {
        let mut state = self.state.lock();
        if state.disposed {
            return None;
        }

        {
            let slot = state.slots.get(index)?;
            if slot.epoch != epoch {
                return None;
            }
            if slot
                .handle
                .as_ref()
                .is_some_and(WorkerHandle::is_terminating)
            {
                return None;
            }
            if !matches!(
                slot.lifecycle,
                SlotLifecycle::Running | SlotLifecycle::Starting
            ) {
                return None;
            }
        }

        state.last_crash = Some(CrashInfo {
            slot: index,
            cause: cause.clone(),
            at: self.clock.system_time(),
        });

        if let Some(slot) = state.slots.get_mut(index) {
            slot.epoch += 1;
            if let Some(handle) = slot.handle.take() {
                handle.terminate();
            }
            slot.lifecycle = SlotLifecycle::Backoff;
            slot.in_flight = 0;
        }

        state.crash_streak += 1;
        let policy = if state.crash_streak > self.crash_max_retries {
            CrashPolicy::FailTask
        } else {
            self.crash_policy
        };

        let affected: HashSet<CallId> = state
            .calls
            .iter()
            .filter_map(|(call, slot)| (*slot == index).then_some(*call))
            .collect();
        state.calls.retain(|_, slot| *slot != index);

        let error = Error::WorkerCrashed {
            task: self.events.task().clone(),
            slot: index,
            cause: cause.clone(),
        };

        Some((error, policy, affected))
    }

    fn schedule_restart(self: &Arc<Self>, index: usize) {
        let (delay, epoch) = {
            let mut state = self.state.lock();
            if state.disposed || state.halted {
                return;
            }
            let Some(slot) = state.slots.get_mut(index) else {
                return;
            };
            slot.lifecycle = SlotLifecycle::Backoff;
            (slot.backoff.next_delay(), slot.epoch)
        };

        self.events.restart_scheduled(index, delay);

        let inner = Arc::clone(self);
        _ = self.spawner.spawn(async move {
            Delay::new(&inner.clock, delay).await;
            inner.finish_restart(index, epoch);
        });
    }

    fn finish_restart(self: &Arc<Self>, index: usize, epoch: u64) {
        let prepared = {
            let mut state = self.state.lock();
            if state.disposed || state.halted {
                return;
            }
            let Some(slot) = state.slots.get_mut(index) else {
                return;
            };
            if slot.epoch != epoch || slot.lifecycle != SlotLifecycle::Backoff {
                return;
            }
            slot.lifecycle = SlotLifecycle::Starting;
            slot.epoch += 1;
            slot.epoch
        };

        if self.spawn_prepared(index, prepared).is_err() {
            // Try again later with a longer delay.
            self.schedule_restart(index);
        }
    }

    /// Terminal fail-task state: every worker is torn down and dispatches
    /// reject until `start_workers` recovers the task.
    fn halt(&self) {
        let terminated = {
            let mut state = self.state.lock();
            state.halted = true;
            state.idle_epoch += 1;
            state.calls.clear();
            for waiter in state.restart_waiters.drain(..) {
                _ = waiter.send(());
            }
            Self::teardown_slots(&mut state)
        };

        self.events.halted();
        for index in terminated {
            self.events.worker_terminated(index);
        }
    }

    fn teardown_slots(state: &mut PoolState<A, R>) -> Vec<usize> {
        let mut terminated = Vec::new();
        for (index, slot) in state.slots.iter_mut().enumerate() {
            if slot.teardown() {
                terminated.push(index);
            }
        }
        terminated
    }

    fn spawn_all(self: &Arc<Self>) {
        let prepared: Vec<(usize, u64)> = {
            let mut state = self.state.lock();
            if state.disposed || state.halted {
                return;
            }
            state
                .slots
                .iter_mut()
                .enumerate()
                .filter(|(_, slot)| slot.lifecycle == SlotLifecycle::Stopped)
                .map(|(index, slot)| {
                    slot.lifecycle = SlotLifecycle::Starting;
                    slot.epoch += 1;
                    (index, slot.epoch)
                })
                .collect()
        };

        for (index, epoch) in prepared {
            _ = self.spawn_prepared(index, epoch);
        }
    }

    fn start_workers(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.halted = false;
            state.crash_streak = 0;
            state.idle_epoch += 1;
        }

        if self.init == InitMode::Eager {
            self.spawn_all();
        }
        self.queue.resume();
    }

    fn stop_workers(self: &Arc<Self>) {
        self.queue.pause();

        // In-flight work survives a manual stop; it is requeued at the
        // head and picked back up after the next start.
        let requeued = self.queue.requeue_in_flight(|_| true);
        self.events.requeued(requeued.len());

        let terminated = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.calls.clear();
            state.idle_epoch += 1;
            for waiter in state.restart_waiters.drain(..) {
                _ = waiter.send(());
            }
            Self::teardown_slots(&mut state)
        };

        for index in terminated {
            self.events.worker_terminated(index);
        }
    }

    fn dispose(self: &Arc<Self>) {
        self.queue.dispose();

        let terminated = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.idle_epoch += 1;
            state.calls.clear();
            for waiter in state.restart_waiters.drain(..) {
                _ = waiter.send(());
            }
            Self::teardown_slots(&mut state)
        };

        for index in terminated {
            self.events.worker_terminated(index);
        }
    }

    /// Queue-idle hook: arms the idle-teardown timer, if configured.
    fn on_queue_idle(self: &Arc<Self>) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };

        let epoch = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.idle_epoch += 1;
            state.idle_epoch
        };

        let inner = Arc::clone(self);
        _ = self.spawner.spawn(async move {
            Delay::new(&inner.clock, timeout).await;
            inner.finish_idle_teardown(epoch);
        });
    }

    fn idle_interrupted(&self) {
        let mut state = self.state.lock();
        state.idle_epoch += 1;
    }

    /// Idle-timeout expiry: tears workers down without touching admission
    /// state; the next dispatch respawns lazily.
    fn finish_idle_teardown(self: &Arc<Self>, epoch: u64) {
        if !self.queue.is_idle() {
            return;
        }

        let terminated = {
            let mut state = self.state.lock();
            if state.disposed || state.idle_epoch != epoch {
                return;
            }
            Self::teardown_slots(&mut state)
        };

        for index in terminated {
            self.events.worker_terminated(index);
        }
    }
}
