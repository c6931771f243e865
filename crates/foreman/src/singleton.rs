// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

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
    Executor, ExecutorKind, ExecutorState, FaultCause, FaultHook, InitMode, OverflowPolicy,
    QueueHooks, QueueOptions, Result, RunFn, TaskId, Worker, WorkerFactory,
};

/// Configuration of a [`Singleton`].
#[derive(Clone)]
pub struct SingletonConfig {
    pub(crate) task: TaskId,
    pub(crate) queue: QueueOptions,
    pub(crate) init: InitMode,
    pub(crate) crash_policy: CrashPolicy,
    pub(crate) crash_max_retries: u32,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) events: Option<EventSink>,
}

impl SingletonConfig {
    /// Creates a configuration with the standard defaults: one call in
    /// flight, a pending depth of two, and the block overflow policy.
    #[must_use]
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            queue: QueueOptions::new(1)
                .max_queue_depth(Some(2))
                .policy(OverflowPolicy::Block),
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

    /// Tears the worker down after the queue has been idle this long.
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

impl fmt::Debug for SingletonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingletonConfig")
            .field("task", &self.task)
            .field("queue", &self.queue)
            .field("init", &self.init)
            .field("crash_policy", &self.crash_policy)
            .field("crash_max_retries", &self.crash_max_retries)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Executor serializing queued work onto a single worker.
///
/// Admission semantics are identical to [`Pool`][crate::Pool]; the worker
/// index is always 0 and there is no per-call slot bookkeeping, since a
/// crash affects every in-flight call.
pub struct Singleton<A, R> {
    inner: Arc<SingletonInner<A, R>>,
}

impl<A, R> Clone for Singleton<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> fmt::Debug for Singleton<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Singleton")
            .field("task", self.inner.events.task())
            .finish_non_exhaustive()
    }
}

impl<A, R> Singleton<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Creates a singleton executor.
    #[must_use]
    pub fn new(
        config: SingletonConfig,
        factory: Arc<dyn WorkerFactory<A, R>>,
        clock: &Clock,
        spawner: Spawner,
    ) -> Self {
        let events = Events::new(config.task.clone(), config.events.clone());

        let inner = Arc::new_cyclic(|weak: &Weak<SingletonInner<A, R>>| {
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

            SingletonInner {
                init: config.init,
                crash_policy: config.crash_policy,
                crash_max_retries: config.crash_max_retries,
                idle_timeout: config.idle_timeout,
                queue,
                factory,
                clock: clock.clone(),
                spawner,
                events: events.clone(),
                state: Mutex::new(SingletonState {
                    slot: Slot::new(),
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
            _ = inner.ensure_worker();
        }

        Self { inner }
    }
}

impl<A, R> Executor<A, R> for Singleton<A, R>
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
        let queue = self.inner.queue.state();
        let state = self.inner.state.lock();
        ExecutorState {
            kind: ExecutorKind::Singleton,
            workers_total: 1,
            workers_active: usize::from(state.slot.is_running()),
            per_worker_in_flight: vec![state.slot.in_flight],
            queue,
            last_crash: state.last_crash.clone(),
            halted: state.halted,
            counters: self.inner.events.counters(),
        }
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
    weak: &Weak<SingletonInner<A, R>>,
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

struct SingletonState<A, R> {
    slot: Slot<A, R>,
    crash_streak: u32,
    last_crash: Option<CrashInfo>,
    halted: bool,
    disposed: bool,
    restart_waiters: Vec<oneshot::Sender<()>>,
    idle_epoch: u64,
}

struct SingletonInner<A, R> {
    init: InitMode,
    crash_policy: CrashPolicy,
    crash_max_retries: u32,
    idle_timeout: Option<Duration>,
    queue: DispatchQueue<CallRequest<A>, R>,
    factory: Arc<dyn WorkerFactory<A, R>>,
    clock: Clock,
    spawner: Spawner,
    events: Events,
    state: Mutex<SingletonState<A, R>>,
}

enum Acquired<A, R> {
    Ready(Arc<dyn Worker<A, R>>),
    AwaitRestart(oneshot::Receiver<()>),
}

impl<A, R> SingletonInner<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    fn halt_error(&self, state: &SingletonState<A, R>) -> Error {
        state
            .last_crash
            .as_ref()
            .map_or(Error::NoWorkers, |crash| Error::WorkerCrashed {
                task: self.events.task().clone(),
                slot: 0,
                cause: crash.cause.clone(),
            })
    }

    async fn execute(self: Arc<Self>, request: Arc<CallRequest<A>>, _wait: Duration) -> Result<R> {
        let worker = match self.ensure_worker()? {
            Acquired::Ready(worker) => worker,
            Acquired::AwaitRestart(waiter) => {
                _ = waiter.await;
                match self.ensure_worker()? {
                    Acquired::Ready(worker) => worker,
                    Acquired::AwaitRestart(_) => return Err(Error::NoWorkers),
                }
            }
        };

        {
            let mut state = self.state.lock();
            state.slot.in_flight += 1;
        }

        let call_id = request.call_id;
        let _cancel_forward = request.abort.as_ref().map(|token| {
            let worker = Arc::clone(&worker);
            token.on_abort(move || worker.cancel(call_id))
        });

        let result = worker.dispatch(Arc::clone(&request)).await;

        {
            let mut state = self.state.lock();
            state.slot.in_flight = state.slot.in_flight.saturating_sub(1);
            if result.is_ok() {
                state.slot.backoff.reset();
                state.crash_streak = 0;
            }
        }

        result
    }

    /// Returns the worker, spawning it lazily, or a waiter when the slot
    /// is restarting.
    fn ensure_worker(self: &Arc<Self>) -> Result<Acquired<A, R>> {
        let epoch = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(Error::Disposed);
            }
            if state.halted {
                return Err(self.halt_error(&state));
            }

            match state.slot.lifecycle {
                SlotLifecycle::Running => {
                    if let Some(handle) = &state.slot.handle {
                        return Ok(Acquired::Ready(Arc::clone(handle.worker())));
                    }
                    return Err(Error::NoWorkers);
                }
                SlotLifecycle::Starting | SlotLifecycle::Backoff => {
                    let (sender, receiver) = oneshot::channel();
                    state.restart_waiters.push(sender);
                    return Ok(Acquired::AwaitRestart(receiver));
                }
                SlotLifecycle::Stopped => {
                    state.slot.lifecycle = SlotLifecycle::Starting;
                    state.slot.epoch += 1;
                    state.slot.epoch
                }
            }
        };

        self.spawn_prepared(epoch).map(Acquired::Ready)
    }

    fn spawn_prepared(self: &Arc<Self>, epoch: u64) -> Result<Arc<dyn Worker<A, R>>> {
        let hook = self.fault_hook(epoch);
        match self.factory.spawn_worker(0, hook) {
            Ok(worker) => {
                let installed = {
                    let mut state = self.state.lock();
                    let installed = !state.disposed
                        && state.slot.epoch == epoch
                        && state.slot.lifecycle == SlotLifecycle::Starting;
                    if installed {
                        state.slot.handle = Some(WorkerHandle::new(Arc::clone(&worker)));
                        state.slot.lifecycle = SlotLifecycle::Running;
                        for waiter in state.restart_waiters.drain(..) {
                            _ = waiter.send(());
                        }
                    }
                    installed
                };

                if installed {
                    self.events.worker_spawned(0);
                    Ok(worker)
                } else {
                    worker.terminate();
                    Err(Error::Disposed)
                }
            }
            Err(error) => {
                let mut state = self.state.lock();
                if state.slot.epoch == epoch && state.slot.lifecycle == SlotLifecycle::Starting {
                    state.slot.lifecycle = SlotLifecycle::Stopped;
                }
                Err(error)
            }
        }
    }

    fn fault_hook(self: &Arc<Self>, epoch: u64) -> FaultHook {
        let weak = Arc::downgrade(self);
        FaultHook::new(move |cause| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_crash(epoch, cause);
            }
        })
    }

    fn handle_crash(self: &Arc<Self>, epoch: u64, cause: FaultCause) {
        let Some((error, policy)) = self.record_crash(epoch, &cause) else {
            return;
        };

        self.events.worker_crashed(0, &cause);

        match policy {
            CrashPolicy::RestartFailInFlight => {
                _ = self.queue.reject_in_flight(|_| true, &error);
                self.schedule_restart();
            }
            CrashPolicy::RestartRequeueInFlight => {
                let requeued = self.queue.requeue_in_flight(|_| true);
                self.events.requeued(requeued.len());
                self.schedule_restart();
            }
            CrashPolicy::FailTask => {
                self.queue.pause();
                _ = self.queue.reject_all(&error);
                self.halt();
            }
        }
    }

    fn record_crash(&self, epoch: u64, cause: &FaultCause) -> Option<(Error, CrashPolicy)> {
        let mut state = self.state.lock();
        if state.disposed || state.slot.epoch != epoch {
            return None;
        }
        if state
            .slot
            .handle
            .as_ref()
            .is_some_and(WorkerHandle::is_terminating)
        {
            return None;
        }
        if !matches!(
            state.slot.lifecycle,
            SlotLifecycle::Running | SlotLifecycle::Starting
        ) {
            return None;
        }

        state.last_crash = Some(CrashInfo {
            slot: 0,
            cause: cause.clone(),
            at: self.clock.system_time(),
        });

        state.slot.epoch += 1;
        if let Some(handle) = state.slot.handle.take() {
            handle.terminate();
        }
        state.slot.lifecycle = SlotLifecycle::Backoff;
        state.slot.in_flight = 0;

        state.crash_streak += 1;
        let policy = if state.crash_streak > self.crash_max_retries {
            CrashPolicy::FailTask
        } else {
            self.crash_policy
        };

        let error = Error::WorkerCrashed {
            task: self.events.task().clone(),
            slot: 0,
            cause: cause.clone(),
        };

        Some((error, policy))
    }

    fn schedule_restart(self: &Arc<Self>) {
        let (delay, epoch) = {
            let mut state = self.state.lock();
            if state.disposed || state.halted {
                return;
            }
            state.slot.lifecycle = SlotLifecycle::Backoff;
            (state.slot.backoff.next_delay(), state.slot.epoch)
        };

        self.events.restart_scheduled(0, delay);

        let inner = Arc::clone(self);
        _ = self.spawner.spawn(async move {
            Delay::new(&inner.clock, delay).await;
            inner.finish_restart(epoch);
        });
    }

    fn finish_restart(self: &Arc<Self>, epoch: u64) {
        let prepared = {
            let mut state = self.state.lock();
            if state.disposed || state.halted {
                return;
            }
            if state.slot.epoch != epoch || state.slot.lifecycle != SlotLifecycle::Backoff {
                return;
            }
            state.slot.lifecycle = SlotLifecycle::Starting;
            state.slot.epoch += 1;
            state.slot.epoch
        };

        if self.spawn_prepared(prepared).is_err() {
            self.schedule_restart();
        }
    }

    fn halt(&self) {
        let terminated = {
            let mut state = self.state.lock();
            state.halted = true;
            state.idle_epoch += 1;
            for waiter in state.restart_waiters.drain(..) {
                _ = waiter.send(());
            }
            state.slot.teardown()
        };

        self.events.halted();
        if terminated {
            self.events.worker_terminated(0);
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
            _ = self.ensure_worker();
        }
        self.queue.resume();
    }

    fn stop_workers(self: &Arc<Self>) {
        self.queue.pause();

        let requeued = self.queue.requeue_in_flight(|_| true);
        self.events.requeued(requeued.len());

        let terminated = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.idle_epoch += 1;
            for waiter in state.restart_waiters.drain(..) {
                _ = waiter.send(());
            }
            state.slot.teardown()
        };

        if terminated {
            self.events.worker_terminated(0);
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
            for waiter in state.restart_waiters.drain(..) {
                _ = waiter.send(());
            }
            state.slot.teardown()
        };

        if terminated {
            self.events.worker_terminated(0);
        }
    }

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

    fn finish_idle_teardown(self: &Arc<Self>, epoch: u64) {
        if !self.queue.is_idle() {
            return;
        }

        let terminated = {
            let mut state = self.state.lock();
            if state.disposed || state.idle_epoch != epoch {
                return;
            }
            state.slot.teardown()
        };

        if terminated {
            self.events.worker_terminated(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use ripcord::AbortHandle;
    use tick::ClockControl;

    use super::*;
    use crate::test_support::{Script, ScriptFactory, settle};
    use crate::AbortPhase;

    struct Rig {
        singleton: Singleton<u32, u32>,
        script: Arc<Script>,
        control: ClockControl,
    }

    fn rig(configure: impl FnOnce(SingletonConfig) -> SingletonConfig) -> Rig {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let script = Script::new();

        let config = configure(SingletonConfig::new(TaskId::new("singleton-under-test")));
        let singleton = Singleton::new(
            config,
            ScriptFactory::new(&script),
            &clock,
            Spawner::new_tokio(),
        );

        Rig {
            singleton,
            script,
            control,
        }
    }

    fn call_with(
        rig: &Rig,
        arg: u32,
        abort: Option<ripcord::AbortToken>,
    ) -> tokio::task::JoinHandle<Result<u32>> {
        let singleton = rig.singleton.clone();
        tokio::spawn(async move {
            singleton
                .dispatch(Arc::from("work"), arg, CallOptions { abort, key: None })
                .await
        })
    }

    fn call(rig: &Rig, arg: u32) -> tokio::task::JoinHandle<Result<u32>> {
        call_with(rig, arg, None)
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Singleton<u32, u32>: Send, Sync, Clone);
    }

    #[tokio::test]
    async fn serializes_calls_with_the_default_admission() {
        let rig = rig(|config| config);

        let a = call(&rig, 1);
        settle().await;
        let b = call(&rig, 2);
        settle().await;

        // One call runs, the second is queued behind it.
        let state = rig.singleton.state();
        assert_eq!(state.kind, ExecutorKind::Singleton);
        assert_eq!((state.queue.in_flight, state.queue.pending), (1, 1));
        assert_eq!(state.queue.max_in_flight, 1);
        assert_eq!(state.queue.max_queue_depth, Some(2));
        assert!(rig.script.has_gate(1));
        assert!(!rig.script.has_gate(2));

        rig.script.resolve(1, 11);
        settle().await;
        rig.script.resolve(2, 22);

        assert_eq!(a.await.unwrap().unwrap(), 11);
        assert_eq!(b.await.unwrap().unwrap(), 22);
        assert_eq!(rig.singleton.state().per_worker_in_flight, [0]);
    }

    #[tokio::test]
    async fn eager_init_spawns_before_the_first_call() {
        let rig = rig(|config| config.init(InitMode::Eager));
        assert_eq!(rig.script.spawned(), [0]);
        assert_eq!(rig.singleton.state().workers_active, 1);
    }

    #[tokio::test]
    async fn cancellation_reports_each_phase() {
        let rig = rig(|config| config);

        // Fill the worker, the two pending seats, and one waiting seat.
        let in_flight_handle = AbortHandle::new();
        let a = call_with(&rig, 1, Some(in_flight_handle.token()));
        settle().await;
        let _b = call(&rig, 2);
        settle().await;
        let queued_handle = AbortHandle::new();
        let c = call_with(&rig, 3, Some(queued_handle.token()));
        settle().await;
        let waiting_handle = AbortHandle::new();
        let d = call_with(&rig, 4, Some(waiting_handle.token()));
        settle().await;
        assert_eq!(rig.singleton.state().queue.waiting, 1);

        waiting_handle.abort();
        settle().await;
        assert!(matches!(
            d.await.unwrap(),
            Err(Error::Aborted(AbortPhase::Waiting))
        ));

        queued_handle.abort();
        settle().await;
        assert!(matches!(
            c.await.unwrap(),
            Err(Error::Aborted(AbortPhase::Queued))
        ));

        in_flight_handle.abort();
        settle().await;
        assert!(matches!(
            a.await.unwrap(),
            Err(Error::Aborted(AbortPhase::InFlight))
        ));
        assert_eq!(rig.script.cancels().len(), 1);
        assert_eq!(rig.singleton.state().counters.canceled, 3);
    }

    #[tokio::test]
    async fn crash_requeues_and_respawns_after_backoff() {
        let rig = rig(|config| config.crash_policy(CrashPolicy::RestartRequeueInFlight));

        let a = call(&rig, 7);
        settle().await;

        rig.script.crash(0);
        settle().await;
        assert!(!a.is_finished());

        rig.control.advance(Duration::from_millis(100));
        settle().await;
        assert_eq!(rig.script.spawned(), [0, 0]);

        rig.script.resolve(7, 77);
        assert_eq!(a.await.unwrap().unwrap(), 77);
    }

    #[tokio::test]
    async fn escalation_halts_until_started_again() {
        let rig = rig(|config| {
            config
                .crash_policy(CrashPolicy::RestartRequeueInFlight)
                .crash_max_retries(1)
        });

        let a = call(&rig, 1);
        settle().await;
        rig.script.crash(0);
        settle().await;
        rig.control.advance(Duration::from_millis(100));
        settle().await;

        rig.script.crash(0);
        settle().await;

        assert!(matches!(
            a.await.unwrap(),
            Err(Error::WorkerCrashed { slot: 0, .. })
        ));
        assert!(rig.singleton.state().halted);

        let b = call(&rig, 2);
        settle().await;
        assert!(matches!(b.await.unwrap(), Err(Error::WorkerCrashed { .. })));

        rig.singleton.start_workers();
        settle().await;
        let c = call(&rig, 3);
        settle().await;
        rig.script.resolve(3, 33);
        assert_eq!(c.await.unwrap().unwrap(), 33);
    }

    #[tokio::test]
    async fn dispose_terminates_the_worker() {
        let rig = rig(|config| config);

        let a = call(&rig, 1);
        settle().await;
        rig.singleton.dispose();
        settle().await;

        assert!(matches!(a.await.unwrap(), Err(Error::Disposed)));
        assert_eq!(rig.script.terminated(), [0]);

        let b = call(&rig, 2);
        settle().await;
        assert!(matches!(b.await.unwrap(), Err(Error::Disposed)));
    }
}
