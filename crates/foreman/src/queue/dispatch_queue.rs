// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyspawn::Spawner;
use futures_channel::oneshot;
use futures_util::future::{BoxFuture, Either, select};
use parking_lot::Mutex;
use ripcord::{AbortListener, AbortToken};
use tick::Clock;

use crate::{
    AbortPhase, Error, OverflowPolicy, QueueHooks, QueueOptions, QueueState, Result,
};

/// The function a [`DispatchQueue`] hands ready entries to.
///
/// Receives the payload and the time the entry spent in Pending. The
/// returned future is spawned by the queue and its outcome is delivered to
/// the caller of the corresponding `enqueue`, unless the entry has been
/// requeued or cancelled in the meantime.
pub type RunFn<T, R> =
    Arc<dyn Fn(Arc<T>, Duration) -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// Payloads drained by [`DispatchQueue::reject_all`], grouped by the phase
/// they occupied.
#[derive(Debug)]
pub struct DrainedWork<T> {
    /// Entries that were admitted and awaiting dispatch.
    pub pending: Vec<Arc<T>>,
    /// Callers that were waiting for a pending permit.
    pub waiting: Vec<Arc<T>>,
    /// Entries that were executing.
    pub in_flight: Vec<Arc<T>>,
}

impl<T> Default for DrainedWork<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            waiting: Vec::new(),
            in_flight: Vec::new(),
        }
    }
}

/// Per-task admission and scheduling engine.
///
/// The queue accepts work through [`enqueue`][Self::enqueue], gates it
/// against a bounded in-flight count and a bounded pending depth with a
/// configurable overflow policy, and drives a pump loop that hands ready
/// entries to a caller-supplied [`RunFn`]. Lifecycle transitions are
/// reported through [`QueueHooks`].
///
/// The payload type `T` is opaque to the queue; executors store whatever
/// they need to route the call.
///
/// # Thread safety
///
/// All state lives behind a single mutex that is held for the entire body
/// of every operation and never across an await point. Public operations
/// return promptly; the only suspension points are waiting for a pending
/// permit inside `enqueue` (block policy) and awaiting the final result.
pub struct DispatchQueue<T, R> {
    inner: Arc<QueueInner<T, R>>,
}

impl<T, R> Clone for DispatchQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> fmt::Debug for DispatchQueue<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("state", &self.inner.state())
            .finish()
    }
}

impl<T, R> DispatchQueue<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Creates a queue.
    ///
    /// `run` is invoked by the pump for every dispatched entry; the future
    /// it returns is spawned on `spawner`.
    #[must_use]
    pub fn new(
        options: QueueOptions,
        clock: &Clock,
        spawner: Spawner,
        run: RunFn<T, R>,
        hooks: QueueHooks<T>,
    ) -> Self {
        let permits = match (options.policy, options.max_queue_depth) {
            (OverflowPolicy::Block, Some(depth)) => {
                isize::try_from(depth).unwrap_or(isize::MAX)
            }
            _ => 0,
        };

        Self {
            inner: Arc::new(QueueInner {
                options,
                clock: clock.clone(),
                spawner,
                run,
                hooks,
                ids: AtomicU64::new(1),
                core: Mutex::new(Core {
                    entries: HashMap::new(),
                    pending: VecDeque::new(),
                    in_flight: HashSet::new(),
                    waiting: VecDeque::new(),
                    permits,
                    paused: false,
                    disposed: false,
                    idle: true,
                }),
            }),
        }
    }

    /// Submits a payload and awaits its result.
    ///
    /// Admission order: a disposed queue fails immediately with
    /// [`Error::Disposed`]; a pre-aborted token fails with
    /// [`Error::Aborted`]; under the block policy with a finite depth the
    /// caller suspends until a pending permit frees up; the other policies
    /// consult the overflow rules when the pending depth is full. Once
    /// admitted, the future resolves with whatever the run function
    /// produces for the final attempt of this entry.
    pub async fn enqueue(&self, payload: T, abort: Option<AbortToken>) -> Result<R> {
        let inner = &self.inner;
        let payload = Arc::new(payload);
        let id = inner.ids.fetch_add(1, Ordering::Relaxed);

        // The listener is registered before the queue lock is ever taken;
        // its callback re-checks entry state, so firing early is harmless.
        let mut listener = abort.as_ref().map(|token| {
            let weak = Arc::downgrade(inner);
            token.on_abort(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_token_abort(id);
                }
            })
        });

        let mut holds_permit = false;
        loop {
            match inner.try_admit(id, &payload, &abort, &mut listener, &mut holds_permit)? {
                AdmissionStep::Admitted(receiver) => {
                    return match receiver.await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Disposed),
                    };
                }
                AdmissionStep::Wait(waiter_id, grant) => {
                    inner
                        .wait_for_permit(waiter_id, grant, abort.as_ref(), &payload)
                        .await?;
                    holds_permit = true;
                }
            }
        }
    }

    /// Suspends the pump. Entries already in flight are unaffected.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Resumes the pump and immediately runs a pump pass.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Tears the queue down: every pending, waiting, and in-flight entry
    /// is rejected with [`Error::Disposed`] and all subsequent `enqueue`
    /// calls fail synchronously.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Moves matching in-flight entries back to the head of Pending,
    /// incrementing their attempt counters so late completions from the
    /// prior dispatch are discarded. Entries are requeued in their
    /// original admission order. Returns the requeued payloads.
    pub fn requeue_in_flight(&self, predicate: impl Fn(&T) -> bool) -> Vec<Arc<T>> {
        self.inner.requeue_in_flight(&predicate)
    }

    /// Completes matching in-flight entries with `error` and removes them.
    /// Returns the affected payloads.
    pub fn reject_in_flight(&self, predicate: impl Fn(&T) -> bool, error: &Error) -> Vec<Arc<T>> {
        self.inner.reject_in_flight(&predicate, error)
    }

    /// Drains all three phases, completing every entry with `error`, and
    /// returns the payloads grouped by phase. Block-policy permits are
    /// reset to the full depth.
    pub fn reject_all(&self, error: &Error) -> DrainedWork<T> {
        self.inner.reject_all(error)
    }

    /// Snapshot of the observable queue state.
    #[must_use]
    pub fn state(&self) -> QueueState {
        self.inner.state()
    }

    /// Whether the queue holds no work in any phase.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let core = self.inner.core.lock();
        core.pending.is_empty() && core.in_flight.is_empty() && core.waiting.is_empty()
    }
}

enum AdmissionStep<R> {
    Admitted(oneshot::Receiver<Result<R>>),
    Wait(u64, oneshot::Receiver<Result<()>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryPhase {
    Pending,
    InFlight,
}

struct Entry<T, R> {
    payload: Arc<T>,
    completion: Option<oneshot::Sender<Result<R>>>,
    abort: Option<AbortToken>,
    // Held so the registration is dropped with the entry.
    _abort_listener: Option<AbortListener>,
    first_enqueued_at: Instant,
    enqueued_at: Instant,
    attempt: u64,
    phase: EntryPhase,
}

impl<T, R> Entry<T, R> {
    /// An entry whose completion has already been consumed (by an
    /// in-flight abort) while its run future is still outstanding.
    fn is_settled(&self) -> bool {
        self.completion.is_none()
    }
}

struct Waiter<T> {
    id: u64,
    payload: Arc<T>,
    grant: oneshot::Sender<Result<()>>,
}

struct Core<T, R> {
    entries: HashMap<u64, Entry<T, R>>,
    pending: VecDeque<u64>,
    in_flight: HashSet<u64>,
    waiting: VecDeque<Waiter<T>>,
    // Signed: requeue_in_flight may transiently overfill Pending, in which
    // case the balance goes negative until dispatches drain the excess.
    permits: isize,
    paused: bool,
    disposed: bool,
    idle: bool,
}

enum Signal<T> {
    Queued(Arc<T>),
    Dispatched(Arc<T>, Duration),
    Rejected(Arc<T>, Error),
    Canceled(Arc<T>, AbortPhase),
    StateChanged(QueueState),
    Idle,
    Active,
}

struct QueueInner<T, R> {
    options: QueueOptions,
    clock: Clock,
    spawner: Spawner,
    run: RunFn<T, R>,
    hooks: QueueHooks<T>,
    ids: AtomicU64,
    core: Mutex<Core<T, R>>,
}

impl<T, R> QueueInner<T, R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    fn needs_permit(&self) -> bool {
        self.options.policy == OverflowPolicy::Block && self.options.max_queue_depth.is_some()
    }

    fn snapshot(&self, core: &Core<T, R>) -> QueueState {
        QueueState {
            in_flight: core.in_flight.len(),
            pending: core.pending.len(),
            waiting: core.waiting.len(),
            max_in_flight: self.options.max_in_flight,
            max_queue_depth: self.options.max_queue_depth,
            policy: self.options.policy,
            paused: core.paused,
            disposed: core.disposed,
        }
    }

    fn state(&self) -> QueueState {
        self.snapshot(&self.core.lock())
    }

    fn deliver(entry: &mut Entry<T, R>, result: Result<R>) {
        if let Some(completion) = entry.completion.take() {
            _ = completion.send(result);
        }
    }

    /// Appends the state-change signal and the idle/active edge, if any.
    fn finish(&self, core: &mut Core<T, R>, signals: &mut Vec<Signal<T>>) {
        signals.push(Signal::StateChanged(self.snapshot(core)));

        let idle = core.pending.is_empty() && core.in_flight.is_empty() && core.waiting.is_empty();
        if idle != core.idle {
            core.idle = idle;
            signals.push(if idle { Signal::Idle } else { Signal::Active });
        }
    }

    /// Invokes hooks for collected signals. Must be called after the core
    /// lock has been released.
    fn emit(&self, signals: Vec<Signal<T>>) {
        for signal in signals {
            match signal {
                Signal::Queued(payload) => {
                    if let Some(hook) = &self.hooks.on_queued {
                        hook(&payload);
                    }
                }
                Signal::Dispatched(payload, wait) => {
                    if let Some(hook) = &self.hooks.on_dispatch {
                        hook(&payload, wait);
                    }
                }
                Signal::Rejected(payload, error) => {
                    if let Some(hook) = &self.hooks.on_reject {
                        hook(&payload, &error);
                    }
                }
                Signal::Canceled(payload, phase) => {
                    if let Some(hook) = &self.hooks.on_cancel {
                        hook(&payload, phase);
                    }
                }
                Signal::StateChanged(state) => {
                    if let Some(hook) = &self.hooks.on_state_change {
                        hook(&state);
                    }
                }
                Signal::Idle => {
                    if let Some(hook) = &self.hooks.on_idle {
                        hook();
                    }
                }
                Signal::Active => {
                    if let Some(hook) = &self.hooks.on_active {
                        hook();
                    }
                }
            }
        }
    }

    /// Returns one permit and offers it to the head of the waiter FIFO.
    fn release_permit_locked(&self, core: &mut Core<T, R>) {
        if !self.needs_permit() || core.disposed {
            return;
        }

        core.permits += 1;
        while core.permits > 0 {
            let Some(waiter) = core.waiting.pop_front() else {
                break;
            };
            core.permits -= 1;
            if waiter.grant.send(Ok(())).is_err() {
                // The caller abandoned its enqueue; hand the permit onward.
                core.permits += 1;
                continue;
            }
            break;
        }
    }

    fn take_permit_locked(&self, core: &mut Core<T, R>) {
        if self.needs_permit() {
            core.permits -= 1;
        }
    }

    fn try_admit(
        self: &Arc<Self>,
        id: u64,
        payload: &Arc<T>,
        abort: &Option<AbortToken>,
        listener: &mut Option<AbortListener>,
        holds_permit: &mut bool,
    ) -> Result<AdmissionStep<R>> {
        let mut signals = Vec::new();
        let step = self.try_admit_locked(id, payload, abort, listener, holds_permit, &mut signals);
        self.emit(signals);
        step
    }

    fn try_admit_locked(
        self: &Arc<Self>,
        id: u64,
        payload: &Arc<T>,
        abort: &Option<AbortToken>,
        listener: &mut Option<AbortListener>,
        holds_permit: &mut bool,
        signals: &mut Vec<Signal<T>>,
    ) -> Result<AdmissionStep<R>> {
        let mut core = self.core.lock();

        if core.disposed {
            signals.push(Signal::Rejected(Arc::clone(payload), Error::Disposed));
            return Err(Error::Disposed);
        }

        if abort.as_ref().is_some_and(AbortToken::is_aborted) {
            if *holds_permit {
                *holds_permit = false;
                self.release_permit_locked(&mut core);
                self.finish(&mut core, signals);
            }
            signals.push(Signal::Canceled(Arc::clone(payload), AbortPhase::Waiting));
            return Err(Error::Aborted(AbortPhase::Waiting));
        }

        if self.needs_permit() {
            if !*holds_permit {
                if core.permits > 0 {
                    core.permits -= 1;
                    *holds_permit = true;
                } else {
                    let (grant, receiver) = oneshot::channel();
                    let waiter_id = self.ids.fetch_add(1, Ordering::Relaxed);
                    core.waiting.push_back(Waiter {
                        id: waiter_id,
                        payload: Arc::clone(payload),
                        grant,
                    });
                    self.finish(&mut core, signals);
                    return Ok(AdmissionStep::Wait(waiter_id, receiver));
                }
            }
        } else if self
            .options
            .max_queue_depth
            .is_some_and(|depth| core.pending.len() >= depth)
        {
            match self.options.policy {
                OverflowPolicy::Reject => {
                    let error = Error::Dropped(OverflowPolicy::Reject);
                    signals.push(Signal::Rejected(Arc::clone(payload), error.clone()));
                    return Err(error);
                }
                OverflowPolicy::DropLatest => {
                    let error = Error::Dropped(OverflowPolicy::DropLatest);
                    signals.push(Signal::Rejected(Arc::clone(payload), error.clone()));
                    return Err(error);
                }
                OverflowPolicy::DropOldest => {
                    if let Some(oldest) = core.pending.pop_front() {
                        if let Some(mut entry) = core.entries.remove(&oldest) {
                            let dropped = Arc::clone(&entry.payload);
                            let error = Error::Dropped(OverflowPolicy::DropOldest);
                            Self::deliver(&mut entry, Err(error.clone()));
                            signals.push(Signal::Rejected(dropped, error));
                        }
                    }
                }
                // A finite-depth block queue is handled by the permit
                // protocol above.
                OverflowPolicy::Block => {}
            }
        }

        let (completion, receiver) = oneshot::channel();
        let now = self.clock.instant();
        core.entries.insert(
            id,
            Entry {
                payload: Arc::clone(payload),
                completion: Some(completion),
                abort: abort.clone(),
                _abort_listener: listener.take(),
                first_enqueued_at: now,
                enqueued_at: now,
                attempt: 0,
                phase: EntryPhase::Pending,
            },
        );
        core.pending.push_back(id);
        *holds_permit = false;
        signals.push(Signal::Queued(Arc::clone(payload)));

        self.pump(&mut core, signals);
        self.finish(&mut core, signals);

        Ok(AdmissionStep::Admitted(receiver))
    }

    async fn wait_for_permit(
        self: &Arc<Self>,
        waiter_id: u64,
        grant: oneshot::Receiver<Result<()>>,
        abort: Option<&AbortToken>,
        payload: &Arc<T>,
    ) -> Result<()> {
        let Some(token) = abort else {
            return grant.await.unwrap_or(Err(Error::Disposed));
        };

        match select(grant, token.aborted()).await {
            Either::Left((granted, _)) => granted.unwrap_or(Err(Error::Disposed)),
            Either::Right(((), _)) => {
                let mut signals = Vec::new();
                {
                    let mut core = self.core.lock();
                    if core.disposed {
                        return Err(Error::Disposed);
                    }

                    let before = core.waiting.len();
                    core.waiting.retain(|waiter| waiter.id != waiter_id);
                    if core.waiting.len() == before {
                        // The permit raced in; hand it back.
                        self.release_permit_locked(&mut core);
                    }

                    signals.push(Signal::Canceled(Arc::clone(payload), AbortPhase::Waiting));
                    self.finish(&mut core, &mut signals);
                }
                self.emit(signals);
                Err(Error::Aborted(AbortPhase::Waiting))
            }
        }
    }

    /// Dispatches while capacity allows. Never suspends.
    fn pump(self: &Arc<Self>, core: &mut Core<T, R>, signals: &mut Vec<Signal<T>>) {
        if core.paused || core.disposed {
            return;
        }

        while core.in_flight.len() < self.options.max_in_flight {
            let Some(id) = core.pending.pop_front() else {
                break;
            };

            self.release_permit_locked(core);

            let now = self.clock.instant();
            let (payload, wait, attempt) = {
                let entry = core
                    .entries
                    .get_mut(&id)
                    .expect("pending ids always have a backing entry");
                let wait = now.saturating_duration_since(entry.enqueued_at);
                entry.phase = EntryPhase::InFlight;
                entry.attempt += 1;
                (Arc::clone(&entry.payload), wait, entry.attempt)
            };
            core.in_flight.insert(id);

            signals.push(Signal::Dispatched(Arc::clone(&payload), wait));

            let future = (self.run)(payload, wait);
            let inner = Arc::clone(self);
            _ = self.spawner.spawn(async move {
                let result = future.await;
                inner.on_run_settled(id, attempt, result);
            });
        }
    }

    /// Outcome of one spawned run future. Stale completions (the entry was
    /// requeued, rejected, or cancelled since the dispatch) are discarded.
    fn on_run_settled(self: &Arc<Self>, id: u64, attempt: u64, result: Result<R>) {
        let mut signals = Vec::new();
        {
            let mut core = self.core.lock();
            if core.disposed || !core.in_flight.contains(&id) {
                return;
            }
            if core.entries.get(&id).is_none_or(|entry| entry.attempt != attempt) {
                return;
            }

            core.in_flight.remove(&id);
            if let Some(mut entry) = core.entries.remove(&id) {
                Self::deliver(&mut entry, result);
            }

            self.pump(&mut core, &mut signals);
            self.finish(&mut core, &mut signals);
        }
        self.emit(signals);
    }

    /// Invoked by the per-entry abort listener. The phase is re-checked
    /// under the lock; waiting-phase aborts are handled inside `enqueue`.
    fn on_token_abort(self: &Arc<Self>, id: u64) {
        let mut signals = Vec::new();
        {
            let mut core = self.core.lock();
            if core.disposed {
                return;
            }
            let Some(phase) = core.entries.get(&id).map(|entry| entry.phase) else {
                return;
            };

            match phase {
                EntryPhase::Pending => {
                    core.pending.retain(|&pending| pending != id);
                    let Some(mut entry) = core.entries.remove(&id) else {
                        return;
                    };
                    let payload = Arc::clone(&entry.payload);
                    Self::deliver(&mut entry, Err(Error::Aborted(AbortPhase::Queued)));
                    drop(entry);

                    self.release_permit_locked(&mut core);
                    signals.push(Signal::Canceled(payload, AbortPhase::Queued));
                    self.finish(&mut core, &mut signals);
                }
                EntryPhase::InFlight => {
                    let Some(entry) = core.entries.get_mut(&id) else {
                        return;
                    };
                    if entry.is_settled() {
                        return;
                    }
                    let payload = Arc::clone(&entry.payload);
                    // The run future is not torn down here; its eventual
                    // completion is discarded and frees the capacity.
                    Self::deliver(entry, Err(Error::Aborted(AbortPhase::InFlight)));
                    signals.push(Signal::Canceled(payload, AbortPhase::InFlight));
                    self.finish(&mut core, &mut signals);
                }
            }
        }
        self.emit(signals);
    }

    fn requeue_in_flight(self: &Arc<Self>, predicate: &dyn Fn(&T) -> bool) -> Vec<Arc<T>> {
        let mut signals = Vec::new();
        let mut requeued = Vec::new();
        {
            let mut core = self.core.lock();
            if core.disposed {
                return requeued;
            }

            let mut matched: Vec<u64> = core
                .in_flight
                .iter()
                .copied()
                .filter(|id| {
                    core.entries
                        .get(id)
                        .is_some_and(|entry| predicate(&entry.payload))
                })
                .collect();
            matched.sort_by_key(|id| {
                let entry = core
                    .entries
                    .get(id)
                    .expect("in-flight ids always have a backing entry");
                (entry.first_enqueued_at, *id)
            });

            // Reverse insertion at the head preserves admission order.
            for id in matched.iter().rev().copied() {
                core.in_flight.remove(&id);

                let (settled, token_aborted) = {
                    let Some(entry) = core.entries.get_mut(&id) else {
                        continue;
                    };
                    // Suppresses the late completion of the prior dispatch.
                    entry.attempt += 1;
                    (
                        entry.is_settled(),
                        entry.abort.as_ref().is_some_and(AbortToken::is_aborted),
                    )
                };

                if settled {
                    core.entries.remove(&id);
                    continue;
                }
                if token_aborted {
                    if let Some(mut entry) = core.entries.remove(&id) {
                        let payload = Arc::clone(&entry.payload);
                        Self::deliver(&mut entry, Err(Error::Aborted(AbortPhase::InFlight)));
                        signals.push(Signal::Canceled(payload, AbortPhase::InFlight));
                    }
                    continue;
                }

                let now = self.clock.instant();
                let payload = {
                    let Some(entry) = core.entries.get_mut(&id) else {
                        continue;
                    };
                    entry.enqueued_at = now;
                    entry.phase = EntryPhase::Pending;
                    Arc::clone(&entry.payload)
                };
                core.pending.push_front(id);
                self.take_permit_locked(&mut core);
                signals.push(Signal::Queued(Arc::clone(&payload)));
                requeued.push(payload);
            }
            requeued.reverse();

            self.pump(&mut core, &mut signals);
            self.finish(&mut core, &mut signals);
        }
        self.emit(signals);
        requeued
    }

    fn reject_in_flight(
        self: &Arc<Self>,
        predicate: &dyn Fn(&T) -> bool,
        error: &Error,
    ) -> Vec<Arc<T>> {
        let mut signals = Vec::new();
        let mut rejected = Vec::new();
        {
            let mut core = self.core.lock();
            if core.disposed {
                return rejected;
            }

            let mut matched: Vec<u64> = core
                .in_flight
                .iter()
                .copied()
                .filter(|id| {
                    core.entries
                        .get(id)
                        .is_some_and(|entry| predicate(&entry.payload))
                })
                .collect();
            matched.sort_by_key(|id| {
                let entry = core
                    .entries
                    .get(id)
                    .expect("in-flight ids always have a backing entry");
                (entry.first_enqueued_at, *id)
            });

            for id in matched {
                core.in_flight.remove(&id);
                if let Some(mut entry) = core.entries.remove(&id) {
                    let payload = Arc::clone(&entry.payload);
                    if !entry.is_settled() {
                        Self::deliver(&mut entry, Err(error.clone()));
                        signals.push(Signal::Rejected(Arc::clone(&payload), error.clone()));
                    }
                    rejected.push(payload);
                }
            }

            self.pump(&mut core, &mut signals);
            self.finish(&mut core, &mut signals);
        }
        self.emit(signals);
        rejected
    }

    fn reject_all(self: &Arc<Self>, error: &Error) -> DrainedWork<T> {
        let mut signals = Vec::new();
        let drained = {
            let mut core = self.core.lock();
            if core.disposed {
                return DrainedWork::default();
            }
            let drained = self.drain_locked(&mut core, error, &mut signals);
            self.finish(&mut core, &mut signals);
            drained
        };
        self.emit(signals);
        drained
    }

    fn drain_locked(
        &self,
        core: &mut Core<T, R>,
        error: &Error,
        signals: &mut Vec<Signal<T>>,
    ) -> DrainedWork<T> {
        let mut drained = DrainedWork::default();

        while let Some(id) = core.pending.pop_front() {
            if let Some(mut entry) = core.entries.remove(&id) {
                let payload = Arc::clone(&entry.payload);
                Self::deliver(&mut entry, Err(error.clone()));
                signals.push(Signal::Rejected(Arc::clone(&payload), error.clone()));
                drained.pending.push(payload);
            }
        }

        while let Some(waiter) = core.waiting.pop_front() {
            signals.push(Signal::Rejected(Arc::clone(&waiter.payload), error.clone()));
            drained.waiting.push(Arc::clone(&waiter.payload));
            _ = waiter.grant.send(Err(error.clone()));
        }

        let now = self.clock.instant();
        let mut in_flight: Vec<u64> = core.in_flight.drain().collect();
        in_flight.sort_by_key(|id| {
            core.entries
                .get(id)
                .map_or((now, *id), |entry| (entry.first_enqueued_at, *id))
        });
        for id in in_flight {
            if let Some(mut entry) = core.entries.remove(&id) {
                let payload = Arc::clone(&entry.payload);
                if !entry.is_settled() {
                    Self::deliver(&mut entry, Err(error.clone()));
                    signals.push(Signal::Rejected(Arc::clone(&payload), error.clone()));
                }
                drained.in_flight.push(payload);
            }
        }

        if self.needs_permit() {
            core.permits = self
                .options
                .max_queue_depth
                .and_then(|depth| isize::try_from(depth).ok())
                .unwrap_or(isize::MAX);
        }

        drained
    }

    fn pause(&self) {
        let mut signals = Vec::new();
        {
            let mut core = self.core.lock();
            if core.disposed || core.paused {
                return;
            }
            core.paused = true;
            self.finish(&mut core, &mut signals);
        }
        self.emit(signals);
    }

    fn resume(self: &Arc<Self>) {
        let mut signals = Vec::new();
        {
            let mut core = self.core.lock();
            if core.disposed || !core.paused {
                return;
            }
            core.paused = false;
            self.pump(&mut core, &mut signals);
            self.finish(&mut core, &mut signals);
        }
        self.emit(signals);
    }

    fn dispose(&self) {
        let mut signals = Vec::new();
        {
            let mut core = self.core.lock();
            if core.disposed {
                return;
            }
            core.disposed = true;
            core.paused = true;
            _ = self.drain_locked(&mut core, &Error::Disposed, &mut signals);
            self.finish(&mut core, &mut signals);
        }
        self.emit(signals);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tick::ClockControl;

    use super::*;
    use crate::{FaultCause, TaskId};

    struct Harness {
        queue: DispatchQueue<u32, u32>,
        control: ClockControl,
        gates: Arc<Mutex<HashMap<u32, oneshot::Sender<Result<u32>>>>>,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new(options: QueueOptions) -> Self {
            let control = ClockControl::new();
            let clock = control.to_clock();
            let gates: Arc<Mutex<HashMap<u32, oneshot::Sender<Result<u32>>>>> =
                Arc::new(Mutex::new(HashMap::new()));
            let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

            let run: RunFn<u32, u32> = {
                let gates = Arc::clone(&gates);
                Arc::new(move |payload: Arc<u32>, _wait| {
                    let (sender, receiver) = oneshot::channel();
                    gates.lock().insert(*payload, sender);
                    Box::pin(async move { receiver.await.unwrap_or(Err(Error::Disposed)) })
                })
            };

            let record = |events: &Arc<Mutex<Vec<String>>>| Arc::clone(events);
            let hooks = QueueHooks::<u32> {
                on_queued: Some(Box::new({
                    let events = record(&events);
                    move |payload| events.lock().push(format!("queued:{payload}"))
                })),
                on_dispatch: Some(Box::new({
                    let events = record(&events);
                    move |payload, wait| {
                        events
                            .lock()
                            .push(format!("dispatch:{payload}:{}", wait.as_millis()));
                    }
                })),
                on_reject: Some(Box::new({
                    let events = record(&events);
                    move |payload, _error| events.lock().push(format!("reject:{payload}"))
                })),
                on_cancel: Some(Box::new({
                    let events = record(&events);
                    move |payload, phase| events.lock().push(format!("cancel:{payload}:{phase}"))
                })),
                on_state_change: None,
                on_idle: Some(Box::new({
                    let events = record(&events);
                    move || events.lock().push("idle".to_string())
                })),
                on_active: Some(Box::new({
                    let events = record(&events);
                    move || events.lock().push("active".to_string())
                })),
            };

            let queue = DispatchQueue::new(options, &clock, Spawner::new_tokio(), run, hooks);
            Self {
                queue,
                control,
                gates,
                events,
            }
        }

        fn resolve(&self, id: u32, value: u32) {
            let sender = self
                .gates
                .lock()
                .remove(&id)
                .expect("no run gate registered for this id");
            _ = sender.send(Ok(value));
        }

        fn take_gate(&self, id: u32) -> oneshot::Sender<Result<u32>> {
            self.gates
                .lock()
                .remove(&id)
                .expect("no run gate registered for this id")
        }

        fn has_gate(&self, id: u32) -> bool {
            self.gates.lock().contains_key(&id)
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn dispatch_order(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter(|event| event.starts_with("dispatch:"))
                .collect()
        }
    }

    fn submit(harness: &Harness, id: u32) -> tokio::task::JoinHandle<Result<u32>> {
        submit_with(harness, id, None)
    }

    fn submit_with(
        harness: &Harness,
        id: u32,
        abort: Option<AbortToken>,
    ) -> tokio::task::JoinHandle<Result<u32>> {
        let queue = harness.queue.clone();
        tokio::spawn(async move { queue.enqueue(id, abort).await })
    }

    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    fn crashed() -> Error {
        Error::WorkerCrashed {
            task: TaskId::new("t"),
            slot: 0,
            cause: FaultCause::new("boom"),
        }
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(DispatchQueue<u32, u32>: Send, Sync, Clone);
        static_assertions::assert_impl_all!(QueueState: Send, Sync, Clone);
    }

    #[tokio::test]
    async fn resolves_in_fifo_order() {
        let harness = Harness::new(QueueOptions::new(1));

        let a = submit(&harness, 1);
        settle().await;
        let b = submit(&harness, 2);
        settle().await;

        harness.resolve(1, 10);
        settle().await;
        harness.resolve(2, 20);

        assert_eq!(a.await.unwrap().unwrap(), 10);
        assert_eq!(b.await.unwrap().unwrap(), 20);
        assert_eq!(harness.dispatch_order(), ["dispatch:1:0", "dispatch:2:0"]);
    }

    #[tokio::test]
    async fn block_backpressure_walks_through_all_three_phases() {
        let harness = Harness::new(
            QueueOptions::new(1)
                .max_queue_depth(Some(1))
                .policy(OverflowPolicy::Block),
        );

        let a = submit(&harness, 1);
        settle().await;
        let b = submit(&harness, 2);
        settle().await;
        let c = submit(&harness, 3);
        settle().await;

        let state = harness.queue.state();
        assert_eq!((state.in_flight, state.pending, state.waiting), (1, 1, 1));

        harness.resolve(1, 10);
        settle().await;
        let state = harness.queue.state();
        assert_eq!((state.in_flight, state.pending, state.waiting), (1, 1, 0));
        assert!(harness.has_gate(2));

        harness.resolve(2, 20);
        settle().await;
        harness.resolve(3, 30);
        settle().await;

        assert_eq!(a.await.unwrap().unwrap(), 10);
        assert_eq!(b.await.unwrap().unwrap(), 20);
        assert_eq!(c.await.unwrap().unwrap(), 30);
    }

    #[tokio::test]
    async fn reject_policy_refuses_the_newcomer() {
        let harness = Harness::new(
            QueueOptions::new(1)
                .max_queue_depth(Some(1))
                .policy(OverflowPolicy::Reject),
        );

        let a = submit(&harness, 1);
        settle().await;
        let b = submit(&harness, 2);
        settle().await;
        let c = submit(&harness, 3);
        settle().await;

        assert!(matches!(
            c.await.unwrap(),
            Err(Error::Dropped(OverflowPolicy::Reject))
        ));

        // The incumbents are untouched.
        harness.resolve(1, 10);
        settle().await;
        harness.resolve(2, 20);
        assert_eq!(a.await.unwrap().unwrap(), 10);
        assert_eq!(b.await.unwrap().unwrap(), 20);
    }

    #[tokio::test]
    async fn drop_latest_reports_its_own_reason() {
        let harness = Harness::new(
            QueueOptions::new(1)
                .max_queue_depth(Some(1))
                .policy(OverflowPolicy::DropLatest),
        );

        let _a = submit(&harness, 1);
        settle().await;
        let _b = submit(&harness, 2);
        settle().await;
        let c = submit(&harness, 3);
        settle().await;

        assert!(matches!(
            c.await.unwrap(),
            Err(Error::Dropped(OverflowPolicy::DropLatest))
        ));
    }

    #[tokio::test]
    async fn drop_oldest_displaces_the_pending_head() {
        let harness = Harness::new(
            QueueOptions::new(1)
                .max_queue_depth(Some(1))
                .policy(OverflowPolicy::DropOldest),
        );

        let a = submit(&harness, 1);
        settle().await;
        let b = submit(&harness, 2);
        settle().await;
        let c = submit(&harness, 3);
        settle().await;

        assert!(matches!(
            b.await.unwrap(),
            Err(Error::Dropped(OverflowPolicy::DropOldest))
        ));

        harness.resolve(1, 10);
        settle().await;
        harness.resolve(3, 30);
        assert_eq!(a.await.unwrap().unwrap(), 10);
        assert_eq!(c.await.unwrap().unwrap(), 30);
    }

    #[tokio::test]
    async fn pre_aborted_token_fails_without_admission() {
        let harness = Harness::new(QueueOptions::new(1));

        let handle = ripcord::AbortHandle::new();
        handle.abort();

        let a = submit_with(&harness, 9, Some(handle.token()));
        settle().await;

        assert!(matches!(
            a.await.unwrap(),
            Err(Error::Aborted(AbortPhase::Waiting))
        ));
        assert!(harness.events().contains(&"cancel:9:waiting".to_string()));
        assert_eq!(harness.queue.state().pending, 0);
    }

    #[tokio::test]
    async fn abort_while_waiting_withdraws_the_permit_request() {
        let harness = Harness::new(
            QueueOptions::new(1)
                .max_queue_depth(Some(1))
                .policy(OverflowPolicy::Block),
        );

        let _a = submit(&harness, 1);
        settle().await;
        let _b = submit(&harness, 2);
        settle().await;

        let handle = ripcord::AbortHandle::new();
        let c = submit_with(&harness, 3, Some(handle.token()));
        settle().await;
        assert_eq!(harness.queue.state().waiting, 1);

        handle.abort();
        settle().await;

        assert!(matches!(
            c.await.unwrap(),
            Err(Error::Aborted(AbortPhase::Waiting))
        ));
        assert!(harness.events().contains(&"cancel:3:waiting".to_string()));
        let state = harness.queue.state();
        assert_eq!((state.in_flight, state.pending, state.waiting), (1, 1, 0));
    }

    #[tokio::test]
    async fn abort_while_queued_removes_the_entry() {
        let harness = Harness::new(QueueOptions::new(1));

        let _a = submit(&harness, 1);
        settle().await;
        let handle = ripcord::AbortHandle::new();
        let b = submit_with(&harness, 2, Some(handle.token()));
        settle().await;

        handle.abort();
        settle().await;

        assert!(matches!(
            b.await.unwrap(),
            Err(Error::Aborted(AbortPhase::Queued))
        ));
        assert!(harness.events().contains(&"cancel:2:queued".to_string()));
        assert_eq!(harness.queue.state().pending, 0);
    }

    #[tokio::test]
    async fn abort_while_in_flight_settles_early_but_holds_capacity() {
        let harness = Harness::new(QueueOptions::new(1));

        let handle = ripcord::AbortHandle::new();
        let a = submit_with(&harness, 1, Some(handle.token()));
        settle().await;
        let b = submit(&harness, 2);
        settle().await;

        handle.abort();
        settle().await;

        assert!(matches!(
            a.await.unwrap(),
            Err(Error::Aborted(AbortPhase::InFlight))
        ));
        assert!(harness.events().contains(&"cancel:1:in flight".to_string()));

        // Capacity is only released once the abandoned run settles.
        assert!(!harness.has_gate(2));
        harness.resolve(1, 99);
        settle().await;
        assert!(harness.has_gate(2));

        harness.resolve(2, 20);
        assert_eq!(b.await.unwrap().unwrap(), 20);
    }

    #[tokio::test]
    async fn stale_completion_is_discarded_after_requeue() {
        let harness = Harness::new(QueueOptions::new(1));

        let a = submit(&harness, 1);
        settle().await;

        let old_gate = harness.take_gate(1);
        let requeued = harness.queue.requeue_in_flight(|_| true);
        assert_eq!(requeued.len(), 1);
        settle().await;

        // The retry is already dispatched; the stale result must not win.
        assert!(harness.has_gate(1));
        _ = old_gate.send(Ok(99));
        settle().await;
        assert!(!a.is_finished());

        harness.resolve(1, 7);
        assert_eq!(a.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn requeue_preserves_admission_order_at_the_head() {
        let harness = Harness::new(QueueOptions::new(2));

        let _a = submit(&harness, 1);
        settle().await;
        let _b = submit(&harness, 2);
        settle().await;
        let _c = submit(&harness, 3);
        settle().await;

        // 1 and 2 are in flight, 3 is pending.
        _ = harness.take_gate(1);
        _ = harness.take_gate(2);
        let requeued = harness.queue.requeue_in_flight(|_| true);
        assert_eq!(requeued.iter().map(|p| **p).collect::<Vec<_>>(), [1, 2]);
        settle().await;

        assert_eq!(
            harness.dispatch_order(),
            [
                "dispatch:1:0",
                "dispatch:2:0",
                "dispatch:1:0",
                "dispatch:2:0"
            ]
        );

        harness.resolve(1, 10);
        settle().await;
        assert!(harness.has_gate(3));
    }

    #[tokio::test]
    async fn reject_in_flight_delivers_the_error_and_frees_capacity() {
        let harness = Harness::new(QueueOptions::new(1));

        let a = submit(&harness, 1);
        settle().await;
        let b = submit(&harness, 2);
        settle().await;

        let rejected = harness.queue.reject_in_flight(|payload| *payload == 1, &crashed());
        assert_eq!(rejected.len(), 1);
        settle().await;

        assert!(matches!(
            a.await.unwrap(),
            Err(Error::WorkerCrashed { slot: 0, .. })
        ));
        assert!(harness.events().contains(&"reject:1".to_string()));

        harness.resolve(2, 20);
        assert_eq!(b.await.unwrap().unwrap(), 20);
    }

    #[tokio::test]
    async fn reject_all_drains_every_phase_and_resets_permits() {
        let harness = Harness::new(
            QueueOptions::new(1)
                .max_queue_depth(Some(1))
                .policy(OverflowPolicy::Block),
        );

        let a = submit(&harness, 1);
        settle().await;
        let b = submit(&harness, 2);
        settle().await;
        let c = submit(&harness, 3);
        settle().await;

        let drained = harness.queue.reject_all(&crashed());
        settle().await;

        assert_eq!(drained.in_flight.len(), 1);
        assert_eq!(drained.pending.len(), 1);
        assert_eq!(drained.waiting.len(), 1);
        assert!(matches!(a.await.unwrap(), Err(Error::WorkerCrashed { .. })));
        assert!(matches!(b.await.unwrap(), Err(Error::WorkerCrashed { .. })));
        assert!(matches!(c.await.unwrap(), Err(Error::WorkerCrashed { .. })));

        // Permits are back at full depth; a new call sails through.
        let d = submit(&harness, 4);
        settle().await;
        harness.resolve(4, 40);
        assert_eq!(d.await.unwrap().unwrap(), 40);
    }

    #[tokio::test]
    async fn dispose_rejects_everything_and_stays_terminal() {
        let harness = Harness::new(QueueOptions::new(1));

        let a = submit(&harness, 1);
        settle().await;
        let b = submit(&harness, 2);
        settle().await;

        harness.queue.dispose();
        settle().await;

        assert!(matches!(a.await.unwrap(), Err(Error::Disposed)));
        assert!(matches!(b.await.unwrap(), Err(Error::Disposed)));
        assert!(matches!(
            harness.queue.enqueue(9, None).await,
            Err(Error::Disposed)
        ));

        let state = harness.queue.state();
        assert!(state.disposed);
        assert_eq!((state.in_flight, state.pending), (0, 0));

        // A straggling run completion is ignored.
        harness.resolve(1, 99);
        settle().await;
    }

    #[tokio::test]
    async fn paused_queue_admits_but_does_not_dispatch() {
        let harness = Harness::new(QueueOptions::new(1));

        harness.queue.pause();
        let a = submit(&harness, 1);
        settle().await;
        assert_eq!(harness.queue.state().pending, 1);
        assert!(!harness.has_gate(1));

        harness.control.advance(Duration::from_millis(5));
        harness.queue.resume();
        settle().await;

        // The dispatch records the time spent waiting in the queue.
        assert_eq!(harness.dispatch_order(), ["dispatch:1:5"]);

        harness.resolve(1, 10);
        assert_eq!(a.await.unwrap().unwrap(), 10);
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_the_limit() {
        let harness = Harness::new(QueueOptions::new(2));

        let handles: Vec<_> = (1..=5).map(|id| submit(&harness, id)).collect();
        settle().await;

        let state = harness.queue.state();
        assert_eq!((state.in_flight, state.pending), (2, 3));
        assert!(harness.has_gate(1) && harness.has_gate(2));
        assert!(!harness.has_gate(3));

        for id in 1..=5 {
            harness.resolve(id, id * 10);
            settle().await;
        }
        for (index, handle) in handles.into_iter().enumerate() {
            let id = u32::try_from(index).unwrap() + 1;
            assert_eq!(handle.await.unwrap().unwrap(), id * 10);
        }
    }

    #[tokio::test]
    async fn waiters_are_granted_in_fifo_order() {
        let harness = Harness::new(
            QueueOptions::new(1)
                .max_queue_depth(Some(1))
                .policy(OverflowPolicy::Block),
        );

        let a = submit(&harness, 1);
        settle().await;
        let b = submit(&harness, 2);
        settle().await;
        let c = submit(&harness, 3);
        settle().await;
        let d = submit(&harness, 4);
        settle().await;
        assert_eq!(harness.queue.state().waiting, 2);

        harness.resolve(1, 10);
        settle().await;

        // Exactly one waiter proceeded, and it was the first one.
        let state = harness.queue.state();
        assert_eq!((state.in_flight, state.pending, state.waiting), (1, 1, 1));

        harness.resolve(2, 20);
        settle().await;
        harness.resolve(3, 30);
        settle().await;
        harness.resolve(4, 40);
        settle().await;

        assert_eq!(a.await.unwrap().unwrap(), 10);
        assert_eq!(b.await.unwrap().unwrap(), 20);
        assert_eq!(c.await.unwrap().unwrap(), 30);
        assert_eq!(d.await.unwrap().unwrap(), 40);
    }

    #[tokio::test]
    async fn requeue_overfill_keeps_permit_accounting_exact() {
        let harness = Harness::new(
            QueueOptions::new(1)
                .max_queue_depth(Some(1))
                .policy(OverflowPolicy::Block),
        );

        let a = submit(&harness, 1);
        settle().await;
        let b = submit(&harness, 2);
        settle().await;
        let c = submit(&harness, 3);
        settle().await;

        // Requeue the in-flight head: Pending transiently overfills.
        _ = harness.take_gate(1);
        harness.queue.requeue_in_flight(|_| true);
        settle().await;

        // 1 is dispatched again; 2 still pending; 3 still waiting because
        // the balance has not recovered yet.
        let state = harness.queue.state();
        assert_eq!((state.in_flight, state.pending, state.waiting), (1, 1, 1));

        harness.resolve(1, 10);
        settle().await;
        let state = harness.queue.state();
        assert_eq!((state.in_flight, state.pending, state.waiting), (1, 1, 0));

        harness.resolve(2, 20);
        settle().await;
        harness.resolve(3, 30);
        settle().await;

        assert_eq!(a.await.unwrap().unwrap(), 10);
        assert_eq!(b.await.unwrap().unwrap(), 20);
        assert_eq!(c.await.unwrap().unwrap(), 30);
    }

    #[tokio::test]
    async fn idle_and_active_edges_fire_once_per_transition() {
        let harness = Harness::new(QueueOptions::new(1));

        let a = submit(&harness, 1);
        settle().await;
        harness.resolve(1, 10);
        settle().await;
        _ = a.await.unwrap();

        let edges: Vec<String> = harness
            .events()
            .into_iter()
            .filter(|event| event == "idle" || event == "active")
            .collect();
        assert_eq!(edges, ["active", "idle"]);
    }
}
