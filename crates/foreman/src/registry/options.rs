// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    CrashPolicy, EventSink, ExecutorKind, InitMode, OverflowPolicy, TaskId,
};

/// Derives a cancellation key from a call's arguments.
pub type KeyFn<A> = Arc<dyn Fn(&A) -> Arc<str> + Send + Sync>;

/// Configuration accepted at task registration.
///
/// Unset fields fall back to the standard defaults: a parallel task sizes
/// its pool to the hardware concurrency (or 4 when unknown), allows
/// pool-size calls in flight and twice that pending; a singleton allows
/// one in flight and two pending. Both default to the block overflow
/// policy, lazy worker spawn, and restart-fail-in-flight crash handling
/// with three tolerated consecutive crashes.
pub struct TaskOptions<A> {
    pub(crate) id: Option<TaskId>,
    pub(crate) name: Option<String>,
    pub(crate) kind: ExecutorKind,
    pub(crate) init: InitMode,
    pub(crate) pool_size: Option<usize>,
    pub(crate) max_in_flight: Option<usize>,
    pub(crate) max_queue_depth: Option<Option<usize>>,
    pub(crate) queue_policy: OverflowPolicy,
    pub(crate) crash_policy: CrashPolicy,
    pub(crate) crash_max_retries: u32,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) key_of: Option<KeyFn<A>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) events: Option<EventSink>,
}

impl<A> TaskOptions<A> {
    fn with_kind(kind: ExecutorKind) -> Self {
        Self {
            id: None,
            name: None,
            kind,
            init: InitMode::default(),
            pool_size: None,
            max_in_flight: None,
            max_queue_depth: None,
            queue_policy: OverflowPolicy::Block,
            crash_policy: CrashPolicy::default(),
            crash_max_retries: 3,
            idle_timeout: None,
            key_of: None,
            timeout: None,
            events: None,
        }
    }

    /// Options for a task backed by a parallel worker pool.
    #[must_use]
    pub fn parallel() -> Self {
        Self::with_kind(ExecutorKind::Parallel)
    }

    /// Options for a task backed by a single worker.
    #[must_use]
    pub fn singleton() -> Self {
        Self::with_kind(ExecutorKind::Singleton)
    }

    /// Overrides the auto-generated task id.
    #[must_use]
    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attaches a human-readable name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Selects lazy or eager worker spawn.
    #[must_use]
    pub fn init(mut self, init: InitMode) -> Self {
        self.init = init;
        self
    }

    /// Pool size (parallel tasks only).
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Maximum calls in flight.
    #[must_use]
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = Some(limit);
        self
    }

    /// Maximum pending calls; `None` is unbounded.
    #[must_use]
    pub fn max_queue_depth(mut self, depth: Option<usize>) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    /// Overflow policy applied when the pending depth is full.
    #[must_use]
    pub fn queue_policy(mut self, policy: OverflowPolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    /// Crash policy.
    #[must_use]
    pub fn crash_policy(mut self, policy: CrashPolicy) -> Self {
        self.crash_policy = policy;
        self
    }

    /// Consecutive crashes tolerated before escalation.
    #[must_use]
    pub fn crash_max_retries(mut self, retries: u32) -> Self {
        self.crash_max_retries = retries;
        self
    }

    /// Tears idle workers down after this long.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Derives a cancellation key from each call's arguments; calls whose
    /// key is aborted in the runtime's registry are cancelled.
    #[must_use]
    pub fn key_of(mut self, key_of: impl Fn(&A) -> Arc<str> + Send + Sync + 'static) -> Self {
        self.key_of = Some(Arc::new(key_of));
        self
    }

    /// Per-call timeout; expiry cancels the call like any other abort.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches an event sink.
    #[must_use]
    pub fn events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }
}

impl<A> fmt::Debug for TaskOptions<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("init", &self.init)
            .field("pool_size", &self.pool_size)
            .field("max_in_flight", &self.max_in_flight)
            .field("max_queue_depth", &self.max_queue_depth)
            .field("queue_policy", &self.queue_policy)
            .field("crash_policy", &self.crash_policy)
            .field("crash_max_retries", &self.crash_max_retries)
            .field("idle_timeout", &self.idle_timeout)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
