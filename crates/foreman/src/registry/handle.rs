// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyspawn::Spawner;
use futures_util::future::{Either, select};
use ripcord::{AbortHandle, AbortRegistry, AbortToken};
use tick::{Clock, Delay};

use super::options::KeyFn;
use super::surface::{ForemanInner, TaskState};
use crate::{CallOptions, Executor, ExecutorKind, Result, TaskId};

/// Immutable per-call options applied through [`TaskHandle::with`].
#[derive(Clone, Default)]
pub struct CallOverlay {
    pub(crate) abort: Option<AbortToken>,
    pub(crate) timeout: Option<Duration>,
}

impl CallOverlay {
    /// An empty overlay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Includes a caller-supplied cancellation token.
    #[must_use]
    pub fn abort(mut self, token: AbortToken) -> Self {
        self.abort = Some(token);
        self
    }

    /// Overrides the task's per-call timeout for these calls.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for CallOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOverlay")
            .field("abort", &self.abort.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub(crate) struct TaskInner<A, R> {
    pub(crate) id: TaskId,
    pub(crate) name: Option<String>,
    pub(crate) kind: ExecutorKind,
    pub(crate) executor: Arc<dyn Executor<A, R>>,
    pub(crate) key_of: Option<KeyFn<A>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) clock: Clock,
    pub(crate) spawner: Spawner,
    pub(crate) aborts: Arc<AbortRegistry>,
    pub(crate) registry: Weak<ForemanInner>,
}

impl<A, R> TaskInner<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    pub(crate) fn task_state(&self) -> TaskState {
        TaskState {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            executor: self.executor.state(),
        }
    }

    /// Composes the per-call cancellation token from the derived key, the
    /// per-task timeout, and the overlay, then dispatches.
    fn call(
        self: &Arc<Self>,
        method: Arc<str>,
        args: A,
        overlay: Option<&CallOverlay>,
    ) -> impl Future<Output = Result<R>> + Send + 'static + use<A, R> {
        let key = self.key_of.as_ref().map(|key_of| key_of(&args));
        let key_token = key.as_ref().map(|key| self.aborts.token_for(key));

        let timeout = overlay.and_then(|overlay| overlay.timeout).or(self.timeout);
        let (timeout_token, disarm) = match timeout {
            Some(duration) => {
                let (token, disarm) = self.arm_timeout(duration);
                (Some(token), Some(disarm))
            }
            None => (None, None),
        };

        let overlay_token = overlay.and_then(|overlay| overlay.abort.clone());

        let mut tokens: Vec<AbortToken> = [key_token, timeout_token, overlay_token]
            .into_iter()
            .flatten()
            .collect();
        let abort = match tokens.len() {
            0 => None,
            1 => tokens.pop(),
            _ => Some(AbortToken::any(tokens)),
        };

        let future = self.executor.dispatch(method, args, CallOptions { abort, key });
        async move {
            let result = future.await;
            if let Some(disarm) = disarm {
                // Clears the timeout timer.
                disarm.abort();
            }
            result
        }
    }

    /// One-shot timeout token: fires after `duration` unless disarmed
    /// first, in which case the timer is dropped.
    fn arm_timeout(&self, duration: Duration) -> (AbortToken, AbortHandle) {
        let fire = AbortHandle::new();
        let token = fire.token();
        let disarm = AbortHandle::new();
        let disarmed = disarm.token();

        let clock = self.clock.clone();
        _ = self.spawner.spawn(async move {
            let delay = Delay::new(&clock, duration);
            if let Either::Left(((), _)) = select(delay, disarmed.aborted()).await {
                fire.abort();
            }
        });

        (token, disarm)
    }
}

/// Typed call surface of one registered task.
///
/// Obtained from [`Foreman::define_task`][crate::Foreman::define_task].
/// Cloning is cheap; all clones refer to the same task.
pub struct TaskHandle<A, R> {
    pub(crate) inner: Arc<TaskInner<A, R>>,
}

impl<A, R> Clone for TaskHandle<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> fmt::Debug for TaskHandle<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish_non_exhaustive()
    }
}

impl<A, R> TaskHandle<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    /// The task's id.
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.inner.id
    }

    /// Dispatches one call and awaits its outcome.
    pub fn call<M: Into<Arc<str>>>(
        &self,
        method: M,
        args: A,
    ) -> impl Future<Output = Result<R>> + Send + 'static + use<A, R, M> {
        self.inner.call(method.into(), args, None)
    }

    /// Returns a call surface with per-call options applied.
    #[must_use]
    pub fn with(&self, overlay: CallOverlay) -> ScopedTask<A, R> {
        ScopedTask {
            handle: self.clone(),
            overlay,
        }
    }

    /// Snapshot of the task and its executor.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.task_state()
    }

    /// Resumes the task; recovers a halted task.
    pub fn start_workers(&self) {
        self.inner.executor.start_workers();
    }

    /// Pauses the task and tears its workers down, preserving admitted
    /// work.
    pub fn stop_workers(&self) {
        self.inner.executor.stop_workers();
    }

    /// Tears the task down and removes it from the registry.
    pub fn dispose(&self) {
        self.inner.executor.dispose();
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(&self.inner.id);
        }
    }
}

/// A task handle with an immutable per-call options overlay.
pub struct ScopedTask<A, R> {
    handle: TaskHandle<A, R>,
    overlay: CallOverlay,
}

impl<A, R> ScopedTask<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Dispatches one call with the overlay applied.
    pub fn call<M: Into<Arc<str>>>(
        &self,
        method: M,
        args: A,
    ) -> impl Future<Output = Result<R>> + Send + 'static + use<A, R, M> {
        self.handle
            .inner
            .call(method.into(), args, Some(&self.overlay))
    }
}

impl<A, R> fmt::Debug for ScopedTask<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedTask")
            .field("id", &self.handle.inner.id)
            .field("overlay", &self.overlay)
            .finish()
    }
}
