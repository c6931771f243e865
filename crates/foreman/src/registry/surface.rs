// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyspawn::Spawner;
use futures_util::StreamExt;
use futures_util::future::{Either, select};
use parking_lot::Mutex;
use ripcord::{AbortHandle, AbortRegistry};
use tick::{Clock, PeriodicTimer};

use super::handle::{TaskHandle, TaskInner};
use super::options::TaskOptions;
use crate::{
    Executor, ExecutorKind, ExecutorState, Pool, PoolConfig, QueueOptions, Singleton,
    SingletonConfig, TaskId, WorkerFactory,
};

/// Snapshot of one registered task.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct TaskState {
    /// The task's id.
    pub id: TaskId,
    /// The task's human-readable name, if any.
    pub name: Option<String>,
    /// Which kind of executor backs the task.
    pub kind: ExecutorKind,
    /// The executor's state, including queue and worker details.
    pub executor: ExecutorState,
}

pub(crate) trait TaskStatus: Send + Sync {
    fn snapshot(&self) -> TaskState;
}

impl<A, R> TaskStatus for TaskInner<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    fn snapshot(&self) -> TaskState {
        self.task_state()
    }
}

/// Options of [`Foreman::watch_states`].
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub(crate) period: Duration,
    pub(crate) only_changes: bool,
    pub(crate) skip_initial: bool,
}

impl WatchOptions {
    /// Emits every `period`.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            only_changes: false,
            skip_initial: false,
        }
    }

    /// Emits only when the snapshot differs from the previous one.
    #[must_use]
    pub fn only_changes(mut self) -> Self {
        self.only_changes = true;
        self
    }

    /// Suppresses the immediate emission at subscription time.
    #[must_use]
    pub fn skip_initial(mut self) -> Self {
        self.skip_initial = true;
        self
    }
}

/// Stops a state subscription when dropped.
#[derive(Debug)]
pub struct WatchGuard {
    stop: AbortHandle,
}

impl WatchGuard {
    /// Stops the subscription.
    pub fn stop(self) {}
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.stop.abort();
    }
}

/// The task runtime surface.
///
/// Registers tasks, owns the keyed cancellation registry shared by all of
/// them, and provides read-only snapshots of every registered task.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use anyspawn::Spawner;
/// use foreman::{Foreman, TaskOptions, WorkerFactory};
/// use tick::Clock;
///
/// # async fn example(clock: Clock, factory: Arc<dyn WorkerFactory<String, String>>) {
/// let foreman = Foreman::new(&clock, Spawner::new_tokio());
///
/// let resize = foreman.define_task(
///     TaskOptions::parallel().name("resize").pool_size(4),
///     factory,
/// );
///
/// let result = resize.call("scale", "photo.png".to_string()).await;
/// # _ = result;
/// # }
/// ```
pub struct Foreman {
    inner: Arc<ForemanInner>,
}

pub(crate) struct ForemanInner {
    clock: Clock,
    spawner: Spawner,
    aborts: Arc<AbortRegistry>,
    tasks: Mutex<Vec<(TaskId, Weak<dyn TaskStatus>)>>,
}

impl ForemanInner {
    pub(crate) fn task_states(&self) -> Vec<TaskState> {
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, task)| task.strong_count() > 0);
        tasks
            .iter()
            .filter_map(|(_, task)| task.upgrade().map(|task| task.snapshot()))
            .collect()
    }

    pub(crate) fn remove(&self, id: &TaskId) {
        self.tasks.lock().retain(|(task_id, _)| task_id != id);
    }
}

impl Foreman {
    /// Creates a runtime surface with no registered tasks.
    #[must_use]
    pub fn new(clock: &Clock, spawner: Spawner) -> Self {
        Self {
            inner: Arc::new(ForemanInner {
                clock: clock.clone(),
                spawner,
                aborts: Arc::new(AbortRegistry::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The keyed cancellation registry shared by every task of this
    /// runtime.
    #[must_use]
    pub fn aborts(&self) -> &Arc<AbortRegistry> {
        &self.inner.aborts
    }

    /// Registers a task and returns its typed call handle.
    pub fn define_task<A, R>(
        &self,
        options: TaskOptions<A>,
        factory: Arc<dyn WorkerFactory<A, R>>,
    ) -> TaskHandle<A, R>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
    {
        let id = options.id.unwrap_or_else(TaskId::generate);

        let executor: Arc<dyn Executor<A, R>> = match options.kind {
            ExecutorKind::Parallel => {
                let size = options.pool_size.unwrap_or_else(default_pool_size);
                let queue = QueueOptions::new(options.max_in_flight.unwrap_or(size))
                    .max_queue_depth(options.max_queue_depth.unwrap_or(Some(size * 2)))
                    .policy(options.queue_policy);

                let mut config = PoolConfig::new(id.clone(), size)
                    .queue(queue)
                    .init(options.init)
                    .crash_policy(options.crash_policy)
                    .crash_max_retries(options.crash_max_retries)
                    .idle_timeout(options.idle_timeout);
                if let Some(sink) = options.events {
                    config = config.events(sink);
                }

                Arc::new(Pool::new(
                    config,
                    factory,
                    &self.inner.clock,
                    self.inner.spawner.clone(),
                ))
            }
            ExecutorKind::Singleton => {
                let queue = QueueOptions::new(options.max_in_flight.unwrap_or(1))
                    .max_queue_depth(options.max_queue_depth.unwrap_or(Some(2)))
                    .policy(options.queue_policy);

                let mut config = SingletonConfig::new(id.clone())
                    .queue(queue)
                    .init(options.init)
                    .crash_policy(options.crash_policy)
                    .crash_max_retries(options.crash_max_retries)
                    .idle_timeout(options.idle_timeout);
                if let Some(sink) = options.events {
                    config = config.events(sink);
                }

                Arc::new(Singleton::new(
                    config,
                    factory,
                    &self.inner.clock,
                    self.inner.spawner.clone(),
                ))
            }
        };

        let inner = Arc::new(TaskInner {
            id: id.clone(),
            name: options.name,
            kind: options.kind,
            executor,
            key_of: options.key_of,
            timeout: options.timeout,
            clock: self.inner.clock.clone(),
            spawner: self.inner.spawner.clone(),
            aborts: Arc::clone(&self.inner.aborts),
            registry: Arc::downgrade(&self.inner),
        });

        let status: Arc<dyn TaskStatus> = Arc::clone(&inner) as Arc<dyn TaskStatus>;
        self.inner.tasks.lock().push((id, Arc::downgrade(&status)));

        TaskHandle { inner }
    }

    /// Snapshot of every registered task.
    #[must_use]
    pub fn task_states(&self) -> Vec<TaskState> {
        self.inner.task_states()
    }

    /// Emits the task-state vector to `listener` on the given cadence
    /// until the returned guard is dropped.
    pub fn watch_states(
        &self,
        options: WatchOptions,
        listener: impl Fn(&[TaskState]) + Send + 'static,
    ) -> WatchGuard {
        let stop = AbortHandle::new();
        let stop_token = stop.token();
        let inner = Arc::clone(&self.inner);

        _ = self.inner.spawner.spawn(async move {
            // The baseline for change detection is captured either way;
            // `skip_initial` only suppresses the emission.
            let snapshot = inner.task_states();
            if !options.skip_initial {
                listener(&snapshot);
            }
            let mut last: Option<Vec<TaskState>> = Some(snapshot);

            let mut timer = PeriodicTimer::new(&inner.clock, options.period);
            loop {
                match select(timer.next(), stop_token.aborted()).await {
                    Either::Left((Some(()), _)) => {
                        let snapshot = inner.task_states();
                        if !options.only_changes || last.as_ref() != Some(&snapshot) {
                            listener(&snapshot);
                        }
                        last = Some(snapshot);
                    }
                    _ => break,
                }
            }
        });

        WatchGuard { stop }
    }
}

impl fmt::Debug for Foreman {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Foreman")
            .field("tasks", &self.inner.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}
