// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::Stream;
use ripcord::{AbortRegistry, AbortToken};

use crate::streams::{ManyfoldStream, SettledStream};

type BoxedIter<T> = Box<dyn Iterator<Item = T> + Send>;
type BoxedOp<T, R, E> = Box<dyn FnMut(&T) -> BoxFuture<'static, Result<R, E>> + Send>;
type KeyFn<T> = Box<dyn Fn(&T) -> Arc<str> + Send + Sync>;
type ErrorHook<T, E> = Box<dyn FnMut(&T, &E) + Send>;

/// Creates a [`Manyfold`] operator over `items` with at most `limit`
/// computations in flight.
///
/// # Panics
///
/// Panics if `limit` is zero; that is a programmer error, not a runtime
/// condition.
pub fn manyfold<I, F, Fut, R, E>(items: I, limit: usize, mut op: F) -> Manyfold<I::Item, R, E>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    F: FnMut(&I::Item) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    assert!(limit >= 1, "concurrency limit must be at least 1");

    Manyfold {
        engine: Engine {
            items: Box::new(items.into_iter()),
            op: Box::new(move |item| Box::pin(op(item))),
            limit,
            abort: None,
            key_of: None,
            registry: None,
            on_error: None,
            in_flight: FuturesUnordered::new(),
            parked: HashMap::new(),
            next_index: 0,
            exhausted: false,
        },
        continue_on_error: false,
    }
}

/// Builder for the bounded-concurrency pipeline operator. Created by
/// [`manyfold`]; finished with [`stream`][Self::stream] or
/// [`settled`][Self::settled].
pub struct Manyfold<T, R, E> {
    pub(crate) engine: Engine<T, R, E>,
    pub(crate) continue_on_error: bool,
}

impl<T, R, E> Manyfold<T, R, E> {
    /// Stops pulling new items once `token` fires. Computations already
    /// in flight still settle and are yielded.
    #[must_use]
    pub fn with_abort(mut self, token: AbortToken) -> Self {
        self.engine.abort = Some(token);
        self
    }

    /// Derives a cancellation key per item. Items whose key is aborted in
    /// `registry` are skipped before submission; completions whose key
    /// aborted while running are dropped (except in settled mode).
    #[must_use]
    pub fn with_keys(
        mut self,
        key_of: impl Fn(&T) -> Arc<str> + Send + Sync + 'static,
        registry: &Arc<AbortRegistry>,
    ) -> Self {
        self.engine.key_of = Some(Box::new(key_of));
        self.engine.registry = Some(Arc::clone(registry));
        self
    }

    /// Invoked for every rejected item before the rejection is yielded,
    /// consumed, or wrapped.
    #[must_use]
    pub fn on_error(mut self, hook: impl FnMut(&T, &E) + Send + 'static) -> Self {
        self.engine.on_error = Some(Box::new(hook));
        self
    }

    /// Consumes rejections instead of ending the stream on the first one.
    #[must_use]
    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// A stream of `Result`s: successes yield `Ok`; the first rejection
    /// yields `Err` and ends the stream, unless
    /// [`continue_on_error`][Self::continue_on_error] is set, in which
    /// case rejections are consumed.
    #[must_use]
    pub fn stream(self) -> ManyfoldStream<T, R, E> {
        ManyfoldStream::new(self.engine, !self.continue_on_error)
    }

    /// A stream of [`Settled`][crate::Settled] wrappers that never ends
    /// early on item failures.
    #[must_use]
    pub fn settled(self) -> SettledStream<T, R, E> {
        SettledStream::new(self.engine)
    }
}

impl<T, R, E> fmt::Debug for Manyfold<T, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manyfold")
            .field("limit", &self.engine.limit)
            .field("continue_on_error", &self.continue_on_error)
            .finish_non_exhaustive()
    }
}

/// One finished computation, before mode-specific handling.
pub(crate) struct Completion<T, R, E> {
    pub(crate) item: T,
    pub(crate) key_aborted: bool,
    pub(crate) result: Result<R, E>,
}

pub(crate) struct Engine<T, R, E> {
    items: BoxedIter<T>,
    op: BoxedOp<T, R, E>,
    limit: usize,
    abort: Option<AbortToken>,
    key_of: Option<KeyFn<T>>,
    registry: Option<Arc<AbortRegistry>>,
    on_error: Option<ErrorHook<T, E>>,
    in_flight: FuturesUnordered<BoxFuture<'static, (u64, Result<R, E>)>>,
    parked: HashMap<u64, (T, Option<Arc<str>>)>,
    next_index: u64,
    exhausted: bool,
}

impl<T, R: 'static, E: 'static> Engine<T, R, E> {
    /// Tops the in-flight set up to the limit, skipping items whose key
    /// is already aborted.
    fn fill(&mut self) {
        while self.in_flight.len() < self.limit && !self.exhausted {
            if self.abort.as_ref().is_some_and(AbortToken::is_aborted) {
                self.exhausted = true;
                break;
            }
            let Some(item) = self.items.next() else {
                self.exhausted = true;
                break;
            };

            let key = self.key_of.as_ref().map(|key_of| key_of(&item));
            if let (Some(key), Some(registry)) = (&key, &self.registry) {
                if registry.is_aborted(key) {
                    continue;
                }
            }

            let future = (self.op)(&item);
            let index = self.next_index;
            self.next_index += 1;
            self.parked.insert(index, (item, key));
            self.in_flight
                .push(Box::pin(async move { (index, future.await) }));
        }
    }

    pub(crate) fn poll_completion(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Completion<T, R, E>>> {
        self.fill();

        match Pin::new(&mut self.in_flight).poll_next(cx) {
            Poll::Ready(Some((index, result))) => {
                let (item, key) = self
                    .parked
                    .remove(&index)
                    .expect("every in-flight computation has a parked item");

                let key_aborted = match (&key, &self.registry) {
                    (Some(key), Some(registry)) => registry.is_aborted(key),
                    _ => false,
                };

                Poll::Ready(Some(Completion {
                    item,
                    key_aborted,
                    result,
                }))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    pub(crate) fn report_error(&mut self, item: &T, error: &E) {
        if let Some(hook) = &mut self.on_error {
            hook(item, error);
        }
    }
}
