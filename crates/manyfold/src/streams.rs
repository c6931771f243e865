// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;

use crate::operator::Engine;

/// The outcome wrapper yielded by [`SettledStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled<T, R, E> {
    /// The computation resolved with a value.
    Fulfilled {
        /// The input item.
        item: T,
        /// The produced value.
        value: R,
    },
    /// The computation rejected.
    Rejected {
        /// The input item.
        item: T,
        /// The produced error.
        error: E,
    },
}

impl<T, R, E> Settled<T, R, E> {
    /// Whether the computation resolved with a value.
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled { .. })
    }

    /// The input item the outcome belongs to.
    pub fn item(&self) -> &T {
        match self {
            Self::Fulfilled { item, .. } | Self::Rejected { item, .. } => item,
        }
    }
}

/// Stream yielded by [`Manyfold::stream`][crate::Manyfold::stream].
pub struct ManyfoldStream<T, R, E> {
    engine: Engine<T, R, E>,
    fail_fast: bool,
    terminated: bool,
}

// No field is structurally pinned; every future is boxed.
impl<T, R, E> Unpin for ManyfoldStream<T, R, E> {}

impl<T, R, E> ManyfoldStream<T, R, E> {
    pub(crate) fn new(engine: Engine<T, R, E>, fail_fast: bool) -> Self {
        Self {
            engine,
            fail_fast,
            terminated: false,
        }
    }
}

impl<T, R: 'static, E: 'static> Stream for ManyfoldStream<T, R, E> {
    type Item = Result<R, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }

        loop {
            match this.engine.poll_completion(cx) {
                Poll::Ready(Some(completion)) => {
                    if completion.key_aborted {
                        continue;
                    }
                    match completion.result {
                        Ok(value) => return Poll::Ready(Some(Ok(value))),
                        Err(error) => {
                            this.engine.report_error(&completion.item, &error);
                            if this.fail_fast {
                                this.terminated = true;
                                return Poll::Ready(Some(Err(error)));
                            }
                        }
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T, R, E> fmt::Debug for ManyfoldStream<T, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManyfoldStream")
            .field("fail_fast", &self.fail_fast)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

/// Stream yielded by [`Manyfold::settled`][crate::Manyfold::settled].
///
/// Every input yields exactly one [`Settled`] wrapper; item failures
/// never end the stream.
pub struct SettledStream<T, R, E> {
    engine: Engine<T, R, E>,
}

// No field is structurally pinned; every future is boxed.
impl<T, R, E> Unpin for SettledStream<T, R, E> {}

impl<T, R, E> SettledStream<T, R, E> {
    pub(crate) fn new(engine: Engine<T, R, E>) -> Self {
        Self { engine }
    }
}

impl<T, R: 'static, E: 'static> Stream for SettledStream<T, R, E> {
    type Item = Settled<T, R, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.engine.poll_completion(cx) {
            Poll::Ready(Some(completion)) => {
                let settled = match completion.result {
                    Ok(value) => Settled::Fulfilled {
                        item: completion.item,
                        value,
                    },
                    Err(error) => {
                        this.engine.report_error(&completion.item, &error);
                        Settled::Rejected {
                            item: completion.item,
                            error,
                        }
                    }
                };
                Poll::Ready(Some(settled))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, R, E> fmt::Debug for SettledStream<T, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettledStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::task::Waker;

    use futures_channel::oneshot;
    use futures_util::StreamExt;
    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;
    use ripcord::{AbortHandle, AbortRegistry};

    use super::*;
    use crate::manyfold;

    #[derive(Default)]
    struct Gateboard {
        gates: Mutex<HashMap<u32, oneshot::Sender<Result<u32, String>>>>,
        starts: Mutex<Vec<u32>>,
    }

    impl Gateboard {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn op(
            self: &Arc<Self>,
        ) -> impl FnMut(&u32) -> BoxFuture<'static, Result<u32, String>> + Send + 'static {
            let board = Arc::clone(self);
            move |item: &u32| {
                let (sender, receiver) = oneshot::channel();
                board.gates.lock().insert(*item, sender);
                board.starts.lock().push(*item);
                Box::pin(async move {
                    receiver
                        .await
                        .unwrap_or_else(|_| Err("gate dropped".to_string()))
                })
            }
        }

        fn resolve(&self, item: u32, value: u32) {
            let gate = self.gates.lock().remove(&item).expect("no gate for item");
            _ = gate.send(Ok(value));
        }

        fn fail(&self, item: u32, error: &str) {
            let gate = self.gates.lock().remove(&item).expect("no gate for item");
            _ = gate.send(Err(error.to_string()));
        }

        fn starts(&self) -> Vec<u32> {
            self.starts.lock().clone()
        }
    }

    fn poll<S: Stream + Unpin>(stream: &mut S) -> Poll<Option<S::Item>> {
        let mut cx = Context::from_waker(Waker::noop());
        stream.poll_next_unpin(&mut cx)
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(ManyfoldStream<u32, u32, String>: Send, Unpin);
        static_assertions::assert_impl_all!(SettledStream<u32, u32, String>: Send, Unpin);
    }

    #[test]
    #[should_panic(expected = "concurrency limit must be at least 1")]
    fn zero_limit_is_a_programmer_error() {
        _ = manyfold(Vec::<u32>::new(), 0, |_| async { Ok::<u32, String>(0) });
    }

    #[test]
    fn yields_in_completion_order_with_bounded_concurrency() {
        let board = Gateboard::new();
        let mut stream = manyfold(vec![1_u32, 2, 3, 4], 2, board.op()).stream();

        assert!(poll(&mut stream).is_pending());
        assert_eq!(board.starts(), [1, 2]);

        board.resolve(2, 20);
        assert_eq!(poll(&mut stream), Poll::Ready(Some(Ok(20))));

        assert!(poll(&mut stream).is_pending());
        assert_eq!(board.starts(), [1, 2, 3]);

        board.resolve(3, 30);
        assert_eq!(poll(&mut stream), Poll::Ready(Some(Ok(30))));
        assert!(poll(&mut stream).is_pending());
        assert_eq!(board.starts(), [1, 2, 3, 4]);

        board.resolve(4, 40);
        assert_eq!(poll(&mut stream), Poll::Ready(Some(Ok(40))));
        board.resolve(1, 10);
        assert_eq!(poll(&mut stream), Poll::Ready(Some(Ok(10))));
        assert_eq!(poll(&mut stream), Poll::Ready(None));
    }

    #[test]
    fn fail_fast_yields_the_error_and_ends() {
        let board = Gateboard::new();
        let errors: Arc<Mutex<Vec<(u32, String)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut stream = manyfold(vec![1_u32, 2], 2, board.op())
            .on_error({
                let errors = Arc::clone(&errors);
                move |item, error: &String| errors.lock().push((*item, error.clone()))
            })
            .stream();

        assert!(poll(&mut stream).is_pending());
        board.fail(1, "boom");

        assert_eq!(
            poll(&mut stream),
            Poll::Ready(Some(Err("boom".to_string())))
        );
        assert_eq!(poll(&mut stream), Poll::Ready(None));
        assert_eq!(errors.lock().as_slice(), [(1, "boom".to_string())]);
    }

    #[test]
    fn continue_mode_consumes_rejections() {
        let board = Gateboard::new();
        let errors: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let mut stream = manyfold(vec![1_u32, 2], 2, board.op())
            .continue_on_error()
            .on_error({
                let errors = Arc::clone(&errors);
                move |item, _error: &String| errors.lock().push(*item)
            })
            .stream();

        assert!(poll(&mut stream).is_pending());
        board.fail(1, "boom");
        board.resolve(2, 20);

        assert_eq!(poll(&mut stream), Poll::Ready(Some(Ok(20))));
        assert_eq!(poll(&mut stream), Poll::Ready(None));
        assert_eq!(errors.lock().as_slice(), [1]);
    }

    #[test]
    fn settled_mode_wraps_every_outcome() {
        let board = Gateboard::new();
        let mut stream = manyfold(vec![1_u32, 2], 2, board.op()).settled();

        assert!(poll(&mut stream).is_pending());
        board.fail(1, "boom");
        board.resolve(2, 20);

        assert_eq!(
            poll(&mut stream),
            Poll::Ready(Some(Settled::Rejected {
                item: 1,
                error: "boom".to_string()
            }))
        );
        assert_eq!(
            poll(&mut stream),
            Poll::Ready(Some(Settled::Fulfilled { item: 2, value: 20 }))
        );
        assert_eq!(poll(&mut stream), Poll::Ready(None));
    }

    #[test]
    fn pre_aborted_keys_are_skipped() {
        let board = Gateboard::new();
        let registry = Arc::new(AbortRegistry::new());
        registry.abort("key-2");

        let mut stream = manyfold(vec![1_u32, 2, 3], 1, board.op())
            .with_keys(|item| Arc::from(format!("key-{item}")), &registry)
            .stream();

        assert!(poll(&mut stream).is_pending());
        assert_eq!(board.starts(), [1]);

        board.resolve(1, 10);
        assert_eq!(poll(&mut stream), Poll::Ready(Some(Ok(10))));

        // 2 is skipped; 3 starts in its place.
        assert!(poll(&mut stream).is_pending());
        assert_eq!(board.starts(), [1, 3]);

        board.resolve(3, 30);
        assert_eq!(poll(&mut stream), Poll::Ready(Some(Ok(30))));
        assert_eq!(poll(&mut stream), Poll::Ready(None));
    }

    #[test]
    fn results_whose_key_aborted_mid_flight_are_dropped() {
        let board = Gateboard::new();
        let registry = Arc::new(AbortRegistry::new());

        let mut stream = manyfold(vec![1_u32, 2], 1, board.op())
            .with_keys(|item| Arc::from(format!("key-{item}")), &registry)
            .stream();

        assert!(poll(&mut stream).is_pending());
        registry.abort("key-1");
        board.resolve(1, 10);

        // The completion of 1 is dropped, not yielded.
        assert!(poll(&mut stream).is_pending());
        assert_eq!(board.starts(), [1, 2]);

        board.resolve(2, 20);
        assert_eq!(poll(&mut stream), Poll::Ready(Some(Ok(20))));
        assert_eq!(poll(&mut stream), Poll::Ready(None));
    }

    #[test]
    fn abort_token_stops_pulling_new_items() {
        let board = Gateboard::new();
        let handle = AbortHandle::new();

        let mut stream = manyfold(vec![1_u32, 2, 3, 4], 1, board.op())
            .with_abort(handle.token())
            .stream();

        assert!(poll(&mut stream).is_pending());
        assert_eq!(board.starts(), [1]);

        handle.abort();
        board.resolve(1, 10);

        // The in-flight computation still settles; nothing new starts.
        assert_eq!(poll(&mut stream), Poll::Ready(Some(Ok(10))));
        assert_eq!(poll(&mut stream), Poll::Ready(None));
        assert_eq!(board.starts(), [1]);
    }
}
