// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::signal::Shared;

/// Future returned by [`AbortToken::aborted`][crate::AbortToken::aborted].
///
/// Resolves with `()` when the signal fires. Dropping the future before it
/// resolves unregisters its waker.
pub struct Aborted {
    shared: Arc<Shared>,
    key: Option<u64>,
}

impl Aborted {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared, key: None }
    }
}

impl Future for Aborted {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let mut state = this.shared.state.lock();
        if state.aborted {
            this.key = None;
            return Poll::Ready(());
        }

        match this.key {
            Some(key) => {
                // Only the waker from the most recent poll may be woken.
                if let Some(slot) = state.wakers.iter_mut().find(|(k, _)| *k == key) {
                    slot.1 = cx.waker().clone();
                } else {
                    state.wakers.push((key, cx.waker().clone()));
                }
            }
            None => {
                let key = Shared::next_key(&mut state);
                state.wakers.push((key, cx.waker().clone()));
                this.key = Some(key);
            }
        }

        Poll::Pending
    }
}

impl Drop for Aborted {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.shared.state.lock().wakers.retain(|(k, _)| *k != key);
        }
    }
}

impl fmt::Debug for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aborted")
            .field("registered", &self.key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::task::Waker;

    use futures::FutureExt;

    use super::*;
    use crate::AbortHandle;

    #[test]
    fn resolves_after_fire() {
        let handle = AbortHandle::new();
        let token = handle.token();

        let mut aborted = Box::pin(token.aborted());
        let mut cx = Context::from_waker(Waker::noop());
        assert!(aborted.poll_unpin(&mut cx).is_pending());

        handle.abort();
        assert!(aborted.poll_unpin(&mut cx).is_ready());
    }

    #[test]
    fn resolves_immediately_when_already_fired() {
        let handle = AbortHandle::new();
        handle.abort();

        futures::executor::block_on(handle.token().aborted());
    }

    #[test]
    fn drop_unregisters_waker() {
        let handle = AbortHandle::new();
        let token = handle.token();

        let mut aborted = Box::pin(token.aborted());
        let mut cx = Context::from_waker(Waker::noop());
        assert!(aborted.poll_unpin(&mut cx).is_pending());
        drop(aborted);

        // Firing after the future is gone must not touch stale wakers.
        handle.abort();
        assert!(token.is_aborted());
    }
}
