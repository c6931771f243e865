// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::task::Waker;

use parking_lot::Mutex;

use crate::Aborted;

type Callback = Box<dyn FnOnce() + Send>;

/// Shared core of one signal. Held by every handle, token, listener guard
/// and pending [`Aborted`][crate::Aborted] future derived from it.
pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
}

pub(crate) struct State {
    pub(crate) aborted: bool,
    next_key: u64,
    callbacks: Vec<(u64, Callback)>,
    pub(crate) wakers: Vec<(u64, Waker)>,
    // Registrations a composed token holds on its inputs. Kept here so
    // they live exactly as long as the composed signal can still fire.
    upstream: Vec<AbortListener>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                aborted: false,
                next_key: 0,
                callbacks: Vec::new(),
                wakers: Vec::new(),
                upstream: Vec::new(),
            }),
        })
    }

    /// Flips the flag and drains every observer. Idempotent.
    fn fire(self: &Arc<Self>) {
        let (callbacks, wakers, upstream) = {
            let mut state = self.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;

            (
                mem::take(&mut state.callbacks),
                mem::take(&mut state.wakers),
                mem::take(&mut state.upstream),
            )
        };

        // Observers run outside the lock so they may touch the token.
        for (_, callback) in callbacks {
            callback();
        }
        for (_, waker) in wakers {
            waker.wake();
        }
        drop(upstream);
    }

    pub(crate) fn next_key(state: &mut State) -> u64 {
        let key = state.next_key;
        state.next_key = state.next_key.wrapping_add(1);
        key
    }
}

/// The write side of a single-fire abort signal.
///
/// Cloning produces another handle to the same signal; firing any clone
/// fires them all. Dropping every handle without firing leaves the signal
/// permanently unfired.
#[derive(Clone)]
pub struct AbortHandle {
    shared: Arc<Shared>,
}

impl AbortHandle {
    /// Creates a fresh, unfired signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
        }
    }

    /// Returns a token observing this signal.
    #[must_use]
    pub fn token(&self) -> AbortToken {
        AbortToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fires the signal. Safe to call multiple times; only the first call
    /// has any effect.
    pub fn abort(&self) {
        self.shared.fire();
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().aborted
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// The read side of a single-fire abort signal.
#[derive(Clone)]
pub struct AbortToken {
    pub(crate) shared: Arc<Shared>,
}

impl AbortToken {
    /// A token that never fires.
    #[must_use]
    pub fn never() -> Self {
        // The only handle is dropped immediately, so nothing can fire it.
        AbortHandle::new().token()
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().aborted
    }

    /// Registers a callback invoked at most once, when the signal fires.
    ///
    /// If the signal has already fired, the callback runs immediately on
    /// the current thread. Dropping the returned [`AbortListener`]
    /// unregisters the callback.
    pub fn on_abort(&self, callback: impl FnOnce() + Send + 'static) -> AbortListener {
        {
            let mut state = self.shared.state.lock();
            if !state.aborted {
                let key = Shared::next_key(&mut state);
                state.callbacks.push((key, Box::new(callback)));

                return AbortListener {
                    shared: Arc::downgrade(&self.shared),
                    key: Some(key),
                };
            }
        }

        callback();
        AbortListener {
            shared: Weak::new(),
            key: None,
        }
    }

    /// Returns a future that resolves when the signal fires.
    ///
    /// Dropping the future unregisters its waker.
    #[must_use]
    pub fn aborted(&self) -> Aborted {
        Aborted::new(Arc::clone(&self.shared))
    }

    /// Composes several tokens into one that fires when any input fires.
    ///
    /// If any input has already fired, the returned token starts out
    /// fired. The composed token owns its registrations on the inputs, so
    /// the inputs may be dropped freely.
    #[must_use]
    pub fn any<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let handle = AbortHandle::new();
        let out = handle.token();

        for token in tokens {
            if handle.is_aborted() {
                break;
            }

            let upstream_handle = handle.clone();
            let guard = token.on_abort(move || upstream_handle.abort());

            let mut state = out.shared.state.lock();
            if !state.aborted {
                state.upstream.push(guard);
            }
        }

        out
    }
}

impl fmt::Debug for AbortToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortToken")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// RAII registration of an `on_abort` callback.
///
/// Dropping the listener removes the callback if it has not yet run.
pub struct AbortListener {
    shared: Weak<Shared>,
    key: Option<u64>,
}

impl AbortListener {
    /// Detaches the guard, leaving the callback registered for the
    /// lifetime of the signal.
    pub fn forget(mut self) {
        self.key = None;
    }
}

impl Drop for AbortListener {
    fn drop(&mut self) {
        let Some(key) = self.key else {
            return;
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        shared.state.lock().callbacks.retain(|(k, _)| *k != key);
    }
}

impl fmt::Debug for AbortListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortListener")
            .field("registered", &self.key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(AbortHandle: Send, Sync, Clone);
        static_assertions::assert_impl_all!(AbortToken: Send, Sync, Clone);
        static_assertions::assert_impl_all!(AbortListener: Send, Sync);
    }

    #[test]
    fn abort_flips_flag_once() {
        let handle = AbortHandle::new();
        let token = handle.token();

        assert!(!token.is_aborted());
        handle.abort();
        assert!(token.is_aborted());

        // Second fire is a no-op.
        handle.abort();
        assert!(token.is_aborted());
    }

    #[test]
    fn callback_runs_on_fire() {
        let handle = AbortHandle::new();
        let token = handle.token();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let listener = token.on_abort(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        handle.abort();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(listener);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_runs_immediately_when_already_aborted() {
        let handle = AbortHandle::new();
        handle.abort();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        _ = handle.token().on_abort(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_listener_never_fires() {
        let handle = AbortHandle::new();
        let token = handle.token();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let listener = token.on_abort(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        drop(listener);

        handle.abort();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn forgotten_listener_fires() {
        let handle = AbortHandle::new();
        let token = handle.token();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        token
            .on_abort(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .forget();

        handle.abort();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_token_does_not_fire() {
        let token = AbortToken::never();
        assert!(!token.is_aborted());
    }

    #[test]
    fn any_fires_when_first_input_fires() {
        let a = AbortHandle::new();
        let b = AbortHandle::new();

        let composed = AbortToken::any([a.token(), b.token()]);
        assert!(!composed.is_aborted());

        b.abort();
        assert!(composed.is_aborted());

        // Firing the other input afterwards changes nothing.
        a.abort();
        assert!(composed.is_aborted());
    }

    #[test]
    fn any_starts_fired_when_an_input_already_fired() {
        let a = AbortHandle::new();
        a.abort();

        let composed = AbortToken::any([a.token(), AbortToken::never()]);
        assert!(composed.is_aborted());
    }

    #[test]
    fn any_of_nothing_never_fires() {
        let composed = AbortToken::any([]);
        assert!(!composed.is_aborted());
    }

    #[test]
    fn any_survives_dropped_inputs() {
        let a = AbortHandle::new();
        let composed = {
            let token = a.token();
            AbortToken::any([token])
        };

        a.abort();
        assert!(composed.is_aborted());
    }

    #[test]
    fn callback_may_use_the_token() {
        // The callback runs after the internal lock is released, so
        // re-entrant use of the signal must not deadlock.
        let handle = AbortHandle::new();
        let token = handle.token();

        let observed = Arc::new(AtomicUsize::new(0));
        let observed_clone = Arc::clone(&observed);
        let reentrant = token.clone();
        token
            .on_abort(move || {
                if reentrant.is_aborted() {
                    observed_clone.fetch_add(1, Ordering::SeqCst);
                }
            })
            .forget();

        handle.abort();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}
