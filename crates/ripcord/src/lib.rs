// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-fire abort signals.
//!
//! This crate provides the cancellation primitive used throughout the task
//! runtime: a pair of [`AbortHandle`] (the write side) and [`AbortToken`]
//! (the read side). A token fires at most once; observers can check the
//! flag synchronously, register a callback, or await the signal as a
//! future.
//!
//! # Overview
//!
//! - [`AbortHandle`] - Fires the signal. Cloneable; any clone may fire.
//! - [`AbortToken`] - Observes the signal. Cloneable and cheap to pass
//!   around.
//! - [`AbortListener`] - RAII registration returned by
//!   [`AbortToken::on_abort`]; dropping it unregisters the callback.
//! - [`AbortToken::any`] - Composes several tokens into one that fires
//!   when any input fires.
//! - [`AbortRegistry`] - Maps caller-chosen keys to one-shot signals.
//!
//! # Example
//!
//! ```
//! use ripcord::AbortHandle;
//!
//! let handle = AbortHandle::new();
//! let token = handle.token();
//!
//! assert!(!token.is_aborted());
//! handle.abort();
//! assert!(token.is_aborted());
//! ```
//!
//! # Thread safety
//!
//! All types are `Send` and `Sync`. Callbacks registered via `on_abort`
//! are invoked on the thread that calls [`AbortHandle::abort`], after the
//! internal lock has been released, so a callback may freely use the token
//! it was registered on.

mod aborted;
mod registry;
mod signal;

pub use aborted::Aborted;
pub use registry::AbortRegistry;
pub use signal::{AbortHandle, AbortListener, AbortToken};
