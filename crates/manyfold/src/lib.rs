// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Applies an async operation to each item of an iterable with bounded
//! concurrency, yielding results as a lazy stream in completion order.
//!
//! The operator pulls items eagerly up to the configured limit, keeps the
//! in-flight set full, and yields whichever computation finishes first.
//! Completion order, not submission order, is observable.
//!
//! # Example
//!
//! ```
//! use futures::StreamExt;
//! use manyfold::manyfold;
//!
//! # futures::executor::block_on(async {
//! let doubled: Vec<u32> = manyfold(1..=4_u32, 2, |n| {
//!     let n = *n;
//!     async move { Ok::<u32, &'static str>(n * 2) }
//! })
//! .stream()
//! .filter_map(|result| async move { result.ok() })
//! .collect()
//! .await;
//!
//! assert_eq!(doubled.iter().sum::<u32>(), 20);
//! # });
//! ```
//!
//! # Failure modes
//!
//! - Fail-fast (the default): the first rejection is yielded as `Err`
//!   after the on-error hook runs, and the stream ends. Outstanding
//!   computations are not torn down; wire cancellation through the abort
//!   token if they should stop.
//! - [`continue_on_error`][Manyfold::continue_on_error]: rejections are
//!   consumed (after the hook) and only successes are yielded.
//! - [`settled`][Manyfold::settled]: every item yields a
//!   [`Settled`] wrapper and item failures never end the stream.
//!
//! # Keyed cancellation
//!
//! With [`with_keys`][Manyfold::with_keys], items whose key is already
//! aborted in the [`AbortRegistry`][ripcord::AbortRegistry] are skipped
//! before submission, and completions whose key aborted while running are
//! dropped rather than yielded (except in settled mode).

mod operator;
mod streams;

pub use operator::{Manyfold, manyfold};
pub use streams::{ManyfoldStream, Settled, SettledStream};
