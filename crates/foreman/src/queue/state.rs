// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::OverflowPolicy;

/// Point-in-time snapshot of a [`DispatchQueue`][crate::DispatchQueue].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct QueueState {
    /// Entries currently executing.
    pub in_flight: usize,
    /// Entries admitted and awaiting dispatch.
    pub pending: usize,
    /// Callers waiting for a pending permit (block policy only).
    pub waiting: usize,
    /// The configured in-flight limit.
    pub max_in_flight: usize,
    /// The configured pending depth; `None` is unbounded.
    pub max_queue_depth: Option<usize>,
    /// The configured overflow policy.
    pub policy: OverflowPolicy,
    /// Whether the pump is suspended.
    pub paused: bool,
    /// Whether the queue has been torn down.
    pub disposed: bool,
}
