// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-flight call accounting.
//!
//! An [`InFlightTracker`] counts outstanding work with RAII guards and lets a
//! coordinator wait for the count to reach zero. The same tracker type gates
//! three things:
//!
//! - **views**: calls resolved against a view hold a guard on that view until
//!   they reach a terminal state, so a membership update can wait for the
//!   outgoing view to quiesce;
//! - **connections**: calls hold a lease on the connection they were bound to,
//!   so a retired connection is torn down only after its last call finishes;
//! - **executors**: async calls hold a guard until their result is recorded,
//!   which is what `wait_for_all_pending_nodes` waits on.
//!
//! Hot-path cost: one atomic increment and one atomic decrement per call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Shared in-flight counter with drain notification.
#[derive(Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl InFlightTracker {
    /// Create a new tracker. Open, zero in-flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a guard. The guard increments the counter on creation and
    /// decrements it on drop.
    ///
    /// Guards are still acquirable after [`close`](Self::close): a call that
    /// resolved just before the close must still be counted.
    pub fn acquire(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    /// Mark the tracked resource as superseded. Monotonic.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Whether [`close`](Self::close) has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Current number of outstanding guards.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until the in-flight count reaches zero. Returns immediately if it
    /// already is.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            // Register interest before checking the counter so a guard dropped
            // between the check and the await is not missed.
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// [`wait_for_drain`](Self::wait_for_drain) bounded by `limit`. Returns
    /// `true` if the tracker drained in time.
    pub async fn wait_for_drain_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_for_drain())
            .await
            .is_ok()
    }
}

impl std::fmt::Debug for InFlightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightTracker")
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

/// RAII guard that decrements the in-flight counter on drop.
pub struct InFlightGuard {
    inner: Arc<TrackerInner>,
}

impl InFlightGuard {
    /// Explicitly complete this guard (equivalent to dropping it).
    pub fn complete(self) {}
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InFlightGuard")
    }
}
