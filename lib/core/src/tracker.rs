// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request/response correlation with timeout-bounded waiting.
//!
//! A sender registers how many responses it expects and receives a
//! process-unique request id; response ingress paths report arrivals by id;
//! the sender suspends on [`MessageTracker::wait`] until the counts match or
//! the timeout expires. Request ids are never reused, so a response that
//! arrives after its entry was reaped can be recognized and discarded
//! instead of corrupting a later request.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

#[derive(Debug, Clone, Copy)]
struct TrackEntry {
    expected: u32,
    received: u32,
}

#[derive(Debug, Default)]
struct TrackerInner {
    next_request_id: u64,
    entries: HashMap<u64, TrackEntry>,
}

/// Correlates asynchronous request/response pairs.
///
/// All map operations are serialized by a single mutex; waiters re-check the
/// predicate under that mutex on every wake.
#[derive(Debug, Default)]
pub struct MessageTracker {
    inner: Mutex<TrackerInner>,
    arrivals: Notify,
}

impl MessageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new request expecting `expected` responses and returns
    /// its request id. Ids are strictly increasing, start at 1 and are never
    /// reused for the lifetime of the process.
    pub fn add_message_track(&self, expected: u32) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_request_id += 1;
        let request_id = inner.next_request_id;
        inner.entries.insert(
            request_id,
            TrackEntry {
                expected,
                received: 0,
            },
        );
        request_id
    }

    /// Records one response arrival for `request_id` and wakes all waiters.
    ///
    /// An unknown id means the request was already reaped (wait returned
    /// before the response landed); that race is tolerated and logged, never
    /// an error.
    pub fn notify_message_arrival(&self, request_id: u64) {
        {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(&request_id) {
                Some(entry) if entry.received < entry.expected => entry.received += 1,
                Some(entry) => {
                    tracing::warn!(
                        request_id,
                        expected = entry.expected,
                        "dropping response in excess of the expected count"
                    );
                }
                None => {
                    tracing::warn!(request_id, "response arrived for a removed request id");
                }
            }
        }
        self.arrivals.notify_waiters();
    }

    /// Suspends until all expected responses for `request_id` arrived or
    /// `timeout` elapsed. The entry is erased before returning regardless of
    /// outcome; returns `true` on success, `false` on timeout.
    ///
    /// Waiting on an id that was never registered (or already reaped)
    /// returns `false` immediately.
    pub async fn wait(&self, request_id: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let completed = loop {
            // Register interest before checking the predicate so an arrival
            // between the check and the await is not lost.
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock();
                match inner.entries.get(&request_id) {
                    Some(entry) if entry.received == entry.expected => break true,
                    Some(_) => {}
                    None => {
                        tracing::warn!(request_id, "waiting on an unknown request id");
                        return false;
                    }
                }
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                break false;
            }
        };
        self.inner.lock().entries.remove(&request_id);
        if !completed {
            tracing::debug!(request_id, "timed out waiting for responses");
        }
        completed
    }

    /// Non-blocking probe: `true` when the request is exactly one response
    /// short of complete.
    ///
    /// Advisory only. The snapshot can be stale by the time the caller acts
    /// on it; never branch on this for correctness.
    pub fn check_message_track(&self, request_id: u64) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&request_id)
            .map(|entry| entry.expected == entry.received + 1)
            .unwrap_or(false)
    }
}
