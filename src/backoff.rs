//! Exponential backoff for failed proactive connection attempts.
//!
//! Grafting dials mesh candidates that are not currently connected. Without
//! a backoff record an unreachable candidate would be re-dialed on every
//! heartbeat. Records clear on the first successful dial and expire after a
//! long idle window so stale failures do not gate retries forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::peer::PeerId;

#[derive(Clone, Debug)]
struct BackoffEntry {
    consecutive_failures: u32,
    last_failure: Instant,
    next_retry: Instant,
}

/// Per-peer dial-failure backoff tracker.
pub struct ConnectBackoff {
    base: Duration,
    max: Duration,
    inner: Mutex<HashMap<PeerId, BackoffEntry>>,
}

impl ConnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// True while `now` is before the peer's earliest-retry time.
    pub fn is_in_backoff(&self, peer: &PeerId, now: Instant) -> bool {
        let table = self.lock();
        table.get(peer).is_some_and(|e| now < e.next_retry)
    }

    /// Record a failed dial: `backoff = min(base * 2^(failures-1), max)`.
    pub fn record_failure(&self, peer: &PeerId, now: Instant) {
        let mut table = self.lock();
        let entry = table.entry(peer.clone()).or_insert(BackoffEntry {
            consecutive_failures: 0,
            last_failure: now,
            next_retry: now,
        });
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_failure = now;
        let exp = entry.consecutive_failures.saturating_sub(1).min(16);
        let backoff = self.base.saturating_mul(1 << exp).min(self.max);
        entry.next_retry = now + backoff;
        trace!(
            peer = %peer,
            failures = entry.consecutive_failures,
            backoff_ms = backoff.as_millis() as u64,
            "recorded dial failure"
        );
    }

    /// A successful dial deletes the record entirely.
    pub fn clear_on_success(&self, peer: &PeerId) {
        let mut table = self.lock();
        table.remove(peer);
    }

    /// Purge records whose last failure is older than `expiry`, letting
    /// retry pressure reset naturally for long-silent peers.
    pub fn cleanup_expired(&self, now: Instant, expiry: Duration) {
        let mut table = self.lock();
        let before = table.len();
        table.retain(|_, e| now.duration_since(e.last_failure) <= expiry);
        let removed = before - table.len();
        if removed > 0 {
            trace!(removed, remaining = table.len(), "purged stale backoff records");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, BackoffEntry>> {
        self.inner.lock().expect("backoff lock poisoned")
    }
}
