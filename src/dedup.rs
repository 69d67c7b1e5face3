//! Message deduplication: recently-seen tracking and the message cache.
//!
//! Two structures with deliberately different lifecycles:
//!
//! | Structure | Bound | Purpose |
//! |-----------|-------|---------|
//! | [`SeenSet`] | TTL sweep only | authoritative "already processed?" check |
//! | [`MessageCache`] | capacity + TTL | retained message bodies |
//!
//! The seen-set MUST be consulted before any processing side effect
//! (scoring, caching, forwarding) so each message id is processed locally
//! at most once. The cache is an independent convenience store and may
//! evict entries the seen-set still remembers.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::wire::{MessageId, WireMessage};

/// A cached message with its insertion timestamp.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub message: WireMessage,
    pub inserted_at: Instant,
}

/// Bounded store of recently-received message bodies.
///
/// Capacity overflow evicts the single oldest entry. Reads use `peek` so the
/// internal LRU order stays insertion order and the eviction victim is
/// always the oldest insertion.
pub struct MessageCache {
    inner: Mutex<LruCache<MessageId, CacheEntry>>,
}

impl MessageCache {
    /// Create a cache holding at most `max_messages` entries.
    pub fn new(max_messages: usize) -> Self {
        let cap = NonZeroUsize::new(max_messages.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Insert a message keyed by its derived id, evicting the oldest entry
    /// if the cache is full.
    pub fn put(&self, message: WireMessage) {
        let id = message.id();
        let entry = CacheEntry {
            message,
            inserted_at: Instant::now(),
        };
        let mut cache = self.inner.lock().expect("cache lock poisoned");
        if cache.len() == cache.cap().get() && !cache.contains(&id) {
            if let Some((evicted, _)) = cache.pop_lru() {
                trace!(evicted = %hex_prefix(&evicted), "message cache full, evicted oldest entry");
            }
        }
        cache.put(id, entry);
    }

    /// Look up a message body by id.
    pub fn get(&self, id: &MessageId) -> Option<WireMessage> {
        let cache = self.inner.lock().expect("cache lock poisoned");
        cache.peek(id).map(|e| e.message.clone())
    }

    pub fn has(&self, id: &MessageId) -> bool {
        let cache = self.inner.lock().expect("cache lock poisoned");
        cache.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries older than `ttl`. Invoked periodically from the
    /// heartbeat, not on every write.
    pub fn cleanup_old(&self, ttl: Duration) {
        let now = Instant::now();
        let mut cache = self.inner.lock().expect("cache lock poisoned");
        let expired: Vec<MessageId> = cache
            .iter()
            .filter(|(_, e)| now.duration_since(e.inserted_at) > ttl)
            .map(|(id, _)| *id)
            .collect();
        let count = expired.len();
        for id in expired {
            cache.pop(&id);
        }
        if count > 0 {
            trace!(evicted = count, remaining = cache.len(), "swept expired cache entries");
        }
    }
}

/// Fast duplicate rejection keyed by message id.
///
/// Never evicts by count; entries expire only through the TTL sweep, which
/// must therefore run with a TTL comfortably longer than any plausible
/// network re-delivery delay.
pub struct SeenSet {
    inner: Mutex<HashMap<MessageId, Instant>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record the id if unseen. Returns true on first observation, false on
    /// a duplicate. This is the single atomic check-and-mark the processing
    /// pipeline relies on.
    pub fn observe(&self, id: MessageId) -> bool {
        let mut seen = self.inner.lock().expect("seen lock poisoned");
        match seen.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        }
    }

    pub fn has(&self, id: &MessageId) -> bool {
        self.inner.lock().expect("seen lock poisoned").contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("seen lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries first seen longer than `ttl` ago.
    pub fn cleanup(&self, ttl: Duration) {
        let now = Instant::now();
        let mut seen = self.inner.lock().expect("seen lock poisoned");
        let before = seen.len();
        seen.retain(|_, first_seen| now.duration_since(*first_seen) <= ttl);
        let removed = before - seen.len();
        if removed > 0 {
            trace!(removed, remaining = seen.len(), "swept expired seen-set entries");
        }
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_prefix(id: &MessageId) -> String {
    id[..4].iter().map(|b| format!("{b:02x}")).collect()
}
