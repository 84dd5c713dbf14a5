//! Bounded caches that suppress repeated logging of identical assignments.
//!
//! A cache is consulted after an evaluation produced an event and before the event is handed to
//! the logger. Any internal failure (e.g., a poisoned lock) makes the cache answer "log it".
use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
    time::{Duration, Instant},
};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::events::{AssignmentEvent, BanditEvent};

/// Deterministic digest of everything that makes a logged event distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Fingerprint of (subject, flag, allocation, variation).
    pub fn assignment(subject_key: &str, flag_key: &str, allocation_key: &str, variation: &str) -> Self {
        let mut builder = FingerprintBuilder::new();
        builder
            .push(subject_key)
            .push(flag_key)
            .push(allocation_key)
            .push(variation);
        builder.finish()
    }

    /// Fingerprint of an assignment event.
    pub fn for_assignment(event: &AssignmentEvent) -> Self {
        Fingerprint::assignment(
            &event.subject,
            &event.feature_flag,
            &event.allocation,
            &event.variation,
        )
    }

    /// Fingerprint of a bandit event. Subject and action attributes take part in it, because they
    /// affect scoring.
    pub fn for_bandit(event: &BanditEvent) -> Self {
        let mut builder = FingerprintBuilder::new();
        builder
            .push(&event.subject)
            .push(&event.flag_key)
            .push(&event.bandit_key)
            .push(&event.action)
            .push_numeric(&event.subject_numeric_attributes)
            .push_categorical(&event.subject_categorical_attributes)
            .push_numeric(&event.action_numeric_attributes)
            .push_categorical(&event.action_categorical_attributes);
        builder.finish()
    }
}

/// MD5 over length-prefixed components, so that `("ab", "c")` and `("a", "bc")` differ.
struct FingerprintBuilder(md5::Context);

impl FingerprintBuilder {
    fn new() -> Self {
        FingerprintBuilder(md5::Context::new())
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.consume((bytes.len() as u64).to_be_bytes());
        self.0.consume(bytes);
        self
    }

    fn push(&mut self, s: &str) -> &mut Self {
        self.push_bytes(s.as_bytes())
    }

    fn push_numeric(&mut self, attributes: &HashMap<String, f64>) -> &mut Self {
        let sorted = attributes.iter().collect::<BTreeMap<_, _>>();
        self.push_bytes(&(sorted.len() as u64).to_be_bytes());
        for (key, value) in sorted {
            self.push(key).push_bytes(&value.to_bits().to_be_bytes());
        }
        self
    }

    fn push_categorical(&mut self, attributes: &HashMap<String, String>) -> &mut Self {
        let sorted = attributes.iter().collect::<BTreeMap<_, _>>();
        self.push_bytes(&(sorted.len() as u64).to_be_bytes());
        for (key, value) in sorted {
            self.push(key).push(value);
        }
        self
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(self.0.compute().0)
    }
}

/// A cache deciding whether an event needs to be logged.
pub trait DedupCache: Send + Sync {
    /// Returns `true` and records `fingerprint` if it is absent (or expired). Returns `false` if
    /// the same event was already logged.
    fn should_log(&self, fingerprint: &Fingerprint) -> bool;
}

/// Disabled cache: every event is logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughCache;

impl DedupCache for PassThroughCache {
    fn should_log(&self, _fingerprint: &Fingerprint) -> bool {
        true
    }
}

/// Capacity-bounded cache with least-recently-used eviction.
#[derive(Debug)]
pub struct LruDedupCache {
    capacity: usize,
    state: Mutex<LruState>,
}

/// Doubly-linked list over an arena of nodes. Indices are stable, so the map can point into the
/// arena and eviction reuses the tail slot.
#[derive(Debug, Default)]
struct LruState {
    index: HashMap<Fingerprint, usize>,
    nodes: Vec<LruNode>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

#[derive(Debug)]
struct LruNode {
    fingerprint: Fingerprint,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LruDedupCache {
    /// Default capacity of the assignment cache.
    pub const DEFAULT_CAPACITY: usize = 50_000;

    /// Create a cache holding at most `capacity` fingerprints.
    pub fn new(capacity: usize) -> Self {
        LruDedupCache {
            capacity,
            state: Mutex::new(LruState {
                index: HashMap::with_capacity(capacity.min(Self::DEFAULT_CAPACITY)),
                ..Default::default()
            }),
        }
    }

    /// Number of fingerprints currently held.
    pub fn len(&self) -> usize {
        self.state.lock().map_or(0, |state| state.index.len())
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LruDedupCache {
    fn default() -> Self {
        LruDedupCache::new(Self::DEFAULT_CAPACITY)
    }
}

impl DedupCache for LruDedupCache {
    fn should_log(&self, fingerprint: &Fingerprint) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let Ok(mut state) = self.state.lock() else {
            return true;
        };

        if let Some(&i) = state.index.get(fingerprint) {
            state.unlink(i);
            state.push_front(i);
            return false;
        }

        let i = if state.nodes.len() < self.capacity {
            state.nodes.push(LruNode {
                fingerprint: *fingerprint,
                prev: None,
                next: None,
            });
            state.nodes.len() - 1
        } else {
            let Some(i) = state.tail else {
                return true;
            };
            state.unlink(i);
            let evicted = std::mem::replace(&mut state.nodes[i].fingerprint, *fingerprint);
            state.index.remove(&evicted);
            i
        };
        state.push_front(i);
        state.index.insert(*fingerprint, i);
        true
    }
}

impl LruState {
    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.nodes[i].prev, self.nodes[i].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[i].prev = None;
        self.nodes[i].next = None;
    }

    fn push_front(&mut self, i: usize) {
        self.nodes[i].next = self.head;
        if let Some(h) = self.head {
            self.nodes[h].prev = Some(i);
        }
        self.head = Some(i);
        if self.tail.is_none() {
            self.tail = Some(i);
        }
    }
}

/// Time-bounded cache: an entry stops suppressing logs once its absolute expiry has passed.
///
/// Entries live in a sharded map, so a lookup only contends with callers hashing to the same
/// shard. Stale entries are purged at most once per `ttl`, one shard at a time.
#[derive(Debug)]
pub struct ExpiringDedupCache {
    ttl: Duration,
    /// Absolute expiry by fingerprint. `None` never expires (`ttl` overflows `Instant`).
    expiry: DashMap<Fingerprint, Option<Instant>>,
    last_purge: Mutex<Instant>,
}

impl ExpiringDedupCache {
    /// Default time-to-live of the bandit cache.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

    /// Create a cache where every entry expires `ttl` after it was recorded. `Duration::MAX`
    /// keeps entries forever.
    pub fn new(ttl: Duration) -> Self {
        ExpiringDedupCache {
            ttl,
            expiry: DashMap::new(),
            last_purge: Mutex::new(Instant::now()),
        }
    }

    fn should_log_at(&self, fingerprint: &Fingerprint, now: Instant) -> bool {
        self.purge_if_due(now);

        let expires_at = now.checked_add(self.ttl);
        match self.expiry.entry(*fingerprint) {
            Entry::Occupied(entry) if is_live(*entry.get(), now) => false,
            Entry::Occupied(mut entry) => {
                entry.insert(expires_at);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
                true
            }
        }
    }

    fn purge_if_due(&self, now: Instant) {
        // Whoever holds the purge lock does the work; everybody else goes straight to the lookup.
        let Ok(mut last_purge) = self.last_purge.try_lock() else {
            return;
        };
        if now.saturating_duration_since(*last_purge) < self.ttl {
            return;
        }
        *last_purge = now;
        drop(last_purge);

        let before = self.expiry.len();
        self.expiry.retain(|_, expires_at| is_live(*expires_at, now));
        let purged = before.saturating_sub(self.expiry.len());
        log::trace!(target: "eppo", purged; "purged expired dedup entries");
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.expiry.len()
    }
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |expires_at| now < expires_at)
}

impl Default for ExpiringDedupCache {
    fn default() -> Self {
        ExpiringDedupCache::new(Self::DEFAULT_TTL)
    }
}

impl DedupCache for ExpiringDedupCache {
    fn should_log(&self, fingerprint: &Fingerprint) -> bool {
        self.should_log_at(fingerprint, Instant::now())
    }
}
