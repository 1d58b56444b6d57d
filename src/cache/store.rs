//! Insertion-ordered entry storage with TTL and a byte ceiling.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Option<Duration>,
    bytes: u64,
    seq: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.inserted_at) >= ttl)
    }
}

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Insert {
    /// Stored; `evicted` older entries were dropped to make room.
    Stored { evicted: usize },
    /// Larger than the whole ceiling; not stored.
    TooLarge,
}

/// Key/value store evicting oldest insertions first once `max_bytes` is exceeded.
///
/// `order` may hold stale `(seq, key)` pairs for replaced or removed
/// entries; they are skipped during eviction and compacted away once they
/// outnumber live entries.
pub(crate) struct EntryStore<V> {
    entries: HashMap<String, Entry<V>>,
    order: VecDeque<(u64, String)>,
    total_bytes: u64,
    max_bytes: Option<u64>,
    next_seq: u64,
}

impl<V: Clone> EntryStore<V> {
    pub(crate) fn new(max_bytes: Option<u64>) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
            next_seq: 0,
        }
    }

    /// Returns a live value, dropping the entry if it has expired.
    pub(crate) fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub(crate) fn insert(
        &mut self,
        key: String,
        value: V,
        ttl: Option<Duration>,
        bytes: u64,
        now: Instant,
    ) -> Insert {
        self.remove(&key);
        if self.max_bytes.is_some_and(|max| bytes > max) {
            return Insert::TooLarge;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push_back((seq, key.clone()));
        self.total_bytes += bytes;
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                ttl,
                bytes,
                seq,
            },
        );

        let evicted = self.evict();
        self.maybe_compact();
        Insert::Stored { evicted }
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.total_bytes -= entry.bytes;
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_bytes = 0;
    }

    /// Drops every expired entry.
    pub(crate) fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                freed += entry.bytes;
            }
            keep
        });
        self.total_bytes -= freed;
        self.maybe_compact();
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn evict(&mut self) -> usize {
        let Some(max) = self.max_bytes else {
            return 0;
        };
        let mut evicted = 0;
        while self.total_bytes > max {
            let Some((seq, key)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&key).is_some_and(|e| e.seq == seq) {
                self.remove(&key);
                evicted += 1;
            }
        }
        evicted
    }

    fn maybe_compact(&mut self) {
        if self.order.len() > 2 * self.entries.len() + 16 {
            let entries = &self.entries;
            self.order
                .retain(|(seq, key)| entries.get(key).is_some_and(|e| e.seq == *seq));
        }
    }
}
