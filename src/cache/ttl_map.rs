//! TTL'd key-value map with atomic set-if-absent.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Concurrent string map where every entry may carry a deadline.
///
/// Expiry is lazy on read plus a periodic [`sweep`](TtlMap::sweep); an
/// expired entry is indistinguishable from an absent one.
#[derive(Debug, Default)]
pub struct TtlMap {
    entries: DashMap<String, Entry>,
}

impl TtlMap {
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    /// Atomically set `key` only when absent (or expired).
    ///
    /// Returns `true` iff the value was newly set. This is the SETNX
    /// equivalent backing dedup and cooldown markers; callers must never
    /// simulate it with a get-then-set.
    pub fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let fresh = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|t| now + t),
        };
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    true
                } else {
                    false
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let guard = self.entries.get(key)?;
        if guard.is_expired(now) {
            drop(guard);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(guard.value.clone())
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Live `(suffix, value)` pairs for keys beginning with `prefix`.
    /// The prefix itself is stripped from returned keys.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired(now))
            .map(|e| (e.key()[prefix.len()..].to_string(), e.value().value.clone()))
            .collect()
    }

    /// Drop expired entries. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
