//! Response cache with first-in-first-out eviction.
//!
//! Entries are evicted strictly in insertion order. Reads never refresh an
//! entry, and re-inserting an existing key keeps its original position.

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

const SEPARATOR: char = '\u{1f}';

/// Normalize free text for cache keys: trim, lowercase, collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic cache key built from normalized request parts.
///
/// Two requests with equal keys are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Start a key for the given capability with its primary text.
    pub fn new(capability: &str, text: &str) -> Self {
        let mut key = String::with_capacity(capability.len() + text.len() + 1);
        key.push_str(capability);
        key.push(SEPARATOR);
        key.push_str(&normalize(text));
        Self(key)
    }

    /// Append a disambiguating parameter (normalized like the text).
    pub fn param(mut self, value: &str) -> Self {
        self.0.push(SEPARATOR);
        self.0.push_str(&normalize(value));
        self
    }

    /// Append the identity of a candidate set. Order and case do not matter.
    pub fn set<'a>(mut self, members: impl IntoIterator<Item = &'a str>) -> Self {
        let mut normalized: Vec<String> = members.into_iter().map(normalize).collect();
        normalized.sort();
        normalized.dedup();
        let mut hasher = Sha256::new();
        for member in &normalized {
            hasher.update(member.as_bytes());
            hasher.update([0u8]);
        }
        self.0.push(SEPARATOR);
        self.0.push_str(&hex(&hasher.finalize()));
        self
    }

    /// Append a digest of opaque bytes (e.g. audio), byte-exact.
    pub fn digest(mut self, bytes: &[u8]) -> Self {
        self.0.push(SEPARATOR);
        self.0.push_str(&hex(&Sha256::digest(bytes)));
        self
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Bounded FIFO map from request key to a previously obtained result.
#[derive(Debug)]
pub struct ResponseCache<V> {
    entries: IndexMap<CacheKey, V>,
    capacity: usize,
}

impl<V: Clone> ResponseCache<V> {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.entries.get(key).cloned()
    }

    pub fn put(&mut self, key: CacheKey, value: V) {
        if self.capacity == 0 {
            return;
        }
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return;
        }
        while self.entries.len() >= self.capacity {
            if self.entries.shift_remove_index(0).is_none() {
                break;
            }
        }
        self.entries.insert(key, value);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
