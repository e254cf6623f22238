//! Bounded in-memory response cache.
//!
//! Purely in-process LRU over request fingerprints; there is no backing
//! store and nothing survives a restart, matching the no-job-persistence
//! stance of the rest of the engine.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fields that make up a cache fingerprint, serialized in a fixed order so
/// the hash is stable regardless of the caller's field ordering.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    prompt: &'a str,
    system: &'a Option<String>,
    model: &'a Option<String>,
    options: &'a Value,
}

/// Computes the cache key for an `AskRequest` against a given effective
/// model (the request's own model, or a fallback device default).
pub fn fingerprint(prompt: &str, system: &Option<String>, effective_model: &Option<String>, options: &Value) -> String {
    let input = FingerprintInput {
        prompt,
        system,
        model: effective_model,
        options,
    };
    let canonical = serde_json::to_string(&input).expect("fingerprint input always serializes");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Bounded LRU cache from fingerprint to response body. `get` and `set` both
/// refresh recency; eviction happens on insertion overflow.
pub struct ResponseCache {
    inner: Mutex<LruCache<String, Value>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: String, value: Value) {
        self.inner.lock().unwrap().put(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
