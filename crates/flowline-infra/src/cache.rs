//! In-memory key/value cache with per-entry expiry.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use flowline_core::services::Cache;
use flowline_types::HostError;
use serde_json::Value;

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Cache over a concurrent map. A zero time-to-live means no expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, key: &str, value: Value, ttl: Duration) {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
    }

    fn live_value(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }
}

impl Cache for MemoryCache {
    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<Value, HostError> {
        self.store(key, value.clone(), ttl);
        Ok(value)
    }

    fn get(&self, key: &str, default: Value) -> Result<Value, HostError> {
        Ok(self.live_value(key).unwrap_or(default))
    }

    fn delete(&self, key: &str) -> Result<bool, HostError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn incr(&self, key: &str, ttl: Duration) -> Result<i64, HostError> {
        let next = self
            .live_value(key)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + 1;
        self.store(key, Value::from(next), ttl);
        Ok(next)
    }

    fn decr(&self, key: &str) -> Result<i64, HostError> {
        let current = self.live_value(key).and_then(|v| v.as_i64()).unwrap_or(0);
        let next = current - 1;
        // Keep the existing expiry when present.
        let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: Value::from(next),
                expires_at,
            },
        );
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
