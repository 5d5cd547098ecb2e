use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::query_builder::SqlValue;

#[derive(Debug)]
struct CacheEntry {
    rows: Vec<Value>,
    expires_at: Instant,
    last_access: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    map: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

/// Thread-safe query result cache: per-entry TTL plus LRU eviction once
/// `max_size` is reached. Expired entries are dropped lazily on access and
/// by the periodic sweep.
pub struct QueryCache {
    state: Mutex<CacheState>,
    default_ttl: Duration,
    max_size: usize,
}

impl QueryCache {
    pub fn new(default_ttl_seconds: u64, max_size: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            default_ttl: Duration::from_secs(default_ttl_seconds),
            max_size: max_size.max(1),
        }
    }

    /// Content hash of `(sql, params)`.
    pub fn cache_key(sql: &str, params: &[SqlValue]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sql.as_bytes());
        for param in params {
            hasher.update([0u8]);
            hasher.update(param.cache_repr().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Vec<Value>> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        match state.map.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                let rows = entry.rows.clone();
                state.hits += 1;
                Some(rows)
            }
            Some(_) => {
                state.map.remove(key);
                state.expired += 1;
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: &str, rows: Vec<Value>, ttl_seconds: Option<u64>) {
        let now = Instant::now();
        let ttl = ttl_seconds.map(Duration::from_secs).unwrap_or(self.default_ttl);
        let mut state = self.state.lock().unwrap();
        if !state.map.contains_key(key) && state.map.len() >= self.max_size {
            // LRU eviction: drop the least recently accessed entry
            if let Some(oldest) = state
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                state.map.remove(&oldest);
                state.evictions += 1;
            }
        }
        state.map.insert(
            key.to_string(),
            CacheEntry { rows, expires_at: now + ttl, last_access: now },
        );
    }

    /// Drop all expired entries; used by the background sweep.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let before = state.map.len();
        state.map.retain(|_, e| e.expires_at > now);
        let removed = before - state.map.len();
        state.expired += removed as u64;
        removed
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().map.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Value {
        let state = self.state.lock().unwrap();
        let total = state.hits + state.misses;
        let hit_rate = if total > 0 { state.hits as f64 / total as f64 } else { 0.0 };
        serde_json::json!({
            "size": state.map.len(),
            "max_size": self.max_size,
            "hits": state.hits,
            "misses": state.misses,
            "evictions": state.evictions,
            "expired": state.expired,
            "hit_rate": hit_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: i64) -> Vec<Value> {
        vec![json!({ "n": n })]
    }

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache = QueryCache::new(1, 10);
        cache.put("k", rows(1), Some(1));
        assert_eq!(cache.get("k"), Some(rows(1)));
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(cache.get("k"), None);
        let stats = cache.stats();
        assert_eq!(stats["expired"], 1);
    }

    #[test]
    fn key_depends_on_sql_and_params() {
        let a = QueryCache::cache_key("SELECT 1", &[SqlValue::Int(1)]);
        let b = QueryCache::cache_key("SELECT 1", &[SqlValue::Int(2)]);
        let c = QueryCache::cache_key("SELECT 2", &[SqlValue::Int(1)]);
        let a2 = QueryCache::cache_key("SELECT 1", &[SqlValue::Int(1)]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, a2);
    }

    #[test]
    fn lru_eviction_at_max_size() {
        let cache = QueryCache::new(300, 2);
        cache.put("a", rows(1), None);
        std::thread::sleep(Duration::from_millis(5));
        cache.put("b", rows(2), None);
        std::thread::sleep(Duration::from_millis(5));
        // touch "a" so "b" becomes the LRU entry
        assert!(cache.get("a").is_some());
        std::thread::sleep(Duration::from_millis(5));
        cache.put("c", rows(3), None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats()["evictions"], 1);
    }

    #[test]
    fn overwrite_does_not_evict() {
        let cache = QueryCache::new(300, 2);
        cache.put("a", rows(1), None);
        cache.put("b", rows(2), None);
        cache.put("a", rows(9), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(rows(9)));
        assert_eq!(cache.stats()["evictions"], 0);
    }

    #[test]
    fn sweep_removes_expired_only() {
        let cache = QueryCache::new(300, 10);
        cache.put("short", rows(1), Some(1));
        cache.put("long", rows(2), Some(600));
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = QueryCache::new(300, 10);
        cache.put("k", rows(1), None);
        cache.get("k");
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats["hits"], 2);
        assert_eq!(stats["misses"], 1);
        assert_eq!(stats["size"], 1);
    }
}
