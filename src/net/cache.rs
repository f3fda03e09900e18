//! Response cache, content-addressed by URL plus sorted query parameters.
//!
//! A hit bypasses the rate limiter and retry loop entirely. Entries expire
//! after the TTL; when the map exceeds `max_entries` the oldest insertion is
//! evicted first.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::CacheSettings;

/// Build the canonical cache key for a request.
pub fn cache_key(url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    if query.is_empty() {
        url.to_string()
    } else {
        format!("{url}?{query}")
    }
}

struct Entry {
    payload: Value,
    inserted_at: Instant,
}

pub struct TtlCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<IndexMap<String, Entry>>,
}

impl TtlCache {
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            ttl: Duration::from_secs_f64(settings.ttl_seconds.max(0.0)),
            max_entries: settings.max_entries.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.payload.clone()),
            Some(_) => {
                entries.shift_remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, payload: Value) {
        let mut entries = self.entries.lock();
        entries.shift_remove(key);
        entries.insert(
            key.to_string(),
            Entry {
                payload,
                inserted_at: Instant::now(),
            },
        );
        while entries.len() > self.max_entries {
            entries.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(ttl_seconds: f64, max_entries: usize) -> TtlCache {
        TtlCache::from_settings(&CacheSettings {
            enabled: true,
            ttl_seconds,
            max_entries,
        })
    }

    #[test]
    fn test_key_sorts_params() {
        let a = cache_key("http://x/y", &[("b".into(), "2".into()), ("a".into(), "1".into())]);
        let b = cache_key("http://x/y", &[("a".into(), "1".into()), ("b".into(), "2".into())]);
        assert_eq!(a, b);
        assert_eq!(a, "http://x/y?a=1&b=2");
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache(0.05, 16);
        cache.put("k", json!(1));
        assert_eq!(cache.get("k"), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_eviction_drops_oldest_insertion() {
        let cache = cache(60.0, 2);
        cache.put("a", json!(1));
        cache.put("b", json!(2));
        cache.put("c", json!(3));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let cache = cache(60.0, 2);
        cache.put("a", json!(1));
        cache.put("b", json!(2));
        cache.put("a", json!(10));
        cache.put("c", json!(3));
        assert_eq!(cache.get("a"), Some(json!(10)));
        assert_eq!(cache.get("b"), None);
    }
}
