//! Content-addressed validation cache
//!
//! Memoizes validation verdicts by `(bundle checksum, verdict kind)`.
//! A `full` entry satisfies lookups for any kind; otherwise an exact kind
//! match is required. Entries expire after a TTL and the cache evicts
//! least-recently-used entries beyond its maximum size. Negative verdicts
//! are cached too, so a known-bad bundle is rejected without re-scanning.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use plugon_core::types::{ValidationVerdict, VerdictKind};

/// One cached verdict
#[derive(Debug, Clone)]
struct CacheEntry {
    verdict: ValidationVerdict,
    inserted_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    hit_count: u64,
}

/// Exported cache statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Current entry count
    pub size: usize,

    /// Lookup hits since startup
    pub hits: u64,

    /// Lookup misses since startup
    pub misses: u64,

    /// hits / (hits + misses), 0.0 when empty
    pub hit_rate: f64,

    /// Insertion timestamp of the oldest live entry
    pub oldest_entry: Option<DateTime<Utc>>,
}

/// Content-addressed verdict cache with TTL and LRU eviction
#[derive(Debug)]
pub struct ValidationCache {
    entries: Mutex<LruCache<(String, VerdictKind), CacheEntry>>,
    ttl: ChronoDuration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ValidationCache {
    /// Create a cache holding at most `max_size` entries with the given TTL
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(24)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a verdict for `(checksum, kind)`
    ///
    /// A `full` entry satisfies any kind. Expired entries are dropped on
    /// access.
    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, checksum: &str, kind: VerdictKind) -> Option<ValidationVerdict> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        let mut candidates = vec![(checksum.to_string(), kind)];
        if kind != VerdictKind::Full {
            candidates.push((checksum.to_string(), VerdictKind::Full));
        }

        for key in candidates {
            if let Some(entry) = entries.get_mut(&key) {
                if now - entry.inserted_at > self.ttl {
                    entries.pop(&key);
                    continue;
                }
                entry.last_accessed_at = now;
                entry.hit_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("plugon.validation.cache.hits", 1);
                debug!("🔧 validation cache hit for {}:{}", checksum, key.1);
                return Some(entry.verdict.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("plugon.validation.cache.misses", 1);
        None
    }

    /// Insert a verdict for `(checksum, kind)`, evicting LRU entries beyond
    /// the configured maximum
    #[instrument(level = "debug", skip(self, verdict))]
    pub async fn put(&self, checksum: &str, kind: VerdictKind, verdict: ValidationVerdict) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.put(
            (checksum.to_string(), kind),
            CacheEntry {
                verdict,
                inserted_at: now,
                last_accessed_at: now,
                hit_count: 0,
            },
        );
    }

    /// Remove all expired entries, returning how many were dropped
    #[instrument(level = "debug", skip(self))]
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let expired: Vec<(String, VerdictKind)> = entries
            .iter()
            .filter(|(_, entry)| now - entry.inserted_at > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            debug!("🔧 swept {} expired validation verdicts", expired.len());
        }
        expired.len()
    }

    /// Current statistics
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: entries.len(),
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            oldest_entry: entries.iter().map(|(_, e)| e.inserted_at).min(),
        }
    }

    /// Spawn the periodic sweeper task
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cache.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ValidationVerdict {
        ValidationVerdict::valid()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = ValidationCache::new(10, Duration::from_secs(60));
        assert!(cache.get("abc", VerdictKind::Manifest).await.is_none());

        cache.put("abc", VerdictKind::Manifest, valid()).await;
        let hit = cache.get("abc", VerdictKind::Manifest).await.unwrap();
        assert!(hit.is_valid);
    }

    #[tokio::test]
    async fn test_negative_verdicts_are_cached() {
        let cache = ValidationCache::new(10, Duration::from_secs(60));
        cache
            .put(
                "bad",
                VerdictKind::Security,
                ValidationVerdict::invalid("unsafe import of 'fs'"),
            )
            .await;
        let hit = cache.get("bad", VerdictKind::Security).await.unwrap();
        assert!(!hit.is_valid);
        assert!(hit.errors[0].contains("fs"));
    }

    #[tokio::test]
    async fn test_full_kind_satisfies_any_lookup() {
        let cache = ValidationCache::new(10, Duration::from_secs(60));
        cache.put("abc", VerdictKind::Full, valid()).await;

        assert!(cache.get("abc", VerdictKind::Manifest).await.is_some());
        assert!(cache.get("abc", VerdictKind::Structure).await.is_some());
        assert!(cache.get("abc", VerdictKind::Security).await.is_some());
        assert!(cache.get("abc", VerdictKind::Full).await.is_some());
    }

    #[tokio::test]
    async fn test_exact_kind_required_without_full() {
        let cache = ValidationCache::new(10, Duration::from_secs(60));
        cache.put("abc", VerdictKind::Manifest, valid()).await;

        assert!(cache.get("abc", VerdictKind::Structure).await.is_none());
        assert!(cache.get("abc", VerdictKind::Full).await.is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = ValidationCache::new(10, Duration::from_millis(0));
        cache.put("abc", VerdictKind::Manifest, valid()).await;
        // zero TTL expires immediately
        assert!(cache.get("abc", VerdictKind::Manifest).await.is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = ValidationCache::new(2, Duration::from_secs(60));
        cache.put("a", VerdictKind::Manifest, valid()).await;
        cache.put("b", VerdictKind::Manifest, valid()).await;
        // touch "a" so "b" becomes the LRU victim
        cache.get("a", VerdictKind::Manifest).await;
        cache.put("c", VerdictKind::Manifest, valid()).await;

        assert!(cache.get("a", VerdictKind::Manifest).await.is_some());
        assert!(cache.get("b", VerdictKind::Manifest).await.is_none());
        assert!(cache.get("c", VerdictKind::Manifest).await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let cache = ValidationCache::new(10, Duration::from_millis(0));
        cache.put("a", VerdictKind::Manifest, valid()).await;
        cache.put("b", VerdictKind::Security, valid()).await;
        assert_eq!(cache.sweep().await, 2);
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let cache = ValidationCache::new(10, Duration::from_secs(60));
        cache.put("a", VerdictKind::Manifest, valid()).await;
        cache.get("a", VerdictKind::Manifest).await;
        cache.get("missing", VerdictKind::Manifest).await;

        let stats = cache.stats().await;
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert!(stats.oldest_entry.is_some());
    }
}
