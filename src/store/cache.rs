//! Memory tier of the pattern store
//!
//! Bounded by entry count with least-recently-used eviction. Evictions are
//! counted and logged; nothing else reacts to them.

use super::telemetry;

use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Which artifact kind a memory tier holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    EventInfo,
    PatternChunk,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::EventInfo => "event_info",
            ArtifactKind::PatternChunk => "pattern_chunk",
        }
    }
}

/// Fixed-capacity LRU cache for decoded artifacts
pub struct MemoryTier<V> {
    kind: ArtifactKind,
    cache: Cache<String, V>,
    evictions: Arc<AtomicU64>,
}

impl<V> MemoryTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a memory tier holding at most `capacity` entries
    pub fn new(kind: ArtifactKind, capacity: u64) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let counter = evictions.clone();

        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key: Arc<String>, _value: V, cause: RemovalCause| {
                if cause.was_evicted() {
                    counter.fetch_add(1, Ordering::Relaxed);
                    telemetry::record_eviction(kind.as_str());
                    info!(kind = kind.as_str(), key = %key, "Evicted entry from memory tier");
                }
            })
            .build();

        Self {
            kind,
            cache,
            evictions,
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key).await
    }

    /// Insert unless the key is already cached. Entries are immutable, so an
    /// existing value is never replaced.
    pub async fn insert_if_absent(&self, key: String, value: V) {
        if !self.cache.contains_key(&key) {
            self.cache.insert(key, value).await;
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Apply pending inserts and evictions
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let tier: MemoryTier<Arc<String>> = MemoryTier::new(ArtifactKind::EventInfo, 4);
        tier.insert_if_absent("1:1".into(), Arc::new("data".into())).await;

        assert_eq!(tier.get("1:1").await.unwrap().as_str(), "data");
        assert!(tier.get("1:2").await.is_none());
    }

    #[tokio::test]
    async fn test_existing_entry_is_not_replaced() {
        let tier: MemoryTier<Arc<String>> = MemoryTier::new(ArtifactKind::PatternChunk, 4);
        tier.insert_if_absent("k".into(), Arc::new("first".into())).await;
        tier.insert_if_absent("k".into(), Arc::new("second".into())).await;

        assert_eq!(tier.get("k").await.unwrap().as_str(), "first");
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let tier: MemoryTier<Arc<String>> = MemoryTier::new(ArtifactKind::EventInfo, 1);
        tier.insert_if_absent("a".into(), Arc::new("a".into())).await;
        tier.sync().await;
        tier.insert_if_absent("b".into(), Arc::new("b".into())).await;
        tier.sync().await;

        assert!(!tier.contains("a"));
        assert!(tier.contains("b"));
        assert_eq!(tier.entry_count(), 1);
        assert_eq!(tier.evictions(), 1);
    }
}
