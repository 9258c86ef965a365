//! Tiered pattern store (memory → disk → cloud)
//!
//! Reads go through the tiers in order. A disk miss falls through to the cloud,
//! and a cloud hit is copied back to disk and memory so the next read stays
//! local. The disk and cloud tiers are never evicted from here; only the memory
//! tier has a capacity.

pub mod cache;
pub mod files;
mod telemetry;

pub use cache::{ArtifactKind, MemoryTier};

use crate::config::ProjectSelection;
use crate::schema::{PatternWithMeta, UserAndEventsInfo};
use crate::{Error, Result};

use bytes::Bytes;
use object_store::path::Path;
use object_store::ObjectStore;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Memory tier capacities, in entries
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub event_info_cache_size: u64,
    pub chunk_cache_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            event_info_cache_size: 10,
            chunk_cache_size: 5,
        }
    }
}

/// Cloud tier with an optional secondary bucket for selected projects
#[derive(Clone)]
pub struct CloudRouting {
    primary: Arc<dyn ObjectStore>,
    secondary: Option<(Arc<dyn ObjectStore>, ProjectSelection)>,
}

impl CloudRouting {
    pub fn new(primary: Arc<dyn ObjectStore>) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    /// Serve the selected projects from `store` instead of the primary bucket
    pub fn with_secondary(mut self, store: Arc<dyn ObjectStore>, projects: ProjectSelection) -> Self {
        self.secondary = Some((store, projects));
        self
    }

    pub fn primary(&self) -> Arc<dyn ObjectStore> {
        self.primary.clone()
    }

    /// The bucket holding a project's artifacts
    pub fn for_project(&self, project_id: u64) -> &Arc<dyn ObjectStore> {
        match &self.secondary {
            Some((store, projects)) if projects.contains(project_id) => store,
            _ => &self.primary,
        }
    }
}

/// Point-in-time tier counters
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub cloud_hits: u64,
    pub misses: u64,
    pub backfills: u64,
    pub event_info_evictions: u64,
    pub chunk_evictions: u64,
    pub event_info_entries: u64,
    pub chunk_entries: u64,
}

#[derive(Default)]
struct TierCounters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    cloud_hits: AtomicU64,
    misses: AtomicU64,
    backfills: AtomicU64,
}

/// Tier that answered a persistent-tier read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Disk,
    Cloud,
}

impl Tier {
    fn as_str(&self) -> &'static str {
        match self {
            Tier::Disk => "disk",
            Tier::Cloud => "cloud",
        }
    }
}

/// Three-tier store for event info and pattern chunks
pub struct PatternStore {
    disk: Arc<dyn ObjectStore>,
    cloud: CloudRouting,
    event_info: MemoryTier<Arc<UserAndEventsInfo>>,
    chunks: MemoryTier<Arc<Vec<PatternWithMeta>>>,
    counters: TierCounters,
}

/// Cache key of a model's event info
pub fn model_key(project_id: u64, model_id: u64) -> String {
    format!("{}:{}", project_id, model_id)
}

/// Cache key of one pattern chunk
pub fn chunk_key(project_id: u64, model_id: u64, chunk_id: &str) -> String {
    format!("{}:{}:{}", project_id, model_id, chunk_id)
}

pub fn event_info_path(project_id: u64, model_id: u64) -> Path {
    Path::from(format!(
        "projects/{}/models/{}/events_{}.txt",
        project_id, model_id, model_id
    ))
}

pub fn pattern_chunk_path(project_id: u64, model_id: u64, chunk_id: &str) -> Path {
    Path::from(format!(
        "projects/{}/models/{}/chunks/chunk_{}.txt",
        project_id, model_id, chunk_id
    ))
}

impl PatternStore {
    pub fn new(disk: Arc<dyn ObjectStore>, cloud: CloudRouting, config: StoreConfig) -> Self {
        Self {
            disk,
            cloud,
            event_info: MemoryTier::new(ArtifactKind::EventInfo, config.event_info_cache_size),
            chunks: MemoryTier::new(ArtifactKind::PatternChunk, config.chunk_cache_size),
            counters: TierCounters::default(),
        }
    }

    /// User and event property statistics of a model
    pub async fn get_event_info(
        &self,
        project_id: u64,
        model_id: u64,
    ) -> Result<Arc<UserAndEventsInfo>> {
        let key = model_key(project_id, model_id);
        if let Some(info) = self.event_info.get(&key).await {
            self.record_memory_hit(ArtifactKind::EventInfo);
            return Ok(info);
        }

        let path = event_info_path(project_id, model_id);
        let records = self
            .read_through::<UserAndEventsInfo>(
                project_id,
                &path,
                ArtifactKind::EventInfo,
                files::MAX_EVENT_INFO_RECORD_BYTES,
            )
            .await?;
        let info = Arc::new(files::last_record(records, &path)?);
        self.event_info.insert_if_absent(key, info.clone()).await;
        Ok(info)
    }

    /// Patterns of one chunk of a model
    pub async fn get_patterns(
        &self,
        project_id: u64,
        model_id: u64,
        chunk_id: &str,
    ) -> Result<Arc<Vec<PatternWithMeta>>> {
        let key = chunk_key(project_id, model_id, chunk_id);
        if let Some(patterns) = self.chunks.get(&key).await {
            self.record_memory_hit(ArtifactKind::PatternChunk);
            return Ok(patterns);
        }

        let path = pattern_chunk_path(project_id, model_id, chunk_id);
        let patterns = self
            .read_through::<PatternWithMeta>(
                project_id,
                &path,
                ArtifactKind::PatternChunk,
                files::MAX_PATTERN_RECORD_BYTES,
            )
            .await?;

        let patterns = Arc::new(patterns);
        self.chunks.insert_if_absent(key, patterns.clone()).await;
        Ok(patterns)
    }

    /// Disk then cloud. A cloud object is fetched once; the same bytes are
    /// decoded and copied to disk.
    async fn read_through<T: DeserializeOwned>(
        &self,
        project_id: u64,
        path: &Path,
        kind: ArtifactKind,
        max_record_bytes: usize,
    ) -> Result<Vec<T>> {
        let started = Instant::now();
        match files::read_records(self.disk.as_ref(), path, max_record_bytes).await {
            Ok(records) => {
                self.record_persistent_hit(kind, Tier::Disk, started);
                return Ok(records);
            }
            Err(Error::NotFound(_)) => {
                debug!(path = %path, kind = kind.as_str(), "Disk miss, reading from cloud");
            }
            Err(e) => {
                telemetry::record_lookup(kind.as_str(), "disk", "error");
                return Err(e);
            }
        }

        let cloud = self.cloud.for_project(project_id);
        let started = Instant::now();
        let bytes = match files::fetch(cloud.as_ref(), path).await {
            Ok(bytes) => bytes,
            Err(Error::NotFound(p)) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                telemetry::record_lookup(kind.as_str(), "cloud", "miss");
                return Err(Error::NotFound(p));
            }
            Err(e) => {
                telemetry::record_lookup(kind.as_str(), "cloud", "error");
                return Err(e);
            }
        };
        let records = files::decode_records(&bytes[..], path, max_record_bytes).await?;
        self.record_persistent_hit(kind, Tier::Cloud, started);

        self.backfill_disk(path, kind, bytes).await;
        Ok(records)
    }

    /// Write a fetched cloud object to disk. Failures only cost a later
    /// cloud read.
    async fn backfill_disk(&self, path: &Path, kind: ArtifactKind, bytes: Bytes) {
        let outcome = match files::put_if_absent(self.disk.as_ref(), path, bytes).await {
            Ok(true) => {
                self.counters.backfills.fetch_add(1, Ordering::Relaxed);
                "written"
            }
            Ok(false) => "present",
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to backfill disk tier");
                "error"
            }
        };
        telemetry::record_backfill(kind.as_str(), outcome);
    }

    fn record_memory_hit(&self, kind: ArtifactKind) {
        self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
        telemetry::record_lookup(kind.as_str(), "memory", "hit");
    }

    fn record_persistent_hit(&self, kind: ArtifactKind, tier: Tier, started: Instant) {
        let counter = match tier {
            Tier::Disk => &self.counters.disk_hits,
            Tier::Cloud => &self.counters.cloud_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        telemetry::record_lookup(kind.as_str(), tier.as_str(), "hit");
        telemetry::record_fetch(kind.as_str(), tier.as_str(), started.elapsed().as_secs_f64());
    }

    /// Publish event info to the disk tier. Returns false if already present.
    pub async fn put_event_info_disk(
        &self,
        project_id: u64,
        model_id: u64,
        info: &UserAndEventsInfo,
    ) -> Result<bool> {
        let payload = files::encode_record(info)?;
        files::put_if_absent(self.disk.as_ref(), &event_info_path(project_id, model_id), payload)
            .await
    }

    /// Publish event info to the cloud tier. Returns false if already present.
    pub async fn put_event_info_cloud(
        &self,
        project_id: u64,
        model_id: u64,
        info: &UserAndEventsInfo,
    ) -> Result<bool> {
        let payload = files::encode_record(info)?;
        let cloud = self.cloud.for_project(project_id);
        files::put_if_absent(cloud.as_ref(), &event_info_path(project_id, model_id), payload)
            .await
    }

    pub async fn put_patterns_disk(
        &self,
        project_id: u64,
        model_id: u64,
        chunk_id: &str,
        patterns: &[PatternWithMeta],
    ) -> Result<bool> {
        let payload = files::encode_records(patterns)?;
        let path = pattern_chunk_path(project_id, model_id, chunk_id);
        files::put_if_absent(self.disk.as_ref(), &path, payload).await
    }

    pub async fn put_patterns_cloud(
        &self,
        project_id: u64,
        model_id: u64,
        chunk_id: &str,
        patterns: &[PatternWithMeta],
    ) -> Result<bool> {
        let payload = files::encode_records(patterns)?;
        let path = pattern_chunk_path(project_id, model_id, chunk_id);
        let cloud = self.cloud.for_project(project_id);
        files::put_if_absent(cloud.as_ref(), &path, payload).await
    }

    /// Whether the memory tier currently holds a model's event info
    pub fn cached_event_info(&self, project_id: u64, model_id: u64) -> bool {
        self.event_info.contains(&model_key(project_id, model_id))
    }

    /// Whether the memory tier currently holds a pattern chunk
    pub fn cached_patterns(&self, project_id: u64, model_id: u64, chunk_id: &str) -> bool {
        self.chunks.contains(&chunk_key(project_id, model_id, chunk_id))
    }

    /// Whether the disk tier holds the raw object at `path`
    pub async fn on_disk(&self, path: &Path) -> Result<bool> {
        match self.disk.head(path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Flush pending memory-tier maintenance (inserts and evictions)
    pub async fn sync(&self) {
        self.event_info.sync().await;
        self.chunks.sync().await;
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            cloud_hits: self.counters.cloud_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            backfills: self.counters.backfills.load(Ordering::Relaxed),
            event_info_evictions: self.event_info.evictions(),
            chunk_evictions: self.chunks.evictions(),
            event_info_entries: self.event_info.entry_count(),
            chunk_entries: self.chunks.entry_count(),
        }
    }
}
