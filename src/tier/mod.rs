// src/tier/mod.rs

//! Tier manager: LRU demotion of pages from the hot store
//!
//! Keeps the hot store's page count under a cap. When occupancy crosses the
//! threshold, the oldest-accessed warm pages are demoted to the cold
//! backend, optionally compressed. The migration order never loses data:
//! the cold copy is durable before the hot copy is deleted, and a failed
//! hot-side delete leaves a duplicate that the next run cleans up.

use crate::backend::{Backend, PutOptions};
use crate::codec::{Codec, Compressor};
use crate::error::{Error, Result};
use crate::extent::{build_extent, pages_per_extent, DEFAULT_EXTENT_SIZE};
use crate::page::{
    ExtentLocation, PageStore, Tier, META_BLOB_ID, META_COMPRESSION, META_PAGE_ID,
    META_PAGE_INDEX,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Eviction thresholds over the hot store's page count
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Hot store page cap
    pub max_hot_pages: usize,
    /// Fraction of the cap at which eviction triggers
    pub eviction_threshold: f64,
    /// Fraction of the cap eviction drives occupancy down to
    pub eviction_target: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            max_hot_pages: 1024,
            eviction_threshold: 0.9,
            eviction_target: 0.7,
        }
    }
}

impl TierConfig {
    pub fn new(max_hot_pages: usize) -> Self {
        Self {
            max_hot_pages,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_hot_pages == 0 {
            return Err(Error::invalid("max_hot_pages must be non-zero"));
        }
        for (name, value) in [
            ("eviction_threshold", self.eviction_threshold),
            ("eviction_target", self.eviction_target),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.eviction_target > self.eviction_threshold {
            return Err(Error::invalid("eviction_target must not exceed eviction_threshold"));
        }
        Ok(())
    }

    /// Page count at which eviction triggers
    pub fn threshold_pages(&self) -> usize {
        (self.max_hot_pages as f64 * self.eviction_threshold).floor() as usize
    }

    /// Page count eviction drives occupancy down to
    pub fn target_pages(&self) -> usize {
        (self.max_hot_pages as f64 * self.eviction_target).floor() as usize
    }
}

/// Result of an eviction run
#[derive(Debug, Clone, Default)]
pub struct EvictionResult {
    pub evicted_count: usize,
    pub evicted_page_ids: Vec<String>,
    /// Per-page failure messages; failed pages stay hot
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Result of packing a blob's resident pages into cold extents
#[derive(Debug, Clone, Default)]
pub struct PackResult {
    pub extents_written: usize,
    pub pages_packed: usize,
    /// Bytes written to the cold store, after any compression
    pub bytes_written: u64,
}

/// Process-wide eviction counters, installed explicitly by the host
#[derive(Debug, Default)]
pub struct TierMetrics {
    eviction_runs: AtomicU64,
    pages_evicted: AtomicU64,
    eviction_errors: AtomicU64,
    bytes_demoted: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierMetricsSnapshot {
    pub eviction_runs: u64,
    pub pages_evicted: u64,
    pub eviction_errors: u64,
    pub bytes_demoted: u64,
}

static TIER_METRICS: OnceLock<Arc<TierMetrics>> = OnceLock::new();

impl TierMetrics {
    /// Install (or fetch) the process-wide collector
    pub fn install() -> Arc<TierMetrics> {
        Arc::clone(TIER_METRICS.get_or_init(|| Arc::new(TierMetrics::default())))
    }

    /// The collector, if the host installed one
    pub fn global() -> Option<Arc<TierMetrics>> {
        TIER_METRICS.get().cloned()
    }

    pub fn snapshot(&self) -> TierMetricsSnapshot {
        TierMetricsSnapshot {
            eviction_runs: self.eviction_runs.load(Ordering::Relaxed),
            pages_evicted: self.pages_evicted.load(Ordering::Relaxed),
            eviction_errors: self.eviction_errors.load(Ordering::Relaxed),
            bytes_demoted: self.bytes_demoted.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.eviction_runs.store(0, Ordering::Relaxed);
        self.pages_evicted.store(0, Ordering::Relaxed);
        self.eviction_errors.store(0, Ordering::Relaxed);
        self.bytes_demoted.store(0, Ordering::Relaxed);
    }

    fn record_run(&self, result: &EvictionResult, bytes: u64) {
        self.eviction_runs.fetch_add(1, Ordering::Relaxed);
        self.pages_evicted
            .fetch_add(result.evicted_count as u64, Ordering::Relaxed);
        self.eviction_errors
            .fetch_add(result.errors.len() as u64, Ordering::Relaxed);
        self.bytes_demoted.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Decides when and what to demote, and performs the migration
pub struct TierManager {
    config: TierConfig,
    store: PageStore,
    compressor: Compressor,
    /// Slots per packed extent for bulk demotion
    pages_per_extent: usize,
    /// Serializes concurrent eviction and packing runs
    gate: Mutex<()>,
    /// Collector captured at construction; the installed global by default
    metrics: Option<Arc<TierMetrics>>,
}

impl TierManager {
    pub fn new(config: TierConfig, store: PageStore, compressor: Compressor) -> Result<Self> {
        config.validate()?;
        let pages_per_extent = pages_per_extent(DEFAULT_EXTENT_SIZE, store.page_size()).max(1);
        Ok(Self {
            config,
            store,
            compressor,
            pages_per_extent,
            gate: Mutex::new(()),
            metrics: TierMetrics::global(),
        })
    }

    /// Record eviction counters into `metrics` instead of the global
    pub fn with_metrics(mut self, metrics: Arc<TierMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override how many page slots a packed extent holds
    pub fn with_pages_per_extent(mut self, pages_per_extent: usize) -> Self {
        self.pages_per_extent = pages_per_extent.max(1);
        self
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    /// Pages currently resident in the hot store
    pub fn hot_page_count(&self) -> usize {
        self.store.index().resident_count()
    }

    /// True when occupancy has reached the eviction threshold
    pub fn should_evict(&self) -> bool {
        self.store.index().count_by_tier(Tier::Warm) >= self.config.threshold_pages()
    }

    /// Refresh a page's access stamp, pushing it later in eviction order
    pub fn touch(&self, page_id: &str) -> bool {
        self.store.index().touch(page_id)
    }

    /// Pin a warm page against eviction
    pub fn pin(&self, page_id: &str) -> bool {
        match self.store.index().get(page_id) {
            Some(meta) if meta.tier == Tier::Warm => {
                self.store.index().set_tier(page_id, Tier::Hot);
                true
            }
            _ => false,
        }
    }

    /// Make a pinned page evictable again
    pub fn unpin(&self, page_id: &str) -> bool {
        match self.store.index().get(page_id) {
            Some(meta) if meta.tier == Tier::Hot => {
                self.store.index().set_tier(page_id, Tier::Warm);
                true
            }
            _ => false,
        }
    }

    /// Demote the oldest warm pages until occupancy reaches the target
    ///
    /// Runs are serialized; a run that starts below the target evicts
    /// nothing. Per-page failures are collected, not fatal.
    pub async fn run_eviction(&self) -> EvictionResult {
        let _guard = self.gate.lock().await;
        let start = Instant::now();

        let resident = self.store.index().resident_count();
        let target = self.config.target_pages();
        if resident <= target {
            debug!("occupancy {} within target {}, nothing to evict", resident, target);
            return EvictionResult {
                duration_ms: start.elapsed().as_millis() as u64,
                ..Default::default()
            };
        }

        let candidates = self.store.index().pages_in_tier(Tier::Warm);
        let want = resident - target;

        let mut result = EvictionResult::default();
        let mut bytes_demoted = 0u64;

        for meta in candidates.iter().take(want) {
            match self.evict_page(&meta.page_id).await {
                Ok(()) => {
                    bytes_demoted += meta.size as u64;
                    result.evicted_page_ids.push(meta.page_id.clone());
                }
                Err(e) => {
                    warn!("failed to evict {}: {}", meta.page_id, e);
                    result.errors.push(format!("{}: {}", meta.page_id, e));
                }
            }
        }

        result.evicted_count = result.evicted_page_ids.len();
        result.duration_ms = start.elapsed().as_millis() as u64;

        if result.evicted_count > 0 || !result.errors.is_empty() {
            info!(
                "eviction: {} page(s) demoted, {} error(s), {} resident, {}ms",
                result.evicted_count,
                result.errors.len(),
                self.store.index().resident_count(),
                result.duration_ms
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_run(&result, bytes_demoted);
        }

        result
    }

    /// Demote one page, preserving the no-data-loss ordering
    ///
    /// The cold write completes before the metadata flips, and the metadata
    /// flips before the hot bytes are deleted. A page already cold is a
    /// no-op apart from retrying a leftover hot-side delete.
    pub async fn evict_page(&self, page_id: &str) -> Result<()> {
        // Step 1: load metadata
        let meta = self
            .store
            .index()
            .get(page_id)
            .ok_or_else(|| Error::not_found(page_id))?;

        let hot = self.store.tiers().hot();
        if meta.tier == Tier::Cold {
            // Idempotent: retry a hot delete an earlier run may have missed
            if hot.exists(page_id).await? && hot.delete(page_id).await? {
                debug!("cleared stale hot bytes for {}", page_id);
            }
            return Ok(());
        }

        // Step 2: load the hot bytes
        let object = hot
            .get(page_id)
            .await?
            .ok_or_else(|| Error::Corrupted(format!("{page_id}: hot bytes missing during eviction")))?;

        // Step 3: write to the cold backend; must land before any deletion
        let (bytes, cmeta) = self
            .compressor
            .maybe_compress(&object.bytes, object.meta.content_type.as_deref())?;

        let mut opts = PutOptions::default()
            .with_metadata(META_PAGE_ID, page_id)
            .with_metadata(META_BLOB_ID, meta.blob_id.clone())
            .with_metadata(META_PAGE_INDEX, meta.page_index.to_string());
        if cmeta.codec != Codec::None {
            let encoded = serde_json::to_string(&cmeta)
                .map_err(|e| Error::Storage(format!("compression metadata encode failed: {e}")))?;
            opts = opts.with_metadata(META_COMPRESSION, encoded);
        }
        self.store.tiers().cold().put(page_id, &bytes, opts).await?;

        // Step 4: flip the tier; data now lives cold, metadata stays local
        self.store.index().set_tier(page_id, Tier::Cold);

        // Step 5: drop the hot copy; a failure here only duplicates data
        if let Err(e) = hot.delete(page_id).await {
            warn!("hot delete of {} failed after demotion, will retry: {}", page_id, e);
        }

        debug!("demoted {} ({} -> {} bytes)", page_id, cmeta.original_size, bytes.len());
        Ok(())
    }

    /// Bulk-demote a blob's resident pages into packed cold extents
    ///
    /// Pages are grouped by index into extents of `pages_per_extent` slots;
    /// pages already cold keep their existing placement (their slots stay
    /// absent in the bitmap). The same no-data-loss ordering applies per
    /// extent: the cold object lands, then the metadata flips, then the hot
    /// copies go.
    pub async fn pack_blob(&self, blob_id: &str) -> Result<PackResult> {
        let _guard = self.gate.lock().await;

        let resident: Vec<_> = self
            .store
            .index()
            .pages_of_blob(blob_id)
            .into_iter()
            .filter(|m| m.tier.is_resident())
            .collect();
        if resident.is_empty() {
            return Ok(PackResult::default());
        }

        let ppe = self.pages_per_extent as u32;
        let mut groups: BTreeMap<u32, Vec<&crate::page::PageMetadata>> = BTreeMap::new();
        for meta in &resident {
            groups.entry(meta.page_index / ppe).or_default().push(meta);
        }

        let codec = if self.compressor.config().enabled {
            self.compressor.config().codec
        } else {
            Codec::None
        };

        let hot = self.store.tiers().hot();
        let mut result = PackResult::default();

        for (extent_index, group) in groups {
            let top_slot = group
                .iter()
                .map(|m| m.page_index % ppe)
                .max()
                .unwrap_or(0);
            let mut slots: Vec<Option<Vec<u8>>> = vec![None; top_slot as usize + 1];

            for meta in &group {
                let object = hot.get(&meta.page_id).await?.ok_or_else(|| {
                    Error::Corrupted(format!(
                        "{}: hot bytes missing during packing",
                        meta.page_id
                    ))
                })?;
                slots[(meta.page_index % ppe) as usize] = Some(object.bytes);
            }

            let bytes = build_extent(&slots, self.store.page_size() as u32, codec)?;
            let key = format!("extent/{blob_id}/{extent_index}");

            let opts = PutOptions::default()
                .with_metadata(META_BLOB_ID, blob_id)
                .with_metadata("extent_index", extent_index.to_string());
            self.store.tiers().cold().put(&key, &bytes, opts).await?;

            for meta in &group {
                self.store.index().set_packed(
                    &meta.page_id,
                    ExtentLocation {
                        key: key.clone(),
                        slot: meta.page_index % ppe,
                    },
                );
                if let Err(e) = hot.delete(&meta.page_id).await {
                    warn!(
                        "hot delete of {} failed after packing, will retry: {}",
                        meta.page_id, e
                    );
                }
            }

            result.extents_written += 1;
            result.pages_packed += group.len();
            result.bytes_written += bytes.len() as u64;
        }

        info!(
            "packed {}: {} page(s) into {} extent(s), {} bytes cold",
            blob_id, result.pages_packed, result.extents_written, result.bytes_written
        );
        Ok(result)
    }
}
