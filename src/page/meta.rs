// src/page/meta.rs

//! Page metadata index
//!
//! One record per page, tracking which blob it belongs to, where its bytes
//! live (tier), and when it was last touched. The index is the tier
//! manager's source of truth for eviction ordering, so mutations are
//! serialized per page via the map's entry guards.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage class of a page's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Resident in the hot store and pinned against eviction
    Hot,
    /// Resident in the hot store, candidate for eviction
    Warm,
    /// Demoted to the cold store
    Cold,
}

impl Tier {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }

    /// Whether bytes in this tier live in the hot backend
    pub fn is_resident(&self) -> bool {
        !matches!(self, Self::Cold)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where a cold page's bytes sit inside a packed extent object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentLocation {
    /// Backend key of the extent object
    pub key: String,
    /// Slot inside the extent
    pub slot: u32,
}

/// Metadata carried by every page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMetadata {
    pub page_id: String,
    pub blob_id: String,
    /// 0-based, contiguous within a blob
    pub page_index: u32,
    /// Bytes in this page; at most the page size, short only for the last
    pub size: u32,
    pub tier: Tier,
    /// Set when the cold bytes live packed in an extent rather than under
    /// the page's own key
    pub extent: Option<ExtentLocation>,
    /// Unix millis
    pub last_access_at: i64,
    /// Unix millis
    pub created_at: i64,
}

impl PageMetadata {
    pub fn new(page_id: String, blob_id: String, page_index: u32, size: u32) -> Self {
        let now = now_millis();
        Self {
            page_id,
            blob_id,
            page_index,
            size,
            tier: Tier::Warm,
            extent: None,
            last_access_at: now,
            created_at: now,
        }
    }
}

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

struct IndexedPage {
    meta: PageMetadata,
    /// Insertion sequence, tie-breaker for equal access stamps
    seq: u64,
}

/// Process-wide page metadata map
///
/// Per-page mutation is serialized by the map's shard locks; bulk queries
/// take a snapshot first.
pub struct PageIndex {
    pages: DashMap<String, IndexedPage>,
    next_seq: AtomicU64,
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            pages: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Insert or replace a page record
    pub fn insert(&self, meta: PageMetadata) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pages
            .insert(meta.page_id.clone(), IndexedPage { meta, seq });
    }

    pub fn get(&self, page_id: &str) -> Option<PageMetadata> {
        self.pages.get(page_id).map(|entry| entry.meta.clone())
    }

    pub fn contains(&self, page_id: &str) -> bool {
        self.pages.contains_key(page_id)
    }

    pub fn remove(&self, page_id: &str) -> Option<PageMetadata> {
        self.pages.remove(page_id).map(|(_, entry)| entry.meta)
    }

    /// Refresh a page's access stamp; returns false for unknown pages
    pub fn touch(&self, page_id: &str) -> bool {
        match self.pages.get_mut(page_id) {
            Some(mut entry) => {
                entry.meta.last_access_at = now_millis();
                true
            }
            None => false,
        }
    }

    /// Move a page to another tier; returns the previous tier
    pub fn set_tier(&self, page_id: &str, tier: Tier) -> Option<Tier> {
        self.pages.get_mut(page_id).map(|mut entry| {
            let prev = entry.meta.tier;
            entry.meta.tier = tier;
            if tier != Tier::Cold {
                entry.meta.extent = None;
            }
            prev
        })
    }

    /// Mark a page cold inside a packed extent, in one metadata update
    pub fn set_packed(&self, page_id: &str, location: ExtentLocation) -> bool {
        match self.pages.get_mut(page_id) {
            Some(mut entry) => {
                entry.meta.tier = Tier::Cold;
                entry.meta.extent = Some(location);
                true
            }
            None => false,
        }
    }

    /// Backdate a page's access stamp; tests and imports only
    pub fn set_last_access(&self, page_id: &str, at: i64) -> bool {
        match self.pages.get_mut(page_id) {
            Some(mut entry) => {
                entry.meta.last_access_at = at;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn count_by_tier(&self, tier: Tier) -> usize {
        self.pages.iter().filter(|e| e.meta.tier == tier).count()
    }

    /// Pages resident in the hot store (hot or warm)
    pub fn resident_count(&self) -> usize {
        self.pages.iter().filter(|e| e.meta.tier.is_resident()).count()
    }

    /// Snapshot of pages in a tier, oldest access first
    ///
    /// Equal stamps are ordered by insertion, so the eviction order is
    /// stable across calls.
    pub fn pages_in_tier(&self, tier: Tier) -> Vec<PageMetadata> {
        let mut snapshot: Vec<(i64, u64, PageMetadata)> = self
            .pages
            .iter()
            .filter(|e| e.meta.tier == tier)
            .map(|e| (e.meta.last_access_at, e.seq, e.meta.clone()))
            .collect();
        snapshot.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        snapshot.into_iter().map(|(_, _, meta)| meta).collect()
    }

    /// Snapshot of every page belonging to a blob, in page order
    pub fn pages_of_blob(&self, blob_id: &str) -> Vec<PageMetadata> {
        let mut pages: Vec<PageMetadata> = self
            .pages
            .iter()
            .filter(|e| e.meta.blob_id == blob_id)
            .map(|e| e.meta.clone())
            .collect();
        pages.sort_by_key(|m| m.page_index);
        pages
    }

    /// Drop every record; tests only
    pub fn reset(&self) {
        self.pages.clear();
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}
