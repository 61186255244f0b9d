// src/page/mod.rs

//! Page storage: fixed-size chunks of blob byte streams
//!
//! Blobs are split into pages (2 MiB by default) keyed
//! `page/<blob_id>/<index>`. Page bytes live in whichever backend their
//! tier says; the metadata index stays in the hot process regardless.

pub mod meta;

pub use meta::{now_millis, ExtentLocation, PageIndex, PageMetadata, Tier};

use crate::backend::{Backend, PutOptions, TieredBackend};
use crate::codec::{self, CompressionMeta};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Default page size: 2 MiB
pub const DEFAULT_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Opaque page identifier, canonically derived from `(blob_id, index)`
pub type PageId = String;

// Custom-metadata keys attached to stored page objects
pub(crate) const META_PAGE_ID: &str = "page_id";
pub(crate) const META_BLOB_ID: &str = "blob_id";
pub(crate) const META_PAGE_INDEX: &str = "page_index";
pub(crate) const META_COMPRESSION: &str = "compression";

/// The backend key for a page
pub fn page_key(blob_id: &str, index: u32) -> PageId {
    format!("page/{blob_id}/{index}")
}

/// Per-page put/get/delete over the tiered backends
///
/// Cheap to clone; clones share the same backends and index.
#[derive(Clone)]
pub struct PageStore {
    tiers: TieredBackend,
    index: Arc<PageIndex>,
    page_size: usize,
}

impl PageStore {
    pub fn new(tiers: TieredBackend, index: Arc<PageIndex>, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::invalid("page size must be non-zero"));
        }
        Ok(Self {
            tiers,
            index,
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn index(&self) -> &Arc<PageIndex> {
        &self.index
    }

    pub fn tiers(&self) -> &TieredBackend {
        &self.tiers
    }

    /// Split `bytes` into pages, write each to the hot backend, and index
    /// them. Returns the ordered page id list.
    pub async fn write_pages(&self, blob_id: &str, bytes: &[u8]) -> Result<Vec<PageId>> {
        let mut page_ids = Vec::with_capacity(bytes.len().div_ceil(self.page_size));

        for (index, chunk) in bytes.chunks(self.page_size).enumerate() {
            let index = index as u32;
            let page_id = page_key(blob_id, index);

            let opts = PutOptions::default()
                .with_metadata(META_PAGE_ID, page_id.clone())
                .with_metadata(META_BLOB_ID, blob_id)
                .with_metadata(META_PAGE_INDEX, index.to_string());
            self.tiers.hot().put(&page_id, chunk, opts).await?;

            self.index.insert(PageMetadata::new(
                page_id.clone(),
                blob_id.to_string(),
                index,
                chunk.len() as u32,
            ));
            page_ids.push(page_id);
        }

        debug!("wrote {} page(s) for {}", page_ids.len(), blob_id);
        Ok(page_ids)
    }

    /// Read one page's bytes from wherever its tier places them
    ///
    /// Cold pages either sit under their own key or packed inside an
    /// extent. During migration both stores may hold the bytes; the
    /// declared tier is tried first and the other side covers the
    /// in-flight window.
    pub async fn read_page(&self, page_id: &str) -> Result<Vec<u8>> {
        let meta = self
            .index
            .get(page_id)
            .ok_or_else(|| Error::not_found(page_id))?;

        if meta.tier == Tier::Cold
            && let Some(location) = &meta.extent
        {
            return self.read_packed_page(page_id, location).await;
        }

        let primary = self.tiers.backend_for(meta.tier);
        let object = match primary.get(page_id).await? {
            Some(object) => object,
            None => self
                .tiers
                .other_side(meta.tier)
                .get(page_id)
                .await?
                .ok_or_else(|| Error::not_found(page_id))?,
        };

        match object.meta.custom_metadata.get(META_COMPRESSION) {
            Some(raw) => {
                let cmeta: CompressionMeta = serde_json::from_str(raw).map_err(|e| {
                    Error::Corrupted(format!("compression metadata for {page_id}: {e}"))
                })?;
                codec::decompress(&object.bytes, &cmeta)
            }
            None => Ok(object.bytes),
        }
    }

    /// Extract a packed page from its extent object
    async fn read_packed_page(&self, page_id: &str, location: &ExtentLocation) -> Result<Vec<u8>> {
        let object = match self.tiers.cold().get(&location.key).await? {
            Some(object) => object,
            None => {
                // Packing window: the hot copy outlives the metadata flip
                return self
                    .tiers
                    .hot()
                    .get(page_id)
                    .await?
                    .map(|o| o.bytes)
                    .ok_or_else(|| Error::not_found(page_id));
            }
        };

        let extent = crate::extent::parse_extent(&object.bytes)?;
        extent.extract_page(location.slot)
    }

    /// Read pages and concatenate them in the given order
    pub async fn read_pages(&self, page_ids: &[PageId]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for page_id in page_ids {
            out.extend_from_slice(&self.read_page(page_id).await?);
        }
        Ok(out)
    }

    /// Read `[offset, offset + length)` loading only the intersecting pages
    pub async fn read_range(
        &self,
        page_ids: &[PageId],
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(length)
            .ok_or_else(|| Error::invalid("range offset + length overflows"))?;
        if length == 0 {
            return Ok(Vec::new());
        }

        let page_size = self.page_size as u64;
        let first = (offset / page_size) as usize;
        if first >= page_ids.len() {
            return Ok(Vec::new());
        }
        let last = (((end - 1) / page_size) as usize).min(page_ids.len() - 1);

        let mut loaded = Vec::new();
        for page_id in &page_ids[first..=last] {
            loaded.extend_from_slice(&self.read_page(page_id).await?);
        }

        let skip = (offset - first as u64 * page_size) as usize;
        if skip >= loaded.len() {
            return Ok(Vec::new());
        }
        let take = (length as usize).min(loaded.len() - skip);
        Ok(loaded[skip..skip + take].to_vec())
    }

    /// Which page ids intersect `[offset, offset + length)`
    ///
    /// Degenerate ranges (zero length, overflowing end) intersect nothing.
    pub fn intersecting(&self, page_ids: &[PageId], offset: u64, length: u64) -> Vec<PageId> {
        let Some(end) = offset.checked_add(length) else {
            return Vec::new();
        };
        if length == 0 {
            return Vec::new();
        }
        let page_size = self.page_size as u64;
        let first = (offset / page_size) as usize;
        if first >= page_ids.len() {
            return Vec::new();
        }
        let last = (((end - 1) / page_size) as usize).min(page_ids.len() - 1);
        page_ids[first..=last].to_vec()
    }

    /// Remove a page's bytes from both stores and drop its metadata
    pub async fn delete_page(&self, page_id: &str) -> Result<bool> {
        let Some(meta) = self.index.remove(page_id) else {
            return Ok(false);
        };

        let primary = self.tiers.backend_for(meta.tier).delete(page_id).await?;
        // Clear any migration leftovers on the other side
        let secondary = self.tiers.other_side(meta.tier).delete(page_id).await?;
        Ok(primary || secondary)
    }

    /// Remove many pages; returns how many had bytes somewhere
    pub async fn delete_pages(&self, page_ids: &[PageId]) -> Result<usize> {
        let mut deleted = 0;
        for page_id in page_ids {
            if self.delete_page(page_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn store_with_page_size(page_size: usize) -> PageStore {
        let tiers = TieredBackend::new(
            Arc::new(MemoryBackend::named("hot")),
            Arc::new(MemoryBackend::named("cold")),
        );
        PageStore::new(tiers, Arc::new(PageIndex::new()), page_size).unwrap()
    }

    #[test]
    fn test_page_key_scheme() {
        assert_eq!(page_key("blob-abc", 0), "page/blob-abc/0");
        assert_eq!(page_key("blob-abc", 17), "page/blob-abc/17");
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let tiers = TieredBackend::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
        );
        assert!(PageStore::new(tiers, Arc::new(PageIndex::new()), 0).is_err());
    }

    #[tokio::test]
    async fn test_write_pages_chunks_and_indexes() {
        let store = store_with_page_size(10);
        let bytes = b"0123456789abcdefghijXYZ"; // 23 bytes -> 3 pages

        let ids = store.write_pages("blob-t", bytes).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "page/blob-t/0");

        // Index has contiguous records with the right sizes
        let metas = store.index().pages_of_blob("blob-t");
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[0].size, 10);
        assert_eq!(metas[1].size, 10);
        assert_eq!(metas[2].size, 3);
        assert!(metas.iter().all(|m| m.tier == Tier::Warm));
        let total: u32 = metas.iter().map(|m| m.size).sum();
        assert_eq!(total as usize, bytes.len());
    }

    #[tokio::test]
    async fn test_write_empty_blob() {
        let store = store_with_page_size(10);
        let ids = store.write_pages("blob-empty", b"").await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_read_pages_roundtrip() {
        let store = store_with_page_size(8);
        let bytes: Vec<u8> = (0u8..100).collect();

        let ids = store.write_pages("blob-r", &bytes).await.unwrap();
        let read = store.read_pages(&ids).await.unwrap();
        assert_eq!(read, bytes);
    }

    #[tokio::test]
    async fn test_read_missing_page() {
        let store = store_with_page_size(8);
        let err = store.read_page("page/blob-x/0").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_read_range_trims() {
        let store = store_with_page_size(10);
        let bytes: Vec<u8> = (0u8..35).collect();
        let ids = store.write_pages("blob-rr", &bytes).await.unwrap();

        // Entirely inside one page
        assert_eq!(store.read_range(&ids, 2, 5).await.unwrap(), &bytes[2..7]);
        // Spanning a page boundary
        assert_eq!(store.read_range(&ids, 8, 10).await.unwrap(), &bytes[8..18]);
        // Runs past the end: trimmed
        assert_eq!(store.read_range(&ids, 30, 100).await.unwrap(), &bytes[30..]);
        // Starts past the end: empty
        assert!(store.read_range(&ids, 99, 5).await.unwrap().is_empty());
        // Zero length: empty
        assert!(store.read_range(&ids, 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_range_overflow_rejected() {
        let store = store_with_page_size(10);
        let ids = store.write_pages("blob-o", b"0123456789").await.unwrap();
        let err = store.read_range(&ids, u64::MAX, 2).await.unwrap_err();
        assert_eq!(err.code(), "EINVAL");
    }

    #[tokio::test]
    async fn test_intersecting() {
        let store = store_with_page_size(10);
        let ids = store.write_pages("blob-i", &[7u8; 35]).await.unwrap();

        assert_eq!(store.intersecting(&ids, 0, 10), &ids[0..1]);
        assert_eq!(store.intersecting(&ids, 5, 10), &ids[0..2]);
        assert_eq!(store.intersecting(&ids, 10, 1), &ids[1..2]);
        assert!(store.intersecting(&ids, 0, 0).is_empty());
        assert_eq!(store.intersecting(&ids, 20, 100), &ids[2..4]);
        assert!(store.intersecting(&ids, u64::MAX, 2).is_empty());
    }

    #[tokio::test]
    async fn test_delete_pages() {
        let store = store_with_page_size(10);
        let ids = store.write_pages("blob-d", &[1u8; 25]).await.unwrap();

        assert_eq!(store.delete_pages(&ids).await.unwrap(), 3);
        assert!(store.index().is_empty());
        assert!(store.read_page(&ids[0]).await.is_err());
        // Double delete is a no-op
        assert_eq!(store.delete_pages(&ids).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_follows_tier_and_falls_back() {
        let store = store_with_page_size(10);
        let ids = store.write_pages("blob-f", b"abcdefghij").await.unwrap();
        let page_id = &ids[0];

        // Simulate a finished migration: bytes only in cold
        let object = store.tiers().hot().get(page_id).await.unwrap().unwrap();
        store
            .tiers()
            .cold()
            .put(page_id, &object.bytes, PutOptions::default())
            .await
            .unwrap();
        store.tiers().hot().delete(page_id).await.unwrap();
        store.index().set_tier(page_id, Tier::Cold);

        assert_eq!(store.read_page(page_id).await.unwrap(), b"abcdefghij");

        // Simulate the migration window: metadata already cold, hot bytes
        // still present, cold object gone again
        store.tiers().cold().delete(page_id).await.unwrap();
        store
            .tiers()
            .hot()
            .put(page_id, b"abcdefghij", PutOptions::default())
            .await
            .unwrap();
        assert_eq!(store.read_page(page_id).await.unwrap(), b"abcdefghij");
    }
}
