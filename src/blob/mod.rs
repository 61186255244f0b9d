// src/blob/mod.rs

//! Content-addressable blob store
//!
//! A blob is an ordered list of pages plus a size, identified by the
//! SHA-256 of its bytes. Writing the same content twice yields the same
//! blob and bumps a refcount instead of storing anything new; pages are
//! garbage-collected when the last reference is released.

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::hash;
use crate::page::{now_millis, PageId, PageStore};
use dashmap::DashMap;
use tracing::debug;

/// One row per distinct byte sequence
#[derive(Debug, Clone)]
pub struct BlobRecord {
    pub blob_id: String,
    pub size: u64,
    /// Page ids in page-index order
    pub page_ids: Vec<PageId>,
    /// References held by the file index
    pub refcount: u64,
    pub created_at: i64,
}

/// Size and reference information for a blob
#[derive(Debug, Clone)]
pub struct BlobStat {
    pub size: u64,
    pub page_count: usize,
    pub refcount: u64,
    pub created_at: i64,
}

/// Maps blob ids to ordered page lists with dedup and refcounting
pub struct BlobStore {
    pages: PageStore,
    blobs: DashMap<String, BlobRecord>,
}

impl BlobStore {
    pub fn new(pages: PageStore) -> Self {
        Self {
            pages,
            blobs: DashMap::new(),
        }
    }

    pub fn pages(&self) -> &PageStore {
        &self.pages
    }

    /// Store bytes, returning the content-derived blob id
    ///
    /// Existing content is deduplicated: the refcount is bumped and no
    /// pages are written.
    pub async fn write(&self, bytes: &[u8]) -> Result<String> {
        let blob_id = hash::blob_id(bytes);

        if let Some(mut record) = self.blobs.get_mut(&blob_id) {
            record.refcount += 1;
            debug!("dedup hit for {} (refcount {})", blob_id, record.refcount);
            return Ok(blob_id);
        }

        let page_ids = self.pages.write_pages(&blob_id, bytes).await?;

        // A concurrent writer of the same content may have won the race;
        // page writes are idempotent (same keys, same bytes), so only the
        // record insert needs arbitration.
        self.blobs
            .entry(blob_id.clone())
            .and_modify(|record| record.refcount += 1)
            .or_insert_with(|| BlobRecord {
                blob_id: blob_id.clone(),
                size: bytes.len() as u64,
                page_ids,
                refcount: 1,
                created_at: now_millis(),
            });

        Ok(blob_id)
    }

    /// Read a blob's full contents
    ///
    /// The reassembled bytes are verified against the content-derived id,
    /// so corruption anywhere in the page path surfaces here.
    pub async fn read(&self, blob_id: &str) -> Result<Vec<u8>> {
        let record = self.record_checked(blob_id)?;
        let bytes = self.pages.read_pages(&record.page_ids).await?;

        let computed = hash::blob_id(&bytes);
        if computed != blob_id {
            return Err(Error::Corrupted(format!(
                "blob hash mismatch: expected {blob_id}, got {computed}"
            )));
        }
        Ok(bytes)
    }

    /// Read `[offset, offset + length)` of a blob
    pub async fn read_range(&self, blob_id: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let record = self.record_checked(blob_id)?;
        self.pages.read_range(&record.page_ids, offset, length).await
    }

    /// The page ids a range read would touch
    pub fn intersecting_pages(
        &self,
        blob_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<PageId>> {
        let record = self.record_checked(blob_id)?;
        Ok(self.pages.intersecting(&record.page_ids, offset, length))
    }

    pub fn record(&self, blob_id: &str) -> Option<BlobRecord> {
        self.blobs.get(blob_id).map(|r| r.clone())
    }

    pub fn contains(&self, blob_id: &str) -> bool {
        self.blobs.contains_key(blob_id)
    }

    pub fn stat(&self, blob_id: &str) -> Result<BlobStat> {
        let record = self.record_checked(blob_id)?;
        Ok(BlobStat {
            size: record.size,
            page_count: record.page_ids.len(),
            refcount: record.refcount,
            created_at: record.created_at,
        })
    }

    /// Add a reference to an existing blob
    pub fn add_ref(&self, blob_id: &str) -> Result<u64> {
        let mut record = self
            .blobs
            .get_mut(blob_id)
            .ok_or_else(|| Error::not_found(blob_id))?;
        record.refcount += 1;
        Ok(record.refcount)
    }

    /// Drop a reference; the blob and its pages are removed at zero
    ///
    /// Returns true when this release deleted the blob. Packed extent
    /// objects shared by the blob's cold pages are removed along with the
    /// per-page objects.
    pub async fn release(&self, blob_id: &str) -> Result<bool> {
        let page_ids = {
            let mut record = self
                .blobs
                .get_mut(blob_id)
                .ok_or_else(|| Error::not_found(blob_id))?;
            record.refcount = record.refcount.saturating_sub(1);
            if record.refcount > 0 {
                return Ok(false);
            }
            record.page_ids.clone()
        };

        // Collect extent keys before the metadata goes away
        let mut extent_keys: Vec<String> = page_ids
            .iter()
            .filter_map(|id| self.pages.index().get(id))
            .filter_map(|meta| meta.extent.map(|e| e.key))
            .collect();
        extent_keys.sort();
        extent_keys.dedup();

        self.blobs.remove(blob_id);
        self.pages.delete_pages(&page_ids).await?;
        if !extent_keys.is_empty() {
            self.pages.tiers().cold().delete_many(&extent_keys).await?;
        }

        debug!("garbage-collected {} ({} pages)", blob_id, page_ids.len());
        Ok(true)
    }

    /// Number of distinct blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn record_checked(&self, blob_id: &str) -> Result<BlobRecord> {
        if !hash::validate_blob_id(blob_id) {
            return Err(Error::invalid(format!("malformed blob id: {blob_id}")));
        }
        self.blobs
            .get(blob_id)
            .map(|r| r.clone())
            .ok_or_else(|| Error::not_found(blob_id))
    }
}
