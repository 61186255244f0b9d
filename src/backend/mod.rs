// src/backend/mod.rs

//! Key-value object backend port
//!
//! Pages, extents, and lock files are stored through this interface. A
//! backend is an object store in the loosest sense: keyed byte payloads with
//! a little metadata. Listing is optional; backends without it return an
//! empty result and log a warning so admin queries degrade instead of
//! failing.

mod fs;
mod memory;
mod tiered;

pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use tiered::TieredBackend;

use crate::error::Result;
use crate::hash;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::warn;

/// Options for storing an object
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Objects past their TTL behave as absent
    pub ttl: Option<Duration>,
    pub content_type: Option<String>,
    pub custom_metadata: HashMap<String, String>,
}

impl PutOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_metadata.insert(key.into(), value.into());
        self
    }
}

/// Metadata describing a stored object
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// FNV-1a content tag
    pub etag: String,
    pub content_type: Option<String>,
    pub custom_metadata: HashMap<String, String>,
    /// Unix millis
    pub uploaded_at: i64,
    /// Unix millis; None = no expiry
    pub expires_at: Option<i64>,
}

impl ObjectMeta {
    pub(crate) fn new(key: &str, bytes: &[u8], opts: &PutOptions) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            key: key.to_string(),
            size: bytes.len() as u64,
            etag: hash::etag(bytes),
            content_type: opts.content_type.clone(),
            custom_metadata: opts.custom_metadata.clone(),
            uploaded_at: now,
            expires_at: opts.ttl.map(|ttl| now + ttl.as_millis() as i64),
        }
    }

    pub(crate) fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at.is_some_and(|at| now_millis >= at)
    }
}

/// An object together with its metadata
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub meta: ObjectMeta,
}

/// Options for listing objects
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    /// Resume after this key
    pub cursor: Option<String>,
}

/// One page of listing results
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub objects: Vec<ObjectMeta>,
    pub truncated: bool,
    /// Pass back as `ListOptions::cursor` to continue
    pub cursor: Option<String>,
}

/// The backend port consumed by the page and tier stores
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs ("memory", "fs", ...)
    fn name(&self) -> &str;

    /// Store an object, replacing any existing one under the key
    async fn put(&self, key: &str, bytes: &[u8], opts: PutOptions) -> Result<ObjectMeta>;

    /// Fetch an object; `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<StoredObject>>;

    /// Fetch object metadata without the payload
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Remove an object; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Fetch an object as a reader
    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
        Ok(self
            .get(key)
            .await?
            .map(|obj| Box::new(Cursor::new(obj.bytes)) as Box<dyn AsyncRead + Send + Unpin>))
    }

    /// Remove several objects; returns how many existed
    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key).await?.is_some())
    }

    /// List objects; backends without listing return empty and warn
    async fn list(&self, _opts: ListOptions) -> Result<ObjectList> {
        warn!(backend = self.name(), "backend does not support listing, returning empty");
        Ok(ObjectList::default())
    }

    /// Copy an object to a new key, preserving its metadata
    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let obj = self
            .get(src)
            .await?
            .ok_or_else(|| crate::error::Error::not_found(src))?;

        let opts = PutOptions {
            ttl: None,
            content_type: obj.meta.content_type.clone(),
            custom_metadata: obj.meta.custom_metadata.clone(),
        };
        self.put(dst, &obj.bytes, opts).await?;
        Ok(())
    }
}
