// src/fs/mod.rs

//! Tiered file system facade
//!
//! POSIX-shaped operations over the blob store, the page index, and the
//! tier manager. Paths map to nodes (files pointing at blobs, or
//! directories); blobs are shared by refcount, so identical content stored
//! under two paths occupies one set of pages.
//!
//! The facade also implements the [`Storage`] port, which is how
//! transactions drive it.

pub mod config;
pub mod path;

pub use config::{Encoding, FsConfig, FsConfigBuilder};

use crate::backend::{Backend, MemoryBackend, TieredBackend};
use crate::blob::BlobStore;
use crate::codec::{CompressionConfig, Compressor};
use crate::error::{Error, Result};
use crate::page::{now_millis, PageIndex, PageStore, DEFAULT_PAGE_SIZE};
use crate::tier::{TierConfig, TierManager};
use crate::txn::storage::{
    MkdirOptions, RmOptions, RmdirOptions, Storage, StorageCaps, WriteFlag, WriteOptions,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// What a path resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
enum Node {
    File {
        blob_id: String,
        size: u64,
        mode: u32,
        mtime: i64,
    },
    Dir {
        mode: u32,
        mtime: i64,
    },
}

impl Node {
    fn kind(&self) -> NodeKind {
        match self {
            Self::File { .. } => NodeKind::File,
            Self::Dir { .. } => NodeKind::Dir,
        }
    }
}

/// stat() result
#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub kind: NodeKind,
}

/// One readdir entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Present when the listing was taken with types
    pub kind: Option<NodeKind>,
}

/// Options for [`TieredFs::readdir`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaddirOptions {
    pub with_types: bool,
}

/// When eviction runs relative to the write that crossed the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionMode {
    /// Run before the write acknowledges
    #[default]
    Sync,
    /// Spawn in the background; transient overshoot of the target accepted
    Async,
    /// Caller drives eviction explicitly
    Manual,
}

/// Builder for [`TieredFs`]
pub struct TieredFsBuilder {
    config: FsConfig,
    tier_config: TierConfig,
    compression: CompressionConfig,
    page_size: usize,
    pages_per_extent: Option<usize>,
    hot: Arc<dyn Backend>,
    cold: Arc<dyn Backend>,
    eviction_mode: EvictionMode,
}

impl Default for TieredFsBuilder {
    fn default() -> Self {
        Self {
            config: FsConfig::default(),
            tier_config: TierConfig::default(),
            compression: CompressionConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            pages_per_extent: None,
            hot: Arc::new(MemoryBackend::named("hot")),
            cold: Arc::new(MemoryBackend::named("cold")),
            eviction_mode: EvictionMode::Sync,
        }
    }
}

impl TieredFsBuilder {
    pub fn config(mut self, config: FsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tier_config(mut self, tier_config: TierConfig) -> Self {
        self.tier_config = tier_config;
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn pages_per_extent(mut self, pages_per_extent: usize) -> Self {
        self.pages_per_extent = Some(pages_per_extent);
        self
    }

    pub fn hot_backend(mut self, hot: Arc<dyn Backend>) -> Self {
        self.hot = hot;
        self
    }

    pub fn cold_backend(mut self, cold: Arc<dyn Backend>) -> Self {
        self.cold = cold;
        self
    }

    pub fn eviction_mode(mut self, mode: EvictionMode) -> Self {
        self.eviction_mode = mode;
        self
    }

    pub fn build(self) -> Result<TieredFs> {
        let tiers = TieredBackend::new(self.hot, self.cold);
        let index = Arc::new(PageIndex::new());
        let pages = PageStore::new(tiers, index, self.page_size)?;
        let mut tier = TierManager::new(
            self.tier_config,
            pages.clone(),
            Compressor::new(self.compression),
        )?;
        if let Some(pages_per_extent) = self.pages_per_extent {
            tier = tier.with_pages_per_extent(pages_per_extent);
        }
        let tier = Arc::new(tier);

        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node::Dir {
                mode: config::DEFAULT_DIR_MODE,
                mtime: now_millis(),
            },
        );

        Ok(TieredFs {
            config: self.config,
            blobs: BlobStore::new(pages),
            tier,
            nodes: RwLock::new(nodes),
            eviction_mode: self.eviction_mode,
        })
    }
}

/// POSIX-shaped file system over the tiered blob store
pub struct TieredFs {
    config: FsConfig,
    blobs: BlobStore,
    tier: Arc<TierManager>,
    nodes: RwLock<BTreeMap<String, Node>>,
    eviction_mode: EvictionMode,
}

impl TieredFs {
    pub fn builder() -> TieredFsBuilder {
        TieredFsBuilder::default()
    }

    /// Fully in-memory instance with defaults; tests and scratch volumes
    pub fn in_memory() -> Self {
        TieredFsBuilder::default()
            .build()
            .expect("default configuration is valid")
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn tier(&self) -> &Arc<TierManager> {
        &self.tier
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Read a file's full contents
    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let blob_id = self.file_blob(path).await?;

        let record = self
            .blobs
            .record(&blob_id)
            .ok_or_else(|| Error::not_found(path))?;
        for page_id in &record.page_ids {
            self.tier.touch(page_id);
        }

        self.blobs.read(&blob_id).await
    }

    /// Read `[offset, offset + length)` of a file, touching only the
    /// intersecting pages
    pub async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let blob_id = self.file_blob(path).await?;

        for page_id in self.blobs.intersecting_pages(&blob_id, offset, length)? {
            self.tier.touch(&page_id);
        }

        self.blobs.read_range(&blob_id, offset, length).await
    }

    /// Write a file; returns the number of payload bytes written
    pub async fn write(&self, path: &str, bytes: &[u8], opts: &WriteOptions) -> Result<u64> {
        self.ensure_writable(path)?;

        {
            let mut nodes = self.nodes.write().await;

            let previous = match nodes.get(path) {
                Some(Node::Dir { .. }) => return Err(Error::IsDirectory(path.to_string())),
                Some(Node::File { blob_id, mode, .. }) => {
                    if opts.flag == WriteFlag::Exclusive {
                        return Err(Error::exists(path));
                    }
                    Some((blob_id.clone(), *mode))
                }
                None => None,
            };

            let data = if opts.flag == WriteFlag::Append
                && let Some((old_blob, _)) = &previous
            {
                let mut data = self.blobs.read(old_blob).await?;
                data.extend_from_slice(bytes);
                data
            } else {
                bytes.to_vec()
            };

            let blob_id = self.blobs.write(&data).await?;

            let mode = opts
                .mode
                .or(previous.as_ref().map(|(_, mode)| *mode))
                .unwrap_or(self.config.mode());
            nodes.insert(
                path.to_string(),
                Node::File {
                    blob_id,
                    size: data.len() as u64,
                    mode,
                    mtime: now_millis(),
                },
            );

            if let Some((old_blob, _)) = previous {
                self.blobs.release(&old_blob).await?;
            }
        }

        self.maybe_evict().await;
        Ok(bytes.len() as u64)
    }

    /// Remove a file, dropping its blob reference
    pub async fn unlink(&self, path: &str) -> Result<()> {
        self.ensure_writable(path)?;
        let mut nodes = self.nodes.write().await;

        match nodes.get(path) {
            None => Err(Error::not_found(path)),
            Some(Node::Dir { .. }) => Err(Error::IsDirectory(path.to_string())),
            Some(Node::File { blob_id, .. }) => {
                let blob_id = blob_id.clone();
                nodes.remove(path);
                self.blobs.release(&blob_id).await?;
                Ok(())
            }
        }
    }

    /// Remove a file or (recursively) a directory
    pub async fn rm(&self, path: &str, opts: &RmOptions) -> Result<()> {
        self.ensure_writable(path)?;
        let mut nodes = self.nodes.write().await;

        match nodes.get(path) {
            None => {
                if opts.force {
                    Ok(())
                } else {
                    Err(Error::not_found(path))
                }
            }
            Some(Node::File { blob_id, .. }) => {
                let blob_id = blob_id.clone();
                nodes.remove(path);
                self.blobs.release(&blob_id).await?;
                Ok(())
            }
            Some(Node::Dir { .. }) => {
                if !opts.recursive {
                    return Err(Error::IsDirectory(path.to_string()));
                }
                self.remove_subtree(&mut nodes, path).await
            }
        }
    }

    /// Remove a directory; ENOTEMPTY unless empty or recursive
    pub async fn rmdir(&self, path: &str, opts: &RmdirOptions) -> Result<()> {
        self.ensure_writable(path)?;
        if path == "/" {
            return Err(Error::invalid("cannot remove the root directory"));
        }
        let mut nodes = self.nodes.write().await;

        match nodes.get(path) {
            None => Err(Error::not_found(path)),
            Some(Node::File { .. }) => Err(Error::NotADirectory(path.to_string())),
            Some(Node::Dir { .. }) => {
                let has_children = nodes.keys().any(|k| path::is_direct_child(path, k));
                if has_children && !opts.recursive {
                    return Err(Error::NotEmpty(path.to_string()));
                }
                if has_children {
                    self.remove_subtree(&mut nodes, path).await
                } else {
                    nodes.remove(path);
                    Ok(())
                }
            }
        }
    }

    /// Create a directory; with `recursive` the whole chain is created and
    /// existing directories are fine
    pub async fn mkdir(&self, path: &str, opts: &MkdirOptions) -> Result<()> {
        self.ensure_writable(path)?;
        let mut nodes = self.nodes.write().await;
        let mode = opts.mode.unwrap_or(config::DEFAULT_DIR_MODE);

        match nodes.get(path) {
            Some(Node::Dir { .. }) => {
                return if opts.recursive {
                    Ok(())
                } else {
                    Err(Error::exists(path))
                };
            }
            Some(Node::File { .. }) => return Err(Error::exists(path)),
            None => {}
        }

        if opts.recursive {
            for ancestor in path::ancestors_of(path) {
                match nodes.get(&ancestor) {
                    Some(Node::Dir { .. }) => {}
                    Some(Node::File { .. }) => return Err(Error::NotADirectory(ancestor)),
                    None => {
                        nodes.insert(
                            ancestor.clone(),
                            Node::Dir {
                                mode,
                                mtime: now_millis(),
                            },
                        );
                    }
                }
            }
            return Ok(());
        }

        let parent = path::parent_of(path);
        match nodes.get(parent) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => return Err(Error::NotADirectory(parent.to_string())),
            None => return Err(Error::not_found(parent)),
        }

        nodes.insert(
            path.to_string(),
            Node::Dir {
                mode,
                mtime: now_millis(),
            },
        );
        Ok(())
    }

    /// Move a file or directory; blob references move with the nodes
    pub async fn rename(&self, old: &str, new: &str, mkdirp: bool, overwrite: bool) -> Result<()> {
        self.ensure_writable(old)?;
        if old == new {
            return Ok(());
        }
        let mut nodes = self.nodes.write().await;

        let moving = match nodes.get(old) {
            None => return Err(Error::not_found(old)),
            Some(node) => node.clone(),
        };

        if matches!(moving, Node::Dir { .. }) && path::is_within(old, new) {
            return Err(Error::invalid(format!(
                "cannot move {old} inside itself ({new})"
            )));
        }

        let mut displaced_blob = None;
        match nodes.get(new) {
            None => {}
            Some(Node::Dir { .. }) => return Err(Error::exists(new)),
            Some(Node::File { blob_id, .. }) => {
                if !overwrite {
                    return Err(Error::exists(new));
                }
                displaced_blob = Some(blob_id.clone());
            }
        }

        let parent = path::parent_of(new);
        match nodes.get(parent) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => return Err(Error::NotADirectory(parent.to_string())),
            None => {
                if !mkdirp {
                    return Err(Error::not_found(parent));
                }
                for ancestor in path::ancestors_of(parent) {
                    match nodes.get(&ancestor) {
                        Some(Node::Dir { .. }) => {}
                        Some(Node::File { .. }) => return Err(Error::NotADirectory(ancestor)),
                        None => {
                            nodes.insert(
                                ancestor.clone(),
                                Node::Dir {
                                    mode: config::DEFAULT_DIR_MODE,
                                    mtime: now_millis(),
                                },
                            );
                        }
                    }
                }
            }
        }

        match moving {
            Node::File { .. } => {
                if let Some(node) = nodes.remove(old) {
                    nodes.insert(new.to_string(), node);
                }
            }
            Node::Dir { .. } => {
                // Move the directory and every descendant key under it
                let descendants: Vec<String> = nodes
                    .keys()
                    .filter(|k| path::is_within(old, k))
                    .cloned()
                    .collect();
                for key in descendants {
                    if let Some(node) = nodes.remove(&key) {
                        let suffix = &key[old.len()..];
                        nodes.insert(format!("{new}{suffix}"), node);
                    }
                }
            }
        }

        if let Some(blob_id) = displaced_blob {
            self.blobs.release(&blob_id).await?;
        }

        debug!("renamed {} -> {}", old, new);
        Ok(())
    }

    /// Bulk-demote a file's resident pages into packed cold extents
    ///
    /// The file stays fully readable; its pages are served from the extent
    /// until rewritten. Useful for data known to have gone cold all at
    /// once.
    pub async fn archive(&self, path: &str) -> Result<crate::tier::PackResult> {
        self.ensure_writable(path)?;
        let blob_id = self.file_blob(path).await?;
        self.tier.pack_blob(&blob_id).await
    }

    /// File or directory metadata
    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        let nodes = self.nodes.read().await;
        match nodes.get(path) {
            None => Err(Error::not_found(path)),
            Some(Node::File {
                size, mode, mtime, ..
            }) => Ok(FileStat {
                size: *size,
                mode: *mode,
                mtime: *mtime,
                kind: NodeKind::File,
            }),
            Some(Node::Dir { mode, mtime }) => Ok(FileStat {
                size: 0,
                mode: *mode,
                mtime: *mtime,
                kind: NodeKind::Dir,
            }),
        }
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.nodes.read().await.contains_key(path)
    }

    /// List a directory's immediate children, sorted by name
    pub async fn readdir(&self, path: &str, opts: &ReaddirOptions) -> Result<Vec<DirEntry>> {
        let nodes = self.nodes.read().await;
        match nodes.get(path) {
            None => return Err(Error::not_found(path)),
            Some(Node::File { .. }) => return Err(Error::NotADirectory(path.to_string())),
            Some(Node::Dir { .. }) => {}
        }

        Ok(nodes
            .iter()
            .filter(|(k, _)| path::is_direct_child(path, k))
            .map(|(k, node)| DirEntry {
                name: path::file_name(k).to_string(),
                kind: opts.with_types.then(|| node.kind()),
            })
            .collect())
    }

    async fn file_blob(&self, path: &str) -> Result<String> {
        let nodes = self.nodes.read().await;
        match nodes.get(path) {
            None => Err(Error::not_found(path)),
            Some(Node::Dir { .. }) => Err(Error::IsDirectory(path.to_string())),
            Some(Node::File { blob_id, .. }) => Ok(blob_id.clone()),
        }
    }

    /// Remove `dir` and everything under it, releasing file blobs
    async fn remove_subtree(
        &self,
        nodes: &mut BTreeMap<String, Node>,
        dir: &str,
    ) -> Result<()> {
        let keys: Vec<String> = nodes
            .keys()
            .filter(|k| path::is_within(dir, k))
            .cloned()
            .collect();

        for key in keys {
            if let Some(Node::File { blob_id, .. }) = nodes.remove(&key) {
                self.blobs.release(&blob_id).await?;
            }
        }
        Ok(())
    }

    fn ensure_writable(&self, path: &str) -> Result<()> {
        if self.config.read_only() {
            return Err(Error::ReadOnly(path.to_string()));
        }
        Ok(())
    }

    /// Eviction backpressure after a write
    async fn maybe_evict(&self) {
        match self.eviction_mode {
            EvictionMode::Sync => {
                if self.tier.should_evict() {
                    self.tier.run_eviction().await;
                }
            }
            EvictionMode::Async => {
                if self.tier.should_evict() {
                    let tier = Arc::clone(&self.tier);
                    tokio::spawn(async move {
                        tier.run_eviction().await;
                    });
                }
            }
            EvictionMode::Manual => {}
        }
    }
}

#[async_trait]
impl Storage for TieredFs {
    fn caps(&self) -> StorageCaps {
        StorageCaps::full()
    }

    async fn write_file(&self, path: &str, bytes: &[u8], opts: &WriteOptions) -> Result<u64> {
        self.write(path, bytes, opts).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.read(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(TieredFs::exists(self, path).await)
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        TieredFs::unlink(self, path).await
    }

    async fn rm(&self, path: &str, opts: &RmOptions) -> Result<()> {
        TieredFs::rm(self, path, opts).await
    }

    async fn rmdir(&self, path: &str, opts: &RmdirOptions) -> Result<()> {
        TieredFs::rmdir(self, path, opts).await
    }

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> Result<()> {
        TieredFs::rename(self, from, to, false, overwrite).await
    }

    async fn mkdir(&self, path: &str, opts: &MkdirOptions) -> Result<()> {
        TieredFs::mkdir(self, path, opts).await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        TieredFs::unlink(self, path).await
    }
}
