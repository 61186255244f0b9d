// src/backend/fs.rs

//! Filesystem backend
//!
//! Keys hash into a two-level `objects/{h[0:2]}/{h[2:]}` fanout so no single
//! directory grows too many entries. Object bytes are published atomically
//! (write to `.tmp`, then rename); a JSON sidecar carries the key and
//! metadata, which also makes listing a matter of walking sidecars.

use super::{Backend, ListOptions, ObjectList, ObjectMeta, PutOptions, StoredObject};
use crate::error::{Error, Result};
use crate::hash;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::debug;

const META_EXT: &str = "meta";
const TMP_EXT: &str = "tmp";

/// Backend storing objects as files under a root directory
pub struct FsBackend {
    name: String,
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("objects"))?;
        debug!("fs backend rooted at {:?}", root);

        Ok(Self {
            name: "fs".to_string(),
            root,
        })
    }

    /// The filesystem path for a key
    ///
    /// Keys may contain any characters (slashes included), so the path is
    /// derived from the key's SHA-256 rather than the key itself.
    fn object_path(&self, key: &str) -> PathBuf {
        let digest = hash::sha256_hex(key.as_bytes());
        let (prefix, rest) = digest.split_at(2);
        self.root.join("objects").join(prefix).join(rest)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.object_path(key).with_extension(META_EXT)
    }

    async fn read_meta(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.meta_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let meta: ObjectMeta = serde_json::from_slice(&raw)
            .map_err(|e| Error::Corrupted(format!("sidecar for {key} unreadable: {e}")))?;
        Ok(Some(meta))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(TMP_EXT);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for FsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: &[u8], opts: PutOptions) -> Result<ObjectMeta> {
        let meta = ObjectMeta::new(key, bytes, &opts);
        let path = self.object_path(key);

        Self::write_atomic(&path, bytes).await?;
        let sidecar = serde_json::to_vec(&meta)
            .map_err(|e| Error::Storage(format!("sidecar encode failed: {e}")))?;
        Self::write_atomic(&self.meta_path(key), &sidecar).await?;

        debug!("stored {} ({} bytes)", key, bytes.len());
        Ok(meta)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let Some(meta) = self.read_meta(key).await? else {
            return Ok(None);
        };
        if meta.is_expired(Utc::now().timestamp_millis()) {
            return Ok(None);
        }

        let bytes = match tokio::fs::read(self.object_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(StoredObject { bytes, meta }))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let Some(meta) = self.read_meta(key).await? else {
            return Ok(None);
        };
        if meta.is_expired(Utc::now().timestamp_millis()) {
            return Ok(None);
        }
        Ok(Some(meta))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let _ = tokio::fs::remove_file(self.meta_path(key)).await;
        Ok(existed)
    }

    async fn list(&self, opts: ListOptions) -> Result<ObjectList> {
        let objects_dir = self.root.join("objects");
        let mut metas = Vec::new();

        // Walk the fanout directories collecting sidecars
        let mut stack = vec![objects_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == META_EXT) {
                    let raw = tokio::fs::read(&path).await?;
                    if let Ok(meta) = serde_json::from_slice::<ObjectMeta>(&raw) {
                        metas.push(meta);
                    }
                }
            }
        }

        metas.sort_by(|a, b| a.key.cmp(&b.key));

        let now = Utc::now().timestamp_millis();
        let limit = opts.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        let mut truncated = false;

        for meta in metas {
            if let Some(cursor) = &opts.cursor
                && meta.key.as_str() <= cursor.as_str()
            {
                continue;
            }
            if let Some(prefix) = &opts.prefix
                && !meta.key.starts_with(prefix.as_str())
            {
                continue;
            }
            if meta.is_expired(now) {
                continue;
            }
            if out.len() >= limit {
                truncated = true;
                break;
            }
            out.push(meta);
        }

        let cursor = if truncated {
            out.last().map(|m: &ObjectMeta| m.key.clone())
        } else {
            None
        };

        Ok(ObjectList {
            objects: out,
            truncated,
            cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path()).unwrap();

        backend
            .put("page/blob-x/0", b"page bytes", PutOptions::default())
            .await
            .unwrap();

        let obj = backend.get("page/blob-x/0").await.unwrap().unwrap();
        assert_eq!(obj.bytes, b"page bytes");
        assert_eq!(obj.meta.key, "page/blob-x/0");
    }

    #[tokio::test]
    async fn test_missing_key() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path()).unwrap();

        assert!(backend.get("absent").await.unwrap().is_none());
        assert!(backend.head("absent").await.unwrap().is_none());
        assert!(!backend.delete("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path()).unwrap();

        backend.put("k", b"one", PutOptions::default()).await.unwrap();
        backend.put("k", b"two", PutOptions::default()).await.unwrap();

        let obj = backend.get("k").await.unwrap().unwrap();
        assert_eq!(obj.bytes, b"two");
    }

    #[tokio::test]
    async fn test_delete_removes_sidecar() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path()).unwrap();

        backend.put("k", b"x", PutOptions::default()).await.unwrap();
        assert!(backend.delete("k").await.unwrap());
        assert!(backend.get("k").await.unwrap().is_none());

        // Sidecar gone too: listing sees nothing
        let list = backend.list(ListOptions::default()).await.unwrap();
        assert!(list.objects.is_empty());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path()).unwrap();

        for key in ["page/b1/0", "page/b1/1", "lock/a"] {
            backend.put(key, b"x", PutOptions::default()).await.unwrap();
        }

        let list = backend
            .list(ListOptions {
                prefix: Some("page/".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(list.objects.len(), 2);
        assert!(list.objects.iter().all(|m| m.key.starts_with("page/")));
    }

    #[tokio::test]
    async fn test_keys_with_odd_characters() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path()).unwrap();

        let key = "lock//deep/path/config.json.lock";
        backend.put(key, b"held", PutOptions::default()).await.unwrap();
        assert_eq!(backend.get(key).await.unwrap().unwrap().bytes, b"held");
    }
}
