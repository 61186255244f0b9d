// src/backend/memory.rs

//! In-memory backend
//!
//! The default hot tier and the unit-test double. Objects live in a
//! `BTreeMap` so listings come back in key order.

use super::{Backend, ListOptions, ObjectList, ObjectMeta, PutOptions, StoredObject};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

struct Entry {
    bytes: Vec<u8>,
    meta: ObjectMeta,
}

/// Backend keeping all objects in process memory
pub struct MemoryBackend {
    name: String,
    objects: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// A named instance, useful when several memory backends appear in logs
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of live (non-expired) objects
    pub async fn len(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        self.objects
            .read()
            .await
            .values()
            .filter(|e| !e.meta.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every object; tests only
    pub async fn clear(&self) {
        self.objects.write().await.clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: &[u8], opts: PutOptions) -> Result<ObjectMeta> {
        let meta = ObjectMeta::new(key, bytes, &opts);
        self.objects.write().await.insert(
            key.to_string(),
            Entry {
                bytes: bytes.to_vec(),
                meta: meta.clone(),
            },
        );
        Ok(meta)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let now = Utc::now().timestamp_millis();
        Ok(self.objects.read().await.get(key).and_then(|entry| {
            if entry.meta.is_expired(now) {
                None
            } else {
                Some(StoredObject {
                    bytes: entry.bytes.clone(),
                    meta: entry.meta.clone(),
                })
            }
        }))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let now = Utc::now().timestamp_millis();
        Ok(self.objects.read().await.get(key).and_then(|entry| {
            if entry.meta.is_expired(now) {
                None
            } else {
                Some(entry.meta.clone())
            }
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.objects.write().await.remove(key).is_some())
    }

    async fn list(&self, opts: ListOptions) -> Result<ObjectList> {
        let now = Utc::now().timestamp_millis();
        let objects = self.objects.read().await;

        let mut out = Vec::new();
        let mut truncated = false;
        let limit = opts.limit.unwrap_or(usize::MAX);

        for (key, entry) in objects.iter() {
            if let Some(cursor) = &opts.cursor
                && key.as_str() <= cursor.as_str()
            {
                continue;
            }
            if let Some(prefix) = &opts.prefix
                && !key.starts_with(prefix.as_str())
            {
                continue;
            }
            if entry.meta.is_expired(now) {
                continue;
            }
            if out.len() >= limit {
                truncated = true;
                break;
            }
            out.push(entry.meta.clone());
        }

        let cursor = if truncated {
            out.last().map(|m| m.key.clone())
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
