// Copyright 2021 The Jujutsu Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Content-addressed immutable blob store, spec §4.1. `put` is idempotent
//! and pure: the same bytes always produce the same id, writing twice is a
//! no-op after the first, and reads are repeatable and byte-exact.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use clru::CLruCache;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::file_util::create_or_reuse_dir;
use crate::file_util::persist_content_addressed_temp_file;
use crate::file_util::IoResultExt as _;
use crate::ids::ObjectId;

#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectId, StorageError>;
    async fn get(&self, object_id: &ObjectId) -> Result<Vec<u8>, StorageError>;
    async fn has(&self, object_id: &ObjectId) -> Result<bool, StorageError>;
}

/// In-memory object store used by tests and by the default single-process
/// configuration's page cache layer.
#[derive(Debug, Default)]
pub struct MemObjectStore {
    objects: Mutex<HashMap<ObjectId, Vec<u8>>>,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectId, StorageError> {
        let object_id = ObjectId::from_content(&bytes);
        let mut objects = self.objects.lock().expect("object store mutex poisoned");
        objects.entry(object_id).or_insert(bytes);
        Ok(object_id)
    }

    async fn get(&self, object_id: &ObjectId) -> Result<Vec<u8>, StorageError> {
        let objects = self.objects.lock().expect("object store mutex poisoned");
        objects
            .get(object_id)
            .cloned()
            .ok_or(StorageError::NotFound(*object_id))
    }

    async fn has(&self, object_id: &ObjectId) -> Result<bool, StorageError> {
        let objects = self.objects.lock().expect("object store mutex poisoned");
        Ok(objects.contains_key(object_id))
    }
}

/// File-backed object store persisting each blob at
/// `<root>/objects/<hex(object_id)>`, per the persisted layout in spec §6.
/// Writes go through a temp file and an atomic rename so that a partial
/// write never becomes visible under the final name.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        create_or_reuse_dir(&root).context(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, object_id: &ObjectId) -> PathBuf {
        self.root.join(object_id.hex())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectId, StorageError> {
        let object_id = ObjectId::from_content(&bytes);
        let path = self.object_path(&object_id);
        if path.exists() {
            return Ok(object_id);
        }
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            write_atomically(&root, &path, &bytes)
        })
        .await
        .map_err(|e| StorageError::IllegalState(e.to_string()))??;
        Ok(object_id)
    }

    async fn get(&self, object_id: &ObjectId) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(object_id);
        let object_id = *object_id;
        tokio::task::spawn_blocking(move || {
            std::fs::read(&path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound(object_id)
                } else {
                    StorageError::Io(e)
                }
            })
        })
        .await
        .map_err(|e| StorageError::IllegalState(e.to_string()))?
    }

    async fn has(&self, object_id: &ObjectId) -> Result<bool, StorageError> {
        Ok(self.object_path(object_id).exists())
    }
}

/// Read-through in-memory LRU cache in front of a slower backing store
/// (the file-backed store, typically), sized by
/// [`crate::config::PageStorageConfig::object_cache_capacity`]. `put`
/// always writes through so the backing store is never left stale.
pub struct CachedObjectStore<S> {
    inner: S,
    cache: Mutex<CLruCache<ObjectId, Arc<Vec<u8>>>>,
}

impl<S: ObjectStore> CachedObjectStore<S> {
    pub fn new(inner: S, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(CLruCache::new(capacity)),
        }
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for CachedObjectStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedObjectStore").field("inner", &self.inner).finish()
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for CachedObjectStore<S> {
    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectId, StorageError> {
        let object_id = self.inner.put(bytes.clone()).await?;
        self.cache
            .lock()
            .expect("object cache mutex poisoned")
            .put(object_id, Arc::new(bytes));
        Ok(object_id)
    }

    async fn get(&self, object_id: &ObjectId) -> Result<Vec<u8>, StorageError> {
        if let Some(hit) = self
            .cache
            .lock()
            .expect("object cache mutex poisoned")
            .get(object_id)
        {
            return Ok((**hit).clone());
        }
        let bytes = self.inner.get(object_id).await?;
        self.cache
            .lock()
            .expect("object cache mutex poisoned")
            .put(*object_id, Arc::new(bytes.clone()));
        Ok(bytes)
    }

    async fn has(&self, object_id: &ObjectId) -> Result<bool, StorageError> {
        if self
            .cache
            .lock()
            .expect("object cache mutex poisoned")
            .contains(object_id)
        {
            return Ok(true);
        }
        self.inner.has(object_id).await
    }
}

fn write_atomically(root: &Path, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    use std::io::Write as _;

    let mut temp_file = NamedTempFile::new_in(root).context(root)?;
    temp_file.write_all(bytes).context(path)?;
    persist_content_addressed_temp_file(temp_file, path).context(path)?;
    Ok(())
}
