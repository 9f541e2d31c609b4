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

//! A ledger: a namespace of independent pages sharing one object store
//! and one conflict-resolver factory (spec §1, §4.7). Replacing the
//! factory fans the change out to every page this ledger currently has
//! open, disconnecting each page's existing custom resolver and
//! invalidating its cached policy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use tracing::instrument;

use crate::config::LedgerConfig;
use crate::error::StorageError;
use crate::ids::PageId;
use crate::merge::ConflictResolverFactory;
use crate::object_store::CachedObjectStore;
use crate::object_store::FsObjectStore;
use crate::object_store::MemObjectStore;
use crate::object_store::ObjectStore;
use crate::page::Page;

/// Owns every page this process has open for one ledger namespace. The
/// object store is shared across pages (spec §5: "the object store and
/// DAG index are the only cross-page shared resources"); each page's
/// commit DAG is its own.
///
/// A file-backed ledger (opened via [`Ledger::open`]) lays its pages out
/// on disk as spec §6 describes: `<root>/objects/<hex>` holds the shared
/// blob store, and `<root>/pages/<hex(page_id)>/{commits,heads}` holds
/// each page's persisted commit DAG, so [`Ledger::open_page`] can
/// reconstruct a page's full history after a restart. An in-memory
/// ledger (`Ledger::in_memory`) has no such root and every page it
/// creates is ephemeral.
pub struct Ledger {
    object_store: Arc<dyn ObjectStore>,
    config: LedgerConfig,
    pages: RwLock<HashMap<PageId, Arc<Page>>>,
    factory: RwLock<Option<Arc<dyn ConflictResolverFactory>>>,
    persist_root: Option<PathBuf>,
}

impl Ledger {
    /// A ledger backed by an in-memory object store; no cache layer is
    /// needed since the backing store already lives in memory.
    pub fn in_memory(config: LedgerConfig) -> Arc<Self> {
        Self::with_object_store(Arc::new(MemObjectStore::new()), config, None)
    }

    /// A ledger backed by the file-backed object store at `root`,
    /// fronted by an in-memory LRU cache sized from `config`. Pages
    /// created or opened through this ledger persist their commit DAG
    /// under `root/pages/<hex(page_id)>` as well.
    pub fn open(root: impl Into<PathBuf>, config: LedgerConfig) -> Result<Arc<Self>, StorageError> {
        let root = root.into();
        let fs_store = FsObjectStore::open(root.join("objects"))?;
        let cached = CachedObjectStore::new(fs_store, config.page_storage.object_cache_capacity());
        Ok(Self::with_object_store(Arc::new(cached), config, Some(root)))
    }

    fn with_object_store(
        object_store: Arc<dyn ObjectStore>,
        config: LedgerConfig,
        persist_root: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            object_store,
            config,
            pages: RwLock::new(HashMap::new()),
            factory: RwLock::new(None),
            persist_root,
        })
    }

    fn page_dag_dir(&self, page_id: PageId) -> Option<PathBuf> {
        self.persist_root.as_ref().map(|root| root.join("pages").join(page_id.hex()))
    }

    /// Creates a brand-new, empty page with a freshly-generated id.
    #[instrument(skip(self))]
    pub async fn create_page(&self) -> Result<Arc<Page>, StorageError> {
        let page_id = PageId::new_random();
        let page = match self.page_dag_dir(page_id) {
            Some(dag_dir) => {
                Page::create_persisted(page_id, self.object_store.clone(), self.config.page_storage.clone(), &dag_dir)
                    .await?
            }
            None => Page::create(page_id, self.object_store.clone(), self.config.page_storage.clone()).await?,
        };
        self.adopt(page_id, page)
    }

    /// Reopens a page this ledger previously persisted (spec §6): only
    /// valid for a file-backed ledger opened via [`Ledger::open`] whose
    /// `pages/<hex(page_id)>` directory already holds a seeded DAG.
    /// Returns the same handle on repeated calls for a page already open
    /// in this process, like [`Ledger::get_page`] would.
    pub fn open_page(&self, page_id: PageId) -> Result<Arc<Page>, StorageError> {
        if let Some(page) = self.get_page(page_id) {
            return Ok(page);
        }
        let dag_dir = self.page_dag_dir(page_id).ok_or_else(|| {
            StorageError::IllegalState("open_page requires a file-backed ledger".to_string())
        })?;
        let page = Page::open_persisted(page_id, self.object_store.clone(), self.config.page_storage.clone(), &dag_dir)?;
        self.adopt(page_id, page)
    }

    fn adopt(&self, page_id: PageId, page: Arc<Page>) -> Result<Arc<Page>, StorageError> {
        page.set_conflict_resolver_factory(
            self.factory.read().expect("ledger factory lock poisoned").clone(),
        );
        self.pages
            .write()
            .expect("ledger pages lock poisoned")
            .insert(page_id, page.clone());
        Ok(page)
    }

    pub fn get_page(&self, page_id: PageId) -> Option<Arc<Page>> {
        self.pages
            .read()
            .expect("ledger pages lock poisoned")
            .get(&page_id)
            .cloned()
    }

    /// Replaces the ledger-wide conflict-resolver factory and signals
    /// every currently-open page to disconnect its existing custom
    /// resolver and re-query policy from the new factory (spec §4.7).
    pub fn set_conflict_resolver_factory(&self, factory: Option<Arc<dyn ConflictResolverFactory>>) {
        *self.factory.write().expect("ledger factory lock poisoned") = factory.clone();
        for page in self.pages.read().expect("ledger pages lock poisoned").values() {
            page.set_conflict_resolver_factory(factory.clone());
        }
    }
}
