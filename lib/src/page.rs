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

//! The external Page API, spec §6: a page's independent keyspace, the
//! commit DAG backing it, and the merge resolver that reacts to every
//! commit the page accepts. `Put`/`Delete` without an explicit
//! transaction are shorthand for `start -> op -> commit` (spec §4.8);
//! `StartTransaction`/`Commit`/`Rollback` hold one journal at a time,
//! owned by this handle, matching the single-journal-per-client-handle
//! rule of spec §5.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::instrument;

use crate::commit::Commit;
use crate::commit::ParentIds;
use crate::config::PageStorageConfig;
use crate::dag::CommitGraph;
use crate::error::status_for_dag_operation;
use crate::error::status_for_key_lookup;
use crate::error::status_for_object_fetch;
use crate::error::Status;
use crate::error::StorageError;
use crate::ids::ObjectId;
use crate::ids::PageId;
use crate::ids::Timestamp;
use crate::journal::Journal;
use crate::merge::ConflictResolverFactory;
use crate::merge::MergeResolver;
use crate::merge::MergeResolverDelegate;
use crate::object_store::ObjectStore;
use crate::snapshot::PageSnapshot;
use crate::snapshot::PageWatcher;
use crate::tree::Priority;
use crate::tree::Tree;

/// Logs when a page's heads converge back to one, via the resolver's
/// narrow delegate hook rather than a strong back-reference to `Page`.
struct LogOnConverge(PageId);

impl MergeResolverDelegate for LogOnConverge {
    fn on_empty(&self) {
        tracing::debug!(page_id = %self.0, "page heads converged, no merge pending");
    }
}

/// A page's keyspace, commit DAG, and merge resolver, addressable by one
/// 16-byte id (spec §3). Cheap to clone (it's an `Arc`): every client
/// handle to the same page shares the same DAG and resolver, but owns
/// its own at-most-one-open `Journal` slot.
pub struct Page {
    page_id: PageId,
    dag: Arc<CommitGraph>,
    object_store: Arc<dyn ObjectStore>,
    resolver: Arc<MergeResolver>,
    config: PageStorageConfig,
    journal: Mutex<Option<Journal>>,
}

impl Page {
    /// Creates a brand-new, empty page: writes the empty-tree object,
    /// seeds the DAG with the root commit, and wires up a merge resolver
    /// (spec §3 invariant 2: the empty page's head is the root commit).
    pub async fn create(
        page_id: PageId,
        object_store: Arc<dyn ObjectStore>,
        config: PageStorageConfig,
    ) -> Result<Arc<Self>, StorageError> {
        let tree_id = object_store.put(Tree::empty().serialize()).await?;
        let root = Commit::with_parent_generations(ParentIds::new(), &[], tree_id, Timestamp::now());
        let dag = Arc::new(CommitGraph::new());
        dag.seed_root(root);
        Ok(Self::from_parts(page_id, dag, object_store, config))
    }

    /// Like [`Page::create`], but seeds a commit DAG persisted under
    /// `dag_dir` (spec §6) instead of an in-memory-only one, so the page's
    /// history survives past this process via [`Page::open_persisted`].
    pub async fn create_persisted(
        page_id: PageId,
        object_store: Arc<dyn ObjectStore>,
        config: PageStorageConfig,
        dag_dir: &std::path::Path,
    ) -> Result<Arc<Self>, StorageError> {
        let tree_id = object_store.put(Tree::empty().serialize()).await?;
        let root = Commit::with_parent_generations(ParentIds::new(), &[], tree_id, Timestamp::now());
        let dag = CommitGraph::open_persisted(dag_dir)?;
        dag.seed_root(root);
        Ok(Self::from_parts(page_id, dag, object_store, config))
    }

    /// Reopens a page whose commit DAG was previously persisted under
    /// `dag_dir` by [`Page::create_persisted`], reconstructing its head
    /// set from disk rather than seeding a fresh root.
    pub fn open_persisted(
        page_id: PageId,
        object_store: Arc<dyn ObjectStore>,
        config: PageStorageConfig,
        dag_dir: &std::path::Path,
    ) -> Result<Arc<Self>, StorageError> {
        let dag = CommitGraph::open_persisted(dag_dir)?;
        Ok(Self::from_parts(page_id, dag, object_store, config))
    }

    fn from_parts(
        page_id: PageId,
        dag: Arc<CommitGraph>,
        object_store: Arc<dyn ObjectStore>,
        config: PageStorageConfig,
    ) -> Arc<Self> {
        let resolver = MergeResolver::with_backoff(
            page_id,
            dag.clone(),
            object_store.clone(),
            config.merge_backoff,
        );
        resolver.set_delegate(Arc::new(LogOnConverge(page_id)));
        Arc::new(Self {
            page_id,
            dag,
            object_store,
            resolver,
            config,
            journal: Mutex::new(None),
        })
    }

    pub fn id(&self) -> PageId {
        self.page_id
    }

    fn current_head(&self) -> Commit {
        self.dag
            .get_heads()
            .into_iter()
            .next()
            .expect("a page's head set is never empty")
    }

    /// The page's current head set, ordered deterministically (spec
    /// §4.2). More than one entry means a merge is pending or in
    /// progress.
    pub fn heads(&self) -> Vec<Commit> {
        self.dag.get_heads()
    }

    /// The ancestry of the page's primary head (the first of
    /// [`Page::heads`]), ordered newest-first. A thin introspection aid
    /// for manual inspection; not part of the wire API.
    pub fn log(&self) -> Result<Vec<Commit>, StorageError> {
        let mut commits = self.dag.ancestors(&self.current_head().commit_id)?;
        commits.sort_by_key(|commit| std::cmp::Reverse((commit.generation, commit.timestamp.0)));
        Ok(commits)
    }

    /// A second, independent client handle onto the same page: shares the
    /// commit DAG, object store, and merge resolver, but owns its own
    /// at-most-one-open `Journal` slot (spec §5: each client handle has
    /// its own journal). Two handles committing against the same base
    /// concurrently is exactly how a page's head set forks to more than
    /// one entry.
    pub fn new_handle(&self) -> Arc<Self> {
        Arc::new(Self {
            page_id: self.page_id,
            dag: self.dag.clone(),
            object_store: self.object_store.clone(),
            resolver: self.resolver.clone(),
            config: self.config.clone(),
            journal: Mutex::new(None),
        })
    }

    /// Sets (or clears) this page's conflict-resolver factory. Normally
    /// called by the owning `Ledger` fanning out a ledger-wide change
    /// (spec §4.7), not directly by page clients.
    pub fn set_conflict_resolver_factory(&self, factory: Option<Arc<dyn ConflictResolverFactory>>) {
        self.resolver.set_conflict_resolver_factory(factory);
    }

    /// The resolver's currently-cached merge policy, querying the
    /// factory if not yet cached. Crate-internal introspection hook for
    /// `Ledger`'s factory fan-out tests; not part of the wire API.
    pub(crate) fn merge_policy(&self) -> crate::merge::MergePolicy {
        self.resolver.policy()
    }

    pub async fn put(&self, key: impl AsRef<[u8]>, value: Vec<u8>) -> Status {
        self.put_with_priority(key, value, Priority::Eager).await
    }

    pub async fn put_with_priority(
        &self,
        key: impl AsRef<[u8]>,
        value: Vec<u8>,
        priority: Priority,
    ) -> Status {
        let object_id = match self.object_store.put(value).await {
            Ok(object_id) => object_id,
            Err(err) => return status_for_object_fetch(&err),
        };
        self.put_reference(key, object_id, priority).await
    }

    pub async fn put_reference(
        &self,
        key: impl AsRef<[u8]>,
        object_id: ObjectId,
        priority: Priority,
    ) -> Status {
        self.autocommit(|journal| journal.put(key, object_id, priority)).await
    }

    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Status {
        self.autocommit(|journal| journal.delete(key)).await
    }

    /// `start -> op -> commit` against the page's current head, sharing
    /// the explicit-transaction commit path's watcher-visibility rules
    /// (spec §4.8).
    #[instrument(skip(self, op))]
    async fn autocommit(&self, op: impl FnOnce(&mut Journal) -> Result<(), StorageError>) -> Status {
        let mut journal = Journal::start(self.current_head());
        if let Err(err) = op(&mut journal) {
            return status_for_key_lookup(&err);
        }
        self.land(journal).await
    }

    async fn land(&self, journal: Journal) -> Status {
        match journal.commit(&self.object_store, &self.dag).await {
            Ok(_) => {
                self.resolver.check_for_merge();
                Status::Ok
            }
            Err(err) => status_for_dag_operation(&err),
        }
    }

    /// Opens this handle's one transaction slot. `INVALID_ARGUMENT` if a
    /// transaction is already open on this handle (spec §5: concurrent
    /// mutation of one journal from two sources is rejected, so we never
    /// allow a second to start).
    pub fn start_transaction(&self) -> Status {
        let mut slot = self.journal.lock().expect("page journal mutex poisoned");
        if slot.is_some() {
            return Status::InvalidArgument;
        }
        *slot = Some(Journal::start(self.current_head()));
        Status::Ok
    }

    pub fn put_in_transaction(
        &self,
        key: impl AsRef<[u8]>,
        object_id: ObjectId,
        priority: Priority,
    ) -> Status {
        self.with_open_journal(|journal| journal.put(key, object_id, priority))
    }

    pub fn delete_in_transaction(&self, key: impl AsRef<[u8]>) -> Status {
        self.with_open_journal(|journal| journal.delete(key))
    }

    fn with_open_journal(&self, op: impl FnOnce(&mut Journal) -> Result<(), StorageError>) -> Status {
        let mut slot = self.journal.lock().expect("page journal mutex poisoned");
        match slot.as_mut() {
            Some(journal) => match op(journal) {
                Ok(()) => Status::Ok,
                Err(err) => status_for_key_lookup(&err),
            },
            None => Status::InvalidArgument,
        }
    }

    pub async fn commit_transaction(&self) -> Status {
        let journal = match self.journal.lock().expect("page journal mutex poisoned").take() {
            Some(journal) => journal,
            None => return Status::InvalidArgument,
        };
        self.land(journal).await
    }

    pub fn rollback_transaction(&self) -> Status {
        match self.journal.lock().expect("page journal mutex poisoned").take() {
            Some(journal) => {
                journal.rollback();
                Status::Ok
            }
            None => Status::InvalidArgument,
        }
    }

    /// Captures the page's current head (or its unique head, once a
    /// merge has reduced the set) as a read-only snapshot.
    pub async fn get_snapshot(&self) -> Result<PageSnapshot, StorageError> {
        let head = self.current_head();
        PageSnapshot::capture(head, self.object_store.clone(), self.config.max_inline_response_bytes).await
    }

    /// Captures a snapshot and a watcher whose baseline is that same
    /// snapshot (spec §4.8: "its initial baseline is this snapshot and
    /// all subsequent commits are delivered relative to it").
    pub async fn get_snapshot_with_watcher(&self) -> Result<(PageSnapshot, PageWatcher), StorageError> {
        let head = self.current_head();
        let snapshot = PageSnapshot::capture(
            head.clone(),
            self.object_store.clone(),
            self.config.max_inline_response_bytes,
        )
        .await?;
        let handle = self.dag.subscribe();
        let watcher = PageWatcher::new(
            handle,
            head,
            snapshot.tree().clone(),
            self.object_store.clone(),
            self.config.max_inline_response_bytes,
        );
        Ok((snapshot, watcher))
    }
}
