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

//! Read-only view over one captured commit (spec §4.8), and the
//! page-level watcher built on top of it. A [`PageSnapshot`] never
//! changes once captured; a [`PageWatcher`] advances its own baseline
//! tree on every delivered batch and reports the diff against the
//! previous baseline.

use std::sync::Arc;

use crate::commit::Commit;
use crate::error::status_for_key_lookup;
use crate::error::status_for_object_fetch;
use crate::error::status_for_reference;
use crate::error::Status;
use crate::error::StorageError;
use crate::merge::diff::diff;
use crate::merge::Change;
use crate::object_store::ObjectStore;
use crate::tree::make_key;
use crate::tree::Entry;
use crate::tree::EntryKey;
use crate::tree::Priority;
use crate::tree::Tree;
use crate::tree_reader::TreeReader;
use crate::watcher::ChangeSource;
use crate::watcher::WatcherHandle;

/// A `GetEntries` result row: a key's priority and its resolved value
/// bytes, as opposed to [`Entry`] which only carries the object id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEntry {
    pub key: EntryKey,
    pub priority: Priority,
    pub value: Vec<u8>,
}

/// A read-only view bound to exactly one commit. `get`/`get_partial`
/// resolve a key's current value; `get_keys`/`get_entries` page through
/// the tree in key order, truncating and returning a continuation token
/// once a response would exceed `max_inline_response_bytes`.
pub struct PageSnapshot {
    commit: Commit,
    tree: Tree,
    object_store: Arc<dyn ObjectStore>,
    max_inline_response_bytes: usize,
}

impl PageSnapshot {
    pub async fn capture(
        commit: Commit,
        object_store: Arc<dyn ObjectStore>,
        max_inline_response_bytes: usize,
    ) -> Result<Self, StorageError> {
        let reader = TreeReader::new(object_store.clone());
        let mut tree = Tree::empty();
        reader
            .contents(&commit, b"", |entry: &Entry| {
                tree.insert(entry.key.clone(), entry.object_id, entry.priority);
                true
            })
            .await?;
        Ok(Self::from_tree(commit, tree, object_store, max_inline_response_bytes))
    }

    pub(crate) fn from_tree(
        commit: Commit,
        tree: Tree,
        object_store: Arc<dyn ObjectStore>,
        max_inline_response_bytes: usize,
    ) -> Self {
        Self {
            commit,
            tree,
            object_store,
            max_inline_response_bytes,
        }
    }

    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    fn resolve_entry(&self, key: &[u8]) -> Result<Entry, StorageError> {
        let key = make_key(key)?;
        self.tree
            .get(&key)
            .ok_or(StorageError::NotFound(self.commit.root_tree_id))
    }

    pub async fn get(&self, key: impl AsRef<[u8]>) -> (Status, Option<Vec<u8>>) {
        let entry = match self.resolve_entry(key.as_ref()) {
            Ok(entry) => entry,
            Err(err) => return (status_for_key_lookup(&err), None),
        };
        match self.object_store.get(&entry.object_id).await {
            Ok(bytes) => (Status::Ok, Some(bytes)),
            Err(err) => (status_for_object_fetch(&err), None),
        }
    }

    pub async fn get_partial(
        &self,
        key: impl AsRef<[u8]>,
        offset: usize,
        max_size: usize,
    ) -> (Status, Option<Vec<u8>>) {
        let (status, bytes) = self.get(key).await;
        let Some(bytes) = bytes else {
            return (status, None);
        };
        if offset >= bytes.len() {
            return (Status::Ok, Some(Vec::new()));
        }
        let end = (offset + max_size).min(bytes.len());
        (Status::Ok, Some(bytes[offset..end].to_vec()))
    }

    /// Keys under `prefix` in key order, resuming at `token` (inclusive)
    /// if given. Truncates at `max_inline_response_bytes` and returns
    /// `PARTIAL_RESULT` with a token equal to the first excluded key.
    pub fn get_keys(
        &self,
        prefix: impl AsRef<[u8]>,
        token: Option<EntryKey>,
    ) -> (Status, Vec<EntryKey>, Option<EntryKey>) {
        let prefix = prefix.as_ref();
        let start_at = token.as_deref();
        let mut keys = Vec::new();
        let mut inline_bytes = 0usize;
        let mut next_token = None;
        for entry in self.tree.iter_from(prefix, start_at) {
            if !keys.is_empty() && inline_bytes + entry.key.len() > self.max_inline_response_bytes {
                next_token = Some(entry.key.clone());
                break;
            }
            inline_bytes += entry.key.len();
            keys.push(entry.key.clone());
        }
        let status = if next_token.is_some() {
            Status::PartialResult
        } else {
            Status::Ok
        };
        (status, keys, next_token)
    }

    /// Entries (key, priority, resolved value) under `prefix`, same
    /// pagination contract as `get_keys`. A dangling reference aborts the
    /// whole batch with `REFERENCE_NOT_FOUND` rather than skipping the
    /// key, so a caller never mistakes a partial batch for a paginated
    /// one (see DESIGN.md Open Question on `GetEntries` resolution
    /// failures).
    pub async fn get_entries(
        &self,
        prefix: impl AsRef<[u8]>,
        token: Option<EntryKey>,
    ) -> (Status, Vec<PageEntry>, Option<EntryKey>) {
        let prefix = prefix.as_ref();
        let start_at = token.as_deref();
        let mut entries = Vec::new();
        let mut inline_bytes = 0usize;
        let mut next_token = None;
        for entry in self.tree.iter_from(prefix, start_at) {
            if !entries.is_empty() && inline_bytes >= self.max_inline_response_bytes {
                next_token = Some(entry.key.clone());
                break;
            }
            match self.object_store.get(&entry.object_id).await {
                Ok(value) => {
                    inline_bytes += entry.key.len() + value.len();
                    entries.push(PageEntry {
                        key: entry.key.clone(),
                        priority: entry.priority,
                        value,
                    });
                }
                Err(err) => return (status_for_reference(&err), Vec::new(), None),
            }
        }
        let status = if next_token.is_some() {
            Status::PartialResult
        } else {
            Status::Ok
        };
        (status, entries, next_token)
    }
}

/// Delivery state for one `OnChange` call, spec §6: whether this batch
/// is the only (or final) chunk of a change, or one of a paginated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Completed,
    Started,
    Continued,
    CompletedPaginated,
}

/// One delivered, possibly-paginated chunk of key-level changes relative
/// to the watcher's previous baseline.
#[derive(Debug, Clone)]
pub struct PageChange {
    pub changes: Vec<Change>,
    pub source: ChangeSource,
}

/// Cap on how many changes a single `OnChange` delivery carries inline
/// before the watcher starts paginating, mirroring the snapshot read
/// APIs' inline-size budget but counted in entries rather than bytes
/// (a change carries no resolved value, so a byte budget would not mean
/// much here).
const MAX_CHANGES_PER_DELIVERY: usize = 256;

/// A page-level watcher: observes raw commit batches from the DAG and
/// reports them as key-level diffs against its own advancing baseline
/// tree (spec §4.8's `get_snapshot(page, watcher)` contract).
pub struct PageWatcher {
    handle: WatcherHandle,
    baseline_commit: Commit,
    baseline_tree: Tree,
    object_store: Arc<dyn ObjectStore>,
    max_inline_response_bytes: usize,
    /// Changes from the in-progress batch not yet delivered, and whether
    /// at least one chunk of it has already gone out (distinguishes
    /// `Started` from `Continued`).
    pending: std::collections::VecDeque<Change>,
    pending_source: Option<ChangeSource>,
    pagination_started: bool,
}

impl PageWatcher {
    pub(crate) fn new(
        handle: WatcherHandle,
        baseline_commit: Commit,
        baseline_tree: Tree,
        object_store: Arc<dyn ObjectStore>,
        max_inline_response_bytes: usize,
    ) -> Self {
        Self {
            handle,
            baseline_commit,
            baseline_tree,
            object_store,
            max_inline_response_bytes,
            pending: std::collections::VecDeque::new(),
            pending_source: None,
            pagination_started: false,
        }
    }

    /// Waits for the next chunk of changes. Returns `None` once the
    /// fan-out has detached this watcher (the page was closed, or this
    /// watcher overflowed its buffer).
    pub async fn on_change(&mut self) -> Option<(PageChange, ResultState, PageSnapshot)> {
        if self.pending.is_empty() {
            let batch = self.handle.receiver.recv().await?;
            let last_commit = batch.commits.last()?.clone();
            let new_tree = self.materialize(&last_commit).await.ok()?;
            let changes: Vec<Change> = diff(&self.baseline_tree, &new_tree).into_values().collect();
            self.baseline_commit = last_commit;
            self.baseline_tree = new_tree;
            self.pending.extend(changes);
            self.pending_source = Some(batch.source);
            self.pagination_started = false;
        }

        let source = self.pending_source.expect("pending_source set alongside pending");
        let take = self.pending.len().min(MAX_CHANGES_PER_DELIVERY);
        let changes: Vec<Change> = self.pending.drain(..take).collect();
        let more_to_come = !self.pending.is_empty();
        let result_state = match (self.pagination_started, more_to_come) {
            (false, false) => ResultState::Completed,
            (false, true) => ResultState::Started,
            (true, true) => ResultState::Continued,
            (true, false) => ResultState::CompletedPaginated,
        };
        self.pagination_started = more_to_come;
        if !more_to_come {
            self.pending_source = None;
        }

        let snapshot = PageSnapshot::from_tree(
            self.baseline_commit.clone(),
            self.baseline_tree.clone(),
            self.object_store.clone(),
            self.max_inline_response_bytes,
        );
        Some((PageChange { changes, source }, result_state, snapshot))
    }

    async fn materialize(&self, commit: &Commit) -> Result<Tree, StorageError> {
        let reader = TreeReader::new(self.object_store.clone());
        let mut tree = Tree::empty();
        reader
            .contents(commit, b"", |entry: &Entry| {
                tree.insert(entry.key.clone(), entry.object_id, entry.priority);
                true
            })
            .await?;
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::empty_tree_object_id;
    use crate::commit::ParentIds;
    use crate::dag::CommitGraph;
    use crate::ids::ObjectId;
    use crate::ids::Timestamp;
    use crate::object_store::MemObjectStore;
    use crate::tree::make_key;
    use crate::watcher::WatcherFanout;

    fn root_commit() -> Commit {
        Commit::with_parent_generations(ParentIds::new(), &[], empty_tree_object_id(), Timestamp(0))
    }

    async fn snapshot_with_entries(entries: &[(&str, &[u8])]) -> PageSnapshot {
        let store: Arc<dyn ObjectStore> = Arc::new(MemObjectStore::new());
        let mut tree = Tree::empty();
        for (key, value) in entries {
            let object_id = store.put(value.to_vec()).await.unwrap();
            tree.insert(make_key(key).unwrap(), object_id, Priority::Eager);
        }
        let tree_id = store.put(tree.serialize()).await.unwrap();
        let commit = Commit::with_parent_generations(ParentIds::new(), &[], tree_id, Timestamp(0));
        PageSnapshot::capture(commit, store, 4096).await.unwrap()
    }

    #[tokio::test]
    async fn get_resolves_a_present_key() {
        let snapshot = snapshot_with_entries(&[("name", b"alice")]).await;
        let (status, value) = snapshot.get("name").await;
        assert_eq!(status, Status::Ok);
        assert_eq!(value.unwrap(), b"alice");
    }

    #[tokio::test]
    async fn get_reports_key_not_found() {
        let snapshot = snapshot_with_entries(&[]).await;
        let (status, value) = snapshot.get("missing").await;
        assert_eq!(status, Status::KeyNotFound);
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn get_partial_slices_the_value() {
        let snapshot = snapshot_with_entries(&[("blob", b"0123456789")]).await;
        let (status, value) = snapshot.get_partial("blob", 3, 4).await;
        assert_eq!(status, Status::Ok);
        assert_eq!(value.unwrap(), b"3456");
    }

    #[tokio::test]
    async fn get_keys_paginates_once_the_budget_is_exceeded() {
        let snapshot = snapshot_with_entries(&[("a", b"1"), ("b", b"2"), ("c", b"3")]).await;
        // Force pagination with a budget that fits only the first key.
        let snapshot = PageSnapshot::from_tree(
            snapshot.commit.clone(),
            snapshot.tree.clone(),
            snapshot.object_store.clone(),
            1,
        );
        let (status, keys, token) = snapshot.get_keys(b"", None);
        assert_eq!(status, Status::PartialResult);
        assert_eq!(keys, vec![make_key("a").unwrap()]);
        let token = token.unwrap();
        assert_eq!(token, make_key("b").unwrap());

        let (status, keys, token) = snapshot.get_keys(b"", Some(token));
        assert_eq!(status, Status::PartialResult);
        assert_eq!(keys, vec![make_key("b").unwrap()]);
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn get_entries_short_circuits_on_a_dangling_reference() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemObjectStore::new());
        let mut tree = Tree::empty();
        tree.insert(
            make_key("dangling").unwrap(),
            ObjectId::from_content(b"never written"),
            Priority::Eager,
        );
        let tree_id = store.put(tree.serialize()).await.unwrap();
        let commit = Commit::with_parent_generations(ParentIds::new(), &[], tree_id, Timestamp(0));
        let snapshot = PageSnapshot::capture(commit, store, 4096).await.unwrap();

        let (status, entries, token) = snapshot.get_entries(b"", None).await;
        assert_eq!(status, Status::ReferenceNotFound);
        assert!(entries.is_empty());
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn watcher_reports_a_diff_against_its_baseline() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemObjectStore::new());
        store.put(Tree::empty().serialize()).await.unwrap();
        let dag = CommitGraph::new();
        let root = root_commit();
        dag.seed_root(root.clone());

        let baseline = PageSnapshot::capture(root.clone(), store.clone(), 4096).await.unwrap();
        let handle = dag.subscribe();
        let mut watcher = PageWatcher::new(
            handle,
            root.clone(),
            baseline.tree().clone(),
            store.clone(),
            4096,
        );

        let value_id = store.put(b"alice".to_vec()).await.unwrap();
        let mut journal = crate::journal::Journal::start(root.clone());
        journal.put("name", value_id, Priority::Eager).unwrap();
        journal.commit(&store, &dag).await.unwrap();

        let (change, result_state, _snapshot) = watcher.on_change().await.unwrap();
        assert_eq!(result_state, ResultState::Completed);
        assert_eq!(change.source, ChangeSource::Local);
        assert_eq!(change.changes.len(), 1);
    }

    #[tokio::test]
    async fn detached_watcher_returns_none() {
        let fanout = WatcherFanout::new();
        let handle = fanout.subscribe();
        drop(fanout);
        let store: Arc<dyn ObjectStore> = Arc::new(MemObjectStore::new());
        let mut watcher = PageWatcher::new(handle, root_commit(), Tree::empty(), store, 4096);
        assert!(watcher.on_change().await.is_none());
    }
}
