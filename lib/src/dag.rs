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

//! A page's commit DAG: immutable commits referencing a root tree and zero,
//! one, or two parents, plus the current head set, spec §4.2. Head-set
//! mutation and watcher delivery are sequenced so every watcher observes
//! each new commit exactly once, in insertion order (spec §4.2 invariant).

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use indexmap::IndexSet;
use tracing::instrument;

use crate::commit::head_order_key;
use crate::commit::Commit;
use crate::commit::ParentIds;
use crate::error::DagInconsistency;
use crate::error::StorageError;
use crate::file_util::remove_marker_if_exists;
use crate::file_util::IoResultExt as _;
use crate::ids::CommitId;
use crate::watcher::ChangeSource;
use crate::watcher::WatcherFanout;
use crate::watcher::WatcherHandle;

/// In-memory index over a single page's commits and current heads. The
/// object store backing tree/commit bytes is a separate collaborator
/// (spec §4.1); this type owns only the DAG structure described in §4.2.
///
/// Optionally backed by a directory of `commits/<hex>` and `heads/<hex>`
/// files (spec §6's persisted layout): when armed via
/// [`CommitGraph::open_persisted`], every later `seed_root`/`add_commit`
/// also durably records the new commit and transitions the head markers,
/// so a page's history survives a process restart. A graph built with
/// [`CommitGraph::new`] stays purely in-memory, which is what every
/// in-process test and the default `Ledger::in_memory` use.
pub struct CommitGraph {
    commits: Mutex<HashMap<CommitId, Commit>>,
    heads: Mutex<IndexSet<CommitId>>,
    fanout: Arc<WatcherFanout>,
    persist_dir: Option<PathBuf>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self {
            commits: Mutex::new(HashMap::new()),
            heads: Mutex::new(IndexSet::new()),
            fanout: WatcherFanout::new(),
            persist_dir: None,
        }
    }

    /// Opens (or creates) a persisted commit DAG rooted at `dir`, whose
    /// layout is `dir/commits/<hex(commit_id)>` (one serialized commit
    /// per file) and `dir/heads/<hex(commit_id)>` (zero-byte head
    /// markers), matching spec §6. Reconstructs the in-memory index from
    /// whatever is already on disk; an empty, freshly-created directory
    /// comes back with no commits and no heads, ready for the caller to
    /// [`CommitGraph::seed_root`]. Every commit/head transition from then
    /// on is also written through to `dir`.
    ///
    /// The head set is recomputed from the loaded commits' parent chains
    /// (any commit nobody lists as a parent is a head) rather than taken
    /// from `heads/` directly: that set is exactly what `add_commit`
    /// already maintains in memory, so deriving it the same way on reload
    /// means a head marker left behind or removed late by a crash mid
    /// head-transition can never produce a wrong answer. The marker files
    /// still exist and are still written/removed per spec §6's protocol,
    /// for anything that inspects `heads/` without loading every commit.
    pub fn open_persisted(dir: &Path) -> Result<Arc<Self>, StorageError> {
        let commits_dir = dir.join("commits");
        let heads_dir = dir.join("heads");
        // `dir` itself (e.g. a ledger's `pages/<page_id>/`) may be several
        // path components deep and not yet exist at all, unlike the
        // object store's single-level directory, so this needs the
        // recursive form rather than `create_or_reuse_dir`.
        fs::create_dir_all(&commits_dir).context(&commits_dir)?;
        fs::create_dir_all(&heads_dir).context(&heads_dir)?;

        let mut commits = HashMap::new();
        for entry in fs::read_dir(&commits_dir).context(&commits_dir)? {
            let entry = entry.context(&commits_dir)?;
            let bytes = fs::read(entry.path()).context(entry.path())?;
            let commit = Commit::from_disk_bytes(&bytes)?;
            commits.insert(commit.commit_id, commit);
        }

        let parented: std::collections::HashSet<CommitId> = commits
            .values()
            .flat_map(|commit| commit.parent_ids.iter().copied())
            .collect();
        let mut heads = IndexSet::new();
        for commit_id in commits.keys() {
            if !parented.contains(commit_id) {
                heads.insert(*commit_id);
            }
        }

        Ok(Arc::new(Self {
            commits: Mutex::new(commits),
            heads: Mutex::new(heads),
            fanout: WatcherFanout::new(),
            persist_dir: Some(dir.to_path_buf()),
        }))
    }

    /// Seeds the DAG with a page's root commit (spec §3 invariant 2: the
    /// head set is never empty once a page is created).
    pub fn seed_root(&self, root: Commit) {
        assert!(root.is_root(), "seed commit must have no parents");
        let commit_id = root.commit_id;
        if let Some(dir) = &self.persist_dir {
            persist_commit(dir, &root);
            persist_head_marker(dir, commit_id);
        }
        self.commits
            .lock()
            .expect("commit graph mutex poisoned")
            .insert(commit_id, root);
        self.heads
            .lock()
            .expect("commit graph mutex poisoned")
            .insert(commit_id);
    }

    /// Validates `commit`'s parents exist, inserts it, removes any parent
    /// from the head set, and adds the commit itself as a new head.
    /// Deduplicates on `commit_id` (invariant 4): adding an
    /// already-present commit is a no-op that still notifies watchers of
    /// nothing, since nothing new was added.
    #[instrument(skip(self, commit), fields(commit_id = %commit.commit_id))]
    pub fn add_commit(
        &self,
        commit: Commit,
        source: ChangeSource,
    ) -> Result<(), StorageError> {
        {
            let commits = self.commits.lock().expect("commit graph mutex poisoned");
            if commits.contains_key(&commit.commit_id) {
                return Ok(());
            }
            for parent in &commit.parent_ids {
                if !commits.contains_key(parent) {
                    let inconsistency = DagInconsistency {
                        commit: commit.commit_id,
                        parent: *parent,
                    };
                    return Err(StorageError::IllegalState(inconsistency.to_string()));
                }
            }
        }

        let commit_id = commit.commit_id;
        if let Some(dir) = &self.persist_dir {
            // Durable transition order matches spec §6: write the new
            // commit, create its head marker and fsync it, only then
            // remove the parents' now-stale markers. A crash partway
            // through leaves at most an extra, harmless head marker
            // behind (recomputed correctly by `open_persisted` regardless),
            // never a dangling reference to a commit that was never
            // written.
            persist_commit(dir, &commit);
            persist_head_marker(dir, commit_id);
            for parent in &commit.parent_ids {
                remove_head_marker(dir, parent);
            }
        }
        {
            let mut commits = self.commits.lock().expect("commit graph mutex poisoned");
            let mut heads = self.heads.lock().expect("commit graph mutex poisoned");
            commits.insert(commit_id, commit.clone());
            for parent in &commit.parent_ids {
                heads.shift_remove(parent);
            }
            heads.insert(commit_id);
        }

        // Watcher delivery happens while still holding no locks, but after
        // the head-set mutation above has fully landed, so every observer
        // that reads `get_heads()` after being notified sees this commit
        // reflected.
        self.fanout.notify(std::slice::from_ref(&commit), source);
        Ok(())
    }

    pub fn get_commit(&self, commit_id: &CommitId) -> Result<Commit, StorageError> {
        self.commits
            .lock()
            .expect("commit graph mutex poisoned")
            .get(commit_id)
            .cloned()
            .ok_or_else(|| {
                StorageError::IllegalState(format!("commit {commit_id} not found in DAG"))
            })
    }

    pub fn parent_generation(&self, commit_id: &CommitId) -> Result<u64, StorageError> {
        Ok(self.get_commit(commit_id)?.generation)
    }

    /// Current heads, ordered deterministically by `(generation desc,
    /// timestamp desc, id asc)` (spec §4.2).
    pub fn get_heads(&self) -> Vec<Commit> {
        let commits = self.commits.lock().expect("commit graph mutex poisoned");
        let heads = self.heads.lock().expect("commit graph mutex poisoned");
        let mut result: Vec<Commit> = heads
            .iter()
            .map(|id| commits.get(id).cloned().expect("head must be indexed"))
            .collect();
        result.sort_by_key(head_order_key);
        result
    }

    pub fn head_ids(&self) -> IndexSet<CommitId> {
        self.heads.lock().expect("commit graph mutex poisoned").clone()
    }

    pub fn subscribe(&self) -> WatcherHandle {
        self.fanout.subscribe()
    }

    /// Walks the parent chain from `from` back toward the root,
    /// inclusive of `from`, used by the LCA search in the merge resolver.
    pub fn ancestors(&self, from: &CommitId) -> Result<Vec<Commit>, StorageError> {
        let mut result = Vec::new();
        let mut frontier = vec![*from];
        let mut visited = std::collections::HashSet::new();
        while let Some(id) = frontier.pop() {
            if !visited.insert(id) {
                continue;
            }
            let commit = self.get_commit(&id)?;
            frontier.extend(commit.parent_ids.iter().copied());
            result.push(commit);
        }
        Ok(result)
    }
}

impl Default for CommitGraph {
    fn default() -> Self {
        Self::new()
    }
}

pub fn merge_parent_ids(left: CommitId, right: CommitId) -> ParentIds {
    let mut ids = ParentIds::new();
    ids.push(left);
    ids.push(right);
    ids
}

/// Writes `commit` at `dir/commits/<hex>` if not already present. Commit
/// files are content-addressed, so an existing file at the target path is
/// guaranteed byte-identical; a plain existence check is enough (no
/// atomic rename needed, unlike the head markers below).
fn persist_commit(dir: &Path, commit: &Commit) {
    let path = dir.join("commits").join(commit.commit_id.hex());
    if path.exists() {
        return;
    }
    if let Err(err) = fs::write(&path, commit.to_disk_bytes()) {
        tracing::warn!(commit_id = %commit.commit_id, error = %err, "failed to persist commit");
    }
}

fn persist_head_marker(dir: &Path, commit_id: CommitId) {
    let path = dir.join("heads").join(commit_id.hex());
    match fs::File::create(&path).and_then(|file| file.sync_all()) {
        Ok(()) => {}
        Err(err) => tracing::warn!(%commit_id, error = %err, "failed to persist head marker"),
    }
}

fn remove_head_marker(dir: &Path, commit_id: &CommitId) {
    let path = dir.join("heads").join(commit_id.hex());
    if let Err(err) = remove_marker_if_exists(&path) {
        tracing::warn!(%commit_id, error = %err, "failed to remove stale head marker");
    }
}
