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

//! Mutable staging area for a transaction, spec §4.4. A journal is bound
//! to exactly one base commit; later writes to the same key override
//! earlier ones within the journal, and `commit` folds the journal onto
//! the base tree to produce one new immutable commit.
//!
//! Open question resolved here (see DESIGN.md): an explicit `commit()` of
//! an unchanged journal still produces a new commit, distinct from its
//! base by timestamp alone, preserving the causal edge the caller asked
//! for rather than silently coalescing it away.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::instrument;

use crate::commit::Commit;
use crate::commit::ParentIds;
use crate::dag::CommitGraph;
use crate::error::StorageError;
use crate::ids::JournalId;
use crate::ids::ObjectId;
use crate::ids::Timestamp;
use crate::object_store::ObjectStore;
use crate::tree::make_key;
use crate::tree::EntryKey;
use crate::tree::Priority;
use crate::tree::Tree;
use crate::tree_reader::TreeReader;
use crate::watcher::ChangeSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    Put(ObjectId, Priority),
    Delete,
}

#[derive(Debug, PartialEq, Eq)]
enum JournalState {
    Open,
    Committed,
    Discarded,
}

/// A single client's staged, uncommitted writes against one base commit.
/// Concurrent mutation of one journal from two sources is undefined by
/// spec §5 and is rejected here by requiring `&mut self` on every
/// mutating call, which the owning client handle naturally enforces.
pub struct Journal {
    journal_id: JournalId,
    base_commit: Commit,
    ops: IndexMap<EntryKey, JournalOp>,
    state: JournalState,
}

impl Journal {
    pub fn start(base_commit: Commit) -> Self {
        Self {
            journal_id: JournalId::new_random(),
            base_commit,
            ops: IndexMap::new(),
            state: JournalState::Open,
        }
    }

    pub fn id(&self) -> JournalId {
        self.journal_id
    }

    pub fn base_commit_id(&self) -> crate::ids::CommitId {
        self.base_commit.commit_id
    }

    fn require_open(&self) -> Result<(), StorageError> {
        if self.state != JournalState::Open {
            return Err(StorageError::InvalidArgument(
                "journal is no longer open".to_string(),
            ));
        }
        Ok(())
    }

    pub fn put(
        &mut self,
        key: impl AsRef<[u8]>,
        object_id: ObjectId,
        priority: Priority,
    ) -> Result<(), StorageError> {
        self.require_open()?;
        let key = make_key(key)?;
        self.ops.insert(key, JournalOp::Put(object_id, priority));
        Ok(())
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> Result<(), StorageError> {
        self.require_open()?;
        let key = make_key(key)?;
        self.ops.insert(key, JournalOp::Delete);
        Ok(())
    }

    pub fn rollback(mut self) {
        self.state = JournalState::Discarded;
    }

    /// Applies the journal on top of its base tree, writes the resulting
    /// tree and a new commit (single parent: the base) to the object
    /// store and DAG, and returns the new commit. The object store write
    /// and the DAG insertion are the two suspension points per spec §5.
    #[instrument(skip(self, object_store, commit_graph))]
    pub async fn commit(
        mut self,
        object_store: &Arc<dyn ObjectStore>,
        commit_graph: &CommitGraph,
    ) -> Result<Commit, StorageError> {
        self.require_open()?;

        let reader = TreeReader::new(object_store.clone());
        let mut tree = self.materialize_base_tree(&reader).await?;
        for (key, op) in &self.ops {
            match op {
                JournalOp::Put(object_id, priority) => tree.insert(key.clone(), *object_id, *priority),
                JournalOp::Delete => tree.remove(key),
            }
        }

        let tree_id = object_store.put(tree.serialize()).await?;
        let mut parent_ids = ParentIds::new();
        parent_ids.push(self.base_commit.commit_id);
        let new_commit = Commit::with_parent_generations(
            parent_ids,
            &[self.base_commit.generation],
            tree_id,
            Timestamp::now(),
        );
        commit_graph.add_commit(new_commit.clone(), ChangeSource::Local)?;
        self.state = JournalState::Committed;
        Ok(new_commit)
    }

    async fn materialize_base_tree(&self, reader: &TreeReader) -> Result<Tree, StorageError> {
        let mut tree = Tree::empty();
        reader
            .contents(&self.base_commit, b"", |entry: &crate::tree::Entry| {
                tree.insert(entry.key.clone(), entry.object_id, entry.priority);
                true
            })
            .await?;
        Ok(tree)
    }
}
