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

//! Lazy, restartable traversal of a commit's tree, spec §4.3. Streams are
//! pull-based: the consumer's [`TreeEntryVisitor::on_entry`] returns
//! whether to continue. If the tree object isn't resolved locally (a
//! lazily-synced page), the walk fails with `StorageError::NetworkNeeded`
//! rather than `NotFound`, since the object is known to exist, just not
//! fetched yet.

use std::sync::Arc;

use crate::commit::Commit;
use crate::error::StorageError;
use crate::object_store::ObjectStore;
use crate::tree::Entry;
use crate::tree::Tree;

pub trait TreeEntryVisitor {
    /// Called once per matching entry, in key order. Returning `false`
    /// stops the walk early.
    fn on_entry(&mut self, entry: &Entry) -> bool;
}

/// Adapts any `FnMut(&Entry) -> bool` closure into a [`TreeEntryVisitor`].
impl<F: FnMut(&Entry) -> bool> TreeEntryVisitor for F {
    fn on_entry(&mut self, entry: &Entry) -> bool {
        self(entry)
    }
}

pub struct TreeReader {
    object_store: Arc<dyn ObjectStore>,
}

impl TreeReader {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self { object_store }
    }

    async fn load_tree(&self, commit: &Commit) -> Result<Tree, StorageError> {
        let bytes = self.object_store.get(&commit.root_tree_id).await.map_err(
            |err| match err {
                StorageError::NotFound(_) => StorageError::NetworkNeeded,
                other => other,
            },
        )?;
        Tree::deserialize(&bytes)
    }

    /// Streams entries under `key_prefix`, in key order, to `visitor`,
    /// stopping as soon as `visitor` returns `false` or entries run out.
    pub async fn contents(
        &self,
        commit: &Commit,
        key_prefix: &[u8],
        mut visitor: impl TreeEntryVisitor,
    ) -> Result<(), StorageError> {
        let tree = self.load_tree(commit).await?;
        for entry in tree.iter_from(key_prefix, None) {
            if !visitor.on_entry(&entry) {
                break;
            }
        }
        Ok(())
    }

    /// Point lookup with the same resolution semantics as `contents`.
    pub async fn get_entry(&self, commit: &Commit, key: &[u8]) -> Result<Entry, StorageError> {
        let tree = self.load_tree(commit).await?;
        tree.get(key)
            .ok_or_else(|| StorageError::NotFound(commit.root_tree_id))
    }
}
