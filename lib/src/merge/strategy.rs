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

//! The three merge policies of spec §4.7, all driven by the same
//! `(left, right, common) -> Vec<MergedValue>` interface: [`LastOneWins`],
//! [`AutomaticWithFallback`], and [`Custom`]. All three report their
//! decision as a list of keys to override on top of `left` (the engine
//! then builds the actual journal, spec §4.6 MERGING state), so that a
//! strategy change at runtime can swap implementations without touching
//! the journal-building code.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::commit::Commit;
use crate::error::StorageError;
use crate::ids::ObjectId;
use crate::ids::PageId;
use crate::merge::diff::diff;
use crate::merge::diff::Change;
use crate::merge::diff::ChangeKind;
use crate::tree::EntryKey;
use crate::tree::Priority;
use crate::tree::Tree;
use crate::tree_reader::TreeReader;

/// Where the final value for a key in the merge commit comes from, spec
/// §4.7's `MergedValue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeSource {
    Left,
    Right,
    Delete,
    New(ObjectId, Priority),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedValue {
    pub key: EntryKey,
    pub source: MergeSource,
}

/// Read-only materialized view of the three commits a strategy reasons
/// about, plus the diffs relative to `common` that every strategy needs.
pub struct MergeInputs {
    pub left: Commit,
    pub right: Commit,
    pub common: Commit,
    pub left_tree: Tree,
    pub right_tree: Tree,
    pub common_tree: Tree,
}

impl MergeInputs {
    pub async fn load(
        tree_reader: &TreeReader,
        left: Commit,
        right: Commit,
        common: Commit,
    ) -> Result<Self, StorageError> {
        let left_tree = full_tree(tree_reader, &left).await?;
        let right_tree = full_tree(tree_reader, &right).await?;
        let common_tree = full_tree(tree_reader, &common).await?;
        Ok(Self {
            left,
            right,
            common,
            left_tree,
            right_tree,
            common_tree,
        })
    }

    pub fn left_changes(&self) -> BTreeMap<EntryKey, Change> {
        diff(&self.common_tree, &self.left_tree)
    }

    pub fn right_changes(&self) -> BTreeMap<EntryKey, Change> {
        diff(&self.common_tree, &self.right_tree)
    }
}

async fn full_tree(tree_reader: &TreeReader, commit: &Commit) -> Result<Tree, StorageError> {
    let mut tree = Tree::empty();
    tree_reader
        .contents(commit, b"", |entry: &crate::tree::Entry| {
            tree.insert(entry.key.clone(), entry.object_id, entry.priority);
            true
        })
        .await?;
    Ok(tree)
}

fn change_to_merged_value(key: EntryKey, change: &Change) -> MergedValue {
    match &change.kind {
        ChangeKind::Put(object_id, priority) => MergedValue {
            key,
            source: MergeSource::New(*object_id, *priority),
        },
        ChangeKind::Delete => MergedValue {
            key,
            source: MergeSource::Delete,
        },
    }
}

/// Capability set every merge policy implements (spec §4.7/§4.9): compute
/// the merge decision, and allow the in-flight attempt to be cancelled
/// (used when `SetMergeStrategy` swaps policies mid-merge).
#[async_trait]
pub trait MergeStrategy: Send + Sync {
    async fn merge(&self, inputs: &MergeInputs) -> Result<Vec<MergedValue>, StorageError>;

    fn cancel(&self) {}
}

/// For each key in `union(left_changes, right_changes)` relative to
/// `common`, takes the value from `left` (the more recent side);
/// deletes win over puts only when the delete itself is on `left` — which
/// falls out for free, since `left`'s own changes are never overridden.
pub struct LastOneWins;

#[async_trait]
impl MergeStrategy for LastOneWins {
    async fn merge(&self, inputs: &MergeInputs) -> Result<Vec<MergedValue>, StorageError> {
        let left_changes = inputs.left_changes();
        let right_changes = inputs.right_changes();
        let mut result = Vec::new();
        for (key, change) in &right_changes {
            if !left_changes.contains_key(key) {
                result.push(change_to_merged_value(key.clone(), change));
            }
        }
        Ok(result)
    }
}

/// Applies the union of both sides' changes automatically when no key was
/// changed by both sides to different values; otherwise delegates only
/// the conflicting subset to a custom resolver, applying every
/// non-conflicting change directly.
pub struct AutomaticWithFallback {
    pub resolver: Arc<dyn ConflictResolver>,
}

#[async_trait]
impl MergeStrategy for AutomaticWithFallback {
    async fn merge(&self, inputs: &MergeInputs) -> Result<Vec<MergedValue>, StorageError> {
        let left_changes = inputs.left_changes();
        let right_changes = inputs.right_changes();

        let mut conflicting_keys = Vec::new();
        for (key, right_change) in &right_changes {
            if let Some(left_change) = left_changes.get(key) {
                if left_change.kind != right_change.kind {
                    conflicting_keys.push(key.clone());
                }
            }
        }

        if conflicting_keys.is_empty() {
            let mut result = Vec::new();
            for (key, change) in &right_changes {
                if !left_changes.contains_key(key) {
                    result.push(change_to_merged_value(key.clone(), change));
                }
            }
            return Ok(result);
        }

        let left_conflict_changes: Vec<Change> = conflicting_keys
            .iter()
            .map(|k| left_changes[k].clone())
            .collect();
        let right_conflict_changes: Vec<Change> = conflicting_keys
            .iter()
            .map(|k| right_changes[k].clone())
            .collect();

        let resolved = self
            .resolver
            .resolve(
                &inputs.left,
                &left_conflict_changes,
                &inputs.right,
                &right_conflict_changes,
                &inputs.common,
            )
            .await?;
        reject_duplicate_keys(&resolved)?;

        let mut result = resolved;
        let conflicting: std::collections::HashSet<_> = conflicting_keys.into_iter().collect();
        for (key, change) in &right_changes {
            if !left_changes.contains_key(key) && !conflicting.contains(key) {
                result.push(change_to_merged_value(key.clone(), change));
            }
        }
        Ok(result)
    }

    fn cancel(&self) {
        self.resolver.cancel();
    }
}

/// Always delegates to the custom resolver, passing the full change lists
/// relative to `common` on both sides.
pub struct Custom {
    pub resolver: Arc<dyn ConflictResolver>,
}

#[async_trait]
impl MergeStrategy for Custom {
    async fn merge(&self, inputs: &MergeInputs) -> Result<Vec<MergedValue>, StorageError> {
        let left_changes: Vec<Change> = inputs.left_changes().into_values().collect();
        let right_changes: Vec<Change> = inputs.right_changes().into_values().collect();
        let resolved = self
            .resolver
            .resolve(
                &inputs.left,
                &left_changes,
                &inputs.right,
                &right_changes,
                &inputs.common,
            )
            .await?;
        reject_duplicate_keys(&resolved)?;
        Ok(resolved)
    }

    fn cancel(&self) {
        self.resolver.cancel();
    }
}

fn reject_duplicate_keys(values: &[MergedValue]) -> Result<(), StorageError> {
    let mut seen = std::collections::HashSet::new();
    for value in values {
        if !seen.insert(&value.key) {
            return Err(StorageError::InvalidArgument(format!(
                "conflict resolver returned duplicate key {:?}",
                value.key
            )));
        }
    }
    Ok(())
}

/// Policy selecting which [`MergeStrategy`] a page uses, spec §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    LastOneWins,
    AutomaticWithFallback,
    Custom,
}

/// External collaborator supplying merge policy and custom resolvers per
/// page, spec §4.7. `get_policy` is cached by the resolver until the
/// factory itself is replaced (scenario S2); `new_conflict_resolver` is
/// called fresh every time a resolver is needed (initial merge, or retry
/// after disconnection).
pub trait ConflictResolverFactory: Send + Sync {
    fn get_policy(&self, page_id: PageId) -> MergePolicy;
    fn new_conflict_resolver(&self, page_id: PageId) -> Arc<dyn ConflictResolver>;
}

/// External custom-resolver channel, spec §4.7/§6 `ConflictResolver` API.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(
        &self,
        left: &Commit,
        left_changes: &[Change],
        right: &Commit,
        right_changes: &[Change],
        common: &Commit,
    ) -> Result<Vec<MergedValue>, StorageError>;

    /// Signals the resolver that its result is no longer wanted (the
    /// resolver itself remains reachable for a future retry per spec
    /// §4.6).
    fn cancel(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::ParentIds;
    use crate::ids::Timestamp;
    use crate::object_store::MemObjectStore;
    use crate::tree::make_key;

    async fn commit_with_tree(store: &MemObjectStore, entries: &[(&str, u8)]) -> Commit {
        let mut tree = Tree::empty();
        for (key, seed) in entries {
            tree.insert(make_key(key).unwrap(), ObjectId::from_content(&[*seed]), Priority::Eager);
        }
        let tree_id = store.put(tree.serialize()).await.unwrap();
        Commit::with_parent_generations(ParentIds::new(), &[], tree_id, Timestamp(0))
    }

    #[tokio::test]
    async fn last_one_wins_prefers_left_but_takes_right_only_changes() {
        let store = MemObjectStore::new();
        let common = commit_with_tree(&store, &[("name", 1), ("city", 2)]).await;
        let left = commit_with_tree(&store, &[("name", 10), ("city", 2)]).await; // name changed
        let right = commit_with_tree(&store, &[("name", 1), ("city", 2), ("phone", 3)]).await; // phone added
        let reader = TreeReader::new(std::sync::Arc::new(store));
        let inputs = MergeInputs::load(&reader, left, right, common).await.unwrap();

        let result = LastOneWins.merge(&inputs).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].key, make_key("phone").unwrap());
    }

    #[tokio::test]
    async fn automatic_with_fallback_applies_union_when_no_conflicts() {
        let store = MemObjectStore::new();
        let common = commit_with_tree(&store, &[]).await;
        let left = commit_with_tree(&store, &[("name", 1), ("city", 2)]).await;
        let right = commit_with_tree(&store, &[("email", 3), ("phone", 4)]).await;
        let reader = TreeReader::new(std::sync::Arc::new(store));
        let inputs = MergeInputs::load(&reader, left, right, common).await.unwrap();

        struct NeverCalled;
        #[async_trait]
        impl ConflictResolver for NeverCalled {
            async fn resolve(
                &self,
                _left: &Commit,
                _left_changes: &[Change],
                _right: &Commit,
                _right_changes: &[Change],
                _common: &Commit,
            ) -> Result<Vec<MergedValue>, StorageError> {
                panic!("resolver should not be invoked when there is no conflict");
            }
        }

        let strategy = AutomaticWithFallback {
            resolver: Arc::new(NeverCalled),
        };
        let result = strategy.merge(&inputs).await.unwrap();
        let mut keys: Vec<_> = result.iter().map(|v| v.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![make_key("email").unwrap(), make_key("phone").unwrap()]);
    }

    #[tokio::test]
    async fn automatic_with_fallback_delegates_conflicting_keys_only() {
        let store = MemObjectStore::new();
        let common = commit_with_tree(&store, &[("name", 1)]).await;
        let left = commit_with_tree(&store, &[("name", 10), ("city", 2)]).await;
        let right = commit_with_tree(&store, &[("name", 20), ("phone", 3)]).await;
        let reader = TreeReader::new(std::sync::Arc::new(store));
        let inputs = MergeInputs::load(&reader, left, right, common).await.unwrap();

        struct RecordingResolver {
            seen_conflict_keys: std::sync::Mutex<Vec<EntryKey>>,
        }
        #[async_trait]
        impl ConflictResolver for RecordingResolver {
            async fn resolve(
                &self,
                _left: &Commit,
                left_changes: &[Change],
                _right: &Commit,
                _right_changes: &[Change],
                _common: &Commit,
            ) -> Result<Vec<MergedValue>, StorageError> {
                let mut seen = self.seen_conflict_keys.lock().unwrap();
                seen.extend(left_changes.iter().map(|c| c.key.clone()));
                Ok(vec![MergedValue {
                    key: make_key("name").unwrap(),
                    source: MergeSource::Right,
                }])
            }
        }

        let resolver = Arc::new(RecordingResolver {
            seen_conflict_keys: std::sync::Mutex::new(Vec::new()),
        });
        let strategy = AutomaticWithFallback {
            resolver: resolver.clone(),
        };
        let result = strategy.merge(&inputs).await.unwrap();
        assert_eq!(resolver.seen_conflict_keys.lock().unwrap().as_slice(), &[make_key("name").unwrap()]);

        let mut keys: Vec<_> = result.iter().map(|v| v.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![make_key("name").unwrap(), make_key("phone").unwrap()]);
    }

    #[tokio::test]
    async fn custom_strategy_rejects_duplicate_keys_from_resolver() {
        let store = MemObjectStore::new();
        let common = commit_with_tree(&store, &[]).await;
        let left = commit_with_tree(&store, &[("k", 1)]).await;
        let right = commit_with_tree(&store, &[("k", 2)]).await;
        let reader = TreeReader::new(std::sync::Arc::new(store));
        let inputs = MergeInputs::load(&reader, left, right, common).await.unwrap();

        struct DuplicatingResolver;
        #[async_trait]
        impl ConflictResolver for DuplicatingResolver {
            async fn resolve(
                &self,
                _left: &Commit,
                _left_changes: &[Change],
                _right: &Commit,
                _right_changes: &[Change],
                _common: &Commit,
            ) -> Result<Vec<MergedValue>, StorageError> {
                Ok(vec![
                    MergedValue {
                        key: make_key("k").unwrap(),
                        source: MergeSource::Left,
                    },
                    MergedValue {
                        key: make_key("k").unwrap(),
                        source: MergeSource::Right,
                    },
                ])
            }
        }

        let strategy = Custom {
            resolver: Arc::new(DuplicatingResolver),
        };
        assert!(strategy.merge(&inputs).await.is_err());
    }
}
