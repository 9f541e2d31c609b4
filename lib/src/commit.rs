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

//! Immutable commits: `(commit_id, parent_ids, root_tree_id, timestamp,
//! generation)`, spec §3. A commit's id is a digest over its serialized
//! contents, so equal contents always produce an equal id and are
//! deduplicated by construction (invariant 4).

use smallvec::SmallVec;

use crate::error::StorageError;
use crate::ids::CommitId;
use crate::ids::Generation;
use crate::ids::ObjectId;
use crate::ids::Timestamp;
use crate::tree::Tree;

/// A commit may have 0 parents (the root commit of a page), 1 (a regular
/// commit), or 2 (a merge commit).
pub type ParentIds = SmallVec<[CommitId; 2]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub commit_id: CommitId,
    pub parent_ids: ParentIds,
    pub root_tree_id: ObjectId,
    pub timestamp: Timestamp,
    pub generation: Generation,
}

impl Commit {
    /// Builds and digests a commit from its logical contents. The returned
    /// `commit_id` is a pure function of `parent_ids`, `root_tree_id`, and
    /// `timestamp` (`generation` is derived from `parent_ids` so is not
    /// separately hashed).
    pub fn new(parent_ids: ParentIds, root_tree_id: ObjectId, timestamp: Timestamp) -> Self {
        let generation = 0; // overwritten below once parent generations are known by the caller
        let mut commit = Self {
            commit_id: CommitId([0; 32]),
            parent_ids,
            root_tree_id,
            timestamp,
            generation,
        };
        commit.commit_id = CommitId::from_content(&commit.serialize());
        commit
    }

    /// Builds a commit whose generation is `1 + max(parent generations)`,
    /// or 0 if there are no parents (the page's root commit).
    pub fn with_parent_generations(
        parent_ids: ParentIds,
        parent_generations: &[Generation],
        root_tree_id: ObjectId,
        timestamp: Timestamp,
    ) -> Self {
        let generation = parent_generations.iter().max().map_or(0, |g| g + 1);
        let mut commit = Self {
            commit_id: CommitId([0; 32]),
            parent_ids,
            root_tree_id,
            timestamp,
            generation,
        };
        commit.commit_id = CommitId::from_content(&commit.serialize());
        commit
    }

    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() == 2
    }

    /// Canonical serialized form. Generation is intentionally excluded: it
    /// is derivable from the parent chain, so including it would let two
    /// commits with identical logical content diverge in id if computed
    /// with a stale generation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 * (1 + self.parent_ids.len()) + 16);
        buf.push(self.parent_ids.len() as u8);
        for parent in &self.parent_ids {
            buf.extend_from_slice(parent.as_bytes());
        }
        buf.extend_from_slice(self.root_tree_id.as_bytes());
        buf.extend_from_slice(&self.timestamp.0.to_le_bytes());
        buf
    }

    /// Encoding for the persisted commit store (spec §6): the canonical
    /// `serialize()` preimage the id is computed from, with `generation`
    /// appended afterward so it rides along without being hashed.
    pub fn to_disk_bytes(&self) -> Vec<u8> {
        let mut buf = self.serialize();
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf
    }

    /// Inverse of [`Commit::to_disk_bytes`].
    pub fn from_disk_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let bad = || StorageError::IllegalState("corrupt persisted commit record".to_string());
        if bytes.len() < 8 {
            return Err(bad());
        }
        let (content, generation_bytes) = bytes.split_at(bytes.len() - 8);
        let generation = Generation::from_le_bytes(generation_bytes.try_into().map_err(|_| bad())?);
        Self::deserialize(content, generation)
    }

    pub fn deserialize(
        bytes: &[u8],
        generation: Generation,
    ) -> Result<Self, StorageError> {
        let bad = || StorageError::IllegalState("corrupt commit object".to_string());
        if bytes.is_empty() {
            return Err(bad());
        }
        let parent_count = bytes[0] as usize;
        if parent_count > 2 {
            return Err(bad());
        }
        let mut offset = 1;
        let mut parent_ids = ParentIds::new();
        for _ in 0..parent_count {
            if bytes.len() < offset + 32 {
                return Err(bad());
            }
            parent_ids.push(CommitId(
                bytes[offset..offset + 32].try_into().map_err(|_| bad())?,
            ));
            offset += 32;
        }
        if bytes.len() < offset + 32 + 8 {
            return Err(bad());
        }
        let root_tree_id = ObjectId(bytes[offset..offset + 32].try_into().map_err(|_| bad())?);
        offset += 32;
        let timestamp = Timestamp(i64::from_le_bytes(
            bytes[offset..offset + 8].try_into().map_err(|_| bad())?,
        ));
        let commit_id = CommitId::from_content(bytes);
        Ok(Self {
            commit_id,
            parent_ids,
            root_tree_id,
            timestamp,
            generation,
        })
    }
}

/// Deterministic ordering for head sets: `(generation desc, timestamp
/// desc, id asc)`, spec §4.2.
pub fn head_order_key(commit: &Commit) -> (std::cmp::Reverse<Generation>, std::cmp::Reverse<i64>, CommitId) {
    (
        std::cmp::Reverse(commit.generation),
        std::cmp::Reverse(commit.timestamp.0),
        commit.commit_id,
    )
}

/// Id of the empty tree's serialized form, reused as the root tree of a
/// page's root commit (spec §3 invariant 2). Callers that create a page
/// must still `put` `Tree::empty().serialize()` into the object store so
/// this id actually resolves.
pub fn empty_tree_object_id() -> ObjectId {
    ObjectId::from_content(&Tree::empty().serialize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_contents_produce_equal_ids() {
        let tree_id = ObjectId::from_content(b"tree");
        let ts = Timestamp(1000);
        let a = Commit::new(ParentIds::new(), tree_id, ts);
        let b = Commit::new(ParentIds::new(), tree_id, ts);
        assert_eq!(a.commit_id, b.commit_id);
    }

    #[test]
    fn different_parents_produce_different_ids() {
        let tree_id = ObjectId::from_content(b"tree");
        let ts = Timestamp(1000);
        let mut parents_a = ParentIds::new();
        parents_a.push(CommitId::from_content(b"a"));
        let mut parents_b = ParentIds::new();
        parents_b.push(CommitId::from_content(b"b"));
        let a = Commit::new(parents_a, tree_id, ts);
        let b = Commit::new(parents_b, tree_id, ts);
        assert_ne!(a.commit_id, b.commit_id);
    }

    #[test]
    fn generation_is_one_plus_max_parent() {
        let tree_id = ObjectId::from_content(b"tree");
        let ts = Timestamp(1000);
        let mut parents = ParentIds::new();
        parents.push(CommitId::from_content(b"p1"));
        parents.push(CommitId::from_content(b"p2"));
        let commit = Commit::with_parent_generations(parents, &[3, 5], tree_id, ts);
        assert_eq!(commit.generation, 6);
    }

    #[test]
    fn root_commit_has_generation_zero() {
        let tree_id = empty_tree_object_id();
        let commit = Commit::with_parent_generations(ParentIds::new(), &[], tree_id, Timestamp(0));
        assert_eq!(commit.generation, 0);
        assert!(commit.is_root());
    }

    #[test]
    fn serialize_round_trips() {
        let tree_id = ObjectId::from_content(b"tree");
        let mut parents = ParentIds::new();
        parents.push(CommitId::from_content(b"p1"));
        let commit = Commit::with_parent_generations(parents, &[2], tree_id, Timestamp(42));
        let bytes = commit.serialize();
        let back = Commit::deserialize(&bytes, commit.generation).unwrap();
        assert_eq!(commit.commit_id, back.commit_id);
        assert_eq!(commit.parent_ids, back.parent_ids);
        assert_eq!(commit.root_tree_id, back.root_tree_id);
    }

    #[test]
    fn disk_bytes_round_trip_including_generation() {
        let tree_id = ObjectId::from_content(b"tree");
        let mut parents = ParentIds::new();
        parents.push(CommitId::from_content(b"p1"));
        let commit = Commit::with_parent_generations(parents, &[7], tree_id, Timestamp(99));
        let back = Commit::from_disk_bytes(&commit.to_disk_bytes()).unwrap();
        assert_eq!(commit, back);
    }

    #[test]
    fn from_disk_bytes_rejects_truncated_input() {
        assert!(Commit::from_disk_bytes(&[0u8; 4]).is_err());
    }
}
