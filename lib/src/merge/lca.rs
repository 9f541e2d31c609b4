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

//! Lowest common ancestor search, spec §4.6 ANCESTOR state: a dual BFS
//! walking backwards from both heads over the parent graph, labeling each
//! visited commit by which side(s) have reached it. The first commit
//! labeled by both sides is the LCA. Ties are broken by highest
//! generation, then lowest id; since generation only decreases while
//! walking toward the root, popping candidates from a max-heap ordered by
//! `(generation, Reverse(id))`-equivalent priority naturally yields
//! exactly that order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::HashSet;

use crate::dag::CommitGraph;
use crate::error::StorageError;
use crate::ids::CommitId;
use crate::ids::Generation;

const LEFT: u8 = 0b01;
const RIGHT: u8 = 0b10;
const BOTH: u8 = LEFT | RIGHT;

#[derive(Eq, PartialEq)]
struct HeapEntry {
    generation: Generation,
    commit_id: CommitId,
    origin: u8,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher generation first, and among
        // equal generations, lower id first (spec's "lowest id" tie-break
        // means that candidate must sort as greater-or-equal priority).
        self.generation
            .cmp(&other.generation)
            .then_with(|| other.commit_id.cmp(&self.commit_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Finds the lowest common ancestor of `left` and `right` in `graph`.
/// Returns `None` if their histories share no common ancestor (the
/// resolver treats this as safe to replace with the conceptual empty-tree
/// commit, spec §4.6 failure semantics).
pub fn lowest_common_ancestor(
    graph: &CommitGraph,
    left: CommitId,
    right: CommitId,
) -> Result<Option<CommitId>, StorageError> {
    if left == right {
        return Ok(Some(left));
    }

    let mut heap = BinaryHeap::new();
    let mut origin: HashMap<CommitId, u8> = HashMap::new();
    let mut expanded: HashSet<CommitId> = HashSet::new();

    for (commit_id, bit) in [(left, LEFT), (right, RIGHT)] {
        let generation = graph.get_commit(&commit_id)?.generation;
        heap.push(HeapEntry {
            generation,
            commit_id,
            origin: bit,
        });
    }

    while let Some(HeapEntry {
        generation,
        commit_id,
        origin: bit,
    }) = heap.pop()
    {
        let combined = origin.entry(commit_id).or_insert(0);
        *combined |= bit;
        if *combined == BOTH {
            return Ok(Some(commit_id));
        }
        if expanded.insert(commit_id) {
            let commit = graph.get_commit(&commit_id)?;
            for parent in &commit.parent_ids {
                let parent_generation = graph.get_commit(parent)?.generation;
                debug_assert!(parent_generation < generation);
                heap.push(HeapEntry {
                    generation: parent_generation,
                    commit_id: *parent,
                    origin: bit,
                });
            }
        }
    }

    Ok(None)
}
