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

//! Computes the set of key-level changes between a common ancestor's tree
//! and one of the two merge sides, used by every strategy in
//! `merge::strategy` (spec §4.7: `left_changes = diff(common, left)`).

use std::collections::BTreeMap;

use crate::ids::ObjectId;
use crate::tree::EntryKey;
use crate::tree::Priority;
use crate::tree::Tree;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Put(ObjectId, Priority),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: EntryKey,
    pub kind: ChangeKind,
}

/// Changes present in `side` relative to `common`: keys added or given a
/// different value are `Put`s, keys removed are `Delete`s. Keys identical
/// in both trees produce no entry.
pub fn diff(common: &Tree, side: &Tree) -> BTreeMap<EntryKey, Change> {
    let mut changes = BTreeMap::new();
    for entry in side.iter_from(b"", None) {
        match common.get(&entry.key) {
            Some(common_entry)
                if common_entry.object_id == entry.object_id
                    && common_entry.priority == entry.priority => {}
            _ => {
                changes.insert(
                    entry.key.clone(),
                    Change {
                        key: entry.key.clone(),
                        kind: ChangeKind::Put(entry.object_id, entry.priority),
                    },
                );
            }
        }
    }
    for entry in common.iter_from(b"", None) {
        if side.get(&entry.key).is_none() {
            changes.insert(
                entry.key.clone(),
                Change {
                    key: entry.key.clone(),
                    kind: ChangeKind::Delete,
                },
            );
        }
    }
    changes
}
