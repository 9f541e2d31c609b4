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

//! The tree associated with a commit: a sorted mapping from key to
//! `(object_id, priority)`. Order is strict lexicographic over byte
//! values, enforced by storing entries in a [`BTreeMap`] rather than by
//! manual sorting at read time.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::error::StorageError;
use crate::ids::ObjectId;

/// Maximum length of a key, in bytes (spec §3).
pub const MAX_KEY_SIZE: usize = 256;

/// Inline small-vector backing for a key; most page keys are far shorter
/// than the 256-byte cap, so 32 bytes inline avoids a heap allocation for
/// the common case.
pub type EntryKey = SmallVec<[u8; 32]>;

pub fn make_key(bytes: impl AsRef<[u8]>) -> Result<EntryKey, StorageError> {
    let bytes = bytes.as_ref();
    if bytes.len() > MAX_KEY_SIZE {
        return Err(StorageError::InvalidArgument(format!(
            "key of {} bytes exceeds the {MAX_KEY_SIZE}-byte limit",
            bytes.len()
        )));
    }
    Ok(EntryKey::from_slice(bytes))
}

/// EAGER entries are fetched proactively on sync; LAZY entries are fetched
/// on demand (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    Eager,
    Lazy,
}

/// A single `(key, object_id, priority)` triple, spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: EntryKey,
    pub object_id: ObjectId,
    pub priority: Priority,
}

/// The set of entries associated with a commit, conceptually a sorted
/// mapping from key to `(object_id, priority)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<EntryKey, (ObjectId, Priority)>,
}

impl Tree {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.entries.get(key).map(|(object_id, priority)| Entry {
            key: EntryKey::from_slice(key),
            object_id: *object_id,
            priority: *priority,
        })
    }

    pub fn insert(&mut self, key: EntryKey, object_id: ObjectId, priority: Priority) {
        self.entries.insert(key, (object_id, priority));
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.entries.remove(key);
    }

    /// Entries in strict lexicographic key order, optionally restricted to
    /// a key prefix, starting at or after `start_at` when given (used for
    /// pagination continuation tokens).
    pub fn iter_from<'a>(
        &'a self,
        prefix: &'a [u8],
        start_at: Option<&'a [u8]>,
    ) -> impl Iterator<Item = Entry> + 'a {
        let lower = start_at.unwrap_or(prefix);
        self.entries
            .range(EntryKey::from_slice(lower)..)
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(key, (object_id, priority))| Entry {
                key: key.clone(),
                object_id: *object_id,
                priority: *priority,
            })
    }

    /// Serializes the tree into a canonical byte form suitable for content
    /// hashing and object-store storage. The on-disk wire encoder proper is
    /// an external collaborator (spec §1); this is the one format this
    /// crate commits to internally, kept behind this single function so it
    /// can be swapped without touching callers.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * 48);
        buf.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for (key, (object_id, priority)) in &self.entries {
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(object_id.as_bytes());
            buf.push(match priority {
                Priority::Eager => 0,
                Priority::Lazy => 1,
            });
        }
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, StorageError> {
        let bad = || StorageError::IllegalState("corrupt tree object".to_string());
        if bytes.len() < 8 {
            return Err(bad());
        }
        let mut offset = 0;
        let count = u64::from_le_bytes(bytes[0..8].try_into().map_err(|_| bad())?);
        offset += 8;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            if bytes.len() < offset + 4 {
                return Err(bad());
            }
            let key_len =
                u32::from_le_bytes(bytes[offset..offset + 4].try_into().map_err(|_| bad())?)
                    as usize;
            offset += 4;
            if bytes.len() < offset + key_len + 32 + 1 {
                return Err(bad());
            }
            let key = EntryKey::from_slice(&bytes[offset..offset + key_len]);
            offset += key_len;
            let object_id = ObjectId(bytes[offset..offset + 32].try_into().map_err(|_| bad())?);
            offset += 32;
            let priority = match bytes[offset] {
                0 => Priority::Eager,
                1 => Priority::Lazy,
                _ => return Err(bad()),
            };
            offset += 1;
            entries.insert(key, (object_id, priority));
        }
        Ok(Self { entries })
    }
}
