// Copyright 2025 The Jujutsu Authors
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

//! A reference model of a single page's committed key space, for use with
//! `proptest-state-machine` against a real [`ledgerdag::page::Page`]. Models
//! only the put/delete surface; merges are exercised separately since this
//! state machine assumes a single writer with no concurrent heads.

use std::collections::BTreeMap;

use ledgerdag::Priority;
use proptest::collection::btree_map;
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::sample::select;
use proptest_state_machine::ReferenceStateMachine;

#[derive(Debug, Clone, Default)]
pub struct PageRefState {
    entries: BTreeMap<Vec<u8>, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub contents: Vec<u8>,
    pub priority: Priority,
}

#[derive(Debug, Clone)]
pub enum Transition {
    /// Writes `contents` at `key`, overwriting any existing value.
    Put {
        key: Vec<u8>,
        contents: Vec<u8>,
        priority: Priority,
    },
    /// Removes whatever value is currently at `key`.
    Delete { key: Vec<u8> },
}

impl PageRefState {
    pub fn entries(&self) -> impl Iterator<Item = (&[u8], &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries.get(key)
    }
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::Eager), Just(Priority::Lazy)]
}

fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    // Biased towards collisions (a-d) with room for arbitrary short keys,
    // mirroring the small alphabet jj's path-component generator uses to
    // keep interesting overlaps likely rather than vanishingly rare.
    "(a|b|c|d|[\\PC&&[^/]]{1,16})".prop_map(|s| s.into_bytes())
}

fn arb_contents() -> impl Strategy<Value = Vec<u8>> {
    "[a-z]{0,8}".prop_map(|s| s.into_bytes())
}

fn arb_transition_put(_state: &PageRefState) -> impl Strategy<Value = Transition> {
    (arb_key(), arb_contents(), arb_priority()).prop_map(|(key, contents, priority)| {
        Transition::Put {
            key,
            contents,
            priority,
        }
    })
}

fn arb_transition_delete(state: &PageRefState) -> impl Strategy<Value = Transition> {
    let keys: Vec<Vec<u8>> = state.entries.keys().cloned().collect();
    select(keys).prop_map(|key| Transition::Delete { key })
}

impl ReferenceStateMachine for PageRefState {
    type State = Self;

    type Transition = Transition;

    fn init_state() -> BoxedStrategy<Self::State> {
        prop_oneof![
            1 => Just(Self::default()),
            10 => btree_map(arb_key(), (arb_contents(), arb_priority()), 0..8).prop_map(
                |entries| Self {
                    entries: entries
                        .into_iter()
                        .map(|(key, (contents, priority))| (key, Value { contents, priority }))
                        .collect(),
                }
            ),
        ]
        .boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        if state.entries.is_empty() {
            arb_transition_put(state).boxed()
        } else {
            prop_oneof![
                arb_transition_put(state),
                arb_transition_delete(state),
            ]
            .boxed()
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            Transition::Put {
                key,
                contents,
                priority,
            } => {
                state.entries.insert(
                    key.clone(),
                    Value {
                        contents: contents.clone(),
                        priority: *priority,
                    },
                );
            }
            Transition::Delete { key } => {
                state.entries.remove(key);
            }
        }
        state
    }
}

/// Helper reused by both the state-machine harness and ad-hoc property
/// tests: arbitrary non-empty batches of distinct keys, useful for fuzzing
/// pagination boundaries in [`ledgerdag::snapshot::PageSnapshot::get_keys`].
pub fn arb_distinct_keys(max_len: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    vec(arb_key(), 1..max_len).prop_map(|mut keys| {
        keys.sort();
        keys.dedup();
        keys
    })
}
