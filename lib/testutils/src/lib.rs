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

//! Test fixtures shared between `ledgerdag`'s integration tests: a
//! proptest-state-machine reference model of a page's key space, plus small
//! helpers for spinning up in-memory ledgers and pages in tests.

pub mod proptest;

use std::sync::Arc;

use ledgerdag::{Ledger, LedgerConfig, Page};

/// An in-memory ledger with a single freshly-created page, for tests that
/// don't care about ledger-level behavior.
pub async fn new_test_page() -> Arc<Page> {
    let ledger = Ledger::in_memory(LedgerConfig::default());
    ledger
        .create_page()
        .await
        .expect("creating a page in a fresh in-memory ledger cannot fail")
}
