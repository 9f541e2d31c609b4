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

//! `ledgerdag` is the page storage and conflict-resolution engine shared by
//! all devices replicating a ledger: a content-addressed object store, an
//! immutable commit DAG per page, a mutable journal for staging writes, a
//! watcher fan-out that keeps subscribers in sync with the chosen head, and
//! a merge resolver that reduces divergent heads back to one using a
//! pluggable strategy.
//!
//! Process launch, cloud transport, the on-disk wire encoding, the
//! cryptographic RNG, network-availability signaling, and the client RPC
//! surface are outside this crate; they are represented here only as the
//! trait seams this engine needs from them.

pub mod commit;
pub mod config;
pub mod dag;
pub mod error;
pub mod file_util;
pub mod ids;
pub mod journal;
pub mod ledger;
pub mod merge;
pub mod object_store;
pub mod page;
pub mod snapshot;
pub mod tree;
pub mod tree_reader;
pub mod watcher;

pub use commit::Commit;
pub use config::LedgerConfig;
pub use dag::CommitGraph;
pub use error::Status;
pub use error::StorageError;
pub use ids::CommitId;
pub use ids::JournalId;
pub use ids::ObjectId;
pub use ids::PageId;
pub use ledger::Ledger;
pub use page::Page;
pub use snapshot::PageSnapshot;
pub use snapshot::PageWatcher;
pub use tree::Entry;
pub use tree::Priority;
