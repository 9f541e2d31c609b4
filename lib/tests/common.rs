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

//! Fixtures shared by the scenario tests in this directory: a way to fork
//! a page's head set in two through the public `Page` API (mirroring two
//! independent client handles racing a transaction against the same base,
//! spec §1/§5), and a handful of `ConflictResolverFactory`/`ConflictResolver`
//! test doubles used by the custom-resolver scenarios in spec §8.

#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use ledgerdag::config::PageStorageConfig;
use ledgerdag::merge::Change;
use ledgerdag::merge::ConflictResolver;
use ledgerdag::merge::ConflictResolverFactory;
use ledgerdag::merge::MergePolicy;
use ledgerdag::merge::MergedValue;
use ledgerdag::object_store::MemObjectStore;
use ledgerdag::object_store::ObjectStore;
use ledgerdag::Commit;
use ledgerdag::Page;
use ledgerdag::PageId;
use ledgerdag::Priority;
use ledgerdag::Status;
use ledgerdag::StorageError;

/// A page and the (shared, in-memory) object store backing it, so test
/// fixtures can stash content and obtain an `ObjectId` for it without going
/// through `Page::put` (which would land its own commit immediately).
pub async fn new_page_with_store() -> (Arc<Page>, Arc<dyn ObjectStore>) {
    let store: Arc<dyn ObjectStore> = Arc::new(MemObjectStore::new());
    let page = Page::create(PageId::new_random(), store.clone(), PageStorageConfig::default())
        .await
        .expect("creating an in-memory page should not fail");
    (page, store)
}

/// Forks `page`'s current head into two, by starting a transaction on two
/// independent handles against the *same* base before either commits, then
/// committing `older` first and `newer` second (with a short delay so the
/// two commits get distinct timestamps, per spec §3's ordering tie-break).
/// This is the public-API equivalent of "two devices committing
/// concurrently" for a single local page (spec §1).
///
/// Returns `(older_handle, newer_handle)`; after this call `page.heads()`
/// has exactly two entries, and the resolver's MERGING role assignment
/// (spec §4.6) will pick `newer`'s commit as `left` (the more recent head).
pub async fn fork_two_commits(
    page: &Arc<Page>,
    object_store: &Arc<dyn ObjectStore>,
    older: &[(&str, &[u8])],
    newer: &[(&str, &[u8])],
) -> (Arc<Page>, Arc<Page>) {
    let older_handle = page.new_handle();
    let newer_handle = page.new_handle();

    assert_eq!(older_handle.start_transaction(), Status::Ok);
    assert_eq!(newer_handle.start_transaction(), Status::Ok);

    for (key, value) in older {
        let object_id = object_store.put(value.to_vec()).await.unwrap();
        assert_eq!(
            older_handle.put_in_transaction(*key, object_id, Priority::Eager),
            Status::Ok
        );
    }
    for (key, value) in newer {
        let object_id = object_store.put(value.to_vec()).await.unwrap();
        assert_eq!(
            newer_handle.put_in_transaction(*key, object_id, Priority::Eager),
            Status::Ok
        );
    }

    assert_eq!(older_handle.commit_transaction().await, Status::Ok);
    // Force a strictly later wall-clock timestamp for the second commit so
    // head ordering is deterministic rather than racing the clock's
    // resolution.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(newer_handle.commit_transaction().await, Status::Ok);

    (older_handle, newer_handle)
}

/// Polls until `page` has converged to a single head, or panics after a
/// generous timeout. Merges run on a spawned task (spec §4.6), so tests
/// that trigger one must wait for it asynchronously rather than assuming
/// it lands synchronously with the commit that exposed two heads.
pub async fn wait_for_single_head(page: &Page) -> Commit {
    for _ in 0..500 {
        let heads = page.heads();
        if heads.len() == 1 {
            return heads.into_iter().next().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "page did not converge to a single head within the test's wait budget ({} heads remain)",
        page.heads().len()
    );
}

/// A `ConflictResolver` that always returns a fixed, pre-baked response.
pub struct FixedResolver(pub Vec<MergedValue>);

#[async_trait::async_trait]
impl ConflictResolver for FixedResolver {
    async fn resolve(
        &self,
        _left: &Commit,
        _left_changes: &[Change],
        _right: &Commit,
        _right_changes: &[Change],
        _common: &Commit,
    ) -> Result<Vec<MergedValue>, StorageError> {
        Ok(self.0.clone())
    }
}

/// A `ConflictResolver` that always reports itself as disconnected, used to
/// exercise the resolver's retry-with-fresh-resolver path (spec §4.6/§8 S4).
pub struct DisconnectingResolver;

#[async_trait::async_trait]
impl ConflictResolver for DisconnectingResolver {
    async fn resolve(
        &self,
        _left: &Commit,
        _left_changes: &[Change],
        _right: &Commit,
        _right_changes: &[Change],
        _common: &Commit,
    ) -> Result<Vec<MergedValue>, StorageError> {
        Err(StorageError::NotConnected)
    }
}

/// A `ConflictResolver` that blocks inside `resolve` until released via
/// [`GatedResolver::release`], recording whether it was ever `cancel`'d.
/// Used to pin down the moment a merge is "in the strategy's callback" so a
/// test can replace the factory out from under it (spec §8 S5).
pub struct GatedResolver {
    gate: tokio::sync::Notify,
    released: AtomicBool,
    cancelled: AtomicBool,
    response: Vec<MergedValue>,
}

impl GatedResolver {
    pub fn new(response: Vec<MergedValue>) -> Arc<Self> {
        Arc::new(Self {
            gate: tokio::sync::Notify::new(),
            released: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            response,
        })
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConflictResolver for GatedResolver {
    async fn resolve(
        &self,
        _left: &Commit,
        _left_changes: &[Change],
        _right: &Commit,
        _right_changes: &[Change],
        _common: &Commit,
    ) -> Result<Vec<MergedValue>, StorageError> {
        if !self.released.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        Ok(self.response.clone())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// A factory that always answers the same fixed policy and hands out
/// resolvers produced by a caller-supplied closure, counting how many
/// times each method was called (spec §8 S2's "invoked exactly once").
pub struct CountingFactory<F> {
    policy: MergePolicy,
    pub policy_calls: AtomicUsize,
    pub resolver_calls: AtomicUsize,
    make_resolver: Mutex<F>,
}

impl<F> CountingFactory<F>
where
    F: FnMut(usize) -> Arc<dyn ConflictResolver> + Send,
{
    pub fn new(policy: MergePolicy, make_resolver: F) -> Arc<Self> {
        Arc::new(Self {
            policy,
            policy_calls: AtomicUsize::new(0),
            resolver_calls: AtomicUsize::new(0),
            make_resolver: Mutex::new(make_resolver),
        })
    }
}

impl<F> ConflictResolverFactory for CountingFactory<F>
where
    F: FnMut(usize) -> Arc<dyn ConflictResolver> + Send,
{
    fn get_policy(&self, _page_id: PageId) -> MergePolicy {
        self.policy_calls.fetch_add(1, Ordering::SeqCst);
        self.policy
    }

    fn new_conflict_resolver(&self, _page_id: PageId) -> Arc<dyn ConflictResolver> {
        let call = self.resolver_calls.fetch_add(1, Ordering::SeqCst);
        (self.make_resolver.lock().expect("factory mutex poisoned"))(call)
    }
}
