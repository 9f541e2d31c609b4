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

//! Factory/resolver lifecycle scenarios that span more than one merge or
//! more than one page (spec §8 S2/S4/S5): cached policy across sequential
//! merges, retry-with-a-fresh-resolver after a disconnect, and
//! cancellation of an in-flight resolver when the factory is swapped out
//! from under it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ledgerdag::config::MergeBackoffConfig;
use ledgerdag::config::PageStorageConfig;
use ledgerdag::merge::ConflictResolver;
use ledgerdag::merge::ConflictResolverFactory;
use ledgerdag::merge::MergePolicy;
use ledgerdag::merge::MergeSource;
use ledgerdag::merge::MergedValue;
use ledgerdag::object_store::MemObjectStore;
use ledgerdag::object_store::ObjectStore;
use ledgerdag::tree::make_key;
use ledgerdag::Page;
use ledgerdag::PageId;

use crate::common::fork_two_commits;
use crate::common::new_page_with_store;
use crate::common::wait_for_single_head;
use crate::common::CountingFactory;
use crate::common::DisconnectingResolver;
use crate::common::FixedResolver;
use crate::common::GatedResolver;

/// S2: the resolver's `get_policy` is invoked once and reused across two
/// unrelated merges on the same page, not re-queried per merge.
#[tokio::test]
async fn policy_stays_cached_across_two_sequential_merges() {
    let (page, store) = new_page_with_store().await;
    let factory = CountingFactory::new(MergePolicy::LastOneWins, |_call| {
        unreachable!("LastOneWins never asks for a custom resolver")
    });
    page.set_conflict_resolver_factory(Some(factory.clone()));

    fork_two_commits(&page, &store, &[("a", b"1")], &[("a", b"2")]).await;
    wait_for_single_head(&page).await;

    fork_two_commits(&page, &store, &[("b", b"1")], &[("b", b"2")]).await;
    wait_for_single_head(&page).await;

    assert_eq!(factory.policy_calls.load(Ordering::SeqCst), 1);
    assert_eq!(factory.resolver_calls.load(Ordering::SeqCst), 0);
}

/// S4: the first resolver reports itself disconnected; the resolver keeps
/// retrying with backoff and re-requests a *new* resolver from the
/// factory on each attempt rather than reusing the failed one, until one
/// succeeds.
#[tokio::test]
async fn disconnected_resolver_is_retried_with_a_freshly_requested_resolver() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemObjectStore::new());
    let config = PageStorageConfig {
        merge_backoff: MergeBackoffConfig {
            base_delay_millis: 5,
            max_delay_millis: 20,
            max_network_retries: 10,
        },
        ..PageStorageConfig::default()
    };
    let page = Page::create(PageId::new_random(), store.clone(), config).await.unwrap();

    let factory = CountingFactory::new(MergePolicy::Custom, |call| -> Arc<dyn ConflictResolver> {
        if call < 2 {
            Arc::new(DisconnectingResolver)
        } else {
            Arc::new(FixedResolver(vec![MergedValue {
                key: make_key("x").unwrap(),
                source: MergeSource::Right,
            }]))
        }
    });
    page.set_conflict_resolver_factory(Some(factory.clone()));

    fork_two_commits(&page, &store, &[("x", b"1")], &[("x", b"2")]).await;
    wait_for_single_head(&page).await;

    let snapshot = page.get_snapshot().await.unwrap();
    assert_eq!(snapshot.get("x").await.1.unwrap(), b"2");
    assert!(factory.resolver_calls.load(Ordering::SeqCst) >= 3);
}

/// S5: while a custom resolver is blocked inside `resolve`, replacing the
/// page's conflict-resolver factory must cancel that in-flight attempt
/// (rather than letting its eventual answer land) and have the next merge
/// attempt go through the new factory instead.
#[tokio::test]
async fn replacing_the_factory_cancels_an_in_flight_resolver() {
    let (page, store) = new_page_with_store().await;

    let gated = GatedResolver::new(vec![MergedValue {
        key: make_key("x").unwrap(),
        source: MergeSource::Left,
    }]);

    struct GatedFactory(Arc<GatedResolver>);
    impl ConflictResolverFactory for GatedFactory {
        fn get_policy(&self, _page_id: PageId) -> MergePolicy {
            MergePolicy::Custom
        }
        fn new_conflict_resolver(&self, _page_id: PageId) -> Arc<dyn ConflictResolver> {
            self.0.clone()
        }
    }
    page.set_conflict_resolver_factory(Some(Arc::new(GatedFactory(gated.clone()))));

    fork_two_commits(&page, &store, &[("x", b"1")], &[("x", b"2")]).await;

    // Give the spawned merge attempt time to reach the blocked resolve()
    // call before we pull the factory out from under it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let replacement = CountingFactory::new(MergePolicy::Custom, |_call| -> Arc<dyn ConflictResolver> {
        Arc::new(FixedResolver(vec![MergedValue {
            key: make_key("x").unwrap(),
            source: MergeSource::Right,
        }]))
    });
    page.set_conflict_resolver_factory(Some(replacement.clone()));
    gated.release();

    wait_for_single_head(&page).await;

    assert!(gated.was_cancelled());
    let snapshot = page.get_snapshot().await.unwrap();
    assert_eq!(snapshot.get("x").await.1.unwrap(), b"2");
    assert!(replacement.resolver_calls.load(Ordering::SeqCst) >= 1);
}
