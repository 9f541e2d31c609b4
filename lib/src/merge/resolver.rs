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

//! Per-page merge state machine, spec §4.6: IDLE -> SELECTING -> ANCESTOR
//! -> MERGING -> IDLE, grounded on the shape of
//! `examples/original_source/src/app/merging/merge_resolver.h`. At most one
//! merge is ever in flight for a page; a new head pair is only picked up
//! once the previous attempt lands or is abandoned.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::commit::head_order_key;
use crate::commit::Commit;
use crate::config::MergeBackoffConfig;
use crate::dag::merge_parent_ids;
use crate::dag::CommitGraph;
use crate::error::StorageError;
use crate::ids::CommitId;
use crate::ids::PageId;
use crate::ids::Timestamp;
use crate::merge::diff::Change;
use crate::merge::lca::lowest_common_ancestor;
use crate::merge::strategy::AutomaticWithFallback;
use crate::merge::strategy::ConflictResolverFactory;
use crate::merge::strategy::Custom;
use crate::merge::strategy::LastOneWins;
use crate::merge::strategy::MergeInputs;
use crate::merge::strategy::MergePolicy;
use crate::merge::strategy::MergeSource;
use crate::merge::strategy::MergeStrategy;
use crate::merge::strategy::MergedValue;
use crate::object_store::ObjectStore;
use crate::tree::Tree;
use crate::tree_reader::TreeReader;
use crate::watcher::ChangeSource;

/// Delegate notified of merge resolver lifecycle events a page cares about,
/// so that `MergeResolver` does not need to hold a strong reference back to
/// its owning page.
pub trait MergeResolverDelegate: Send + Sync {
    /// All heads have converged to one commit; there is nothing left to
    /// merge until a new conflicting head appears.
    fn on_empty(&self) {}
}

struct NoopDelegate;
impl MergeResolverDelegate for NoopDelegate {}

/// Drives automatic merges for a single page. Holds no strong reference to
/// the page itself; `delegate` is the page's narrow callback surface.
pub struct MergeResolver {
    page_id: PageId,
    dag: Arc<CommitGraph>,
    object_store: Arc<dyn ObjectStore>,
    factory: Mutex<Option<Arc<dyn ConflictResolverFactory>>>,
    cached_policy: Mutex<Option<MergePolicy>>,
    merge_in_progress: Mutex<bool>,
    /// Bumped by `set_conflict_resolver_factory`; an in-flight attempt
    /// checks this before committing and abandons itself if it has moved.
    generation: AtomicU64,
    delegate: Mutex<Arc<dyn MergeResolverDelegate>>,
    backoff: MergeBackoffConfig,
}

impl MergeResolver {
    pub fn new(page_id: PageId, dag: Arc<CommitGraph>, object_store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Self::with_backoff(page_id, dag, object_store, MergeBackoffConfig::default())
    }

    pub fn with_backoff(
        page_id: PageId,
        dag: Arc<CommitGraph>,
        object_store: Arc<dyn ObjectStore>,
        backoff: MergeBackoffConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            page_id,
            dag,
            object_store,
            factory: Mutex::new(None),
            cached_policy: Mutex::new(None),
            merge_in_progress: Mutex::new(false),
            generation: AtomicU64::new(0),
            delegate: Mutex::new(Arc::new(NoopDelegate)),
            backoff,
        })
    }

    pub fn set_delegate(&self, delegate: Arc<dyn MergeResolverDelegate>) {
        *self.delegate.lock().expect("merge resolver mutex poisoned") = delegate;
    }

    /// Replaces the conflict resolver factory, invalidates the cached
    /// policy, and cancels any merge attempt currently waiting on a custom
    /// resolver response (spec §4.7: swapping policy mid-merge must not let
    /// a stale resolver's answer land).
    pub fn set_conflict_resolver_factory(&self, factory: Option<Arc<dyn ConflictResolverFactory>>) {
        *self.factory.lock().expect("merge resolver mutex poisoned") = factory;
        *self
            .cached_policy
            .lock()
            .expect("merge resolver mutex poisoned") = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn merge_in_progress(&self) -> bool {
        *self.merge_in_progress.lock().expect("merge resolver mutex poisoned")
    }

    /// Entry point called whenever the page's head set may have changed
    /// (after a local commit, or a batch of commits arriving from sync).
    /// A no-op if a merge is already running or fewer than two heads
    /// exist; otherwise spawns exactly one merge attempt.
    pub fn check_for_merge(self: &Arc<Self>) {
        let mut in_progress = self
            .merge_in_progress
            .lock()
            .expect("merge resolver mutex poisoned");
        if *in_progress {
            return;
        }
        let heads = self.dag.get_heads();
        if heads.len() < 2 {
            if heads.len() == 1 {
                self.delegate
                    .lock()
                    .expect("merge resolver mutex poisoned")
                    .on_empty();
            }
            return;
        }
        *in_progress = true;
        drop(in_progress);

        let (left, right) = select_head_pair(&heads);
        let generation = self.generation.load(Ordering::SeqCst);
        let resolver = self.clone();
        tokio::spawn(async move {
            resolver.run_merge_attempt(left, right, generation).await;
            *resolver
                .merge_in_progress
                .lock()
                .expect("merge resolver mutex poisoned") = false;
            // A merge may have exposed (or left behind) another
            // conflicting pair; re-check rather than waiting for the next
            // external trigger.
            resolver.check_for_merge();
        });
    }

    #[instrument(skip(self), fields(page_id = %self.page_id, left = %left, right = %right))]
    async fn run_merge_attempt(&self, left: CommitId, right: CommitId, generation: u64) {
        let mut network_retries = 0;
        loop {
            if self.generation.load(Ordering::SeqCst) != generation {
                info!("abandoning merge attempt: strategy changed mid-merge");
                return;
            }
            match self.attempt_once(left, right, generation).await {
                Ok(true) => return,
                Ok(false) => {
                    // Heads moved under us (optimistic-commit race): the
                    // next `check_for_merge` pass will pick a fresh pair.
                    return;
                }
                Err(StorageError::NetworkNeeded | StorageError::NotConnected) => {
                    network_retries += 1;
                    if network_retries > self.backoff.max_network_retries {
                        warn!("giving up merge after repeated network failures");
                        return;
                    }
                    let delay = self
                        .backoff
                        .base_delay()
                        .saturating_mul(1 << network_retries.min(6))
                        .min(self.backoff.max_delay());
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(error = %err, "merge attempt failed");
                    return;
                }
            }
        }
    }

    /// Runs ANCESTOR + MERGING once. Returns `Ok(true)` on a successful
    /// commit, `Ok(false)` if the selected heads are stale and the attempt
    /// should be abandoned in favor of re-selection, or `Err` for retryable
    /// or fatal failures.
    async fn attempt_once(
        &self,
        pair_a_id: CommitId,
        pair_b_id: CommitId,
        generation: u64,
    ) -> Result<bool, StorageError> {
        let pair_a = self.dag.get_commit(&pair_a_id)?;
        let pair_b = self.dag.get_commit(&pair_b_id)?;

        // Pair selection above is about *which* two heads to reduce, ordered
        // purely for canonical determinism; the MERGING role assignment is
        // separate (spec §4.6): `left` is the most-recent head by
        // generation, breaking ties by timestamp then id.
        let (left, right) = if head_order_key(&pair_a) <= head_order_key(&pair_b) {
            (pair_a, pair_b)
        } else {
            (pair_b, pair_a)
        };
        let (left_id, right_id) = (left.commit_id, right.commit_id);

        let common_id = lowest_common_ancestor(&self.dag, left_id, right_id)?
            .ok_or_else(|| StorageError::IllegalState("merge sides share no ancestor".to_string()))?;
        let common = self.dag.get_commit(&common_id)?;

        let policy = self.policy();
        let tree_reader = TreeReader::new(self.object_store.clone());
        let inputs = MergeInputs::load(&tree_reader, left.clone(), right.clone(), common.clone()).await?;

        let strategy = self.strategy_for(policy);
        let merged = strategy.merge(&inputs).await?;

        if self.generation.load(Ordering::SeqCst) != generation {
            strategy.cancel();
            return Ok(true); // treated as abandoned by the caller's generation check
        }

        let mut tree = inputs.left_tree.clone();
        apply_merged_values(&mut tree, &merged, &inputs.right_tree)?;
        let tree_id = self.object_store.put(tree.serialize()).await?;

        // Optimistic-commit race check: if either side stopped being a
        // head while we were computing the merge, some other commit (a
        // local write, a sync delivery, or a concurrent merge) already
        // moved the DAG forward; this attempt's result is stale.
        let heads = self.dag.head_ids();
        if !heads.contains(&left_id) || !heads.contains(&right_id) {
            return Ok(false);
        }

        let parent_ids = merge_parent_ids(left_id, right_id);
        let new_commit = Commit::with_parent_generations(
            parent_ids,
            &[left.generation, right.generation],
            tree_id,
            Timestamp::now(),
        );
        self.dag.add_commit(new_commit, ChangeSource::Local)?;
        Ok(true)
    }

    pub(crate) fn policy(&self) -> MergePolicy {
        if let Some(policy) = *self
            .cached_policy
            .lock()
            .expect("merge resolver mutex poisoned")
        {
            return policy;
        }
        let policy = match &*self.factory.lock().expect("merge resolver mutex poisoned") {
            Some(factory) => factory.get_policy(self.page_id),
            None => MergePolicy::LastOneWins,
        };
        *self
            .cached_policy
            .lock()
            .expect("merge resolver mutex poisoned") = Some(policy);
        policy
    }

    fn strategy_for(&self, policy: MergePolicy) -> Box<dyn MergeStrategy> {
        match policy {
            MergePolicy::LastOneWins => Box::new(LastOneWins),
            MergePolicy::AutomaticWithFallback => {
                let resolver = self.new_conflict_resolver();
                Box::new(AutomaticWithFallback { resolver })
            }
            MergePolicy::Custom => {
                let resolver = self.new_conflict_resolver();
                Box::new(Custom { resolver })
            }
        }
    }

    fn new_conflict_resolver(&self) -> Arc<dyn crate::merge::strategy::ConflictResolver> {
        match &*self.factory.lock().expect("merge resolver mutex poisoned") {
            Some(factory) => factory.new_conflict_resolver(self.page_id),
            None => Arc::new(AlwaysLeftResolver),
        }
    }
}

/// Fallback used if a custom policy is selected without a factory ever
/// having been set: keeps the conflicting keys on `left`, matching
/// `LastOneWins`'s default bias.
struct AlwaysLeftResolver;

#[async_trait::async_trait]
impl crate::merge::strategy::ConflictResolver for AlwaysLeftResolver {
    async fn resolve(
        &self,
        _left: &Commit,
        _left_changes: &[Change],
        _right: &Commit,
        _right_changes: &[Change],
        _common: &Commit,
    ) -> Result<Vec<MergedValue>, StorageError> {
        Ok(Vec::new())
    }
}

fn apply_merged_values(
    tree: &mut Tree,
    merged: &[MergedValue],
    right_tree: &Tree,
) -> Result<(), StorageError> {
    for value in merged {
        match &value.source {
            MergeSource::Left => {}
            MergeSource::Right => {
                let entry = right_tree.get(&value.key).ok_or_else(|| {
                    StorageError::IllegalState(
                        "merge strategy chose RIGHT for a key absent on the right side".to_string(),
                    )
                })?;
                tree.insert(value.key.clone(), entry.object_id, entry.priority);
            }
            MergeSource::Delete => tree.remove(&value.key),
            MergeSource::New(object_id, priority) => {
                tree.insert(value.key.clone(), *object_id, *priority)
            }
        }
    }
    Ok(())
}

/// Deterministic head-pair selection, spec §4.6: among all pairs of heads,
/// pick the one with the smallest generation distance; break ties by
/// `(commit_id, commit_id)` lexicographic order over the pair.
fn select_head_pair(heads: &[Commit]) -> (CommitId, CommitId) {
    let mut best: Option<(u64, CommitId, CommitId)> = None;
    for i in 0..heads.len() {
        for j in (i + 1)..heads.len() {
            let a = &heads[i];
            let b = &heads[j];
            let distance = a.generation.abs_diff(b.generation);
            let (left, right) = if a.commit_id <= b.commit_id {
                (a.commit_id, b.commit_id)
            } else {
                (b.commit_id, a.commit_id)
            };
            let candidate = (distance, left, right);
            if best.as_ref().map_or(true, |current| candidate < *current) {
                best = Some(candidate);
            }
        }
    }
    let (_, left, right) = best.expect("select_head_pair requires at least two heads");
    (left, right)
}
