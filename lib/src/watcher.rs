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

//! Commit watcher fan-out, spec §4.5. Each watcher gets commits in
//! DAG-insertion order, contiguous same-source runs are coalesced when the
//! watcher is slow to drain its buffer, and an overflowing watcher is
//! detached rather than allowed to block the producer.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use crate::commit::Commit;

/// Where a batch of new commits came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
    Sync,
}

/// One notification delivered to a watcher: a contiguous run of commits
/// from the same source.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub commits: Vec<Commit>,
    pub source: ChangeSource,
}

/// Bound on the number of undelivered batches a watcher may accumulate
/// before it is detached. Kept small: a watcher this far behind is not
/// going to catch up by buffering harder, and holding its backlog forever
/// would be an unbounded memory liability.
const WATCHER_BUFFER_CAPACITY: usize = 64;

struct WatcherSlot {
    sender: mpsc::Sender<CommitBatch>,
    pending: Vec<Commit>,
    pending_source: Option<ChangeSource>,
}

/// Fans out newly-added commits to every subscriber of a single page's
/// commit DAG. Delivery never blocks the producer: a full buffer detaches
/// the watcher instead of stalling `add_commit`.
#[derive(Default)]
pub struct WatcherFanout {
    slots: Mutex<Vec<WatcherSlot>>,
}

/// Handle returned by [`WatcherFanout::subscribe`]; receives delivered
/// batches and learns when it has been detached (buffer overflow or
/// explicit unsubscribe).
pub struct WatcherHandle {
    pub receiver: mpsc::Receiver<CommitBatch>,
}

impl WatcherFanout {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self) -> WatcherHandle {
        let (sender, receiver) = mpsc::channel(WATCHER_BUFFER_CAPACITY);
        let mut slots = self.slots.lock().expect("watcher fanout mutex poisoned");
        slots.push(WatcherSlot {
            sender,
            pending: Vec::new(),
            pending_source: None,
        });
        WatcherHandle { receiver }
    }

    /// Delivers `commits` (already in DAG-insertion order) from `source` to
    /// every live watcher, coalescing with that watcher's still-buffered
    /// run from the same source if the channel send would have blocked.
    pub fn notify(&self, commits: &[Commit], source: ChangeSource) {
        if commits.is_empty() {
            return;
        }
        let mut slots = self.slots.lock().expect("watcher fanout mutex poisoned");
        slots.retain_mut(|slot| Self::deliver_to_slot(slot, commits, source));
    }

    fn deliver_to_slot(slot: &mut WatcherSlot, commits: &[Commit], source: ChangeSource) -> bool {
        if slot.pending_source == Some(source) || slot.pending.is_empty() {
            slot.pending.extend_from_slice(commits);
            slot.pending_source = Some(source);
        } else {
            // Source changed mid-buffer: flush what's pending first so
            // ordering and per-source coalescing are both preserved.
            if !Self::flush_slot(slot) {
                return false;
            }
            slot.pending.extend_from_slice(commits);
            slot.pending_source = Some(source);
        }
        Self::flush_slot(slot)
    }

    fn flush_slot(slot: &mut WatcherSlot) -> bool {
        if slot.pending.is_empty() {
            return true;
        }
        let batch = CommitBatch {
            commits: std::mem::take(&mut slot.pending),
            source: slot.pending_source.take().unwrap(),
        };
        match slot.sender.try_send(batch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(batch)) => {
                // Buffer full: keep accumulating so nothing is lost until we
                // know for sure the watcher is gone, but cap how long we try.
                slot.pending = batch.commits;
                slot.pending_source = Some(batch.source);
                if slot.pending.len() > WATCHER_BUFFER_CAPACITY * 4 {
                    warn!("detaching watcher after sustained buffer overflow");
                    false
                } else {
                    true
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}
