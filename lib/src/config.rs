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

//! Tunables for a ledger's storage and merge engine: back-off bounds for
//! the merge resolver's retry loop, the in-memory object cache's capacity,
//! and the page-read APIs' inline response size cap. Loaded from a
//! `toml_edit`/`serde`-shaped document, the way the teacher loads
//! `.jj/repo/config.toml`; nothing here reaches into the environment or
//! the filesystem implicitly, so the engine stays embeddable in tests.

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Maximum bytes a paginated `get_keys`/`get_entries` response may carry
/// inline before truncating and returning a continuation token (spec
/// §4.8). The page's own facade consults this; it is not wire-visible
/// configuration, just a local tuning knob.
pub const DEFAULT_MAX_INLINE_RESPONSE_BYTES: usize = 64 * 1024;

const DEFAULT_OBJECT_CACHE_CAPACITY: usize = 4096;
const DEFAULT_MERGE_RETRY_BASE_MILLIS: u64 = 50;
const DEFAULT_MERGE_RETRY_MAX_MILLIS: u64 = 5_000;
const DEFAULT_MERGE_MAX_NETWORK_RETRIES: u32 = 6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml_edit::de::Error),
}

/// Back-off bounds for the merge resolver's retry loop when a custom
/// resolver is unavailable (spec §4.6 failure semantics).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeBackoffConfig {
    pub base_delay_millis: u64,
    pub max_delay_millis: u64,
    pub max_network_retries: u32,
}

impl MergeBackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_millis)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_millis)
    }
}

impl Default for MergeBackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_millis: DEFAULT_MERGE_RETRY_BASE_MILLIS,
            max_delay_millis: DEFAULT_MERGE_RETRY_MAX_MILLIS,
            max_network_retries: DEFAULT_MERGE_MAX_NETWORK_RETRIES,
        }
    }
}

/// Per-page storage tunables (spec §2A ambient stack).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageStorageConfig {
    /// Capacity of the in-memory LRU layer in front of the object store,
    /// in entries (not bytes: object sizes vary too widely for a byte
    /// budget to be a meaningful per-page knob at this layer).
    pub object_cache_capacity: usize,
    /// Cap on inline bytes for a single `get_keys`/`get_entries` response
    /// before the page facade truncates and hands back a continuation
    /// token (spec §4.8).
    pub max_inline_response_bytes: usize,
    pub merge_backoff: MergeBackoffConfig,
}

impl Default for PageStorageConfig {
    fn default() -> Self {
        Self {
            object_cache_capacity: DEFAULT_OBJECT_CACHE_CAPACITY,
            max_inline_response_bytes: DEFAULT_MAX_INLINE_RESPONSE_BYTES,
            merge_backoff: MergeBackoffConfig::default(),
        }
    }
}

impl PageStorageConfig {
    pub fn object_cache_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.object_cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Top-level, ledger-scoped configuration. One `LedgerConfig` is shared by
/// every page a `Ledger` opens; there is no network or process-launch
/// configuration here (spec §1: those are external collaborators).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LedgerConfig {
    pub page_storage: PageStorageConfig,
}

impl LedgerConfig {
    /// Parses a `LedgerConfig` from a TOML document's text. Unknown
    /// top-level tables are ignored rather than rejected, so a config file
    /// shared with unrelated tooling does not break this engine.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml_edit::de::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
