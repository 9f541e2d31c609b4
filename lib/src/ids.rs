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

//! Content-addressed and random identifiers used throughout the engine.
//!
//! `ObjectId` and `CommitId` are digests: equal content always produces an
//! equal id. `PageId` and `JournalId` are random and merely need to be
//! collision-free in practice, which is handled by a single process-wide
//! `rand_chacha` pool seeded from the OS at startup (see
//! [`IdentifierPool`]).

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use blake2::digest::consts::U32;
use blake2::Blake2b;
use blake2::Digest as _;
use once_cell::sync::Lazy;
use rand::RngCore as _;
use rand::SeedableRng as _;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;

/// Computes the content digest used for both [`ObjectId`] and [`CommitId`].
///
/// Pure function of `bytes`: equal inputs always produce equal outputs,
/// which is what makes object and commit identity content-addressed rather
/// than assigned.
pub fn content_digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[derive(Debug, Error)]
#[error("invalid hex id (expected {expected} bytes, got {actual})")]
pub struct IdParseError {
    expected: usize,
    actual: usize,
}

macro_rules! digest_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_content(bytes: &[u8]) -> Self {
                Self(content_digest(bytes))
            }

            pub fn hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.hex())
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|_| IdParseError {
                    expected: 32,
                    actual: s.len() / 2,
                })?;
                let array: [u8; 32] = bytes.as_slice().try_into().map_err(|_| IdParseError {
                    expected: 32,
                    actual: bytes.len(),
                })?;
                Ok(Self(array))
            }
        }
    };
}

digest_id!(
    ObjectId,
    "Content digest identifying an immutable blob in the object store."
);
digest_id!(
    CommitId,
    "Content digest identifying an immutable commit record."
);

macro_rules! random_id {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn new_random() -> Self {
                let mut bytes = [0u8; $len];
                IdentifierPool::global().fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.hex())
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|_| IdParseError {
                    expected: $len,
                    actual: s.len() / 2,
                })?;
                let array: [u8; $len] = bytes.as_slice().try_into().map_err(|_| IdParseError {
                    expected: $len,
                    actual: bytes.len(),
                })?;
                Ok(Self(array))
            }
        }
    };
}

random_id!(PageId, 16, "Identifies a page within a ledger.");
random_id!(JournalId, 16, "Identifies an in-flight, client-owned journal.");

/// Process-wide source of cryptographic randomness for identifier
/// generation. Initialized once, lazily, on first use and never mutated
/// thereafter (spec: "a process-wide identifier pool ... initialized at
/// startup and never mutated").
pub struct IdentifierPool {
    rng: Mutex<ChaCha20Rng>,
}

static GLOBAL_POOL: Lazy<IdentifierPool> = Lazy::new(IdentifierPool::from_os_entropy);

impl IdentifierPool {
    fn from_os_entropy() -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    pub fn global() -> &'static Self {
        &GLOBAL_POOL
    }

    fn fill_bytes(&self, buf: &mut [u8]) {
        self.rng
            .lock()
            .expect("identifier pool mutex poisoned")
            .fill_bytes(buf);
    }
}

/// A monotonically-sourced wall-clock hint, used only for deterministic
/// tie-break ordering, never for correctness (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }
}

/// Depth from the root commit of a page. The root commit has generation 0;
/// every other commit has `1 + max(parent.generation)`.
pub type Generation = u64;
