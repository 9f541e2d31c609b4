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

//! Two error layers, per the storage/wire split: [`StorageError`] flows
//! through internal callbacks and is never leaked to the wire verbatim;
//! [`Status`] is what callers of the Page/PageSnapshot API observe. The
//! translation between the two is context-dependent (the same
//! `StorageError::NotFound` means `KEY_NOT_FOUND` when it's a key lookup
//! but `NETWORK_ERROR` when it's a missing sync dependency), so there is no
//! single blanket `From` impl; instead each call site picks the
//! contextual translator that matches what it was trying to do.

use std::fmt;

use thiserror::Error;

use crate::file_util::PathError;
use crate::ids::CommitId;
use crate::ids::ObjectId;

/// Internal storage-layer error, per spec §7.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {0} not found")]
    NotFound(ObjectId),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation interrupted")]
    Interrupted,
    #[error("custom resolver is not connected")]
    NotConnected,
    #[error("custom resolver needs network access to proceed")]
    NetworkNeeded,
    #[error("page storage is in an illegal state: {0}")]
    IllegalState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<PathError> for StorageError {
    /// Collapses a path-annotated filesystem error down to the underlying
    /// `io::Error`, same as a bare I/O failure with no path context: every
    /// [`Status`] translator already treats `StorageError::Io` uniformly,
    /// so the extra path string [`PathError`] carries is only useful in
    /// the `tracing` logs emitted at the point of failure, not here.
    fn from(err: PathError) -> Self {
        StorageError::Io(err.error)
    }
}

/// Wire-visible status, per spec §6/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    PartialResult,
    KeyNotFound,
    PageNotFound,
    ReferenceNotFound,
    IoError,
    NetworkError,
    UnknownError,
    InvalidArgument,
    InternalError,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::PartialResult => "PARTIAL_RESULT",
            Status::KeyNotFound => "KEY_NOT_FOUND",
            Status::PageNotFound => "PAGE_NOT_FOUND",
            Status::ReferenceNotFound => "REFERENCE_NOT_FOUND",
            Status::IoError => "IO_ERROR",
            Status::NetworkError => "NETWORK_ERROR",
            Status::UnknownError => "UNKNOWN_ERROR",
            Status::InvalidArgument => "INVALID_ARGUMENT",
            Status::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// Translates a [`StorageError`] encountered while looking up a single key
/// in a page's tree: a missing key is a normal, expected outcome.
pub fn status_for_key_lookup(err: &StorageError) -> Status {
    match err {
        StorageError::NotFound(_) => Status::KeyNotFound,
        StorageError::Io(_) => Status::IoError,
        StorageError::Interrupted => Status::IoError,
        StorageError::NetworkNeeded | StorageError::NotConnected => Status::NetworkError,
        StorageError::IllegalState(_) => Status::InternalError,
        StorageError::InvalidArgument(_) => Status::InvalidArgument,
    }
}

/// Translates a [`StorageError`] encountered while resolving an object that
/// a tree entry references: a missing object here means the value is a
/// sync dependency that hasn't arrived locally yet, not that the key is
/// absent.
pub fn status_for_object_fetch(err: &StorageError) -> Status {
    match err {
        StorageError::NotFound(_) => Status::NetworkError,
        StorageError::Io(_) => Status::IoError,
        StorageError::Interrupted => Status::IoError,
        StorageError::NetworkNeeded | StorageError::NotConnected => Status::NetworkError,
        StorageError::IllegalState(_) => Status::InternalError,
        StorageError::InvalidArgument(_) => Status::InvalidArgument,
    }
}

/// Translates a [`StorageError`] encountered while resolving a specific
/// reference named in a `GetEntries` response: a missing object here is
/// reported as a dangling reference rather than a network condition,
/// since the caller asked for the tree's actual content, not a fetch.
pub fn status_for_reference(err: &StorageError) -> Status {
    match err {
        StorageError::NotFound(_) => Status::ReferenceNotFound,
        other => status_for_object_fetch(other),
    }
}

/// Translates a [`StorageError`] arising from a structural operation on the
/// commit DAG itself (e.g. a parent commit that should exist does not): a
/// missing commit here is never a benign lookup miss, it is a structural
/// inconsistency.
pub fn status_for_dag_operation(err: &StorageError) -> Status {
    match err {
        StorageError::NotFound(_) => Status::InternalError,
        StorageError::Io(_) => Status::IoError,
        StorageError::Interrupted => Status::IoError,
        StorageError::NetworkNeeded | StorageError::NotConnected => Status::NetworkError,
        StorageError::IllegalState(_) => Status::InternalError,
        StorageError::InvalidArgument(_) => Status::InvalidArgument,
    }
}

/// A structural inconsistency in the DAG (a commit whose parent is
/// unknown). Per spec §7 this is fatal to the page: the page enters a
/// degraded read-only state.
#[derive(Debug, Error)]
#[error("commit {commit} references unknown parent {parent}")]
pub struct DagInconsistency {
    pub commit: CommitId,
    pub parent: CommitId,
}
