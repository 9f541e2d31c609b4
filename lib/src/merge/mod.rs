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

//! Automatic merge resolution, spec §4.6/§4.7: finding a common ancestor
//! ([`lca`]), diffing trees against it ([`diff`]), the merge policies that
//! decide what to do with conflicting keys ([`strategy`]), and the state
//! machine that drives it all per page ([`resolver`]).

pub mod diff;
pub mod lca;
pub mod resolver;
pub mod strategy;

pub use diff::Change;
pub use diff::ChangeKind;
pub use lca::lowest_common_ancestor;
pub use resolver::MergeResolver;
pub use resolver::MergeResolverDelegate;
pub use strategy::ConflictResolver;
pub use strategy::ConflictResolverFactory;
pub use strategy::MergePolicy;
pub use strategy::MergeSource;
pub use strategy::MergeStrategy;
pub use strategy::MergedValue;
