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

//! Single integration test binary (`autotests = false` in Cargo.toml),
//! mirroring the teacher's `tests/runner.rs` layout: one binary, many
//! `mod`s, so the test harness only has to link once.

mod common;
mod resolver_lifecycle;
mod watcher_ordering;
