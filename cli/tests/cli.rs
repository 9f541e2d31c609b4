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

//! End-to-end coverage of the `ledgerdag` binary. Every invocation against
//! the same `--data-dir` reopens the same page (its id is recorded in
//! `<data-dir>/PAGE_ID` on first use), so a `put` in one process is
//! observable by a `get` in the next one, in addition to `run` exercising
//! several operations against one page within a single process.

use assert_cmd::Command;

fn cli() -> Command {
    Command::cargo_bin("ledgerdag").expect("binary `ledgerdag` should build")
}

#[test]
fn put_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    cli()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["put", "name", "Alice"])
        .assert()
        .success()
        .stdout("OK\n");
}

#[test]
fn get_on_an_empty_page_reports_key_not_found() {
    let dir = tempfile::tempdir().unwrap();
    cli()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["get", "missing"])
        .assert()
        .success()
        .stdout("<KEY_NOT_FOUND>\n");
}

#[test]
fn get_json_reports_a_structured_miss() {
    let dir = tempfile::tempdir().unwrap();
    let output = cli()
        .arg("--data-dir")
        .arg(dir.path())
        .arg("--json")
        .args(["get", "missing"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(value["status"], "KEY_NOT_FOUND");
    assert!(value["value"].is_null());
}

#[test]
fn script_put_then_get_round_trips_within_one_page() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("script.txt");
    std::fs::write(&script, "put name Alice\nget name\nheads\n").unwrap();

    cli()
        .arg("--data-dir")
        .arg(dir.path())
        .arg("run")
        .arg(&script)
        .assert()
        .success()
        .stdout(predicates::str::contains("Alice"));
}

#[test]
fn script_with_an_unknown_verb_fails_with_the_offending_line() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("script.txt");
    std::fs::write(&script, "put a 1\nbogus-verb\n").unwrap();

    cli()
        .arg("--data-dir")
        .arg(dir.path())
        .arg("run")
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicates::str::contains("malformed script line 2"));
}

#[test]
fn script_merge_converges_two_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("script.txt");
    std::fs::write(&script, "merge\nheads\n").unwrap();

    cli()
        .arg("--data-dir")
        .arg(dir.path())
        .arg("run")
        .arg(&script)
        .assert()
        .success()
        .stdout(predicates::str::contains("converged to a single head"));
}

#[test]
fn a_put_is_visible_to_a_get_from_a_separate_process() {
    let dir = tempfile::tempdir().unwrap();
    cli()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["put", "name", "Alice"])
        .assert()
        .success()
        .stdout("OK\n");

    cli()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["get", "name"])
        .assert()
        .success()
        .stdout("Alice\n");
}

#[test]
fn heads_json_is_a_single_element_array_on_a_fresh_page() {
    let dir = tempfile::tempdir().unwrap();
    let output = cli()
        .arg("--data-dir")
        .arg(dir.path())
        .arg("--json")
        .arg("heads")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let heads = value.as_array().expect("heads --json prints a JSON array");
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0]["generation"], 0);
}
