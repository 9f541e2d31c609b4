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

//! A thin harness over `ledgerdag`: good enough to poke a page by hand
//! while working on the engine, not a client of the (out-of-scope) wire
//! protocol. Every invocation opens (or creates, on the first run) one
//! page against a file-backed ledger rooted at `--data-dir`; the page's
//! id is remembered in `<data-dir>/PAGE_ID` so later invocations reopen
//! the same page instead of starting a new one, and its commit DAG is
//! durably recorded under `<data-dir>/pages/<page-id>/` (spec §6), so the
//! page's history survives across invocations, not just within a `run`
//! script's single session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use ledgerdag::{Ledger, LedgerConfig, Page, PageId, Status};
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error("storage error: {0}")]
    Storage(#[from] ledgerdag::StorageError),
    #[error("config error: {0}")]
    Config(#[from] ledgerdag::config::ConfigError),
    #[error("request failed: {0}")]
    Request(Status),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed script line {line}: {text:?}")]
    MalformedScriptLine { line: usize, text: String },
    #[error("corrupt page id recorded at {path}")]
    CorruptPageIdMarker { path: PathBuf },
}

#[derive(Parser)]
#[command(name = "ledgerdag", about = "Manual test harness for the ledgerdag engine")]
struct Cli {
    /// Directory holding the file-backed object store.
    #[arg(long, global = true, default_value = "ledgerdag-data")]
    data_dir: PathBuf,

    /// Optional TOML file overriding `LedgerConfig` defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit `heads`/`log`/`get` output as JSON instead of the default
    /// human-readable lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Writes `value` at `key` and prints the resulting status.
    Put { key: String, value: String },
    /// Reads the value at `key`.
    Get { key: String },
    /// Deletes `key`.
    Delete { key: String },
    /// Lists the page's current head commits.
    Heads,
    /// Lists the ancestry of the primary head, newest first.
    Log,
    /// Forks two concurrent writes to the same key from two independent
    /// handles, then waits for the resolver to converge the head set
    /// back to one, printing the winner.
    Merge,
    /// Executes a sequence of `put`/`get`/`delete`/`heads`/`log`/`merge`
    /// lines (whitespace-separated, `#`-prefixed comments ignored)
    /// against one page in a single session.
    Run { script: PathBuf },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = try_main().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn try_main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => LedgerConfig::from_toml_file(path)?,
        None => LedgerConfig::default(),
    };
    std::fs::create_dir_all(&cli.data_dir)?;
    let ledger = Ledger::open(&cli.data_dir, config)?;
    let page = open_or_create_page(&ledger, &cli.data_dir).await?;

    match cli.command {
        Command::Put { key, value } => run_put(&page, &key, value.into_bytes()).await?,
        Command::Get { key } => run_get(&page, &key, cli.json).await?,
        Command::Delete { key } => run_delete(&page, &key).await?,
        Command::Heads => print_heads(&page, cli.json),
        Command::Log => print_log(&page, cli.json)?,
        Command::Merge => run_merge_demo(&page).await?,
        Command::Run { script } => run_script(&page, &script, cli.json).await?,
    }
    Ok(())
}

/// Reopens the page recorded at `<data_dir>/PAGE_ID`, or creates one and
/// records its id there if this is the first invocation against
/// `data_dir`.
async fn open_or_create_page(ledger: &Ledger, data_dir: &std::path::Path) -> Result<Arc<Page>, CliError> {
    let marker = data_dir.join("PAGE_ID");
    match std::fs::read_to_string(&marker) {
        Ok(contents) => {
            let page_id: PageId = contents
                .trim()
                .parse()
                .map_err(|_| CliError::CorruptPageIdMarker { path: marker })?;
            Ok(ledger.open_page(page_id)?)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let page = ledger.create_page().await?;
            std::fs::write(&marker, page.id().hex())?;
            Ok(page)
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(serde::Serialize)]
struct HeadView {
    commit_id: String,
    generation: u64,
}

#[derive(serde::Serialize)]
struct LogEntryView {
    commit_id: String,
    generation: u64,
    parents: Vec<String>,
}

async fn run_put(page: &Page, key: &str, value: Vec<u8>) -> Result<(), CliError> {
    let status = page.put(key, value).await;
    require_ok(status)?;
    println!("OK");
    Ok(())
}

async fn run_get(page: &Page, key: &str, json: bool) -> Result<(), CliError> {
    let snapshot = page.get_snapshot().await?;
    let (status, value) = snapshot.get(key).await;
    if json {
        let rendered = value.as_deref().map(String::from_utf8_lossy);
        println!(
            "{}",
            serde_json::json!({
                "status": status.to_string(),
                "value": rendered.as_deref(),
            })
        );
        return Ok(());
    }
    match value {
        Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
        None => println!("<{status}>"),
    }
    Ok(())
}

async fn run_delete(page: &Page, key: &str) -> Result<(), CliError> {
    let status = page.delete(key).await;
    require_ok(status)?;
    println!("OK");
    Ok(())
}

fn print_heads(page: &Page, json: bool) {
    let heads = page.heads();
    if json {
        let views: Vec<HeadView> = heads
            .iter()
            .map(|commit| HeadView {
                commit_id: commit.commit_id.to_string(),
                generation: commit.generation,
            })
            .collect();
        println!("{}", serde_json::to_string(&views).expect("HeadView always serializes"));
        return;
    }
    for commit in heads {
        println!("{} (generation {})", commit.commit_id, commit.generation);
    }
}

fn print_log(page: &Page, json: bool) -> Result<(), CliError> {
    let commits = page.log()?;
    if json {
        let views: Vec<LogEntryView> = commits
            .iter()
            .map(|commit| LogEntryView {
                commit_id: commit.commit_id.to_string(),
                generation: commit.generation,
                parents: commit.parent_ids.iter().map(ToString::to_string).collect(),
            })
            .collect();
        println!("{}", serde_json::to_string(&views).expect("LogEntryView always serializes"));
        return Ok(());
    }
    for commit in commits {
        println!(
            "{} generation={} parents={}",
            commit.commit_id,
            commit.generation,
            commit
                .parent_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    Ok(())
}

/// Demonstrates the merge resolver: two handles race a write to the same
/// key from the same base commit, forking the head set to two, then the
/// resolver reduces it back to one (spec §4.6/§8 S2).
async fn run_merge_demo(page: &Page) -> Result<(), CliError> {
    let left = page.new_handle();
    let right = page.new_handle();
    require_ok(left.put("contested-key", b"left-writer".to_vec()).await)?;
    require_ok(right.put("contested-key", b"right-writer".to_vec()).await)?;

    println!("forked to {} heads, waiting for merge...", page.heads().len());
    for _ in 0..200 {
        if page.heads().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let heads = page.heads();
    if heads.len() != 1 {
        println!("did not converge within the demo's wait budget ({} heads remain)", heads.len());
        return Ok(());
    }
    let snapshot = page.get_snapshot().await?;
    let (_, value) = snapshot.get("contested-key").await;
    println!(
        "converged to a single head; contested-key = {:?}",
        value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    );
    Ok(())
}

async fn run_script(page: &Arc<Page>, script: &std::path::Path, json: bool) -> Result<(), CliError> {
    let text = std::fs::read_to_string(script)?;
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["put", key, value] => run_put(page, key, value.as_bytes().to_vec()).await?,
            ["get", key] => run_get(page, key, json).await?,
            ["delete", key] => run_delete(page, key).await?,
            ["heads"] => print_heads(page, json),
            ["log"] => print_log(page, json)?,
            ["merge"] => run_merge_demo(page).await?,
            _ => {
                return Err(CliError::MalformedScriptLine {
                    line: line_no + 1,
                    text: line.to_string(),
                })
            }
        }
    }
    Ok(())
}

fn require_ok(status: Status) -> Result<(), CliError> {
    match status {
        Status::Ok => Ok(()),
        other => Err(CliError::Request(other)),
    }
}
