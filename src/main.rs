//! # Context Agent CLI (`ctxa`)
//!
//! ## Usage
//!
//! ```bash
//! ctxa --config ./config/ctxa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctxa init` | Create the SQLite database and run schema migrations |
//! | `ctxa ingest <path\|->` | Ingest a file, a directory, or stdin |
//! | `ctxa search "<query>"` | Hybrid search over indexed chunks |
//! | `ctxa get <id>` | Print a document and its chunks |
//! | `ctxa delete <id>` | Delete a document from both shards |
//! | `ctxa list` | List documents, newest first |
//! | `ctxa stats` | Document, chunk and memory counts |
//! | `ctxa ask "<question>"` | Retrieval-augmented answer with citations |
//! | `ctxa run "<goal>"` | Plan and execute a goal with tools |
//! | `ctxa tools` | Start tool servers and list their tools |
//! | `ctxa memory search\|list\|add\|delete` | Inspect and edit long-term memory |
//!
//! ## Exit codes
//!
//! `0` success, `1` failure, `2` configuration error, `3` provider
//! unavailable, `4` tool-broker failure.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use context_agent::assistant::Assistant;
use context_agent::config::{self, Config};
use context_agent::memory::NewNote;
use context_agent::models::{Metadata, NoteKind};
use context_agent::scope::Scope;
use context_agent::{stats, Error};

/// Context Agent: local-first retrieval, tool servers and planned
/// execution over one SQLite database.
#[derive(Parser)]
#[command(
    name = "ctxa",
    about = "Context Agent — local-first retrieval, tool calling and planned execution",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ctxa.toml")]
    config: PathBuf,

    /// Overall deadline for `ask` and `run`, in seconds.
    #[arg(long, global = true, default_value_t = 300)]
    timeout: u64,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a file, a directory tree, or `-` for stdin.
    Ingest {
        path: String,

        /// Only ingest files matching these globs (directories only).
        #[arg(long = "include")]
        include: Vec<String>,

        /// Skip files matching these globs (directories only).
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// Explicit document id (stdin only).
        #[arg(long)]
        id: Option<String>,

        /// Source label (stdin only).
        #[arg(long, default_value = "stdin")]
        source: String,

        /// Metadata as `key=value` pairs.
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Hybrid search over indexed chunks.
    Search {
        query: String,

        /// Number of results (defaults to `index.top_k_default`).
        #[arg(short, long)]
        k: Option<usize>,

        /// Metadata equality filters as `key=value` pairs.
        #[arg(long = "filter", value_parser = parse_key_val)]
        filter: Vec<(String, String)>,
    },

    /// Print a document and its chunks.
    Get { id: String },

    /// Delete a document and its chunks.
    Delete { id: String },

    /// List documents, newest first.
    List {
        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long = "filter", value_parser = parse_key_val)]
        filter: Vec<(String, String)>,
    },

    /// Document, chunk and memory counts.
    Stats,

    /// Answer a question from the index (and memory).
    Ask {
        question: String,

        /// Let the model call tools while answering.
        #[arg(long)]
        tools: bool,
    },

    /// Plan and execute a goal with the configured tool servers.
    Run { goal: String },

    /// Start the configured tool servers and list their tools.
    Tools,

    /// Inspect and edit long-term memory.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Notes most similar to a query.
    Search {
        query: String,
        #[arg(short, long, default_value_t = 5)]
        k: usize,
    },
    /// Notes by importance.
    List {
        /// fact, skill, pattern, context or preference.
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Store a note by hand.
    Add {
        content: String,
        #[arg(long, default_value = "fact")]
        kind: String,
        #[arg(long, default_value_t = 0.5)]
        importance: f32,
    },
    /// Delete a note.
    Delete { id: String },
}

/// Parse a `key=value` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn metadata(pairs: Vec<(String, String)>) -> Metadata {
    pairs
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect()
}

fn parse_kind(kind: &str) -> anyhow::Result<NoteKind> {
    NoteKind::parse(kind)
        .ok_or_else(|| Error::invalid(format!("unknown memory kind '{}'", kind)).into())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("CTXA_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Exit code for a failed command: the first library error in the chain
/// decides, anything else is a generic failure.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|e| e.downcast_ref::<Error>())
        .map_or(1, |e| e.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    match run(cli, cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn print<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T) -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", text(value));
    }
    Ok(())
}

async fn run(cli: Cli, cfg: Config) -> anyhow::Result<()> {
    let json = cli.json;
    let assistant = Assistant::open(cfg).await.context("failed to open the database")?;

    let scope = Scope::new(Duration::from_secs(cli.timeout));
    let interrupt = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let result = dispatch(&assistant, cli.command, json, &scope).await;
    assistant.shutdown().await;
    result
}

async fn dispatch(assistant: &Assistant, command: Commands, json: bool, scope: &Scope) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            println!(
                "Database initialized at {}",
                assistant.config().db.path.display()
            );
        }
        Commands::Ingest {
            path,
            include,
            exclude,
            id,
            source,
            meta,
        } => {
            let ingestor = assistant.ingestor();
            if path == "-" {
                let mut content = String::new();
                std::io::stdin()
                    .read_to_string(&mut content)
                    .context("failed to read stdin")?;
                let meta = metadata(meta);
                let doc = match id {
                    Some(id) => context_agent::models::Document::with_id(id, source, content, meta),
                    None => context_agent::models::Document::new(source, content, meta),
                };
                let report = ingestor.ingest(&doc).await?;
                print(json, &report, |r| format!("Ingested {} ({} chunks)\n", r.doc_id, r.chunks))?;
            } else {
                let report = ingestor
                    .ingest_path(std::path::Path::new(&path), &include, &exclude)
                    .await?;
                print(json, &report, |r| {
                    format!("Ingested {} documents ({} chunks)\n", r.documents, r.chunks)
                })?;
            }
        }
        Commands::Search { query, k, filter } => {
            let filter = metadata(filter);
            let hits = assistant
                .search(&query, k, (!filter.is_empty()).then_some(&filter))
                .await?;
            print(json, &hits, |hits| {
                if hits.is_empty() {
                    return "No results.\n".to_string();
                }
                let mut out = String::new();
                for (i, h) in hits.iter().enumerate() {
                    let snippet: String = h.content.chars().take(160).collect();
                    out.push_str(&format!(
                        "{}. [{:.4}] {} #{} ({})\n   {}\n",
                        i + 1,
                        h.score,
                        h.doc_id,
                        h.ordinal,
                        h.chunk_id,
                        snippet.replace('\n', " ")
                    ));
                }
                out
            })?;
        }
        Commands::Get { id } => {
            let doc = assistant.store().get(&id).await?;
            let chunks = assistant.store().chunks(&id).await?;
            let value = serde_json::json!({"document": doc, "chunks": chunks});
            print(json, &value, |_| {
                let mut out = format!(
                    "id:       {}\nsource:   {}\ncreated:  {}\nmetadata: {}\n\n{}\n",
                    doc.id,
                    doc.source,
                    doc.created_at.to_rfc3339(),
                    serde_json::Value::Object(doc.metadata.clone()),
                    doc.content
                );
                out.push_str(&format!("\n--- {} chunks ---\n", chunks.len()));
                for c in &chunks {
                    out.push_str(&format!("[{}] {}\n", c.ordinal, c.id));
                }
                out
            })?;
        }
        Commands::Delete { id } => {
            let removed = assistant.store().delete(&id).await?;
            println!("Deleted {} ({} chunks)", id, removed);
        }
        Commands::List {
            offset,
            limit,
            filter,
        } => {
            let filter = metadata(filter);
            let page = assistant
                .store()
                .list((!filter.is_empty()).then_some(&filter), offset, limit)
                .await?;
            print(json, &page, |page| {
                let mut out = String::new();
                for d in &page.items {
                    out.push_str(&format!(
                        "{}  {}  {}\n",
                        d.id,
                        d.created_at.format("%Y-%m-%d %H:%M"),
                        d.source
                    ));
                }
                out.push_str(&format!(
                    "({}-{} of {})\n",
                    page.offset.min(page.total as usize),
                    (page.offset + page.items.len()),
                    page.total
                ));
                out
            })?;
        }
        Commands::Stats => {
            let path = assistant.config().db.path.clone();
            let s = stats::collect(assistant.db(), &path).await?;
            print(json, &s, |s| stats::render(s, &path))?;
        }
        Commands::Ask { question, tools } => {
            if tools {
                assistant.broker().start_all().await;
            }
            let answer = assistant.answer(&question, tools, scope).await?;
            print(json, &answer, |a| {
                let mut out = format!("{}\n", a.answer);
                if !a.cited.is_empty() {
                    out.push_str("\nSources:\n");
                    for s in a.sources.iter().filter(|s| a.cited.contains(&s.chunk_id)) {
                        out.push_str(&format!("  [{}] {} ({})\n", s.number, s.doc_id, s.chunk_id));
                    }
                }
                out
            })?;
        }
        Commands::Run { goal } => {
            let running = assistant.broker().start_all().await;
            tracing::info!(servers = running, "tool servers started");
            let outcome = assistant.run_goal(&goal, scope).await?;
            print(json, &outcome, |o| {
                let mut out = String::new();
                for step in &o.agent.run.steps {
                    out.push_str(&format!("  {:<12} {:<24} {:?}\n", step.step_id, step.tool, step.status));
                }
                out.push_str(&format!("\nStatus: {:?}\n\n{}\n", o.agent.run.status, o.answer));
                out
            })?;
        }
        Commands::Tools => {
            assistant.broker().start_all().await;
            let value = serde_json::json!({
                "servers": assistant.broker().server_status(),
                "tools": assistant.broker().list_tools(),
            });
            print(json, &value, |_| {
                let mut out = String::new();
                for s in assistant.broker().server_status() {
                    out.push_str(&format!("{:<16} {:<10} {} tools\n", s.name, s.state.to_string(), s.tools));
                    if let Some(err) = &s.last_error {
                        out.push_str(&format!("    last error: {}\n", err));
                    }
                }
                for t in assistant.broker().list_tools() {
                    out.push_str(&format!("  {:<32} {}\n", t.qualified_name(), t.description));
                }
                out
            })?;
        }
        Commands::Memory { action } => {
            let memory = assistant
                .memory()
                .ok_or_else(|| Error::invalid("memory is disabled in the configuration"))?;
            match action {
                MemoryAction::Search { query, k } => {
                    let notes = memory.retrieve(&query, k).await?;
                    print(json, &notes, |notes| {
                        notes
                            .iter()
                            .map(|n| format!("[{:.3}] {} ({}) {}\n", n.score, n.note.id, n.note.kind.as_str(), n.note.content))
                            .collect()
                    })?;
                }
                MemoryAction::List { kind, limit } => {
                    let kind = kind.as_deref().map(parse_kind).transpose()?;
                    let notes = memory.list(kind, limit).await?;
                    print(json, &notes, |notes| {
                        notes
                            .iter()
                            .map(|n| format!("{} {:.2} ({}) {}\n", n.id, n.importance, n.kind.as_str(), n.content))
                            .collect()
                    })?;
                }
                MemoryAction::Add {
                    content,
                    kind,
                    importance,
                } => {
                    let mut note = NewNote::new(parse_kind(&kind)?, content);
                    note.importance = importance;
                    let stored = memory.add(note).await?;
                    println!("{}", stored.id);
                }
                MemoryAction::Delete { id } => {
                    memory.delete(&id).await?;
                    println!("Deleted {}", id);
                }
            }
        }
    }
    Ok(())
}
