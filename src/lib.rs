//! # Context Agent
//!
//! A local-first retrieval and tool-calling agent core.
//!
//! Documents are chunked, embedded and stored in one SQLite database with a
//! dense shard (vector BLOBs, brute-force cosine) and a lexical shard (FTS5,
//! BM25), fused by reciprocal rank. On top of retrieval sit a failover pool
//! of OpenAI-compatible LLM endpoints, a broker supervising JSON-RPC tool
//! servers over stdio, a tool-calling generation loop, a plan-and-execute
//! agent and a long-term memory of short notes.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────┐   ┌─────────────┐   ┌──────────────────┐
//!  │  Ingestor  │──▶│ Chunk+Embed │──▶│ SQLite           │
//!  │ text/files │   │             │   │ docs·chunks·FTS5 │
//!  └────────────┘   └─────────────┘   │ memories         │
//!                                     └────────┬─────────┘
//!                                              │ search / retrieve
//!  ┌──────────────┐   ┌──────────────┐   ┌─────┴──────┐
//!  │ ProviderPool │◀──│ Orchestrator │◀──│ Assistant  │
//!  │ (failover)   │   │ (tool loop)  │   │ answer/run │
//!  └──────────────┘   └──────┬───────┘   └─────┬──────┘
//!                            ▼                 ▼
//!                     ┌─────────────┐    ┌───────────┐
//!                     │ ToolBroker  │◀───│   Agent   │
//!                     │ (stdio RPC) │    │ plan/exec │
//!                     └─────────────┘    └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ctxa init
//! ctxa ingest ./docs
//! ctxa search "deployment checklist"
//! ctxa ask "How do we roll back a release?"
//! ctxa run "Fetch both status pages and combine them"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedder trait, hash and HTTP backends |
//! | [`index`] | Hybrid dense + lexical index |
//! | [`store`] | Document store |
//! | [`ingest`] | Ingestion pipeline |
//! | [`provider`] | LLM clients and the failover pool |
//! | [`broker`] | Tool-server supervision and the tool protocol |
//! | [`orchestrator`] | Tool-calling generation loop |
//! | [`agent`] | Planner, plan admission and DAG executor |
//! | [`memory`] | Long-term memory notes |
//! | [`assistant`] | Wiring of all of the above |

pub mod agent;
pub mod assistant;
pub mod broker;
pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod scope;
pub mod search;
pub mod stats;
pub mod store;

pub use error::{Error, Result};
