//! Composition root: one database, one index, one provider pool, one tool
//! broker, shared by retrieval, generation, planning and memory.
//!
//! ```text
//! answer(question)                      run_goal(goal)
//!   ├─ search (hybrid index)              ├─ plan ─▶ admit ─▶ execute
//!   ├─ retrieve (memory, if enabled)      ├─ summarise results (LLM)
//!   └─ generate (orchestrator, tools?)    └─ reflect into memory (best-effort)
//! ```

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;

use crate::agent::{Agent, AgentRun, PlanRun, StepStatus};
use crate::broker::{ToolBroker, ToolInvoker};
use crate::chunk::ChunkOptions;
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::Result;
use crate::index::HybridIndex;
use crate::ingest::Ingestor;
use crate::memory::{MemoryStore, ScoredNote};
use crate::models::{Metadata, SearchHit};
use crate::orchestrator::{Orchestrator, StopReason};
use crate::provider::{system_message, user_message, GenerateOptions, ProviderPool};
use crate::scope::Scope;
use crate::store::DocumentStore;
use crate::{db, migrate};

const MEMORY_K: usize = 3;
const MAX_OUTPUT_CHARS: usize = 2000;

pub struct Assistant {
    config: Config,
    pool: SqlitePool,
    store: Arc<DocumentStore>,
    ingestor: Ingestor,
    memory: Option<MemoryStore>,
    broker: Arc<ToolBroker>,
    orchestrator: Orchestrator,
    agent: Agent,
}

/// A numbered context source offered to the model.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub number: usize,
    pub chunk_id: String,
    pub doc_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,
    /// Chunk ids the answer cites with `[n]`, in order of first citation.
    pub cited: Vec<String>,
    /// Memory notes included in the context.
    pub notes: Vec<String>,
    pub rounds: usize,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalOutcome {
    #[serde(flatten)]
    pub agent: AgentRun,
    pub answer: String,
    pub notes_stored: usize,
}

impl Assistant {
    /// Open the database, run migrations and wire every service from
    /// `config`. Tool servers are not started.
    pub async fn open(config: Config) -> Result<Self> {
        let providers = ProviderPool::from_config(&config)?;
        let broker = Arc::new(ToolBroker::from_config(&config));
        let tools: Arc<dyn ToolInvoker> = broker.clone();
        Self::assemble(config, providers, broker, tools).await
    }

    /// Like [`Assistant::open`] with the provider pool and tool invoker
    /// supplied by the caller.
    pub async fn open_with(
        config: Config,
        providers: ProviderPool,
        tools: Arc<dyn ToolInvoker>,
    ) -> Result<Self> {
        let broker = Arc::new(ToolBroker::from_config(&config));
        Self::assemble(config, providers, broker, tools).await
    }

    async fn assemble(
        config: Config,
        providers: ProviderPool,
        broker: Arc<ToolBroker>,
        tools: Arc<dyn ToolInvoker>,
    ) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool, config.index.vector_dim).await?;
        let embedder = create_embedder(&config)?;
        let index = Arc::new(HybridIndex::new(pool.clone(), embedder.clone(), &config.index)?);
        let store = Arc::new(DocumentStore::new(index));
        let ingestor = Ingestor::new(
            store.clone(),
            ChunkOptions::from(&config.chunking),
            config.embedding.batch_size,
        )?;
        let memory = config
            .memory
            .enabled
            .then(|| MemoryStore::new(pool.clone(), embedder, &config.memory));
        let orchestrator = Orchestrator::new(providers, tools, &config.orchestrator);
        let agent = Agent::new(orchestrator.clone(), &config.agent);
        Ok(Self {
            config,
            pool,
            store,
            ingestor,
            memory,
            broker,
            orchestrator,
            agent,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn memory(&self) -> Option<&MemoryStore> {
        self.memory.as_ref()
    }

    pub fn broker(&self) -> &Arc<ToolBroker> {
        &self.broker
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Hybrid search; `k` defaults to `index.top_k_default`.
    pub async fn search(
        &self,
        query: &str,
        k: Option<usize>,
        filter: Option<&Metadata>,
    ) -> Result<Vec<SearchHit>> {
        let k = k.unwrap_or(self.config.index.top_k_default);
        self.store.index().search(query, k, filter).await
    }

    /// Retrieval-augmented answer with numbered, cited sources.
    pub async fn answer(&self, question: &str, use_tools: bool, scope: &Scope) -> Result<Answer> {
        let hits = self.search(question, None, None).await?;
        let notes = match &self.memory {
            Some(memory) => memory.retrieve(question, MEMORY_K).await?,
            None => Vec::new(),
        };
        tracing::info!(hits = hits.len(), notes = notes.len(), "answering");

        let messages = vec![
            system_message(ANSWER_PROMPT),
            user_message(&answer_context(question, &hits, &notes)),
        ];
        let tool_defs = if use_tools {
            self.orchestrator.tool_defs()
        } else {
            Vec::new()
        };
        let generation = self
            .orchestrator
            .generate_with_tools(scope, messages, &tool_defs, &GenerateOptions::default())
            .await?;

        let sources: Vec<Source> = hits
            .iter()
            .enumerate()
            .map(|(i, h)| Source {
                number: i + 1,
                chunk_id: h.chunk_id.clone(),
                doc_id: h.doc_id.clone(),
                score: h.score,
            })
            .collect();
        let cited = cited_numbers(&generation.content)
            .into_iter()
            .filter_map(|n| sources.get(n.wrapping_sub(1)).map(|s| s.chunk_id.clone()))
            .collect();

        Ok(Answer {
            answer: generation.content,
            sources,
            cited,
            notes: notes.into_iter().map(|n| n.note.id).collect(),
            rounds: generation.rounds,
            stop_reason: generation.stop_reason,
        })
    }

    /// Plan and execute `goal`, then fold the step results into an answer.
    pub async fn run_goal(&self, goal: &str, scope: &Scope) -> Result<GoalOutcome> {
        let agent_run = self.agent.run(goal, scope).await?;
        let log = execution_log(&agent_run.run);

        let messages = vec![
            system_message(SUMMARY_PROMPT),
            user_message(&format!(
                "Goal: {}\nPlan status: {:?}\n\nStep results:\n{}",
                goal, agent_run.run.status, log
            )),
        ];
        let completion = self
            .orchestrator
            .generate(scope, &messages, &GenerateOptions::default())
            .await?;

        let mut notes_stored = 0;
        if let Some(memory) = &self.memory {
            if self.config.memory.auto_store {
                notes_stored = memory
                    .reflect(&self.orchestrator, scope, goal, &completion.content, &log)
                    .await;
            }
        }
        Ok(GoalOutcome {
            agent: agent_run,
            answer: completion.content,
            notes_stored,
        })
    }

    /// Stop every tool server and close the database.
    pub async fn shutdown(&self) {
        self.broker.stop_all().await;
        self.pool.close().await;
    }
}

const ANSWER_PROMPT: &str = "Answer the question using the numbered sources below. \
Cite the sources you rely on as [n]. If the sources do not contain the answer, say so.";

const SUMMARY_PROMPT: &str = "You executed a plan of tool calls for the user's goal. \
Using the step results, give the user a concise final answer. Mention failed steps \
only when they affect the answer.";

fn answer_context(question: &str, hits: &[SearchHit], notes: &[ScoredNote]) -> String {
    let mut out = String::new();
    if hits.is_empty() {
        out.push_str("Sources: none found.\n");
    } else {
        out.push_str("Sources:\n");
        for (i, h) in hits.iter().enumerate() {
            out.push_str(&format!("[{}] (document {})\n{}\n\n", i + 1, h.doc_id, h.content));
        }
    }
    if !notes.is_empty() {
        out.push_str("Notes from memory:\n");
        for n in notes {
            out.push_str(&format!("- ({}) {}\n", n.note.kind.as_str(), n.note.content));
        }
        out.push('\n');
    }
    out.push_str(&format!("Question: {}", question));
    out
}

/// `[n]` markers in order of first appearance.
fn cited_numbers(text: &str) -> Vec<usize> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find(']') else {
            break;
        };
        if let Ok(n) = rest[..close].trim().parse::<usize>() {
            if seen.insert(n) {
                out.push(n);
            }
        }
        rest = &rest[close..];
    }
    out
}

fn execution_log(run: &PlanRun) -> String {
    let mut out = String::new();
    for step in &run.steps {
        let detail = match step.status {
            StepStatus::Completed => step
                .output
                .as_ref()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            _ => step.error.clone().unwrap_or_default(),
        };
        let detail: String = detail.chars().take(MAX_OUTPUT_CHARS).collect();
        out.push_str(&format!(
            "- {} ({}) {:?}: {}\n",
            step.step_id, step.tool, step.status, detail
        ));
    }
    out
}
