//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults, so a
//! minimal config only names the database path. `${VAR}` references in
//! provider API keys and tool-server environment values are expanded from
//! the process environment at load time.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ChunkMethod;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default)]
    pub method: ChunkMethod,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            method: ChunkMethod::default(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_vector_dim")]
    pub vector_dim: usize,
    #[serde(default = "default_top_k")]
    pub top_k_default: usize,
    #[serde(default = "default_rrf_constant")]
    pub rrf_constant: f64,
    /// Per-shard candidate depth before fusion.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            vector_dim: default_vector_dim(),
            top_k_default: default_top_k(),
            rrf_constant: default_rrf_constant(),
            candidate_k: default_candidate_k(),
        }
    }
}

fn default_vector_dim() -> usize {
    256
}
fn default_top_k() -> usize {
    8
}
fn default_rrf_constant() -> f64 {
    60.0
}
fn default_candidate_k() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Hash,
    Provider,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,
    /// Name of the `[[providers]]` entry used when `backend = "provider"`.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hash,
            provider: None,
            batch_size: default_batch_size(),
            max_retries: default_embed_retries(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key, read when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub model: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_provider_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The effective API key, if any.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok())
        })
    }
}

fn default_provider_concurrency() -> usize {
    4
}
fn default_provider_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_true")]
    pub probe: bool,
    #[serde(default = "default_pool_retries")]
    pub max_retries: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            probe: true,
            max_retries: default_pool_retries(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_pool_retries() -> u32 {
    2
}
fn default_acquire_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_true")]
    pub restart_on_failure: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_server_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_max_restarts() -> u32 {
    5
}
fn default_server_concurrency() -> usize {
    8
}
fn default_call_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_backoff_base")]
    pub restart_backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap")]
    pub restart_backoff_cap_ms: u64,
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            restart_backoff_base_ms: default_backoff_base(),
            restart_backoff_cap_ms: default_backoff_cap(),
            restart_window_secs: default_restart_window(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_backoff_base() -> u64 {
    1000
}
fn default_backoff_cap() -> u64 {
    30_000
}
fn default_restart_window() -> u64 {
    300
}
fn default_shutdown_grace() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_calls_per_round")]
    pub max_calls_per_round: usize,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_calls_per_round: default_calls_per_round(),
            max_rounds: default_max_rounds(),
        }
    }
}

fn default_calls_per_round() -> usize {
    10
}
fn default_max_rounds() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_replan_budget")]
    pub replan_budget: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            step_timeout_secs: default_step_timeout(),
            replan_budget: default_replan_budget(),
        }
    }
}

fn default_parallelism() -> usize {
    8
}
fn default_step_timeout() -> u64 {
    120
}
fn default_replan_budget() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_max_notes")]
    pub max_notes: usize,
    #[serde(default = "default_true")]
    pub auto_store: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_score: default_min_score(),
            max_notes: default_max_notes(),
            auto_store: true,
        }
    }
}

fn default_min_score() -> f32 {
    0.7
}
fn default_max_notes() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// The provider entry backing `backend = "provider"` embeddings.
    ///
    /// Falls back to the first entry that declares an `embedding_model`.
    pub fn embedding_provider(&self) -> Option<&ProviderConfig> {
        match &self.embedding.provider {
            Some(name) => self.provider(name),
            None => self
                .providers
                .iter()
                .find(|p| p.embedding_model.is_some()),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse, expand and validate a config from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    for provider in &mut config.providers {
        if let Some(key) = &provider.api_key {
            provider.api_key = Some(expand_env(key)?);
        }
    }
    for server in &mut config.tool_servers {
        for value in server.env.values_mut() {
            *value = expand_env(value)?;
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!(
            "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.overlap,
            config.chunking.chunk_size
        );
    }

    if config.index.vector_dim == 0 {
        anyhow::bail!("index.vector_dim must be > 0");
    }
    if config.index.top_k_default == 0 {
        anyhow::bail!("index.top_k_default must be >= 1");
    }
    if config.index.rrf_constant <= 0.0 {
        anyhow::bail!("index.rrf_constant must be > 0");
    }

    if !(0.0..=1.0).contains(&config.memory.min_score) {
        anyhow::bail!("memory.min_score must be in [0.0, 1.0]");
    }

    let mut names = HashSet::new();
    for provider in &config.providers {
        if !names.insert(provider.name.as_str()) {
            anyhow::bail!("Duplicate provider name: '{}'", provider.name);
        }
        if provider.max_concurrency == 0 {
            anyhow::bail!("providers.{}.max_concurrency must be > 0", provider.name);
        }
    }

    let mut names = HashSet::new();
    for server in &config.tool_servers {
        if !names.insert(server.name.as_str()) {
            anyhow::bail!("Duplicate tool server name: '{}'", server.name);
        }
        if server.name.contains('_') {
            anyhow::bail!(
                "Tool server name '{}' must not contain '_' (used as the namespace separator)",
                server.name
            );
        }
        if server.max_concurrency == 0 {
            anyhow::bail!("tool_servers.{}.max_concurrency must be > 0", server.name);
        }
    }

    if config.embedding.backend == EmbeddingBackend::Provider {
        match config.embedding_provider() {
            Some(p) if p.embedding_model.is_some() => {}
            Some(p) => anyhow::bail!(
                "Provider '{}' has no embedding_model but is used for embeddings",
                p.name
            ),
            None => anyhow::bail!(
                "embedding.backend = \"provider\" requires a provider entry with embedding_model"
            ),
        }
    }

    Ok(())
}

/// Expand `${VAR}` references from the process environment.
fn expand_env(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .with_context(|| format!("Unterminated ${{...}} in '{}'", value))?;
        let var = &after[..end];
        let resolved = std::env::var(var)
            .with_context(|| format!("Environment variable '{}' is not set", var))?;
        out.push_str(&resolved);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
