//! Configuration system for Grounded.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment. The resulting [`EngineConfig`] is
//! immutable and handed to each component at construction; nothing in the core
//! reads the environment after startup.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retrieval: RetrievalConfig,
    pub safety: SafetyConfig,
    pub answer: AnswerConfig,
    pub streaming: StreamingConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub corpus: CorpusConfig,
    pub eval: EvalConfig,
    pub gateway: GatewayConfig,
    pub timeouts: TimeoutConfig,
}

/// Hybrid retrieval knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of candidates returned when the caller does not ask for a count.
    pub default_top_k: usize,
    /// Hard ceiling on `top_k`; larger requests are clamped.
    pub max_top_k: usize,
    /// Maximum candidates taken from the lexical pull.
    pub lexical_limit: usize,
    /// Maximum candidates taken from the vector pull.
    pub vector_limit: usize,
    pub lexical_weight: f32,
    pub vector_weight: f32,
    /// Questions longer than this (in characters) are rejected.
    pub max_question_chars: usize,
    /// Length of the text preview carried on each candidate.
    pub preview_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            max_top_k: 50,
            lexical_limit: 50,
            vector_limit: 50,
            lexical_weight: 0.5,
            vector_weight: 0.5,
            max_question_chars: 2000,
            preview_chars: 240,
        }
    }
}

/// Operator-supplied injection pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternConfig {
    pub id: String,
    pub regex: String,
}

/// Prompt-injection scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub enabled: bool,
    /// Additional patterns checked against the normalized question.
    pub extra_patterns: Vec<PatternConfig>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_patterns: Vec::new(),
        }
    }
}

/// Answer composition policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerConfig {
    /// Non-refused answers must carry at least one citation.
    pub citations_required: bool,
    /// Refuse when the best fused score is below `min_fused_score`.
    pub relevance_floor_enabled: bool,
    pub min_fused_score: f32,
    /// A candidate is citable only if its fused score is at least this
    /// fraction of the best candidate's.
    pub min_relative_score: f32,
    /// Content terms a chunk must share with the question to be citable.
    pub min_term_overlap: usize,
    /// Shorter terms are ignored by the overlap check.
    pub min_term_len: usize,
    /// Upper bound on evidence chunks handed to generation and cited.
    pub max_citations: usize,
    /// Citation quotes are truncated to this many characters.
    pub quote_chars: usize,
    /// Never call a generation provider, even when one is configured.
    pub extractive_only: bool,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            citations_required: true,
            relevance_floor_enabled: false,
            min_fused_score: 0.05,
            min_relative_score: 0.5,
            min_term_overlap: 1,
            min_term_len: 3,
            max_citations: 3,
            quote_chars: 280,
            extractive_only: false,
        }
    }
}

/// Streaming protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Strip text previews from the `retrieval` event.
    pub redact_retrieval_text: bool,
    /// Bound of the event channel between coordinator and transport.
    pub channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            redact_retrieval_text: false,
            channel_capacity: 64,
        }
    }
}

/// Which embedding provider backs vector retrieval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Deterministic hashed term-frequency vectors.
    #[default]
    Hash,
    Ollama,
    OpenAi,
    /// No vectors; retrieval is purely lexical.
    Disabled,
}

impl std::fmt::Display for EmbeddingProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingProviderKind::Hash => write!(f, "hash"),
            EmbeddingProviderKind::Ollama => write!(f, "ollama"),
            EmbeddingProviderKind::OpenAi => write!(f, "openai"),
            EmbeddingProviderKind::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    /// Vector length for the hash provider. Remote providers report their own.
    pub dimensions: usize,
    pub base_url: Option<String>,
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hash,
            model: "nomic-embed-text".to_string(),
            dimensions: 256,
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

/// Which generation provider writes answer text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationProviderKind {
    /// No model; answers quote the evidence directly.
    #[default]
    Extractive,
    OpenAi,
    Ollama,
}

impl std::fmt::Display for GenerationProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationProviderKind::Extractive => write!(f, "extractive"),
            GenerationProviderKind::OpenAi => write!(f, "openai"),
            GenerationProviderKind::Ollama => write!(f, "ollama"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub provider: GenerationProviderKind,
    pub model: String,
    pub base_url: Option<String>,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: usize,
    /// Request token-by-token output when the provider supports it.
    pub stream: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProviderKind::Extractive,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.1,
            max_tokens: 512,
            stream: true,
        }
    }
}

/// Chunk index backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Memory,
    Tantivy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// JSONL file with one chunk per line.
    pub path: Option<PathBuf>,
    pub backend: IndexBackend,
    /// BM25 term-frequency saturation (memory backend).
    pub bm25_k1: f32,
    /// BM25 length normalization (memory backend).
    pub bm25_b: f32,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: None,
            backend: IndexBackend::Memory,
            bm25_k1: 1.2,
            bm25_b: 0.75,
        }
    }
}

/// Metric a quality gate checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMetric {
    PassRate,
    HitAtK,
    Mrr,
}

impl std::fmt::Display for GateMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateMetric::PassRate => write!(f, "pass_rate"),
            GateMetric::HitAtK => write!(f, "hit_at_k"),
            GateMetric::Mrr => write!(f, "mrr"),
        }
    }
}

/// A minimum a finished eval run must reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub metric: GateMetric,
    pub min: f64,
    /// A failing blocking gate fails the run.
    #[serde(default = "default_true")]
    pub blocking: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub k: usize,
    /// Cases executed in parallel.
    pub concurrency: usize,
    /// SQLite file for run history. Defaults to `runs.db` in the platform
    /// data directory; in-memory when unset.
    pub runs_db: Option<PathBuf>,
    pub gates: Vec<GateConfig>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            k: 5,
            concurrency: 4,
            runs_db: default_runs_db(),
            gates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

/// Upper bounds for every call that leaves the process or may block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub embedding_ms: u64,
    pub index_ms: u64,
    pub generation_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            embedding_ms: 5_000,
            index_ms: 5_000,
            generation_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.retrieval;
        if r.max_top_k == 0 {
            return Err(invalid("retrieval.max_top_k must be at least 1"));
        }
        if r.default_top_k > r.max_top_k {
            return Err(invalid(format!(
                "retrieval.default_top_k ({}) exceeds retrieval.max_top_k ({})",
                r.default_top_k, r.max_top_k
            )));
        }
        for (name, weight) in [
            ("lexical_weight", r.lexical_weight),
            ("vector_weight", r.vector_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(invalid(format!(
                    "retrieval.{name} must be a finite, non-negative number"
                )));
            }
        }
        if r.max_question_chars == 0 {
            return Err(invalid("retrieval.max_question_chars must be at least 1"));
        }
        let a = &self.answer;
        if a.max_citations == 0 {
            return Err(invalid("answer.max_citations must be at least 1"));
        }
        if a.min_term_overlap == 0 {
            return Err(invalid("answer.min_term_overlap must be at least 1"));
        }
        if !(0.0..=1.0).contains(&a.min_relative_score) {
            return Err(invalid("answer.min_relative_score must be between 0 and 1"));
        }
        if self.streaming.channel_capacity == 0 {
            return Err(invalid("streaming.channel_capacity must be at least 1"));
        }
        if self.embedding.provider == EmbeddingProviderKind::Hash && self.embedding.dimensions == 0
        {
            return Err(invalid("embedding.dimensions must be at least 1"));
        }
        let t = &self.timeouts;
        if t.embedding_ms == 0 || t.index_ms == 0 || t.generation_ms == 0 {
            return Err(invalid("timeouts must be greater than zero"));
        }
        if self.eval.k == 0 || self.eval.concurrency == 0 {
            return Err(invalid("eval.k and eval.concurrency must be at least 1"));
        }
        Ok(())
    }

    /// Render as TOML, e.g. for `config show`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// Load configuration with layered merging.
///
/// Priority (highest first):
/// 1. Environment variables (prefixed with `GROUNDED_`, `__` separates sections)
/// 2. Explicit config file (passed as argument)
/// 3. User config (`~/.config/grounded/config.toml`)
/// 4. Built-in defaults
pub fn load_config(explicit: Option<&Path>) -> Result<EngineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(path) = explicit {
        figment = figment.merge(Toml::file(path));
    }

    // GROUNDED_RETRIEVAL__MAX_TOP_K, GROUNDED_ANSWER__CITATIONS_REQUIRED, ...
    figment = figment.merge(Env::prefixed("GROUNDED_").split("__"));

    figment.extract().map_err(Box::new)
}

/// Default run history file under the platform data directory.
pub fn default_runs_db() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "grounded", "grounded")
        .map(|dirs| dirs.data_dir().join("runs.db"))
}

/// Location of the per-user config file, if the platform has one.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "grounded", "grounded")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
