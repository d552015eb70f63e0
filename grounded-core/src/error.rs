//! Error types for the Grounded engine.
//!
//! Everything below the answer composer returns one of these rich errors.
//! The composer is where they are folded into the closed refusal taxonomy,
//! so none of the messages here ever reach an API client verbatim.

use std::path::PathBuf;

/// Top-level error type for the Grounded core library.
#[derive(Debug, thiserror::Error)]
pub enum GroundedError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Input rejected before it reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Question must not be empty")]
    EmptyQuestion,

    #[error("Question is {len} characters long, the limit is {max}")]
    QuestionTooLong { len: usize, max: usize },
}

/// Errors from the chunk index collaborator.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Chunk already indexed: {chunk_id}")]
    DuplicateChunk { chunk_id: String },

    #[error("Vector dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index backend failure: {message}")]
    Backend { message: String },

    #[error("Corpus line {line}: {message}")]
    Corpus { line: usize, message: String },
}

impl From<tantivy::TantivyError> for IndexError {
    fn from(err: tantivy::TantivyError) -> Self {
        IndexError::Backend {
            message: err.to_string(),
        }
    }
}

/// Errors from embedding providers.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embeddings are disabled")]
    Disabled,

    #[error("Embedding request failed: {message}")]
    Request { message: String },

    #[error("Embedding response parse error: {message}")]
    ResponseParse { message: String },
}

/// Errors from generation providers.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generation request failed: {message}")]
    Request { message: String },

    #[error("Generation provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Generation response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Generation provider returned an empty answer")]
    EmptyResponse,

    #[error("Generation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Generation was cancelled")]
    Cancelled,
}

/// Errors raised while pulling and fusing candidates.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Lexical or vector pull failed: {0}")]
    Index(#[from] IndexError),

    #[error("Query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("{stage} stage timed out after {timeout_ms}ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },

    #[error("Query vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Problems with an eval dataset. Always fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatasetError {
    #[error("Malformed dataset: {message}")]
    Malformed { message: String },

    #[error("Case #{index}: {message}")]
    MalformedCase { index: usize, message: String },

    #[error("Duplicate case id '{id}' (cases #{first} and #{second})")]
    DuplicateId {
        id: String,
        first: usize,
        second: usize,
    },

    #[error("Case #{index}: missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("Case '{id}': must_cite needs at least one doc id or chunk id")]
    EmptyExpectation { id: String },

    #[error("Dataset contains no cases")]
    Empty,

    #[error("k must be at least 1")]
    InvalidK,
}

/// Errors from the eval run store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Stored run could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run {run_id} already recorded")]
    AlreadyExists { run_id: String },

    #[error("Run store task failed: {message}")]
    Task { message: String },
}

/// Errors from the streaming coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Event '{event}' is not allowed in state {state}")]
    OutOfOrder {
        state: &'static str,
        event: &'static str,
    },

    #[error("Stream consumer disconnected")]
    Closed,
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Safety pattern '{id}' does not compile: {message}")]
    InvalidPattern { id: String, message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `GroundedError`.
pub type Result<T> = std::result::Result<T, GroundedError>;
