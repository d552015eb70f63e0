//! # Grounded Core
//!
//! Core library for Grounded, a citation-grounded question answering engine.
//! Provides hybrid lexical + vector retrieval, the prompt-injection scanner,
//! the answer composer with its closed refusal taxonomy, the streaming
//! protocol, the eval harness and the HTTP gateway.

pub mod composer;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod eval;
pub mod gateway;
pub mod generation;
pub mod index;
pub mod retriever;
pub mod safety;
pub mod streaming;
pub mod text;
pub mod types;

// Re-export commonly used types at the crate root.
pub use composer::AnswerComposer;
pub use config::{EngineConfig, load_config};
pub use embeddings::{Embedder, HashEmbedder, create_embedder};
pub use engine::{AnswerOutcome, QueryEngine, QueryRequest, QueryResponse};
pub use error::{GroundedError, Result};
pub use eval::{Dataset, EvalCase, EvalHarness, EvalRun, InMemoryRunStore, RunStore, SqliteRunStore};
pub use generation::{GenerationProvider, MockGenerator, create_generator};
pub use index::{ChunkIndex, MemoryChunkIndex, TantivyChunkIndex, build_index, load_corpus};
pub use retriever::{HybridRetriever, RetrievalDiagnostics, RetrievalParams};
pub use safety::{SafetyScanner, SafetyVerdict};
pub use streaming::{StreamCoordinator, StreamEvent, StreamState};
pub use types::{AnswerResult, Chunk, Citation, RefusalReason, RetrievalCandidate};
