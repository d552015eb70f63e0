//! Query engine: validation, safety scan, retrieval and composition wired together.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::composer::AnswerComposer;
use crate::config::EngineConfig;
use crate::embeddings::{Embedder, create_embedder};
use crate::error::{ConfigError, Result, ValidationError};
use crate::generation::{GenerationProvider, create_generator};
use crate::index::{ChunkIndex, build_index, load_corpus};
use crate::retriever::{HybridRetriever, RetrievalDiagnostics, RetrievalParams};
use crate::safety::{SafetyScanner, SafetyVerdict};
use crate::types::{AnswerResult, RetrievalCandidate};

/// Body of a synchronous or streaming query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Attach retrieval counts and timings to the response.
    #[serde(default)]
    pub diagnostics: bool,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            top_k: None,
            diagnostics: false,
        }
    }
}

/// An [`AnswerResult`] with optional diagnostics, flattened on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(flatten)]
    pub result: AnswerResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<RetrievalDiagnostics>,
}

/// Everything one question produced.
#[derive(Debug, Clone)]
pub struct AnswerOutcome {
    pub result: AnswerResult,
    pub verdict: SafetyVerdict,
    /// Ranked candidates. Empty when retrieval was skipped or failed.
    pub candidates: Vec<RetrievalCandidate>,
    pub diagnostics: Option<RetrievalDiagnostics>,
}

/// Stateless per request; cheap to clone and share across tasks.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    config: Arc<EngineConfig>,
    retriever: HybridRetriever,
    scanner: SafetyScanner,
    composer: AnswerComposer,
}

impl QueryEngine {
    /// Assemble an engine from already-built parts.
    pub fn new(
        config: EngineConfig,
        index: Arc<dyn ChunkIndex>,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn GenerationProvider>>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let scanner = SafetyScanner::new(&config.safety)?;
        let retriever = HybridRetriever::new(
            index,
            embedder,
            config.retrieval.clone(),
            config.timeouts.clone(),
        );
        let composer = AnswerComposer::new(
            config.answer.clone(),
            generator,
            config.timeouts.generation_ms,
        );
        Ok(Self {
            config: Arc::new(config),
            retriever,
            scanner,
            composer,
        })
    }

    /// Build providers and the index from configuration.
    ///
    /// Without `corpus.path` the index is empty and every question is refused
    /// for lack of evidence.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let embedder = create_embedder(&config.embedding)?;
        let chunks = match &config.corpus.path {
            Some(path) => load_corpus(path)?,
            None => Vec::new(),
        };
        let index = build_index(&config.corpus, chunks, embedder.as_ref()).await?;
        let generator = create_generator(&config.generation)?;
        Ok(Self::new(config, index, embedder, generator)?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn retriever(&self) -> &HybridRetriever {
        &self.retriever
    }

    pub fn scanner(&self) -> &SafetyScanner {
        &self.scanner
    }

    pub fn composer(&self) -> &AnswerComposer {
        &self.composer
    }

    /// Retrieval parameters for a request, defaulting `top_k` from config.
    pub fn params(&self, top_k: Option<usize>) -> RetrievalParams {
        let params = RetrievalParams::from_config(&self.config.retrieval);
        match top_k {
            Some(top_k) => params.with_top_k(top_k),
            None => params,
        }
    }

    /// Reject questions before any work is done.
    pub fn validate(&self, question: &str) -> std::result::Result<(), ValidationError> {
        if question.trim().is_empty() {
            return Err(ValidationError::EmptyQuestion);
        }
        let len = question.chars().count();
        let max = self.config.retrieval.max_question_chars;
        if len > max {
            return Err(ValidationError::QuestionTooLong { len, max });
        }
        Ok(())
    }

    /// Scan, retrieve and compose. Never fails: problems become refusals.
    ///
    /// Flagged questions skip retrieval entirely.
    pub async fn answer(&self, question: &str, params: &RetrievalParams) -> AnswerOutcome {
        let verdict = self.scanner.scan(question);
        if verdict.is_injection {
            let result = self.composer.compose(question, &[], &verdict).await;
            return AnswerOutcome {
                result,
                verdict,
                candidates: Vec::new(),
                diagnostics: None,
            };
        }

        let (candidates, diagnostics) =
            match self.retriever.retrieve_with_diagnostics(question, params).await {
                Ok(retrieved) => retrieved,
                Err(err) => {
                    return AnswerOutcome {
                        result: self.composer.from_failure(question, &err),
                        verdict,
                        candidates: Vec::new(),
                        diagnostics: None,
                    };
                }
            };

        let result = self.composer.compose(question, &candidates, &verdict).await;
        info!(
            refused = result.refused,
            reason = result.refusal_reason.map(|r| r.as_str()).unwrap_or("none"),
            candidates = candidates.len(),
            citations = result.citations.len(),
            total_ms = diagnostics.total_ms,
            "Query answered"
        );
        AnswerOutcome {
            result,
            verdict,
            candidates,
            diagnostics: Some(diagnostics),
        }
    }

    /// Validate and answer a request.
    pub async fn query(
        &self,
        request: QueryRequest,
    ) -> std::result::Result<QueryResponse, ValidationError> {
        self.validate(&request.question)?;
        let params = self.params(request.top_k);
        let outcome = self.answer(&request.question, &params).await;
        Ok(QueryResponse {
            result: outcome.result,
            diagnostics: outcome.diagnostics.filter(|_| request.diagnostics),
        })
    }
}
