//! # Hybrid Retriever
//!
//! Fuses a lexical (BM25) pull and a vector (cosine) pull into one ranked list.
//!
//! Lexical scores are divided by the best lexical score of the pull, cosine
//! scores are clamped to `[0, 1]`, and the two are blended with weights that
//! always sum to one. A chunk found by only one pull gets `0` for the other
//! component. The final order is a total order:
//! `(fused desc, lexical desc, vector desc, doc_id asc, chunk_id asc)`, so an
//! unchanged index always yields the same list for the same query.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{RetrievalConfig, TimeoutConfig};
use crate::embeddings::Embedder;
use crate::error::RetrievalError;
use crate::index::{ChunkIndex, LexicalHit, VectorHit};
use crate::text::truncate_chars;
use crate::types::RetrievalCandidate;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Knobs for a single retrieval call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub lexical_limit: usize,
    pub vector_limit: usize,
    pub lexical_weight: f32,
    pub vector_weight: f32,
}

impl RetrievalParams {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.default_top_k,
            lexical_limit: config.lexical_limit,
            vector_limit: config.vector_limit,
            lexical_weight: config.lexical_weight,
            vector_weight: config.vector_weight,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_weights(mut self, lexical: f32, vector: f32) -> Self {
        self.lexical_weight = lexical;
        self.vector_weight = vector;
        self
    }
}

/// Weights actually used for fusion. Always sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub lexical: f32,
    pub vector: f32,
}

impl FusionWeights {
    pub const LEXICAL_ONLY: FusionWeights = FusionWeights {
        lexical: 1.0,
        vector: 0.0,
    };

    /// Rescale caller weights proportionally.
    ///
    /// Negative and non-finite weights count as zero; if nothing is left, or
    /// vector retrieval is unavailable, the result is lexical only.
    pub fn normalize(lexical: f32, vector: f32, vector_enabled: bool) -> Self {
        if !vector_enabled {
            return Self::LEXICAL_ONLY;
        }
        let clean = |w: f32| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let (lexical, vector) = (clean(lexical), clean(vector));
        let sum = lexical + vector;
        if sum <= 0.0 || !sum.is_finite() {
            return Self::LEXICAL_ONLY;
        }
        Self {
            lexical: lexical / sum,
            vector: vector / sum,
        }
    }
}

/// Counts and timings of one retrieval call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalDiagnostics {
    pub top_k: usize,
    pub vector_enabled: bool,
    pub weights: Option<FusionWeights>,
    pub lexical_candidates: usize,
    pub vector_candidates: usize,
    pub merged_candidates: usize,
    pub returned: usize,
    pub embedding_ms: u64,
    pub lexical_ms: u64,
    pub vector_ms: u64,
    pub fusion_ms: u64,
    pub total_ms: u64,
}

// ---------------------------------------------------------------------------
// Retriever
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Merged {
    doc_id: String,
    idx: u32,
    lexical: f32,
    vector: f32,
    text: Option<String>,
}

/// Hybrid lexical + vector retriever over a read-only [`ChunkIndex`].
#[derive(Clone)]
pub struct HybridRetriever {
    index: Arc<dyn ChunkIndex>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
    timeouts: TimeoutConfig,
}

impl std::fmt::Debug for HybridRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridRetriever")
            .field("backend", &self.index.backend_name())
            .field("embedder", &self.embedder.provider_name())
            .field("config", &self.config)
            .finish()
    }
}

impl HybridRetriever {
    pub fn new(
        index: Arc<dyn ChunkIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            config,
            timeouts,
        }
    }

    pub fn index(&self) -> &Arc<dyn ChunkIndex> {
        &self.index
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Vector retrieval runs only when the embedder is on and the index has vectors.
    pub fn vector_enabled(&self) -> bool {
        self.embedder.is_enabled() && self.index.vector_dimensions().is_some()
    }

    /// Ranked candidates, best first, at most `top_k` (clamped to `max_top_k`).
    pub async fn retrieve(
        &self,
        query: &str,
        params: &RetrievalParams,
    ) -> Result<Vec<RetrievalCandidate>, RetrievalError> {
        self.retrieve_with_diagnostics(query, params)
            .await
            .map(|(candidates, _)| candidates)
    }

    /// Same ranking as [`retrieve`](Self::retrieve), plus counts and latencies.
    pub async fn retrieve_with_diagnostics(
        &self,
        query: &str,
        params: &RetrievalParams,
    ) -> Result<(Vec<RetrievalCandidate>, RetrievalDiagnostics), RetrievalError> {
        let started = Instant::now();
        let top_k = params.top_k.min(self.config.max_top_k);
        let vector_enabled = self.vector_enabled();
        let mut diagnostics = RetrievalDiagnostics {
            top_k,
            vector_enabled,
            ..RetrievalDiagnostics::default()
        };
        if top_k == 0 {
            return Ok((Vec::new(), diagnostics));
        }

        let weights =
            FusionWeights::normalize(params.lexical_weight, params.vector_weight, vector_enabled);
        diagnostics.weights = Some(weights);

        // Either pull failing abandons the other.
        let ((lexical_hits, lexical_ms), (vector_hits, embedding_ms, vector_ms)) = tokio::try_join!(
            self.lexical_pull(query, params.lexical_limit),
            self.vector_pull(query, params.vector_limit, vector_enabled),
        )?;
        diagnostics.lexical_candidates = lexical_hits.len();
        diagnostics.vector_candidates = vector_hits.len();
        diagnostics.lexical_ms = lexical_ms;
        diagnostics.embedding_ms = embedding_ms;
        diagnostics.vector_ms = vector_ms;

        let fusion_started = Instant::now();
        let mut candidates = fuse(lexical_hits, vector_hits, weights);
        diagnostics.merged_candidates = candidates.len();
        candidates.truncate(top_k);
        diagnostics.fusion_ms = elapsed_ms(fusion_started);

        let mut candidates = self.hydrate(candidates).await?;
        for candidate in &mut candidates {
            candidate.text_preview = truncate_chars(&candidate.text, self.config.preview_chars);
        }

        diagnostics.returned = candidates.len();
        diagnostics.total_ms = elapsed_ms(started);
        debug!(
            top_k,
            vector_enabled,
            lexical = diagnostics.lexical_candidates,
            vector = diagnostics.vector_candidates,
            merged = diagnostics.merged_candidates,
            returned = diagnostics.returned,
            total_ms = diagnostics.total_ms,
            "Hybrid retrieval finished"
        );
        Ok((candidates, diagnostics))
    }

    async fn lexical_pull(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<(Vec<LexicalHit>, u64), RetrievalError> {
        if limit == 0 {
            return Ok((Vec::new(), 0));
        }
        let started = Instant::now();
        let hits = bounded(
            "lexical",
            self.timeouts.index_ms,
            self.index.lexical_search(query, limit),
        )
        .await?;
        Ok((hits, elapsed_ms(started)))
    }

    async fn vector_pull(
        &self,
        query: &str,
        limit: usize,
        enabled: bool,
    ) -> Result<(Vec<VectorHit>, u64, u64), RetrievalError> {
        if !enabled || limit == 0 {
            return Ok((Vec::new(), 0, 0));
        }

        let started = Instant::now();
        let query_vec = bounded(
            "embedding",
            self.timeouts.embedding_ms,
            self.embedder.embed(query),
        )
        .await?;
        let embedding_ms = elapsed_ms(started);

        if let Some(expected) = self.index.vector_dimensions()
            && expected != query_vec.len()
        {
            return Err(RetrievalError::DimensionMismatch {
                expected,
                actual: query_vec.len(),
            });
        }

        let started = Instant::now();
        let hits = bounded(
            "vector",
            self.timeouts.index_ms,
            self.index.vector_search(&query_vec, limit),
        )
        .await?;
        Ok((hits, embedding_ms, elapsed_ms(started)))
    }

    /// Fill in text for candidates that only the vector pull found.
    async fn hydrate(
        &self,
        mut candidates: Vec<(RetrievalCandidate, bool)>,
    ) -> Result<Vec<RetrievalCandidate>, RetrievalError> {
        let missing: Vec<String> = candidates
            .iter()
            .filter(|(_, has_text)| !has_text)
            .map(|(c, _)| c.chunk_id.clone())
            .collect();
        if !missing.is_empty() {
            let chunks = bounded(
                "hydrate",
                self.timeouts.index_ms,
                self.index.get_chunks(&missing),
            )
            .await?;
            let texts: BTreeMap<String, String> = chunks
                .into_iter()
                .map(|chunk| (chunk.chunk_id, chunk.text))
                .collect();
            for (candidate, has_text) in &mut candidates {
                if !*has_text && let Some(text) = texts.get(&candidate.chunk_id) {
                    candidate.text = text.clone();
                }
            }
        }
        Ok(candidates.into_iter().map(|(c, _)| c).collect())
    }
}

/// Merge both pulls by chunk id, score and sort. The flag marks candidates
/// whose text is already known.
fn fuse(
    lexical: Vec<LexicalHit>,
    vector: Vec<VectorHit>,
    weights: FusionWeights,
) -> Vec<(RetrievalCandidate, bool)> {
    let max_lexical = lexical
        .iter()
        .map(|h| h.score)
        .filter(|s| s.is_finite())
        .fold(0.0f32, f32::max);

    let mut merged: BTreeMap<String, Merged> = BTreeMap::new();
    for hit in lexical {
        let entry = merged.entry(hit.chunk_id).or_default();
        entry.doc_id = hit.doc_id;
        entry.idx = hit.idx;
        entry.lexical = hit.score.max(0.0);
        entry.text = Some(hit.text);
    }
    for hit in vector {
        let entry = merged.entry(hit.chunk_id).or_insert_with(|| Merged {
            doc_id: hit.doc_id,
            idx: hit.idx,
            ..Merged::default()
        });
        entry.vector = hit.score;
    }

    let mut candidates: Vec<(RetrievalCandidate, bool)> = merged
        .into_iter()
        .map(|(chunk_id, m)| {
            let norm_lexical = if max_lexical > 0.0 {
                (m.lexical / max_lexical).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let norm_vector = if m.vector.is_finite() {
                m.vector.clamp(0.0, 1.0)
            } else {
                0.0
            };
            let fused = weights.lexical * norm_lexical + weights.vector * norm_vector;
            let has_text = m.text.is_some();
            (
                RetrievalCandidate {
                    chunk_id,
                    doc_id: m.doc_id,
                    idx: m.idx,
                    lexical_score: m.lexical,
                    vector_score: m.vector,
                    fused_score: fused,
                    text_preview: String::new(),
                    text: m.text.unwrap_or_default(),
                },
                has_text,
            )
        })
        .collect();

    candidates.sort_by(|(a, _), (b, _)| rank_order(a, b));
    candidates
}

/// `(fused desc, lexical desc, vector desc, doc_id asc, chunk_id asc)`.
pub fn rank_order(a: &RetrievalCandidate, b: &RetrievalCandidate) -> Ordering {
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| b.lexical_score.total_cmp(&a.lexical_score))
        .then_with(|| b.vector_score.total_cmp(&a.vector_score))
        .then_with(|| a.doc_id.cmp(&b.doc_id))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

async fn bounded<T, E>(
    stage: &'static str,
    timeout_ms: u64,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, RetrievalError>
where
    RetrievalError: From<E>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result.map_err(RetrievalError::from),
        Err(_) => Err(RetrievalError::Timeout { stage, timeout_ms }),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{DisabledEmbedder, HashEmbedder};
    use crate::error::IndexError;
    use crate::index::MemoryChunkIndex;
    use crate::types::Chunk;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    fn lexical_hit(chunk_id: &str, doc_id: &str, score: f32) -> LexicalHit {
        LexicalHit {
            chunk_id: chunk_id.into(),
            doc_id: doc_id.into(),
            idx: 0,
            score,
            text: format!("text of {chunk_id}"),
        }
    }

    fn vector_hit(chunk_id: &str, doc_id: &str, score: f32) -> VectorHit {
        VectorHit {
            chunk_id: chunk_id.into(),
            doc_id: doc_id.into(),
            idx: 0,
            score,
        }
    }

    async fn retriever(embedder: Arc<dyn Embedder>) -> HybridRetriever {
        let mut index = MemoryChunkIndex::default();
        for (doc, idx, text) in [
            ("refunds", 0, "Refunds are issued within 30 days of purchase."),
            ("refunds", 1, "Refunds for digital goods are not available."),
            ("shipping", 0, "Orders ship within two business days."),
            ("warranty", 0, "The warranty covers manufacturing defects for one year."),
        ] {
            let chunk = Chunk::new(doc, idx, text);
            let vector = if embedder.is_enabled() {
                Some(embedder.embed(&chunk.text).await.unwrap())
            } else {
                None
            };
            index.add_chunk(chunk, vector).unwrap();
        }
        HybridRetriever::new(
            Arc::new(index),
            embedder,
            RetrievalConfig::default(),
            TimeoutConfig::default(),
        )
    }

    #[test]
    fn test_weights_normalize_to_one() {
        let w = FusionWeights::normalize(2.0, 2.0, true);
        assert_eq!(w, FusionWeights::normalize(1.0, 1.0, true));
        assert!((w.lexical - 0.5).abs() < f32::EPSILON);

        let w = FusionWeights::normalize(3.0, 1.0, true);
        assert!((w.lexical - 0.75).abs() < 1e-6);
        assert!((w.vector - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_weights_degenerate_inputs() {
        assert_eq!(
            FusionWeights::normalize(0.0, 0.0, true),
            FusionWeights::LEXICAL_ONLY
        );
        assert_eq!(
            FusionWeights::normalize(-1.0, f32::NAN, true),
            FusionWeights::LEXICAL_ONLY
        );
        assert_eq!(
            FusionWeights::normalize(0.1, 5.0, false),
            FusionWeights::LEXICAL_ONLY
        );
        let w = FusionWeights::normalize(-3.0, 2.0, true);
        assert_eq!(w.lexical, 0.0);
        assert_eq!(w.vector, 1.0);
    }

    #[test]
    fn test_fuse_single_pull_candidates_get_zero_component() {
        let weights = FusionWeights::normalize(1.0, 1.0, true);
        let fused = fuse(
            vec![lexical_hit("a#0", "a", 4.0), lexical_hit("b#0", "b", 2.0)],
            vec![vector_hit("c#0", "c", 0.8), vector_hit("a#0", "a", 0.5)],
            weights,
        );
        let by_id: BTreeMap<&str, &RetrievalCandidate> = fused
            .iter()
            .map(|(c, _)| (c.chunk_id.as_str(), c))
            .collect();

        assert!((by_id["a#0"].fused_score - (0.5 * 1.0 + 0.5 * 0.5)).abs() < 1e-6);
        assert!((by_id["b#0"].fused_score - 0.25).abs() < 1e-6);
        assert_eq!(by_id["b#0"].vector_score, 0.0);
        assert!((by_id["c#0"].fused_score - 0.4).abs() < 1e-6);
        assert_eq!(by_id["c#0"].lexical_score, 0.0);

        let order: Vec<&str> = fused.iter().map(|(c, _)| c.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["a#0", "c#0", "b#0"]);
        let has_text: Vec<bool> = fused.iter().map(|(_, t)| *t).collect();
        assert_eq!(has_text, vec![true, false, true]);
    }

    #[test]
    fn test_fuse_negative_cosine_clamped() {
        let weights = FusionWeights::normalize(0.0, 1.0, true);
        let fused = fuse(Vec::new(), vec![vector_hit("a#0", "a", -0.7)], weights);
        assert_eq!(fused[0].0.fused_score, 0.0);
        assert_eq!(fused[0].0.vector_score, -0.7);
    }

    #[test]
    fn test_tie_break_order() {
        let weights = FusionWeights::LEXICAL_ONLY;
        let fused = fuse(
            vec![
                lexical_hit("z#0", "b", 1.0),
                lexical_hit("y#0", "a", 1.0),
                lexical_hit("x#0", "a", 1.0),
            ],
            Vec::new(),
            weights,
        );
        let order: Vec<&str> = fused.iter().map(|(c, _)| c.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["x#0", "y#0", "z#0"]);
    }

    #[tokio::test]
    async fn test_retrieve_is_deterministic() {
        let retriever = retriever(Arc::new(HashEmbedder::new(64))).await;
        let params = RetrievalParams::from_config(retriever.config());
        let first = retriever.retrieve("refunds within days", &params).await.unwrap();
        let second = retriever.retrieve("refunds within days", &params).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
        assert_eq!(first[0].doc_id, "refunds");
    }

    #[tokio::test]
    async fn test_top_k_zero_and_clamp() {
        let retriever = retriever(Arc::new(HashEmbedder::new(64))).await;
        let params = RetrievalParams::from_config(retriever.config());

        let none = retriever
            .retrieve("refunds", &params.with_top_k(0))
            .await
            .unwrap();
        assert!(none.is_empty());

        let (all, diagnostics) = retriever
            .retrieve_with_diagnostics("refunds", &params.with_top_k(10_000))
            .await
            .unwrap();
        assert_eq!(diagnostics.top_k, retriever.config().max_top_k);
        assert!(all.len() <= 4);
    }

    #[tokio::test]
    async fn test_vector_only_candidates_are_hydrated() {
        let retriever = retriever(Arc::new(HashEmbedder::new(64))).await;
        let params = RetrievalParams::from_config(retriever.config()).with_top_k(4);
        let candidates = retriever.retrieve("refunds", &params).await.unwrap();
        assert_eq!(candidates.len(), 4);
        assert!(candidates.iter().all(|c| !c.text.is_empty()));
        assert!(candidates.iter().all(|c| !c.text_preview.is_empty()));
    }

    #[tokio::test]
    async fn test_disabled_embedder_is_pure_lexical() {
        let retriever = retriever(Arc::new(DisabledEmbedder)).await;
        let params = RetrievalParams::from_config(retriever.config());
        let (candidates, diagnostics) = retriever
            .retrieve_with_diagnostics("refunds purchase", &params)
            .await
            .unwrap();
        assert!(!diagnostics.vector_enabled);
        assert_eq!(diagnostics.weights, Some(FusionWeights::LEXICAL_ONLY));
        assert_eq!(diagnostics.vector_candidates, 0);
        assert_eq!(candidates[0].chunk_id, "refunds#0");
        assert_eq!(candidates[0].fused_score, 1.0);
        assert!(candidates.iter().all(|c| c.vector_score == 0.0));
    }

    #[tokio::test]
    async fn test_diagnostics_do_not_change_ranking() {
        let retriever = retriever(Arc::new(HashEmbedder::new(64))).await;
        let params = RetrievalParams::from_config(retriever.config());
        let plain = retriever.retrieve("warranty defects", &params).await.unwrap();
        let (with_diag, diagnostics) = retriever
            .retrieve_with_diagnostics("warranty defects", &params)
            .await
            .unwrap();
        assert_eq!(plain, with_diag);
        assert_eq!(diagnostics.returned, plain.len());
        assert!(diagnostics.merged_candidates >= plain.len());
    }

    struct SlowIndex;

    #[async_trait]
    impl ChunkIndex for SlowIndex {
        async fn lexical_search(
            &self,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<LexicalHit>, IndexError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }

        async fn vector_search(
            &self,
            _query_vec: &[f32],
            _limit: usize,
        ) -> Result<Vec<VectorHit>, IndexError> {
            Ok(Vec::new())
        }

        async fn get_chunks(&self, _ids: &[String]) -> Result<Vec<Chunk>, IndexError> {
            Ok(Vec::new())
        }

        fn chunk_count(&self) -> usize {
            1
        }

        fn vector_dimensions(&self) -> Option<usize> {
            Some(8)
        }

        fn backend_name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_lexical_timeout_is_an_error() {
        let retriever = HybridRetriever::new(
            Arc::new(SlowIndex),
            Arc::new(DisabledEmbedder),
            RetrievalConfig::default(),
            TimeoutConfig {
                index_ms: 20,
                ..TimeoutConfig::default()
            },
        );
        let params = RetrievalParams::from_config(retriever.config());
        let err = retriever.retrieve("anything", &params).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::Timeout {
                stage: "lexical",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch_is_an_error() {
        let retriever = HybridRetriever::new(
            Arc::new(SlowIndex),
            Arc::new(HashEmbedder::new(4)),
            RetrievalConfig::default(),
            TimeoutConfig::default(),
        );
        let params = RetrievalParams::from_config(retriever.config()).with_top_k(1);
        let err = retriever.retrieve("anything", &params).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::DimensionMismatch {
                expected: 8,
                actual: 4
            }
        ));
    }
}
