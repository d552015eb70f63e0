//! Answer composition: turns ranked candidates into a cited answer or a refusal.
//!
//! The composer is the single place where failures become user-facing
//! outcomes. Everything below it returns typed errors; everything it returns
//! is an [`AnswerResult`] whose refusal text is one of the fixed messages of
//! [`RefusalReason`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AnswerConfig;
use crate::error::GenerationError;
use crate::generation::GenerationProvider;
use crate::safety::SafetyVerdict;
use crate::text::{content_terms, sentences, term_overlap, truncate_chars};
use crate::types::{AnswerResult, Citation, EXTRACTIVE_PROVIDER, RefusalReason, RetrievalCandidate};

/// A candidate chosen as evidence, with the quote it would be cited by.
#[derive(Debug, Clone, PartialEq)]
pub struct Evidence {
    pub chunk_id: String,
    pub doc_id: String,
    pub fused_score: f32,
    pub text: String,
    pub quote: String,
}

impl Evidence {
    fn citation(&self) -> Citation {
        Citation {
            chunk_id: self.chunk_id.clone(),
            doc_id: self.doc_id.clone(),
            quote: self.quote.clone(),
            score: self.fused_score,
        }
    }
}

/// Builds answers under the configured citation policy.
#[derive(Clone)]
pub struct AnswerComposer {
    config: AnswerConfig,
    generator: Option<Arc<dyn GenerationProvider>>,
    generation_timeout: Duration,
}

impl std::fmt::Debug for AnswerComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerComposer")
            .field("config", &self.config)
            .field("generator", &self.generator.as_ref().map(|g| g.name()))
            .field("generation_timeout", &self.generation_timeout)
            .finish()
    }
}

impl AnswerComposer {
    pub fn new(
        config: AnswerConfig,
        generator: Option<Arc<dyn GenerationProvider>>,
        generation_timeout_ms: u64,
    ) -> Self {
        Self {
            config,
            generator,
            generation_timeout: Duration::from_millis(generation_timeout_ms),
        }
    }

    /// Composer that never calls a model.
    pub fn extractive(config: AnswerConfig) -> Self {
        Self::new(config, None, 30_000)
    }

    pub fn config(&self) -> &AnswerConfig {
        &self.config
    }

    /// Name of the provider that writes answers.
    pub fn provider_name(&self) -> &str {
        self.active_generator()
            .map(|g| g.name())
            .unwrap_or(EXTRACTIVE_PROVIDER)
    }

    /// Whether answers may arrive as streamed tokens.
    pub fn streams_tokens(&self) -> bool {
        self.active_generator()
            .is_some_and(|g| g.supports_streaming())
    }

    fn active_generator(&self) -> Option<&Arc<dyn GenerationProvider>> {
        if self.config.extractive_only {
            None
        } else {
            self.generator.as_ref()
        }
    }

    pub async fn compose(
        &self,
        question: &str,
        candidates: &[RetrievalCandidate],
        verdict: &SafetyVerdict,
    ) -> AnswerResult {
        self.run(question, candidates, verdict, None).await
    }

    /// Like [`compose`](Self::compose), forwarding generated tokens to `tokens`
    /// when the provider streams. Refusals and extractive answers send nothing.
    pub async fn compose_streaming(
        &self,
        question: &str,
        candidates: &[RetrievalCandidate],
        verdict: &SafetyVerdict,
        tokens: mpsc::Sender<String>,
    ) -> AnswerResult {
        self.run(question, candidates, verdict, Some(tokens)).await
    }

    /// Normalize a failure raised before composition into an `internal_error`
    /// refusal. The error is logged, never returned to the caller.
    pub fn from_failure(&self, question: &str, err: &dyn std::error::Error) -> AnswerResult {
        warn!(error = %err, "Pipeline failure before composition");
        refuse(question, RefusalReason::InternalError)
    }

    /// Evidence gate and citation relevance check.
    ///
    /// Returns the evidence to answer from, best first, or the refusal reason.
    pub fn select_evidence(
        &self,
        question: &str,
        candidates: &[RetrievalCandidate],
    ) -> Result<Vec<Evidence>, RefusalReason> {
        let Some(best) = candidates
            .iter()
            .map(|c| c.fused_score)
            .max_by(|a, b| a.total_cmp(b))
        else {
            return Err(RefusalReason::InsufficientEvidence);
        };
        if self.config.relevance_floor_enabled && best < self.config.min_fused_score {
            debug!(
                best_score = best,
                floor = self.config.min_fused_score,
                "Best candidate below relevance floor"
            );
            return Err(RefusalReason::InsufficientEvidence);
        }

        let terms = content_terms(question, self.config.min_term_len);
        let cutoff = best * self.config.min_relative_score;
        // Zero shared terms never makes a candidate citable.
        let min_overlap = self.config.min_term_overlap.max(1);
        let selected: Vec<Evidence> = candidates
            .iter()
            .filter(|c| c.fused_score >= cutoff)
            .filter(|c| {
                !self.config.citations_required
                    || term_overlap(&terms, candidate_text(c), self.config.min_term_len)
                        >= min_overlap
            })
            .take(self.config.max_citations)
            .map(|c| Evidence {
                chunk_id: c.chunk_id.clone(),
                doc_id: c.doc_id.clone(),
                fused_score: c.fused_score,
                text: candidate_text(c).to_string(),
                quote: best_quote(&terms, candidate_text(c), &self.config),
            })
            .collect();

        if selected.is_empty() {
            debug!(
                candidates = candidates.len(),
                "No candidate shares enough terms with the question"
            );
            return Err(RefusalReason::InsufficientEvidence);
        }
        Ok(selected)
    }

    async fn run(
        &self,
        question: &str,
        candidates: &[RetrievalCandidate],
        verdict: &SafetyVerdict,
        tokens: Option<mpsc::Sender<String>>,
    ) -> AnswerResult {
        if verdict.is_injection {
            return refuse(question, RefusalReason::SafetyBlock);
        }

        let evidence = match self.select_evidence(question, candidates) {
            Ok(evidence) => evidence,
            Err(reason) => return refuse(question, reason),
        };

        let result = match self.active_generator() {
            Some(generator) => {
                match self.generate(generator.as_ref(), question, &evidence, tokens).await {
                    Ok(text) => {
                        let citations = cited_evidence(&text, &evidence)
                            .into_iter()
                            .map(Evidence::citation)
                            .collect();
                        AnswerResult::answered(question, text, citations, generator.name())
                    }
                    Err(err) => {
                        warn!(
                            provider = generator.name(),
                            error = %err,
                            "Generation failed, refusing"
                        );
                        return refuse(question, RefusalReason::InternalError);
                    }
                }
            }
            None => extractive_answer(question, &evidence),
        };

        if self.config.citations_required && result.citations.is_empty() {
            error!(
                provider = %result.provider,
                "Answer without citations while citations are required"
            );
            return refuse(question, RefusalReason::InternalError);
        }

        info!(
            provider = %result.provider,
            citations = result.citations.len(),
            "Answer composed"
        );
        result
    }

    async fn generate(
        &self,
        generator: &dyn GenerationProvider,
        question: &str,
        evidence: &[Evidence],
        tokens: Option<mpsc::Sender<String>>,
    ) -> Result<String, GenerationError> {
        let texts: Vec<String> = evidence.iter().map(|e| e.text.clone()).collect();
        let timeout_ms = u64::try_from(self.generation_timeout.as_millis()).unwrap_or(u64::MAX);
        let call = async {
            match tokens {
                Some(tx) if generator.supports_streaming() => {
                    generator.generate_streaming(question, &texts, tx).await
                }
                _ => generator.generate(question, &texts).await,
            }
        };
        let text = tokio::time::timeout(self.generation_timeout, call)
            .await
            .map_err(|_| GenerationError::Timeout { timeout_ms })??;
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(text)
    }
}

/// Build a refusal and log the outcome.
pub fn refuse(question: &str, reason: RefusalReason) -> AnswerResult {
    info!(reason = %reason, "Answer refused");
    AnswerResult::refusal(question, reason)
}

fn candidate_text(candidate: &RetrievalCandidate) -> &str {
    if candidate.text.is_empty() {
        &candidate.text_preview
    } else {
        &candidate.text
    }
}

/// The sentence sharing the most terms with the question; first one on ties.
fn best_quote(terms: &BTreeSet<String>, text: &str, config: &AnswerConfig) -> String {
    let mut best: Option<(&str, usize)> = None;
    for sentence in sentences(text) {
        let overlap = term_overlap(terms, sentence, config.min_term_len);
        if best.is_none_or(|(_, top)| overlap > top) {
            best = Some((sentence, overlap));
        }
    }
    let quote = best.map(|(s, _)| s).unwrap_or(text);
    truncate_chars(quote, config.quote_chars)
}

fn extractive_answer(question: &str, evidence: &[Evidence]) -> AnswerResult {
    let answer = evidence
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{} [{}]", e.quote, i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    let citations = evidence.iter().map(Evidence::citation).collect();
    AnswerResult::answered(question, answer, citations, EXTRACTIVE_PROVIDER)
}

/// Evidence referenced by `[n]` markers, in evidence order. With no valid
/// markers, every piece of evidence is cited.
fn cited_evidence<'a>(text: &str, evidence: &'a [Evidence]) -> Vec<&'a Evidence> {
    let referenced = citation_markers(text, evidence.len());
    if referenced.is_empty() {
        return evidence.iter().collect();
    }
    referenced.into_iter().map(|n| &evidence[n - 1]).collect()
}

/// 1-based marker numbers in `1..=max` that appear as `[n]` in `text`.
pub fn citation_markers(text: &str, max: usize) -> BTreeSet<usize> {
    let mut found = BTreeSet::new();
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find(']') else {
            break;
        };
        if let Ok(n) = rest[..close].trim().parse::<usize>()
            && (1..=max).contains(&n)
        {
            found.insert(n);
        }
        rest = &rest[close..];
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::MockGenerator;
    use pretty_assertions::assert_eq;

    fn candidate(chunk_id: &str, doc_id: &str, fused: f32, text: &str) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            idx: 0,
            lexical_score: fused,
            vector_score: 0.0,
            fused_score: fused,
            text_preview: truncate_chars(text, 40),
            text: text.to_string(),
        }
    }

    fn refund_candidates() -> Vec<RetrievalCandidate> {
        vec![
            candidate(
                "refunds#0",
                "refunds",
                0.9,
                "Our store is friendly. Refunds are issued within 30 days of purchase.",
            ),
            candidate(
                "shipping#0",
                "shipping",
                0.5,
                "Orders ship within two business days.",
            ),
        ]
    }

    const QUESTION: &str = "How many days until refunds are issued?";

    #[tokio::test]
    async fn test_safety_block_wins_over_evidence() {
        let mock = Arc::new(MockGenerator::with_response("Refunds [1]"));
        let composer = AnswerComposer::new(AnswerConfig::default(), Some(mock.clone()), 1_000);
        let verdict = SafetyVerdict::flagged(vec!["override.ignore_instructions".to_string()]);

        let result = composer
            .compose(QUESTION, &refund_candidates(), &verdict)
            .await;
        assert!(result.refused);
        assert_eq!(result.refusal_reason, Some(RefusalReason::SafetyBlock));
        assert!(result.citations.is_empty());
        assert_eq!(result.answer, RefusalReason::SafetyBlock.message());
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_candidates_is_insufficient_evidence() {
        let composer = AnswerComposer::extractive(AnswerConfig::default());
        let result = composer
            .compose(QUESTION, &[], &SafetyVerdict::benign())
            .await;
        assert_eq!(
            result.refusal_reason,
            Some(RefusalReason::InsufficientEvidence)
        );
        assert!(result.is_consistent());
    }

    #[tokio::test]
    async fn test_relevance_floor() {
        let config = AnswerConfig {
            relevance_floor_enabled: true,
            min_fused_score: 0.95,
            ..AnswerConfig::default()
        };
        let composer = AnswerComposer::extractive(config);
        let result = composer
            .compose(QUESTION, &refund_candidates(), &SafetyVerdict::benign())
            .await;
        assert_eq!(
            result.refusal_reason,
            Some(RefusalReason::InsufficientEvidence)
        );
    }

    #[tokio::test]
    async fn test_unrelated_candidates_are_not_citable() {
        let composer = AnswerComposer::extractive(AnswerConfig::default());
        let candidates = vec![candidate(
            "weather#0",
            "weather",
            0.8,
            "Sunny skies expected tomorrow.",
        )];
        let result = composer
            .compose(QUESTION, &candidates, &SafetyVerdict::benign())
            .await;
        assert_eq!(
            result.refusal_reason,
            Some(RefusalReason::InsufficientEvidence)
        );
    }

    #[tokio::test]
    async fn test_extractive_answer_quotes_best_sentence() {
        let composer = AnswerComposer::extractive(AnswerConfig::default());
        let result = composer
            .compose(QUESTION, &refund_candidates(), &SafetyVerdict::benign())
            .await;

        assert!(!result.refused);
        assert_eq!(result.provider, EXTRACTIVE_PROVIDER);
        assert_eq!(result.citations.len(), 2);
        assert_eq!(result.citations[0].chunk_id, "refunds#0");
        assert_eq!(
            result.citations[0].quote,
            "Refunds are issued within 30 days of purchase."
        );
        assert!((result.citations[0].score - 0.9).abs() < f32::EPSILON);
        assert!(
            result
                .answer
                .starts_with("Refunds are issued within 30 days of purchase. [1]")
        );
    }

    #[test]
    fn test_weak_candidates_are_not_cited() {
        let composer = AnswerComposer::extractive(AnswerConfig::default());
        let mut candidates = refund_candidates();
        candidates[1].fused_score = 0.3;
        candidates.push(candidate(
            "refunds#1",
            "refunds",
            0.2,
            "Refunds for digital goods are not available.",
        ));

        let evidence = composer.select_evidence(QUESTION, &candidates).unwrap();
        let ids: Vec<&str> = evidence.iter().map(|e| e.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["refunds#0"]);

        let lenient = AnswerComposer::extractive(AnswerConfig {
            min_relative_score: 0.0,
            ..AnswerConfig::default()
        });
        let evidence = lenient.select_evidence(QUESTION, &candidates).unwrap();
        assert_eq!(evidence.len(), 3);
    }

    #[test]
    fn test_zero_overlap_never_citable() {
        let composer = AnswerComposer::extractive(AnswerConfig {
            min_term_overlap: 0,
            ..AnswerConfig::default()
        });
        let candidates = vec![candidate(
            "weather#0",
            "weather",
            0.8,
            "Sunny skies expected tomorrow.",
        )];
        assert_eq!(
            composer.select_evidence(QUESTION, &candidates),
            Err(RefusalReason::InsufficientEvidence)
        );
    }

    #[tokio::test]
    async fn test_max_citations_limits_evidence() {
        let config = AnswerConfig {
            max_citations: 1,
            ..AnswerConfig::default()
        };
        let composer = AnswerComposer::extractive(config);
        let result = composer
            .compose(QUESTION, &refund_candidates(), &SafetyVerdict::benign())
            .await;
        assert_eq!(result.citations.len(), 1);
    }

    #[tokio::test]
    async fn test_generated_markers_select_citations() {
        let mock = Arc::new(MockGenerator::with_response(
            "Refunds are issued within 30 days [1].",
        ));
        let composer = AnswerComposer::new(AnswerConfig::default(), Some(mock.clone()), 1_000);
        let result = composer
            .compose(QUESTION, &refund_candidates(), &SafetyVerdict::benign())
            .await;

        assert!(!result.refused);
        assert_eq!(result.provider, "mock");
        assert_eq!(result.citations.len(), 1);
        assert_eq!(result.citations[0].doc_id, "refunds");
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_generated_without_markers_cites_all_evidence() {
        let mock = Arc::new(MockGenerator::with_response("Within 30 days."));
        let composer = AnswerComposer::new(AnswerConfig::default(), Some(mock), 1_000);
        let result = composer
            .compose(QUESTION, &refund_candidates(), &SafetyVerdict::benign())
            .await;
        assert_eq!(result.citations.len(), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_becomes_internal_error() {
        for mock in [MockGenerator::failing("connection reset"), MockGenerator::empty()] {
            let composer =
                AnswerComposer::new(AnswerConfig::default(), Some(Arc::new(mock)), 1_000);
            let result = composer
                .compose(QUESTION, &refund_candidates(), &SafetyVerdict::benign())
                .await;
            assert_eq!(result.refusal_reason, Some(RefusalReason::InternalError));
            assert!(!result.answer.contains("connection reset"));
            assert!(result.citations.is_empty());
        }
    }

    #[tokio::test]
    async fn test_generation_timeout_becomes_internal_error() {
        let mock = MockGenerator::with_response("late [1]").with_delay(Duration::from_secs(10));
        let composer = AnswerComposer::new(AnswerConfig::default(), Some(Arc::new(mock)), 50);
        let result = composer
            .compose(QUESTION, &refund_candidates(), &SafetyVerdict::benign())
            .await;
        assert_eq!(result.refusal_reason, Some(RefusalReason::InternalError));
    }

    #[tokio::test]
    async fn test_extractive_only_skips_generator() {
        let mock = Arc::new(MockGenerator::with_response("model text [1]"));
        let config = AnswerConfig {
            extractive_only: true,
            ..AnswerConfig::default()
        };
        let composer = AnswerComposer::new(config, Some(mock.clone()), 1_000);
        let result = composer
            .compose(QUESTION, &refund_candidates(), &SafetyVerdict::benign())
            .await;
        assert_eq!(result.provider, EXTRACTIVE_PROVIDER);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_compose_streaming_forwards_tokens() {
        let mock = Arc::new(MockGenerator::streaming(&["Within ", "30 days ", "[1]"]));
        let composer = AnswerComposer::new(AnswerConfig::default(), Some(mock), 1_000);
        assert!(composer.streams_tokens());

        let (tx, mut rx) = mpsc::channel(8);
        let result = composer
            .compose_streaming(QUESTION, &refund_candidates(), &SafetyVerdict::benign(), tx)
            .await;
        assert_eq!(result.answer, "Within 30 days [1]");
        assert_eq!(result.citations.len(), 1);

        let mut tokens = Vec::new();
        while let Some(token) = rx.recv().await {
            tokens.push(token);
        }
        assert_eq!(tokens.concat(), result.answer);
    }

    #[test]
    fn test_from_failure_hides_error_detail() {
        let composer = AnswerComposer::extractive(AnswerConfig::default());
        let err = GenerationError::Request {
            message: "secret upstream host 10.0.0.7".to_string(),
        };
        let result = composer.from_failure(QUESTION, &err);
        assert_eq!(result.refusal_reason, Some(RefusalReason::InternalError));
        assert!(!result.answer.contains("10.0.0.7"));
    }

    #[test]
    fn test_citation_markers() {
        let markers = citation_markers("See [2] and [1], not [7] or [x] or [ 3 ]", 3);
        assert_eq!(markers.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(citation_markers("no markers [", 3).is_empty());
    }

    #[test]
    fn test_citations_not_required_keeps_unrelated_evidence() {
        let config = AnswerConfig {
            citations_required: false,
            ..AnswerConfig::default()
        };
        let composer = AnswerComposer::extractive(config);
        let candidates = vec![candidate("weather#0", "weather", 0.8, "Sunny skies.")];
        let evidence = composer.select_evidence(QUESTION, &candidates).unwrap();
        assert_eq!(evidence.len(), 1);
    }
}
