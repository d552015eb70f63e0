//! Core data types shared across retrieval, composition, streaming and evals.

use serde::{Deserialize, Serialize};

/// A slice of a source document. Written by ingestion, read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub idx: u32,
    pub text: String,
}

impl Chunk {
    pub fn new(doc_id: impl Into<String>, idx: u32, text: impl Into<String>) -> Self {
        let doc_id = doc_id.into();
        Self {
            chunk_id: default_chunk_id(&doc_id, idx),
            doc_id,
            idx,
            text: text.into(),
        }
    }
}

/// The id a chunk gets when the corpus does not name it.
pub fn default_chunk_id(doc_id: &str, idx: u32) -> String {
    format!("{doc_id}#{idx}")
}

/// Stored vector for one chunk. All vectors in an index share `dim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub chunk_id: String,
    pub dim: usize,
    pub vec: Vec<f32>,
}

impl EmbeddingVector {
    pub fn new(chunk_id: impl Into<String>, vec: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            dim: vec.len(),
            vec,
        }
    }
}

/// One ranked candidate, built per retrieval call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub chunk_id: String,
    pub doc_id: String,
    pub idx: u32,
    /// Raw lexical score from the index (0 when only the vector pull found it).
    pub lexical_score: f32,
    /// Raw cosine similarity (0 when only the lexical pull found it).
    pub vector_score: f32,
    pub fused_score: f32,
    pub text_preview: String,
    /// Full chunk text, kept in-process for composition.
    #[serde(skip)]
    pub text: String,
}

/// Evidence attached to a non-refused answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub doc_id: String,
    pub quote: String,
    pub score: f32,
}

/// Why an answer was refused. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    InsufficientEvidence,
    SafetyBlock,
    InternalError,
}

impl RefusalReason {
    /// The fixed, generic text shown to the user for this reason.
    pub fn message(&self) -> &'static str {
        match self {
            RefusalReason::InsufficientEvidence => {
                "I could not find enough evidence in the indexed documents to answer this question."
            }
            RefusalReason::SafetyBlock => "I can't help with that request.",
            RefusalReason::InternalError => {
                "Something went wrong while preparing an answer. Please try again later."
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefusalReason::InsufficientEvidence => "insufficient_evidence",
            RefusalReason::SafetyBlock => "safety_block",
            RefusalReason::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of one question.
///
/// Built only through [`AnswerResult::refusal`] and [`AnswerResult::answered`],
/// so a refusal never carries citations and always has a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub question: String,
    pub answer: String,
    pub refused: bool,
    pub refusal_reason: Option<RefusalReason>,
    pub citations: Vec<Citation>,
    /// Name of the component that wrote `answer`.
    pub provider: String,
}

/// Provider name reported on refusals and extractive answers.
pub const EXTRACTIVE_PROVIDER: &str = "extractive";

impl AnswerResult {
    pub fn refusal(question: impl Into<String>, reason: RefusalReason) -> Self {
        Self {
            question: question.into(),
            answer: reason.message().to_string(),
            refused: true,
            refusal_reason: Some(reason),
            citations: Vec::new(),
            provider: EXTRACTIVE_PROVIDER.to_string(),
        }
    }

    pub fn answered(
        question: impl Into<String>,
        answer: impl Into<String>,
        citations: Vec<Citation>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            refused: false,
            refusal_reason: None,
            citations,
            provider: provider.into(),
        }
    }

    /// `refused`, a present reason and an empty citation list agree.
    pub fn is_consistent(&self) -> bool {
        self.refused == self.refusal_reason.is_some() && (!self.refused || self.citations.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_chunk_id() {
        let chunk = Chunk::new("handbook", 3, "text");
        assert_eq!(chunk.chunk_id, "handbook#3");
    }

    #[test]
    fn test_refusal_reason_serializes_snake_case() {
        let json = serde_json::to_string(&RefusalReason::InsufficientEvidence).unwrap();
        assert_eq!(json, "\"insufficient_evidence\"");
        let back: RefusalReason = serde_json::from_str("\"safety_block\"").unwrap();
        assert_eq!(back, RefusalReason::SafetyBlock);
    }

    #[test]
    fn test_refusal_has_fixed_message_and_no_citations() {
        let result = AnswerResult::refusal("q", RefusalReason::SafetyBlock);
        assert!(result.refused);
        assert_eq!(result.refusal_reason, Some(RefusalReason::SafetyBlock));
        assert!(result.citations.is_empty());
        assert_eq!(result.answer, "I can't help with that request.");
        assert!(result.is_consistent());
    }

    #[test]
    fn test_answer_result_json_shape() {
        let result = AnswerResult::refusal("why?", RefusalReason::InternalError);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["refused"], true);
        assert_eq!(value["refusal_reason"], "internal_error");
        assert_eq!(value["citations"], serde_json::json!([]));
        assert_eq!(value["provider"], "extractive");

        let answered = AnswerResult::answered("q", "a", Vec::new(), "mock");
        let value = serde_json::to_value(&answered).unwrap();
        assert!(value["refusal_reason"].is_null());
    }

    #[test]
    fn test_candidate_text_is_not_serialized() {
        let candidate = RetrievalCandidate {
            chunk_id: "a#0".into(),
            doc_id: "a".into(),
            idx: 0,
            lexical_score: 1.0,
            vector_score: 0.0,
            fused_score: 1.0,
            text_preview: "prev".into(),
            text: "full text".into(),
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert!(value.get("text").is_none());
        assert_eq!(value["text_preview"], "prev");
    }
}
