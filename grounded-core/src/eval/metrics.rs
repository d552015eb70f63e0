//! Per-case outcomes and run-level metrics.

use serde::{Deserialize, Serialize};

use super::dataset::{CaseKind, Expectation};
use crate::config::GateMetric;
use crate::types::{RefusalReason, RetrievalCandidate};

/// Outcome of one eval case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub kind: CaseKind,
    pub passed: bool,
    pub refused: bool,
    pub refusal_reason: Option<RefusalReason>,
    /// 1-based position of the first expected chunk among the retrieved top-k.
    pub rank: Option<usize>,
    pub reciprocal_rank: f64,
    pub cited_doc_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Position of the first candidate the expectation accepts, 1-based.
pub fn first_match_rank(
    expectation: &Expectation,
    candidates: &[RetrievalCandidate],
) -> Option<usize> {
    candidates
        .iter()
        .position(|c| expectation.accepts(&c.doc_id, &c.chunk_id))
        .map(|i| i + 1)
}

pub fn reciprocal_rank(rank: Option<usize>) -> f64 {
    rank.map_or(0.0, |r| 1.0 / r as f64)
}

/// Aggregate scores of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub total: usize,
    pub passed: usize,
    pub pass_rate: f64,
    pub cite_cases: usize,
    /// Cite cases with an expected chunk somewhere in the top-k.
    pub hits: usize,
    pub hit_at_k: f64,
    pub mrr: f64,
    pub refuse_cases: usize,
    pub refusals_correct: usize,
}

impl EvalMetrics {
    /// `hit_at_k` and `mrr` only count `must_cite` cases and are 0 without any.
    pub fn from_cases(cases: &[CaseResult]) -> Self {
        let total = cases.len();
        let passed = cases.iter().filter(|c| c.passed).count();

        let cite: Vec<&CaseResult> = cases
            .iter()
            .filter(|c| c.kind == CaseKind::MustCite)
            .collect();
        let hits = cite.iter().filter(|c| c.rank.is_some()).count();
        let rr_sum: f64 = cite.iter().map(|c| c.reciprocal_rank).sum();

        let refuse_cases = cases
            .iter()
            .filter(|c| c.kind == CaseKind::MustRefuse)
            .count();
        let refusals_correct = cases
            .iter()
            .filter(|c| c.kind == CaseKind::MustRefuse && c.passed)
            .count();

        Self {
            total,
            passed,
            pass_rate: ratio(passed as f64, total),
            cite_cases: cite.len(),
            hits,
            hit_at_k: ratio(hits as f64, cite.len()),
            mrr: ratio(rr_sum, cite.len()),
            refuse_cases,
            refusals_correct,
        }
    }

    pub fn value(&self, metric: GateMetric) -> f64 {
        match metric {
            GateMetric::PassRate => self.pass_rate,
            GateMetric::HitAtK => self.hit_at_k,
            GateMetric::Mrr => self.mrr,
        }
    }
}

fn ratio(numerator: f64, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cite_case(id: &str, rank: Option<usize>, passed: bool) -> CaseResult {
        CaseResult {
            case_id: id.to_string(),
            kind: CaseKind::MustCite,
            passed,
            refused: false,
            refusal_reason: None,
            rank,
            reciprocal_rank: reciprocal_rank(rank),
            cited_doc_ids: Vec::new(),
            failure: None,
        }
    }

    fn candidate(doc_id: &str, idx: u32) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk_id: format!("{doc_id}#{idx}"),
            doc_id: doc_id.to_string(),
            idx,
            lexical_score: 0.0,
            vector_score: 0.0,
            fused_score: 0.0,
            text_preview: String::new(),
            text: String::new(),
        }
    }

    #[test]
    fn test_hit_at_k_and_mrr() {
        let cases = vec![
            cite_case("first", Some(1), true),
            cite_case("third", Some(3), true),
            cite_case("absent", None, false),
        ];
        let metrics = EvalMetrics::from_cases(&cases);
        assert_eq!(metrics.cite_cases, 3);
        assert_eq!(metrics.hits, 2);
        assert!((metrics.hit_at_k - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.mrr - 4.0 / 9.0).abs() < 1e-9);
        assert!((metrics.pass_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_cite_cases() {
        let cases = vec![CaseResult {
            kind: CaseKind::MustRefuse,
            refused: true,
            ..cite_case("refuse", None, true)
        }];
        let metrics = EvalMetrics::from_cases(&cases);
        assert_eq!(metrics.hit_at_k, 0.0);
        assert_eq!(metrics.mrr, 0.0);
        assert_eq!(metrics.pass_rate, 1.0);
        assert_eq!(metrics.refusals_correct, 1);
        assert_eq!(metrics.value(GateMetric::PassRate), 1.0);
    }

    #[test]
    fn test_empty_cases() {
        let metrics = EvalMetrics::from_cases(&[]);
        assert_eq!(metrics, EvalMetrics::default());
    }

    #[test]
    fn test_first_match_rank() {
        let candidates = vec![candidate("a", 0), candidate("b", 0), candidate("b", 1)];
        let by_doc = Expectation::MustCite {
            doc_ids: vec!["b".to_string()],
            chunk_ids: None,
        };
        assert_eq!(first_match_rank(&by_doc, &candidates), Some(2));

        let by_chunk = Expectation::MustCite {
            doc_ids: vec!["b".to_string()],
            chunk_ids: Some(vec!["b#1".to_string()]),
        };
        assert_eq!(first_match_rank(&by_chunk, &candidates), Some(3));
        assert_eq!(first_match_rank(&Expectation::MustRefuse, &candidates), None);
    }
}
