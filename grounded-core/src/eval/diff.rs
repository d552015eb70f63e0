//! Comparison of a run against the previous run of the same dataset.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::EvalRun;
use super::metrics::{CaseResult, EvalMetrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiff {
    pub previous_run_id: Uuid,
    pub pass_rate_delta: f64,
    pub hit_at_k_delta: f64,
    pub mrr_delta: f64,
    /// Cases that passed last time and fail now, in dataset order.
    pub newly_failing: Vec<String>,
    pub newly_passing: Vec<String>,
}

impl RunDiff {
    /// Cases absent from the previous run are neither newly failing nor passing.
    pub fn between(previous: &EvalRun, metrics: &EvalMetrics, cases: &[CaseResult]) -> Self {
        let before: HashMap<&str, bool> = previous
            .cases
            .iter()
            .map(|c| (c.case_id.as_str(), c.passed))
            .collect();

        let mut newly_failing = Vec::new();
        let mut newly_passing = Vec::new();
        for case in cases {
            match (before.get(case.case_id.as_str()), case.passed) {
                (Some(true), false) => newly_failing.push(case.case_id.clone()),
                (Some(false), true) => newly_passing.push(case.case_id.clone()),
                _ => {}
            }
        }

        Self {
            previous_run_id: previous.run_id,
            pass_rate_delta: metrics.pass_rate - previous.metrics.pass_rate,
            hit_at_k_delta: metrics.hit_at_k - previous.metrics.hit_at_k,
            mrr_delta: metrics.mrr - previous.metrics.mrr,
            newly_failing,
            newly_passing,
        }
    }

    pub fn is_regression(&self) -> bool {
        !self.newly_failing.is_empty() || self.pass_rate_delta < 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::dataset::CaseKind;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn case(id: &str, passed: bool) -> CaseResult {
        CaseResult {
            case_id: id.to_string(),
            kind: CaseKind::MustRefuse,
            passed,
            refused: passed,
            refusal_reason: None,
            rank: None,
            reciprocal_rank: 0.0,
            cited_doc_ids: Vec::new(),
            failure: None,
        }
    }

    fn run(cases: Vec<CaseResult>) -> EvalRun {
        let metrics = EvalMetrics::from_cases(&cases);
        EvalRun {
            run_id: Uuid::new_v4(),
            dataset: "smoke".to_string(),
            k: 5,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            metrics,
            cases,
            diff: None,
            gates: Vec::new(),
        }
    }

    #[test]
    fn test_diff_tracks_flips() {
        let previous = run(vec![case("a", true), case("b", false), case("c", true)]);
        let current = vec![case("a", false), case("b", true), case("c", true), case("d", false)];
        let metrics = EvalMetrics::from_cases(&current);

        let diff = RunDiff::between(&previous, &metrics, &current);
        assert_eq!(diff.previous_run_id, previous.run_id);
        assert_eq!(diff.newly_failing, vec!["a".to_string()]);
        assert_eq!(diff.newly_passing, vec!["b".to_string()]);
        assert!((diff.pass_rate_delta - (0.5 - 2.0 / 3.0)).abs() < 1e-9);
        assert!(diff.is_regression());
    }

    #[test]
    fn test_unchanged_run_is_not_a_regression() {
        let previous = run(vec![case("a", true)]);
        let current = vec![case("a", true)];
        let diff = RunDiff::between(&previous, &EvalMetrics::from_cases(&current), &current);
        assert!(diff.newly_failing.is_empty());
        assert!(diff.newly_passing.is_empty());
        assert!(!diff.is_regression());
    }
}
