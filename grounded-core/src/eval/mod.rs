//! Offline evaluation: datasets of expected outcomes, scored runs, run history.

pub mod dataset;
pub mod diff;
pub mod gates;
pub mod harness;
pub mod metrics;
pub mod store;

pub use dataset::{
    CaseKind, Dataset, EvalCase, Expectation, dataset_from_values, load_dataset, parse_dataset,
};
pub use diff::RunDiff;
pub use gates::{GateResult, evaluate_gates, gates_passed};
pub use harness::EvalHarness;
pub use metrics::{CaseResult, EvalMetrics};
pub use store::{InMemoryRunStore, RunStore, SqliteRunStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One finished eval run. Immutable once appended to a [`RunStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRun {
    pub run_id: Uuid,
    pub dataset: String,
    pub k: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub metrics: EvalMetrics,
    pub cases: Vec<CaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<RunDiff>,
    #[serde(default)]
    pub gates: Vec<GateResult>,
}

impl EvalRun {
    /// False when any blocking gate failed.
    pub fn gates_passed(&self) -> bool {
        gates_passed(&self.gates)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Copy without per-case results.
    pub fn summary(&self) -> EvalRun {
        EvalRun {
            cases: Vec::new(),
            ..self.clone()
        }
    }
}
