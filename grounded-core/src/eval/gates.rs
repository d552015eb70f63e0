//! Quality gates: minimum metric values a run must reach.

use serde::{Deserialize, Serialize};

use super::metrics::EvalMetrics;
use crate::config::{GateConfig, GateMetric};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub metric: GateMetric,
    pub min: f64,
    pub actual: f64,
    pub passed: bool,
    pub blocking: bool,
}

pub fn evaluate_gates(gates: &[GateConfig], metrics: &EvalMetrics) -> Vec<GateResult> {
    gates
        .iter()
        .map(|gate| {
            let actual = metrics.value(gate.metric);
            GateResult {
                metric: gate.metric,
                min: gate.min,
                actual,
                passed: actual >= gate.min,
                blocking: gate.blocking,
            }
        })
        .collect()
}

/// True unless a blocking gate failed.
pub fn gates_passed(results: &[GateResult]) -> bool {
    results.iter().all(|g| g.passed || !g.blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gates() {
        let metrics = EvalMetrics {
            pass_rate: 0.8,
            mrr: 0.4,
            ..EvalMetrics::default()
        };
        let gates = vec![
            GateConfig {
                metric: GateMetric::PassRate,
                min: 0.75,
                blocking: true,
            },
            GateConfig {
                metric: GateMetric::Mrr,
                min: 0.5,
                blocking: false,
            },
        ];
        let results = evaluate_gates(&gates, &metrics);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert!((results[1].actual - 0.4).abs() < 1e-9);
        assert!(gates_passed(&results));

        let strict = vec![GateConfig {
            metric: GateMetric::Mrr,
            min: 0.5,
            blocking: true,
        }];
        assert!(!gates_passed(&evaluate_gates(&strict, &metrics)));
        assert!(gates_passed(&[]));
    }
}
