//! Eval datasets: parsing and validation.
//!
//! Three layouts are accepted:
//! - a JSON array of cases,
//! - an object `{"name": "...", "cases": [...]}`,
//! - JSONL, one case per line.
//!
//! Case positions in error messages are 0-based, in file order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{DatasetError, Result};

/// What a case expects from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expectation {
    /// At least one citation must come from these documents (or chunks).
    MustCite {
        #[serde(default)]
        doc_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_ids: Option<Vec<String>>,
    },
    /// The answer must be a refusal.
    MustRefuse,
}

impl Expectation {
    pub fn kind(&self) -> CaseKind {
        match self {
            Expectation::MustCite { .. } => CaseKind::MustCite,
            Expectation::MustRefuse => CaseKind::MustRefuse,
        }
    }

    /// Whether a chunk satisfies a `must_cite` expectation. Chunk ids take
    /// precedence when given.
    pub fn accepts(&self, doc_id: &str, chunk_id: &str) -> bool {
        match self {
            Expectation::MustCite {
                chunk_ids: Some(chunk_ids),
                ..
            } if !chunk_ids.is_empty() => chunk_ids.iter().any(|id| id == chunk_id),
            Expectation::MustCite { doc_ids, .. } => doc_ids.iter().any(|id| id == doc_id),
            Expectation::MustRefuse => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseKind {
    MustCite,
    MustRefuse,
}

impl std::fmt::Display for CaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseKind::MustCite => write!(f, "must_cite"),
            CaseKind::MustRefuse => write!(f, "must_refuse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalCase {
    pub id: String,
    pub question: String,
    pub expectation: Expectation,
}

impl EvalCase {
    pub fn must_cite(id: &str, question: &str, doc_ids: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            question: question.to_string(),
            expectation: Expectation::MustCite {
                doc_ids: doc_ids.iter().map(|d| d.to_string()).collect(),
                chunk_ids: None,
            },
        }
    }

    pub fn must_refuse(id: &str, question: &str) -> Self {
        Self {
            id: id.to_string(),
            question: question.to_string(),
            expectation: Expectation::MustRefuse,
        }
    }
}

/// A named, validated list of cases. Run history is keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub cases: Vec<EvalCase>,
}

impl Dataset {
    /// Build and validate a dataset from cases already in memory.
    pub fn new(name: impl Into<String>, cases: Vec<EvalCase>) -> std::result::Result<Self, DatasetError> {
        let dataset = Self {
            name: name.into(),
            cases,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    /// Check ids, questions and expectations.
    pub fn validate(&self) -> std::result::Result<(), DatasetError> {
        if self.cases.is_empty() {
            return Err(DatasetError::Empty);
        }
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (index, case) in self.cases.iter().enumerate() {
            if case.id.trim().is_empty() {
                return Err(DatasetError::MissingField { index, field: "id" });
            }
            if case.question.trim().is_empty() {
                return Err(DatasetError::MissingField {
                    index,
                    field: "question",
                });
            }
            if let Expectation::MustCite { doc_ids, chunk_ids } = &case.expectation {
                let no_docs = doc_ids.iter().all(|d| d.trim().is_empty());
                let no_chunks = chunk_ids
                    .as_ref()
                    .is_none_or(|ids| ids.iter().all(|c| c.trim().is_empty()));
                if no_docs && no_chunks {
                    return Err(DatasetError::EmptyExpectation {
                        id: case.id.clone(),
                    });
                }
            }
            if let Some(first) = seen.insert(case.id.as_str(), index) {
                return Err(DatasetError::DuplicateId {
                    id: case.id.clone(),
                    first,
                    second: index,
                });
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct NamedDataset {
    #[serde(default)]
    name: Option<String>,
    cases: Vec<Value>,
}

/// Parse dataset text in any accepted layout. `default_name` is used when the
/// input does not name itself.
pub fn parse_dataset(input: &str, default_name: &str) -> std::result::Result<Dataset, DatasetError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DatasetError::Empty);
    }

    let (name, raw_cases) = if trimmed.starts_with('[') {
        let cases: Vec<Value> = serde_json::from_str(trimmed).map_err(malformed)?;
        (None, cases)
    } else {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.get("cases").is_some() => {
                let named: NamedDataset = serde_json::from_value(value).map_err(malformed)?;
                (named.name, named.cases)
            }
            Ok(value) => (None, vec![value]),
            Err(_) => (None, parse_jsonl(trimmed)?),
        }
    };

    let name = name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| default_name.to_string());
    dataset_from_values(name, raw_cases)
}

/// Validate cases given as loose JSON values, e.g. from an API request body.
pub fn dataset_from_values(
    name: impl Into<String>,
    values: Vec<Value>,
) -> std::result::Result<Dataset, DatasetError> {
    let cases = values
        .into_iter()
        .enumerate()
        .map(|(index, value)| parse_case(index, value))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Dataset::new(name, cases)
}

/// Read a dataset file. Its stem names the dataset unless the file says otherwise.
pub fn load_dataset(path: &Path) -> Result<Dataset> {
    let input = std::fs::read_to_string(path)?;
    let default_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset");
    Ok(parse_dataset(&input, default_name)?)
}

fn parse_jsonl(input: &str) -> std::result::Result<Vec<Value>, DatasetError> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| DatasetError::Malformed {
                message: format!("line {}: {e}", i + 1),
            })
        })
        .collect()
}

fn parse_case(index: usize, value: Value) -> std::result::Result<EvalCase, DatasetError> {
    let Some(object) = value.as_object() else {
        return Err(DatasetError::MalformedCase {
            index,
            message: "expected a JSON object".to_string(),
        });
    };
    for field in ["id", "question", "expectation"] {
        if object.get(field).is_none_or(Value::is_null) {
            return Err(DatasetError::MissingField { index, field });
        }
    }
    serde_json::from_value(value).map_err(|e| DatasetError::MalformedCase {
        index,
        message: e.to_string(),
    })
}

fn malformed(err: serde_json::Error) -> DatasetError {
    DatasetError::Malformed {
        message: err.to_string(),
    }
}
