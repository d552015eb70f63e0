//! Read-only chunk index consumed by the retriever.
//!
//! Two backends implement [`ChunkIndex`]: [`MemoryChunkIndex`] scores BM25 in
//! process, [`TantivyChunkIndex`] delegates lexical scoring to tantivy. Both
//! keep vectors in a [`VectorStore`] and search them brute force. Indexes are
//! built once (see [`corpus::build_index`]) and only read afterwards.

pub mod corpus;
pub mod memory;
pub mod tantivy_index;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::embeddings::cosine_similarity;
use crate::error::IndexError;
use crate::types::Chunk;

pub use self::corpus::{build_index, load_corpus, parse_corpus};
pub use self::memory::MemoryChunkIndex;
pub use self::tantivy_index::TantivyChunkIndex;

/// A lexical match, best-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LexicalHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub idx: u32,
    pub score: f32,
    pub text: String,
}

/// A vector match, best-first. Text is fetched separately when needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub idx: u32,
    pub score: f32,
}

/// Read API over chunk text, vectors and document metadata.
///
/// Implementations must be safe to query concurrently and must return hits
/// ordered best-first with ties broken by `chunk_id`.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    async fn lexical_search(&self, query: &str, limit: usize)
    -> Result<Vec<LexicalHit>, IndexError>;

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>, IndexError>;

    /// Fetch chunks by id. Unknown ids are skipped.
    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>, IndexError>;

    fn chunk_count(&self) -> usize;

    /// Dimension of stored vectors, `None` when no vectors are stored.
    fn vector_dimensions(&self) -> Option<usize>;

    fn backend_name(&self) -> &str;
}

/// Order `(score desc, chunk_id asc)` shared by every backend.
pub(crate) fn by_score_then_id(
    a_score: f32,
    a_id: &str,
    b_score: f32,
    b_id: &str,
) -> std::cmp::Ordering {
    b_score.total_cmp(&a_score).then_with(|| a_id.cmp(b_id))
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredVector {
    doc_id: String,
    idx: u32,
    vec: Vec<f32>,
}

/// Chunk vectors keyed by chunk id, all of one dimension.
#[derive(Debug, Clone, Default)]
pub struct VectorStore {
    dim: Option<usize>,
    vectors: BTreeMap<String, StoredVector>,
}

impl VectorStore {
    pub fn insert(&mut self, chunk: &Chunk, vec: Vec<f32>) -> Result<(), IndexError> {
        match self.dim {
            Some(expected) if expected != vec.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: vec.len(),
                });
            }
            None => self.dim = Some(vec.len()),
            _ => {}
        }
        self.vectors.insert(
            chunk.chunk_id.clone(),
            StoredVector {
                doc_id: chunk.doc_id.clone(),
                idx: chunk.idx,
                vec,
            },
        );
        Ok(())
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Brute-force cosine search.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<VectorHit>, IndexError> {
        let Some(expected) = self.dim else {
            return Ok(Vec::new());
        };
        if query.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: query.len(),
            });
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<VectorHit> = self
            .vectors
            .iter()
            .map(|(chunk_id, stored)| VectorHit {
                chunk_id: chunk_id.clone(),
                doc_id: stored.doc_id.clone(),
                idx: stored.idx,
                score: cosine_similarity(query, &stored.vec),
            })
            .collect();
        hits.sort_by(|a, b| by_score_then_id(a.score, &a.chunk_id, b.score, &b.chunk_id));
        hits.truncate(limit);
        Ok(hits)
    }
}
