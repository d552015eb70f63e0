//! In-process BM25 index.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

use super::{ChunkIndex, LexicalHit, VectorHit, VectorStore, by_score_then_id};
use crate::error::IndexError;
use crate::text::tokenize;
use crate::types::Chunk;

/// Postings-list BM25 index with brute-force vector search.
#[derive(Debug, Clone)]
pub struct MemoryChunkIndex {
    k1: f32,
    b: f32,
    chunks: Vec<Chunk>,
    positions: HashMap<String, usize>,
    /// term -> (chunk position, term frequency)
    postings: HashMap<String, Vec<(usize, u32)>>,
    lengths: Vec<usize>,
    total_length: usize,
    vectors: VectorStore,
}

impl Default for MemoryChunkIndex {
    fn default() -> Self {
        Self::new(1.2, 0.75)
    }
}

impl MemoryChunkIndex {
    pub fn new(k1: f32, b: f32) -> Self {
        Self {
            k1,
            b,
            chunks: Vec::new(),
            positions: HashMap::new(),
            postings: HashMap::new(),
            lengths: Vec::new(),
            total_length: 0,
            vectors: VectorStore::default(),
        }
    }

    /// Add a chunk and, when embeddings are enabled, its vector.
    pub fn add_chunk(&mut self, chunk: Chunk, vector: Option<Vec<f32>>) -> Result<(), IndexError> {
        if self.positions.contains_key(&chunk.chunk_id) {
            return Err(IndexError::DuplicateChunk {
                chunk_id: chunk.chunk_id,
            });
        }
        if let Some(vec) = vector {
            self.vectors.insert(&chunk, vec)?;
        }

        let pos = self.chunks.len();
        let tokens = tokenize(&chunk.text);
        let mut tf: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.clone()).or_insert(0) += 1;
        }
        for (term, count) in tf {
            self.postings.entry(term).or_default().push((pos, count));
        }
        self.lengths.push(tokens.len());
        self.total_length += tokens.len();
        self.positions.insert(chunk.chunk_id.clone(), pos);
        self.chunks.push(chunk);
        Ok(())
    }

    fn bm25(&self, query: &str) -> Vec<(usize, f32)> {
        let n = self.chunks.len();
        if n == 0 {
            return Vec::new();
        }
        let avgdl = (self.total_length as f32 / n as f32).max(1.0);
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();

        let mut scores = vec![0.0f32; n];
        for term in &terms {
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            let df = postings.len() as f32;
            let idf = (1.0 + (n as f32 - df + 0.5) / (df + 0.5)).ln();
            for &(pos, tf) in postings {
                let tf = tf as f32;
                let dl = self.lengths[pos] as f32;
                let norm = self.k1 * (1.0 - self.b + self.b * dl / avgdl);
                scores[pos] += idf * tf * (self.k1 + 1.0) / (tf + norm);
            }
        }

        scores
            .into_iter()
            .enumerate()
            .filter(|(_, s)| *s > 0.0)
            .collect()
    }
}

#[async_trait]
impl ChunkIndex for MemoryChunkIndex {
    async fn lexical_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<LexicalHit>, IndexError> {
        let mut scored = self.bm25(query);
        scored.sort_by(|a, b| {
            by_score_then_id(
                a.1,
                &self.chunks[a.0].chunk_id,
                b.1,
                &self.chunks[b.0].chunk_id,
            )
        });
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(pos, score)| {
                let chunk = &self.chunks[pos];
                LexicalHit {
                    chunk_id: chunk.chunk_id.clone(),
                    doc_id: chunk.doc_id.clone(),
                    idx: chunk.idx,
                    score,
                    text: chunk.text.clone(),
                }
            })
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>, IndexError> {
        self.vectors.search(query_vec, limit)
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>, IndexError> {
        Ok(chunk_ids
            .iter()
            .filter_map(|id| self.positions.get(id).map(|&pos| self.chunks[pos].clone()))
            .collect())
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn vector_dimensions(&self) -> Option<usize> {
        self.vectors.dimensions()
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}
