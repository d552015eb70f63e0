//! Tantivy-backed chunk index.
//!
//! Lexical scoring is tantivy's BM25 over an in-RAM index. Vectors live next to
//! it in a [`VectorStore`]. The writer is dropped after the initial commit, so
//! the index is read-only once built.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, STORED, STRING, Schema, TEXT, Value};
use tantivy::{Index, IndexReader, ReloadPolicy, TantivyDocument, doc};

use super::{ChunkIndex, LexicalHit, VectorHit, VectorStore, by_score_then_id};
use crate::error::IndexError;
use crate::text::tokenize;
use crate::types::Chunk;

const WRITER_HEAP_BYTES: usize = 50_000_000;

pub struct TantivyChunkIndex {
    index: Index,
    reader: IndexReader,
    chunk_id_field: Field,
    doc_id_field: Field,
    idx_field: Field,
    text_field: Field,
    chunks: BTreeMap<String, Chunk>,
    vectors: VectorStore,
}

impl std::fmt::Debug for TantivyChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TantivyChunkIndex")
            .field("chunks", &self.chunks.len())
            .field("vector_dimensions", &self.vectors.dimensions())
            .finish()
    }
}

impl TantivyChunkIndex {
    /// Index every chunk, commit once and open a reader.
    pub fn build(
        entries: impl IntoIterator<Item = (Chunk, Option<Vec<f32>>)>,
    ) -> Result<Self, IndexError> {
        let mut schema_builder = Schema::builder();
        let chunk_id_field = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let doc_id_field = schema_builder.add_text_field("doc_id", STRING | STORED);
        let idx_field = schema_builder.add_u64_field("idx", STORED);
        let text_field = schema_builder.add_text_field("text", TEXT | STORED);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        let mut writer = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;

        let mut chunks = BTreeMap::new();
        let mut vectors = VectorStore::default();
        for (chunk, vector) in entries {
            if chunks.contains_key(&chunk.chunk_id) {
                return Err(IndexError::DuplicateChunk {
                    chunk_id: chunk.chunk_id,
                });
            }
            if let Some(vec) = vector {
                vectors.insert(&chunk, vec)?;
            }
            writer.add_document(doc!(
                chunk_id_field => chunk.chunk_id.as_str(),
                doc_id_field => chunk.doc_id.as_str(),
                idx_field => u64::from(chunk.idx),
                text_field => chunk.text.as_str(),
            ))?;
            chunks.insert(chunk.chunk_id.clone(), chunk);
        }
        writer.commit()?;
        drop(writer);

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            chunk_id_field,
            doc_id_field,
            idx_field,
            text_field,
            chunks,
            vectors,
        })
    }

    fn stored_str(doc: &TantivyDocument, field: Field) -> String {
        doc.get_first(field)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait]
impl ChunkIndex for TantivyChunkIndex {
    async fn lexical_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<LexicalHit>, IndexError> {
        // Query syntax is not exposed; terms are matched as a disjunction.
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() || limit == 0 || self.chunks.is_empty() {
            return Ok(Vec::new());
        }
        let query_text = terms.into_iter().collect::<Vec<_>>().join(" ");

        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        let (parsed, _errors) = parser.parse_query_lenient(&query_text);
        let top_docs = searcher.search(&parsed, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            hits.push(LexicalHit {
                chunk_id: Self::stored_str(&doc, self.chunk_id_field),
                doc_id: Self::stored_str(&doc, self.doc_id_field),
                idx: doc
                    .get_first(self.idx_field)
                    .and_then(|v| v.as_u64())
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or_default(),
                score,
                text: Self::stored_str(&doc, self.text_field),
            });
        }
        hits.sort_by(|a, b| by_score_then_id(a.score, &a.chunk_id, b.score, &b.chunk_id));
        Ok(hits)
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
            .filter_map(|id| self.chunks.get(id).cloned())
            .collect())
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn vector_dimensions(&self) -> Option<usize> {
        self.vectors.dimensions()
    }

    fn backend_name(&self) -> &str {
        "tantivy"
    }
}
