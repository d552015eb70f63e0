//! JSONL corpus loading and index construction.
//!
//! One chunk per line: `{"doc_id": "...", "idx": 0, "text": "...", "chunk_id": "..."}`.
//! `chunk_id` is optional and defaults to `{doc_id}#{idx}`. Blank lines are
//! ignored. Chunking itself happens upstream; this only reads the result.

use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{ChunkIndex, MemoryChunkIndex, TantivyChunkIndex};
use crate::config::{CorpusConfig, IndexBackend};
use crate::embeddings::Embedder;
use crate::error::{IndexError, Result};
use crate::types::{Chunk, default_chunk_id};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CorpusLine {
    #[serde(default)]
    chunk_id: Option<String>,
    doc_id: String,
    idx: u32,
    text: String,
}

/// Parse JSONL corpus text into chunks.
pub fn parse_corpus(input: &str) -> std::result::Result<Vec<Chunk>, IndexError> {
    let mut chunks = Vec::new();
    for (i, line) in input.lines().enumerate() {
        let line_no = i + 1;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: CorpusLine =
            serde_json::from_str(line).map_err(|e| IndexError::Corpus {
                line: line_no,
                message: e.to_string(),
            })?;
        if parsed.doc_id.trim().is_empty() {
            return Err(IndexError::Corpus {
                line: line_no,
                message: "doc_id must not be empty".to_string(),
            });
        }
        let chunk_id = parsed
            .chunk_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| default_chunk_id(&parsed.doc_id, parsed.idx));
        chunks.push(Chunk {
            chunk_id,
            doc_id: parsed.doc_id,
            idx: parsed.idx,
            text: parsed.text,
        });
    }
    Ok(chunks)
}

/// Read and parse a JSONL corpus file.
pub fn load_corpus(path: &Path) -> Result<Vec<Chunk>> {
    let input = std::fs::read_to_string(path)?;
    Ok(parse_corpus(&input)?)
}

/// Embed every chunk and build the configured backend.
///
/// With a disabled embedder no vectors are stored and vector retrieval
/// returns nothing.
pub async fn build_index(
    config: &CorpusConfig,
    chunks: Vec<Chunk>,
    embedder: &dyn Embedder,
) -> Result<Arc<dyn ChunkIndex>> {
    let mut entries = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let vector = if embedder.is_enabled() {
            Some(embedder.embed(&chunk.text).await?)
        } else {
            None
        };
        entries.push((chunk, vector));
    }

    let index: Arc<dyn ChunkIndex> = match config.backend {
        IndexBackend::Memory => {
            let mut index = MemoryChunkIndex::new(config.bm25_k1, config.bm25_b);
            for (chunk, vector) in entries {
                index.add_chunk(chunk, vector)?;
            }
            Arc::new(index)
        }
        IndexBackend::Tantivy => Arc::new(TantivyChunkIndex::build(entries)?),
    };

    info!(
        backend = index.backend_name(),
        chunks = index.chunk_count(),
        vector_dimensions = ?index.vector_dimensions(),
        embedder = embedder.provider_name(),
        "Chunk index built"
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{DisabledEmbedder, HashEmbedder};
    use pretty_assertions::assert_eq;

    const CORPUS: &str = r#"
{"doc_id": "policy", "idx": 0, "text": "Refunds are issued within 30 days."}

{"doc_id": "policy", "idx": 1, "text": "Store credit never expires.", "chunk_id": "credit"}
"#;

    #[test]
    fn test_parse_corpus_defaults_chunk_id() {
        let chunks = parse_corpus(CORPUS).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_id, "policy#0");
        assert_eq!(chunks[1].chunk_id, "credit");
        assert_eq!(chunks[1].idx, 1);
    }

    #[test]
    fn test_parse_corpus_reports_line_numbers() {
        let err = parse_corpus("{\"doc_id\":\"a\",\"idx\":0,\"text\":\"x\"}\n{oops").unwrap_err();
        assert!(matches!(err, IndexError::Corpus { line: 2, .. }));

        let err = parse_corpus("{\"doc_id\":\" \",\"idx\":0,\"text\":\"x\"}").unwrap_err();
        assert!(err.to_string().contains("doc_id"));
    }

    #[test]
    fn test_load_corpus_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.jsonl");
        std::fs::write(&path, CORPUS).unwrap();
        assert_eq!(load_corpus(&path).unwrap().len(), 2);
        assert!(load_corpus(&dir.path().join("missing.jsonl")).is_err());
    }

    #[tokio::test]
    async fn test_build_index_for_each_backend() {
        let chunks = parse_corpus(CORPUS).unwrap();
        for backend in [IndexBackend::Memory, IndexBackend::Tantivy] {
            let config = CorpusConfig {
                backend,
                ..CorpusConfig::default()
            };
            let index = build_index(&config, chunks.clone(), &HashEmbedder::new(32))
                .await
                .unwrap();
            assert_eq!(index.chunk_count(), 2);
            assert_eq!(index.vector_dimensions(), Some(32));
        }
    }

    #[tokio::test]
    async fn test_build_index_without_embeddings() {
        let chunks = parse_corpus(CORPUS).unwrap();
        let index = build_index(&CorpusConfig::default(), chunks, &DisabledEmbedder)
            .await
            .unwrap();
        assert_eq!(index.vector_dimensions(), None);
    }
}
