//! Pluggable embedding providers for vector retrieval.
//!
//! Provides an async trait over embedding models, with a deterministic local
//! hash embedder (always available), OpenAI and Ollama HTTP embedders, and a
//! disabled provider that turns retrieval purely lexical.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{ConfigError, EmbeddingError};
use crate::text::tokenize;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text. Same input and model always give the same vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a batch of texts.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Dimensionality of the produced vectors (0 when disabled).
    fn dimensions(&self) -> usize;

    fn provider_name(&self) -> &str;

    /// Whether vector retrieval should run at all.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Hashed term-frequency embedder.
///
/// Each term is hashed to a dimension and its count accumulated; the vector is
/// L2-normalised. No model, no network, fully deterministic.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let words = tokenize(text);
        if words.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in &words {
            *tf.entry(word.as_str()).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = djb2(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        vector
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "hash"
    }
}

/// No-op provider. Vector retrieval yields nothing.
#[derive(Debug, Clone, Default)]
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }

    fn dimensions(&self) -> usize {
        0
    }

    fn provider_name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Cosine similarity of two vectors; 0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn parse_embedding(values: Option<&Vec<serde_json::Value>>) -> Result<Vec<f32>, EmbeddingError> {
    let values = values.ok_or_else(|| EmbeddingError::ResponseParse {
        message: "response has no embedding array".to_string(),
    })?;
    let vector: Vec<f32> = values
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect();
    if vector.is_empty() || vector.len() != values.len() {
        return Err(EmbeddingError::ResponseParse {
            message: "embedding array is empty or holds non-numeric values".to_string(),
        });
    }
    Ok(vector)
}

fn request_error(err: reqwest::Error) -> EmbeddingError {
    EmbeddingError::Request {
        message: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

/// OpenAI API embedder (uses text-embedding-3-small by default).
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    base_url: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| "text-embedding-3-small".into());
        let dims = match model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        };
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            dims,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".into()),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?
            .error_for_status()
            .map_err(request_error)?;
        let json: serde_json::Value = resp.json().await.map_err(|e| EmbeddingError::ResponseParse {
            message: e.to_string(),
        })?;
        parse_embedding(json["data"][0]["embedding"].as_array())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

/// Ollama embedder (uses local Ollama API).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    base_url: String,
}

impl OllamaEmbedder {
    pub fn new(model: Option<String>, base_url: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| "nomic-embed-text".into());
        let dims = match model.as_str() {
            "mxbai-embed-large" => 1024,
            "all-minilm" => 384,
            _ => 768,
        };
        Self {
            client: reqwest::Client::new(),
            model,
            dims,
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434".into()),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?
            .error_for_status()
            .map_err(request_error)?;
        let json: serde_json::Value = resp.json().await.map_err(|e| EmbeddingError::ResponseParse {
            message: e.to_string(),
        })?;
        parse_embedding(json["embeddings"][0].as_array())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }
}

/// Build the embedder selected by configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, ConfigError> {
    let model = Some(config.model.clone()).filter(|m| !m.is_empty());
    let embedder: Arc<dyn Embedder> = match config.provider {
        EmbeddingProviderKind::Hash => Arc::new(HashEmbedder::new(config.dimensions)),
        EmbeddingProviderKind::Disabled => Arc::new(DisabledEmbedder),
        EmbeddingProviderKind::Ollama => {
            Arc::new(OllamaEmbedder::new(model, config.base_url.clone()))
        }
        EmbeddingProviderKind::OpenAi => {
            let api_key =
                std::env::var(&config.api_key_env).map_err(|_| ConfigError::EnvVarMissing {
                    var: config.api_key_env.clone(),
                })?;
            Arc::new(OpenAiEmbedder::new(api_key, model, config.base_url.clone()))
        }
    };
    tracing::debug!(
        provider = embedder.provider_name(),
        dimensions = embedder.dimensions(),
        "Embedding provider ready"
    );
    Ok(embedder)
}
