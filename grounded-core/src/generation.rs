//! Generation providers that turn selected evidence into answer text.
//!
//! Providers only ever see the question and the evidence chosen by the
//! composer, never the corpus. A failing provider returns a
//! [`GenerationError`]; it must not return empty text as a success.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{GenerationConfig, GenerationProviderKind};
use crate::error::{ConfigError, GenerationError};

/// Instructions sent ahead of the evidence.
pub const SYSTEM_PROMPT: &str = "You answer questions using only the numbered evidence passages provided. \
Cite the passages that support each statement with their number in square brackets, for example [1]. \
Do not use outside knowledge. If the passages do not contain the answer, say that you cannot answer.";

/// Trait for answer generation backends.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Produce a complete answer.
    async fn generate(&self, question: &str, evidence: &[String])
    -> Result<String, GenerationError>;

    /// Produce an answer, sending text fragments to `tx` as they arrive.
    ///
    /// Returns the full text. Providers that cannot stream fall back to
    /// [`generate`](Self::generate) and send nothing.
    async fn generate_streaming(
        &self,
        question: &str,
        evidence: &[String],
        tx: mpsc::Sender<String>,
    ) -> Result<String, GenerationError> {
        drop(tx);
        self.generate(question, evidence).await
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

/// Number the evidence passages for the user turn.
pub fn build_user_prompt(question: &str, evidence: &[String]) -> String {
    let mut prompt = String::from("Evidence:\n");
    for (i, text) in evidence.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n", i + 1, text.trim()));
    }
    prompt.push_str("\nQuestion: ");
    prompt.push_str(question.trim());
    prompt
}

fn chat_messages(question: &str, evidence: &[String]) -> Value {
    json!([
        { "role": "system", "content": SYSTEM_PROMPT },
        { "role": "user", "content": build_user_prompt(question, evidence) },
    ])
}

/// Parse one `data: ...` line of an SSE body. `None` for `[DONE]` and noise.
pub fn parse_sse_line(line: &str) -> Option<Value> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return None;
    }
    serde_json::from_str(data).ok()
}

fn map_http_error(status: reqwest::StatusCode, body: &str) -> GenerationError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    GenerationError::Http {
        status: status.as_u16(),
        message,
    }
}

fn request_error(err: reqwest::Error) -> GenerationError {
    GenerationError::Request {
        message: err.to_string(),
    }
}

fn non_empty(text: String) -> Result<String, GenerationError> {
    if text.trim().is_empty() {
        Err(GenerationError::EmptyResponse)
    } else {
        Ok(text)
    }
}

async fn send_checked(response: reqwest::RequestBuilder) -> Result<reqwest::Response, GenerationError> {
    let response = response.send().await.map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(map_http_error(status, &body));
    }
    Ok(response)
}

/// Splits a chunked response body into trimmed, non-empty lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

async fn forward(tx: &mpsc::Sender<String>, fragment: &str) -> Result<(), GenerationError> {
    tx.send(fragment.to_string())
        .await
        .map_err(|_| GenerationError::Cancelled)
}

// ---------------------------------------------------------------------------
// OpenAI-compatible
// ---------------------------------------------------------------------------

/// OpenAI-compatible chat completions provider (OpenAI, vLLM, LM Studio, ...).
pub struct OpenAiCompatGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
    stream: bool,
}

impl OpenAiCompatGenerator {
    pub fn new(api_key: String, config: &GenerationConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream: config.stream,
        }
    }

    fn request(&self, question: &str, evidence: &[String], stream: bool) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.model,
            "messages": chat_messages(question, evidence),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        });
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatGenerator {
    async fn generate(
        &self,
        question: &str,
        evidence: &[String],
    ) -> Result<String, GenerationError> {
        let response = send_checked(self.request(question, evidence, false)).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::ResponseParse {
                message: e.to_string(),
            })?;
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GenerationError::ResponseParse {
                message: "missing choices[0].message.content".to_string(),
            })?;
        non_empty(text.to_string())
    }

    async fn generate_streaming(
        &self,
        question: &str,
        evidence: &[String],
        tx: mpsc::Sender<String>,
    ) -> Result<String, GenerationError> {
        if !self.stream {
            return self.generate(question, evidence).await;
        }
        let response = send_checked(self.request(question, evidence, true)).await?;

        let mut stream = std::pin::pin!(response.bytes_stream());
        let mut lines = LineBuffer::default();
        let mut full = String::new();
        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(request_error)?;
            for line in lines.push(&chunk) {
                if line.trim_start_matches("data:").trim() == "[DONE]" {
                    break 'read;
                }
                if let Some(data) = parse_sse_line(&line)
                    && let Some(content) = data["choices"][0]["delta"]["content"].as_str()
                    && !content.is_empty()
                {
                    full.push_str(content);
                    forward(&tx, content).await?;
                }
            }
        }
        debug!(chars = full.len(), "OpenAI-compatible stream finished");
        non_empty(full)
    }

    fn supports_streaming(&self) -> bool {
        self.stream
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

/// Local Ollama chat provider. Streams newline-delimited JSON.
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
    stream: bool,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream: config.stream,
        }
    }

    fn request(&self, question: &str, evidence: &[String], stream: bool) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.model,
            "messages": chat_messages(question, evidence),
            "stream": stream,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        self.client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    async fn generate(
        &self,
        question: &str,
        evidence: &[String],
    ) -> Result<String, GenerationError> {
        let response = send_checked(self.request(question, evidence, false)).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::ResponseParse {
                message: e.to_string(),
            })?;
        let text = json["message"]["content"]
            .as_str()
            .ok_or_else(|| GenerationError::ResponseParse {
                message: "missing message.content".to_string(),
            })?;
        non_empty(text.to_string())
    }

    async fn generate_streaming(
        &self,
        question: &str,
        evidence: &[String],
        tx: mpsc::Sender<String>,
    ) -> Result<String, GenerationError> {
        if !self.stream {
            return self.generate(question, evidence).await;
        }
        let response = send_checked(self.request(question, evidence, true)).await?;

        let mut stream = std::pin::pin!(response.bytes_stream());
        let mut lines = LineBuffer::default();
        let mut full = String::new();
        let mut done = false;
        while !done && let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(request_error)?;
            for line in lines.push(&chunk) {
                let data: Value =
                    serde_json::from_str(&line).map_err(|e| GenerationError::ResponseParse {
                        message: e.to_string(),
                    })?;
                if let Some(content) = data["message"]["content"].as_str()
                    && !content.is_empty()
                {
                    full.push_str(content);
                    forward(&tx, content).await?;
                }
                if data["done"].as_bool().unwrap_or(false) {
                    done = true;
                    break;
                }
            }
        }
        // Last object without a trailing newline.
        if !done
            && let Some(rest) = lines.finish()
            && let Ok(data) = serde_json::from_str::<Value>(&rest)
            && let Some(content) = data["message"]["content"].as_str()
        {
            full.push_str(content);
            forward(&tx, content).await?;
        }
        non_empty(full)
    }

    fn supports_streaming(&self) -> bool {
        self.stream
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

// ---------------------------------------------------------------------------
// Mock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum MockBehavior {
    Respond(String),
    Stream(Vec<String>),
    Fail(String),
    Empty,
}

/// Scripted provider for tests and offline demos. Counts its calls.
#[derive(Debug)]
pub struct MockGenerator {
    behavior: MockBehavior,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockGenerator {
    /// Always answer with `text`.
    pub fn with_response(text: &str) -> Self {
        Self::from_behavior(MockBehavior::Respond(text.to_string()))
    }

    /// Stream `tokens` one by one; the answer is their concatenation.
    pub fn streaming(tokens: &[&str]) -> Self {
        Self::from_behavior(MockBehavior::Stream(
            tokens.iter().map(|t| t.to_string()).collect(),
        ))
    }

    /// Always fail with a request error.
    pub fn failing(message: &str) -> Self {
        Self::from_behavior(MockBehavior::Fail(message.to_string()))
    }

    /// Return nothing, which counts as a failure.
    pub fn empty() -> Self {
        Self::from_behavior(MockBehavior::Empty)
    }

    /// Wait this long before answering (and between streamed tokens).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of generate calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn from_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl GenerationProvider for MockGenerator {
    async fn generate(
        &self,
        _question: &str,
        _evidence: &[String],
    ) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        match &self.behavior {
            MockBehavior::Respond(text) => Ok(text.clone()),
            MockBehavior::Stream(tokens) => Ok(tokens.concat()),
            MockBehavior::Fail(message) => Err(GenerationError::Request {
                message: message.clone(),
            }),
            MockBehavior::Empty => Err(GenerationError::EmptyResponse),
        }
    }

    async fn generate_streaming(
        &self,
        question: &str,
        evidence: &[String],
        tx: mpsc::Sender<String>,
    ) -> Result<String, GenerationError> {
        let MockBehavior::Stream(tokens) = &self.behavior else {
            return self.generate(question, evidence).await;
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        for token in tokens {
            self.pause().await;
            tx.send(token.clone())
                .await
                .map_err(|_| GenerationError::Cancelled)?;
        }
        Ok(tokens.concat())
    }

    fn supports_streaming(&self) -> bool {
        matches!(self.behavior, MockBehavior::Stream(_))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Build the generator selected by configuration. `None` means extractive.
pub fn create_generator(
    config: &GenerationConfig,
) -> Result<Option<Arc<dyn GenerationProvider>>, ConfigError> {
    let generator: Option<Arc<dyn GenerationProvider>> = match config.provider {
        GenerationProviderKind::Extractive => None,
        GenerationProviderKind::OpenAi => {
            let api_key =
                std::env::var(&config.api_key_env).map_err(|_| ConfigError::EnvVarMissing {
                    var: config.api_key_env.clone(),
                })?;
            Some(Arc::new(OpenAiCompatGenerator::new(api_key, config)))
        }
        GenerationProviderKind::Ollama => Some(Arc::new(OllamaGenerator::new(config))),
    };
    if let Some(generator) = &generator {
        debug!(
            provider = generator.name(),
            model = %config.model,
            streaming = generator.supports_streaming(),
            "Generation provider ready"
        );
    }
    Ok(generator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_user_prompt_numbers_evidence() {
        let prompt = build_user_prompt(
            " How long? ",
            &["First passage.".to_string(), " Second passage. ".to_string()],
        );
        assert_eq!(
            prompt,
            "Evidence:\n[1] First passage.\n[2] Second passage.\n\nQuestion: How long?"
        );
    }

    #[test]
    fn test_parse_sse_line() {
        let value = parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap();
        assert_eq!(value["choices"][0]["delta"]["content"], "Hi");
        assert!(parse_sse_line("data: [DONE]").is_none());
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("event: message").is_none());
    }

    #[test]
    fn test_map_http_error_prefers_api_message() {
        let err = map_http_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"Rate limit reached"}}"#,
        );
        assert!(matches!(
            err,
            GenerationError::Http { status: 429, ref message } if message == "Rate limit reached"
        ));

        let err = map_http_error(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(
            err.to_string(),
            "Generation provider returned HTTP 502: upstream down"
        );
    }

    #[test]
    fn test_line_buffer_handles_split_chunks() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push(b"data: one\n\nda"), vec!["data: one"]);
        assert_eq!(buffer.push(b"ta: two\n"), vec!["data: two"]);
        assert!(buffer.push(b"data: three").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("data: three"));
    }

    #[test]
    fn test_line_buffer_empty_finish() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push(b"a\r\nb\n"), vec!["a", "b"]);
        assert!(buffer.finish().is_none());
    }

    #[tokio::test]
    async fn test_mock_generator_counts_calls() {
        let mock = MockGenerator::with_response("Answer [1]");
        assert_eq!(mock.calls(), 0);
        let text = mock.generate("q", &["e".to_string()]).await.unwrap();
        assert_eq!(text, "Answer [1]");
        assert_eq!(mock.calls(), 1);
        assert!(!mock.supports_streaming());
    }

    #[tokio::test]
    async fn test_mock_generator_streams_tokens() {
        let mock = MockGenerator::streaming(&["Refunds ", "take ", "30 days [1]"]);
        let (tx, mut rx) = mpsc::channel(8);
        let text = mock.generate_streaming("q", &[], tx).await.unwrap();
        assert_eq!(text, "Refunds take 30 days [1]");
        let mut tokens = Vec::new();
        while let Some(token) = rx.recv().await {
            tokens.push(token);
        }
        assert_eq!(tokens, vec!["Refunds ", "take ", "30 days [1]"]);
    }

    #[tokio::test]
    async fn test_mock_streaming_cancelled_when_receiver_dropped() {
        let mock = MockGenerator::streaming(&["a", "b"]);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let err = mock.generate_streaming("q", &[], tx).await.unwrap_err();
        assert!(matches!(err, GenerationError::Cancelled));
    }

    #[tokio::test]
    async fn test_mock_failures() {
        assert!(matches!(
            MockGenerator::failing("boom").generate("q", &[]).await,
            Err(GenerationError::Request { .. })
        ));
        assert!(matches!(
            MockGenerator::empty().generate("q", &[]).await,
            Err(GenerationError::EmptyResponse)
        ));
    }

    #[test]
    fn test_create_generator() {
        let config = GenerationConfig::default();
        assert!(create_generator(&config).unwrap().is_none());

        let config = GenerationConfig {
            provider: GenerationProviderKind::Ollama,
            ..GenerationConfig::default()
        };
        let generator = create_generator(&config).unwrap().unwrap();
        assert_eq!(generator.name(), "ollama");

        let config = GenerationConfig {
            provider: GenerationProviderKind::OpenAi,
            api_key_env: "GROUNDED_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..GenerationConfig::default()
        };
        assert!(matches!(
            create_generator(&config),
            Err(ConfigError::EnvVarMissing { .. })
        ));
    }
}
