//! Streaming protocol coordinator.
//!
//! Every stream follows
//! `retrieval -> token* -> citations -> done`, with an optional `error`
//! notification before `citations` when the pipeline failed internally.
//! `done` always carries the final [`AnswerResult`] and is always last.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::StreamingConfig;
use crate::engine::{QueryEngine, QueryRequest};
use crate::error::{StreamError, ValidationError};
use crate::types::{AnswerResult, Citation, RefusalReason, RetrievalCandidate};

/// One event on the wire. JSON carries the kind in an `event` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Retrieval { candidates: Vec<RetrievalCandidate> },
    Token { text: String },
    Citations { citations: Vec<Citation> },
    Error { message: String },
    Done { result: AnswerResult },
}

impl StreamEvent {
    /// Event name, as used for the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Retrieval { .. } => "retrieval",
            StreamEvent::Token { .. } => "token",
            StreamEvent::Citations { .. } => "citations",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }
}

/// Protocol position of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Start,
    RetrievalEmitted,
    TokenEmitted,
    Errored,
    CitationsEmitted,
    Done,
}

impl StreamState {
    pub fn name(self) -> &'static str {
        match self {
            StreamState::Start => "start",
            StreamState::RetrievalEmitted => "retrieval_emitted",
            StreamState::TokenEmitted => "token_emitted",
            StreamState::Errored => "errored",
            StreamState::CitationsEmitted => "citations_emitted",
            StreamState::Done => "done",
        }
    }

    /// The state after emitting `event`, or an error if it is out of order.
    ///
    /// `error` is accepted from any state before `citations`.
    pub fn advance(self, event: &StreamEvent) -> Result<StreamState, StreamError> {
        use StreamState::*;
        let next = match (self, event) {
            (Start, StreamEvent::Retrieval { .. }) => RetrievalEmitted,
            (RetrievalEmitted | TokenEmitted, StreamEvent::Token { .. }) => TokenEmitted,
            (Start | RetrievalEmitted | TokenEmitted, StreamEvent::Error { .. }) => Errored,
            (RetrievalEmitted | TokenEmitted | Errored, StreamEvent::Citations { .. }) => {
                CitationsEmitted
            }
            (CitationsEmitted, StreamEvent::Done { .. }) => Done,
            _ => {
                return Err(StreamError::OutOfOrder {
                    state: self.name(),
                    event: event.name(),
                });
            }
        };
        Ok(next)
    }

    pub fn is_terminal(self) -> bool {
        self == StreamState::Done
    }
}

/// Sends events in protocol order over the bounded channel.
struct Emitter {
    tx: mpsc::Sender<StreamEvent>,
    state: StreamState,
}

impl Emitter {
    async fn emit(&mut self, event: StreamEvent) -> Result<(), StreamError> {
        let next = self.state.advance(&event)?;
        self.tx
            .send(event)
            .await
            .map_err(|_| StreamError::Closed)?;
        self.state = next;
        Ok(())
    }
}

/// Runs one query per stream and publishes its events.
#[derive(Debug, Clone)]
pub struct StreamCoordinator {
    engine: QueryEngine,
    config: StreamingConfig,
}

impl StreamCoordinator {
    pub fn new(engine: QueryEngine) -> Self {
        let config = engine.config().streaming.clone();
        Self { engine, config }
    }

    /// Validate the request and start streaming.
    ///
    /// Dropping the receiver cancels the stream, including any in-flight
    /// generation.
    pub fn start(
        &self,
        request: QueryRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ValidationError> {
        self.engine.validate(&request.question)?;
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut emitter = Emitter {
                tx,
                state: StreamState::Start,
            };
            match coordinator.drive(&request, &mut emitter).await {
                Ok(()) => debug!("Stream finished"),
                Err(StreamError::Closed) => debug!("Stream cancelled by consumer"),
                Err(err) => error!(error = %err, "Stream protocol violation"),
            }
        });
        Ok(rx)
    }

    async fn drive(&self, request: &QueryRequest, emitter: &mut Emitter) -> Result<(), StreamError> {
        let question = request.question.as_str();
        let composer = self.engine.composer();
        let verdict = self.engine.scanner().scan(question);

        let retrieved = if verdict.is_injection {
            Ok(Vec::new())
        } else {
            self.engine
                .retriever()
                .retrieve(question, &self.engine.params(request.top_k))
                .await
        };

        let candidates = match retrieved {
            Ok(candidates) => candidates,
            Err(err) => {
                emitter
                    .emit(StreamEvent::Retrieval {
                        candidates: Vec::new(),
                    })
                    .await?;
                let result = composer.from_failure(question, &err);
                return finish(emitter, result).await;
            }
        };

        emitter
            .emit(StreamEvent::Retrieval {
                candidates: self.visible(&candidates),
            })
            .await?;

        let (token_tx, mut token_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let watch = emitter.tx.clone();
        let compose = composer.compose_streaming(question, &candidates, &verdict, token_tx);
        tokio::pin!(compose);

        let result = loop {
            tokio::select! {
                _ = watch.closed() => return Err(StreamError::Closed),
                result = &mut compose => break result,
                Some(text) = token_rx.recv() => {
                    emitter.emit(StreamEvent::Token { text }).await?;
                }
            }
        };
        while let Ok(text) = token_rx.try_recv() {
            emitter.emit(StreamEvent::Token { text }).await?;
        }

        finish(emitter, result).await
    }

    fn visible(&self, candidates: &[RetrievalCandidate]) -> Vec<RetrievalCandidate> {
        candidates
            .iter()
            .cloned()
            .map(|mut c| {
                if self.config.redact_retrieval_text {
                    c.text_preview.clear();
                }
                c
            })
            .collect()
    }
}

/// Emit the closing events: `error` on internal failure, then `citations` and `done`.
async fn finish(emitter: &mut Emitter, result: AnswerResult) -> Result<(), StreamError> {
    if result.refusal_reason == Some(RefusalReason::InternalError) {
        emitter
            .emit(StreamEvent::Error {
                message: RefusalReason::InternalError.message().to_string(),
            })
            .await?;
    }
    emitter
        .emit(StreamEvent::Citations {
            citations: result.citations.clone(),
        })
        .await?;
    emitter.emit(StreamEvent::Done { result }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn retrieval() -> StreamEvent {
        StreamEvent::Retrieval {
            candidates: Vec::new(),
        }
    }

    fn token() -> StreamEvent {
        StreamEvent::Token {
            text: "t".to_string(),
        }
    }

    fn citations() -> StreamEvent {
        StreamEvent::Citations {
            citations: Vec::new(),
        }
    }

    fn error() -> StreamEvent {
        StreamEvent::Error {
            message: "m".to_string(),
        }
    }

    fn done() -> StreamEvent {
        StreamEvent::Done {
            result: AnswerResult::refusal("q", RefusalReason::InsufficientEvidence),
        }
    }

    fn run(events: &[StreamEvent]) -> Result<StreamState, StreamError> {
        events
            .iter()
            .try_fold(StreamState::Start, |state, event| state.advance(event))
    }

    #[test]
    fn test_valid_sequences() {
        assert_eq!(run(&[retrieval(), citations(), done()]), Ok(StreamState::Done));
        assert_eq!(
            run(&[retrieval(), token(), token(), citations(), done()]),
            Ok(StreamState::Done)
        );
        assert_eq!(
            run(&[retrieval(), token(), error(), citations(), done()]),
            Ok(StreamState::Done)
        );
        assert_eq!(run(&[error(), citations(), done()]), Ok(StreamState::Done));
    }

    #[test]
    fn test_out_of_order_events_rejected() {
        assert!(run(&[token()]).is_err());
        assert!(run(&[retrieval(), done()]).is_err());
        assert!(run(&[retrieval(), retrieval()]).is_err());
        assert!(run(&[retrieval(), citations(), token()]).is_err());
        assert!(run(&[retrieval(), citations(), error()]).is_err());
        assert_eq!(
            run(&[retrieval(), citations(), done(), done()]),
            Err(StreamError::OutOfOrder {
                state: "done",
                event: "done"
            })
        );
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(StreamEvent::Token {
            text: "Refunds".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"event": "token", "text": "Refunds"}));
        assert_eq!(done().name(), "done");
        assert!(StreamState::Done.is_terminal());
    }
}
