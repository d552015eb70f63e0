//! axum router and server loop.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{ApiError, EvalRequest};
use crate::engine::{QueryEngine, QueryRequest, QueryResponse};
use crate::eval::{EvalHarness, EvalRun, dataset_from_values};
use crate::streaming::StreamCoordinator;

/// Everything the handlers need. Read-only after startup.
#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: QueryEngine,
    pub coordinator: StreamCoordinator,
    pub harness: EvalHarness,
}

impl AppState {
    pub fn new(engine: QueryEngine, harness: EvalHarness) -> Self {
        Self {
            coordinator: StreamCoordinator::new(engine.clone()),
            engine,
            harness,
        }
    }
}

pub type SharedState = Arc<AppState>;

/// Build the router with `/health`, `/api/query`, `/api/query/stream` and `/api/eval`.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/query", post(query_handler))
        .route("/api/query/stream", post(stream_handler))
        .route("/api/eval", post(eval_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let index = state.engine.retriever().index();
    Json(serde_json::json!({
        "status": "ok",
        "chunks": index.chunk_count(),
        "backend": index.backend_name(),
        "embeddings": state.engine.retriever().vector_enabled(),
        "provider": state.engine.composer().provider_name(),
    }))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

async fn query_handler(
    State(state): State<SharedState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let request = body(payload)?;
    let response = state.engine.query(request).await?;
    Ok(Json(response))
}

async fn stream_handler(
    State(state): State<SharedState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    let rx = state.coordinator.start(request)?;
    let events = ReceiverStream::new(rx).map(|event| Event::default().event(event.name()).json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn eval_handler(
    State(state): State<SharedState>,
    payload: Result<Json<EvalRequest>, JsonRejection>,
) -> Result<Json<EvalRun>, ApiError> {
    let request = body(payload)?;
    let name = request
        .dataset
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "api".to_string());
    let dataset = dataset_from_values(name, request.cases)?;
    let k = request.k.unwrap_or(state.engine.config().eval.k);

    let run = state.harness.run(&dataset, k).await?;
    Ok(Json(if request.include_cases {
        run
    } else {
        run.summary()
    }))
}

/// Serve on the configured host and port until ctrl-c.
pub async fn run(state: SharedState) -> Result<(), std::io::Error> {
    let gateway = &state.engine.config().gateway;
    let addr = format!("{}:{}", gateway.host, gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

/// Resolves on ctrl-c. If the handler cannot be installed the server keeps
/// running until the process is killed.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => {
            warn!(error = %err, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::embeddings::DisabledEmbedder;
    use crate::eval::InMemoryRunStore;
    use crate::index::MemoryChunkIndex;
    use crate::types::Chunk;
    use axum::body::Body;
    use tower::ServiceExt;

    fn state() -> SharedState {
        let mut index = MemoryChunkIndex::default();
        index
            .add_chunk(
                Chunk::new("refunds", 0, "Refunds are issued within 30 days of purchase."),
                None,
            )
            .unwrap();
        let engine = QueryEngine::new(
            EngineConfig::default(),
            Arc::new(index),
            Arc::new(DisabledEmbedder),
            None,
        )
        .unwrap();
        let harness = EvalHarness::new(engine.clone(), Arc::new(InMemoryRunStore::new()));
        Arc::new(AppState::new(engine, harness))
    }

    #[test]
    fn test_router_builds() {
        let _app = router(state());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let req = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(router(state()), req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["chunks"], 1);
        assert_eq!(json["embeddings"], false);
        assert_eq!(json["provider"], "extractive");
    }
}
