use crate::agent::{Agent, AgentConfig, AgentError, ChatProvider, ChunkStream};
use crate::protocol::{ChatRequest, ErrorResponse, EVENT_STREAM_CONTENT_TYPE, StreamEvent};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub struct ServerConfig {
    pub listen: String,
    pub agent: AgentConfig,
}

struct ServerState {
    provider: Arc<dyn ChatProvider>,
}

type ServerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Messages array is required.")]
    InvalidRequest,
    #[error("Failed to get response from AI. Please try again.")]
    UpstreamFailure(#[source] AgentError),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::InvalidRequest => StatusCode::BAD_REQUEST,
            RelayError::UpstreamFailure(err) => {
                match err {
                    AgentError::Api { status, body } => {
                        tracing::error!(%status, %body, "provider rejected chat request")
                    }
                    other => tracing::error!(error = %other, "provider call failed"),
                }
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let agent = Agent::new(config.agent)?;
    let app = router(Arc::new(agent));

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!("relaychat server listening on http://{}", config.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("relaychat server stopped");
    Ok(())
}

fn router(provider: Arc<dyn ChatProvider>) -> axum::Router {
    let state = Arc::new(ServerState { provider });

    axum::Router::new()
        .route("/api/chat", post(chat))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Response, RelayError> {
    let request: ChatRequest = serde_json::from_slice(&body).map_err(|err| {
        tracing::debug!(error = %err, "rejecting unparsable chat request");
        RelayError::InvalidRequest
    })?;
    let messages = request
        .messages
        .filter(|messages| !messages.is_empty())
        .ok_or(RelayError::InvalidRequest)?;

    tracing::info!(history = messages.len() - 1, "relaying chat turn");

    // Open the upstream call before committing to a 200 so that early
    // failures still get a proper error body.
    let chunks = state
        .provider
        .stream_chat(&messages)
        .await
        .map_err(RelayError::UpstreamFailure)?;

    let (lines, receiver) = mpsc::channel(32);
    tokio::spawn(relay_chunks(chunks, lines));

    Ok((
        [(CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE)],
        Body::from_stream(ReceiverStream::new(receiver)),
    )
        .into_response())
}

type LineSender = mpsc::Sender<Result<String, io::Error>>;

/// Re-frames provider chunks as event lines. Returning drops `chunks`, which
/// cancels the upstream request.
async fn relay_chunks(mut chunks: ChunkStream, lines: LineSender) {
    loop {
        let next = tokio::select! {
            next = chunks.next() => next,
            _ = lines.closed() => {
                tracing::debug!("client disconnected, cancelling upstream call");
                return;
            }
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                tracing::error!(error = %err, "provider stream failed");
                // An error item aborts the chunked body instead of ending it cleanly.
                let _ = lines.send(Err(io::Error::other("upstream failure"))).await;
                return;
            }
            None => return,
        };

        if let Some(call) = chunk.function_call() {
            tracing::info!(tool = %call.name, "provider requested tool call");
            send_event(&lines, StreamEvent::ToolCall(call.to_tool_call())).await;
            return;
        }

        if let Some(text) = chunk.text() {
            if !send_event(&lines, StreamEvent::Text(text.to_string())).await {
                return;
            }
        }
    }
}

async fn send_event(lines: &LineSender, event: StreamEvent) -> bool {
    let line = match event.to_line() {
        Ok(line) => line,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode stream event");
            return false;
        }
    };
    lines.send(Ok(line)).await.is_ok()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
