//! HTTP gateway (§6.1): the two dispatch endpoints plus a health probe.
//!
//! `POST /api/threads/{thread_id}/messages` is non-streaming and returns a single
//! JSON envelope. `POST /api/threads/{thread_id}/messages/stream` is SSE and uses the
//! hub. Both share the same validated-request → dispatch pipeline.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::Sse;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::dispatch::{self, DispatchRequest, GatewayState};
use crate::errors::GatewayError;
use crate::hub::HubEvent;
use crate::sse::subscriber_into_sse;

/// Request body shared by both dispatch endpoints (§6.1).
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    /// Always `"user"` on this endpoint; kept explicit to mirror the wire contract.
    #[serde(default = "default_role")]
    pub role: String,
    /// User-supplied content.
    pub content: String,
    /// Optional provider override.
    #[serde(default)]
    pub provider: Option<String>,
    /// Optional model override.
    #[serde(default)]
    pub model: Option<String>,
    /// Reserved for future private/shared thread scoping; currently unused.
    #[serde(default)]
    pub scope: Option<String>,
    /// Per-request memory opt-in (§6.1).
    #[serde(default)]
    pub use_memory: bool,
    /// Per-request query-rewriter opt-in (§6.1).
    #[serde(default)]
    pub use_query_rewriter: bool,
}

fn default_role() -> String {
    "user".to_string()
}

/// Non-streaming response envelope (§6.1).
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Thread the message was appended to.
    pub thread_id: String,
    /// Final assistant content.
    pub assistant_content: String,
    /// Provider timing/usage metadata.
    pub provider_meta: ProviderMeta,
    /// Router candidate scores, for observability.
    pub scores: Vec<crate::router::CandidateScore>,
}

/// Timing/usage metadata surfaced alongside the assistant response.
#[derive(Debug, Serialize)]
pub struct ProviderMeta {
    /// Provider selected.
    pub provider: String,
    /// Model selected.
    pub model: String,
    /// Time to first upstream byte, ms.
    pub ttft_ms: u64,
    /// Pacer queue-wait, ms.
    pub queue_wait_ms: u64,
    /// Retries the leader performed.
    pub retries: u32,
}

/// Health response body.
#[derive(Debug, Serialize)]
pub struct GatewayHealthResponse {
    /// Always `"healthy"` once the process is serving.
    pub status: &'static str,
    /// Current rolling metrics snapshot.
    pub metrics: MetricsSummary,
}

/// Flattened view of [`crate::metrics::MetricsSnapshot`] for the health endpoint.
#[derive(Debug, Serialize)]
pub struct MetricsSummary {
    /// p95 time-to-first-token, ms.
    pub ttft_p95_ms: u64,
    /// Error rate over the rolling window.
    pub error_rate: f64,
    /// Coalescer leader count in the window.
    pub coalesce_leaders: u64,
    /// Coalescer follower count in the window.
    pub coalesce_followers: u64,
}

/// Validate request body: org header present, thread_id and content non-empty.
pub fn validate_message_request(
    headers: &HeaderMap,
    thread_id: &str,
    body: &MessageRequest,
) -> Result<String, GatewayError> {
    let org_id = headers.get("x-org-id").and_then(|v| v.to_str().ok());
    dispatch::validate(thread_id, &body.content, org_id)?;
    Ok(org_id.unwrap_or_default().to_string())
}

async fn handle_message(
    State(state): State<Arc<GatewayState>>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, GatewayError> {
    validate_message_request(&headers, &thread_id, &body)?;

    let request = DispatchRequest {
        thread_id: thread_id.clone(),
        content: body.content.trim().to_string(),
        provider: body.provider.clone(),
        model: body.model.clone(),
        use_memory: body.use_memory,
        use_query_rewriter: body.use_query_rewriter,
    };

    let outcome = dispatch::dispatch(&state, request).await?;

    Ok(Json(MessageResponse {
        thread_id,
        assistant_content: outcome.assistant_content,
        provider_meta: ProviderMeta {
            provider: outcome.provider,
            model: outcome.model,
            ttft_ms: outcome.ttft_ms,
            queue_wait_ms: outcome.queue_wait_ms,
            retries: outcome.retries,
        },
        scores: outcome.scores,
    }))
}

async fn handle_message_stream(
    State(state): State<Arc<GatewayState>>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MessageRequest>,
) -> Result<
    (
        HeaderMap,
        Sse<impl futures::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>>,
    ),
    GatewayError,
> {
    validate_message_request(&headers, &thread_id, &body)?;

    let request = DispatchRequest {
        thread_id: thread_id.clone(),
        content: body.content.trim().to_string(),
        provider: body.provider.clone(),
        model: body.model.clone(),
        use_memory: body.use_memory,
        use_query_rewriter: body.use_query_rewriter,
    };

    // §4.5 step 6: subscribe BEFORE entering the coalescer, so a follower never
    // misses a delta published between leader-entry and its own subscribe call.
    // `resolve_route` is the single source of truth for the coalesce key so this
    // subscription and `dispatch`'s own publishes can never derive different keys
    // for the same request (§9).
    let (_decision, coalesce_key, _context_messages) = dispatch::resolve_route(&state, &request).await;

    let subscriber = state.hub.subscribe(coalesce_key.clone(), crate::hub::DEFAULT_BUFFER_SIZE).await;

    // §4.5 step 2 / §6.2 item 1: force proxy flush within 200ms of handler entry.
    // Emitted immediately after subscribing, before the dispatch task has a chance
    // to do any routing/coalescing/upstream work of its own.
    state.hub.publish(&coalesce_key, HubEvent::Ping).await;

    let state = Arc::clone(&state);
    tokio::spawn(async move {
        let _ = dispatch::dispatch(&state, request).await;
    });

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response_headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));

    let heartbeat = std::time::Duration::from_millis(state.settings.heartbeat.interval_ms);
    Ok((response_headers, subscriber_into_sse(subscriber, heartbeat)))
}

async fn handle_health(State(state): State<Arc<GatewayState>>) -> Json<GatewayHealthResponse> {
    let snapshot = state.metrics.snapshot();
    Json(GatewayHealthResponse {
        status: "healthy",
        metrics: MetricsSummary {
            ttft_p95_ms: snapshot.ttft_ms.p95,
            error_rate: snapshot.error_rate,
            coalesce_leaders: snapshot.coalesce_leaders,
            coalesce_followers: snapshot.coalesce_followers,
        },
    })
}

/// Build the gateway router: message, message/stream, and health routes.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/threads/{thread_id}/messages", post(handle_message))
        .route("/api/threads/{thread_id}/messages/stream", post(handle_message_stream))
        .route("/health", get(handle_health))
        .with_state(Arc::new(state))
}

/// Run the HTTP server; binds to `bind_addr` (e.g. `0.0.0.0:8080`).
/// Graceful shutdown on Ctrl+C (SIGINT) and SIGTERM (Unix); in-flight requests
/// complete before exit.
pub async fn run_http(state: GatewayState, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(event = "gateway.listening", bind_addr, "gateway listening (Ctrl+C/SIGTERM to stop)");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!(event = "gateway.stopped", "gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let () = ctrl_c.await.unwrap_or(());
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn validate_rejects_missing_org_header() {
        let headers = HeaderMap::new();
        let body = MessageRequest {
            role: "user".into(),
            content: "hi".into(),
            provider: None,
            model: None,
            scope: None,
            use_memory: false,
            use_query_rewriter: false,
        };
        assert!(validate_message_request(&headers, "t1", &body).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_request() {
        let mut headers = HeaderMap::new();
        headers.insert("x-org-id", HeaderValue::from_static("org1"));
        let body = MessageRequest {
            role: "user".into(),
            content: "hi".into(),
            provider: None,
            model: None,
            scope: None,
            use_memory: false,
            use_query_rewriter: false,
        };
        assert!(validate_message_request(&headers, "t1", &body).is_ok());
    }
}
