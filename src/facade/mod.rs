//! Client-facing HTTP surface: the `/v1` facade routes behind the
//! client-auth middleware, plus the orchestration helpers the two facade
//! handlers share.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;

use crate::convert::unix_seconds;
use crate::error::GatewayError;
use crate::proto::openai::{ModelEntry, ModelList};
use crate::relay::{RequestMeta, StreamStats, UpstreamInfo};
use crate::server::{AppState, ClientKey};

pub mod anthropic;
pub mod error;
pub mod openai;

use error::openai_error;

const STREAM_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Facade routes mounted under `/v1`, wrapped in the client-auth layer.
pub fn routes(state: Arc<AppState>) -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/v1/messages", post(anthropic::create_message))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/responses", post(openai::responses))
        .route("/v1/models", get(list_models))
        .layer(middleware::from_fn_with_state(state, client_auth))
}

/// Reads the bearer token (or `x-api-key`) and stores it as the request's
/// client key. When a shared `CLIENT_TOKEN` is configured, equality with it
/// is enforced here as well; the per-pool lookup stays the routing key.
pub async fn client_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = extract_client_token(req.headers());
    if token.is_empty() {
        return unauthorized();
    }
    if let Some(expected) = state.client_token.as_deref() {
        if token != expected {
            return unauthorized();
        }
    }
    req.extensions_mut().insert(ClientKey(token));
    next.run(req).await
}

fn unauthorized() -> Response {
    openai_error(
        StatusCode::UNAUTHORIZED,
        "invalid_request_error",
        "unauthorized",
        "missing or invalid credentials",
    )
}

pub fn extract_client_token(headers: &HeaderMap) -> String {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if let Some(bearer) = authorization.strip_prefix("Bearer ") {
        let bearer = bearer.trim();
        if !bearer.is_empty() {
            return bearer.to_string();
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// `GET /v1/models` — the model names this pool can serve, in the OpenAI
/// list shape.
pub async fn list_models(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let client_key = req
        .extensions()
        .get::<ClientKey>()
        .map(|key| key.0.clone())
        .unwrap_or_default();
    match state.router.pool_models(&client_key).await {
        Ok(models) => {
            let created = unix_seconds();
            let list = ModelList {
                object: "list".to_string(),
                data: models
                    .into_iter()
                    .map(|id| ModelEntry {
                        id,
                        object: "model".to_string(),
                        created,
                        owned_by: "gateway".to_string(),
                    })
                    .collect(),
            };
            (StatusCode::OK, Json(list)).into_response()
        }
        Err(GatewayError::Unauthorized) => openai_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "unauthorized",
            "invalid client key",
        ),
        Err(err) => openai_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "internal_error",
            err.to_string(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Shared orchestration helpers
// ---------------------------------------------------------------------------

pub(crate) enum AttemptDisposition {
    Retry,
    Fail,
}

/// Books a failed attempt against health and the stickiness cache. When the
/// attempt is not the last one, the credential joins the exclude set and
/// the caller retries; otherwise the caller surfaces the facade error.
pub(crate) fn fail_attempt(
    state: &AppState,
    meta: &RequestMeta,
    info: &UpstreamInfo,
    start: Instant,
    status: u16,
    exclude: &mut HashSet<u64>,
    last_attempt: bool,
) -> AttemptDisposition {
    let latency = start.elapsed();
    state
        .health
        .end_request(info.credential_id, false, status, latency);
    state.router.record_route_result(
        info.pool_id,
        meta.facade,
        &meta.request_model,
        info.credential_id,
        false,
        status,
    );
    exclude.insert(info.credential_id);
    if last_attempt {
        AttemptDisposition::Fail
    } else {
        AttemptDisposition::Retry
    }
}

/// Publishes the request's one log event and metrics sample for a failed
/// final attempt. Bookkeeping against health/stickiness must already have
/// happened.
pub(crate) fn publish_final(
    state: &AppState,
    meta: &RequestMeta,
    info: &UpstreamInfo,
    start: Instant,
    event_status: u16,
    metrics_status: u16,
    error: &str,
) {
    let latency = start.elapsed();
    let stats = StreamStats::default();
    state.bus.publish(meta.event(
        info,
        event_status,
        latency.as_millis() as u64,
        error,
        stats.input_tokens,
        stats.output_tokens,
        stats.response_bytes,
        stats.ttft_ms,
        stats.tps,
    ));
    state.metrics.observe_request(
        meta.facade.as_str(),
        &info.provider_type,
        metrics_status,
        latency,
    );
}

pub(crate) fn stream_timeout(stream: bool, per_call: Duration) -> Duration {
    if stream {
        STREAM_UPSTREAM_TIMEOUT
    } else {
        per_call
    }
}

pub(crate) fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Upstream response headers worth forwarding on passthrough; framing and
/// connection headers are re-derived for our body.
pub(crate) fn copy_upstream_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        match name.as_str() {
            "content-length" | "transfer-encoding" | "connection" => continue,
            _ => {
                out.append(name.clone(), value.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_token_prefers_bearer_then_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-pool-1".parse().unwrap());
        headers.insert("x-api-key", "other".parse().unwrap());
        assert_eq!(extract_client_token(&headers), "sk-pool-1");

        headers.remove("authorization");
        assert_eq!(extract_client_token(&headers), "other");

        headers.remove("x-api-key");
        assert_eq!(extract_client_token(&headers), "");
    }

    #[test]
    fn framing_headers_are_not_forwarded() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", "application/json".parse().unwrap());
        upstream.insert("content-length", "12".parse().unwrap());
        upstream.insert("transfer-encoding", "chunked".parse().unwrap());
        upstream.insert("x-ratelimit-remaining", "99".parse().unwrap());
        let out = copy_upstream_headers(&upstream);
        assert!(out.contains_key("content-type"));
        assert!(out.contains_key("x-ratelimit-remaining"));
        assert!(!out.contains_key("content-length"));
        assert!(!out.contains_key("transfer-encoding"));
    }
}
