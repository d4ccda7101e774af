//! Admin probes: exercise a credential, a provider's whole credential set,
//! or a pool's full request path, and feed the measurements back into the
//! store and the log bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::io::StreamReader;

use crate::logbus::{now_millis, LogEvent};
use crate::proto::ProviderKind;
use crate::server::AppState;
use crate::snapshot::{parse_model_set, parse_string_map};
use crate::sse::{extract_sse_data, SseBlockReader};
use crate::store::{CredentialTestResult, ProviderRow};
use crate::upstream::{Upstream, ANTHROPIC_VERSION};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BATCH_CONCURRENCY: usize = 5;
const MAX_BATCH_CONCURRENCY: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct CredentialTestRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CredentialTestResponse {
    pub credential_id: u64,
    pub provider_id: u64,
    pub provider_type: String,
    pub ok: bool,
    pub status: u16,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub ttft_ms: u64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub tps: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

fn parse_body<T: Default + serde::de::DeserializeOwned>(body: &Bytes) -> T {
    if body.is_empty() {
        return T::default();
    }
    serde_json::from_slice(body).unwrap_or_default()
}

fn probe_timeout(timeout_ms: Option<u64>) -> Duration {
    timeout_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT)
}

/// `POST /admin/credentials/{id}/test`
pub async fn test_credential(
    State(state): State<Arc<AppState>>,
    Path(credential_id): Path<u64>,
    body: Bytes,
) -> Response {
    let req: CredentialTestRequest = parse_body(&body);
    let timeout = probe_timeout(req.timeout_ms);

    match run_credential_test(&state, credential_id, req.model.as_deref(), timeout).await {
        Some(resp) => (StatusCode::OK, Json(resp)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "credential not found" })),
        )
            .into_response(),
    }
}

async fn run_credential_test(
    state: &AppState,
    credential_id: u64,
    model: Option<&str>,
    timeout: Duration,
) -> Option<CredentialTestResponse> {
    let credential = state.store.get_credential(credential_id).await.ok()?;
    let provider = state.store.get_provider(credential.provider_id).await.ok()?;
    let api_key = state
        .cipher
        .open(&credential.api_key_ciphertext)
        .ok()
        .and_then(|key| String::from_utf8(key).ok())?;

    let model = model
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| pick_provider_test_model(&provider));

    let upstream = Upstream {
        base_url: provider.base_url.clone(),
        api_key,
        headers: parse_string_map(provider.default_headers_json.as_deref()),
        timeout,
    };
    let kind = ProviderKind::parse(&provider.provider_type);

    let start = Instant::now();
    let outcome = probe_upstream(state, kind, &upstream, &model).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let result = CredentialTestResult {
        ok: outcome.ok,
        status: outcome.status,
        latency_ms,
        ttft_ms: outcome.ttft_ms,
        tps: outcome.tps,
        model: model.clone(),
        error: outcome.error.clone(),
    };
    if let Err(err) = state.store.record_credential_test(credential_id, &result).await {
        tracing::warn!(credential_id, error = %err, "failed to persist credential test");
    }

    let provider_type = provider.provider_type.trim().to_ascii_lowercase();
    state.bus.publish(LogEvent {
        ts_ms: now_millis(),
        request_id: format!("admin_test_cred_{credential_id}_{}", now_millis()),
        facade: provider_type.clone(),
        request_model: model.clone(),
        upstream_model: model.clone(),
        provider_type: provider_type.clone(),
        pool_id: 0,
        provider_id: provider.id,
        credential_id,
        client_key: "admin_test".to_string(),
        is_test: true,
        stream: true,
        status: outcome.status,
        latency_ms,
        ttft_ms: outcome.ttft_ms,
        tps: outcome.tps,
        error: outcome.error.clone(),
        ..LogEvent::default()
    });

    Some(CredentialTestResponse {
        credential_id,
        provider_id: provider.id,
        provider_type: provider.provider_type,
        ok: outcome.ok,
        status: outcome.status,
        latency_ms,
        ttft_ms: outcome.ttft_ms,
        tps: outcome.tps,
        model,
        error: outcome.error,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderBatchTestRequest {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
}

/// `POST /admin/providers/{id}/test` — probe every enabled credential of
/// the provider, fan-out bounded by a semaphore.
pub async fn test_provider_credentials(
    State(state): State<Arc<AppState>>,
    Path(provider_id): Path<u64>,
    body: Bytes,
) -> Response {
    let req: ProviderBatchTestRequest = parse_body(&body);
    let timeout = probe_timeout(req.timeout_ms);
    let limit = req
        .concurrency_limit
        .filter(|limit| *limit > 0 && *limit <= MAX_BATCH_CONCURRENCY)
        .unwrap_or(DEFAULT_BATCH_CONCURRENCY);

    let ids = match state.store.provider_credential_ids(provider_id).await {
        Ok(ids) => ids,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };
    if ids.is_empty() {
        return (
            StatusCode::OK,
            Json(json!({ "provider_id": provider_id, "count": 0, "ok": 0, "fail": 0 })),
        )
            .into_response();
    }

    let semaphore = Arc::new(Semaphore::new(limit));
    let mut tasks = Vec::with_capacity(ids.len());
    for credential_id in &ids {
        let credential_id = *credential_id;
        let state = state.clone();
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            run_credential_test(&state, credential_id, None, timeout).await
        }));
    }

    let mut ok_count = 0usize;
    let mut fail_count = 0usize;
    for task in tasks {
        match task.await {
            Ok(Some(result)) if result.ok => ok_count += 1,
            _ => fail_count += 1,
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "provider_id": provider_id,
            "count": ids.len(),
            "ok": ok_count,
            "fail": fail_count,
        })),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolTestRequest {
    #[serde(default)]
    pub facade: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `POST /admin/pools/{id}/test` — self-loopback streaming request against
/// the gateway's own facade endpoint using the pool's client key, so the
/// whole path (auth, router, transcoder, upstream) is exercised.
pub async fn test_pool(
    State(state): State<Arc<AppState>>,
    Path(pool_id): Path<u64>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: PoolTestRequest = parse_body(&body);
    let timeout = probe_timeout(req.timeout_ms);
    let facade = req
        .facade
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or("openai")
        .to_ascii_lowercase();
    let model = req.model.as_deref().map(str::trim).unwrap_or_default();

    let client_key = match state.store.pool_client_key(pool_id).await {
        Ok(client_key) => client_key,
        Err(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "pool not found" })),
            )
                .into_response();
        }
    };

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("http");
    let Some(host) = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing host" })),
        )
            .into_response();
    };

    let (path, payload) = if facade == "anthropic" {
        (
            "/v1/messages",
            json!({
                "model": model,
                "max_tokens": 10,
                "messages": [{ "role": "user", "content": "ping" }],
                "stream": true,
            }),
        )
    } else {
        (
            "/v1/chat/completions",
            json!({
                "model": model,
                "messages": [{ "role": "user", "content": "ping" }],
                "max_tokens": 10,
                "stream": true,
            }),
        )
    };

    let start = Instant::now();
    let resp = state
        .http
        .post(format!("{scheme}://{host}{path}"))
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", client_key.trim()))
        .header("x-gateway-test", "1")
        .timeout(timeout)
        .json(&payload)
        .send()
        .await;

    let resp = match resp {
        Ok(resp) => resp,
        Err(err) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "ok": false, "error": err.to_string() })),
            )
                .into_response();
        }
    };

    let status = resp.status().as_u16();
    let request_id = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (ttft_ms, tps) = if (200..300).contains(&status) {
        measure_stream(resp, start).await
    } else {
        (0, 0.0)
    };

    let latency_ms = start.elapsed().as_millis() as u64;
    (
        StatusCode::OK,
        Json(json!({
            "pool_id": pool_id,
            "facade": facade,
            "model": model,
            "ok": (200..300).contains(&status),
            "status": status,
            "latency_ms": latency_ms,
            "ttft_ms": ttft_ms,
            "tps": tps,
            "request_id": request_id,
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Probe internals
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ProbeOutcome {
    ok: bool,
    status: u16,
    error: String,
    ttft_ms: u64,
    tps: f64,
}

async fn probe_upstream(
    state: &AppState,
    kind: Option<ProviderKind>,
    up: &Upstream,
    model: &str,
) -> ProbeOutcome {
    match kind {
        Some(ProviderKind::OpenAi) => {
            // Model listing is the cheap liveness check; a model id upgrades
            // it to a streaming chat probe with measurements.
            match state.upstream.openai_models(up).await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let _ = resp.bytes().await;
                    if (200..300).contains(&status) {
                        if model.trim().is_empty() {
                            return ProbeOutcome {
                                ok: true,
                                status,
                                ..ProbeOutcome::default()
                            };
                        }
                        return probe_openai_chat(state, up, model).await;
                    }
                    probe_openai_chat(state, up, model).await
                }
                Err(_) => probe_openai_chat(state, up, model).await,
            }
        }
        Some(ProviderKind::Anthropic) => {
            if model.trim().is_empty() {
                return ProbeOutcome {
                    error: "model is required for anthropic test".to_string(),
                    ..ProbeOutcome::default()
                };
            }
            let payload = json!({
                "model": model,
                "max_tokens": 10,
                "messages": [{ "role": "user", "content": "ping" }],
                "stream": true,
            });
            let body = serde_json::to_vec(&payload).unwrap_or_default();
            let start = Instant::now();
            let resp = match state
                .upstream
                .anthropic_messages(up, ANTHROPIC_VERSION, body)
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    return ProbeOutcome {
                        error: err.to_string(),
                        ..ProbeOutcome::default()
                    };
                }
            };
            let status = resp.status().as_u16();
            if !(200..300).contains(&status) {
                let raw = resp.bytes().await.unwrap_or_default();
                return ProbeOutcome {
                    status,
                    error: String::from_utf8_lossy(&raw).to_string(),
                    ..ProbeOutcome::default()
                };
            }
            let (ttft_ms, tps) = measure_stream(resp, start).await;
            ProbeOutcome {
                ok: true,
                status,
                ttft_ms,
                tps,
                ..ProbeOutcome::default()
            }
        }
        _ => ProbeOutcome {
            error: "unsupported provider type".to_string(),
            ..ProbeOutcome::default()
        },
    }
}

async fn probe_openai_chat(state: &AppState, up: &Upstream, model: &str) -> ProbeOutcome {
    if model.trim().is_empty() {
        return ProbeOutcome {
            error: "model is required for chat test".to_string(),
            ..ProbeOutcome::default()
        };
    }
    let payload = json!({
        "model": model,
        "stream": true,
        "max_tokens": 10,
        "messages": [{ "role": "user", "content": "ping" }],
    });
    let body = serde_json::to_vec(&payload).unwrap_or_default();
    let start = Instant::now();
    let resp = match state.upstream.openai_chat_completions(up, body).await {
        Ok(resp) => resp,
        Err(err) => {
            return ProbeOutcome {
                error: err.to_string(),
                ..ProbeOutcome::default()
            };
        }
    };
    let status = resp.status().as_u16();
    if !(200..300).contains(&status) {
        let raw = resp.bytes().await.unwrap_or_default();
        return ProbeOutcome {
            status,
            error: String::from_utf8_lossy(&raw).to_string(),
            ..ProbeOutcome::default()
        };
    }
    let (ttft_ms, tps) = measure_stream(resp, start).await;
    ProbeOutcome {
        ok: true,
        status,
        ttft_ms,
        tps,
        ..ProbeOutcome::default()
    }
}

/// Drains an SSE response, returning time-to-first-data-block and
/// blocks-per-second over the streaming window.
async fn measure_stream(resp: reqwest::Response, start: Instant) -> (u64, f64) {
    let bytes = resp
        .bytes_stream()
        .map(|result| result.map_err(std::io::Error::other))
        .boxed();
    let mut reader = SseBlockReader::new(tokio::io::BufReader::new(StreamReader::new(bytes)));

    let mut ttft_ms = 0u64;
    let mut first: Option<Instant> = None;
    let mut last: Option<Instant> = None;
    let mut chunks = 0u64;

    while let Ok(Some(block)) = reader.next_block().await {
        let data = extract_sse_data(&block);
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }
        let now = Instant::now();
        if first.is_none() {
            first = Some(now);
            ttft_ms = now.duration_since(start).as_millis() as u64;
        }
        last = Some(now);
        chunks += 1;
    }

    let tps = match (first, last) {
        (Some(first), Some(last)) if chunks > 1 => {
            let window = last.duration_since(first).as_secs_f64();
            if window > 0.0 {
                (chunks - 1) as f64 / window
            } else {
                0.0
            }
        }
        _ => 0.0,
    };
    (ttft_ms, tps)
}

/// A model to probe with when the caller did not name one: the provider's
/// catalog first, then any model-map target.
fn pick_provider_test_model(provider: &ProviderRow) -> String {
    let models = parse_model_set(provider.models_json.as_deref());
    if !models.is_empty() {
        let mut ids: Vec<String> = models.into_iter().collect();
        ids.sort();
        return ids.remove(0);
    }
    let map = parse_string_map(provider.model_map_json.as_deref());
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys.first()
        .and_then(|key| map.get(*key))
        .cloned()
        .unwrap_or_default()
}
