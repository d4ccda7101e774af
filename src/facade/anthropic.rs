//! `POST /v1/messages` — the Anthropic Messages facade.
//!
//! Decodes and validates the inbound body, then runs the pick/call/observe
//! loop: passthrough to Anthropic upstreams, shape + stream transcoding
//! for OpenAI upstreams, non-streaming conversion for Gemini upstreams.
//! Non-streaming calls retry once on a retryable failure with the failed
//! credential excluded; streams are never retried.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::convert;
use crate::error::GatewayError;
use crate::proto::anthropic::MessagesRequest;
use crate::proto::openai::ChatCompletionResponse;
use crate::proto::{Facade, ProviderKind};
use crate::relay::{
    extract_anthropic_usage, extract_openai_usage, passthrough_sse_body, rewrite_model,
    transcode_sse_body, PassthroughDialect, RequestMeta, StreamFinalizer, StreamTranscoder,
    UpstreamInfo, MAX_BODY_BYTES,
};
use crate::server::{AppState, ClientKey};
use crate::streamconv::AnthropicStreamEncoder;
use crate::upstream::{Upstream, ANTHROPIC_VERSION};

use super::error::{anthropic_error, map_upstream_status, map_upstream_type_anthropic};
use super::{
    copy_upstream_headers, fail_attempt, publish_final, stream_timeout, with_request_id,
    AttemptDisposition,
};

pub async fn create_message(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let headers = req.headers().clone();
    let client_key = req
        .extensions()
        .get::<ClientKey>()
        .map(|key| key.0.clone())
        .unwrap_or_default();
    let request_id = crate::relay::request_id_from_headers(&headers);

    let body = match to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            return with_request_id(
                anthropic_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    "failed to read request body",
                ),
                &request_id,
            );
        }
    };

    let parsed: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return with_request_id(
                anthropic_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    "invalid json",
                ),
                &request_id,
            );
        }
    };
    if parsed.model.trim().is_empty() || parsed.max_tokens == 0 {
        return with_request_id(
            anthropic_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "model and max_tokens are required",
            ),
            &request_id,
        );
    }

    let mut meta = RequestMeta::from_headers(
        &headers,
        Facade::Anthropic,
        client_key.clone(),
        parsed.model.clone(),
        parsed.stream,
        body.len(),
    );
    meta.request_id = request_id.clone();

    let api_version = headers
        .get("anthropic-version")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANTHROPIC_VERSION)
        .to_string();

    let max_attempts = if parsed.stream { 1 } else { 2 };
    let mut exclude = HashSet::<u64>::new();

    for attempt in 0..max_attempts {
        let up = match state
            .router
            .pick(&client_key, Facade::Anthropic, &parsed.model, &exclude)
            .await
        {
            Ok(up) => up,
            Err(GatewayError::NotConfigured) => {
                return with_request_id(
                    anthropic_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "overloaded_error",
                        "gateway not configured",
                    ),
                    &request_id,
                );
            }
            Err(GatewayError::Unauthorized) => {
                return with_request_id(
                    anthropic_error(
                        StatusCode::UNAUTHORIZED,
                        "authentication_error",
                        "invalid client key",
                    ),
                    &request_id,
                );
            }
            Err(_) => {
                return with_request_id(
                    anthropic_error(StatusCode::BAD_GATEWAY, "api_error", "routing failed"),
                    &request_id,
                );
            }
        };
        let info = UpstreamInfo::from(&up);
        let start = Instant::now();
        let last_attempt = attempt + 1 >= max_attempts;

        match up.provider_kind {
            Some(ProviderKind::Anthropic) => {
                let target_body = if !up.model.trim().is_empty() && up.model != parsed.model {
                    rewrite_model(&body, &up.model)
                } else {
                    body.to_vec()
                };
                let upstream = Upstream {
                    base_url: up.base_url.clone(),
                    api_key: up.api_key.clone(),
                    headers: up.headers.clone(),
                    timeout: stream_timeout(parsed.stream, up.timeout),
                };
                let resp = match state
                    .upstream
                    .anthropic_messages(&upstream, &api_version, target_body)
                    .await
                {
                    Ok(resp) => resp,
                    Err(err) => {
                        match fail_attempt(
                            &state, &meta, &info, start, 0, &mut exclude, last_attempt,
                        ) {
                            AttemptDisposition::Retry => continue,
                            AttemptDisposition::Fail => {
                                publish_final(&state, &meta, &info, start, 0, 502, &err.to_string());
                                return with_request_id(
                                    anthropic_error(
                                        StatusCode::BAD_GATEWAY,
                                        "api_error",
                                        "upstream request failed",
                                    ),
                                    &request_id,
                                );
                            }
                        }
                    }
                };

                let status = resp.status().as_u16();
                let transport_ok = status < 500 && status != 429;
                if !transport_ok && !parsed.stream && !last_attempt {
                    match fail_attempt(&state, &meta, &info, start, status, &mut exclude, false) {
                        AttemptDisposition::Retry => continue,
                        AttemptDisposition::Fail => unreachable!("retry requested"),
                    }
                }

                let upstream_headers = copy_upstream_headers(resp.headers());

                if parsed.stream {
                    let finalizer = StreamFinalizer::new(
                        state.router.clone(),
                        state.bus.clone(),
                        state.metrics.clone(),
                        meta.clone(),
                        info,
                        start,
                        status,
                        transport_ok,
                    );
                    let body = passthrough_sse_body(resp, PassthroughDialect::Anthropic, finalizer);
                    let mut response = Response::new(body);
                    *response.status_mut() =
                        StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
                    response.headers_mut().extend(upstream_headers);
                    return with_request_id(response, &request_id);
                }

                let raw = resp.bytes().await.unwrap_or_default();
                let latency = start.elapsed();
                state
                    .health
                    .end_request(up.credential_id, transport_ok, status, latency);
                state.router.record_route_result(
                    up.pool_id,
                    Facade::Anthropic,
                    &meta.request_model,
                    up.credential_id,
                    transport_ok,
                    status,
                );
                let (input_tokens, output_tokens) = extract_anthropic_usage(&raw);
                let tps = if output_tokens > 0 && latency.as_secs_f64() > 0.0 {
                    output_tokens as f64 / latency.as_secs_f64()
                } else {
                    0.0
                };
                state.bus.publish(meta.event(
                    &info,
                    status,
                    latency.as_millis() as u64,
                    "",
                    input_tokens,
                    output_tokens,
                    raw.len() as u64,
                    latency.as_millis() as u64,
                    tps,
                ));
                state.metrics.observe_request(
                    meta.facade.as_str(),
                    &info.provider_type,
                    status,
                    latency,
                );

                let mut response = Response::new(Body::from(raw));
                *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
                response.headers_mut().extend(upstream_headers);
                return with_request_id(response, &request_id);
            }

            Some(ProviderKind::OpenAi) => {
                let mut oreq = match convert::anthropic_to_openai_chat(&parsed) {
                    Ok(oreq) => oreq,
                    Err(err) => {
                        state
                            .health
                            .end_request(up.credential_id, false, 0, start.elapsed());
                        return with_request_id(
                            anthropic_error(
                                StatusCode::BAD_REQUEST,
                                "invalid_request_error",
                                err.to_string(),
                            ),
                            &request_id,
                        );
                    }
                };
                oreq.model = up.model.clone();
                oreq.stream = parsed.stream;
                let payload = match serde_json::to_vec(&oreq) {
                    Ok(payload) => payload,
                    Err(_) => {
                        state
                            .health
                            .end_request(up.credential_id, false, 0, start.elapsed());
                        return with_request_id(
                            anthropic_error(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "api_error",
                                "failed to build upstream request",
                            ),
                            &request_id,
                        );
                    }
                };

                let upstream = Upstream {
                    base_url: up.base_url.clone(),
                    api_key: up.api_key.clone(),
                    headers: up.headers.clone(),
                    timeout: stream_timeout(parsed.stream, up.timeout),
                };
                let resp = match state.upstream.openai_chat_completions(&upstream, payload).await {
                    Ok(resp) => resp,
                    Err(err) => {
                        match fail_attempt(
                            &state, &meta, &info, start, 0, &mut exclude, last_attempt,
                        ) {
                            AttemptDisposition::Retry => continue,
                            AttemptDisposition::Fail => {
                                publish_final(&state, &meta, &info, start, 0, 502, &err.to_string());
                                return with_request_id(
                                    anthropic_error(
                                        StatusCode::BAD_GATEWAY,
                                        "api_error",
                                        "upstream request failed",
                                    ),
                                    &request_id,
                                );
                            }
                        }
                    }
                };

                let status = resp.status().as_u16();
                let transport_ok = status < 500 && status != 429;
                if !(200..300).contains(&status) {
                    if !transport_ok && !parsed.stream && !last_attempt {
                        match fail_attempt(&state, &meta, &info, start, status, &mut exclude, false)
                        {
                            AttemptDisposition::Retry => continue,
                            AttemptDisposition::Fail => unreachable!("retry requested"),
                        }
                    }
                    let latency = start.elapsed();
                    state
                        .health
                        .end_request(up.credential_id, false, status, latency);
                    state.router.record_route_result(
                        up.pool_id,
                        Facade::Anthropic,
                        &meta.request_model,
                        up.credential_id,
                        false,
                        status,
                    );
                    publish_final(&state, &meta, &info, start, status, status, "upstream error");
                    return with_request_id(
                        anthropic_error(
                            map_upstream_status(status),
                            map_upstream_type_anthropic(status),
                            "upstream error",
                        ),
                        &request_id,
                    );
                }

                if parsed.stream {
                    let finalizer = StreamFinalizer::new(
                        state.router.clone(),
                        state.bus.clone(),
                        state.metrics.clone(),
                        meta.clone(),
                        info,
                        start,
                        status,
                        transport_ok,
                    );
                    let encoder = AnthropicStreamEncoder::new(up.model.clone());
                    let body =
                        transcode_sse_body(resp, StreamTranscoder::ToAnthropic(encoder), finalizer);
                    let mut response = Response::new(body);
                    *response.status_mut() = StatusCode::OK;
                    response.headers_mut().insert(
                        axum::http::header::CONTENT_TYPE,
                        "text/event-stream; charset=utf-8".parse().expect("static"),
                    );
                    response.headers_mut().insert(
                        axum::http::header::CACHE_CONTROL,
                        "no-cache".parse().expect("static"),
                    );
                    return with_request_id(response, &request_id);
                }

                let raw = resp.bytes().await.unwrap_or_default();
                let oresp: ChatCompletionResponse = match serde_json::from_slice(&raw) {
                    Ok(oresp) => oresp,
                    Err(_) => {
                        state
                            .health
                            .end_request(up.credential_id, false, status, start.elapsed());
                        return with_request_id(
                            anthropic_error(
                                StatusCode::BAD_GATEWAY,
                                "api_error",
                                "invalid upstream response",
                            ),
                            &request_id,
                        );
                    }
                };
                let aresp = convert::openai_response_to_anthropic(&oresp, &up.model);
                let latency = start.elapsed();
                state
                    .health
                    .end_request(up.credential_id, true, status, latency);
                state.router.record_route_result(
                    up.pool_id,
                    Facade::Anthropic,
                    &meta.request_model,
                    up.credential_id,
                    true,
                    status,
                );
                let (input_tokens, output_tokens) = extract_openai_usage(&raw);
                let tps = if output_tokens > 0 && latency.as_secs_f64() > 0.0 {
                    output_tokens as f64 / latency.as_secs_f64()
                } else {
                    0.0
                };
                state.bus.publish(meta.event(
                    &info,
                    status,
                    latency.as_millis() as u64,
                    "",
                    input_tokens,
                    output_tokens,
                    raw.len() as u64,
                    latency.as_millis() as u64,
                    tps,
                ));
                state.metrics.observe_request(
                    meta.facade.as_str(),
                    &info.provider_type,
                    status,
                    latency,
                );
                return with_request_id((StatusCode::OK, Json(aresp)).into_response(), &request_id);
            }

            Some(ProviderKind::Gemini) => {
                if parsed.stream {
                    state
                        .health
                        .end_request(up.credential_id, false, 0, start.elapsed());
                    return with_request_id(
                        anthropic_error(
                            StatusCode::NOT_IMPLEMENTED,
                            "api_error",
                            "streaming to this upstream is not implemented",
                        ),
                        &request_id,
                    );
                }
                let greq = convert::anthropic_to_gemini(&parsed);
                let payload = match serde_json::to_vec(&greq) {
                    Ok(payload) => payload,
                    Err(_) => {
                        state
                            .health
                            .end_request(up.credential_id, false, 0, start.elapsed());
                        return with_request_id(
                            anthropic_error(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "api_error",
                                "failed to build upstream request",
                            ),
                            &request_id,
                        );
                    }
                };
                let upstream = Upstream {
                    base_url: up.base_url.clone(),
                    api_key: up.api_key.clone(),
                    headers: up.headers.clone(),
                    timeout: up.timeout,
                };
                let resp = match state
                    .upstream
                    .gemini_generate_content(&upstream, &up.model, payload)
                    .await
                {
                    Ok(resp) => resp,
                    Err(err) => {
                        match fail_attempt(
                            &state, &meta, &info, start, 0, &mut exclude, last_attempt,
                        ) {
                            AttemptDisposition::Retry => continue,
                            AttemptDisposition::Fail => {
                                publish_final(&state, &meta, &info, start, 0, 502, &err.to_string());
                                return with_request_id(
                                    anthropic_error(
                                        StatusCode::BAD_GATEWAY,
                                        "api_error",
                                        "upstream request failed",
                                    ),
                                    &request_id,
                                );
                            }
                        }
                    }
                };
                let status = resp.status().as_u16();
                let transport_ok = status < 500 && status != 429;
                let raw = resp.bytes().await.unwrap_or_default();
                if !(200..300).contains(&status) {
                    if !transport_ok && !last_attempt {
                        match fail_attempt(&state, &meta, &info, start, status, &mut exclude, false)
                        {
                            AttemptDisposition::Retry => continue,
                            AttemptDisposition::Fail => unreachable!("retry requested"),
                        }
                    }
                    let latency = start.elapsed();
                    state
                        .health
                        .end_request(up.credential_id, false, status, latency);
                    state.router.record_route_result(
                        up.pool_id,
                        Facade::Anthropic,
                        &meta.request_model,
                        up.credential_id,
                        false,
                        status,
                    );
                    publish_final(&state, &meta, &info, start, status, status, "upstream error");
                    return with_request_id(
                        anthropic_error(
                            map_upstream_status(status),
                            map_upstream_type_anthropic(status),
                            "upstream error",
                        ),
                        &request_id,
                    );
                }
                let gres: crate::proto::gemini::GenerateContentResponse =
                    match serde_json::from_slice(&raw) {
                        Ok(gres) => gres,
                        Err(_) => {
                            state
                                .health
                                .end_request(up.credential_id, false, status, start.elapsed());
                            return with_request_id(
                                anthropic_error(
                                    StatusCode::BAD_GATEWAY,
                                    "api_error",
                                    "invalid upstream response",
                                ),
                                &request_id,
                            );
                        }
                    };
                let (text, usage) = convert::gemini_response_text(&gres);
                let aresp = convert::gemini_text_to_anthropic(text, &up.model, usage);
                let latency = start.elapsed();
                state
                    .health
                    .end_request(up.credential_id, true, status, latency);
                state.router.record_route_result(
                    up.pool_id,
                    Facade::Anthropic,
                    &meta.request_model,
                    up.credential_id,
                    true,
                    status,
                );
                let input_tokens = aresp.usage.input_tokens;
                let output_tokens = aresp.usage.output_tokens;
                let tps = if output_tokens > 0 && latency.as_secs_f64() > 0.0 {
                    output_tokens as f64 / latency.as_secs_f64()
                } else {
                    0.0
                };
                state.bus.publish(meta.event(
                    &info,
                    status,
                    latency.as_millis() as u64,
                    "",
                    input_tokens,
                    output_tokens,
                    raw.len() as u64,
                    latency.as_millis() as u64,
                    tps,
                ));
                state.metrics.observe_request(
                    meta.facade.as_str(),
                    &info.provider_type,
                    status,
                    latency,
                );
                return with_request_id((StatusCode::OK, Json(aresp)).into_response(), &request_id);
            }

            None => {
                state
                    .health
                    .end_request(up.credential_id, false, 0, start.elapsed());
                return with_request_id(
                    anthropic_error(StatusCode::NOT_IMPLEMENTED, "api_error", "unknown provider"),
                    &request_id,
                );
            }
        }
    }

    with_request_id(
        anthropic_error(StatusCode::BAD_GATEWAY, "api_error", "no upstream available"),
        &request_id,
    )
}
