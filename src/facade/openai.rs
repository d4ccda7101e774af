//! `POST /v1/chat/completions` and `POST /v1/responses` — the OpenAI
//! facades.
//!
//! OpenAI upstreams are passthrough (with model rewrite and
//! `stream_options.include_usage` injection); Anthropic upstreams get shape
//! and stream transcoding; Gemini upstreams are converted non-streaming.

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
use crate::proto::anthropic::MessagesResponse;
use crate::proto::openai::{ChatCompletionsRequest, ResponsesRequest};
use crate::proto::{Facade, ProviderKind};
use crate::relay::{
    ensure_stream_include_usage, extract_anthropic_usage, extract_openai_usage,
    passthrough_sse_body, rewrite_model, transcode_sse_body, PassthroughDialect, RequestMeta,
    StreamFinalizer, StreamTranscoder, UpstreamInfo, MAX_BODY_BYTES,
};
use crate::server::{AppState, ClientKey};
use crate::streamconv::OpenAiStreamEncoder;
use crate::upstream::{Upstream, ANTHROPIC_VERSION};

use super::error::{
    map_upstream_code_openai, map_upstream_status, map_upstream_type_openai, openai_error,
};
use super::{
    copy_upstream_headers, fail_attempt, publish_final, stream_timeout, with_request_id,
    AttemptDisposition,
};

pub async fn chat_completions(State(state): State<Arc<AppState>>, req: Request) -> Response {
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
                openai_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    "invalid_request",
                    "failed to read request body",
                ),
                &request_id,
            );
        }
    };

    let parsed: ChatCompletionsRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return with_request_id(
                openai_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    "invalid_json",
                    "invalid json",
                ),
                &request_id,
            );
        }
    };
    if parsed.model.trim().is_empty() {
        return with_request_id(
            openai_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "missing_model",
                "model is required",
            ),
            &request_id,
        );
    }

    let mut meta = RequestMeta::from_headers(
        &headers,
        Facade::OpenAi,
        client_key.clone(),
        parsed.model.clone(),
        parsed.stream,
        body.len(),
    );
    meta.request_id = request_id.clone();

    let max_attempts = if parsed.stream { 1 } else { 2 };
    let mut exclude = HashSet::<u64>::new();

    for attempt in 0..max_attempts {
        let up = match state
            .router
            .pick(&client_key, Facade::OpenAi, &parsed.model, &exclude)
            .await
        {
            Ok(up) => up,
            Err(GatewayError::NotConfigured) => {
                return with_request_id(
                    openai_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "server_error",
                        "not_configured",
                        "gateway not configured",
                    ),
                    &request_id,
                );
            }
            Err(GatewayError::Unauthorized) => {
                return with_request_id(
                    openai_error(
                        StatusCode::UNAUTHORIZED,
                        "invalid_request_error",
                        "unauthorized",
                        "invalid client key",
                    ),
                    &request_id,
                );
            }
            Err(_) => {
                return with_request_id(
                    openai_error(
                        StatusCode::BAD_GATEWAY,
                        "server_error",
                        "routing_failed",
                        "routing failed",
                    ),
                    &request_id,
                );
            }
        };
        let info = UpstreamInfo::from(&up);
        let start = Instant::now();
        let last_attempt = attempt + 1 >= max_attempts;

        match up.provider_kind {
            Some(ProviderKind::OpenAi) => {
                let mut target_body = if !up.model.trim().is_empty() && up.model != parsed.model {
                    rewrite_model(&body, &up.model)
                } else {
                    body.to_vec()
                };
                if parsed.stream {
                    target_body = ensure_stream_include_usage(&target_body);
                }
                let upstream = Upstream {
                    base_url: up.base_url.clone(),
                    api_key: up.api_key.clone(),
                    headers: up.headers.clone(),
                    timeout: stream_timeout(parsed.stream, up.timeout),
                };
                let resp = match state
                    .upstream
                    .openai_chat_completions(&upstream, target_body)
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
                                    openai_error(
                                        StatusCode::BAD_GATEWAY,
                                        "server_error",
                                        "upstream_failed",
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
                    let body = passthrough_sse_body(resp, PassthroughDialect::OpenAi, finalizer);
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
                    Facade::OpenAi,
                    &meta.request_model,
                    up.credential_id,
                    transport_ok,
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

                let mut response = Response::new(Body::from(raw));
                *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
                response.headers_mut().extend(upstream_headers);
                return with_request_id(response, &request_id);
            }

            Some(ProviderKind::Anthropic) => {
                let mut areq = match convert::openai_to_anthropic_messages(&parsed) {
                    Ok(areq) => areq,
                    Err(err) => {
                        state
                            .health
                            .end_request(up.credential_id, false, 0, start.elapsed());
                        return with_request_id(
                            openai_error(
                                StatusCode::BAD_REQUEST,
                                "invalid_request_error",
                                "unsupported_request",
                                err.to_string(),
                            ),
                            &request_id,
                        );
                    }
                };
                areq.model = up.model.clone();
                areq.stream = parsed.stream;
                let payload = match serde_json::to_vec(&areq) {
                    Ok(payload) => payload,
                    Err(_) => {
                        state
                            .health
                            .end_request(up.credential_id, false, 0, start.elapsed());
                        return with_request_id(
                            openai_error(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "server_error",
                                "encode_failed",
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
                let resp = match state
                    .upstream
                    .anthropic_messages(&upstream, ANTHROPIC_VERSION, payload)
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
                                    openai_error(
                                        StatusCode::BAD_GATEWAY,
                                        "server_error",
                                        "upstream_failed",
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
                        Facade::OpenAi,
                        &meta.request_model,
                        up.credential_id,
                        false,
                        status,
                    );
                    publish_final(&state, &meta, &info, start, status, status, "upstream error");
                    return with_request_id(
                        openai_error(
                            map_upstream_status(status),
                            map_upstream_type_openai(status),
                            map_upstream_code_openai(status),
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
                    let encoder = OpenAiStreamEncoder::new(up.model.clone());
                    let body =
                        transcode_sse_body(resp, StreamTranscoder::ToOpenAi(encoder), finalizer);
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
                let aresp: MessagesResponse = match serde_json::from_slice(&raw) {
                    Ok(aresp) => aresp,
                    Err(_) => {
                        state
                            .health
                            .end_request(up.credential_id, false, status, start.elapsed());
                        return with_request_id(
                            openai_error(
                                StatusCode::BAD_GATEWAY,
                                "server_error",
                                "bad_upstream",
                                "invalid upstream response",
                            ),
                            &request_id,
                        );
                    }
                };
                let oresp = convert::anthropic_response_to_openai(&aresp);
                let latency = start.elapsed();
                state
                    .health
                    .end_request(up.credential_id, true, status, latency);
                state.router.record_route_result(
                    up.pool_id,
                    Facade::OpenAi,
                    &meta.request_model,
                    up.credential_id,
                    true,
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
                return with_request_id((StatusCode::OK, Json(oresp)).into_response(), &request_id);
            }

            Some(ProviderKind::Gemini) => {
                if parsed.stream {
                    state
                        .health
                        .end_request(up.credential_id, false, 0, start.elapsed());
                    return with_request_id(
                        openai_error(
                            StatusCode::NOT_IMPLEMENTED,
                            "server_error",
                            "not_implemented",
                            "streaming to this upstream is not implemented",
                        ),
                        &request_id,
                    );
                }
                let greq = convert::openai_to_gemini(&parsed);
                let payload = match serde_json::to_vec(&greq) {
                    Ok(payload) => payload,
                    Err(_) => {
                        state
                            .health
                            .end_request(up.credential_id, false, 0, start.elapsed());
                        return with_request_id(
                            openai_error(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "server_error",
                                "encode_failed",
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
                                    openai_error(
                                        StatusCode::BAD_GATEWAY,
                                        "server_error",
                                        "upstream_failed",
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
                        Facade::OpenAi,
                        &meta.request_model,
                        up.credential_id,
                        false,
                        status,
                    );
                    publish_final(&state, &meta, &info, start, status, status, "upstream error");
                    return with_request_id(
                        openai_error(
                            map_upstream_status(status),
                            map_upstream_type_openai(status),
                            map_upstream_code_openai(status),
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
                                openai_error(
                                    StatusCode::BAD_GATEWAY,
                                    "server_error",
                                    "bad_upstream",
                                    "invalid upstream response",
                                ),
                                &request_id,
                            );
                        }
                    };
                let (text, usage) = convert::gemini_response_text(&gres);
                let oresp = convert::gemini_text_to_openai(text, &up.model, usage);
                let latency = start.elapsed();
                state
                    .health
                    .end_request(up.credential_id, true, status, latency);
                state.router.record_route_result(
                    up.pool_id,
                    Facade::OpenAi,
                    &meta.request_model,
                    up.credential_id,
                    true,
                    status,
                );
                let (input_tokens, output_tokens) = oresp
                    .usage
                    .as_ref()
                    .map(|u| (u.prompt_tokens, u.completion_tokens))
                    .unwrap_or((0, 0));
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
                return with_request_id((StatusCode::OK, Json(oresp)).into_response(), &request_id);
            }

            None => {
                state
                    .health
                    .end_request(up.credential_id, false, 0, start.elapsed());
                return with_request_id(
                    openai_error(
                        StatusCode::NOT_IMPLEMENTED,
                        "server_error",
                        "not_implemented",
                        "unknown provider",
                    ),
                    &request_id,
                );
            }
        }
    }

    with_request_id(
        openai_error(
            StatusCode::BAD_GATEWAY,
            "server_error",
            "upstream_failed",
            "no upstream available",
        ),
        &request_id,
    )
}

/// `POST /v1/responses`. Single attempt: OpenAI upstreams are passthrough,
/// Anthropic upstreams are converted non-streaming via the chat shape.
pub async fn responses(State(state): State<Arc<AppState>>, req: Request) -> Response {
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
                openai_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    "invalid_request",
                    "failed to read request body",
                ),
                &request_id,
            );
        }
    };
    let parsed: ResponsesRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return with_request_id(
                openai_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    "invalid_json",
                    "invalid json",
                ),
                &request_id,
            );
        }
    };
    if parsed.model.trim().is_empty() {
        return with_request_id(
            openai_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "missing_model",
                "model is required",
            ),
            &request_id,
        );
    }

    let mut meta = RequestMeta::from_headers(
        &headers,
        Facade::OpenAi,
        client_key.clone(),
        parsed.model.clone(),
        parsed.stream,
        body.len(),
    );
    meta.request_id = request_id.clone();

    let up = match state
        .router
        .pick(&client_key, Facade::OpenAi, &parsed.model, &HashSet::new())
        .await
    {
        Ok(up) => up,
        Err(GatewayError::NotConfigured) => {
            return with_request_id(
                openai_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "server_error",
                    "not_configured",
                    "gateway not configured",
                ),
                &request_id,
            );
        }
        Err(GatewayError::Unauthorized) => {
            return with_request_id(
                openai_error(
                    StatusCode::UNAUTHORIZED,
                    "invalid_request_error",
                    "unauthorized",
                    "invalid client key",
                ),
                &request_id,
            );
        }
        Err(_) => {
            return with_request_id(
                openai_error(
                    StatusCode::BAD_GATEWAY,
                    "server_error",
                    "routing_failed",
                    "routing failed",
                ),
                &request_id,
            );
        }
    };
    let info = UpstreamInfo::from(&up);
    let start = Instant::now();

    match up.provider_kind {
        Some(ProviderKind::OpenAi) => {
            let mut target_body = if !up.model.trim().is_empty() && up.model != parsed.model {
                rewrite_model(&body, &up.model)
            } else {
                body.to_vec()
            };
            if parsed.stream {
                target_body = ensure_stream_include_usage(&target_body);
            }
            let upstream = Upstream {
                base_url: up.base_url.clone(),
                api_key: up.api_key.clone(),
                headers: up.headers.clone(),
                timeout: stream_timeout(parsed.stream, up.timeout),
            };
            let resp = match state.upstream.openai_responses(&upstream, target_body).await {
                Ok(resp) => resp,
                Err(err) => {
                    let latency = start.elapsed();
                    state
                        .health
                        .end_request(up.credential_id, false, 0, latency);
                    state.router.record_route_result(
                        up.pool_id,
                        Facade::OpenAi,
                        &meta.request_model,
                        up.credential_id,
                        false,
                        0,
                    );
                    publish_final(&state, &meta, &info, start, 0, 502, &err.to_string());
                    return with_request_id(
                        openai_error(
                            StatusCode::BAD_GATEWAY,
                            "server_error",
                            "upstream_failed",
                            "upstream request failed",
                        ),
                        &request_id,
                    );
                }
            };

            let status = resp.status().as_u16();
            let transport_ok = status < 500 && status != 429;
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
                let body = passthrough_sse_body(resp, PassthroughDialect::OpenAi, finalizer);
                let mut response = Response::new(body);
                *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
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
                Facade::OpenAi,
                &meta.request_model,
                up.credential_id,
                transport_ok,
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
            state
                .metrics
                .observe_request(meta.facade.as_str(), &info.provider_type, status, latency);

            let mut response = Response::new(Body::from(raw));
            *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            response.headers_mut().extend(upstream_headers);
            with_request_id(response, &request_id)
        }

        Some(ProviderKind::Anthropic) => {
            if parsed.stream {
                state
                    .health
                    .end_request(up.credential_id, false, 0, start.elapsed());
                return with_request_id(
                    openai_error(
                        StatusCode::NOT_IMPLEMENTED,
                        "server_error",
                        "not_implemented",
                        "responses streaming conversion is not implemented",
                    ),
                    &request_id,
                );
            }

            let messages = match convert::responses_input_to_chat_messages(
                &parsed.input,
                parsed.instructions.as_deref(),
            ) {
                Ok(messages) => messages,
                Err(err) => {
                    state
                        .health
                        .end_request(up.credential_id, false, 0, start.elapsed());
                    return with_request_id(
                        openai_error(
                            StatusCode::BAD_REQUEST,
                            "invalid_request_error",
                            "invalid_input",
                            err.to_string(),
                        ),
                        &request_id,
                    );
                }
            };

            let chat_req = ChatCompletionsRequest {
                model: parsed.model.clone(),
                messages: serde_json::Value::Array(messages),
                max_tokens: parsed.max_output_tokens,
                temperature: parsed.temperature,
                top_p: parsed.top_p,
                stream: false,
                stream_options: None,
                tools: parsed.tools.clone(),
                tool_choice: parsed.tool_choice.clone(),
            };
            let mut areq = match convert::openai_to_anthropic_messages(&chat_req) {
                Ok(areq) => areq,
                Err(err) => {
                    state
                        .health
                        .end_request(up.credential_id, false, 0, start.elapsed());
                    return with_request_id(
                        openai_error(
                            StatusCode::BAD_REQUEST,
                            "invalid_request_error",
                            "unsupported_request",
                            err.to_string(),
                        ),
                        &request_id,
                    );
                }
            };
            areq.model = up.model.clone();
            areq.stream = false;
            let payload = match serde_json::to_vec(&areq) {
                Ok(payload) => payload,
                Err(_) => {
                    state
                        .health
                        .end_request(up.credential_id, false, 0, start.elapsed());
                    return with_request_id(
                        openai_error(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "server_error",
                            "encode_failed",
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
                .anthropic_messages(&upstream, ANTHROPIC_VERSION, payload)
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    let latency = start.elapsed();
                    state
                        .health
                        .end_request(up.credential_id, false, 0, latency);
                    state.router.record_route_result(
                        up.pool_id,
                        Facade::OpenAi,
                        &meta.request_model,
                        up.credential_id,
                        false,
                        0,
                    );
                    publish_final(&state, &meta, &info, start, 0, 502, &err.to_string());
                    return with_request_id(
                        openai_error(
                            StatusCode::BAD_GATEWAY,
                            "server_error",
                            "upstream_failed",
                            "upstream request failed",
                        ),
                        &request_id,
                    );
                }
            };

            let status = resp.status().as_u16();
            let transport_ok = status < 500 && status != 429;
            let raw = resp.bytes().await.unwrap_or_default();
            if !(200..300).contains(&status) {
                let latency = start.elapsed();
                state
                    .health
                    .end_request(up.credential_id, false, status, latency);
                state.router.record_route_result(
                    up.pool_id,
                    Facade::OpenAi,
                    &meta.request_model,
                    up.credential_id,
                    false,
                    status,
                );
                publish_final(&state, &meta, &info, start, status, status, "upstream error");
                return with_request_id(
                    openai_error(
                        map_upstream_status(status),
                        map_upstream_type_openai(status),
                        map_upstream_code_openai(status),
                        "upstream error",
                    ),
                    &request_id,
                );
            }

            let aresp: MessagesResponse = match serde_json::from_slice(&raw) {
                Ok(aresp) => aresp,
                Err(_) => {
                    state
                        .health
                        .end_request(up.credential_id, false, status, start.elapsed());
                    return with_request_id(
                        openai_error(
                            StatusCode::BAD_GATEWAY,
                            "server_error",
                            "bad_upstream",
                            "invalid upstream response",
                        ),
                        &request_id,
                    );
                }
            };
            let oresp = convert::anthropic_response_to_responses(&aresp, &parsed.model);
            let latency = start.elapsed();
            state
                .health
                .end_request(up.credential_id, transport_ok, status, latency);
            state.router.record_route_result(
                up.pool_id,
                Facade::OpenAi,
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
            state
                .metrics
                .observe_request(meta.facade.as_str(), &info.provider_type, status, latency);
            with_request_id((StatusCode::OK, Json(oresp)).into_response(), &request_id)
        }

        _ => {
            state
                .health
                .end_request(up.credential_id, false, 0, start.elapsed());
            with_request_id(
                openai_error(
                    StatusCode::NOT_IMPLEMENTED,
                    "server_error",
                    "not_implemented",
                    "provider conversion is not implemented for responses",
                ),
                &request_id,
            )
        }
    }
}
