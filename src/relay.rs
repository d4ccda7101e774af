//! Shared orchestration plumbing for the facade handlers: request
//! metadata, token-usage extraction, and the streaming response drivers.
//!
//! Streaming bookkeeping runs inside the response body stream, after the
//! handler has returned. The [`StreamFinalizer`] owns the post-stream
//! obligations (health `end_request`, stickiness update, log event,
//! metrics) and discharges them exactly once, including when the client
//! disconnects and the body is dropped mid-stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::stream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use crate::logbus::{now_millis, LogBus, LogEvent};
use crate::metrics::Metrics;
use crate::proto::Facade;
use crate::router::{RoutedUpstream, Router};
use crate::sse::{extract_sse_data, SseBlockReader};
use crate::streamconv::{AnthropicStreamEncoder, OpenAiStreamEncoder};

pub const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

/// Per-request facts captured at decode time and carried into every log
/// event the request produces.
#[derive(Clone, Debug)]
pub struct RequestMeta {
    pub request_id: String,
    pub facade: Facade,
    pub request_model: String,
    pub client_key: String,
    pub src_ip: String,
    pub user_agent: String,
    pub is_test: bool,
    pub stream: bool,
    pub request_bytes: u64,
}

impl RequestMeta {
    pub fn from_headers(
        headers: &HeaderMap,
        facade: Facade,
        client_key: String,
        request_model: String,
        stream: bool,
        request_bytes: usize,
    ) -> Self {
        Self {
            request_id: request_id_from_headers(headers),
            facade,
            request_model,
            client_key,
            src_ip: client_ip(headers),
            user_agent: header_str(headers, "user-agent"),
            is_test: is_test_request(headers),
            stream,
            request_bytes: request_bytes as u64,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn event(
        &self,
        up: &UpstreamInfo,
        status: u16,
        latency_ms: u64,
        error: &str,
        input_tokens: i64,
        output_tokens: i64,
        response_bytes: u64,
        ttft_ms: u64,
        tps: f64,
    ) -> LogEvent {
        LogEvent {
            ts_ms: now_millis(),
            request_id: self.request_id.clone(),
            facade: self.facade.as_str().to_string(),
            request_model: self.request_model.clone(),
            upstream_model: up.model.clone(),
            provider_type: up.provider_type.clone(),
            pool_id: up.pool_id,
            provider_id: up.provider_id,
            credential_id: up.credential_id,
            client_key: self.client_key.clone(),
            src_ip: self.src_ip.clone(),
            user_agent: self.user_agent.clone(),
            is_test: self.is_test,
            stream: self.stream,
            request_bytes: self.request_bytes,
            response_bytes,
            input_tokens,
            output_tokens,
            status,
            latency_ms,
            ttft_ms,
            tps,
            error: error.to_string(),
        }
    }
}

/// The identifying subset of a routed upstream, safe to keep past the
/// upstream call (no key material).
#[derive(Clone, Debug, Default)]
pub struct UpstreamInfo {
    pub pool_id: u64,
    pub credential_id: u64,
    pub provider_id: u64,
    pub provider_type: String,
    pub model: String,
}

impl From<&RoutedUpstream> for UpstreamInfo {
    fn from(up: &RoutedUpstream) -> Self {
        Self {
            pool_id: up.pool_id,
            credential_id: up.credential_id,
            provider_id: up.provider_id,
            provider_type: up.provider_type.clone(),
            model: up.model.clone(),
        }
    }
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    let id = header_str(headers, "x-request-id");
    if id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        id
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

pub fn client_ip(headers: &HeaderMap) -> String {
    let xff = header_str(headers, "x-forwarded-for");
    if !xff.is_empty() {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    header_str(headers, "x-real-ip")
}

pub fn is_test_request(headers: &HeaderMap) -> bool {
    matches!(
        header_str(headers, "x-gateway-test").to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

// ---------------------------------------------------------------------------
// Usage extraction
// ---------------------------------------------------------------------------

pub fn parse_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn usage_field(usage: &Value, primary: &str, fallback: &str) -> i64 {
    let v = parse_i64(usage.get(primary).unwrap_or(&Value::Null));
    if v != 0 {
        v
    } else {
        parse_i64(usage.get(fallback).unwrap_or(&Value::Null))
    }
}

/// `usage.{prompt_tokens|input_tokens, completion_tokens|output_tokens}`
/// from an OpenAI-shaped response body.
pub fn extract_openai_usage(raw: &[u8]) -> (i64, i64) {
    let Ok(root) = serde_json::from_slice::<Value>(raw) else {
        return (0, 0);
    };
    let Some(usage) = root.get("usage").filter(|u| u.is_object()) else {
        return (0, 0);
    };
    (
        usage_field(usage, "prompt_tokens", "input_tokens"),
        usage_field(usage, "completion_tokens", "output_tokens"),
    )
}

pub fn extract_anthropic_usage(raw: &[u8]) -> (i64, i64) {
    let Ok(root) = serde_json::from_slice::<Value>(raw) else {
        return (0, 0);
    };
    let Some(usage) = root.get("usage").filter(|u| u.is_object()) else {
        return (0, 0);
    };
    (
        parse_i64(usage.get("input_tokens").unwrap_or(&Value::Null)),
        parse_i64(usage.get("output_tokens").unwrap_or(&Value::Null)),
    )
}

/// Injects `stream_options.include_usage = true` (unless the client set it)
/// so OpenAI-dialect upstreams report token counts in the final chunk.
/// Returns the body unchanged when it does not parse.
pub fn ensure_stream_include_usage(body: &[u8]) -> Vec<u8> {
    let Ok(mut root) = serde_json::from_slice::<Value>(body) else {
        return body.to_vec();
    };
    let Some(obj) = root.as_object_mut() else {
        return body.to_vec();
    };
    let options = obj
        .entry("stream_options")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Some(options) = options.as_object_mut() {
        options
            .entry("include_usage")
            .or_insert(Value::Bool(true));
    }
    serde_json::to_vec(&root).unwrap_or_else(|_| body.to_vec())
}

/// Rewrites the `model` field of a raw JSON body, preserving every other
/// field the client sent.
pub fn rewrite_model(body: &[u8], model: &str) -> Vec<u8> {
    let Ok(mut root) = serde_json::from_slice::<Value>(body) else {
        return body.to_vec();
    };
    let Some(obj) = root.as_object_mut() else {
        return body.to_vec();
    };
    obj.insert("model".to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&root).unwrap_or_else(|_| body.to_vec())
}

// ---------------------------------------------------------------------------
// Stream finalization
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct StreamStats {
    pub response_bytes: u64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub ttft_ms: u64,
    pub tps: f64,
}

struct FinalizerInner {
    router: Arc<Router>,
    bus: Arc<LogBus>,
    metrics: Arc<Metrics>,
    meta: RequestMeta,
    upstream: UpstreamInfo,
    start: Instant,
    status: u16,
    transport_ok: bool,
}

/// Owns the post-stream obligations for one streaming response. Dropping
/// it unfinished (client disconnect, panic unwinding through the body
/// stream) still settles the credential.
pub struct StreamFinalizer {
    inner: Option<FinalizerInner>,
}

impl StreamFinalizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<Router>,
        bus: Arc<LogBus>,
        metrics: Arc<Metrics>,
        meta: RequestMeta,
        upstream: UpstreamInfo,
        start: Instant,
        status: u16,
        transport_ok: bool,
    ) -> Self {
        Self {
            inner: Some(FinalizerInner {
                router,
                bus,
                metrics,
                meta,
                upstream,
                start,
                status,
                transport_ok,
            }),
        }
    }

    pub fn finalize(mut self, translate_ok: bool, error: &str, stats: StreamStats) {
        self.complete(translate_ok, error, stats);
    }

    fn complete(&mut self, translate_ok: bool, error: &str, stats: StreamStats) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let ok = translate_ok && inner.transport_ok;
        let latency = inner.start.elapsed();
        inner.router.health().end_request(
            inner.upstream.credential_id,
            ok,
            inner.status,
            latency,
        );
        inner.router.record_route_result(
            inner.upstream.pool_id,
            inner.meta.facade,
            &inner.meta.request_model,
            inner.upstream.credential_id,
            ok,
            inner.status,
        );
        inner.bus.publish(inner.meta.event(
            &inner.upstream,
            inner.status,
            latency.as_millis() as u64,
            error,
            stats.input_tokens,
            stats.output_tokens,
            stats.response_bytes,
            stats.ttft_ms,
            stats.tps,
        ));
        inner.metrics.observe_request(
            inner.meta.facade.as_str(),
            &inner.upstream.provider_type,
            inner.status,
            latency,
        );
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        self.complete(false, "client disconnected", StreamStats::default());
    }
}

// ---------------------------------------------------------------------------
// Streaming body drivers
// ---------------------------------------------------------------------------

/// Which dialect's usage shape to look for inside passthrough chunks.
#[derive(Clone, Copy, Debug)]
pub enum PassthroughDialect {
    OpenAi,
    Anthropic,
}

fn stream_usage_from_data(dialect: PassthroughDialect, data: &str) -> Option<(i64, i64)> {
    let value: Value = serde_json::from_str(data).ok()?;
    match dialect {
        PassthroughDialect::OpenAi => {
            let usage = value.get("usage").filter(|u| u.is_object())?;
            Some((
                usage_field(usage, "prompt_tokens", "input_tokens"),
                usage_field(usage, "completion_tokens", "output_tokens"),
            ))
        }
        PassthroughDialect::Anthropic => {
            let usage = value
                .get("usage")
                .filter(|u| u.is_object())
                .or_else(|| {
                    value
                        .get("message")
                        .and_then(|m| m.get("usage"))
                        .filter(|u| u.is_object())
                })?;
            Some((
                parse_i64(usage.get("input_tokens").unwrap_or(&Value::Null)),
                parse_i64(usage.get("output_tokens").unwrap_or(&Value::Null)),
            ))
        }
    }
}

struct StreamClock {
    start: Instant,
    first: Option<Instant>,
    last: Option<Instant>,
    chunks: u64,
    ttft_ms: u64,
}

impl StreamClock {
    fn new(start: Instant) -> Self {
        Self {
            start,
            first: None,
            last: None,
            chunks: 0,
            ttft_ms: 0,
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        if self.first.is_none() {
            self.first = Some(now);
            self.ttft_ms = now.duration_since(self.start).as_millis() as u64;
        }
        self.last = Some(now);
        self.chunks += 1;
    }

    fn tps(&self) -> f64 {
        if self.chunks < 2 {
            return 0.0;
        }
        let (Some(first), Some(last)) = (self.first, self.last) else {
            return 0.0;
        };
        let window = last.duration_since(first).as_secs_f64();
        if window > 0.0 {
            (self.chunks - 1) as f64 / window
        } else {
            0.0
        }
    }
}

type BlockReader =
    SseBlockReader<tokio::io::BufReader<StreamReader<ByteStream, Bytes>>>;
type ByteStream = futures_util::stream::BoxStream<'static, std::io::Result<Bytes>>;

fn block_reader(resp: reqwest::Response) -> BlockReader {
    let bytes: ByteStream = resp
        .bytes_stream()
        .map(|result| result.map_err(std::io::Error::other))
        .boxed();
    SseBlockReader::new(tokio::io::BufReader::new(StreamReader::new(bytes)))
}

/// Forwards an upstream SSE body verbatim (block-at-a-time, flushed per
/// block), harvesting usage/TTFT/TPS along the way, then settles the
/// finalizer.
pub fn passthrough_sse_body(
    resp: reqwest::Response,
    dialect: PassthroughDialect,
    finalizer: StreamFinalizer,
) -> Body {
    struct State {
        reader: BlockReader,
        finalizer: Option<StreamFinalizer>,
        clock: StreamClock,
        stats: StreamStats,
        dialect: PassthroughDialect,
        done: bool,
    }

    let start = finalizer
        .inner
        .as_ref()
        .map(|inner| inner.start)
        .unwrap_or_else(Instant::now);
    let state = State {
        reader: block_reader(resp),
        finalizer: Some(finalizer),
        clock: StreamClock::new(start),
        stats: StreamStats::default(),
        dialect,
        done: false,
    };

    let stream = stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        match st.reader.next_block().await {
            Ok(Some(block)) => {
                st.clock.tick();
                let data = extract_sse_data(&block);
                if let Some((input, output)) = stream_usage_from_data(st.dialect, &data) {
                    if input != 0 {
                        st.stats.input_tokens = input;
                    }
                    if output != 0 {
                        st.stats.output_tokens = output;
                    }
                }
                let frame = Bytes::from(format!("{block}\n"));
                st.stats.response_bytes += frame.len() as u64;

                if matches!(st.dialect, PassthroughDialect::OpenAi) && data == "[DONE]" {
                    st.done = true;
                    st.stats.ttft_ms = st.clock.ttft_ms;
                    st.stats.tps = st.clock.tps();
                    if let Some(finalizer) = st.finalizer.take() {
                        finalizer.finalize(true, "", st.stats);
                    }
                }
                Some((Ok(frame), st))
            }
            Ok(None) => {
                st.done = true;
                st.stats.ttft_ms = st.clock.ttft_ms;
                st.stats.tps = st.clock.tps();
                if let Some(finalizer) = st.finalizer.take() {
                    finalizer.finalize(true, "", st.stats);
                }
                None
            }
            Err(err) => {
                st.done = true;
                st.stats.ttft_ms = st.clock.ttft_ms;
                st.stats.tps = st.clock.tps();
                if let Some(finalizer) = st.finalizer.take() {
                    finalizer.finalize(false, &err.to_string(), st.stats);
                }
                Some((Err(err), st))
            }
        }
    });
    Body::from_stream(stream)
}

/// The two transcoding directions, unified for the driver.
pub enum StreamTranscoder {
    /// Anthropic upstream events -> OpenAI chunks.
    ToOpenAi(OpenAiStreamEncoder),
    /// OpenAI upstream chunks -> Anthropic events.
    ToAnthropic(AnthropicStreamEncoder),
}

impl StreamTranscoder {
    fn begin(&self) -> Vec<Bytes> {
        match self {
            StreamTranscoder::ToOpenAi(_) => Vec::new(),
            StreamTranscoder::ToAnthropic(enc) => enc.begin(),
        }
    }

    fn push_data(&mut self, data: &str) -> (Vec<Bytes>, bool) {
        match self {
            StreamTranscoder::ToOpenAi(enc) => enc.push_data(data),
            StreamTranscoder::ToAnthropic(enc) => enc.push_data(data),
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        match self {
            StreamTranscoder::ToOpenAi(enc) => enc.finish(),
            StreamTranscoder::ToAnthropic(enc) => enc.finish(),
        }
    }

    fn usage(&self) -> (i64, i64) {
        let usage = match self {
            StreamTranscoder::ToOpenAi(enc) => enc.usage(),
            StreamTranscoder::ToAnthropic(enc) => enc.usage(),
        };
        (usage.input_tokens, usage.output_tokens)
    }
}

/// Translates an upstream SSE body into the facade's event vocabulary,
/// emitting each translated frame as its own chunk, then settles the
/// finalizer.
pub fn transcode_sse_body(
    resp: reqwest::Response,
    transcoder: StreamTranscoder,
    finalizer: StreamFinalizer,
) -> Body {
    struct State {
        reader: BlockReader,
        transcoder: StreamTranscoder,
        finalizer: Option<StreamFinalizer>,
        buffer: VecDeque<std::io::Result<Bytes>>,
        clock: StreamClock,
        stats: StreamStats,
        upstream_done: bool,
        finished: bool,
    }

    impl State {
        fn settle(&mut self, ok: bool, error: &str) {
            self.stats.ttft_ms = self.clock.ttft_ms;
            self.stats.tps = self.clock.tps();
            let (input, output) = self.transcoder.usage();
            self.stats.input_tokens = input;
            self.stats.output_tokens = output;
            if let Some(finalizer) = self.finalizer.take() {
                finalizer.finalize(ok, error, self.stats);
            }
        }

        fn buffer_frames(&mut self, frames: Vec<Bytes>) {
            for frame in frames {
                self.clock.tick();
                self.stats.response_bytes += frame.len() as u64;
                self.buffer.push_back(Ok(frame));
            }
        }

        /// Synthetic frames emitted before any upstream byte; they count
        /// toward response size but not TTFT/TPS.
        fn buffer_opening(&mut self, frames: Vec<Bytes>) {
            for frame in frames {
                self.stats.response_bytes += frame.len() as u64;
                self.buffer.push_back(Ok(frame));
            }
        }
    }

    let start = finalizer
        .inner
        .as_ref()
        .map(|inner| inner.start)
        .unwrap_or_else(Instant::now);
    let mut state = State {
        reader: block_reader(resp),
        transcoder,
        finalizer: Some(finalizer),
        buffer: VecDeque::new(),
        clock: StreamClock::new(start),
        stats: StreamStats::default(),
        upstream_done: false,
        finished: false,
    };
    let opening = state.transcoder.begin();
    state.buffer_opening(opening);

    let stream = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.buffer.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            if st.upstream_done {
                let frames = st.transcoder.finish();
                st.buffer_frames(frames);
                st.finished = true;
                st.settle(true, "");
                continue;
            }
            match st.reader.next_block().await {
                Ok(Some(block)) => {
                    let data = extract_sse_data(&block);
                    if data.is_empty() {
                        continue;
                    }
                    if data == "[DONE]" {
                        st.upstream_done = true;
                        continue;
                    }
                    let (frames, done) = st.transcoder.push_data(&data);
                    st.buffer_frames(frames);
                    if done {
                        st.upstream_done = true;
                    }
                }
                Ok(None) => {
                    st.upstream_done = true;
                }
                Err(err) => {
                    st.finished = true;
                    st.settle(false, &err.to_string());
                    return Some((Err(err), st));
                }
            }
        }
    });
    Body::from_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_usage_injected_once() {
        let body = br#"{"model":"m","stream":true}"#;
        let patched = ensure_stream_include_usage(body);
        let value: Value = serde_json::from_slice(&patched).unwrap();
        assert_eq!(value["stream_options"]["include_usage"], true);

        let explicit = br#"{"model":"m","stream_options":{"include_usage":false}}"#;
        let patched = ensure_stream_include_usage(explicit);
        let value: Value = serde_json::from_slice(&patched).unwrap();
        assert_eq!(value["stream_options"]["include_usage"], false);
    }

    #[test]
    fn rewrite_model_preserves_unknown_fields() {
        let body = br#"{"model":"alias","n":3,"custom":{"a":1}}"#;
        let patched = rewrite_model(body, "real-model");
        let value: Value = serde_json::from_slice(&patched).unwrap();
        assert_eq!(value["model"], "real-model");
        assert_eq!(value["n"], 3);
        assert_eq!(value["custom"]["a"], 1);
    }

    #[test]
    fn usage_extraction_handles_both_key_sets() {
        let openai = br#"{"usage":{"prompt_tokens":3,"completion_tokens":5}}"#;
        assert_eq!(extract_openai_usage(openai), (3, 5));
        let anthropic_style = br#"{"usage":{"input_tokens":3,"output_tokens":5}}"#;
        assert_eq!(extract_openai_usage(anthropic_style), (3, 5));
        assert_eq!(extract_anthropic_usage(anthropic_style), (3, 5));
        assert_eq!(extract_openai_usage(b"not json"), (0, 0));
    }

    #[test]
    fn stream_usage_reads_message_start_envelope() {
        let data = r#"{"type":"message_start","message":{"usage":{"input_tokens":9,"output_tokens":0}}}"#;
        assert_eq!(
            stream_usage_from_data(PassthroughDialect::Anthropic, data),
            Some((9, 0))
        );
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        headers.insert("x-real-ip", "9.9.9.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "1.2.3.4");
        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers), "9.9.9.9");
    }

    #[test]
    fn parse_i64_accepts_numbers_and_strings() {
        assert_eq!(parse_i64(&serde_json::json!(12)), 12);
        assert_eq!(parse_i64(&serde_json::json!(12.9)), 12);
        assert_eq!(parse_i64(&serde_json::json!("34")), 34);
        assert_eq!(parse_i64(&serde_json::json!(null)), 0);
    }
}
