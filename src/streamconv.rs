//! SSE stream transcoding between the Anthropic event vocabulary and the
//! OpenAI chunk vocabulary.
//!
//! Encoders are push-based: the caller feeds one `data:` payload at a time
//! and writes every returned frame immediately, so nothing larger than one
//! block is ever buffered. Malformed JSON in a payload skips that block;
//! it never aborts the stream.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::convert::{finish_reason_to_stop_reason, stop_reason_to_finish_reason, unix_seconds};
use crate::relay::parse_i64;

/// Input/output token counts observed inside a stream, if any chunk
/// carried usage.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

fn anthropic_event(name: &str, payload: Value) -> Bytes {
    let body = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {name}\ndata: {body}\n\n"))
}

fn openai_chunk(payload: Value) -> Bytes {
    let body = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {body}\n\n"))
}

// ---------------------------------------------------------------------------
// OpenAI chunks -> Anthropic events
// ---------------------------------------------------------------------------

pub struct AnthropicStreamEncoder {
    message_id: String,
    model: String,
    next_index: usize,
    open_blocks: BTreeSet<usize>,
    text_index: Option<usize>,
    tool_index_by_id: HashMap<String, usize>,
    finish_reason: Option<String>,
    usage: StreamUsage,
}

impl AnthropicStreamEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4()),
            model: model.into(),
            next_index: 0,
            open_blocks: BTreeSet::new(),
            text_index: None,
            tool_index_by_id: HashMap::new(),
            finish_reason: None,
            usage: StreamUsage::default(),
        }
    }

    /// Synthetic `message_start` envelope, emitted before any upstream data.
    pub fn begin(&self) -> Vec<Bytes> {
        vec![anthropic_event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 },
                },
            }),
        )]
    }

    pub fn usage(&self) -> StreamUsage {
        self.usage
    }

    /// Feeds one OpenAI chunk payload. Returns the translated frames and
    /// whether the logical stream has ended (`finish_reason` seen).
    pub fn push_data(&mut self, data: &str) -> (Vec<Bytes>, bool) {
        let mut out = Vec::<Bytes>::new();
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return (out, false);
        };

        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            self.capture_openai_usage(usage);
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(Value::as_object)
        else {
            return (out, false);
        };

        if let Some(delta) = choice.get("delta").and_then(Value::as_object) {
            self.push_delta(delta, &mut out);
        }

        if let Some(reason) = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
        {
            self.finish_reason = Some(reason.to_string());
            return (out, true);
        }
        (out, false)
    }

    fn push_delta(&mut self, delta: &Map<String, Value>, out: &mut Vec<Bytes>) {
        if let Some(reasoning) = delta
            .get("reasoning_content")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
        {
            self.ensure_block_open(0, json!({ "type": "thinking", "thinking": "" }), out);
            out.push(anthropic_event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": { "type": "thinking_delta", "thinking": reasoning },
                }),
            ));
        }

        if let Some(text) = delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            // Text claims index 0 unless something (thinking) already holds
            // it, then index 1; the choice is sticky for the whole stream.
            let idx = match self.text_index {
                Some(idx) => idx,
                None => {
                    let idx = usize::from(self.open_blocks.contains(&0));
                    self.text_index = Some(idx);
                    idx
                }
            };
            self.ensure_block_open(idx, json!({ "type": "text", "text": "" }), out);
            out.push(anthropic_event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": idx,
                    "delta": { "type": "text_delta", "text": text },
                }),
            ));
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let Some(call) = call.as_object() else { continue };
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or_default();
                if id.is_empty() {
                    continue;
                }
                let function = call.get("function").and_then(Value::as_object);
                if !self.tool_index_by_id.contains_key(id) {
                    let idx = self.next_index;
                    self.tool_index_by_id.insert(id.to_string(), idx);
                    let name = function
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    self.ensure_block_open(
                        idx,
                        json!({ "type": "tool_use", "id": id, "name": name, "input": {} }),
                        out,
                    );
                }
                let idx = self.tool_index_by_id[id];
                if let Some(arguments) = function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                    .filter(|a| !a.is_empty())
                {
                    out.push(anthropic_event(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": idx,
                            "delta": { "type": "input_json_delta", "partial_json": arguments },
                        }),
                    ));
                }
            }
        }
    }

    fn ensure_block_open(&mut self, index: usize, content_block: Value, out: &mut Vec<Bytes>) {
        if self.open_blocks.contains(&index) {
            return;
        }
        out.push(anthropic_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": content_block,
            }),
        ));
        self.open_blocks.insert(index);
        if self.next_index <= index {
            self.next_index = index + 1;
        }
    }

    fn capture_openai_usage(&mut self, usage: &Value) {
        let input = parse_i64(usage.get("prompt_tokens").unwrap_or(&Value::Null));
        let input = if input != 0 {
            input
        } else {
            parse_i64(usage.get("input_tokens").unwrap_or(&Value::Null))
        };
        let output = parse_i64(usage.get("completion_tokens").unwrap_or(&Value::Null));
        let output = if output != 0 {
            output
        } else {
            parse_i64(usage.get("output_tokens").unwrap_or(&Value::Null))
        };
        if input != 0 {
            self.usage.input_tokens = input;
        }
        if output != 0 {
            self.usage.output_tokens = output;
        }
    }

    /// Terminal sequence: close every open block in ascending order, then
    /// `message_delta` with the mapped stop reason, then `message_stop`.
    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut out = Vec::<Bytes>::new();
        for index in std::mem::take(&mut self.open_blocks) {
            out.push(anthropic_event(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": index }),
            ));
        }
        let stop_reason =
            finish_reason_to_stop_reason(self.finish_reason.as_deref(), false);
        out.push(anthropic_event(
            "message_delta",
            json!({ "type": "message_delta", "delta": { "stop_reason": stop_reason } }),
        ));
        out.push(anthropic_event("message_stop", json!({ "type": "message_stop" })));
        out
    }
}

// ---------------------------------------------------------------------------
// Anthropic events -> OpenAI chunks
// ---------------------------------------------------------------------------

pub struct OpenAiStreamEncoder {
    completion_id: String,
    created: i64,
    model: String,
    sent_role: bool,
    finish_reason: &'static str,
    tool_id_by_index: HashMap<usize, String>,
    usage: StreamUsage,
}

impl OpenAiStreamEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            completion_id: format!("chatcmpl_{}", Uuid::new_v4()),
            created: unix_seconds(),
            model: model.into(),
            sent_role: false,
            finish_reason: "stop",
            tool_id_by_index: HashMap::new(),
            usage: StreamUsage::default(),
        }
    }

    pub fn usage(&self) -> StreamUsage {
        self.usage
    }

    fn chunk(&self, delta: Value) -> Bytes {
        openai_chunk(json!({
            "id": self.completion_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta }],
        }))
    }

    pub fn push_data(&mut self, data: &str) -> (Vec<Bytes>, bool) {
        let mut out = Vec::<Bytes>::new();
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return (out, false);
        };

        if !self.sent_role {
            out.push(self.chunk(json!({ "role": "assistant" })));
            self.sent_role = true;
        }

        self.capture_anthropic_usage(&event);

        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "content_block_start" => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let Some(block) = event.get("content_block").and_then(Value::as_object) else {
                    return (out, false);
                };
                match block.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "thinking" => {
                        out.push(self.chunk(json!({ "reasoning_content": "" })));
                    }
                    "tool_use" => {
                        let id = block
                            .get("id")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .unwrap_or_default();
                        let name = block
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .unwrap_or_default();
                        if id.is_empty() || name.is_empty() {
                            return (out, false);
                        }
                        self.tool_id_by_index.insert(index, id.to_string());
                        out.push(self.chunk(json!({
                            "tool_calls": [{
                                "index": index,
                                "id": id,
                                "type": "function",
                                "function": { "name": name, "arguments": "" },
                            }],
                        })));
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let Some(delta) = event.get("delta").and_then(Value::as_object) else {
                    return (out, false);
                };
                match delta.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "thinking_delta" => {
                        if let Some(thinking) = delta
                            .get("thinking")
                            .and_then(Value::as_str)
                            .filter(|t| !t.is_empty())
                        {
                            out.push(self.chunk(json!({ "reasoning_content": thinking })));
                        }
                    }
                    "text_delta" => {
                        if let Some(text) = delta
                            .get("text")
                            .and_then(Value::as_str)
                            .filter(|t| !t.is_empty())
                        {
                            out.push(self.chunk(json!({ "content": text })));
                        }
                    }
                    "input_json_delta" => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let Some(tool_id) = self.tool_id_by_index.get(&index) else {
                            return (out, false);
                        };
                        if partial.is_empty() {
                            return (out, false);
                        }
                        out.push(self.chunk(json!({
                            "tool_calls": [{
                                "index": index,
                                "id": tool_id,
                                "type": "function",
                                "function": { "arguments": partial },
                            }],
                        })));
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(stop_reason) = event
                    .get("delta")
                    .and_then(Value::as_object)
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                {
                    self.finish_reason = stop_reason_to_finish_reason(Some(stop_reason));
                }
            }
            "message_stop" => return (out, true),
            _ => {}
        }
        (out, false)
    }

    fn capture_anthropic_usage(&mut self, event: &Value) {
        let usage = event
            .get("usage")
            .filter(|u| u.is_object())
            .or_else(|| {
                event
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .filter(|u| u.is_object())
            });
        let Some(usage) = usage else { return };
        let input = parse_i64(usage.get("input_tokens").unwrap_or(&Value::Null));
        let output = parse_i64(usage.get("output_tokens").unwrap_or(&Value::Null));
        if input != 0 {
            self.usage.input_tokens = input;
        }
        if output != 0 {
            self.usage.output_tokens = output;
        }
    }

    /// Terminal chunk with the mapped finish reason, then `data: [DONE]`.
    pub fn finish(&mut self) -> Vec<Bytes> {
        vec![
            openai_chunk(json!({
                "id": self.completion_id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.model,
                "choices": [{ "index": 0, "delta": {}, "finish_reason": self.finish_reason }],
            })),
            Bytes::from_static(b"data: [DONE]\n\n"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_to_strings(frames: &[Bytes]) -> Vec<String> {
        frames
            .iter()
            .map(|f| String::from_utf8(f.to_vec()).unwrap())
            .collect()
    }

    fn data_payload(frame: &str) -> Value {
        let data = crate::sse::extract_sse_data(frame);
        serde_json::from_str(&data).unwrap()
    }

    #[test]
    fn anthropic_tool_use_stream_becomes_openai_chunks() {
        let mut enc = OpenAiStreamEncoder::new("claude-sonnet-4-5");
        let mut frames = Vec::new();

        let (out, done) = enc.push_data(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":3,"output_tokens":0}}}"#,
        );
        frames.extend(out);
        assert!(!done);

        let (out, _) = enc.push_data(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_weather","input":{}}}"#,
        );
        frames.extend(out);
        let (out, _) = enc.push_data(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"location\":\"SF\"}"}}"#,
        );
        frames.extend(out);
        let (out, _) =
            enc.push_data(r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#);
        frames.extend(out);
        let (out, done) = enc.push_data(r#"{"type":"message_stop"}"#);
        frames.extend(out);
        assert!(done);
        frames.extend(enc.finish());

        let texts = frames_to_strings(&frames);
        // role chunk, tool start chunk, arguments chunk, final chunk, [DONE]
        assert_eq!(texts.len(), 5);

        let role = data_payload(&texts[0]);
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");

        let start = data_payload(&texts[1]);
        let call = &start["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 0);
        assert_eq!(call["id"], "toolu_1");
        assert_eq!(call["function"]["name"], "get_weather");
        assert_eq!(call["function"]["arguments"], "");

        let args = data_payload(&texts[2]);
        assert_eq!(
            args["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{\"location\":\"SF\"}"
        );

        let last = data_payload(&texts[3]);
        assert_eq!(last["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(last["choices"][0]["delta"], json!({}));

        assert_eq!(texts[4], "data: [DONE]\n\n");
        assert_eq!(enc.usage().input_tokens, 3);
    }

    #[test]
    fn openai_text_stream_becomes_anthropic_events() {
        let mut enc = AnthropicStreamEncoder::new("gpt-4o");
        let mut frames = enc.begin();

        let (out, done) =
            enc.push_data(r#"{"choices":[{"index":0,"delta":{"content":"hel"}}]}"#);
        frames.extend(out);
        assert!(!done);
        let (out, _) = enc.push_data(r#"{"choices":[{"index":0,"delta":{"content":"lo"}}]}"#);
        frames.extend(out);
        let (out, done) =
            enc.push_data(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#);
        frames.extend(out);
        assert!(done);
        frames.extend(enc.finish());

        let texts = frames_to_strings(&frames);
        assert!(texts[0].starts_with("event: message_start\n"));
        assert!(texts[1].starts_with("event: content_block_start\n"));
        let first_delta = data_payload(&texts[2]);
        assert_eq!(first_delta["delta"]["text"], "hel");
        assert_eq!(first_delta["index"], 0);
        let second_delta = data_payload(&texts[3]);
        assert_eq!(second_delta["delta"]["text"], "lo");
        assert_eq!(second_delta["index"], 0);
        assert!(texts[4].starts_with("event: content_block_stop\n"));
        let message_delta = data_payload(&texts[5]);
        assert_eq!(message_delta["delta"]["stop_reason"], "end_turn");
        assert!(texts[6].starts_with("event: message_stop\n"));
    }

    #[test]
    fn reasoning_then_text_uses_separate_indices() {
        let mut enc = AnthropicStreamEncoder::new("deepseek-r1");
        let mut frames = enc.begin();
        let (out, _) = enc.push_data(
            r#"{"choices":[{"index":0,"delta":{"reasoning_content":"hmm"}}]}"#,
        );
        frames.extend(out);
        let (out, _) = enc.push_data(r#"{"choices":[{"index":0,"delta":{"content":"answer"}}]}"#);
        frames.extend(out);
        frames.extend(enc.finish());

        let texts = frames_to_strings(&frames);
        let thinking_start = data_payload(&texts[1]);
        assert_eq!(thinking_start["index"], 0);
        assert_eq!(thinking_start["content_block"]["type"], "thinking");
        let text_start = data_payload(&texts[3]);
        assert_eq!(text_start["index"], 1);
        assert_eq!(text_start["content_block"]["type"], "text");
        // close order is ascending: 0 then 1
        let stop0 = data_payload(&texts[5]);
        let stop1 = data_payload(&texts[6]);
        assert_eq!(stop0["index"], 0);
        assert_eq!(stop1["index"], 1);
    }

    #[test]
    fn tool_calls_after_text_take_higher_indices() {
        let mut enc = AnthropicStreamEncoder::new("gpt-4o");
        let _ = enc.begin();
        let (_, _) = enc.push_data(r#"{"choices":[{"index":0,"delta":{"content":"x"}}]}"#);
        let (out, _) = enc.push_data(
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"f","arguments":""}}]}}]}"#,
        );
        let texts = frames_to_strings(&out);
        let start = data_payload(&texts[0]);
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["index"], 1);
    }

    #[test]
    fn malformed_json_is_skipped_not_fatal() {
        let mut enc = OpenAiStreamEncoder::new("m");
        let (out, done) = enc.push_data("{not json");
        assert!(out.is_empty());
        assert!(!done);
        let (out, _) = enc.push_data(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}"#,
        );
        assert_eq!(out.len(), 2); // role chunk + text chunk
    }

    #[test]
    fn openai_usage_chunk_is_captured() {
        let mut enc = AnthropicStreamEncoder::new("m");
        let (_, _) = enc.push_data(r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":11}}"#);
        assert_eq!(enc.usage().input_tokens, 7);
        assert_eq!(enc.usage().output_tokens, 11);
    }
}
