//! Message-shape conversion between dialects.
//!
//! Every function here is deterministic and pure. Conversions preserve text
//! ordering, tool-call/tool-result id linkage, image source semantics, and
//! the separation of reasoning from visible content.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::proto::anthropic::{Message, MessagesRequest, MessagesResponse, ToolDefinition, Usage};
use crate::proto::gemini::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
    UsageMetadata,
};
use crate::proto::openai::{
    ChatChoice, ChatCompletionResponse, ChatCompletionsRequest, ChatMessage, ChatUsage,
    FunctionCall, ResponsesItem, ResponsesResponse, ResponsesUsage, ToolCall,
};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unsupported message shape: {0}")]
    UnsupportedMessageShape(String),
    #[error("unsupported content part: {0}")]
    UnsupportedContentPart(String),
    #[error("invalid tool arguments: {0}")]
    InvalidToolArguments(String),
}

type ConvertResult<T> = Result<T, ConvertError>;

pub fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Stop-reason mapping
// ---------------------------------------------------------------------------

pub fn stop_reason_to_finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason.map(str::trim) {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
}

pub fn finish_reason_to_stop_reason(finish_reason: Option<&str>, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_use";
    }
    match finish_reason.map(str::trim) {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    }
}

// ---------------------------------------------------------------------------
// Anthropic request -> OpenAI chat request
// ---------------------------------------------------------------------------

pub fn anthropic_to_openai_chat(req: &MessagesRequest) -> ConvertResult<ChatCompletionsRequest> {
    let system_text = match req.system.as_ref() {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    let mut out_msgs = Vec::<Value>::with_capacity(req.messages.len() + 1);
    if !system_text.trim().is_empty() {
        out_msgs.push(json!({ "role": "system", "content": system_text }));
    }
    for message in &req.messages {
        out_msgs.extend(anthropic_message_to_openai_messages(message)?);
    }

    let tools = anthropic_tools_to_openai(&req.tools)?;
    let tool_choice = match req.tool_choice.as_ref() {
        Some(choice) => Some(anthropic_tool_choice_to_openai(choice)?),
        None => None,
    };

    Ok(ChatCompletionsRequest {
        model: req.model.clone(),
        messages: Value::Array(out_msgs),
        max_tokens: Some(i64::from(req.max_tokens)),
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stream_options: None,
        tools,
        tool_choice,
    })
}

fn anthropic_message_to_openai_messages(message: &Message) -> ConvertResult<Vec<Value>> {
    let role = message.role.trim();
    if role.is_empty() {
        return Err(ConvertError::UnsupportedMessageShape(
            "anthropic message missing role".into(),
        ));
    }

    let blocks = anthropic_content_to_blocks(&message.content)?;

    let mut text_parts = Vec::<String>::new();
    let mut reasoning_parts = Vec::<String>::new();
    let mut content_parts = Vec::<Value>::new();
    let mut has_non_text = false;
    let mut tool_calls = Vec::<Value>::new();
    let mut tool_messages = Vec::<Value>::new();

    for block in &blocks {
        match block.get("type").and_then(Value::as_str).unwrap_or_default() {
            "text" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        text_parts.push(text.to_string());
                        content_parts.push(json!({ "type": "text", "text": text }));
                    }
                }
            }
            "thinking" => {
                if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                    if !thinking.is_empty() {
                        reasoning_parts.push(thinking.to_string());
                    }
                }
            }
            "tool_use" => {
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                if id.trim().is_empty() || name.trim().is_empty() {
                    return Err(ConvertError::UnsupportedMessageShape(
                        "tool_use missing id/name".into(),
                    ));
                }
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                let arguments =
                    serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments },
                }));
            }
            "tool_result" => {
                let tool_use_id = block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if tool_use_id.trim().is_empty() {
                    return Err(ConvertError::UnsupportedMessageShape(
                        "tool_result missing tool_use_id".into(),
                    ));
                }
                let raw = block.get("content").unwrap_or(&Value::Null);
                let mut content = tool_result_content_to_text(raw);
                if content.trim().is_empty() {
                    content = stringify_jsonish(raw);
                }
                tool_messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                }));
            }
            "image" => {
                content_parts.push(anthropic_image_block_to_openai(block)?);
                has_non_text = true;
            }
            other => {
                return Err(ConvertError::UnsupportedContentPart(format!(
                    "unsupported anthropic block type {other:?}"
                )));
            }
        }
    }

    let content: Value = if has_non_text {
        Value::Array(content_parts)
    } else {
        Value::String(text_parts.concat())
    };

    let mut out = Vec::<Value>::with_capacity(1 + tool_messages.len());
    match role {
        "user" => out.push(json!({ "role": "user", "content": content })),
        "assistant" => {
            let mut msg = Map::<String, Value>::new();
            msg.insert("role".into(), Value::String("assistant".into()));
            msg.insert("content".into(), content);
            if !reasoning_parts.is_empty() {
                msg.insert(
                    "reasoning_content".into(),
                    Value::String(reasoning_parts.concat()),
                );
            }
            if !tool_calls.is_empty() {
                msg.insert("tool_calls".into(), Value::Array(tool_calls));
            }
            out.push(Value::Object(msg));
        }
        other => {
            return Err(ConvertError::UnsupportedMessageShape(format!(
                "unsupported anthropic message role {other:?}"
            )));
        }
    }
    out.extend(tool_messages);
    Ok(out)
}

fn anthropic_content_to_blocks(content: &Value) -> ConvertResult<Vec<Map<String, Value>>> {
    match content {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => {
            if s.trim().is_empty() {
                Ok(Vec::new())
            } else {
                let mut block = Map::new();
                block.insert("type".into(), Value::String("text".into()));
                block.insert("text".into(), Value::String(s.clone()));
                Ok(vec![block])
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().cloned().ok_or_else(|| {
                    ConvertError::UnsupportedMessageShape(
                        "anthropic content block not object".into(),
                    )
                })
            })
            .collect(),
        other => Err(ConvertError::UnsupportedContentPart(format!(
            "unsupported anthropic content type: {other}"
        ))),
    }
}

fn tool_result_content_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .filter(|obj| obj.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|obj| obj.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

fn anthropic_image_block_to_openai(block: &Map<String, Value>) -> ConvertResult<Value> {
    let source = block
        .get("source")
        .and_then(Value::as_object)
        .ok_or_else(|| ConvertError::UnsupportedContentPart("image block missing source".into()))?;
    match source
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
    {
        "base64" => {
            let media_type = source
                .get("media_type")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            let data = source
                .get("data")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if media_type.is_empty() || data.is_empty() {
                return Err(ConvertError::UnsupportedContentPart(
                    "base64 image missing media_type/data".into(),
                ));
            }
            Ok(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{media_type};base64,{data}") },
            }))
        }
        "url" => {
            let url = source
                .get("url")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if url.is_empty() {
                return Err(ConvertError::UnsupportedContentPart(
                    "url image missing url".into(),
                ));
            }
            if !url.starts_with("data:image/") && !url.starts_with("https://") {
                return Err(ConvertError::UnsupportedContentPart(
                    "image url must be https:// or data:image/*".into(),
                ));
            }
            Ok(json!({ "type": "image_url", "image_url": { "url": url } }))
        }
        other => Err(ConvertError::UnsupportedContentPart(format!(
            "unsupported image source type {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// OpenAI chat request -> Anthropic request
// ---------------------------------------------------------------------------

pub fn openai_to_anthropic_messages(
    req: &ChatCompletionsRequest,
) -> ConvertResult<MessagesRequest> {
    let messages = req.messages.as_array().ok_or_else(|| {
        ConvertError::UnsupportedMessageShape("messages must be an array".into())
    })?;

    let mut system_parts = Vec::<String>::new();
    let mut out = Vec::<Message>::new();

    for raw in messages {
        let obj = raw.as_object().ok_or_else(|| {
            ConvertError::UnsupportedMessageShape("message not an object".into())
        })?;
        let role = obj
            .get("role")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if role.is_empty() {
            return Err(ConvertError::UnsupportedMessageShape("missing role".into()));
        }
        if role == "system" {
            system_parts.push(stringify_jsonish(obj.get("content").unwrap_or(&Value::Null)));
            continue;
        }

        match role {
            "user" | "assistant" => {
                let mut blocks =
                    openai_content_to_anthropic_blocks(obj.get("content").unwrap_or(&Value::Null))?;
                if role == "assistant" {
                    if let Some(reasoning) = obj
                        .get("reasoning_content")
                        .and_then(Value::as_str)
                        .filter(|r| !r.is_empty())
                    {
                        blocks.insert(0, json!({ "type": "thinking", "thinking": reasoning }));
                    }
                }
                blocks.extend(openai_tool_calls_to_anthropic_blocks(
                    obj.get("tool_calls").unwrap_or(&Value::Null),
                )?);
                out.push(Message {
                    role: role.to_string(),
                    content: Value::Array(blocks),
                });
            }
            "tool" => {
                let tool_call_id = obj
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or_default();
                if tool_call_id.is_empty() {
                    return Err(ConvertError::UnsupportedMessageShape(
                        "missing tool_call_id".into(),
                    ));
                }
                let content = stringify_jsonish(obj.get("content").unwrap_or(&Value::Null));
                out.push(Message {
                    role: "user".to_string(),
                    content: Value::Array(vec![json!({
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content,
                        "is_error": false,
                    })]),
                });
            }
            other => {
                return Err(ConvertError::UnsupportedMessageShape(format!(
                    "unsupported role {other:?}"
                )));
            }
        }
    }

    let max_tokens = req
        .max_tokens
        .filter(|v| *v > 0)
        .map(|v| v.min(i64::from(u32::MAX)) as u32)
        .unwrap_or(1024);

    let tools = match req.tools.as_ref() {
        Some(raw) => openai_tools_to_anthropic(raw)?,
        None => Vec::new(),
    };
    let tool_choice = match req.tool_choice.as_ref() {
        Some(raw) => Some(openai_tool_choice_to_anthropic(raw)?),
        None => None,
    };

    let system_text = system_parts.join("\n");
    let system = (!system_text.trim().is_empty()).then(|| Value::String(system_text));

    Ok(MessagesRequest {
        model: req.model.clone(),
        max_tokens,
        messages: out,
        system,
        metadata: None,
        stop_sequences: None,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        tools,
        tool_choice,
    })
}

fn openai_content_to_anthropic_blocks(content: &Value) -> ConvertResult<Vec<Value>> {
    match content {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => {
            if s.trim().is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![json!({ "type": "text", "text": s })])
            }
        }
        Value::Array(items) => {
            let mut blocks = Vec::<Value>::with_capacity(items.len());
            for item in items {
                let obj = item.as_object().ok_or_else(|| {
                    ConvertError::UnsupportedContentPart("content part not object".into())
                })?;
                match obj.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "text" => {
                        let text = obj.get("text").and_then(Value::as_str).unwrap_or_default();
                        if !text.is_empty() {
                            blocks.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    "image_url" => {
                        let url = obj
                            .get("image_url")
                            .and_then(Value::as_object)
                            .and_then(|img| img.get("url"))
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .unwrap_or_default();
                        if url.is_empty() {
                            return Err(ConvertError::UnsupportedContentPart(
                                "image_url missing url".into(),
                            ));
                        }
                        if let Some((media_type, data)) = parse_data_image_url(url) {
                            blocks.push(json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": media_type,
                                    "data": data,
                                },
                            }));
                        } else if url.starts_with("https://") {
                            blocks.push(json!({
                                "type": "image",
                                "source": { "type": "url", "url": url },
                            }));
                        } else {
                            return Err(ConvertError::UnsupportedContentPart(
                                "image_url must be data:image/*;base64 or https URL".into(),
                            ));
                        }
                    }
                    other => {
                        return Err(ConvertError::UnsupportedContentPart(format!(
                            "unsupported content part type {other:?}"
                        )));
                    }
                }
            }
            Ok(blocks)
        }
        other => Err(ConvertError::UnsupportedContentPart(format!(
            "unsupported OpenAI content type: {other}"
        ))),
    }
}

fn openai_tool_calls_to_anthropic_blocks(value: &Value) -> ConvertResult<Vec<Value>> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        _ => {
            return Err(ConvertError::UnsupportedMessageShape(
                "tool_calls is not array".into(),
            ));
        }
    };

    let mut out = Vec::<Value>::with_capacity(items.len());
    for item in items {
        let obj = item.as_object().ok_or_else(|| {
            ConvertError::UnsupportedMessageShape("tool_call is not object".into())
        })?;
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        let function = obj.get("function").and_then(Value::as_object);
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        let arguments = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if id.is_empty() || name.is_empty() {
            return Err(ConvertError::UnsupportedMessageShape(
                "tool_call missing id/name".into(),
            ));
        }
        if !kind.is_empty() && kind != "function" {
            return Err(ConvertError::UnsupportedMessageShape(format!(
                "unsupported tool_call type {kind:?}"
            )));
        }
        let input: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments)
                .map_err(|err| ConvertError::InvalidToolArguments(err.to_string()))?
        };
        out.push(json!({ "type": "tool_use", "id": id, "name": name, "input": input }));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tool definitions and tool_choice
// ---------------------------------------------------------------------------

fn anthropic_tools_to_openai(tools: &[ToolDefinition]) -> ConvertResult<Option<Value>> {
    if tools.is_empty() {
        return Ok(None);
    }
    let mut out = Vec::<Value>::with_capacity(tools.len());
    for tool in tools {
        if tool.name.trim().is_empty() {
            return Err(ConvertError::UnsupportedMessageShape(
                "anthropic tool missing name".into(),
            ));
        }
        let parameters = tool
            .input_schema
            .clone()
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
        let mut function = Map::<String, Value>::new();
        function.insert("name".into(), Value::String(tool.name.clone()));
        if let Some(description) = tool.description.as_ref() {
            function.insert("description".into(), Value::String(description.clone()));
        }
        function.insert("parameters".into(), parameters);
        out.push(json!({ "type": "function", "function": function }));
    }
    Ok(Some(Value::Array(out)))
}

fn openai_tools_to_anthropic(raw: &Value) -> ConvertResult<Vec<ToolDefinition>> {
    let items = match raw {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        _ => {
            return Err(ConvertError::UnsupportedMessageShape(
                "tools is not array".into(),
            ));
        }
    };
    let mut out = Vec::<ToolDefinition>::with_capacity(items.len());
    for item in items {
        let obj = item
            .as_object()
            .ok_or_else(|| ConvertError::UnsupportedMessageShape("tool is not object".into()))?;
        let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        if !kind.is_empty() && kind != "function" {
            return Err(ConvertError::UnsupportedContentPart(format!(
                "unsupported OpenAI tool type {kind:?}"
            )));
        }
        let function = obj.get("function").and_then(Value::as_object);
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if name.is_empty() {
            return Err(ConvertError::UnsupportedContentPart(
                "tool missing name".into(),
            ));
        }
        out.push(ToolDefinition {
            name: name.to_string(),
            description: function
                .and_then(|f| f.get("description"))
                .and_then(Value::as_str)
                .map(str::to_string),
            input_schema: function.and_then(|f| f.get("parameters")).cloned(),
        });
    }
    Ok(out)
}

fn anthropic_tool_choice_to_openai(raw: &Value) -> ConvertResult<Value> {
    let obj = raw.as_object().ok_or_else(|| {
        ConvertError::UnsupportedMessageShape("invalid anthropic tool_choice".into())
    })?;
    match obj.get("type").and_then(Value::as_str).unwrap_or_default() {
        "auto" => Ok(json!("auto")),
        "none" => Ok(json!("none")),
        "any" => Ok(json!("required")),
        "tool" => {
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if name.is_empty() {
                return Err(ConvertError::UnsupportedMessageShape(
                    "tool_choice.tool missing name".into(),
                ));
            }
            Ok(json!({ "type": "function", "function": { "name": name } }))
        }
        other => Err(ConvertError::UnsupportedMessageShape(format!(
            "unsupported anthropic tool_choice type {other:?}"
        ))),
    }
}

fn openai_tool_choice_to_anthropic(raw: &Value) -> ConvertResult<Value> {
    match raw {
        Value::String(s) => match s.as_str() {
            "auto" => Ok(json!({ "type": "auto" })),
            "none" => Ok(json!({ "type": "none" })),
            "required" => Ok(json!({ "type": "any" })),
            other => Err(ConvertError::UnsupportedMessageShape(format!(
                "unsupported tool_choice {other:?}"
            ))),
        },
        Value::Object(obj) => match obj.get("type").and_then(Value::as_str).unwrap_or_default() {
            "auto" => Ok(json!({ "type": "auto" })),
            "none" => Ok(json!({ "type": "none" })),
            "required" => Ok(json!({ "type": "any" })),
            "function" => {
                let name = obj
                    .get("function")
                    .and_then(Value::as_object)
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or_default();
                if name.is_empty() {
                    return Err(ConvertError::UnsupportedMessageShape(
                        "tool_choice.function missing name".into(),
                    ));
                }
                Ok(json!({ "type": "tool", "name": name }))
            }
            other => Err(ConvertError::UnsupportedMessageShape(format!(
                "unsupported tool_choice type {other:?}"
            ))),
        },
        _ => Err(ConvertError::UnsupportedMessageShape(
            "unsupported tool_choice shape".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Response conversion
// ---------------------------------------------------------------------------

pub fn anthropic_response_to_openai(resp: &MessagesResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::<ToolCall>::new();
    for block in &resp.content {
        match block.get("type").and_then(Value::as_str).unwrap_or_default() {
            "text" => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
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
                    continue;
                }
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                tool_calls.push(ToolCall {
                    id: id.to_string(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: name.to_string(),
                        arguments: serde_json::to_string(&input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        stop_reason_to_finish_reason(resp.stop_reason.as_deref())
    } else {
        "tool_calls"
    };

    ChatCompletionResponse {
        id: format!("chatcmpl_{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: unix_seconds(),
        model: resp.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: Value::String(text),
                reasoning_content: None,
                tool_calls,
            },
            finish_reason: Some(finish_reason.to_string()),
        }],
        usage: Some(ChatUsage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
    }
}

pub fn openai_response_to_anthropic(resp: &ChatCompletionResponse, model: &str) -> MessagesResponse {
    let mut text = String::new();
    let mut tool_blocks = Vec::<Value>::new();
    let mut finish = None;

    if let Some(choice) = resp.choices.first() {
        match &choice.message.content {
            Value::String(s) => text = s.clone(),
            Value::Null => {}
            other => text = other.to_string(),
        }
        for call in &choice.message.tool_calls {
            let input: Value = if call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.function.arguments).unwrap_or(json!({}))
            };
            tool_blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": input,
            }));
        }
        finish = choice.finish_reason.clone();
    }

    let mut content = Vec::<Value>::with_capacity(1 + tool_blocks.len());
    if !text.trim().is_empty() {
        content.push(json!({ "type": "text", "text": text }));
    }
    let has_tool_calls = !tool_blocks.is_empty();
    content.extend(tool_blocks);

    let usage = resp
        .usage
        .as_ref()
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    MessagesResponse {
        id: format!("msg_{}", Uuid::new_v4()),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content,
        stop_reason: Some(
            finish_reason_to_stop_reason(finish.as_deref(), has_tool_calls).to_string(),
        ),
        stop_sequence: None,
        usage,
    }
}

/// Anthropic message response rendered as an OpenAI Responses API payload:
/// function_call items first, then one assistant message item.
pub fn anthropic_response_to_responses(resp: &MessagesResponse, model: &str) -> ResponsesResponse {
    let mut text_parts = Vec::<String>::new();
    let mut calls = Vec::<ResponsesItem>::new();

    for block in &resp.content {
        match block.get("type").and_then(Value::as_str).unwrap_or_default() {
            "text" => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    if !t.is_empty() {
                        text_parts.push(t.to_string());
                    }
                }
            }
            "tool_use" => {
                let call_id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or_default();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or_default();
                if call_id.is_empty() || name.is_empty() {
                    continue;
                }
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                calls.push(ResponsesItem {
                    id: format!("fc_{}", Uuid::new_v4()),
                    kind: "function_call".to_string(),
                    status: String::new(),
                    role: String::new(),
                    content: Vec::new(),
                    call_id: call_id.to_string(),
                    name: name.to_string(),
                    arguments: serde_json::to_string(&input)
                        .unwrap_or_else(|_| "{}".to_string()),
                });
            }
            _ => {}
        }
    }

    let text = text_parts.concat();
    let mut output = calls;
    if !text.trim().is_empty() || output.is_empty() {
        output.push(ResponsesItem {
            id: format!("msg_{}", Uuid::new_v4()),
            kind: "message".to_string(),
            status: "completed".to_string(),
            role: "assistant".to_string(),
            content: vec![json!({
                "type": "output_text",
                "text": text,
                "annotations": [],
            })],
            call_id: String::new(),
            name: String::new(),
            arguments: String::new(),
        });
    }

    let usage = (resp.usage.input_tokens != 0 || resp.usage.output_tokens != 0).then(|| {
        ResponsesUsage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }
    });

    ResponsesResponse {
        id: format!("resp_{}", Uuid::new_v4()),
        object: "response".to_string(),
        created_at: unix_seconds(),
        model: model.to_string(),
        output,
        usage,
    }
}

// ---------------------------------------------------------------------------
// Responses API input -> chat messages
// ---------------------------------------------------------------------------

/// Flattens a Responses API `input` (string or item array) plus optional
/// `instructions` into Chat Completions messages.
pub fn responses_input_to_chat_messages(
    input: &Value,
    instructions: Option<&str>,
) -> ConvertResult<Vec<Value>> {
    let mut msgs = Vec::<Value>::new();
    if let Some(instructions) = instructions.map(str::trim).filter(|s| !s.is_empty()) {
        msgs.push(json!({ "role": "system", "content": instructions }));
    }

    match input {
        Value::Null => Err(ConvertError::UnsupportedMessageShape(
            "input is required".into(),
        )),
        Value::String(s) => {
            msgs.push(json!({ "role": "user", "content": s }));
            Ok(msgs)
        }
        Value::Array(items) => {
            for item in items {
                let obj = item.as_object().ok_or_else(|| {
                    ConvertError::UnsupportedMessageShape("input items must be objects".into())
                })?;
                match obj
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or_default()
                {
                    "" | "message" => msgs.push(responses_message_item_to_chat(obj)?),
                    "function_call" => {
                        let call_id = obj
                            .get("call_id")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .unwrap_or_default();
                        let name = obj
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .unwrap_or_default();
                        if call_id.is_empty() || name.is_empty() {
                            return Err(ConvertError::UnsupportedMessageShape(
                                "function_call requires call_id and name".into(),
                            ));
                        }
                        let arguments = obj
                            .get("arguments")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        msgs.push(json!({
                            "role": "assistant",
                            "content": "",
                            "tool_calls": [{
                                "id": call_id,
                                "type": "function",
                                "function": { "name": name, "arguments": arguments },
                            }],
                        }));
                    }
                    "function_call_output" => {
                        let call_id = obj
                            .get("call_id")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .unwrap_or_default();
                        if call_id.is_empty() {
                            return Err(ConvertError::UnsupportedMessageShape(
                                "function_call_output requires call_id".into(),
                            ));
                        }
                        let output = stringify_jsonish(obj.get("output").unwrap_or(&Value::Null));
                        msgs.push(json!({
                            "role": "tool",
                            "tool_call_id": call_id,
                            "content": output,
                        }));
                    }
                    other => {
                        return Err(ConvertError::UnsupportedMessageShape(format!(
                            "unsupported input item type {other:?}"
                        )));
                    }
                }
            }
            Ok(msgs)
        }
        _ => Err(ConvertError::UnsupportedMessageShape(
            "input must be string or array".into(),
        )),
    }
}

fn responses_message_item_to_chat(obj: &Map<String, Value>) -> ConvertResult<Value> {
    let mut role = obj
        .get("role")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if role == "developer" {
        role = "system";
    }
    if role.is_empty() {
        return Err(ConvertError::UnsupportedMessageShape(
            "message items must include role".into(),
        ));
    }

    let mut msg = Map::<String, Value>::new();
    msg.insert("role".into(), Value::String(role.to_string()));

    match obj.get("content").unwrap_or(&Value::Null) {
        Value::Null => {
            msg.insert("content".into(), Value::Null);
        }
        Value::String(s) => {
            msg.insert("content".into(), Value::String(s.clone()));
        }
        Value::Array(parts) => {
            let mut out_parts = Vec::<Value>::with_capacity(parts.len());
            for part in parts {
                let pm = part.as_object().ok_or_else(|| {
                    ConvertError::UnsupportedMessageShape("content parts must be objects".into())
                })?;
                match pm
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or_default()
                {
                    "input_text" | "output_text" | "text" => {
                        let text = pm.get("text").and_then(Value::as_str).unwrap_or_default();
                        out_parts.push(json!({ "type": "text", "text": text }));
                    }
                    "refusal" => {
                        let text = pm.get("refusal").and_then(Value::as_str).unwrap_or_default();
                        out_parts.push(json!({ "type": "text", "text": text }));
                    }
                    "input_image" => {
                        let url = pm
                            .get("image_url")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .unwrap_or_default();
                        validate_image_url(url, "input_image.image_url")?;
                        out_parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
                    }
                    "image_url" => {
                        let url = pm
                            .get("image_url")
                            .and_then(Value::as_object)
                            .and_then(|img| img.get("url"))
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .unwrap_or_default();
                        validate_image_url(url, "image_url.url")?;
                        out_parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
                    }
                    other => {
                        return Err(ConvertError::UnsupportedContentPart(format!(
                            "unsupported content part type {other:?}"
                        )));
                    }
                }
            }
            msg.insert("content".into(), Value::Array(out_parts));
        }
        _ => {
            return Err(ConvertError::UnsupportedMessageShape(
                "unsupported message content type".into(),
            ));
        }
    }

    if let Some(tool_call_id) = obj.get("tool_call_id") {
        msg.insert("tool_call_id".into(), tool_call_id.clone());
    }
    if let Some(tool_calls) = obj.get("tool_calls") {
        msg.insert("tool_calls".into(), tool_calls.clone());
    }
    Ok(Value::Object(msg))
}

fn validate_image_url(url: &str, field: &str) -> ConvertResult<()> {
    if url.is_empty() {
        return Err(ConvertError::UnsupportedMessageShape(format!(
            "{field} is required"
        )));
    }
    if !url.starts_with("https://") && !url.starts_with("data:image/") {
        return Err(ConvertError::UnsupportedContentPart(format!(
            "{field} must be https:// or data:image/*"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Gemini (non-streaming)
// ---------------------------------------------------------------------------

pub fn anthropic_to_gemini(req: &MessagesRequest) -> GenerateContentRequest {
    let system_text = match req.system.as_ref() {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    let contents = req
        .messages
        .iter()
        .map(|m| Content {
            role: if m.role == "assistant" { "model" } else { "user" }.to_string(),
            parts: vec![Part {
                text: anthropic_content_to_text(&m.content),
            }],
        })
        .collect();

    GenerateContentRequest {
        system_instruction: (!system_text.trim().is_empty()).then(|| Content {
            role: String::new(),
            parts: vec![Part { text: system_text }],
        }),
        contents,
        generation_config: Some(GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: Some(i64::from(req.max_tokens)),
        }),
    }
}

pub fn openai_to_gemini(req: &ChatCompletionsRequest) -> GenerateContentRequest {
    let mut system_text = String::new();
    let mut contents = Vec::<Content>::new();

    if let Some(messages) = req.messages.as_array() {
        for raw in messages {
            let Some(obj) = raw.as_object() else { continue };
            let role = obj.get("role").and_then(Value::as_str).unwrap_or_default();
            let text = stringify_jsonish(obj.get("content").unwrap_or(&Value::Null));
            if role == "system" {
                system_text.push_str(&text);
                continue;
            }
            contents.push(Content {
                role: if role == "assistant" { "model" } else { "user" }.to_string(),
                parts: vec![Part { text }],
            });
        }
    }

    GenerateContentRequest {
        system_instruction: (!system_text.trim().is_empty()).then(|| Content {
            role: String::new(),
            parts: vec![Part { text: system_text }],
        }),
        contents,
        generation_config: Some(GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: req.max_tokens,
        }),
    }
}

pub fn gemini_response_text(resp: &GenerateContentResponse) -> (String, Option<&UsageMetadata>) {
    let text = resp
        .candidates
        .first()
        .map(|c| {
            c.content
                .parts
                .iter()
                .map(|p| p.text.as_str())
                .collect::<String>()
        })
        .unwrap_or_default();
    (text, resp.usage_metadata.as_ref())
}

pub fn gemini_text_to_openai(
    text: String,
    model: &str,
    usage: Option<&UsageMetadata>,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: format!("chatcmpl_{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: unix_seconds(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: Value::String(text),
                reasoning_content: None,
                tool_calls: Vec::new(),
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: usage.map(|u| ChatUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }),
    }
}

pub fn gemini_text_to_anthropic(
    text: String,
    model: &str,
    usage: Option<&UsageMetadata>,
) -> MessagesResponse {
    MessagesResponse {
        id: format!("msg_{}", Uuid::new_v4()),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content: vec![json!({ "type": "text", "text": text })],
        stop_reason: Some("end_turn".to_string()),
        stop_sequence: None,
        usage: usage
            .map(|u| Usage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            })
            .unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn anthropic_content_to_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .filter(|obj| obj.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|obj| obj.get("text").and_then(Value::as_str))
            .collect(),
        other => other.to_string(),
    }
}

pub(crate) fn stringify_jsonish(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_data_image_url(url: &str) -> Option<(String, String)> {
    let url = url.trim();
    if !url.starts_with("data:image/") {
        return None;
    }
    let (meta, data) = url.split_once(',')?;
    if !meta.contains(";base64") {
        return None;
    }
    let media_type = meta
        .trim_start_matches("data:")
        .trim_end_matches(";base64")
        .trim();
    if media_type.is_empty() || data.is_empty() {
        return None;
    }
    Some((media_type.to_string(), data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anthropic_request(messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 64,
            messages,
            system: Some(Value::String("be terse".to_string())),
            metadata: None,
            stop_sequences: None,
            temperature: Some(0.5),
            top_p: None,
            stream: false,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    #[test]
    fn system_becomes_leading_system_message() {
        let req = anthropic_request(vec![Message {
            role: "user".to_string(),
            content: Value::String("hi".to_string()),
        }]);
        let out = anthropic_to_openai_chat(&req).unwrap();
        let msgs = out.messages.as_array().unwrap();
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[0]["content"], "be terse");
        assert_eq!(msgs[1]["role"], "user");
        assert_eq!(msgs[1]["content"], "hi");
    }

    #[test]
    fn tool_use_becomes_tool_call_with_json_arguments() {
        let req = anthropic_request(vec![Message {
            role: "assistant".to_string(),
            content: json!([
                { "type": "text", "text": "checking" },
                { "type": "tool_use", "id": "toolu_1", "name": "get_weather",
                  "input": { "location": "SF" } },
            ]),
        }]);
        let out = anthropic_to_openai_chat(&req).unwrap();
        let msgs = out.messages.as_array().unwrap();
        let calls = msgs[1]["tool_calls"].as_array().unwrap();
        assert_eq!(calls[0]["id"], "toolu_1");
        assert_eq!(calls[0]["function"]["name"], "get_weather");
        let args: Value =
            serde_json::from_str(calls[0]["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["location"], "SF");
    }

    #[test]
    fn tool_result_becomes_tool_role_message() {
        let req = anthropic_request(vec![Message {
            role: "user".to_string(),
            content: json!([
                { "type": "tool_result", "tool_use_id": "toolu_1",
                  "content": [ { "type": "text", "text": "72F" } ] },
            ]),
        }]);
        let out = anthropic_to_openai_chat(&req).unwrap();
        let msgs = out.messages.as_array().unwrap();
        let tool_msg = &msgs[2];
        assert_eq!(tool_msg["role"], "tool");
        assert_eq!(tool_msg["tool_call_id"], "toolu_1");
        assert_eq!(tool_msg["content"], "72F");
    }

    #[test]
    fn data_image_url_maps_to_base64_source() {
        let req = ChatCompletionsRequest {
            model: "m".to_string(),
            messages: json!([{
                "role": "user",
                "content": [
                    { "type": "image_url",
                      "image_url": { "url": "data:image/jpeg;base64,AA==" } },
                ],
            }]),
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: false,
            stream_options: None,
            tools: None,
            tool_choice: None,
        };
        let out = openai_to_anthropic_messages(&req).unwrap();
        let blocks = out.messages[0].content.as_array().unwrap();
        assert_eq!(blocks[0]["type"], "image");
        assert_eq!(blocks[0]["source"]["type"], "base64");
        assert_eq!(blocks[0]["source"]["media_type"], "image/jpeg");
        assert_eq!(blocks[0]["source"]["data"], "AA==");
    }

    #[test]
    fn https_image_survives_both_directions() {
        let req = anthropic_request(vec![Message {
            role: "user".to_string(),
            content: json!([
                { "type": "image",
                  "source": { "type": "url", "url": "https://example.com/a.png" } },
            ]),
        }]);
        let out = anthropic_to_openai_chat(&req).unwrap();
        let parts = out.messages.as_array().unwrap()[1]["content"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(parts[0]["type"], "image_url");
        assert_eq!(parts[0]["image_url"]["url"], "https://example.com/a.png");
    }

    #[test]
    fn file_scheme_image_is_rejected() {
        let req = ChatCompletionsRequest {
            model: "m".to_string(),
            messages: json!([{
                "role": "user",
                "content": [
                    { "type": "image_url", "image_url": { "url": "file:///etc/passwd" } },
                ],
            }]),
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: false,
            stream_options: None,
            tools: None,
            tool_choice: None,
        };
        assert!(matches!(
            openai_to_anthropic_messages(&req),
            Err(ConvertError::UnsupportedContentPart(_))
        ));
    }

    #[test]
    fn tool_choice_maps_both_ways() {
        assert_eq!(
            anthropic_tool_choice_to_openai(&json!({ "type": "any" })).unwrap(),
            json!("required")
        );
        assert_eq!(
            openai_tool_choice_to_anthropic(&json!("required")).unwrap(),
            json!({ "type": "any" })
        );
        assert_eq!(
            openai_tool_choice_to_anthropic(
                &json!({ "type": "function", "function": { "name": "f" } })
            )
            .unwrap(),
            json!({ "type": "tool", "name": "f" })
        );
        assert_eq!(
            anthropic_tool_choice_to_openai(&json!({ "type": "tool", "name": "f" })).unwrap(),
            json!({ "type": "function", "function": { "name": "f" } })
        );
    }

    #[test]
    fn schemaless_tool_gets_empty_object_parameters() {
        let tools = vec![ToolDefinition {
            name: "ping".to_string(),
            description: None,
            input_schema: None,
        }];
        let out = anthropic_tools_to_openai(&tools).unwrap().unwrap();
        assert_eq!(
            out[0]["function"]["parameters"],
            json!({ "type": "object", "properties": {} })
        );
    }

    #[test]
    fn response_conversion_maps_usage_and_finish() {
        let resp = MessagesResponse {
            id: "msg_1".to_string(),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            content: vec![json!({ "type": "text", "text": "hi" })],
            stop_reason: Some("end_turn".to_string()),
            stop_sequence: None,
            usage: Usage {
                input_tokens: 1,
                output_tokens: 1,
            },
        };
        let out = anthropic_response_to_openai(&resp);
        assert_eq!(out.choices[0].message.content, "hi");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
        let usage = out.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 1);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, 2);
    }

    #[test]
    fn tool_calls_force_tool_use_stop_reason() {
        let resp = ChatCompletionResponse {
            id: "c1".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: Value::Null,
                    reasoning_content: None,
                    tool_calls: vec![ToolCall {
                        id: "call_1".to_string(),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: "f".to_string(),
                            arguments: String::new(),
                        },
                    }],
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        };
        let out = openai_response_to_anthropic(&resp, "claude-sonnet-4-5");
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(out.content[0]["type"], "tool_use");
        assert_eq!(out.content[0]["input"], json!({}));
    }

    #[test]
    fn round_trip_preserves_structure() {
        let original = MessagesRequest {
            model: "sonnet".to_string(),
            max_tokens: 32,
            messages: vec![
                Message {
                    role: "user".to_string(),
                    content: Value::String("what is the weather".to_string()),
                },
                Message {
                    role: "assistant".to_string(),
                    content: json!([
                        { "type": "tool_use", "id": "toolu_9", "name": "get_weather",
                          "input": { "city": "Berlin" } },
                    ]),
                },
                Message {
                    role: "user".to_string(),
                    content: json!([
                        { "type": "tool_result", "tool_use_id": "toolu_9", "content": "12C" },
                    ]),
                },
            ],
            system: Some(Value::String("stay factual".to_string())),
            metadata: None,
            stop_sequences: None,
            temperature: None,
            top_p: None,
            stream: false,
            tools: vec![ToolDefinition {
                name: "get_weather".to_string(),
                description: Some("weather lookup".to_string()),
                input_schema: Some(json!({ "type": "object", "properties": {} })),
            }],
            tool_choice: None,
        };

        let openai = anthropic_to_openai_chat(&original).unwrap();
        let back = openai_to_anthropic_messages(&openai).unwrap();

        assert_eq!(back.system, Some(Value::String("stay factual".to_string())));
        assert_eq!(back.messages.len(), 3);
        assert_eq!(back.messages[0].role, "user");
        assert_eq!(back.messages[1].role, "assistant");
        let tool_use = &back.messages[1].content.as_array().unwrap()[0];
        assert_eq!(tool_use["id"], "toolu_9");
        assert_eq!(tool_use["name"], "get_weather");
        assert_eq!(tool_use["input"]["city"], "Berlin");
        let tool_result = &back.messages[2].content.as_array().unwrap()[0];
        assert_eq!(tool_result["type"], "tool_result");
        assert_eq!(tool_result["tool_use_id"], "toolu_9");
        assert_eq!(back.tools[0].name, "get_weather");
    }

    #[test]
    fn responses_input_flattens_function_call_items() {
        let input = json!([
            { "type": "message", "role": "user", "content": "hi" },
            { "type": "function_call", "call_id": "call_3", "name": "f",
              "arguments": "{\"a\":1}" },
            { "type": "function_call_output", "call_id": "call_3", "output": "done" },
        ]);
        let msgs = responses_input_to_chat_messages(&input, Some("sys")).unwrap();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[2]["tool_calls"][0]["id"], "call_3");
        assert_eq!(msgs[3]["role"], "tool");
        assert_eq!(msgs[3]["content"], "done");
    }

    #[test]
    fn gemini_conversion_carries_system_and_roles() {
        let req = anthropic_request(vec![
            Message {
                role: "user".to_string(),
                content: Value::String("hello".to_string()),
            },
            Message {
                role: "assistant".to_string(),
                content: Value::String("hi".to_string()),
            },
        ]);
        let out = anthropic_to_gemini(&req);
        assert_eq!(out.system_instruction.unwrap().parts[0].text, "be terse");
        assert_eq!(out.contents[0].role, "user");
        assert_eq!(out.contents[1].role, "model");
        assert_eq!(
            out.generation_config.unwrap().max_output_tokens,
            Some(64)
        );
    }
}
