//! OpenAI-compatible protocol.
//!
//! Converts the internal Anthropic-like shape both directions: `tool_use`
//! blocks become `tool_calls` entries, `tool_result` blocks become separate
//! `role = "tool"` messages, and thinking content moves through
//! `reasoning_content` so interleaved-thinking models keep their chain of
//! thought across turns.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::capability::provider_slug_from_base_url;
use crate::config::EndpointConfig;
use crate::multimodal;
use crate::parser;
use crate::types::{
    ContentBlock, LlmError, LlmRequest, LlmResponse, Message, MessageContent, Result, Role,
    StopReason, Usage,
};

/// Providers whose OpenAI-compatible layer takes `enable_thinking` in the body.
const THINKING_PARAM_PROVIDERS: &[&str] = &["dashscope", "siliconflow", "zhipu", "volcengine"];

pub async fn chat(
    client: &reqwest::Client,
    config: &EndpointConfig,
    req: &LlmRequest,
) -> Result<LlmResponse> {
    let api_key = config
        .resolve_api_key()
        .ok_or_else(|| LlmError::Authentication(format!("no API key for {}", config.name)))?;

    let body = build_request_body(config, req);
    let url = format!(
        "{}/chat/completions",
        config.base_url.trim_end_matches('/')
    );

    debug!(endpoint = %config.name, model = %config.model, "openai-compatible request");

    let resp = client
        .post(&url)
        .bearer_auth(api_key)
        .header("content-type", "application/json")
        .json(&body)
        .send()
        .await?;

    let status = resp.status().as_u16();
    if status == 429 {
        return Err(LlmError::RateLimit(format!("429 from {}", config.name)));
    }
    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(endpoint = %config.name, status, body = %text, "openai-compatible API error");
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }

    let api_resp: ApiResponse = resp
        .json()
        .await
        .map_err(|e| LlmError::Parse(e.to_string()))?;

    parse_response(config, api_resp)
}

fn build_request_body(config: &EndpointConfig, req: &LlmRequest) -> serde_json::Value {
    let slug = provider_slug_from_base_url(&config.base_url).unwrap_or(config.provider.as_str());

    let mut messages: Vec<serde_json::Value> = Vec::new();
    if !req.system.is_empty() {
        messages.push(serde_json::json!({ "role": "system", "content": req.system }));
    }
    for msg in &req.messages {
        convert_message(slug, msg, &mut messages);
    }

    let mut body = serde_json::json!({
        "model": config.model,
        "messages": messages,
    });

    // 0 = unlimited: the parameter is simply omitted.
    let max_tokens = if req.max_tokens > 0 {
        req.max_tokens
    } else {
        config.max_tokens
    };
    if max_tokens > 0 {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if req.temperature != 1.0 {
        body["temperature"] = serde_json::json!(req.temperature);
    }

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.wire_description(),
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    if req.enable_thinking && THINKING_PARAM_PROVIDERS.contains(&slug) {
        body["enable_thinking"] = serde_json::json!(true);
    }

    if let Some(serde_json::Value::Object(extra)) = &config.extra_params {
        for (k, v) in extra {
            body[k] = v.clone();
        }
    }

    body
}

/// Convert one internal message, appending one or more wire messages.
///
/// Tool results cannot ride inside a user message on this protocol — each
/// becomes its own `role = "tool"` message, preserving order.
fn convert_message(slug: &str, msg: &Message, out: &mut Vec<serde_json::Value>) {
    match msg.role {
        Role::System => {
            out.push(serde_json::json!({
                "role": "system",
                "content": msg.content.plain_text(),
            }));
        }
        Role::Assistant => out.push(convert_assistant(msg)),
        Role::User | Role::Tool => convert_user(slug, msg, out),
    }
}

fn convert_assistant(msg: &Message) -> serde_json::Value {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut thinking_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<serde_json::Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(s) => {
            text_parts.push(s);
        }
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text),
                    ContentBlock::Thinking { thinking } => thinking_parts.push(thinking.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            },
                        }));
                    }
                    _ => {}
                }
            }
        }
    }

    // `<thinking>` wrappers in plain text also migrate to reasoning_content —
    // required for thinking-chain continuity on providers that expect it.
    let joined = text_parts.join("");
    let (clean_text, wrapped) = parser::split_thinking(&joined);
    if let Some(w) = wrapped {
        thinking_parts.push(w);
    }
    if let Some(rc) = &msg.reasoning_content {
        thinking_parts.push(rc.clone());
    }

    let mut wire = serde_json::json!({ "role": "assistant" });
    wire["content"] = if clean_text.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::json!(clean_text)
    };
    if !tool_calls.is_empty() {
        wire["tool_calls"] = serde_json::Value::Array(tool_calls);
    }
    if !thinking_parts.is_empty() {
        wire["reasoning_content"] = serde_json::json!(thinking_parts.join("\n"));
    }
    wire
}

fn convert_user(slug: &str, msg: &Message, out: &mut Vec<serde_json::Value>) {
    match &msg.content {
        MessageContent::Text(s) => {
            out.push(serde_json::json!({ "role": "user", "content": s }));
        }
        MessageContent::Blocks(blocks) => {
            let mut parts: Vec<serde_json::Value> = Vec::new();
            let flush_parts = |parts: &mut Vec<serde_json::Value>,
                               out: &mut Vec<serde_json::Value>| {
                if parts.is_empty() {
                    return;
                }
                // A lone text part collapses to plain string content.
                let content = if parts.len() == 1 && parts[0]["type"] == "text" {
                    parts[0]["text"].clone()
                } else {
                    serde_json::Value::Array(std::mem::take(parts))
                };
                parts.clear();
                out.push(serde_json::json!({ "role": "user", "content": content }));
            };

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        parts.push(serde_json::json!({ "type": "text", "text": text }));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        flush_parts(&mut parts, out);
                        let content = if *is_error {
                            format!("[tool error] {content}")
                        } else {
                            content.clone()
                        };
                        out.push(serde_json::json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        }));
                    }
                    ContentBlock::Thinking { .. } => {}
                    media => parts.push(multimodal::lower_block(slug, media)),
                }
            }
            flush_parts(&mut parts, out);
        }
    }
}

fn parse_response(config: &EndpointConfig, resp: ApiResponse) -> Result<LlmResponse> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Parse("empty choices array".into()))?;

    let mut content: Vec<ContentBlock> = Vec::new();
    let mut reasoning = choice.message.reasoning_content.clone();

    let raw_text = choice.message.content.unwrap_or_default();
    // Some deployments emit tool calls inside the text body; extract and
    // strip them before anything else.
    let (text, mut synthetic_calls) = parser::extract_tool_calls(&raw_text);
    let (text, wrapped_thinking) = parser::split_thinking(&text);

    if let Some(w) = wrapped_thinking {
        reasoning = Some(match reasoning {
            Some(existing) => format!("{existing}\n{w}"),
            None => w,
        });
    }
    if let Some(r) = &reasoning {
        content.push(ContentBlock::Thinking {
            thinking: r.clone(),
        });
    }
    if !text.is_empty() {
        content.push(ContentBlock::Text { text });
    }

    for call in choice.message.tool_calls.unwrap_or_default() {
        let input: serde_json::Value = serde_json::from_str(&call.function.arguments)
            .unwrap_or_else(|_| serde_json::json!({ "raw": call.function.arguments }));
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }
    content.append(&mut synthetic_calls);

    let has_tool_calls = content
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    let stop_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ if has_tool_calls => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };

    let usage = resp.usage.unwrap_or_default();
    Ok(LlmResponse {
        id: resp.id.unwrap_or_default(),
        model: if resp.model.is_empty() {
            config.model.clone()
        } else {
            resp.model
        },
        content,
        stop_reason,
        usage: Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        },
        reasoning_content: reasoning,
    })
}

// Wire response types (private — deserialization only).

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
