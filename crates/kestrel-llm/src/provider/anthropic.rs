//! Anthropic-native protocol. The internal shape is already Anthropic-like,
//! so conversion is mostly mechanical.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::types::{
    ContentBlock, LlmError, LlmRequest, LlmResponse, MessageContent, Result, Role, StopReason,
    Usage,
};

const API_VERSION: &str = "2023-06-01";
/// Output-token fallback when neither the request nor the endpoint sets one.
const DEFAULT_MAX_TOKENS: u32 = 16_384;
/// Thinking budget when extended thinking is requested.
const THINKING_BUDGET_TOKENS: u32 = 10_000;

pub async fn chat(
    client: &reqwest::Client,
    config: &EndpointConfig,
    req: &LlmRequest,
) -> Result<LlmResponse> {
    let api_key = config
        .resolve_api_key()
        .ok_or_else(|| LlmError::Authentication(format!("no API key for {}", config.name)))?;

    let body = build_request_body(config, req);
    let url = format!("{}/v1/messages", config.base_url.trim_end_matches('/'));

    debug!(endpoint = %config.name, model = %config.model, "anthropic request");

    let resp = client
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", API_VERSION)
        .header("content-type", "application/json")
        .json(&body)
        .send()
        .await?;

    let status = resp.status().as_u16();
    if status == 429 {
        let retry = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("?")
            .to_string();
        return Err(LlmError::RateLimit(format!(
            "429 from {} (retry-after: {retry})",
            config.name
        )));
    }
    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(endpoint = %config.name, status, body = %text, "anthropic API error");
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }

    let api_resp: ApiResponse = resp
        .json()
        .await
        .map_err(|e| LlmError::Parse(e.to_string()))?;

    Ok(parse_response(api_resp))
}

fn build_request_body(config: &EndpointConfig, req: &LlmRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(message_to_wire)
        .collect();

    let max_tokens = if req.max_tokens > 0 {
        req.max_tokens
    } else if config.max_tokens > 0 {
        config.max_tokens
    } else {
        DEFAULT_MAX_TOKENS
    };

    let mut body = serde_json::json!({
        "model": config.model,
        "max_tokens": max_tokens,
        "messages": messages,
    });

    if !req.system.is_empty() {
        body["system"] = serde_json::json!(req.system);
    }

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.wire_description(),
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    if req.enable_thinking {
        body["thinking"] = serde_json::json!({
            "type": "enabled",
            "budget_tokens": THINKING_BUDGET_TOKENS,
        });
    } else if req.temperature != 1.0 {
        // The API rejects temperature together with an enabled thinking block.
        body["temperature"] = serde_json::json!(req.temperature);
    }

    // Free-form endpoint extras are merged last so deployments can pin
    // provider-specific parameters.
    if let Some(serde_json::Value::Object(extra)) = &config.extra_params {
        for (k, v) in extra {
            body[k] = v.clone();
        }
    }

    body
}

/// Lower one message to the wire. Plain strings stay strings; block lists
/// are serialized in order, preserving thinking blocks from prior turns.
fn message_to_wire(msg: &crate::types::Message) -> serde_json::Value {
    let role = match msg.role {
        Role::Assistant => "assistant",
        // Tool results ride on user messages in this protocol.
        _ => "user",
    };
    match &msg.content {
        MessageContent::Text(s) => serde_json::json!({ "role": role, "content": s }),
        MessageContent::Blocks(blocks) => {
            let parts: Vec<serde_json::Value> = blocks.iter().map(block_to_wire).collect();
            serde_json::json!({ "role": role, "content": parts })
        }
    }
}

fn block_to_wire(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({ "type": "text", "text": text }),
        ContentBlock::Thinking { thinking } => {
            serde_json::json!({ "type": "thinking", "thinking": thinking })
        }
        ContentBlock::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use", "id": id, "name": name, "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut v = serde_json::json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if *is_error {
                v["is_error"] = serde_json::json!(true);
            }
            v
        }
        ContentBlock::Image { media_type, data } => serde_json::json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
        ContentBlock::Document {
            media_type,
            data,
            filename,
        } => {
            let mut v = serde_json::json!({
                "type": "document",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            });
            if !filename.is_empty() {
                v["title"] = serde_json::json!(filename);
            }
            v
        }
        // Video and audio never reach this protocol — routing guarantees a
        // capable endpoint or the multimodal layer degrades them to text.
        ContentBlock::Video { .. } => serde_json::json!({
            "type": "text", "text": "[video: provider does not support, skipped]",
        }),
        ContentBlock::Audio { .. } => serde_json::json!({
            "type": "text", "text": "[audio: provider does not support, skipped]",
        }),
    }
}

fn parse_response(resp: ApiResponse) -> LlmResponse {
    let mut content = Vec::new();
    for block in resp.content {
        match block {
            WireBlock::Text { text } => content.push(ContentBlock::Text { text }),
            WireBlock::Thinking { thinking } => {
                content.push(ContentBlock::Thinking { thinking })
            }
            WireBlock::ToolUse { id, name, input } => {
                content.push(ContentBlock::ToolUse { id, name, input })
            }
            WireBlock::Unknown => {}
        }
    }

    let stop_reason = match resp.stop_reason.as_deref() {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    };

    LlmResponse {
        id: resp.id,
        model: resp.model,
        content,
        stop_reason,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_creation_input_tokens: resp.usage.cache_creation_input_tokens.unwrap_or(0),
            cache_read_input_tokens: resp.usage.cache_read_input_tokens.unwrap_or(0),
        },
        reasoning_content: None,
    }
}

// Wire response types (private — deserialization only).

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    model: String,
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: Option<u32>,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiType;
    use crate::types::Message;

    fn config() -> EndpointConfig {
        EndpointConfig {
            name: "claude".into(),
            provider: "anthropic".into(),
            api_type: ApiType::Anthropic,
            base_url: "https://api.anthropic.com".into(),
            api_key_env: None,
            api_key: Some("sk-ant".into()),
            model: "claude-sonnet-4-5".into(),
            priority: 1,
            max_tokens: 8192,
            context_window: 200_000,
            timeout: 180,
            capabilities: Some(vec!["text".into(), "vision".into(), "tools".into()]),
            extra_params: None,
            note: None,
            rpm_limit: 0,
            pricing_tiers: None,
        }
    }

    #[test]
    fn body_uses_endpoint_max_tokens_when_unset() {
        let req = LlmRequest::new(vec![Message::user("hi")]);
        let body = build_request_body(&config(), &req);
        assert_eq!(body["max_tokens"], 8192);
        assert_eq!(body["messages"][0]["content"], "hi");
        assert!(body.get("tools").is_none());
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn thinking_block_injected_when_enabled() {
        let mut req = LlmRequest::new(vec![Message::user("hard question")]);
        req.enable_thinking = true;
        let body = build_request_body(&config(), &req);
        assert_eq!(body["thinking"]["type"], "enabled");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn tool_result_rides_on_user_role() {
        let req = LlmRequest::new(vec![Message {
            role: Role::Tool,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "tu_1".into(),
                content: "42".into(),
                is_error: false,
            }]),
            reasoning_content: None,
        }]);
        let body = build_request_body(&config(), &req);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "tool_result");
    }

    #[test]
    fn parse_response_maps_blocks_and_stop_reason() {
        let raw = serde_json::json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "thinking", "thinking": "let me see"},
                {"type": "text", "text": "calling a tool"},
                {"type": "tool_use", "id": "tu_9", "name": "read_file", "input": {"path": "x"}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 20},
        });
        let resp = parse_response(serde_json::from_value(raw).unwrap());
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.content.len(), 3);
        assert!(matches!(resp.content[0], ContentBlock::Thinking { .. }));
        assert_eq!(resp.tool_calls().len(), 1);
        assert_eq!(resp.usage.total_tokens(), 30);
    }
}
