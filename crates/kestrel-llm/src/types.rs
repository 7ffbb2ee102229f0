//! Normalized request/response types.
//!
//! The internal shape follows the Anthropic Messages API: a separate system
//! string, content-block lists, and JSON-object tool inputs. The
//! OpenAI-compatible provider converts both directions at the wire.

use serde::{Deserialize, Serialize};

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One content block inside a message.
///
/// Media payloads are base64 strings; `media_type` is the MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Preserved for interleaved-thinking models — must round-trip through
    /// the history so the chain of thought stays continuous across turns.
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        media_type: String,
        data: String,
    },
    Video {
        media_type: String,
        data: String,
    },
    Audio {
        media_type: String,
        data: String,
        format: String,
    },
    Document {
        media_type: String,
        data: String,
        #[serde(default)]
        filename: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Approximate base64 payload size in bytes, for data-URI caps.
    pub fn payload_bytes(&self) -> usize {
        match self {
            ContentBlock::Image { data, .. }
            | ContentBlock::Video { data, .. }
            | ContentBlock::Audio { data, .. }
            | ContentBlock::Document { data, .. } => data.len() * 3 / 4,
            _ => 0,
        }
    }
}

/// Message content: either a plain string or an ordered block list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    /// Concatenated text across string content and text blocks.
    pub fn plain_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Out-of-band reasoning returned by some OpenAI-compatible providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            reasoning_content: None,
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            reasoning_content: None,
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
            reasoning_content: None,
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
            reasoning_content: None,
        }
    }

    /// True if this message carries tool-calling context (`tool_use` or
    /// `tool_result` blocks). The pool routes conservatively when any
    /// message in the history does.
    pub fn has_tool_context(&self) -> bool {
        self.content.blocks().iter().any(|b| {
            matches!(
                b,
                ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. }
            )
        })
    }
}

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    /// Short description shown in the catalog.
    pub description: String,
    /// Long usage notes. When present this is what the LLM receives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub input_schema: serde_json::Value,
}

impl ToolSpec {
    /// The description actually sent to the provider.
    pub fn wire_description(&self) -> &str {
        self.detail.as_deref().unwrap_or(&self.description)
    }
}

/// Normalized request into the pool.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub system: String,
    pub tools: Vec<ToolSpec>,
    /// 0 = unlimited: the OpenAI provider omits the parameter, the Anthropic
    /// provider falls back to the endpoint's configured value.
    pub max_tokens: u32,
    pub temperature: f64,
    pub enable_thinking: bool,
    /// Conversation key for per-conversation overrides and endpoint affinity.
    pub conversation_id: Option<String>,
}

impl LlmRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            temperature: 1.0,
            ..Default::default()
        }
    }

    pub fn has_tool_context(&self) -> bool {
        self.messages.iter().any(Message::has_tool_context)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Normalized response out of the pool.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub reasoning_content: Option<String>,
}

impl LlmResponse {
    /// Concatenated plain text, excluding thinking blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

/// Errors crossing the pool boundary, plus the categories providers report.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// A required capability (especially video) has no endpoint at all.
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    /// Every eligible endpoint failed within one `chat` call.
    #[error("all endpoints failed: {message}")]
    AllEndpointsFailed { message: String, structural: bool },

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Malformed request body / bad message ordering — retrying is cost
    /// without benefit.
    #[error("structural error: {0}")]
    Structural(String),

    /// Timeout, connection reset, gateway 5xx.
    #[error("transient error: {0}")]
    Transient(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_blocks_round_trip_preserves_order() {
        let msg = Message::user_blocks(vec![
            ContentBlock::text("look at this"),
            ContentBlock::Image {
                media_type: "image/png".into(),
                data: "aWltZw==".into(),
            },
            ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "read_file".into(),
                input: serde_json::json!({"path": "/tmp/x"}),
            },
        ]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        let blocks = back.content.blocks();
        assert!(matches!(blocks[0], ContentBlock::Text { .. }));
        assert!(matches!(blocks[1], ContentBlock::Image { .. }));
        assert!(matches!(blocks[2], ContentBlock::ToolUse { .. }));
    }

    #[test]
    fn plain_string_content_round_trips_untagged() {
        let msg = Message::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], serde_json::json!("hello"));
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.content.plain_text(), "hello");
    }

    #[test]
    fn tool_context_detection() {
        let plain = LlmRequest::new(vec![Message::user("hi")]);
        assert!(!plain.has_tool_context());

        let with_result = LlmRequest::new(vec![Message::user_blocks(vec![
            ContentBlock::ToolResult {
                tool_use_id: "tu_1".into(),
                content: "ok".into(),
                is_error: false,
            },
        ])]);
        assert!(with_result.has_tool_context());
    }

    #[test]
    fn response_text_skips_thinking() {
        let resp = LlmResponse {
            id: "r1".into(),
            model: "m".into(),
            content: vec![
                ContentBlock::Thinking {
                    thinking: "hmm".into(),
                },
                ContentBlock::text("answer"),
            ],
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
            reasoning_content: None,
        };
        assert_eq!(resp.text(), "answer");
    }
}
