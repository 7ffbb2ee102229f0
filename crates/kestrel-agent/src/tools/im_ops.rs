//! IM channel tools, bound to the task-local context of the current run.

use async_trait::async_trait;

use super::{Tool, ToolResult};
use crate::im_context;

pub struct SendToChatTool;

#[async_trait]
impl Tool for SendToChatTool {
    fn name(&self) -> &str {
        "send_to_chat"
    }

    fn description(&self) -> &str {
        "Send an intermediate message to the current chat (progress updates, \
         partial results). The final answer is delivered automatically."
    }

    fn category(&self) -> &str {
        "messaging"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Message text to send." }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(text) = input.get("text").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: text");
        };
        let Some(ctx) = im_context::current() else {
            return ToolResult::error("no chat bound to this run");
        };
        let (channel, chat_id) = {
            let session = ctx.session.lock().unwrap();
            (session.key.channel.clone(), session.key.chat_id.clone())
        };
        match ctx.sink.send_text(&channel, &chat_id, text).await {
            Ok(()) => ToolResult::success("message sent"),
            Err(e) => ToolResult::error(format!("send failed: {e}")),
        }
    }
}

pub struct GetChatHistoryTool;

#[async_trait]
impl Tool for GetChatHistoryTool {
    fn name(&self) -> &str {
        "get_chat_history"
    }

    fn description(&self) -> &str {
        "Read the recent turns of the current chat."
    }

    fn category(&self) -> &str {
        "messaging"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max turns (default 20)." }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let limit = input.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
        let Some(ctx) = im_context::current() else {
            return ToolResult::error("no chat bound to this run");
        };
        let session = ctx.session.lock().unwrap();
        let turns: Vec<String> = session
            .history
            .iter()
            .rev()
            .take(limit)
            .map(|t| {
                format!(
                    "[{} {}] {}",
                    t.role,
                    t.timestamp.format("%H:%M"),
                    t.content
                )
            })
            .collect();
        if turns.is_empty() {
            return ToolResult::success("(no history yet)");
        }
        let mut ordered = turns;
        ordered.reverse();
        ToolResult::success(ordered.join("\n"))
    }
}

/// Pull a pending media entry out of the session metadata.
fn take_pending(kind: &str, index: usize) -> ToolResult {
    let Some(ctx) = im_context::current() else {
        return ToolResult::error("no chat bound to this run");
    };
    let session = ctx.session.lock().unwrap();
    let Some(list) = session.get_meta(kind).and_then(|v| v.as_array()) else {
        return ToolResult::success(format!("no {kind} in this conversation"));
    };
    match list.get(index) {
        Some(entry) => ToolResult::success(entry.to_string()),
        None => ToolResult::error(format!(
            "index {index} out of range ({} {kind} available)",
            list.len()
        )),
    }
}

pub struct GetImageFileTool;

#[async_trait]
impl Tool for GetImageFileTool {
    fn name(&self) -> &str {
        "get_image_file"
    }

    fn description(&self) -> &str {
        "Get the local path and metadata of an image the user sent."
    }

    fn category(&self) -> &str {
        "messaging"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "index": { "type": "integer", "description": "0-based image index (default 0)." }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let index = input.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        take_pending("pending_images", index)
    }
}

pub struct GetVoiceFileTool;

#[async_trait]
impl Tool for GetVoiceFileTool {
    fn name(&self) -> &str {
        "get_voice_file"
    }

    fn description(&self) -> &str {
        "Get the local path and duration of a voice message the user sent."
    }

    fn category(&self) -> &str {
        "messaging"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "index": { "type": "integer", "description": "0-based voice index (default 0)." }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let index = input.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        take_pending("pending_voices", index)
    }
}
