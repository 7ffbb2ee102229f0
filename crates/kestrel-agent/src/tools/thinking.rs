//! Thinking-mode toggle, shared with the agent via an atomic flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Tool, ToolResult};

pub struct ThinkingModeTool {
    enabled: Arc<AtomicBool>,
}

impl ThinkingModeTool {
    pub fn new(enabled: Arc<AtomicBool>) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl Tool for ThinkingModeTool {
    fn name(&self) -> &str {
        "thinking_mode"
    }

    fn description(&self) -> &str {
        "Enable or disable extended thinking for subsequent turns."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "enabled": { "type": "boolean", "description": "Turn thinking on or off." }
            },
            "required": ["enabled"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(enabled) = input.get("enabled").and_then(|v| v.as_bool()) else {
            return ToolResult::error("missing required parameter: enabled");
        };
        self.enabled.store(enabled, Ordering::Relaxed);
        ToolResult::success(if enabled {
            "thinking mode enabled"
        } else {
            "thinking mode disabled"
        })
    }
}
