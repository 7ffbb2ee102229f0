//! `execute_command` — one-shot shell command with a denylist and timeout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{Tool, ToolResult};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_OUTPUT_CHARS: usize = 30_000;

/// Commands that are never run, regardless of how politely the model asks.
const DENYLIST: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "mkfs",
    "dd if=",
    ":(){",
    "shutdown",
    "reboot",
    "> /dev/sda",
];

pub struct ExecuteCommandTool;

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command via `sh -c` and return stdout/stderr. \
         Destructive commands are blocked; default timeout is 30 seconds."
    }

    fn category(&self) -> &str {
        "shell"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command to run." },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (max 300, default 30)."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(command) = input.get("command").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: command");
        };
        if let Some(blocked) = DENYLIST.iter().find(|d| command.contains(**d)) {
            return ToolResult::error(format!("command blocked by safety policy: '{blocked}'"));
        }
        let timeout = input
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        let child = Command::new("sh").arg("-c").arg(command).output();
        let output = match tokio::time::timeout(Duration::from_secs(timeout), child).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return ToolResult::error(format!("failed to spawn command: {e}")),
            Err(_) => return ToolResult::error(format!("command timed out after {timeout}s")),
        };

        let mut text = String::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            text.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&stderr);
        }
        if !output.status.success() {
            text.push_str(&format!(
                "\n[exit code: {}]",
                output.status.code().unwrap_or(-1)
            ));
        }
        if text.is_empty() {
            text = "(no output)".to_string();
        }
        if text.len() > MAX_OUTPUT_CHARS {
            let mut cut = MAX_OUTPUT_CHARS;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text = format!("{}\n\n[output truncated]", &text[..cut]);
        }

        ToolResult::success(text)
    }
}
