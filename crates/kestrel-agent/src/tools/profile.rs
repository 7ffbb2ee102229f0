//! User-profile tools: read and append to USER.md.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{Tool, ToolResult};

pub struct ProfileGetTool {
    identity_dir: PathBuf,
}

impl ProfileGetTool {
    pub fn new(identity_dir: PathBuf) -> Self {
        Self { identity_dir }
    }
}

#[async_trait]
impl Tool for ProfileGetTool {
    fn name(&self) -> &str {
        "profile_get"
    }

    fn description(&self) -> &str {
        "Read the current user profile (USER.md)."
    }

    fn category(&self) -> &str {
        "profile"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        match std::fs::read_to_string(self.identity_dir.join("USER.md")) {
            Ok(content) if content.trim().is_empty() => {
                ToolResult::success("(profile is empty)")
            }
            Ok(content) => ToolResult::success(content),
            Err(_) => ToolResult::success("(no profile yet)"),
        }
    }
}

pub struct ProfileUpdateTool {
    identity_dir: PathBuf,
}

impl ProfileUpdateTool {
    pub fn new(identity_dir: PathBuf) -> Self {
        Self { identity_dir }
    }
}

#[async_trait]
impl Tool for ProfileUpdateTool {
    fn name(&self) -> &str {
        "profile_update"
    }

    fn description(&self) -> &str {
        "Append a line to the user profile (USER.md). The nightly \
         consolidation reorganizes it."
    }

    fn category(&self) -> &str {
        "profile"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "line": { "type": "string", "description": "One profile fact to record." }
            },
            "required": ["line"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(line) = input.get("line").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: line");
        };
        if let Err(e) = std::fs::create_dir_all(&self.identity_dir) {
            return ToolResult::error(format!("cannot create identity dir: {e}"));
        }
        let path = self.identity_dir.join("USER.md");
        let mut content = std::fs::read_to_string(&path).unwrap_or_else(|_| "# USER\n".into());
        if !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!("- {line}\n"));
        match std::fs::write(&path, content) {
            Ok(()) => ToolResult::success("profile updated"),
            Err(e) => ToolResult::error(format!("profile write failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let update = ProfileUpdateTool::new(dir.path().to_path_buf())
            .execute(serde_json::json!({"line": "speaks German and English"}))
            .await;
        assert!(!update.is_error);

        let get = ProfileGetTool::new(dir.path().to_path_buf())
            .execute(serde_json::json!({}))
            .await;
        assert!(get.content.contains("speaks German"));
    }
}
