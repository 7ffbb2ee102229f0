//! File tools: read_file, write_file, list_files, search_files.

use async_trait::async_trait;

use super::{Tool, ToolResult};

/// Cap on text returned to the LLM from any file tool.
const MAX_OUTPUT_CHARS: usize = 30_000;

fn truncate_output(result: String) -> String {
    if result.len() > MAX_OUTPUT_CHARS {
        let mut cut = MAX_OUTPUT_CHARS;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        format!(
            "{}\n\n[output truncated at {MAX_OUTPUT_CHARS} characters]",
            &result[..cut]
        )
    } else {
        result
    }
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Optionally limit to a line range with \
         `offset` (1-based first line) and `limit` (number of lines)."
    }

    fn category(&self) -> &str {
        "files"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file." },
                "offset": { "type": "integer", "description": "1-based first line (optional)." },
                "limit": { "type": "integer", "description": "Max lines to return (optional)." }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("failed to read '{path}': {e}")),
        };

        let offset = input
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|v| v.saturating_sub(1) as usize);
        let limit = input.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);

        let result = if offset.is_some() || limit.is_some() {
            let lines: Vec<&str> = content.lines().skip(offset.unwrap_or(0)).collect();
            let lines = match limit {
                Some(n) => &lines[..n.min(lines.len())],
                None => &lines[..],
            };
            lines.join("\n")
        } else {
            content
        };

        ToolResult::success(truncate_output(result))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed. \
         Overwrites unless `append` is true."
    }

    fn category(&self) -> &str {
        "files"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to write." },
                "content": { "type": "string", "description": "Content to write." },
                "append": { "type": "boolean", "description": "Append instead of overwrite." }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };
        let Some(content) = input.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: content");
        };
        let append = input.get("append").and_then(|v| v.as_bool()).unwrap_or(false);

        if let Some(dir) = std::path::Path::new(path).parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                return ToolResult::error(format!("cannot create directory for '{path}': {e}"));
            }
        }

        let result = if append {
            use std::io::Write;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| f.write_all(content.as_bytes()))
        } else {
            std::fs::write(path, content)
        };

        match result {
            Ok(()) => ToolResult::success(format!("wrote {} bytes to {path}", content.len())),
            Err(e) => ToolResult::error(format!("failed to write '{path}': {e}")),
        }
    }
}

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List the entries of a directory with sizes. Directories end with '/'."
    }

    fn category(&self) -> &str {
        "files"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default '.')." }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let path = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let entries = match std::fs::read_dir(path) {
            Ok(e) => e,
            Err(e) => return ToolResult::error(format!("failed to list '{path}': {e}")),
        };

        let mut lines: Vec<String> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata() {
                Ok(meta) if meta.is_dir() => lines.push(format!("{name}/")),
                Ok(meta) => lines.push(format!("{name} ({} bytes)", meta.len())),
                Err(_) => lines.push(name),
            }
        }
        lines.sort();

        if lines.is_empty() {
            ToolResult::success("(empty directory)")
        } else {
            ToolResult::success(truncate_output(lines.join("\n")))
        }
    }
}

pub struct SearchFilesTool;

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search files under a directory for a text pattern. Returns \
         `path:line: text` matches."
    }

    fn category(&self) -> &str {
        "files"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Substring to search for." },
                "path": { "type": "string", "description": "Directory root (default '.')." },
                "max_results": { "type": "integer", "description": "Result cap (default 50)." }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(pattern) = input.get("pattern").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: pattern");
        };
        let root = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let max = input
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(50) as usize;

        let mut matches = Vec::new();
        search_dir(std::path::Path::new(root), pattern, max, &mut matches, 0);

        if matches.is_empty() {
            ToolResult::success(format!("no matches for '{pattern}' under {root}"))
        } else {
            ToolResult::success(truncate_output(matches.join("\n")))
        }
    }
}

/// Depth-limited recursive grep; skips hidden dirs and obvious binaries.
fn search_dir(
    dir: &std::path::Path,
    pattern: &str,
    max: usize,
    matches: &mut Vec<String>,
    depth: usize,
) {
    if depth > 8 || matches.len() >= max {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        if matches.len() >= max {
            return;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "target" || name == "node_modules" {
            continue;
        }
        if path.is_dir() {
            search_dir(&path, pattern, max, matches, depth + 1);
        } else if let Ok(content) = std::fs::read_to_string(&path) {
            for (i, line) in content.lines().enumerate() {
                if line.contains(pattern) {
                    matches.push(format!("{}:{}: {}", path.display(), i + 1, line.trim()));
                    if matches.len() >= max {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");

        let write = WriteFileTool
            .execute(serde_json::json!({
                "path": path.to_str().unwrap(),
                "content": "line one\nline two\nline three",
            }))
            .await;
        assert!(!write.is_error);

        let read = ReadFileTool
            .execute(serde_json::json!({
                "path": path.to_str().unwrap(),
                "offset": 2,
                "limit": 1,
            }))
            .await;
        assert!(!read.is_error);
        assert_eq!(read.content, "line two");
    }

    #[tokio::test]
    async fn missing_parameters_are_errors_not_panics() {
        let result = ReadFileTool.execute(serde_json::json!({})).await;
        assert!(result.is_error);
        let result = WriteFileTool.execute(serde_json::json!({"path": "/tmp/x"})).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn search_finds_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "needle in here\nnothing").unwrap();
        std::fs::write(dir.path().join("b.txt"), "nothing else").unwrap();

        let result = SearchFilesTool
            .execute(serde_json::json!({
                "pattern": "needle",
                "path": dir.path().to_str().unwrap(),
            }))
            .await;
        assert!(!result.is_error);
        assert!(result.content.contains("a.txt:1"));
        assert!(!result.content.contains("b.txt"));
    }
}
