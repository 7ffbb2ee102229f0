//! Memory tools: search, save, forget, scratchpad.

use std::sync::Arc;

use async_trait::async_trait;

use kestrel_memory::{MemoryManager, MemoryType};

use super::{Tool, ToolResult};

pub struct MemorySearchTool {
    memory: Arc<MemoryManager>,
}

impl MemorySearchTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory for facts, preferences, and past lessons."
    }

    fn category(&self) -> &str {
        "memory"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for." },
                "limit": { "type": "integer", "description": "Max results (default 10)." }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: query");
        };
        let limit = input.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;

        match self.memory.search(query, limit) {
            Ok(memories) if memories.is_empty() => {
                ToolResult::success("no matching memories found")
            }
            Ok(memories) => {
                let lines: Vec<String> = memories
                    .iter()
                    .map(|m| {
                        format!(
                            "- [{}] {} (id: {}, importance {:.1})",
                            m.memory_type, m.content, m.id, m.importance_score
                        )
                    })
                    .collect();
                ToolResult::success(lines.join("\n"))
            }
            Err(e) => ToolResult::error(format!("memory search failed: {e}")),
        }
    }
}

pub struct MemorySaveTool {
    memory: Arc<MemoryManager>,
}

impl MemorySaveTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySaveTool {
    fn name(&self) -> &str {
        "memory_save"
    }

    fn description(&self) -> &str {
        "Save a durable memory (fact, preference, rule, skill, error, context)."
    }

    fn category(&self) -> &str {
        "memory"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "One-sentence memory." },
                "type": {
                    "type": "string",
                    "enum": ["fact", "preference", "skill", "error", "rule", "context"],
                    "description": "Kind of knowledge."
                },
                "importance": { "type": "number", "description": "0.0-1.0 (default 0.6)." }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(content) = input.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: content");
        };
        let memory_type: MemoryType = input
            .get("type")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(MemoryType::Fact);
        let importance = input
            .get("importance")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.6);

        match self.memory.add_memory(content, memory_type, importance) {
            Ok(kestrel_memory::extractor::AddOutcome::Added(id)) => {
                ToolResult::success(format!("memory saved (id: {id})"))
            }
            Ok(kestrel_memory::extractor::AddOutcome::Duplicate(id)) => {
                ToolResult::success(format!("already known (id: {id})"))
            }
            Err(e) => ToolResult::error(format!("memory save failed: {e}")),
        }
    }
}

pub struct MemoryForgetTool {
    memory: Arc<MemoryManager>,
}

impl MemoryForgetTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryForgetTool {
    fn name(&self) -> &str {
        "memory_forget"
    }

    fn description(&self) -> &str {
        "Delete a memory by id (from memory_search results)."
    }

    fn category(&self) -> &str {
        "memory"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Memory id to delete." }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(id) = input.get("id").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: id");
        };
        match self.memory.forget(id) {
            Ok(true) => ToolResult::success(format!("memory {id} deleted")),
            Ok(false) => ToolResult::error(format!("no memory with id {id}")),
            Err(e) => ToolResult::error(format!("memory delete failed: {e}")),
        }
    }
}

pub struct ScratchpadTool {
    memory: Arc<MemoryManager>,
}

impl ScratchpadTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for ScratchpadTool {
    fn name(&self) -> &str {
        "scratchpad_update"
    }

    fn description(&self) -> &str {
        "Read or update the working scratchpad (active projects, current \
         focus, open questions, next steps)."
    }

    fn category(&self) -> &str {
        "memory"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "user_id": { "type": "string", "description": "Owner (default 'default')." },
                "content": { "type": "string" },
                "active_projects": { "type": "string" },
                "current_focus": { "type": "string" },
                "open_questions": { "type": "string" },
                "next_steps": { "type": "string" }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let user_id = input
            .get("user_id")
            .and_then(|v| v.as_str())
            .unwrap_or("default");
        let mut pad = match self.memory.scratchpad(user_id) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("scratchpad read failed: {e}")),
        };

        let mut changed = false;
        for (key, field) in [
            ("content", &mut pad.content),
            ("active_projects", &mut pad.active_projects),
            ("current_focus", &mut pad.current_focus),
            ("open_questions", &mut pad.open_questions),
            ("next_steps", &mut pad.next_steps),
        ] {
            if let Some(v) = input.get(key).and_then(|v| v.as_str()) {
                *field = v.to_string();
                changed = true;
            }
        }

        if changed {
            if let Err(e) = self.memory.update_scratchpad(&pad) {
                return ToolResult::error(format!("scratchpad write failed: {e}"));
            }
        }

        ToolResult::success(format!(
            "scratchpad for {user_id}:\nfocus: {}\nprojects: {}\nopen questions: {}\nnext steps: {}\nnotes: {}",
            pad.current_focus, pad.active_projects, pad.open_questions, pad.next_steps, pad.content
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_memory::MemoryStore;

    fn memory() -> Arc<MemoryManager> {
        Arc::new(MemoryManager::new(Arc::new(
            MemoryStore::open_in_memory().unwrap(),
        )))
    }

    #[tokio::test]
    async fn save_then_search() {
        let mem = memory();
        let save = MemorySaveTool::new(mem.clone())
            .execute(serde_json::json!({
                "content": "user prefers terse answers",
                "type": "preference",
                "importance": 0.8,
            }))
            .await;
        assert!(!save.is_error);

        let search = MemorySearchTool::new(mem)
            .execute(serde_json::json!({"query": "terse answers"}))
            .await;
        assert!(!search.is_error);
        assert!(search.content.contains("terse"));
    }

    #[tokio::test]
    async fn scratchpad_updates_fields() {
        let mem = memory();
        let result = ScratchpadTool::new(mem.clone())
            .execute(serde_json::json!({"current_focus": "memory subsystem"}))
            .await;
        assert!(!result.is_error);
        assert!(result.content.contains("memory subsystem"));
        // Persisted, not just echoed.
        assert_eq!(mem.scratchpad("default").unwrap().current_focus, "memory subsystem");
    }
}
