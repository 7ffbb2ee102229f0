//! Tool system for agent tool calling.
//!
//! Tools register once at startup under unique names; the registry converts
//! them to wire-level specs and renders the catalog the system prompt shows,
//! grouped by a static category table.

pub mod browser;
pub mod file_ops;
pub mod im_ops;
pub mod memory_ops;
pub mod profile;
pub mod schedule_ops;
pub mod shell;
pub mod skill_ops;
pub mod thinking;
pub mod web;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kestrel_llm::ToolSpec;

use crate::error::{AgentError, Result};

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait that all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. "read_file").
    fn name(&self) -> &str;
    /// Short description shown in the catalog.
    fn description(&self) -> &str;
    /// Long usage notes sent to the LLM; defaults to the description.
    fn detail(&self) -> Option<&str> {
        None
    }
    /// Catalog group — one of [`CATEGORY_ORDER`].
    fn category(&self) -> &str {
        "general"
    }
    /// JSON Schema for the input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute with the given input. Failures come back as error results,
    /// never as panics — the loop renders them as `is_error` tool_results.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// Catalog ordering; unknown categories sort last.
pub const CATEGORY_ORDER: &[&str] = &[
    "files",
    "shell",
    "web",
    "skills",
    "memory",
    "schedule",
    "messaging",
    "profile",
    "general",
];

/// Process-wide tool registry keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; duplicate names are a wiring bug and are rejected.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(AgentError::DuplicateTool(name));
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Wire-level specs for the LLM request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                detail: t.detail().map(String::from),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// The catalog block for the system prompt, grouped by category.
    pub fn catalog(&self) -> String {
        if self.tools.is_empty() {
            return String::new();
        }
        let mut grouped: HashMap<&str, Vec<&Arc<dyn Tool>>> = HashMap::new();
        for tool in &self.tools {
            grouped.entry(tool.category()).or_default().push(tool);
        }

        let mut out = String::from("## Available tools\n");
        let render = |out: &mut String, category: &str, tools: &[&Arc<dyn Tool>]| {
            out.push_str(&format!("\n### {category}\n"));
            for tool in tools {
                out.push_str(&format!("- `{}` — {}\n", tool.name(), tool.description()));
            }
        };

        for category in CATEGORY_ORDER {
            if let Some(tools) = grouped.remove(category) {
                render(&mut out, category, &tools);
            }
        }
        // Categories outside the static table land at the end, sorted.
        let mut extras: Vec<_> = grouped.into_iter().collect();
        extras.sort_by_key(|(name, _)| *name);
        for (category, tools) in extras {
            render(&mut out, category, &tools);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str, &'static str);

    #[async_trait]
    impl Tool for Dummy {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "a dummy"
        }
        fn category(&self) -> &str {
            self.1
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            ToolResult::success("ok")
        }
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy("read_file", "files"))).unwrap();
        assert!(matches!(
            reg.register(Arc::new(Dummy("read_file", "files"))),
            Err(AgentError::DuplicateTool(_))
        ));
    }

    #[test]
    fn catalog_groups_by_category_order() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy("memory_search", "memory"))).unwrap();
        reg.register(Arc::new(Dummy("read_file", "files"))).unwrap();
        let catalog = reg.catalog();
        let files_pos = catalog.find("### files").unwrap();
        let memory_pos = catalog.find("### memory").unwrap();
        assert!(files_pos < memory_pos);
        assert!(catalog.contains("`read_file`"));
    }

    #[test]
    fn specs_carry_detail() {
        struct Detailed;
        #[async_trait]
        impl Tool for Detailed {
            fn name(&self) -> &str {
                "verbose"
            }
            fn description(&self) -> &str {
                "short"
            }
            fn detail(&self) -> Option<&str> {
                Some("long usage notes")
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(&self, _input: serde_json::Value) -> ToolResult {
                ToolResult::success("ok")
            }
        }
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Detailed)).unwrap();
        let specs = reg.specs();
        assert_eq!(specs[0].wire_description(), "long usage notes");
    }
}
