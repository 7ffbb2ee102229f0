//! Skill tools: list installed skills and load one's instructions.
//!
//! The catalog in the system prompt only carries (name, description); the
//! model pulls a skill's full instruction body through `read_skill` when it
//! decides to use one. The directory is rescanned on every call, same as
//! the per-turn catalog rebuild, so fresh installs are immediately usable.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{Tool, ToolResult};
use crate::skills::SkillRegistry;

pub struct ListSkillsTool {
    skills_dir: PathBuf,
}

impl ListSkillsTool {
    pub fn new(skills_dir: PathBuf) -> Self {
        Self { skills_dir }
    }
}

#[async_trait]
impl Tool for ListSkillsTool {
    fn name(&self) -> &str {
        "list_skills"
    }

    fn description(&self) -> &str {
        "List installed skills with their descriptions."
    }

    fn category(&self) -> &str {
        "skills"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        let registry = SkillRegistry::load_dir(&self.skills_dir);
        if registry.is_empty() {
            return ToolResult::success("no skills installed");
        }
        let mut skills: Vec<_> = registry.iter().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        let lines: Vec<String> = skills
            .iter()
            .map(|s| {
                format!(
                    "- `{}`{} — {}",
                    s.name,
                    if s.system { " (system)" } else { "" },
                    s.description,
                )
            })
            .collect();
        ToolResult::success(format!(
            "{}\n\nUse read_skill(name) for a skill's full instructions.",
            lines.join("\n")
        ))
    }
}

pub struct ReadSkillTool {
    skills_dir: PathBuf,
}

impl ReadSkillTool {
    pub fn new(skills_dir: PathBuf) -> Self {
        Self { skills_dir }
    }
}

#[async_trait]
impl Tool for ReadSkillTool {
    fn name(&self) -> &str {
        "read_skill"
    }

    fn description(&self) -> &str {
        "Load a skill's full instructions by name (from list_skills)."
    }

    fn category(&self) -> &str {
        "skills"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Skill name to load." }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(name) = input.get("name").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: name");
        };
        let registry = SkillRegistry::load_dir(&self.skills_dir);
        let Some(skill) = registry.get(name) else {
            return ToolResult::error(format!(
                "no skill named '{name}' — use list_skills to see what is installed"
            ));
        };

        let mut out = format!("# Skill: {}\n\n{}\n\n{}", skill.name, skill.description, skill.body);
        if let Some(tool_name) = &skill.tool_name {
            out.push_str(&format!("\n\nBound tool: {tool_name}"));
        }
        // Bundled resources ride next to SKILL.md.
        for sub in ["scripts", "references", "assets"] {
            let dir = skill.dir.join(sub);
            if let Ok(entries) = std::fs::read_dir(&dir) {
                let names: Vec<String> = entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect();
                if !names.is_empty() {
                    out.push_str(&format!("\n\n{sub}/: {}", names.join(", ")));
                }
            }
        }
        ToolResult::success(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &std::path::Path, dir_name: &str, front: &str, body: &str) {
        let dir = root.join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), format!("---\n{front}\n---\n{body}")).unwrap();
    }

    #[tokio::test]
    async fn list_then_read_returns_the_body() {
        let root = tempfile::tempdir().unwrap();
        write_skill(
            root.path(),
            "weather",
            "name: weather\ndescription: Fetch and summarize the weather",
            "Use web_fetch against wttr.in and summarize the result in one line.",
        );
        std::fs::create_dir_all(root.path().join("weather/scripts")).unwrap();
        std::fs::write(root.path().join("weather/scripts/fetch.sh"), "#!/bin/sh\n").unwrap();

        let listed = ListSkillsTool::new(root.path().to_path_buf())
            .execute(serde_json::json!({}))
            .await;
        assert!(!listed.is_error);
        assert!(listed.content.contains("`weather`"));

        let read = ReadSkillTool::new(root.path().to_path_buf())
            .execute(serde_json::json!({"name": "weather"}))
            .await;
        assert!(!read.is_error);
        // The instruction body itself, not just the catalog line.
        assert!(read.content.contains("wttr.in and summarize the result"));
        assert!(read.content.contains("scripts/: fetch.sh"));
    }

    #[tokio::test]
    async fn unknown_skill_is_an_error_with_a_hint() {
        let root = tempfile::tempdir().unwrap();
        let read = ReadSkillTool::new(root.path().to_path_buf())
            .execute(serde_json::json!({"name": "nope"}))
            .await;
        assert!(read.is_error);
        assert!(read.content.contains("list_skills"));
    }

    #[tokio::test]
    async fn empty_dir_lists_nothing() {
        let root = tempfile::tempdir().unwrap();
        let listed = ListSkillsTool::new(root.path().to_path_buf())
            .execute(serde_json::json!({}))
            .await;
        assert!(!listed.is_error);
        assert_eq!(listed.content, "no skills installed");
    }
}
