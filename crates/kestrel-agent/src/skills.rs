//! Skill loading and the catalog.
//!
//! A skill is a directory containing `SKILL.md`: YAML front matter (name,
//! description, optional tool_name/handler/system flags) followed by the
//! instruction body. `scripts/`, `references/`, and `assets/` subdirectories
//! ride along untouched. The registry is rescanned every turn so a freshly
//! installed skill shows up in the next system prompt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct SkillFrontMatter {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// When set, invoking this tool loads the skill body.
    pub tool_name: Option<String>,
    /// Named handler binding for system skills.
    pub handler: Option<String>,
    /// System skills ship with the binary; external ones come from installs.
    pub system: bool,
    /// The instruction body below the front matter.
    pub body: String,
    pub dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `dir` for skill directories. Unreadable or malformed skills are
    /// skipped with a warning — one broken install must not hide the rest.
    pub fn load_dir(dir: &Path) -> Self {
        let mut registry = Self::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            debug!(dir = %dir.display(), "skills directory missing, starting empty");
            return registry;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match parse_skill(&path) {
                Ok(skill) => {
                    debug!(skill = %skill.name, "skill loaded");
                    registry.skills.insert(skill.name.clone(), skill);
                }
                Err(e) => warn!(dir = %path.display(), error = %e, "skipping unreadable skill"),
            }
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Skill> {
        self.skills.values()
    }

    /// The (name, short description) catalog injected into the system
    /// prompt. Sorted for stable output.
    pub fn catalog(&self) -> String {
        if self.skills.is_empty() {
            return String::new();
        }
        let mut names: Vec<&String> = self.skills.keys().collect();
        names.sort();
        let mut out = String::from("## Installed skills\n");
        for name in names {
            let skill = &self.skills[name];
            out.push_str(&format!("- `{}` — {}\n", skill.name, skill.description));
        }
        out
    }
}

/// Parse one skill directory: front matter between `---` markers, body after.
fn parse_skill(dir: &Path) -> Result<Skill> {
    let md_path = dir.join("SKILL.md");
    let raw = std::fs::read_to_string(&md_path)
        .map_err(|e| AgentError::Skill(format!("{}: {e}", md_path.display())))?;

    let rest = raw
        .strip_prefix("---")
        .ok_or_else(|| AgentError::Skill(format!("{}: missing front matter", md_path.display())))?;
    let (front, body) = rest
        .split_once("\n---")
        .ok_or_else(|| AgentError::Skill(format!("{}: unterminated front matter", md_path.display())))?;

    let meta: SkillFrontMatter = serde_yaml::from_str(front)
        .map_err(|e| AgentError::Skill(format!("{}: {e}", md_path.display())))?;

    Ok(Skill {
        name: meta.name,
        description: meta.description,
        tool_name: meta.tool_name,
        handler: meta.handler,
        system: meta.system,
        body: body.trim_start_matches('-').trim().to_string(),
        dir: dir.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir_name: &str, front: &str, body: &str) {
        let dir = root.join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), format!("---\n{front}\n---\n{body}")).unwrap();
    }

    #[test]
    fn loads_skills_and_builds_catalog() {
        let root = tempfile::tempdir().unwrap();
        write_skill(
            root.path(),
            "weather",
            "name: weather\ndescription: Fetch and summarize the weather",
            "Use web_fetch against wttr.in and summarize.",
        );
        write_skill(
            root.path(),
            "standup",
            "name: standup\ndescription: Draft the daily standup message\nsystem: true",
            "Collect yesterday's work from the scratchpad.",
        );

        let registry = SkillRegistry::load_dir(root.path());
        assert_eq!(registry.len(), 2);
        assert!(registry.get("weather").is_some());
        assert!(registry.get("standup").unwrap().system);

        let catalog = registry.catalog();
        assert!(catalog.contains("`standup`"));
        assert!(catalog.contains("Fetch and summarize"));
        // Sorted: standup before weather.
        assert!(catalog.find("standup").unwrap() < catalog.find("weather").unwrap());
    }

    #[test]
    fn malformed_skill_is_skipped_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        write_skill(
            root.path(),
            "good",
            "name: good\ndescription: fine",
            "Body.",
        );
        let bad = root.path().join("bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("SKILL.md"), "no front matter at all").unwrap();

        let registry = SkillRegistry::load_dir(root.path());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_dir_is_empty_registry() {
        let registry = SkillRegistry::load_dir(Path::new("/nonexistent/skills"));
        assert!(registry.is_empty());
        assert_eq!(registry.catalog(), "");
    }
}
