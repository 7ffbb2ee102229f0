//! Identity file pack — SOUL.md, AGENT.md, USER.md, MEMORY.md.
//!
//! Each file may ship with a `*.example` companion; when the real file is
//! missing the example is copied into place so a fresh install starts with a
//! sane default personality instead of an empty prompt.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{KestrelError, Result};

/// The identity files loaded into every system prompt, in injection order.
pub const IDENTITY_FILES: &[&str] = &["SOUL.md", "AGENT.md", "USER.md", "MEMORY.md"];

/// A loaded snapshot of the identity directory.
#[derive(Debug, Clone, Default)]
pub struct IdentityPack {
    /// Core philosophy — who the agent is.
    pub soul: Option<String>,
    /// Behaviour rules — how the agent acts.
    pub agent: Option<String>,
    /// User profile, refreshed by memory consolidation.
    pub user: Option<String>,
    /// Memory digest, refreshed by memory consolidation.
    pub memory: Option<String>,
}

impl IdentityPack {
    /// Load all identity files from `dir`, materializing `*.example`
    /// companions for any that are missing.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let mut pack = IdentityPack::default();
        for name in IDENTITY_FILES {
            let content = load_or_materialize(dir, name)?;
            match *name {
                "SOUL.md" => pack.soul = content,
                "AGENT.md" => pack.agent = content,
                "USER.md" => pack.user = content,
                "MEMORY.md" => pack.memory = content,
                _ => unreachable!(),
            }
        }
        Ok(pack)
    }

    /// Concatenate present sections into one prompt block.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (title, body) in [
            ("Core identity", &self.soul),
            ("Behaviour rules", &self.agent),
            ("User profile", &self.user),
            ("Long-term memory digest", &self.memory),
        ] {
            if let Some(text) = body {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(&format!("## {title}\n\n{trimmed}"));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.soul.is_none() && self.agent.is_none() && self.user.is_none() && self.memory.is_none()
    }
}

/// Read `dir/name`; if absent but `dir/name.example` exists, copy it into
/// place first. Returns `None` when neither file exists.
fn load_or_materialize(dir: &Path, name: &str) -> Result<Option<String>> {
    let path = dir.join(name);
    if path.exists() {
        return read_file(&path).map(Some);
    }

    let example = dir.join(format!("{name}.example"));
    if example.exists() {
        fs::copy(&example, &path)?;
        info!(file = %name, "materialized identity file from example");
        return read_file(&path).map(Some);
    }

    Ok(None)
}

fn read_file(path: &PathBuf) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        warn!(path = %path.display(), error = %e, "failed to read identity file");
        KestrelError::Identity(format!("{}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dir_yields_empty_pack() {
        let dir = tempfile::tempdir().unwrap();
        let pack = IdentityPack::load(&dir.path().join("identity")).unwrap();
        assert!(pack.is_empty());
        assert_eq!(pack.render(), "");
    }

    #[test]
    fn example_is_materialized_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("SOUL.md.example"), "Be kind.").unwrap();

        let pack = IdentityPack::load(dir.path()).unwrap();
        assert_eq!(pack.soul.as_deref(), Some("Be kind."));
        // The real file now exists on disk.
        assert!(dir.path().join("SOUL.md").exists());
    }

    #[test]
    fn render_orders_sections() {
        let pack = IdentityPack {
            soul: Some("S".into()),
            agent: Some("A".into()),
            user: None,
            memory: Some("M".into()),
        };
        let out = pack.render();
        let soul_pos = out.find("Core identity").unwrap();
        let agent_pos = out.find("Behaviour rules").unwrap();
        let mem_pos = out.find("Long-term memory digest").unwrap();
        assert!(soul_pos < agent_pos && agent_pos < mem_pos);
        assert!(!out.contains("User profile"));
    }
}
