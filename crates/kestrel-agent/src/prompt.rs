//! System-prompt assembly.
//!
//! Every turn rebuilds the prompt from the identity pack, the skill catalog
//! (rescanned so fresh installs appear immediately), the tool catalog, the
//! retrieved memory context, and session info. The IM variant omits the
//! active-task block so state never bleeds between concurrent sessions.

use chrono::Utc;

use kestrel_core::identity::IdentityPack;

/// Per-turn session facts surfaced to the model.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub session_key: String,
    pub channel: String,
    pub turn_count: u32,
}

pub struct PromptBuilder {
    identity: IdentityPack,
}

impl PromptBuilder {
    pub fn new(identity: IdentityPack) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &IdentityPack {
        &self.identity
    }

    pub fn set_identity(&mut self, identity: IdentityPack) {
        self.identity = identity;
    }

    /// Assemble the full system prompt.
    ///
    /// `active_task` is the current long-running task description; pass
    /// `None` for IM sessions (each chat is its own world) and for
    /// scheduler runs.
    pub fn build(
        &self,
        skill_catalog: &str,
        tool_catalog: &str,
        memory_context: &str,
        session: Option<&SessionInfo>,
        active_task: Option<&str>,
    ) -> String {
        let mut sections: Vec<String> = Vec::new();

        let identity = self.identity.render();
        if !identity.is_empty() {
            sections.push(identity);
        }

        if !skill_catalog.is_empty() {
            sections.push(skill_catalog.trim_end().to_string());
        }
        if !tool_catalog.is_empty() {
            sections.push(tool_catalog.trim_end().to_string());
        }
        if !memory_context.is_empty() {
            sections.push(memory_context.trim_end().to_string());
        }

        if let Some(task) = active_task {
            if !task.is_empty() {
                sections.push(format!("## Active task\n\n{task}"));
            }
        }

        let mut footer = format!(
            "## Session\n\nCurrent time: {}",
            Utc::now().format("%Y-%m-%d %H:%M UTC")
        );
        if let Some(info) = session {
            footer.push_str(&format!(
                "\nChannel: {}\nSession: {}\nTurns so far: {}",
                info.channel, info.session_key, info.turn_count
            ));
        }
        sections.push(footer);

        sections.join("\n\n")
    }
}
