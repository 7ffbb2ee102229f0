//! The prompt compiler — an optional first stage that turns a free-form
//! user message into a structured YAML task definition.
//!
//! Runs in isolation against the lightweight endpoint pool: it never sees
//! the main conversation history and cannot pollute it. On any failure the
//! original message is used unchanged.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use kestrel_llm::{LlmClient, LlmRequest, Message};

/// Messages shorter than this skip compilation outright.
const MIN_COMPILE_CHARS: usize = 60;

const COMPILER_SYSTEM: &str = "You turn a user request into a YAML task definition. Output ONLY \
YAML with these keys: task_type (question|action|creation|analysis), goal, given_inputs (list), \
missing_inputs (list), constraints (list), output_requirements (list), risks (list). \
Be concrete and brief; do not invent inputs the user did not give.";

fn trivial_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(hi|hello|hey|thanks|thank you|ok|okay|yes|no|good (morning|evening|night)|你好|谢谢|好的)[\s!.,?~]*$")
            .unwrap()
    })
}

/// The regex filter: trivially short messages and greetings are not worth a
/// model round-trip.
pub fn should_compile(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.len() < MIN_COMPILE_CHARS {
        return false;
    }
    !trivial_re().is_match(trimmed)
}

/// Compile `text` into a task definition and prepend it as context.
/// Returns the original text when compilation is skipped or fails.
pub async fn compile_prompt(client: &LlmClient, text: &str) -> String {
    if !should_compile(text) {
        return text.to_string();
    }

    let req = LlmRequest {
        messages: vec![Message::user(text.to_string())],
        system: COMPILER_SYSTEM.to_string(),
        max_tokens: 1024,
        temperature: 1.0,
        ..Default::default()
    };

    match client.chat(&req).await {
        Ok(resp) => {
            let yaml = strip_code_fence(&resp.text());
            if yaml.trim().is_empty() {
                return text.to_string();
            }
            debug!(chars = yaml.len(), "prompt compiled");
            format!("[Task definition]\n{yaml}\n\n[Original message]\n{text}")
        }
        Err(e) => {
            debug!(error = %e, "prompt compiler failed, passing message through");
            text.to_string()
        }
    }
}

fn strip_code_fence(s: &str) -> String {
    let trimmed = s.trim();
    let without_open = trimmed
        .strip_prefix("```yaml")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_greeting_messages_skip() {
        assert!(!should_compile("hi"));
        assert!(!should_compile("thanks!"));
        assert!(!should_compile("check the logs")); // too short
        assert!(should_compile(
            "Please analyse last week's deployment failures, figure out the common cause, \
             and draft a prevention checklist for the team"
        ));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(
            strip_code_fence("```yaml\ntask_type: action\n```"),
            "task_type: action"
        );
        assert_eq!(strip_code_fence("task_type: action"), "task_type: action");
    }
}
