//! Context-window management.
//!
//! Token counts are estimated at ≈4 characters per token, with media blocks
//! charged a flat 1000. When the estimate exceeds the budget minus the
//! output reserve, everything but the most recent `MIN_RECENT_TURNS * 2`
//! messages is summarized into one synthetic exchange; if that still
//! overflows, the oldest preserved content is tail-truncated with a marker.

use kestrel_llm::{ContentBlock, LlmClient, LlmRequest, Message, MessageContent};
use tracing::{debug, warn};

/// Recent turns kept verbatim (×2 for the user/assistant pairing).
pub const MIN_RECENT_TURNS: usize = 4;
/// Flat token charge for an image/video/audio/document block.
const MEDIA_BLOCK_TOKENS: usize = 1000;
/// Proactive compression threshold as a fraction of the budget.
pub const PROACTIVE_RATIO: f64 = 0.7;

const TRUNCATION_MARKER: &str = "\n[truncated…]";

pub fn estimate_message_tokens(msg: &Message) -> usize {
    match &msg.content {
        MessageContent::Text(s) => s.len() / 4,
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.len() / 4,
                ContentBlock::Thinking { thinking } => thinking.len() / 4,
                ContentBlock::ToolUse { input, .. } => input.to_string().len() / 4,
                ContentBlock::ToolResult { content, .. } => content.len() / 4,
                ContentBlock::Image { .. }
                | ContentBlock::Video { .. }
                | ContentBlock::Audio { .. }
                | ContentBlock::Document { .. } => MEDIA_BLOCK_TOKENS,
            })
            .sum(),
    }
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Whether the history is past the proactive-compression mark.
pub fn needs_compression(messages: &[Message], budget: usize) -> bool {
    estimate_messages_tokens(messages) as f64 >= budget as f64 * PROACTIVE_RATIO
}

/// Compress `messages` to fit `budget - reserve` tokens.
///
/// The shape after compression: one synthetic summary exchange (user
/// "previous summary", assistant acknowledgement) followed by the preserved
/// recent messages. The summarizer runs in isolation against `summarizer`
/// when available; otherwise a plain-text digest of roles is used.
pub async fn compress_messages(
    summarizer: Option<&LlmClient>,
    messages: Vec<Message>,
    budget: usize,
    reserve: usize,
) -> Vec<Message> {
    let limit = budget.saturating_sub(reserve);
    if estimate_messages_tokens(&messages) <= limit {
        return messages;
    }

    let keep = MIN_RECENT_TURNS * 2;
    if messages.len() <= keep {
        return truncate_tail(messages, limit);
    }

    let split = messages.len() - keep;
    let (older, recent) = messages.split_at(split);

    let summary = summarize(summarizer, older).await;
    let mut out = Vec::with_capacity(keep + 2);
    out.push(Message::user(format!("previous summary: {summary}")));
    out.push(Message::assistant("ok, continue"));
    out.extend_from_slice(recent);

    debug!(
        dropped = split,
        kept = keep,
        tokens = estimate_messages_tokens(&out),
        "context compressed"
    );

    if estimate_messages_tokens(&out) > limit {
        return truncate_tail(out, limit);
    }
    out
}

async fn summarize(summarizer: Option<&LlmClient>, older: &[Message]) -> String {
    let transcript: String = older
        .iter()
        .map(|m| {
            let role = format!("{:?}", m.role).to_lowercase();
            let text = m.content.plain_text();
            let clipped: String = text.chars().take(600).collect();
            format!("{role}: {clipped}")
        })
        .collect::<Vec<_>>()
        .join("\n");

    if let Some(client) = summarizer {
        let req = LlmRequest {
            messages: vec![Message::user(format!(
                "Summarize this conversation so it can be continued later. Keep decisions, \
                 facts, open tasks and user preferences; drop chit-chat.\n\n{transcript}"
            ))],
            system: "You compress conversation history. Reply with the summary only.".into(),
            max_tokens: 1024,
            temperature: 1.0,
            ..Default::default()
        };
        match client.chat(&req).await {
            Ok(resp) => {
                let text = resp.text();
                if !text.trim().is_empty() {
                    return text.trim().to_string();
                }
            }
            Err(e) => warn!(error = %e, "summary model failed, using digest"),
        }
    }

    // Deterministic fallback: clipped transcript digest.
    let digest: String = transcript.chars().take(2000).collect();
    format!("(auto-digest of {} earlier messages) {digest}", older.len())
}

/// Trim content from the oldest preserved messages until the list fits,
/// marking each cut.
fn truncate_tail(mut messages: Vec<Message>, limit: usize) -> Vec<Message> {
    let mut i = 0;
    while i < messages.len() {
        let total = estimate_messages_tokens(&messages);
        if total <= limit {
            break;
        }
        let over = total - limit;
        let msg_tokens = estimate_message_tokens(&messages[i]);
        if msg_tokens > 0 {
            let target = msg_tokens.saturating_sub(over).max(50);
            if let MessageContent::Text(text) = &messages[i].content {
                let keep_chars = target * 4;
                if text.len() > keep_chars {
                    let mut cut = keep_chars;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    let truncated = format!("{}{TRUNCATION_MARKER}", &text[..cut]);
                    messages[i].content = MessageContent::Text(truncated);
                }
            }
        }
        i += 1;
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_message(role_user: bool, chars: usize) -> Message {
        let text = "x".repeat(chars);
        if role_user {
            Message::user(text)
        } else {
            Message::assistant(text)
        }
    }

    #[test]
    fn estimation_counts_media_flat() {
        let msg = Message::user_blocks(vec![
            ContentBlock::text("look"),
            ContentBlock::Image {
                media_type: "image/png".into(),
                data: "A".repeat(100_000),
            },
        ]);
        let tokens = estimate_message_tokens(&msg);
        assert!(tokens >= 1000 && tokens < 1100);
    }

    #[tokio::test]
    async fn compression_yields_summary_plus_recent() {
        // 60 messages × 2000 chars ≈ 30k tokens; budget forces compression.
        let messages: Vec<Message> = (0..60).map(|i| long_message(i % 2 == 0, 2000)).collect();
        let budget = 10_000;
        assert!(needs_compression(&messages, budget));

        let out = compress_messages(None, messages, budget, 1000).await;
        // 8 preserved + summary + acknowledgement.
        assert_eq!(out.len(), MIN_RECENT_TURNS * 2 + 2);
        assert!(out[0].content.plain_text().starts_with("previous summary:"));
        assert_eq!(out[1].content.plain_text(), "ok, continue");
        assert!(estimate_messages_tokens(&out) <= budget - 1000);
    }

    #[tokio::test]
    async fn under_budget_is_untouched() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let out = compress_messages(None, messages.clone(), 10_000, 1000).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content.plain_text(), "hi");
    }

    #[tokio::test]
    async fn truncation_marks_the_cut() {
        // Few messages but each enormous — summary path can't drop any, so
        // the oldest gets tail-truncated.
        let messages: Vec<Message> = (0..4).map(|i| long_message(i % 2 == 0, 40_000)).collect();
        let out = compress_messages(None, messages, 5_000, 500).await;
        assert!(out
            .iter()
            .any(|m| m.content.plain_text().contains("[truncated…]")));
        assert!(estimate_messages_tokens(&out) <= 5_000);
    }
}
