//! Provider-keyed lowering of rich content blocks.
//!
//! Video, audio, and document blocks only have wire encodings on a handful
//! of providers. Blocks a provider cannot carry are degraded to a text part
//! describing the missing content, so the model can at least acknowledge it.

use crate::types::ContentBlock;

/// Data-URI payload cap for providers that inline media (Kimi, DashScope).
pub const DATA_URI_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Lower a rich block into an OpenAI-style content part for `provider_slug`.
///
/// Text/thinking/tool blocks are not handled here — only media. Returns the
/// JSON content part to append to the message's content array.
pub fn lower_block(provider_slug: &str, block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Image { media_type, data } => serde_json::json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{media_type};base64,{data}") },
        }),
        ContentBlock::Video { media_type, data } => lower_video(provider_slug, media_type, data),
        ContentBlock::Audio {
            media_type,
            data,
            format,
        } => lower_audio(provider_slug, media_type, data, format),
        ContentBlock::Document {
            media_type,
            data,
            filename,
        } => lower_document(provider_slug, media_type, data, filename),
        _ => degraded("content"),
    }
}

fn lower_video(provider_slug: &str, media_type: &str, data: &str) -> serde_json::Value {
    let payload = data.len() * 3 / 4;
    match provider_slug {
        // Kimi extension: video_url with an inline data URI.
        "moonshot" if payload <= DATA_URI_MAX_BYTES => serde_json::json!({
            "type": "video_url",
            "video_url": { "url": format!("data:{media_type};base64,{data}") },
        }),
        // DashScope accepts the same shape with the same size ceiling.
        "dashscope" if payload <= DATA_URI_MAX_BYTES => serde_json::json!({
            "type": "video_url",
            "video_url": { "url": format!("data:{media_type};base64,{data}") },
        }),
        // Gemini's OpenAI-compat layer takes inline_data parts.
        "google" => serde_json::json!({
            "type": "video_url",
            "video_url": { "url": format!("data:{media_type};base64,{data}") },
        }),
        "moonshot" | "dashscope" => degraded("video too large"),
        _ => degraded("video"),
    }
}

fn lower_audio(provider_slug: &str, media_type: &str, data: &str, format: &str) -> serde_json::Value {
    match provider_slug {
        "openai" => serde_json::json!({
            "type": "input_audio",
            "input_audio": { "data": data, "format": format },
        }),
        "google" | "dashscope" => serde_json::json!({
            "type": "audio_url",
            "audio_url": { "url": format!("data:{media_type};base64,{data}") },
        }),
        _ => degraded("audio"),
    }
}

fn lower_document(
    provider_slug: &str,
    media_type: &str,
    data: &str,
    filename: &str,
) -> serde_json::Value {
    match provider_slug {
        // Gemini accepts PDFs inline; everyone else gets the marker.
        "google" => serde_json::json!({
            "type": "file",
            "file": {
                "filename": filename,
                "file_data": format!("data:{media_type};base64,{data}"),
            },
        }),
        _ => {
            let label = if filename.is_empty() {
                "document".to_string()
            } else {
                format!("document {filename}")
            };
            degraded(&label)
        }
    }
}

fn degraded(what: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "text",
        "text": format!("[{what}: provider does not support, skipped]"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_routes_by_provider() {
        let block = ContentBlock::Video {
            media_type: "video/mp4".into(),
            data: "AAAA".into(),
        };
        let kimi = lower_block("moonshot", &block);
        assert_eq!(kimi["type"], "video_url");

        let other = lower_block("deepseek", &block);
        assert_eq!(other["type"], "text");
        assert!(other["text"].as_str().unwrap().contains("skipped"));
    }

    #[test]
    fn oversized_video_degrades() {
        let big = "A".repeat((DATA_URI_MAX_BYTES + 1024) * 4 / 3);
        let block = ContentBlock::Video {
            media_type: "video/mp4".into(),
            data: big,
        };
        let out = lower_block("moonshot", &block);
        assert_eq!(out["type"], "text");
        assert!(out["text"].as_str().unwrap().contains("too large"));
    }

    #[test]
    fn audio_openai_shape() {
        let block = ContentBlock::Audio {
            media_type: "audio/wav".into(),
            data: "AAAA".into(),
            format: "wav".into(),
        };
        let out = lower_block("openai", &block);
        assert_eq!(out["type"], "input_audio");
        assert_eq!(out["input_audio"]["format"], "wav");
    }

    #[test]
    fn image_is_universal() {
        let block = ContentBlock::Image {
            media_type: "image/png".into(),
            data: "AAAA".into(),
        };
        let out = lower_block("anything", &block);
        assert_eq!(out["type"], "image_url");
    }
}
