//! Endpoint capabilities and inference.
//!
//! Capabilities come from the endpoint config when declared. Legacy configs
//! carrying only the default `["text"]` fall back to model-name heuristics,
//! so a `qwen-vl-plus` endpoint still routes vision requests correctly.

use serde::{Deserialize, Serialize};

use crate::types::{ContentBlock, LlmRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Text,
    Vision,
    Video,
    Audio,
    Tools,
    Thinking,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Vision => "vision",
            Capability::Video => "video",
            Capability::Audio => "audio",
            Capability::Tools => "tools",
            Capability::Thinking => "thinking",
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(Capability::Text),
            "vision" => Ok(Capability::Vision),
            "video" => Ok(Capability::Video),
            "audio" => Ok(Capability::Audio),
            "tools" => Ok(Capability::Tools),
            "thinking" => Ok(Capability::Thinking),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities a request needs from its endpoint.
///
/// `tools` iff any tool is passed; `vision`/`video`/`audio` iff a content
/// block of that kind is present anywhere in the history; `thinking` iff the
/// caller enabled it.
pub fn required_capabilities(req: &LlmRequest) -> Vec<Capability> {
    let mut caps = vec![Capability::Text];

    if !req.tools.is_empty() {
        caps.push(Capability::Tools);
    }
    if req.enable_thinking {
        caps.push(Capability::Thinking);
    }

    let mut vision = false;
    let mut video = false;
    let mut audio = false;
    for msg in &req.messages {
        for block in msg.content.blocks() {
            match block {
                ContentBlock::Image { .. } => vision = true,
                ContentBlock::Video { .. } => video = true,
                ContentBlock::Audio { .. } => audio = true,
                _ => {}
            }
        }
    }
    if vision {
        caps.push(Capability::Vision);
    }
    if video {
        caps.push(Capability::Video);
    }
    if audio {
        caps.push(Capability::Audio);
    }

    caps
}

/// Infer capabilities from the model name. Conservative: video only for the
/// two families known to accept it.
pub fn infer_from_model(model: &str) -> Vec<Capability> {
    let m = model.to_lowercase();
    let mut caps = vec![Capability::Text];

    if ["vl", "vision", "visual", "image", "-v-", "4v"]
        .iter()
        .any(|kw| m.contains(kw))
    {
        caps.push(Capability::Vision);
    }
    if ["kimi", "gemini"].iter().any(|kw| m.contains(kw)) {
        caps.push(Capability::Vision);
        caps.push(Capability::Video);
    }
    if ["thinking", "r1", "qwq", "qvq", "o1"]
        .iter()
        .any(|kw| m.contains(kw))
    {
        caps.push(Capability::Thinking);
    }
    if [
        "qwen", "gpt", "claude", "deepseek", "kimi", "glm", "gemini", "moonshot", "minimax",
    ]
    .iter()
    .any(|kw| m.contains(kw))
    {
        caps.push(Capability::Tools);
    }

    caps.dedup();
    caps
}

/// Map a base URL to the provider slug used by the multimodal strategy table.
pub fn provider_slug_from_base_url(base_url: &str) -> Option<&'static str> {
    const URL_TO_PROVIDER: &[(&str, &str)] = &[
        ("api.openai.com", "openai"),
        ("api.anthropic.com", "anthropic"),
        ("dashscope.aliyuncs.com", "dashscope"),
        ("dashscope-intl.aliyuncs.com", "dashscope"),
        ("api.deepseek.com", "deepseek"),
        ("api.moonshot.cn", "moonshot"),
        ("api.minimax.chat", "minimax"),
        ("open.bigmodel.cn", "zhipu"),
        ("generativelanguage.googleapis.com", "google"),
        ("openrouter.ai", "openrouter"),
        ("api.siliconflow.cn", "siliconflow"),
        ("ark.cn-beijing.volces.com", "volcengine"),
    ];
    URL_TO_PROVIDER
        .iter()
        .find(|(domain, _)| base_url.contains(domain))
        .map(|(_, slug)| *slug)
}
