use serde::{Deserialize, Serialize};

/// An image received from a channel, already downloaded to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub local_path: String,
    pub media_type: String,
    #[serde(default)]
    pub description: String,
}

/// A voice message received from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceAttachment {
    pub local_path: String,
    pub duration_s: u32,
}

/// Any other file received from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub local_path: String,
    pub mime_type: String,
}

/// The normalized inbound shape every adapter produces.
///
/// `text` is the message text as the platform delivered it; for voice-only
/// messages adapters put a `[voice: Ns]` marker here, which the gateway
/// replaces with the transcription when STT succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
    #[serde(default)]
    pub voices: Vec<VoiceAttachment>,
    #[serde(default)]
    pub attachments: Vec<FileAttachment>,
    /// Original adapter payload, passed through untouched.
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

impl InboundMessage {
    pub fn text_only(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            text: text.into(),
            images: Vec::new(),
            voices: Vec::new(),
            attachments: Vec::new(),
            raw: None,
        }
    }
}
