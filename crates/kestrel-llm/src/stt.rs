//! Speech-to-text client for voice transcription.
//!
//! A slim sibling of the chat pool: its own endpoint list, multipart upload,
//! and per-endpoint failover in priority order — no capability matching. On
//! total failure the caller keeps the raw `[voice: Ns]` marker in the
//! message so the agent can still respond meaningfully.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::types::{LlmError, Result};

pub struct SttClient {
    endpoints: Vec<EndpointConfig>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl SttClient {
    pub fn new(mut endpoints: Vec<EndpointConfig>) -> Self {
        endpoints.sort_by_key(|e| e.priority);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self { endpoints, client }
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// Transcribe an audio file, trying each endpoint in priority order.
    pub async fn transcribe(&self, path: &Path) -> Result<String> {
        if self.endpoints.is_empty() {
            return Err(LlmError::Configuration("no STT endpoints configured".into()));
        }

        let bytes = std::fs::read(path)
            .map_err(|e| LlmError::Configuration(format!("cannot read {}: {e}", path.display())))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("voice.ogg")
            .to_string();

        let mut errors = Vec::new();
        for ep in &self.endpoints {
            match self.transcribe_one(ep, bytes.clone(), &filename).await {
                Ok(text) => {
                    debug!(endpoint = %ep.name, chars = text.len(), "transcription ok");
                    return Ok(text);
                }
                Err(e) => {
                    warn!(endpoint = %ep.name, error = %e, "transcription failed, trying next");
                    errors.push(format!("{}: {e}", ep.name));
                }
            }
        }

        Err(LlmError::AllEndpointsFailed {
            message: errors.join("; "),
            structural: false,
        })
    }

    async fn transcribe_one(
        &self,
        ep: &EndpointConfig,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<String> {
        let api_key = ep
            .resolve_api_key()
            .ok_or_else(|| LlmError::Authentication(format!("no API key for {}", ep.name)))?;

        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", ep.model.clone());

        let url = format!(
            "{}/audio/transcriptions",
            ep.base_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let parsed: TranscriptionResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(parsed.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_client_reports_it() {
        let client = SttClient::new(Vec::new());
        assert!(!client.is_configured());
    }

    #[tokio::test]
    async fn missing_file_is_a_config_error() {
        let client = SttClient::new(vec![EndpointConfig {
            name: "whisper".into(),
            provider: "openai".into(),
            api_type: crate::config::ApiType::OpenAi,
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: None,
            api_key: Some("sk-test".into()),
            model: "whisper-1".into(),
            priority: 1,
            max_tokens: 0,
            context_window: 0,
            timeout: 60,
            capabilities: None,
            extra_params: None,
            note: None,
            rpm_limit: 0,
            pricing_tiers: None,
        }]);
        let err = client
            .transcribe(Path::new("/nonexistent/voice.ogg"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Configuration(_)));
    }
}
