//! Endpoint configuration — `llm_endpoints.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capability::{infer_from_model, Capability};
use crate::types::{LlmError, Result};

/// API protocol family exposed by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Anthropic,
    OpenAi,
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiType::Anthropic => f.write_str("anthropic"),
            ApiType::OpenAi => f.write_str("openai"),
        }
    }
}

/// One pricing tier: prices are per million tokens; `max_input = -1` means
/// no upper bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTier {
    pub max_input: i64,
    pub input_price: f64,
    pub output_price: f64,
    #[serde(default)]
    pub cache_read_price: Option<f64>,
}

/// A single reachable LLM deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    /// Provider slug (anthropic, dashscope, moonshot, openrouter, …).
    pub provider: String,
    pub api_type: ApiType,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: String,
    /// Lower = preferred.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Max output tokens; 0 = unlimited (use the model default).
    #[serde(default)]
    pub max_tokens: u32,
    /// Total input+output token ceiling; fallback when the config omits it.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Requests per minute; 0 = no limit.
    #[serde(default)]
    pub rpm_limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_tiers: Option<Vec<PricingTier>>,
}

fn default_priority() -> i32 {
    1
}
fn default_context_window() -> usize {
    150_000
}
fn default_timeout() -> u64 {
    180
}

impl EndpointConfig {
    /// Resolve the API key: literal first, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
    }

    /// Declared capabilities win; configs still carrying only the default
    /// `["text"]` fall back to model-name inference.
    pub fn has_capability(&self, cap: Capability) -> bool {
        let declared: Vec<Capability> = self
            .capabilities
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        if declared.contains(&cap) {
            return true;
        }
        if cap == Capability::Text {
            return true;
        }

        // Thinking can also be signalled via extra_params.
        if cap == Capability::Thinking {
            if self.model.to_lowercase().contains("thinking") {
                return true;
            }
            if let Some(extra) = &self.extra_params {
                if extra.get("enable_thinking") == Some(&serde_json::Value::Bool(true)) {
                    return true;
                }
            }
        }

        let only_default = declared.is_empty() || declared == [Capability::Text];
        if only_default && !self.model.is_empty() {
            return infer_from_model(&self.model).contains(&cap);
        }

        false
    }

    /// Local deployments (Ollama, llama.cpp) time out under load as a matter
    /// of course; their transient errors never escalate cooldowns.
    pub fn is_local(&self) -> bool {
        self.base_url.contains("localhost")
            || self.base_url.contains("127.0.0.1")
            || self.base_url.contains("0.0.0.0")
    }

    /// Cost of one request in the configured currency, from the tiered
    /// pricing table. Tiers are matched by `input_tokens <= max_input`
    /// ascending; `max_input = -1` is the catch-all.
    pub fn calculate_cost(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
    ) -> f64 {
        let Some(tiers) = &self.pricing_tiers else {
            return 0.0;
        };
        if tiers.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<&PricingTier> = tiers.iter().collect();
        sorted.sort_by_key(|t| if t.max_input < 0 { i64::MAX } else { t.max_input });

        let matched = sorted
            .iter()
            .find(|t| t.max_input >= 0 && (input_tokens as i64) <= t.max_input)
            .copied()
            .unwrap_or(*sorted.last().unwrap());

        let cache_price = if cache_read_tokens > 0 {
            matched.cache_read_price.unwrap_or(matched.input_price * 0.1)
        } else {
            0.0
        };
        (input_tokens as f64 * matched.input_price
            + output_tokens as f64 * matched.output_price
            + cache_read_tokens as f64 * cache_price)
            / 1_000_000.0
    }
}

/// Failover behaviour knobs from the `settings` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default)]
    pub retry_same_endpoint_first: bool,
    /// Tool-calling formats are not portable across providers; failover with
    /// tool context is opt-in and restricted to the same protocol family.
    #[serde(default)]
    pub allow_failover_with_tool_context: bool,
    #[serde(default = "bool_true")]
    pub fallback_on_error: bool,
    /// Fraction of transient failures (≥ 2 endpoints failed) that flags a
    /// host-side network glitch and shortens all affected cooldowns.
    #[serde(default = "default_transient_ratio")]
    pub global_failure_transient_ratio: f64,
}

fn default_retry_count() -> u32 {
    2
}
fn default_retry_delay() -> u64 {
    2
}
fn bool_true() -> bool {
    true
}
fn default_transient_ratio() -> f64 {
    0.5
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay(),
            retry_same_endpoint_first: false,
            allow_failover_with_tool_context: false,
            fallback_on_error: true,
            global_failure_transient_ratio: default_transient_ratio(),
        }
    }
}

/// The full `llm_endpoints.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointsFile {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Optional lightweight endpoints for the prompt compiler / classifiers.
    #[serde(default)]
    pub compiler_endpoints: Vec<EndpointConfig>,
    /// Optional speech-to-text endpoints for voice transcription.
    #[serde(default)]
    pub stt_endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub settings: ClientSettings,
}

impl EndpointsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LlmError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut file: EndpointsFile = serde_json::from_str(&raw)
            .map_err(|e| LlmError::Configuration(format!("invalid {}: {e}", path.display())))?;
        file.endpoints.sort_by_key(|e| e.priority);
        file.compiler_endpoints.sort_by_key(|e| e.priority);
        file.stt_endpoints.sort_by_key(|e| e.priority);
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, priority: i32) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            provider: "dashscope".into(),
            api_type: ApiType::OpenAi,
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".into(),
            api_key_env: None,
            api_key: Some("sk-test".into()),
            model: "qwen-plus".into(),
            priority,
            max_tokens: 0,
            context_window: 150_000,
            timeout: 180,
            capabilities: Some(vec!["text".into(), "tools".into()]),
            extra_params: None,
            note: None,
            rpm_limit: 0,
            pricing_tiers: None,
        }
    }

    #[test]
    fn load_sorts_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm_endpoints.json");
        let file = EndpointsFile {
            endpoints: vec![endpoint("b", 5), endpoint("a", 1)],
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();
        let loaded = EndpointsFile::load(&path).unwrap();
        assert_eq!(loaded.endpoints[0].name, "a");
        assert_eq!(loaded.endpoints[1].name, "b");
        assert_eq!(loaded.settings.retry_count, 2);
        assert!(!loaded.settings.allow_failover_with_tool_context);
    }

    #[test]
    fn capability_inference_fallback() {
        let mut ep = endpoint("vl", 1);
        ep.capabilities = Some(vec!["text".into()]);
        ep.model = "qwen-vl-plus".into();
        assert!(ep.has_capability(Capability::Vision));

        // Explicit capability list (beyond the default) suppresses inference.
        ep.capabilities = Some(vec!["text".into(), "tools".into()]);
        ep.model = "qwen-vl-plus".into();
        assert!(!ep.has_capability(Capability::Video));
    }

    #[test]
    fn local_detection() {
        let mut ep = endpoint("local", 1);
        ep.base_url = "http://localhost:11434/v1".into();
        assert!(ep.is_local());
    }

    #[test]
    fn tiered_cost() {
        let mut ep = endpoint("priced", 1);
        ep.pricing_tiers = Some(vec![
            PricingTier {
                max_input: 128_000,
                input_price: 1.2,
                output_price: 7.2,
                cache_read_price: None,
            },
            PricingTier {
                max_input: -1,
                input_price: 2.4,
                output_price: 9.6,
                cache_read_price: None,
            },
        ]);
        // Falls in the first tier.
        let cost = ep.calculate_cost(100_000, 1_000, 0);
        assert!((cost - (100_000.0 * 1.2 + 1_000.0 * 7.2) / 1e6).abs() < 1e-9);
        // Over the first tier cap — catch-all pricing.
        let cost = ep.calculate_cost(200_000, 0, 0);
        assert!((cost - 200_000.0 * 2.4 / 1e6).abs() < 1e-9);
    }
}
