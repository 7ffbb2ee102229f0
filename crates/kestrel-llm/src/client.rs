//! The endpoint pool.
//!
//! `chat` infers the request's required capabilities, filters and orders the
//! endpoints, runs the failover policy, and absorbs provider failures — only
//! `AllEndpointsFailed` and `UnsupportedMedia` cross this boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::capability::{required_capabilities, Capability};
use crate::config::{ClientSettings, EndpointConfig, EndpointsFile};
use crate::cooldown_state;
use crate::provider::{categorize, ErrorCategory, Provider, COOLDOWN_GLOBAL_FAILURE_SECS};
use crate::types::{LlmError, LlmRequest, LlmResponse, Result};

/// An unhealthy-but-capability-matched pool waits out a cooldown this short
/// instead of bypassing health — transient network blips clear in seconds.
const SHORT_COOLDOWN_WAIT_SECS: i64 = 15;
/// Upper bound on that wait.
const MAX_COOLDOWN_WAIT_SECS: u64 = 12;

/// A temporary pin to a single endpoint.
#[derive(Debug, Clone)]
struct ModelOverride {
    endpoint: String,
    expires_at: DateTime<Utc>,
    reason: String,
}

impl ModelOverride {
    fn expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Status row for model listings (`/model` without arguments, admin views).
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub model: String,
    pub provider: String,
    pub priority: i32,
    pub is_healthy: bool,
    pub is_current: bool,
    pub is_override: bool,
    pub capabilities: Vec<String>,
    pub note: Option<String>,
}

pub struct LlmClient {
    providers: Vec<Arc<Provider>>,
    settings: ClientSettings,
    /// Where extended cooldowns are persisted; `None` disables persistence.
    state_path: Option<PathBuf>,
    global_override: Mutex<Option<ModelOverride>>,
    conversation_overrides: DashMap<String, ModelOverride>,
    /// Last endpoint that succeeded for a conversation — preferred while the
    /// history carries tool context, since tool formats aren't portable.
    conversation_affinity: DashMap<String, String>,
}

impl LlmClient {
    /// Build the pool from a loaded `llm_endpoints.json`.
    pub fn new(file: EndpointsFile, state_path: Option<PathBuf>) -> Self {
        let providers = file
            .endpoints
            .into_iter()
            .map(|cfg| Arc::new(Provider::new(cfg)))
            .collect();
        Self::assemble(providers, file.settings, state_path)
    }

    /// Build from pre-constructed providers (tests inject transports here).
    pub fn from_providers(
        providers: Vec<Provider>,
        settings: ClientSettings,
        state_path: Option<PathBuf>,
    ) -> Self {
        Self::assemble(providers.into_iter().map(Arc::new).collect(), settings, state_path)
    }

    fn assemble(
        mut providers: Vec<Arc<Provider>>,
        settings: ClientSettings,
        state_path: Option<PathBuf>,
    ) -> Self {
        providers.sort_by_key(|p| p.config().priority);

        if let Some(path) = &state_path {
            let persisted = cooldown_state::load(path);
            for provider in &providers {
                if let Some(snap) = persisted.get(provider.name()) {
                    provider.restore_state(snap);
                    info!(
                        endpoint = provider.name(),
                        until = snap.cooldown_until,
                        "restored extended cooldown from disk"
                    );
                }
            }
        }

        Self {
            providers,
            settings,
            state_path,
            global_override: Mutex::new(None),
            conversation_overrides: DashMap::new(),
            conversation_affinity: DashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    fn provider_by_name(&self, name: &str) -> Option<&Arc<Provider>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    // ------------------------------------------------------------------
    // Overrides
    // ------------------------------------------------------------------

    /// Pin every request to `endpoint_name` for `hours`.
    ///
    /// Pinning to a cooling endpoint is refused with the remaining cooldown
    /// in the message — never a stack trace.
    pub fn switch_model(&self, endpoint_name: &str, hours: f64, reason: &str) -> Result<String> {
        let provider = self.provider_by_name(endpoint_name).ok_or_else(|| {
            LlmError::Configuration(format!("unknown endpoint: {endpoint_name}"))
        })?;
        if !provider.is_healthy() {
            return Err(LlmError::Configuration(format!(
                "endpoint {endpoint_name} is cooling down ({}s remaining)",
                provider.cooldown_remaining()
            )));
        }
        let expires_at = Utc::now() + chrono::Duration::seconds((hours * 3600.0) as i64);
        *self.global_override.lock().unwrap() = Some(ModelOverride {
            endpoint: endpoint_name.to_string(),
            expires_at,
            reason: reason.to_string(),
        });
        info!(endpoint = endpoint_name, hours, reason, "global model override set");
        Ok(format!(
            "switched to {endpoint_name} for {hours:.1}h ({})",
            provider.model()
        ))
    }

    /// Pin one conversation to `endpoint_name` for `hours` (the `/model`
    /// command path).
    pub fn set_conversation_override(
        &self,
        conversation_id: &str,
        endpoint_name: &str,
        hours: f64,
        reason: &str,
    ) -> Result<String> {
        let provider = self.provider_by_name(endpoint_name).ok_or_else(|| {
            LlmError::Configuration(format!("unknown endpoint: {endpoint_name}"))
        })?;
        if !provider.is_healthy() {
            return Err(LlmError::Configuration(format!(
                "endpoint {endpoint_name} is cooling down ({}s remaining)",
                provider.cooldown_remaining()
            )));
        }
        let expires_at = Utc::now() + chrono::Duration::seconds((hours * 3600.0) as i64);
        self.conversation_overrides.insert(
            conversation_id.to_string(),
            ModelOverride {
                endpoint: endpoint_name.to_string(),
                expires_at,
                reason: reason.to_string(),
            },
        );
        Ok(format!(
            "this conversation now uses {endpoint_name} ({}) for {hours:.1}h",
            provider.model()
        ))
    }

    /// Clear the global override.
    pub fn restore_default(&self) -> String {
        let prev = self.global_override.lock().unwrap().take();
        match prev {
            Some(o) => format!("override cleared (was {})", o.endpoint),
            None => "no override was active".to_string(),
        }
    }

    /// Clear a conversation's override.
    pub fn clear_conversation_override(&self, conversation_id: &str) -> String {
        match self.conversation_overrides.remove(conversation_id) {
            Some((_, o)) => format!("override cleared (was {})", o.endpoint),
            None => "no override was active".to_string(),
        }
    }

    /// The endpoint a pinned conversation (or the process) currently resolves
    /// to. Expired overrides are dropped here, lazily.
    fn resolve_override(&self, conversation_id: Option<&str>) -> Option<String> {
        if let Some(conv) = conversation_id {
            if let Some(entry) = self.conversation_overrides.get(conv) {
                if entry.expired() {
                    drop(entry);
                    self.conversation_overrides.remove(conv);
                } else {
                    return Some(entry.endpoint.clone());
                }
            }
        }
        let mut guard = self.global_override.lock().unwrap();
        if let Some(o) = guard.as_ref() {
            if o.expired() {
                *guard = None;
            } else {
                return Some(o.endpoint.clone());
            }
        }
        None
    }

    /// Human-readable override status, `None` when nothing is pinned.
    pub fn override_status(&self) -> Option<String> {
        let guard = self.global_override.lock().unwrap();
        guard.as_ref().filter(|o| !o.expired()).map(|o| {
            format!(
                "pinned to {} until {} ({})",
                o.endpoint,
                o.expires_at.format("%Y-%m-%d %H:%M UTC"),
                o.reason
            )
        })
    }

    /// The model that would serve the next request in this conversation:
    /// the active override, else the highest-priority healthy endpoint,
    /// else the primary.
    pub fn current_model(&self, conversation_id: Option<&str>) -> Option<ModelInfo> {
        let over = self.resolve_override(conversation_id);
        let provider = match &over {
            Some(name) => self.provider_by_name(name),
            None => self
                .providers
                .iter()
                .find(|p| p.is_healthy())
                .or_else(|| self.providers.first()),
        }?;
        Some(self.model_info(provider, over.as_deref()))
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        let over = self.resolve_override(None);
        let current = self.current_model(None).map(|m| m.name);
        self.providers
            .iter()
            .map(|p| {
                let mut info = self.model_info(p, over.as_deref());
                info.is_current = current.as_deref() == Some(p.name());
                info
            })
            .collect()
    }

    fn model_info(&self, provider: &Arc<Provider>, over: Option<&str>) -> ModelInfo {
        let cfg = provider.config();
        ModelInfo {
            name: cfg.name.clone(),
            model: cfg.model.clone(),
            provider: cfg.provider.clone(),
            priority: cfg.priority,
            is_healthy: provider.is_healthy(),
            is_current: false,
            is_override: over == Some(cfg.name.as_str()),
            capabilities: cfg.capabilities.clone().unwrap_or_default(),
            note: cfg.note.clone(),
        }
    }

    // ------------------------------------------------------------------
    // The chat entry point
    // ------------------------------------------------------------------

    pub async fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        if self.providers.is_empty() {
            return Err(LlmError::Configuration("no endpoints configured".into()));
        }

        let required = required_capabilities(req);
        let candidates = self.select_candidates(req, &required).await?;
        self.try_candidates(req, candidates).await
    }

    /// Capability filter + health filter + ordering, with the short-cooldown
    /// wait and the unhealthy/primary fallbacks.
    async fn select_candidates(
        &self,
        req: &LlmRequest,
        required: &[Capability],
    ) -> Result<Vec<Arc<Provider>>> {
        let matched: Vec<Arc<Provider>> = self
            .providers
            .iter()
            .filter(|p| required.iter().all(|c| p.config().has_capability(*c)))
            .cloned()
            .collect();

        if matched.is_empty() {
            if required.contains(&Capability::Video) {
                return Err(LlmError::UnsupportedMedia(
                    "no endpoint supports video input".into(),
                ));
            }
            warn!(
                required = ?required,
                "no endpoint matches required capabilities, falling through to primary"
            );
            return Ok(vec![self.providers[0].clone()]);
        }

        let mut eligible: Vec<Arc<Provider>> =
            matched.iter().filter(|p| p.is_healthy()).cloned().collect();

        if eligible.is_empty() {
            let min_cooldown = matched
                .iter()
                .map(|p| p.cooldown_remaining())
                .min()
                .unwrap_or(0);
            if min_cooldown > 0 && min_cooldown <= SHORT_COOLDOWN_WAIT_SECS {
                let wait = ((min_cooldown + 1) as u64).min(MAX_COOLDOWN_WAIT_SECS);
                info!(wait_secs = wait, "all matched endpoints cooling briefly, waiting once");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                eligible = matched.iter().filter(|p| p.is_healthy()).cloned().collect();
            }
        }

        let mut candidates = if eligible.is_empty() {
            // Video never degrades onto an incapable endpoint: with the only
            // capable deployments down, fail fast instead of overriding.
            if required.contains(&Capability::Video) {
                return Err(LlmError::UnsupportedMedia(
                    "no healthy endpoint supports video input".into(),
                ));
            }
            // Last line of defence: try them anyway, health notwithstanding.
            warn!("no healthy endpoint matches, overriding health state");
            matched
        } else {
            eligible
        };

        // Ordering: override pin first, then tool-context affinity, then the
        // priority order the list already carries.
        let pinned = self.resolve_override(req.conversation_id.as_deref());
        let affinity = if req.has_tool_context() {
            req.conversation_id
                .as_deref()
                .and_then(|c| self.conversation_affinity.get(c).map(|e| e.value().clone()))
        } else {
            None
        };
        candidates.sort_by_key(|p| {
            let name = p.name();
            (
                Some(name) != pinned.as_deref(),
                Some(name) != affinity.as_deref(),
                p.config().priority,
            )
        });

        Ok(candidates)
    }

    /// Run the failover policy over an ordered candidate list.
    async fn try_candidates(
        &self,
        req: &LlmRequest,
        mut candidates: Vec<Arc<Provider>>,
    ) -> Result<LlmResponse> {
        let tool_context = req.has_tool_context();

        // Tool-calling formats and thinking-chain metadata are not portable
        // across providers: with tool context we stay on one endpoint unless
        // failover is explicitly re-enabled, and then only within the same
        // protocol family.
        let attempts_per_endpoint: u32;
        if tool_context {
            if self.settings.allow_failover_with_tool_context {
                let family = candidates[0].config().api_type;
                candidates.retain(|p| p.config().api_type == family);
            } else {
                candidates.truncate(1);
            }
            attempts_per_endpoint = self.settings.retry_count + 1;
        } else if self.settings.retry_same_endpoint_first {
            attempts_per_endpoint = self.settings.retry_count + 1;
        } else {
            attempts_per_endpoint = 1;
        }

        let mut failures: Vec<(String, ErrorCategory, String)> = Vec::new();

        for provider in &candidates {
            let mut last: Option<(ErrorCategory, String)> = None;

            for attempt in 0..attempts_per_endpoint {
                provider.acquire_rate_limit().await;
                match provider.chat(req).await {
                    Ok(resp) => {
                        if provider.record_success() {
                            self.persist_cooldowns();
                        }
                        if let Some(conv) = &req.conversation_id {
                            self.conversation_affinity
                                .insert(conv.clone(), provider.name().to_string());
                        }
                        return Ok(resp);
                    }
                    Err(e) => {
                        let category = categorize(&e);
                        warn!(
                            endpoint = provider.name(),
                            attempt,
                            category = %category,
                            error = %e,
                            "endpoint attempt failed"
                        );
                        last = Some((category, e.to_string()));
                        if category == ErrorCategory::Structural {
                            break;
                        }
                        if attempt + 1 < attempts_per_endpoint {
                            tokio::time::sleep(Duration::from_secs(
                                self.settings.retry_delay_seconds,
                            ))
                            .await;
                        }
                    }
                }
            }

            // One cooldown episode per endpoint per chat call, regardless of
            // how many retries it absorbed.
            if let Some((category, message)) = last {
                if provider.mark_unhealthy(&message, Some(category)) {
                    self.persist_cooldowns();
                }
                failures.push((provider.name().to_string(), category, message));
            }

            if !self.settings.fallback_on_error {
                break;
            }
        }

        self.detect_global_failure(&failures);

        let structural = !failures.is_empty()
            && failures
                .iter()
                .all(|(_, c, _)| *c == ErrorCategory::Structural);
        let message = failures
            .iter()
            .map(|(name, cat, err)| format!("{name} [{cat}]: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(LlmError::AllEndpointsFailed {
            message: if message.is_empty() {
                "no endpoint attempted".into()
            } else {
                message
            },
            structural,
        })
    }

    /// ≥ 2 endpoints failing with a mostly-transient mix is a host-side
    /// network glitch, not endpoint trouble — shorten every affected
    /// cooldown so recovery is quick.
    fn detect_global_failure(&self, failures: &[(String, ErrorCategory, String)]) {
        if failures.len() < 2 {
            return;
        }
        let transient = failures
            .iter()
            .filter(|(_, c, _)| *c == ErrorCategory::Transient)
            .count();
        let ratio = transient as f64 / failures.len() as f64;
        if ratio >= self.settings.global_failure_transient_ratio {
            info!(
                failed = failures.len(),
                transient, "global failure detected, shortening cooldowns"
            );
            for (name, _, _) in failures {
                if let Some(p) = self.provider_by_name(name) {
                    p.shorten_cooldown(COOLDOWN_GLOBAL_FAILURE_SECS);
                }
            }
        }
    }

    /// Write the extended-cooldown snapshot of every provider that has one.
    fn persist_cooldowns(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let now = Utc::now().timestamp();
        let state: HashMap<String, _> = self
            .providers
            .iter()
            .map(|p| (p.name().to_string(), p.snapshot()))
            .filter(|(_, snap)| snap.is_extended && snap.cooldown_until > now)
            .collect();
        cooldown_state::save(path, &state);
    }

    /// Probe every endpoint; returns name → healthy.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let mut out = HashMap::new();
        for provider in &self.providers {
            let ok = provider.health_check(false).await.unwrap_or(false);
            out.insert(provider.name().to_string(), ok);
        }
        out
    }
}

/// Convenience constructor over the standard config layout.
pub fn build_client(
    config_dir: &std::path::Path,
) -> Result<(LlmClient, Option<LlmClient>, Vec<EndpointConfig>)> {
    let path = config_dir.join("llm_endpoints.json");
    let file = EndpointsFile::load(&path)?;
    let state_path = config_dir.join(cooldown_state::STATE_FILE_NAME);

    let compiler = (!file.compiler_endpoints.is_empty()).then(|| {
        LlmClient::new(
            EndpointsFile {
                endpoints: file.compiler_endpoints.clone(),
                settings: file.settings.clone(),
                ..Default::default()
            },
            None,
        )
    });
    let stt_endpoints = file.stt_endpoints.clone();
    let client = LlmClient::new(file, Some(state_path));
    Ok((client, compiler, stt_endpoints))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiType;
    use crate::provider::ChatTransport;
    use crate::types::{ContentBlock, Message, StopReason, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn endpoint(name: &str, priority: i32, caps: &[&str]) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            provider: "openai".into(),
            api_type: ApiType::OpenAi,
            base_url: "https://api.example.com/v1".into(),
            api_key_env: None,
            api_key: Some("sk-test".into()),
            model: format!("{name}-model"),
            priority,
            max_tokens: 0,
            context_window: 150_000,
            timeout: 180,
            capabilities: Some(caps.iter().map(|s| s.to_string()).collect()),
            extra_params: None,
            note: None,
            rpm_limit: 0,
            pricing_tiers: None,
        }
    }

    fn ok_response(model: &str) -> LlmResponse {
        LlmResponse {
            id: "r".into(),
            model: model.into(),
            content: vec![ContentBlock::text("ok")],
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
            reasoning_content: None,
        }
    }

    /// Scripted transport: counts calls, fails the first `fail_first` with
    /// the given error builder, succeeds afterwards.
    struct Scripted {
        calls: Arc<AtomicU32>,
        fail_first: u32,
        error: fn() -> LlmError,
    }

    #[async_trait]
    impl ChatTransport for Scripted {
        async fn send(&self, config: &EndpointConfig, _req: &LlmRequest) -> Result<LlmResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err((self.error)())
            } else {
                Ok(ok_response(&config.model))
            }
        }
    }

    fn scripted_provider(
        cfg: EndpointConfig,
        fail_first: u32,
        error: fn() -> LlmError,
    ) -> (Provider, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let p = Provider::with_transport(
            cfg,
            Box::new(Scripted {
                calls: calls.clone(),
                fail_first,
                error,
            }),
        );
        (p, calls)
    }

    fn transient() -> LlmError {
        LlmError::Transient("connection timed out".into())
    }

    fn settings() -> ClientSettings {
        ClientSettings {
            retry_delay_seconds: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plain_failover_tries_each_endpoint_once() {
        let (a, a_calls) = scripted_provider(endpoint("a", 1, &["text"]), u32::MAX, transient);
        let (b, b_calls) = scripted_provider(endpoint("b", 2, &["text"]), 0, transient);
        let client = LlmClient::from_providers(vec![a, b], settings(), None);

        let resp = client.chat(&LlmRequest::new(vec![Message::user("hi")])).await.unwrap();
        assert_eq!(resp.model, "b-model");
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_context_blocks_failover() {
        let (a, a_calls) = scripted_provider(
            endpoint("a", 1, &["text", "tools"]),
            u32::MAX,
            transient,
        );
        let (b, b_calls) = scripted_provider(endpoint("b", 2, &["text", "tools"]), 0, transient);
        let client = LlmClient::from_providers(vec![a, b], settings(), None);

        let req = LlmRequest::new(vec![Message::user_blocks(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            content: "out".into(),
            is_error: false,
        }])]);
        let err = client.chat(&req).await.unwrap_err();

        // retry_count (2) + 1 calls, all against A; B untouched.
        assert_eq!(a_calls.load(Ordering::SeqCst), 3);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        match err {
            LlmError::AllEndpointsFailed { structural, .. } => assert!(!structural),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn video_routes_past_higher_priority_endpoint() {
        let (a, a_calls) = scripted_provider(endpoint("a", 1, &["text", "tools"]), 0, transient);
        let (b, b_calls) = scripted_provider(
            endpoint("b", 2, &["text", "vision", "video", "tools"]),
            0,
            transient,
        );
        let client = LlmClient::from_providers(vec![a, b], settings(), None);

        let req = LlmRequest::new(vec![Message::user_blocks(vec![ContentBlock::Video {
            media_type: "video/mp4".into(),
            data: "AAAA".into(),
        }])]);
        let resp = client.chat(&req).await.unwrap();
        assert_eq!(resp.model, "b-model");
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn video_with_unhealthy_capable_endpoint_is_unsupported_media() {
        let (a, a_calls) = scripted_provider(endpoint("a", 1, &["text", "tools"]), 0, transient);
        let (b, _) = scripted_provider(
            endpoint("b", 2, &["text", "vision", "video", "tools"]),
            0,
            transient,
        );
        let client = LlmClient::from_providers(vec![a, b], settings(), None);
        // Auth cooldowns are too long for the short-wait path.
        client
            .provider_by_name("b")
            .unwrap()
            .mark_unhealthy("invalid key 401", Some(ErrorCategory::Auth));

        let req = LlmRequest::new(vec![Message::user_blocks(vec![ContentBlock::Video {
            media_type: "video/mp4".into(),
            data: "AAAA".into(),
        }])]);
        assert!(matches!(
            client.chat(&req).await,
            Err(LlmError::UnsupportedMedia(_))
        ));
        // The text-only endpoint was never asked to handle video.
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn video_with_no_capable_endpoint_is_unsupported_media() {
        let (a, _) = scripted_provider(endpoint("a", 1, &["text", "tools"]), 0, transient);
        let client = LlmClient::from_providers(vec![a], settings(), None);

        let req = LlmRequest::new(vec![Message::user_blocks(vec![ContentBlock::Video {
            media_type: "video/mp4".into(),
            data: "AAAA".into(),
        }])]);
        assert!(matches!(
            client.chat(&req).await,
            Err(LlmError::UnsupportedMedia(_))
        ));
    }

    #[tokio::test]
    async fn structural_failure_skips_retries() {
        let (a, a_calls) = scripted_provider(endpoint("a", 1, &["text", "tools"]), u32::MAX, || {
            LlmError::Structural("invalid_request".into())
        });
        let client = LlmClient::from_providers(vec![a], settings(), None);

        let req = LlmRequest::new(vec![Message::user_blocks(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            content: "out".into(),
            is_error: false,
        }])]);
        let err = client.chat(&req).await.unwrap_err();
        // Despite retry_count = 2, the structural error stops after one call.
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        match err {
            LlmError::AllEndpointsFailed { structural, .. } => assert!(structural),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn global_failure_shortens_cooldowns() {
        let (a, _) = scripted_provider(endpoint("a", 1, &["text"]), u32::MAX, transient);
        let (b, _) = scripted_provider(endpoint("b", 2, &["text"]), u32::MAX, transient);
        let client = LlmClient::from_providers(vec![a, b], settings(), None);

        let _ = client.chat(&LlmRequest::new(vec![Message::user("hi")])).await;
        for name in ["a", "b"] {
            let p = client.provider_by_name(name).unwrap();
            assert!(
                p.cooldown_remaining() <= COOLDOWN_GLOBAL_FAILURE_SECS,
                "{name} cooldown not shortened"
            );
        }
    }

    #[tokio::test]
    async fn conversation_override_wins_routing() {
        let (a, a_calls) = scripted_provider(endpoint("a", 1, &["text"]), 0, transient);
        let (b, b_calls) = scripted_provider(endpoint("b", 2, &["text"]), 0, transient);
        let client = LlmClient::from_providers(vec![a, b], settings(), None);

        client
            .set_conversation_override("chat-1", "b", 12.0, "user request")
            .unwrap();

        let mut req = LlmRequest::new(vec![Message::user("hi")]);
        req.conversation_id = Some("chat-1".into());
        let resp = client.chat(&req).await.unwrap();
        assert_eq!(resp.model, "b-model");
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);

        // Another conversation is unaffected.
        let resp = client.chat(&LlmRequest::new(vec![Message::user("hi")])).await.unwrap();
        assert_eq!(resp.model, "a-model");
    }

    #[tokio::test]
    async fn switch_to_cooling_endpoint_reports_remaining() {
        let (a, _) = scripted_provider(endpoint("a", 1, &["text"]), 0, transient);
        let client = LlmClient::from_providers(vec![a], settings(), None);
        client
            .provider_by_name("a")
            .unwrap()
            .mark_unhealthy("bad key 401 auth", None);

        let err = client.switch_model("a", 12.0, "test").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cooling down"), "got: {msg}");
        assert!(msg.contains("s remaining"), "got: {msg}");
    }

    #[tokio::test]
    async fn affinity_prefers_last_successful_endpoint_with_tool_context() {
        // b succeeds first (a fails), then with tool context present the
        // next call goes straight to b even though a recovered.
        let (a, a_calls) = scripted_provider(endpoint("a", 1, &["text", "tools"]), 1, transient);
        let (b, _) = scripted_provider(endpoint("b", 2, &["text", "tools"]), 0, transient);
        let client = LlmClient::from_providers(vec![a, b], settings(), None);

        let mut req = LlmRequest::new(vec![Message::user("hi")]);
        req.conversation_id = Some("conv".into());
        let resp = client.chat(&req).await.unwrap();
        assert_eq!(resp.model, "b-model");
        let a_calls_before = a_calls.load(Ordering::SeqCst);

        // Force a healthy again so priority alone would pick it.
        client.provider_by_name("a").unwrap().record_success();

        let mut req = LlmRequest::new(vec![
            Message::user("hi"),
            Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: "tu".into(),
                name: "t".into(),
                input: serde_json::json!({}),
            }]),
        ]);
        req.conversation_id = Some("conv".into());
        let resp = client.chat(&req).await.unwrap();
        assert_eq!(resp.model, "b-model");
        assert_eq!(a_calls.load(Ordering::SeqCst), a_calls_before);
    }
}
