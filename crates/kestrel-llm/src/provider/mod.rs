//! Provider runtime — owns one endpoint's HTTP client, health state, and
//! rate limiter.
//!
//! Cooldown rules:
//! - auth 60 s, quota 20 s, structural 10 s, transient 5 s, default 30 s
//! - consecutive transient/unknown failures without an intervening success
//!   escalate through [5, 10, 20, 60] seconds
//! - structural errors never escalate (retrying changes nothing), and local
//!   endpoints' transient errors never escalate (a timeout there is resource
//!   pressure, not remote failure)
//! - the 60 s terminal step is the "extended" cooldown and is the only state
//!   persisted across restarts

pub mod anthropic;
pub mod openai;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ApiType, EndpointConfig};
use crate::limiter::RpmLimiter;
use crate::types::{LlmError, LlmRequest, LlmResponse, Result};

/// The wire layer under a [`Provider`]. Production uses one HTTP client per
/// endpoint; tests substitute scripted transports.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, config: &EndpointConfig, req: &LlmRequest) -> Result<LlmResponse>;
}

struct HttpTransport {
    client: reqwest::Client,
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, config: &EndpointConfig, req: &LlmRequest) -> Result<LlmResponse> {
        match config.api_type {
            ApiType::Anthropic => anthropic::chat(&self.client, config, req).await,
            ApiType::OpenAi => openai::chat(&self.client, config, req).await,
        }
    }
}

pub const COOLDOWN_AUTH_SECS: i64 = 60;
pub const COOLDOWN_QUOTA_SECS: i64 = 20;
pub const COOLDOWN_STRUCTURAL_SECS: i64 = 10;
pub const COOLDOWN_TRANSIENT_SECS: i64 = 5;
pub const COOLDOWN_DEFAULT_SECS: i64 = 30;
/// Applied to every affected endpoint when a host-side glitch is detected.
pub const COOLDOWN_GLOBAL_FAILURE_SECS: i64 = 3;
/// Progressive backoff ladder for consecutive non-structural failures.
pub const COOLDOWN_ESCALATION_STEPS: [i64; 4] = [5, 10, 20, 60];

/// Classification of a provider failure, driving the cooldown duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    Quota,
    Structural,
    Transient,
    #[default]
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::Quota => "quota",
            ErrorCategory::Structural => "structural",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Keyword classifier for raw error strings.
///
/// Priority: quota > auth > structural > transient. Quota must be checked
/// before auth because quota-exhausted responses are often 403s too.
pub fn classify_error(error: &str) -> ErrorCategory {
    let e = error.to_lowercase();

    const QUOTA: &[&str] = &[
        "allocationquota",
        "freetieronly",
        "insufficient_quota",
        "quota_exceeded",
        "billing",
        "free tier",
        "free_tier",
        "quota",
        "exceeded your current",
    ];
    if QUOTA.iter().any(|kw| e.contains(kw)) {
        return ErrorCategory::Quota;
    }

    const AUTH: &[&str] = &["auth", "401", "403", "api_key", "invalid key", "permission"];
    if AUTH.iter().any(|kw| e.contains(kw)) {
        return ErrorCategory::Auth;
    }

    const STRUCTURAL: &[&str] = &[
        "invalid_request",
        "invalid_parameter",
        "messages with role",
        "must be a response",
        "does not support",
        "not supported",
        "400",
    ];
    if STRUCTURAL.iter().any(|kw| e.contains(kw)) {
        return ErrorCategory::Structural;
    }

    const TRANSIENT: &[&str] = &[
        "timeout",
        "timed out",
        "connect",
        "connection",
        "network",
        "unreachable",
        "reset",
        "eof",
        "broken pipe",
        "502",
        "503",
        "504",
        "529",
    ];
    if TRANSIENT.iter().any(|kw| e.contains(kw)) {
        return ErrorCategory::Transient;
    }

    ErrorCategory::Unknown
}

/// Classify an `LlmError` coming out of a provider call.
pub fn categorize(err: &LlmError) -> ErrorCategory {
    match err {
        LlmError::Authentication(_) => ErrorCategory::Auth,
        LlmError::RateLimit(_) => ErrorCategory::Quota,
        LlmError::Structural(_) => ErrorCategory::Structural,
        LlmError::Transient(_) => ErrorCategory::Transient,
        LlmError::Http(e) if e.is_timeout() || e.is_connect() => ErrorCategory::Transient,
        LlmError::Api { status, message } => match status {
            429 => ErrorCategory::Quota,
            401 => ErrorCategory::Auth,
            // Quota-exhausted responses often ride on 403 — text decides.
            403 => match classify_error(message) {
                ErrorCategory::Quota => ErrorCategory::Quota,
                _ => ErrorCategory::Auth,
            },
            400 | 422 => ErrorCategory::Structural,
            500..=599 => ErrorCategory::Transient,
            _ => classify_error(message),
        },
        other => classify_error(&other.to_string()),
    }
}

#[derive(Debug, Clone, Default)]
struct HealthState {
    unhealthy: bool,
    last_error: Option<String>,
    category: Option<ErrorCategory>,
    /// Epoch seconds; 0 = no cooldown.
    cooldown_until: i64,
    consecutive_cooldowns: u32,
    /// True while the terminal (60 s) escalation step is in effect.
    is_extended: bool,
}

/// Snapshot of one endpoint's health, for status listings and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub cooldown_until: i64,
    pub consecutive_cooldowns: u32,
    pub is_extended: bool,
    pub error_category: String,
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// One endpoint's runtime: config + long-lived wire transport + health state.
pub struct Provider {
    config: EndpointConfig,
    transport: Box<dyn ChatTransport>,
    state: Mutex<HealthState>,
    limiter: Option<RpmLimiter>,
}

impl Provider {
    pub fn new(config: EndpointConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .unwrap_or_default();
        Self::with_transport(config, Box::new(HttpTransport { client }))
    }

    /// Construct with a custom wire layer (tests, recording proxies).
    pub fn with_transport(config: EndpointConfig, transport: Box<dyn ChatTransport>) -> Self {
        let limiter = (config.rpm_limit > 0).then(|| RpmLimiter::new(config.rpm_limit));
        Self {
            config,
            transport,
            state: Mutex::new(HealthState::default()),
            limiter,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Healthy means: not marked unhealthy, or the cooldown has elapsed.
    ///
    /// Expiry of the terminal escalation step also resets the consecutive
    /// counter, giving the endpoint a clean slate to prove itself.
    pub fn is_healthy(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.cooldown_until > 0 && now_epoch() >= st.cooldown_until {
            st.unhealthy = false;
            st.cooldown_until = 0;
            st.last_error = None;
            st.category = None;
            if st.is_extended {
                st.is_extended = false;
                st.consecutive_cooldowns = 0;
                info!(endpoint = %self.config.name, "extended cooldown expired, endpoint healthy again");
            }
        }
        !st.unhealthy
    }

    pub fn cooldown_remaining(&self) -> i64 {
        let st = self.state.lock().unwrap();
        if st.cooldown_until == 0 {
            return 0;
        }
        (st.cooldown_until - now_epoch()).max(0)
    }

    pub fn consecutive_cooldowns(&self) -> u32 {
        self.state.lock().unwrap().consecutive_cooldowns
    }

    pub fn is_extended_cooldown(&self) -> bool {
        self.state.lock().unwrap().is_extended
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }

    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.state.lock().unwrap().category
    }

    /// Mark the endpoint unhealthy and start a cooldown.
    ///
    /// Returns `true` when this call escalated the endpoint into the
    /// terminal (persisted) cooldown step.
    pub fn mark_unhealthy(&self, error: &str, category: Option<ErrorCategory>) -> bool {
        let category = category.unwrap_or_else(|| classify_error(error));
        let is_local = self.config.is_local();
        let mut st = self.state.lock().unwrap();

        st.unhealthy = true;
        st.last_error = Some(error.to_string());
        st.category = Some(category);

        // Structural failures never escalate; neither do local transients.
        let skip_escalation = category == ErrorCategory::Structural
            || (is_local && category == ErrorCategory::Transient);
        if !skip_escalation {
            st.consecutive_cooldowns += 1;
        }

        let cooldown = match category {
            ErrorCategory::Quota => COOLDOWN_QUOTA_SECS,
            ErrorCategory::Auth => COOLDOWN_AUTH_SECS,
            ErrorCategory::Structural => COOLDOWN_STRUCTURAL_SECS,
            ErrorCategory::Transient if is_local => COOLDOWN_TRANSIENT_SECS,
            ErrorCategory::Transient | ErrorCategory::Unknown
                if st.consecutive_cooldowns >= 2 =>
            {
                let idx = ((st.consecutive_cooldowns - 1) as usize)
                    .min(COOLDOWN_ESCALATION_STEPS.len() - 1);
                let secs = COOLDOWN_ESCALATION_STEPS[idx];
                st.is_extended = secs == *COOLDOWN_ESCALATION_STEPS.last().unwrap();
                warn!(
                    endpoint = %self.config.name,
                    step = idx + 1,
                    cooldown_secs = secs,
                    failures = st.consecutive_cooldowns,
                    "progressive cooldown"
                );
                secs
            }
            ErrorCategory::Transient => COOLDOWN_TRANSIENT_SECS,
            ErrorCategory::Unknown => COOLDOWN_DEFAULT_SECS,
        };

        st.cooldown_until = now_epoch() + cooldown;
        debug!(
            endpoint = %self.config.name,
            category = %category,
            cooldown_secs = cooldown,
            error,
            "endpoint marked unhealthy"
        );
        st.is_extended
    }

    /// A successful request proves the endpoint works: clear the cooldown
    /// (even an extended one) and reset the consecutive counter.
    ///
    /// Returns `true` when an extended cooldown was cleared, so the caller
    /// can drop the persisted entry.
    pub fn record_success(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        let cleared_extended = st.is_extended;
        if st.unhealthy || st.cooldown_until > 0 || st.consecutive_cooldowns > 0 {
            debug!(
                endpoint = %self.config.name,
                reset_from = st.consecutive_cooldowns,
                "success — cooldown state cleared"
            );
        }
        st.unhealthy = false;
        st.cooldown_until = 0;
        st.last_error = None;
        st.category = None;
        st.consecutive_cooldowns = 0;
        st.is_extended = false;
        cleared_extended
    }

    /// Global-failure bypass: clear the cooldown so the endpoint can be
    /// retried immediately, but keep the consecutive counter — the reset
    /// does not mean the endpoint actually recovered.
    pub fn reset_cooldown(&self) {
        let mut st = self.state.lock().unwrap();
        if st.cooldown_until > 0 || st.is_extended || st.unhealthy {
            st.cooldown_until = 0;
            st.is_extended = false;
            st.unhealthy = false;
            st.last_error = None;
            st.category = None;
        }
    }

    /// Shorten the current cooldown to at most `secs` from now.
    pub fn shorten_cooldown(&self, secs: i64) {
        let mut st = self.state.lock().unwrap();
        let new_until = now_epoch() + secs;
        if st.cooldown_until > new_until {
            st.cooldown_until = new_until;
        }
    }

    /// Restore persisted cooldown state (extended cooldowns survive restarts).
    pub fn restore_state(&self, snap: &HealthSnapshot) {
        if snap.cooldown_until <= now_epoch() {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st.unhealthy = true;
        st.cooldown_until = snap.cooldown_until;
        st.consecutive_cooldowns = snap.consecutive_cooldowns;
        st.is_extended = snap.is_extended;
        st.category = snap.error_category.parse().ok();
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let st = self.state.lock().unwrap();
        HealthSnapshot {
            cooldown_until: st.cooldown_until,
            consecutive_cooldowns: st.consecutive_cooldowns,
            is_extended: st.is_extended,
            error_category: st.category.unwrap_or_default().to_string(),
        }
    }

    /// Wait for an RPM slot if this endpoint is rate limited.
    pub async fn acquire_rate_limit(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(&self.config.name).await;
        }
    }

    /// Send one request to this endpoint through its transport.
    pub async fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        self.transport.send(&self.config, req).await
    }

    /// Connectivity probe: a ten-token request. Updates health state unless
    /// `dry_run` is set.
    pub async fn health_check(&self, dry_run: bool) -> Result<bool> {
        let req = LlmRequest {
            messages: vec![crate::types::Message::user("Hi")],
            max_tokens: 10,
            temperature: 1.0,
            ..Default::default()
        };
        match self.chat(&req).await {
            Ok(_) => {
                if !dry_run {
                    self.record_success();
                }
                Ok(true)
            }
            Err(e) => {
                if dry_run {
                    Err(e)
                } else {
                    self.mark_unhealthy(&e.to_string(), Some(categorize(&e)));
                    Ok(false)
                }
            }
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auth" => Ok(ErrorCategory::Auth),
            "quota" => Ok(ErrorCategory::Quota),
            "structural" => Ok(ErrorCategory::Structural),
            "transient" => Ok(ErrorCategory::Transient),
            "unknown" | "" => Ok(ErrorCategory::Unknown),
            other => Err(format!("unknown error category: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiType;

    fn provider(local: bool) -> Provider {
        Provider::new(EndpointConfig {
            name: "test-ep".into(),
            provider: "openai".into(),
            api_type: ApiType::OpenAi,
            base_url: if local {
                "http://localhost:11434/v1".into()
            } else {
                "https://api.example.com/v1".into()
            },
            api_key_env: None,
            api_key: Some("sk-test".into()),
            model: "gpt-4o".into(),
            priority: 1,
            max_tokens: 0,
            context_window: 150_000,
            timeout: 180,
            capabilities: Some(vec!["text".into(), "tools".into()]),
            extra_params: None,
            note: None,
            rpm_limit: 0,
            pricing_tiers: None,
        })
    }

    #[test]
    fn success_after_transient_resets_everything() {
        let p = provider(false);
        p.mark_unhealthy("connection reset", Some(ErrorCategory::Transient));
        assert!(!p.is_healthy());
        p.record_success();
        assert!(p.is_healthy());
        assert_eq!(p.consecutive_cooldowns(), 0);
        assert_eq!(p.cooldown_remaining(), 0);
    }

    #[test]
    fn consecutive_transients_escalate_strictly() {
        let p = provider(false);
        p.mark_unhealthy("timeout", Some(ErrorCategory::Transient));
        let first = p.cooldown_remaining();
        p.mark_unhealthy("timeout", Some(ErrorCategory::Transient));
        let second = p.cooldown_remaining();
        assert!(
            second > first,
            "expected escalation: {first}s then {second}s"
        );
        // Step 2 of the ladder is 10 s.
        assert!(second >= 9 && second <= 10);
    }

    #[test]
    fn structural_never_escalates() {
        let p = provider(false);
        for _ in 0..5 {
            p.mark_unhealthy("invalid_request", Some(ErrorCategory::Structural));
        }
        assert_eq!(p.consecutive_cooldowns(), 0);
        let remaining = p.cooldown_remaining();
        assert!(remaining >= 9 && remaining <= COOLDOWN_STRUCTURAL_SECS);
        assert!(!p.is_extended_cooldown());
    }

    #[test]
    fn local_transient_never_escalates() {
        let p = provider(true);
        for _ in 0..5 {
            p.mark_unhealthy("timed out", Some(ErrorCategory::Transient));
        }
        assert_eq!(p.consecutive_cooldowns(), 0);
        assert!(p.cooldown_remaining() <= COOLDOWN_TRANSIENT_SECS);
    }

    #[test]
    fn terminal_step_sets_extended_flag() {
        let p = provider(false);
        for _ in 0..4 {
            p.mark_unhealthy("timeout", Some(ErrorCategory::Transient));
        }
        assert!(p.is_extended_cooldown());
        let snap = p.snapshot();
        assert!(snap.is_extended);
        assert_eq!(snap.error_category, "transient");
    }

    #[test]
    fn reset_cooldown_keeps_consecutive_counter() {
        let p = provider(false);
        p.mark_unhealthy("timeout", Some(ErrorCategory::Transient));
        p.mark_unhealthy("timeout", Some(ErrorCategory::Transient));
        p.reset_cooldown();
        assert!(p.is_healthy());
        assert_eq!(p.consecutive_cooldowns(), 2);
    }

    #[test]
    fn shorten_cooldown_only_shrinks() {
        let p = provider(false);
        p.mark_unhealthy("bad key 401", Some(ErrorCategory::Auth));
        p.shorten_cooldown(3);
        assert!(p.cooldown_remaining() <= 3);
        // Shortening to something longer than remaining is a no-op.
        p.shorten_cooldown(500);
        assert!(p.cooldown_remaining() <= 3);
    }

    #[test]
    fn classifier_priorities() {
        assert_eq!(
            classify_error("403 insufficient_quota for this key"),
            ErrorCategory::Quota
        );
        assert_eq!(classify_error("401 unauthorized"), ErrorCategory::Auth);
        assert_eq!(
            classify_error("invalid_request: messages with role tool"),
            ErrorCategory::Structural
        );
        assert_eq!(classify_error("connection reset by peer"), ErrorCategory::Transient);
        assert_eq!(classify_error("mystery failure"), ErrorCategory::Unknown);
    }

    #[test]
    fn restore_skips_expired_entries() {
        let p = provider(false);
        p.restore_state(&HealthSnapshot {
            cooldown_until: now_epoch() - 100,
            consecutive_cooldowns: 4,
            is_extended: true,
            error_category: "transient".into(),
        });
        assert!(p.is_healthy());

        p.restore_state(&HealthSnapshot {
            cooldown_until: now_epoch() + 50,
            consecutive_cooldowns: 4,
            is_extended: true,
            error_category: "transient".into(),
        });
        assert!(!p.is_healthy());
        assert!(p.is_extended_cooldown());
    }
}
