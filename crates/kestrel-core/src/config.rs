use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, Result};

/// Default per-task wall-clock timeout for scheduled executions.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;
/// Dispatcher tick granularity — due tasks fire within one tick of their time.
pub const DEFAULT_TICK_SECS: u64 = 1;
/// Idle sessions are closed and archived after this many seconds.
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 30 * 60;
/// Turns kept in a live session's in-memory history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
/// `/model` overrides expire after this many hours.
pub const DEFAULT_MODEL_SWITCH_HOURS: f64 = 12.0;

/// Top-level config (kestrel.toml + KESTREL_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Default for KestrelConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            agent: AgentConfig::default(),
            scheduler: SchedulerConfig::default(),
            gateway: GatewayConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for mutable state (SQLite files, scheduler state, cooldown file).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Directory holding SOUL.md / AGENT.md / USER.md / MEMORY.md.
    #[serde(default = "default_identity_dir")]
    pub identity_dir: String,
    /// Directory holding llm_endpoints.json and the persisted cooldown state.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    /// Directory scanned for installed skills.
    #[serde(default = "default_skills_dir")]
    pub skills_dir: String,
    /// Directory for rotating log files, cleaned by the daily self-check.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            identity_dir: default_identity_dir(),
            config_dir: default_config_dir(),
            skills_dir: default_skills_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl PathsConfig {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
    pub fn identity_dir(&self) -> PathBuf {
        PathBuf::from(&self.identity_dir)
    }
    pub fn config_dir(&self) -> PathBuf {
        PathBuf::from(&self.config_dir)
    }
    pub fn skills_dir(&self) -> PathBuf {
        PathBuf::from(&self.skills_dir)
    }
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }
}

/// When the agent should request extended thinking from capable endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingMode {
    Always,
    Never,
    /// Follow the runtime toggle (the `thinking` tool can flip it per turn).
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on reason-act iterations per turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Default max output tokens passed to the LLM (0 = endpoint default).
    #[serde(default)]
    pub max_tokens: u32,
    /// Total token budget for the message list before compression kicks in.
    #[serde(default = "default_context_budget")]
    pub context_budget_tokens: usize,
    /// Tokens reserved for the model's output within the budget.
    #[serde(default = "default_output_reserve")]
    pub output_reserve_tokens: usize,
    #[serde(default)]
    pub thinking_mode: ThinkingMode,
    /// Run the prompt compiler stage on non-trivial user messages.
    #[serde(default)]
    pub compile_prompts: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tokens: 0,
            context_budget_tokens: default_context_budget(),
            output_reserve_tokens: default_output_reserve(),
            thinking_mode: ThinkingMode::default(),
            compile_prompts: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone name used to evaluate cron expressions.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// Maximum task executions in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            task_timeout_secs: default_task_timeout(),
            max_concurrent: default_max_concurrent(),
            tick_secs: default_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_session_idle")]
    pub session_idle_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Lifetime of a `/model` per-conversation override, in hours.
    #[serde(default = "default_model_switch_hours")]
    pub model_switch_hours: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_idle_secs: default_session_idle(),
            history_limit: default_history_limit(),
            model_switch_hours: default_model_switch_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Extract memory candidates from salient turns as they arrive, rather
    /// than only at the nightly consolidation.
    #[serde(default = "bool_true")]
    pub realtime_extraction: bool,
    /// Token budget for the retrieved-memory block in the system prompt.
    #[serde(default = "default_retrieval_budget")]
    pub retrieval_budget_tokens: usize,
    #[serde(default = "default_attachment_max_age")]
    pub attachment_max_age_days: i64,
    /// Log files older than this are removed by the daily self-check.
    #[serde(default = "default_log_retention")]
    pub log_retention_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            realtime_extraction: true,
            retrieval_budget_tokens: default_retrieval_budget(),
            attachment_max_age_days: default_attachment_max_age(),
            log_retention_days: default_log_retention(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_max_iterations() -> usize {
    100
}
fn default_context_budget() -> usize {
    180_000
}
fn default_output_reserve() -> usize {
    8_192
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_task_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}
fn default_max_concurrent() -> usize {
    4
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_session_idle() -> u64 {
    DEFAULT_SESSION_IDLE_SECS
}
fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
fn default_model_switch_hours() -> f64 {
    DEFAULT_MODEL_SWITCH_HOURS
}
fn default_retrieval_budget() -> usize {
    700
}
fn default_attachment_max_age() -> i64 {
    90
}
fn default_log_retention() -> i64 {
    14
}

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}
fn default_data_dir() -> String {
    format!("{}/.kestrel/data", home_dir())
}
fn default_identity_dir() -> String {
    format!("{}/.kestrel/identity", home_dir())
}
fn default_config_dir() -> String {
    format!("{}/.kestrel", home_dir())
}
fn default_skills_dir() -> String {
    format!("{}/.kestrel/skills", home_dir())
}
fn default_log_dir() -> String {
    format!("{}/.kestrel/logs", home_dir())
}

impl KestrelConfig {
    /// Load config from a TOML file with KESTREL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.kestrel/kestrel.toml
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(|| format!("{}/kestrel.toml", home_dir() + "/.kestrel"));

        let config: KestrelConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("KESTREL_").split("_"))
            .extract()
            .map_err(|e| KestrelError::Config(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = KestrelConfig::default();
        assert_eq!(cfg.agent.max_iterations, 100);
        assert_eq!(cfg.agent.context_budget_tokens, 180_000);
        assert_eq!(cfg.scheduler.task_timeout_secs, 600);
        assert_eq!(cfg.gateway.history_limit, 50);
        assert_eq!(cfg.gateway.session_idle_secs, 1800);
        assert!(cfg.memory.realtime_extraction);
    }

    #[test]
    fn load_from_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kestrel.toml");
        std::fs::write(
            &path,
            "[scheduler]\ntimezone = \"Asia/Shanghai\"\nmax_concurrent = 2\n",
        )
        .unwrap();
        let cfg = KestrelConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(cfg.scheduler.timezone, "Asia/Shanghai");
        assert_eq!(cfg.scheduler.max_concurrent, 2);
        // untouched section keeps its defaults
        assert_eq!(cfg.agent.max_iterations, 100);
    }
}
