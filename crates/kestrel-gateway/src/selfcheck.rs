//! `system:daily_selfcheck` — diagnostics, log cleanup, and the report push.
//!
//! Runs once a day from the scheduler: prunes old log files, assembles a
//! markdown health report, and pushes it to every IM session active within
//! the last 24 hours, chunked to platform-safe sizes.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use kestrel_llm::LlmClient;
use kestrel_memory::MemoryManager;
use kestrel_scheduler::executor::chunk_message;
use kestrel_scheduler::SystemTaskHandler;

use crate::gateway::Gateway;

/// Chunk size for the pushed report (Telegram-safe with margin).
const REPORT_CHUNK_CHARS: usize = 3500;

pub struct SelfCheckHandler {
    gateway: Arc<Gateway>,
    memory: Arc<MemoryManager>,
    client: Arc<LlmClient>,
    log_dir: PathBuf,
    log_retention_days: i64,
}

impl SelfCheckHandler {
    pub fn new(
        gateway: Arc<Gateway>,
        memory: Arc<MemoryManager>,
        client: Arc<LlmClient>,
        log_dir: PathBuf,
        log_retention_days: i64,
    ) -> Self {
        Self {
            gateway,
            memory,
            client,
            log_dir,
            log_retention_days,
        }
    }

    /// Remove log files older than the retention window. Returns how many.
    fn cleanup_logs(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.log_dir) else {
            return 0;
        };
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(self.log_retention_days.max(0) as u64 * 86_400);
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|m| m < cutoff)
                .unwrap_or(false);
            if old {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                } else {
                    warn!(path = %path.display(), "could not remove old log file");
                }
            }
        }
        removed
    }

    fn build_report(&self, logs_removed: usize) -> String {
        let date = Utc::now().format("%Y-%m-%d");
        let mut out = format!("## ✅ Daily self-check ({date})\n\n");

        // Endpoint health.
        out.push_str("### Endpoints\n");
        for model in self.client.list_models() {
            out.push_str(&format!(
                "- {} ({}): {}\n",
                model.name,
                model.model,
                if model.is_healthy { "healthy" } else { "cooling down" },
            ));
        }

        // Memory store stats.
        out.push_str("\n### Memory\n");
        let store = self.memory.store();
        let memories = store.count_memories(None).unwrap_or(-1);
        let episodes = store.count_episodes().unwrap_or(-1);
        let pending = store.pending_extraction_count().unwrap_or(-1);
        out.push_str(&format!(
            "- {memories} memories, {episodes} episodes, {pending} extractions pending\n"
        ));

        // Sessions.
        out.push_str("\n### Sessions\n");
        out.push_str(&format!(
            "- {} live, {} active in the last 24h\n",
            self.gateway.sessions().live_count(),
            self.gateway.sessions().recently_active(24).len(),
        ));

        out.push_str(&format!("\n### Housekeeping\n- {logs_removed} old log files removed\n"));
        out
    }
}

#[async_trait]
impl SystemTaskHandler for SelfCheckHandler {
    async fn run(&self) -> std::result::Result<String, String> {
        let logs_removed = self.cleanup_logs();
        let report = self.build_report(logs_removed);

        let active = self.gateway.sessions().recently_active(24);
        let mut pushed = 0;
        for key in &active {
            for chunk in chunk_message(&report, REPORT_CHUNK_CHARS) {
                self.gateway.send_to_session(key, &chunk).await;
            }
            pushed += 1;
        }
        info!(pushed, logs_removed, "daily self-check complete");

        Ok(format!(
            "self-check complete: report pushed to {pushed} active sessions, {logs_removed} log files removed"
        ))
    }
}

/// `system:daily_memory` — nightly memory consolidation.
pub struct DailyMemoryHandler {
    memory: Arc<MemoryManager>,
}

impl DailyMemoryHandler {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl SystemTaskHandler for DailyMemoryHandler {
    async fn run(&self) -> std::result::Result<String, String> {
        match self.memory.consolidate_daily().await {
            Ok(report) => Ok(report.summary()),
            Err(e) => Err(e.to_string()),
        }
    }
}
