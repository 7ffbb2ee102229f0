//! Process wiring: config → identity → LLM pool → memory → sessions →
//! scheduler → agent → gateway, plus the system task registration and the
//! run loop.
//!
//! The only cycles in the object graph are resolved by injection: the
//! scheduler's executor receives the gateway (as `MessageSink`) and the
//! agent (as `AgentHandler`) after both exist.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use kestrel_agent::{im_context, tools, Agent, ImContext, PromptBuilder, ToolRegistry};
use kestrel_core::identity::IdentityPack;
use kestrel_core::KestrelConfig;
use kestrel_llm::{LlmClient, LlmRequest, Message, SttClient};
use kestrel_memory::{MemoryError, MemoryManager, MemoryStore, SummaryModel};
use kestrel_scheduler::{
    AgentHandler, NewTask, ScheduledTask, Scheduler, TaskDb, TaskExecutor, TaskKind, Trigger,
};
use kestrel_sessions::{Session, SessionKey, SessionManager};

use crate::gateway::Gateway;
use crate::selfcheck::{DailyMemoryHandler, SelfCheckHandler};

/// Default schedules for the shipped system tasks (scheduler timezone).
const DAILY_MEMORY_CRON: &str = "30 3 * * *";
const DAILY_SELFCHECK_CRON: &str = "0 4 * * *";

pub struct App {
    pub gateway: Arc<Gateway>,
    pub scheduler: Arc<Scheduler>,
    pub agent: Arc<Agent>,
    shutdown: watch::Sender<bool>,
}

impl App {
    /// Assemble the full runtime. Configuration problems are fatal here —
    /// nothing should limp along with half a stack.
    pub fn build(config: &KestrelConfig) -> anyhow::Result<App> {
        let paths = &config.paths;
        std::fs::create_dir_all(paths.data_dir())?;
        let identity = IdentityPack::load(&paths.identity_dir())?;

        let (client, compiler, stt_endpoints) =
            kestrel_llm::client::build_client(&paths.config_dir())?;
        let client = Arc::new(client);
        let compiler = compiler.map(Arc::new);

        // Memory: the lightweight pool doubles as the extraction /
        // summarization model when configured.
        let store = Arc::new(MemoryStore::open(&paths.data_dir().join("memory.db"))?);
        let mut memory = MemoryManager::new(store)
            .with_identity_dir(&paths.identity_dir())
            .with_realtime_extraction(config.memory.realtime_extraction)
            .with_retrieval_budget(config.memory.retrieval_budget_tokens)
            .with_attachment_max_age(config.memory.attachment_max_age_days);
        if let Some(compiler) = &compiler {
            memory = memory.with_model(Arc::new(PoolSummaryModel(compiler.clone())));
        }
        let memory = Arc::new(memory);

        let sessions = Arc::new(SessionManager::with_storage(
            rusqlite::Connection::open(paths.data_dir().join("sessions.db"))?,
            config.gateway.history_limit,
            config.gateway.session_idle_secs as i64,
        )?);

        let executor = Arc::new(TaskExecutor::new(config.scheduler.task_timeout_secs));
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(TaskDb::open(&paths.data_dir().join("scheduler.db"))?),
            executor.clone(),
            &config.scheduler.timezone,
            config.scheduler.tick_secs,
            config.scheduler.max_concurrent,
        ));

        let thinking_flag = Arc::new(AtomicBool::new(true));
        let registry = Arc::new(build_tool_registry(
            memory.clone(),
            scheduler.clone(),
            paths.identity_dir(),
            paths.skills_dir(),
            paths.data_dir().join("screenshots"),
            thinking_flag.clone(),
        )?);

        let mut agent = Agent::new(
            client.clone(),
            memory.clone(),
            registry,
            PromptBuilder::new(identity),
            paths.skills_dir(),
            config.agent.clone(),
        )
        .with_thinking_flag(thinking_flag);
        if let Some(compiler) = &compiler {
            agent = agent.with_compiler(compiler.clone());
        }
        let agent = Arc::new(agent);

        let stt = if stt_endpoints.is_empty() {
            None
        } else {
            Some(Arc::new(SttClient::new(stt_endpoints)))
        };

        let gateway = Gateway::new(
            sessions.clone(),
            agent.clone(),
            memory.clone(),
            client.clone(),
            stt,
            config.gateway.model_switch_hours,
        );

        // Close the cycles.
        executor.set_sink(gateway.clone());
        executor.set_agent(Arc::new(ScheduledRunner {
            agent: agent.clone(),
            sessions,
            sink: gateway.clone(),
        }));
        executor.register_system_handler(
            "system:daily_memory",
            Arc::new(DailyMemoryHandler::new(memory.clone())),
        );
        executor.register_system_handler(
            "system:daily_selfcheck",
            Arc::new(SelfCheckHandler::new(
                gateway.clone(),
                memory,
                client,
                paths.log_dir(),
                config.memory.log_retention_days,
            )),
        );

        ensure_system_tasks(&scheduler)?;

        let (shutdown, _) = watch::channel(false);
        Ok(App {
            gateway,
            scheduler,
            agent,
            shutdown,
        })
    }

    /// Start background loops and serve until ctrl-c.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.gateway.start_adapters().await;
        self.gateway.spawn_idle_sweeper(60);
        tokio::spawn(Arc::clone(&self.scheduler).run(self.shutdown.subscribe()));

        info!("kestrel is up");
        tokio::signal::ctrl_c().await?;
        info!("shutting down");

        let _ = self.shutdown.send(true);
        self.gateway.stop_adapters().await;
        self.gateway.sessions().flush_all();
        Ok(())
    }
}

/// Register every built-in tool. Duplicate names here are a wiring bug and
/// abort startup.
fn build_tool_registry(
    memory: Arc<MemoryManager>,
    scheduler: Arc<Scheduler>,
    identity_dir: PathBuf,
    skills_dir: PathBuf,
    screenshot_dir: PathBuf,
    thinking_flag: Arc<AtomicBool>,
) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(tools::file_ops::ReadFileTool))?;
    registry.register(Arc::new(tools::file_ops::WriteFileTool))?;
    registry.register(Arc::new(tools::file_ops::ListFilesTool))?;
    registry.register(Arc::new(tools::file_ops::SearchFilesTool))?;
    registry.register(Arc::new(tools::shell::ExecuteCommandTool))?;
    registry.register(Arc::new(tools::web::WebFetchTool::new()))?;

    let browser = tools::browser::BrowserSession::new(screenshot_dir);
    registry.register(Arc::new(tools::browser::BrowserOpenTool::new(browser.clone())))?;
    registry.register(Arc::new(tools::browser::BrowserNavigateTool::new(browser.clone())))?;
    registry.register(Arc::new(tools::browser::BrowserClickTool::new(browser.clone())))?;
    registry.register(Arc::new(tools::browser::BrowserTypeTool::new(browser.clone())))?;
    registry.register(Arc::new(tools::browser::BrowserGetContentTool::new(browser.clone())))?;
    registry.register(Arc::new(tools::browser::BrowserScreenshotTool::new(browser.clone())))?;
    registry.register(Arc::new(tools::browser::BrowserExecuteJsTool::new(browser.clone())))?;
    registry.register(Arc::new(tools::browser::BrowserScrollTool::new(browser.clone())))?;
    registry.register(Arc::new(tools::browser::BrowserStatusTool::new(browser.clone())))?;
    registry.register(Arc::new(tools::browser::BrowserCloseTool::new(browser)))?;

    registry.register(Arc::new(tools::skill_ops::ListSkillsTool::new(skills_dir.clone())))?;
    registry.register(Arc::new(tools::skill_ops::ReadSkillTool::new(skills_dir)))?;

    registry.register(Arc::new(tools::memory_ops::MemorySearchTool::new(memory.clone())))?;
    registry.register(Arc::new(tools::memory_ops::MemorySaveTool::new(memory.clone())))?;
    registry.register(Arc::new(tools::memory_ops::MemoryForgetTool::new(memory.clone())))?;
    registry.register(Arc::new(tools::memory_ops::ScratchpadTool::new(memory)))?;

    registry.register(Arc::new(tools::schedule_ops::ScheduleTaskTool::new(scheduler.clone())))?;
    registry.register(Arc::new(tools::schedule_ops::ListTasksTool::new(scheduler.clone())))?;
    registry.register(Arc::new(tools::schedule_ops::CancelTaskTool::new(scheduler)))?;

    registry.register(Arc::new(tools::im_ops::SendToChatTool))?;
    registry.register(Arc::new(tools::im_ops::GetChatHistoryTool))?;
    registry.register(Arc::new(tools::im_ops::GetImageFileTool))?;
    registry.register(Arc::new(tools::im_ops::GetVoiceFileTool))?;

    registry.register(Arc::new(tools::profile::ProfileGetTool::new(identity_dir.clone())))?;
    registry.register(Arc::new(tools::profile::ProfileUpdateTool::new(identity_dir)))?;
    registry.register(Arc::new(tools::thinking::ThinkingModeTool::new(thinking_flag)))?;

    Ok(registry)
}

/// Make sure the shipped system tasks exist (matched by action).
fn ensure_system_tasks(scheduler: &Scheduler) -> anyhow::Result<()> {
    let existing = scheduler.list_tasks()?;
    let has = |action: &str| {
        existing
            .iter()
            .any(|t| t.action.as_deref() == Some(action))
    };

    if !has("system:daily_memory") {
        scheduler.add_task(NewTask {
            name: "daily memory consolidation".into(),
            description: "extract episodes and memories, dedup, decay, refresh MEMORY.md".into(),
            trigger: Some(Trigger::Cron {
                expression: DAILY_MEMORY_CRON.into(),
            }),
            kind: Some(TaskKind::Task),
            action: Some("system:daily_memory".into()),
            ..Default::default()
        })?;
    }
    if !has("system:daily_selfcheck") {
        scheduler.add_task(NewTask {
            name: "daily self-check".into(),
            description: "clean logs, run diagnostics, push report to active sessions".into(),
            trigger: Some(Trigger::Cron {
                expression: DAILY_SELFCHECK_CRON.into(),
            }),
            kind: Some(TaskKind::Task),
            action: Some("system:daily_selfcheck".into()),
            ..Default::default()
        })?;
    }
    Ok(())
}

/// Lightweight-pool adapter for memory's model seam.
struct PoolSummaryModel(Arc<LlmClient>);

#[async_trait]
impl SummaryModel for PoolSummaryModel {
    async fn complete(&self, system: &str, prompt: &str) -> kestrel_memory::Result<String> {
        let req = LlmRequest {
            messages: vec![Message::user(prompt.to_string())],
            system: system.to_string(),
            max_tokens: 1024,
            temperature: 1.0,
            ..Default::default()
        };
        let resp = self
            .0
            .chat(&req)
            .await
            .map_err(|e| MemoryError::Model(e.to_string()))?;
        Ok(resp.text())
    }
}

/// Scheduler → agent re-entry: binds a virtual session for the task's chat
/// so IM tools work during the run.
struct ScheduledRunner {
    agent: Arc<Agent>,
    sessions: Arc<SessionManager>,
    sink: Arc<Gateway>,
}

#[async_trait]
impl AgentHandler for ScheduledRunner {
    async fn execute(
        &self,
        task: &ScheduledTask,
        prompt: &str,
    ) -> std::result::Result<String, String> {
        let conversation_id = format!("task:{}", task.id);

        // A task created from a chat gets a virtual session bound to that
        // chat; headless tasks get a synthetic one.
        let key = SessionKey::new(
            task.channel_id.clone().unwrap_or_else(|| "scheduler".into()),
            task.chat_id.clone().unwrap_or_else(|| task.id.clone()),
            task.user_id.clone().unwrap_or_else(|| "scheduler".into()),
        );
        let session = if task.has_owner_chat() {
            self.sessions.get_or_create(&key)
        } else {
            Arc::new(Mutex::new(Session::new(key, 50)))
        };

        let ctx = ImContext {
            session,
            sink: self.sink.clone(),
        };
        let agent = self.agent.clone();
        let prompt = prompt.to_string();
        im_context::with_im_context(ctx, async move {
            agent
                .handle_turn(&conversation_id, Vec::new(), &prompt, Vec::new(), None)
                .await
        })
        .await
        .map_err(|e| e.to_string())
    }

    async fn classify(&self, prompt: &str) -> std::result::Result<String, String> {
        self.agent.classify(prompt).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_tasks_are_registered_once() {
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(TaskDb::open_in_memory().unwrap()),
            Arc::new(TaskExecutor::new(600)),
            "UTC",
            1,
            4,
        ));
        ensure_system_tasks(&scheduler).unwrap();
        ensure_system_tasks(&scheduler).unwrap();

        let tasks = scheduler.list_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.is_system()));
        // Cron next_run is computed at creation.
        assert!(tasks.iter().all(|t| t.next_run.is_some()));
    }

    #[test]
    fn tool_registry_wires_without_duplicates() {
        let memory = Arc::new(MemoryManager::new(Arc::new(
            MemoryStore::open_in_memory().unwrap(),
        )));
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(TaskDb::open_in_memory().unwrap()),
            Arc::new(TaskExecutor::new(600)),
            "UTC",
            1,
            4,
        ));
        let registry = build_tool_registry(
            memory,
            scheduler,
            PathBuf::from("/tmp/kestrel-test-identity"),
            PathBuf::from("/tmp/kestrel-test-skills"),
            PathBuf::from("/tmp/kestrel-test-screenshots"),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        assert!(registry.len() >= 30);
        assert!(registry.get("send_to_chat").is_some());
        assert!(registry.get("schedule_task").is_some());
        assert!(registry.get("read_skill").is_some());
        assert!(registry.get("browser_navigate").is_some());
    }
}
