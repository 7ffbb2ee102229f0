//! Task execution strategies.
//!
//! Reminders deliver exactly one message, then a classifier gate decides
//! whether the "reminder" actually needs agent execution (creation-time
//! misclassification happens). Tasks run the agent with start/complete
//! notifications gated by metadata and a hard wall-clock timeout. System
//! tasks call registered handlers directly, no LLM involved.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::types::{ScheduledTask, TaskKind};

/// Outbound message delivery, implemented by the gateway.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send `text` to `(channel, chat_id)`. Returns a delivery error string
    /// on failure — the executor never sees adapter internals.
    async fn send_text(
        &self,
        channel: &str,
        chat_id: &str,
        text: &str,
    ) -> std::result::Result<(), String>;
}

/// Re-entry into the agent, implemented by the gateway wiring.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Run a full agent turn for a scheduled task. The implementation binds
    /// a virtual session for `(channel_id, chat_id, user_id)` so IM tools
    /// work during the run. Returns the agent's final text.
    async fn execute(
        &self,
        task: &ScheduledTask,
        prompt: &str,
    ) -> std::result::Result<String, String>;

    /// Lightweight single-shot classification (no tools, no session).
    async fn classify(&self, prompt: &str) -> std::result::Result<String, String>;
}

/// A `system:`-action handler (daily memory, daily self-check).
#[async_trait]
pub trait SystemTaskHandler: Send + Sync {
    async fn run(&self) -> std::result::Result<String, String>;
}

/// Sink, agent, and system handlers are late-bound behind locks: the
/// executor sits below the gateway in construction order, so the wiring
/// injects them once the upper layers exist.
pub struct TaskExecutor {
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
    agent: RwLock<Option<Arc<dyn AgentHandler>>>,
    system_handlers: RwLock<HashMap<String, Arc<dyn SystemTaskHandler>>>,
    timeout: Duration,
}

impl TaskExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            sink: RwLock::new(None),
            agent: RwLock::new(None),
            system_handlers: RwLock::new(HashMap::new()),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_sink(self, sink: Arc<dyn MessageSink>) -> Self {
        self.set_sink(sink);
        self
    }

    pub fn with_agent(self, agent: Arc<dyn AgentHandler>) -> Self {
        self.set_agent(agent);
        self
    }

    pub fn set_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    pub fn set_agent(&self, agent: Arc<dyn AgentHandler>) {
        *self.agent.write().unwrap() = Some(agent);
    }

    fn sink(&self) -> Option<Arc<dyn MessageSink>> {
        self.sink.read().unwrap().clone()
    }

    fn agent(&self) -> Option<Arc<dyn AgentHandler>> {
        self.agent.read().unwrap().clone()
    }

    /// Register a handler for a `system:<name>` action.
    pub fn register_system_handler(&self, action: &str, handler: Arc<dyn SystemTaskHandler>) {
        self.system_handlers
            .write()
            .unwrap()
            .insert(action.to_string(), handler);
    }

    /// Execute one fired task. Returns (success, result-or-error).
    pub async fn execute(&self, task: &ScheduledTask) -> (bool, String) {
        info!(task_id = %task.id, name = %task.name, kind = ?task.kind, "executing task");

        if task.is_system() {
            return self.execute_system(task).await;
        }
        match task.kind {
            TaskKind::Reminder => self.execute_reminder(task).await,
            TaskKind::Task => self.execute_task(task).await,
        }
    }

    /// Reminder flow: deliver the message (exactly once), then ask the
    /// classifier whether this reminder secretly needs execution. If it
    /// does, run the task core with the end notification suppressed — the
    /// reminder message was already sent.
    async fn execute_reminder(&self, task: &ScheduledTask) -> (bool, String) {
        let message = task
            .reminder_message
            .clone()
            .or_else(|| task.prompt.clone())
            .unwrap_or_else(|| format!("⏰ Reminder: {}", task.name));

        let mut message_sent = false;
        if task.has_owner_chat() {
            if let Some(sink) = self.sink() {
                let channel = task.channel_id.as_deref().unwrap_or_default();
                let chat = task.chat_id.as_deref().unwrap_or_default();
                if let Err(e) = sink.send_text(channel, chat, &message).await {
                    error!(task_id = %task.id, error = %e, "reminder delivery failed");
                    return (false, format!("reminder delivery failed: {e}"));
                }
                message_sent = true;
                info!(task_id = %task.id, "reminder message sent");
            }
        }

        if self.reminder_needs_execution(task).await {
            info!(task_id = %task.id, "reminder promoted to task execution");
            return self.execute_task_core(task, message_sent).await;
        }

        (true, message)
    }

    /// Classifier gate. Answers NO_ACTION / NEEDS_ACTION; any failure means
    /// "no action" — a plain reminder must never grow side effects because
    /// the classifier was down.
    async fn reminder_needs_execution(&self, task: &ScheduledTask) -> bool {
        let Some(agent) = self.agent() else {
            return false;
        };
        let prompt = format!(
            "Decide whether this scheduled reminder requires the assistant to DO something \
             beyond delivering the message.\n\n\
             Name: {}\nDescription: {}\nMessage: {}\n\n\
             Simple nudges (drink water, stand up, meeting soon) → NO_ACTION.\n\
             Work items (check the weather and report, run a script, analyse data) → NEEDS_ACTION.\n\
             Reply with exactly NO_ACTION or NEEDS_ACTION.",
            task.name,
            task.description,
            task.reminder_message.as_deref().unwrap_or_default(),
        );
        match agent.classify(&prompt).await {
            Ok(reply) => reply.to_uppercase().contains("NEEDS_ACTION"),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "reminder classifier failed, assuming no action");
                false
            }
        }
    }

    /// Full task flow: start notification, agent run, end notification.
    async fn execute_task(&self, task: &ScheduledTask) -> (bool, String) {
        self.send_start_notification(task).await;
        self.execute_task_core(task, false).await
    }

    async fn execute_task_core(
        &self,
        task: &ScheduledTask,
        skip_end_notification: bool,
    ) -> (bool, String) {
        let Some(agent) = self.agent() else {
            return (false, "no agent handler configured".to_string());
        };

        let prompt = build_prompt(task);
        let outcome = tokio::time::timeout(self.timeout, agent.execute(task, &prompt)).await;

        match outcome {
            Ok(Ok(result)) => {
                if !skip_end_notification {
                    self.send_end_notification(task, true, &result).await;
                }
                info!(task_id = %task.id, "task completed");
                (true, result)
            }
            Ok(Err(e)) => {
                error!(task_id = %task.id, error = %e, "task failed");
                if !skip_end_notification {
                    self.send_end_notification(task, false, &truncate(&e, 500)).await;
                }
                (false, e)
            }
            Err(_) => {
                let msg = format!(
                    "task execution timed out after {}s",
                    self.timeout.as_secs()
                );
                error!(task_id = %task.id, "{msg}");
                if !skip_end_notification {
                    self.send_end_notification(task, false, &msg).await;
                }
                (false, msg)
            }
        }
    }

    async fn execute_system(&self, task: &ScheduledTask) -> (bool, String) {
        let action = task.action.as_deref().unwrap_or_default();
        let handler = self.system_handlers.read().unwrap().get(action).cloned();
        let Some(handler) = handler else {
            return (false, format!("unknown system action: {action}"));
        };
        match handler.run().await {
            Ok(summary) => (true, summary),
            Err(e) => {
                error!(action, error = %e, "system task failed");
                (false, e)
            }
        }
    }

    async fn send_start_notification(&self, task: &ScheduledTask) {
        if !task.has_owner_chat() || !task.notify_flag("notify_on_start") {
            return;
        }
        let Some(sink) = self.sink() else { return };
        let text = format!("🚀 Starting task: {}\n\nWorking on it…", task.name);
        if let Err(e) = sink
            .send_text(
                task.channel_id.as_deref().unwrap_or_default(),
                task.chat_id.as_deref().unwrap_or_default(),
                &text,
            )
            .await
        {
            warn!(task_id = %task.id, error = %e, "start notification failed");
        }
    }

    async fn send_end_notification(&self, task: &ScheduledTask, success: bool, message: &str) {
        if !task.has_owner_chat() || !task.notify_flag("notify_on_complete") {
            return;
        }
        let Some(sink) = self.sink() else { return };
        let status = if success {
            "✅ Task complete"
        } else {
            "❌ Task failed"
        };
        let text = format!("{status}: {}\n\n{message}", task.name);
        if let Err(e) = sink
            .send_text(
                task.channel_id.as_deref().unwrap_or_default(),
                task.chat_id.as_deref().unwrap_or_default(),
                &text,
            )
            .await
        {
            warn!(task_id = %task.id, error = %e, "end notification failed");
        }
    }
}

/// The execution prompt embeds the task metadata and forbids sending text
/// through tools — the gateway delivers the final result itself.
fn build_prompt(task: &ScheduledTask) -> String {
    let mut parts = vec![
        "[Scheduled task execution]".to_string(),
        format!("Task name: {}", task.name),
        format!("Task description: {}", task.description),
        String::new(),
        "Please perform the following task:".to_string(),
        task.prompt.clone().unwrap_or_default(),
    ];
    if task.has_owner_chat() {
        parts.push(String::new());
        parts.push(
            "Note: do not send text messages through tools; the system delivers the final \
             result automatically. Just return the outcome."
                .to_string(),
        );
    }
    parts.join("\n")
}

/// Split a report into ≤ `max_len`-char chunks, preferring newline breaks.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= max_len {
            chunks.push(rest.to_string());
            break;
        }
        // Find a byte-safe window, then prefer the last newline inside it.
        let mut window = max_len;
        while !rest.is_char_boundary(window) {
            window -= 1;
        }
        let cut = match rest[..window].rfind('\n') {
            Some(pos) if pos >= 1000 => pos,
            _ => window,
        };
        chunks.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }
    chunks
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskStatus, Trigger};
    use chrono::Utc;
    use std::sync::Mutex;

    struct RecordingSink {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_text(
            &self,
            channel: &str,
            chat_id: &str,
            text: &str,
        ) -> std::result::Result<(), String> {
            self.sent
                .lock()
                .unwrap()
                .push((channel.into(), chat_id.into(), text.into()));
            Ok(())
        }
    }

    struct CannedAgent {
        classify_reply: &'static str,
        execute_reply: &'static str,
        executions: Mutex<u32>,
    }

    #[async_trait]
    impl AgentHandler for CannedAgent {
        async fn execute(
            &self,
            _task: &ScheduledTask,
            _prompt: &str,
        ) -> std::result::Result<String, String> {
            *self.executions.lock().unwrap() += 1;
            Ok(self.execute_reply.to_string())
        }

        async fn classify(&self, _prompt: &str) -> std::result::Result<String, String> {
            Ok(self.classify_reply.to_string())
        }
    }

    fn reminder_task() -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: "t1".into(),
            name: "drink water".into(),
            description: "hydration nudge".into(),
            trigger: Trigger::Once { run_at: now },
            kind: TaskKind::Reminder,
            reminder_message: Some("⏰ time to drink water".into()),
            prompt: None,
            action: None,
            channel_id: Some("telegram".into()),
            chat_id: Some("42".into()),
            user_id: Some("7".into()),
            enabled: true,
            status: TaskStatus::Pending,
            last_run: None,
            next_run: Some(now),
            run_count: 0,
            fail_count: 0,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn simple_reminder_sends_exactly_one_message() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let agent = Arc::new(CannedAgent {
            classify_reply: "NO_ACTION",
            execute_reply: "unused",
            executions: Mutex::new(0),
        });
        let executor = TaskExecutor::new(600)
            .with_sink(sink.clone())
            .with_agent(agent.clone());

        let (ok, _) = executor.execute(&reminder_task()).await;
        assert!(ok);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "42");
        assert_eq!(sent[0].2, "⏰ time to drink water");
        assert_eq!(*agent.executions.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn misclassified_reminder_promotes_without_end_notification() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let agent = Arc::new(CannedAgent {
            classify_reply: "NEEDS_ACTION",
            execute_reply: "weather fetched",
            executions: Mutex::new(0),
        });
        let executor = TaskExecutor::new(600)
            .with_sink(sink.clone())
            .with_agent(agent.clone());

        let mut task = reminder_task();
        task.reminder_message = Some("check the weather and tell me".into());
        let (ok, result) = executor.execute(&task).await;
        assert!(ok);
        assert_eq!(result, "weather fetched");
        assert_eq!(*agent.executions.lock().unwrap(), 1);

        // Only the reminder text itself — no completion notification.
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn task_notifications_are_gated_by_metadata() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let agent = Arc::new(CannedAgent {
            classify_reply: "NO_ACTION",
            execute_reply: "done",
            executions: Mutex::new(0),
        });
        let executor = TaskExecutor::new(600)
            .with_sink(sink.clone())
            .with_agent(agent);

        let mut task = reminder_task();
        task.kind = TaskKind::Task;
        task.prompt = Some("summarize the logs".into());
        task.metadata = serde_json::json!({"notify_on_start": false, "notify_on_complete": true});

        let (ok, _) = executor.execute(&task).await;
        assert!(ok);
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].2.contains("✅ Task complete"));
    }

    #[tokio::test]
    async fn timeout_reports_failure() {
        struct SlowAgent;

        #[async_trait]
        impl AgentHandler for SlowAgent {
            async fn execute(
                &self,
                _task: &ScheduledTask,
                _prompt: &str,
            ) -> std::result::Result<String, String> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("never".into())
            }
            async fn classify(&self, _prompt: &str) -> std::result::Result<String, String> {
                Ok("NO_ACTION".into())
            }
        }

        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let executor = TaskExecutor::new(0)
            .with_sink(sink.clone())
            .with_agent(Arc::new(SlowAgent));

        let mut task = reminder_task();
        task.kind = TaskKind::Task;
        task.prompt = Some("hang forever".into());

        let (ok, msg) = executor.execute(&task).await;
        assert!(!ok);
        assert!(msg.contains("timed out"));
        let sent = sink.sent.lock().unwrap();
        assert!(sent.iter().any(|(_, _, t)| t.contains("❌ Task failed")));
    }

    #[tokio::test]
    async fn system_handler_dispatch() {
        struct Canned;
        #[async_trait]
        impl SystemTaskHandler for Canned {
            async fn run(&self) -> std::result::Result<String, String> {
                Ok("memory consolidated".into())
            }
        }

        let executor = TaskExecutor::new(600);
        executor.register_system_handler("system:daily_memory", Arc::new(Canned));

        let mut task = reminder_task();
        task.kind = TaskKind::Task;
        task.action = Some("system:daily_memory".into());
        let (ok, result) = executor.execute(&task).await;
        assert!(ok);
        assert_eq!(result, "memory consolidated");

        task.action = Some("system:unknown".into());
        let (ok, _) = executor.execute(&task).await;
        assert!(!ok);
    }

    #[test]
    fn chunking_prefers_newlines() {
        let text = format!("{}\n{}", "a".repeat(2000), "b".repeat(2000));
        let chunks = chunk_message(&text, 3500);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().all(|c| c == 'a'));
        assert!(chunks[1].chars().all(|c| c == 'b'));

        // No newline in range: hard split at the limit.
        let solid = "x".repeat(8000);
        let chunks = chunk_message(&solid, 3500);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 3500));
    }
}
