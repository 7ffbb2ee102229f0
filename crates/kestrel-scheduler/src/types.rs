use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Defines when a task fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger_type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire exactly once at the given UTC instant, then disable the task.
    Once { run_at: DateTime<Utc> },

    /// Fire repeatedly: `next_run = max(now, last_run) + minutes`.
    Interval { minutes: u64 },

    /// Standard 5-field cron expression, evaluated in the scheduler's
    /// configured timezone.
    Cron { expression: String },
}

/// How a fired task is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Deliver one message, then consult the classifier gate — only a
    /// misclassified reminder escalates to agent execution.
    Reminder,
    /// Full agent run with start/complete notifications.
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub trigger: Trigger,
    pub kind: TaskKind,
    /// Reminder payload — the exact text delivered at fire time.
    pub reminder_message: Option<String>,
    /// Task payload — the prompt handed to the agent.
    pub prompt: Option<String>,
    /// `system:`-prefixed actions bypass the LLM entirely.
    pub action: Option<String>,
    /// IM owner, set when the task was created from a chat.
    pub channel_id: Option<String>,
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
    pub enabled: bool,
    pub status: TaskStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub fail_count: u32,
    /// Free-form flags: `notify_on_start`, `notify_on_complete`, …
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn is_reminder(&self) -> bool {
        self.kind == TaskKind::Reminder
    }

    pub fn is_system(&self) -> bool {
        self.action
            .as_deref()
            .is_some_and(|a| a.starts_with("system:"))
    }

    pub fn has_owner_chat(&self) -> bool {
        self.channel_id.is_some() && self.chat_id.is_some()
    }

    /// Metadata flag with a default of `true` when absent.
    pub fn notify_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }
}

/// Parameters for creating a task; the engine fills in the bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: String,
    pub description: String,
    pub trigger: Option<Trigger>,
    pub kind: Option<TaskKind>,
    pub reminder_message: Option<String>,
    pub prompt: Option<String>,
    pub action: Option<String>,
    pub channel_id: Option<String>,
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One audit row per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_serde_round_trip() {
        let triggers = vec![
            Trigger::Once {
                run_at: "2026-02-01T10:00:00Z".parse().unwrap(),
            },
            Trigger::Interval { minutes: 30 },
            Trigger::Cron {
                expression: "0 3 * * *".into(),
            },
        ];
        for t in triggers {
            let json = serde_json::to_string(&t).unwrap();
            let back: Trigger = serde_json::from_str(&json).unwrap();
            assert_eq!(back, t);
        }
    }

    #[test]
    fn notify_flag_defaults_true() {
        let mut task = ScheduledTask {
            id: "t".into(),
            name: "n".into(),
            description: String::new(),
            trigger: Trigger::Interval { minutes: 5 },
            kind: TaskKind::Task,
            reminder_message: None,
            prompt: Some("do it".into()),
            action: None,
            channel_id: None,
            chat_id: None,
            user_id: None,
            enabled: true,
            status: TaskStatus::Pending,
            last_run: None,
            next_run: None,
            run_count: 0,
            fail_count: 0,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(task.notify_flag("notify_on_start"));
        task.metadata = serde_json::json!({"notify_on_start": false});
        assert!(!task.notify_flag("notify_on_start"));
        assert!(task.notify_flag("notify_on_complete"));
    }

    #[test]
    fn system_action_detection() {
        let mut task = ScheduledTask {
            id: "t".into(),
            name: "daily memory".into(),
            description: String::new(),
            trigger: Trigger::Cron {
                expression: "30 3 * * *".into(),
            },
            kind: TaskKind::Task,
            reminder_message: None,
            prompt: None,
            action: Some("system:daily_memory".into()),
            channel_id: None,
            chat_id: None,
            user_id: None,
            enabled: true,
            status: TaskStatus::Pending,
            last_run: None,
            next_run: None,
            run_count: 0,
            fail_count: 0,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(task.is_system());
        task.action = Some("refresh".into());
        assert!(!task.is_system());
    }
}
