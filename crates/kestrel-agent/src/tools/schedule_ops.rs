//! Scheduler tools: create, list, and cancel scheduled tasks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kestrel_scheduler::{NewTask, Scheduler, TaskKind, Trigger};

use super::{Tool, ToolResult};
use crate::im_context;

pub struct ScheduleTaskTool {
    scheduler: Arc<Scheduler>,
}

impl ScheduleTaskTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Schedule a reminder or a recurring task (once / interval / cron)."
    }

    fn detail(&self) -> Option<&str> {
        Some(
            "Schedule future work. trigger_type 'once' needs run_at (RFC3339 or \
             'YYYY-MM-DD HH:MM'); 'interval' needs interval_minutes; 'cron' needs \
             a 5-field cron expression. task_type 'reminder' just delivers \
             reminder_message at fire time; 'task' runs the agent with prompt. \
             When called from a chat, notifications go back to that chat.",
        )
    }

    fn category(&self) -> &str {
        "schedule"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Short task name." },
                "description": { "type": "string" },
                "trigger_type": { "type": "string", "enum": ["once", "interval", "cron"] },
                "run_at": { "type": "string", "description": "For 'once': when to fire." },
                "interval_minutes": { "type": "integer", "description": "For 'interval'." },
                "cron": { "type": "string", "description": "For 'cron': 5-field expression." },
                "task_type": { "type": "string", "enum": ["reminder", "task"] },
                "reminder_message": { "type": "string" },
                "prompt": { "type": "string" },
                "notify_on_start": { "type": "boolean" },
                "notify_on_complete": { "type": "boolean" }
            },
            "required": ["name", "trigger_type"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(name) = input.get("name").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: name");
        };

        let trigger = match input.get("trigger_type").and_then(|v| v.as_str()) {
            Some("once") => {
                let Some(raw) = input.get("run_at").and_then(|v| v.as_str()) else {
                    return ToolResult::error("trigger_type 'once' requires run_at");
                };
                match parse_run_at(raw) {
                    Some(run_at) => Trigger::Once { run_at },
                    None => return ToolResult::error(format!("cannot parse run_at: {raw}")),
                }
            }
            Some("interval") => {
                let Some(minutes) = input.get("interval_minutes").and_then(|v| v.as_u64()) else {
                    return ToolResult::error("trigger_type 'interval' requires interval_minutes");
                };
                if minutes == 0 {
                    return ToolResult::error("interval_minutes must be at least 1");
                }
                Trigger::Interval { minutes }
            }
            Some("cron") => {
                let Some(expr) = input.get("cron").and_then(|v| v.as_str()) else {
                    return ToolResult::error("trigger_type 'cron' requires cron");
                };
                if let Err(e) = kestrel_scheduler::schedule::parse_cron(expr) {
                    return ToolResult::error(e.to_string());
                }
                Trigger::Cron {
                    expression: expr.to_string(),
                }
            }
            _ => return ToolResult::error("trigger_type must be once, interval, or cron"),
        };

        let kind = match input.get("task_type").and_then(|v| v.as_str()) {
            Some("reminder") => TaskKind::Reminder,
            _ => TaskKind::Task,
        };

        // Bind the task to the current chat so notifications find their way
        // back.
        let (channel_id, chat_id, user_id) = match im_context::current() {
            Some(ctx) => {
                let session = ctx.session.lock().unwrap();
                (
                    Some(session.key.channel.clone()),
                    Some(session.key.chat_id.clone()),
                    Some(session.key.user_id.clone()),
                )
            }
            None => (None, None, None),
        };

        let mut metadata = serde_json::Map::new();
        for key in ["notify_on_start", "notify_on_complete"] {
            if let Some(v) = input.get(key).and_then(|v| v.as_bool()) {
                metadata.insert(key.to_string(), serde_json::Value::Bool(v));
            }
        }

        let new = NewTask {
            name: name.to_string(),
            description: input
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            trigger: Some(trigger),
            kind: Some(kind),
            reminder_message: input
                .get("reminder_message")
                .and_then(|v| v.as_str())
                .map(String::from),
            prompt: input.get("prompt").and_then(|v| v.as_str()).map(String::from),
            action: None,
            channel_id,
            chat_id,
            user_id,
            metadata: Some(serde_json::Value::Object(metadata)),
        };

        match self.scheduler.add_task(new) {
            Ok(task) => ToolResult::success(format!(
                "task '{}' scheduled (id: {}, next run: {})",
                task.name,
                task.id,
                task.next_run
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_else(|| "never".into()),
            )),
            Err(e) => ToolResult::error(format!("failed to schedule task: {e}")),
        }
    }
}

/// Accept RFC3339 or the friendlier `YYYY-MM-DD HH:MM` (treated as UTC).
fn parse_run_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

pub struct ListTasksTool {
    scheduler: Arc<Scheduler>,
}

impl ListTasksTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List scheduled tasks with their next run times."
    }

    fn category(&self) -> &str {
        "schedule"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolResult {
        match self.scheduler.list_tasks() {
            Ok(tasks) if tasks.is_empty() => ToolResult::success("no scheduled tasks"),
            Ok(tasks) => {
                let lines: Vec<String> = tasks
                    .iter()
                    .map(|t| {
                        format!(
                            "- {} (id: {}, {}, next: {}, runs: {})",
                            t.name,
                            t.id,
                            if t.enabled { "enabled" } else { "disabled" },
                            t.next_run
                                .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
                                .unwrap_or_else(|| "—".into()),
                            t.run_count,
                        )
                    })
                    .collect();
                ToolResult::success(lines.join("\n"))
            }
            Err(e) => ToolResult::error(format!("failed to list tasks: {e}")),
        }
    }
}

pub struct CancelTaskTool {
    scheduler: Arc<Scheduler>,
}

impl CancelTaskTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for CancelTaskTool {
    fn name(&self) -> &str {
        "cancel_task"
    }

    fn description(&self) -> &str {
        "Cancel (delete) a scheduled task by id."
    }

    fn category(&self) -> &str {
        "schedule"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Task id from list_tasks." }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(id) = input.get("id").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: id");
        };
        match self.scheduler.remove_task(id) {
            Ok(()) => ToolResult::success(format!("task {id} cancelled")),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
