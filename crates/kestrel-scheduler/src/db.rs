//! Task and execution persistence.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};
use crate::types::*;

pub struct TaskDb {
    conn: Mutex<Connection>,
}

const TASK_COLUMNS: &str = "id, name, description, trigger_json, kind, reminder_message, prompt, \
     action, channel_id, chat_id, user_id, enabled, status, last_run, next_run, \
     run_count, fail_count, metadata, created_at, updated_at";

impl TaskDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_task(&self, task: &ScheduledTask) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO scheduled_tasks
             (id, name, description, trigger_json, kind, reminder_message, prompt,
              action, channel_id, chat_id, user_id, enabled, status, last_run, next_run,
              run_count, fail_count, metadata, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
            rusqlite::params![
                task.id,
                task.name,
                task.description,
                serde_json::to_string(&task.trigger)?,
                match task.kind {
                    TaskKind::Reminder => "reminder",
                    TaskKind::Task => "task",
                },
                task.reminder_message,
                task.prompt,
                task.action,
                task.channel_id,
                task.chat_id,
                task.user_id,
                task.enabled as i64,
                task.status.as_str(),
                task.last_run.map(|d| d.to_rfc3339()),
                task.next_run.map(|d| d.to_rfc3339()),
                task.run_count,
                task.fail_count,
                task.metadata.to_string(),
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1");
        match conn.query_row(&sql, [id], row_to_task) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Enabled tasks whose `next_run` has arrived.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks
             WHERE enabled = 1 AND status != 'running'
               AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([now.to_rfc3339()], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn record_execution(&self, exec: &TaskExecution) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO task_executions
             (id, task_id, started_at, finished_at, status, result, error, duration_seconds)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            rusqlite::params![
                exec.id,
                exec.task_id,
                exec.started_at.to_rfc3339(),
                exec.finished_at.map(|d| d.to_rfc3339()),
                exec.status.as_str(),
                exec.result,
                exec.error,
                exec.duration_seconds,
            ],
        )?;
        Ok(())
    }

    pub fn executions_for_task(&self, task_id: &str, limit: usize) -> Result<Vec<TaskExecution>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, started_at, finished_at, status, result, error, duration_seconds
             FROM task_executions WHERE task_id = ?1
             ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![task_id, limit as i64], |row| {
            let status: String = row.get(4)?;
            Ok(TaskExecution {
                id: row.get(0)?,
                task_id: row.get(1)?,
                started_at: parse_ts(row.get(2)?),
                finished_at: parse_ts_opt(row.get(3)?),
                status: status.parse().unwrap_or(ExecutionStatus::Failed),
                result: row.get(5)?,
                error: row.get(6)?,
                duration_seconds: row.get(7)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id               TEXT PRIMARY KEY,
            name             TEXT NOT NULL,
            description      TEXT NOT NULL DEFAULT '',
            trigger_json     TEXT NOT NULL,
            kind             TEXT NOT NULL DEFAULT 'task',
            reminder_message TEXT,
            prompt           TEXT,
            action           TEXT,
            channel_id       TEXT,
            chat_id          TEXT,
            user_id          TEXT,
            enabled          INTEGER NOT NULL DEFAULT 1,
            status           TEXT NOT NULL DEFAULT 'pending',
            last_run         TEXT,
            next_run         TEXT,
            run_count        INTEGER NOT NULL DEFAULT 0,
            fail_count       INTEGER NOT NULL DEFAULT 0,
            metadata         TEXT NOT NULL DEFAULT '{}',
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);

        CREATE TABLE IF NOT EXISTS task_executions (
            id               TEXT PRIMARY KEY,
            task_id          TEXT NOT NULL,
            started_at       TEXT NOT NULL,
            finished_at      TEXT,
            status           TEXT NOT NULL,
            result           TEXT,
            error            TEXT,
            duration_seconds REAL
        );
        CREATE INDEX IF NOT EXISTS idx_exec_task ON task_executions(task_id, started_at DESC);",
    )?;
    Ok(())
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(parse_ts)
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let trigger_json: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let status: String = row.get(12)?;
    let metadata: String = row.get(17)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        // A corrupt trigger must not panic downstream; park the task on an
        // effectively-never interval instead.
        trigger: serde_json::from_str(&trigger_json).unwrap_or(Trigger::Interval {
            minutes: 60 * 24 * 365 * 100,
        }),
        kind: if kind == "reminder" {
            TaskKind::Reminder
        } else {
            TaskKind::Task
        },
        reminder_message: row.get(5)?,
        prompt: row.get(6)?,
        action: row.get(7)?,
        channel_id: row.get(8)?,
        chat_id: row.get(9)?,
        user_id: row.get(10)?,
        enabled: row.get::<_, i64>(11)? != 0,
        status: status.parse().unwrap_or(TaskStatus::Pending),
        last_run: parse_ts_opt(row.get(13)?),
        next_run: parse_ts_opt(row.get(14)?),
        run_count: row.get(15)?,
        fail_count: row.get(16)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        created_at: parse_ts(row.get(18)?),
        updated_at: parse_ts(row.get(19)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str, next_run: Option<DateTime<Utc>>) -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: id.into(),
            name: "drink water".into(),
            description: "hydration".into(),
            trigger: Trigger::Once {
                run_at: now + chrono::Duration::hours(1),
            },
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
            next_run,
            run_count: 0,
            fail_count: 0,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn task_round_trip() {
        let db = TaskDb::open_in_memory().unwrap();
        let task = sample_task("t1", Some(Utc::now()));
        db.insert_task(&task).unwrap();
        let back = db.get_task("t1").unwrap().unwrap();
        assert_eq!(back.name, "drink water");
        assert_eq!(back.kind, TaskKind::Reminder);
        assert_eq!(back.reminder_message.as_deref(), Some("⏰ time to drink water"));
        assert!(matches!(back.trigger, Trigger::Once { .. }));
    }

    #[test]
    fn due_query_respects_enabled_and_time() {
        let db = TaskDb::open_in_memory().unwrap();
        let past = Utc::now() - chrono::Duration::minutes(5);
        let future = Utc::now() + chrono::Duration::hours(1);

        db.insert_task(&sample_task("due", Some(past))).unwrap();
        db.insert_task(&sample_task("later", Some(future))).unwrap();
        let mut disabled = sample_task("off", Some(past));
        disabled.enabled = false;
        db.insert_task(&disabled).unwrap();

        let due = db.due_tasks(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "due");
    }

    #[test]
    fn executions_append_for_audit() {
        let db = TaskDb::open_in_memory().unwrap();
        let exec = TaskExecution {
            id: "e1".into(),
            task_id: "t1".into(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            status: ExecutionStatus::Success,
            result: Some("sent".into()),
            error: None,
            duration_seconds: Some(0.2),
        };
        db.record_execution(&exec).unwrap();
        let rows = db.executions_for_task("t1", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ExecutionStatus::Success);
    }
}
