//! The dispatcher loop and task bookkeeping.
//!
//! A 1 s tick selects enabled tasks with `next_run <= now` and launches each
//! through the executor, capped by a semaphore. After a run, `last_run` is
//! set, `next_run` recomputed from the trigger, and counters updated. Once
//! tasks disable themselves after their single fire.

use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::TaskDb;
use crate::error::Result;
use crate::executor::TaskExecutor;
use crate::schedule::{compute_next_run, resolve_timezone};
use crate::types::*;

pub struct Scheduler {
    db: Arc<TaskDb>,
    executor: Arc<TaskExecutor>,
    timezone: Tz,
    tick_secs: u64,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        db: Arc<TaskDb>,
        executor: Arc<TaskExecutor>,
        timezone: &str,
        tick_secs: u64,
        max_concurrent: usize,
    ) -> Self {
        Self {
            db,
            executor,
            timezone: resolve_timezone(timezone),
            tick_secs: tick_secs.max(1),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn db(&self) -> &Arc<TaskDb> {
        &self.db
    }

    /// Create and persist a task. `next_run` is computed immediately.
    pub fn add_task(&self, new: NewTask) -> Result<ScheduledTask> {
        let now = Utc::now();
        let trigger = new
            .trigger
            .ok_or_else(|| crate::error::SchedulerError::InvalidTrigger("missing trigger".into()))?;
        let next_run = compute_next_run(&trigger, None, now, self.timezone)?;

        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            description: new.description,
            trigger,
            kind: new.kind.unwrap_or(TaskKind::Task),
            reminder_message: new.reminder_message,
            prompt: new.prompt,
            action: new.action,
            channel_id: new.channel_id,
            chat_id: new.chat_id,
            user_id: new.user_id,
            enabled: true,
            status: TaskStatus::Pending,
            last_run: None,
            next_run,
            run_count: 0,
            fail_count: 0,
            metadata: new.metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
        };
        self.db.insert_task(&task)?;
        info!(task_id = %task.id, name = %task.name, next_run = ?task.next_run, "task added");
        Ok(task)
    }

    pub fn remove_task(&self, id: &str) -> Result<()> {
        self.db.delete_task(id)?;
        info!(task_id = %id, "task removed");
        Ok(())
    }

    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.db.list_tasks()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledTask> {
        let mut task = self
            .db
            .get_task(id)?
            .ok_or_else(|| crate::error::SchedulerError::TaskNotFound { id: id.to_string() })?;
        task.enabled = enabled;
        if enabled && task.next_run.is_none() {
            task.next_run = compute_next_run(&task.trigger, task.last_run, Utc::now(), self.timezone)?;
        }
        task.updated_at = Utc::now();
        self.db.insert_task(&task)?;
        Ok(task)
    }

    /// Startup pass: recompute stale `next_run` values. A task whose
    /// `next_run` fell into the past while the process was down keeps that
    /// time, so the first tick fires it once; the recompute after that run
    /// schedules it normally.
    pub fn reload(&self) -> Result<usize> {
        let now = Utc::now();
        let mut touched = 0;
        for mut task in self.db.list_tasks()? {
            if !task.enabled {
                continue;
            }
            // A crashed run leaves status=running; reset so it can fire.
            let mut dirty = false;
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                dirty = true;
            }
            if task.next_run.is_none() {
                task.next_run = compute_next_run(&task.trigger, task.last_run, now, self.timezone)?;
                dirty = task.next_run.is_some();
                if task.next_run.is_none() {
                    // Exhausted once-task that never got disabled.
                    task.enabled = false;
                    dirty = true;
                }
            }
            if dirty {
                task.updated_at = now;
                self.db.insert_task(&task)?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Main loop. Ticks until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.tick_secs, "scheduler started");
        if let Err(e) = self.reload() {
            error!(error = %e, "scheduler reload failed");
        }

        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.tick_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = Arc::clone(&self).tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: claim due tasks and launch them under the concurrency cap.
    pub async fn tick(self: Arc<Self>) -> Result<()> {
        let now = Utc::now();
        let due = self.db.due_tasks(now)?;

        for mut task in due {
            task.status = TaskStatus::Running;
            task.updated_at = now;
            self.db.insert_task(&task)?;

            let this = Arc::clone(&self);
            let permit = Arc::clone(&self.permits);
            tokio::spawn(async move {
                let _permit = match permit.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                this.run_one(task).await;
            });
        }
        Ok(())
    }

    /// Execute a claimed task and write back all bookkeeping.
    async fn run_one(&self, mut task: ScheduledTask) {
        let started = Utc::now();
        let exec_id = Uuid::new_v4().to_string();
        let _ = self.db.record_execution(&TaskExecution {
            id: exec_id.clone(),
            task_id: task.id.clone(),
            started_at: started,
            finished_at: None,
            status: ExecutionStatus::Running,
            result: None,
            error: None,
            duration_seconds: None,
        });

        let (success, message) = self.executor.execute(&task).await;
        let finished = Utc::now();
        let duration = (finished - started).num_milliseconds() as f64 / 1000.0;

        let status = if success {
            ExecutionStatus::Success
        } else if message.contains("timed out") {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::Failed
        };
        let _ = self.db.record_execution(&TaskExecution {
            id: exec_id,
            task_id: task.id.clone(),
            started_at: started,
            finished_at: Some(finished),
            status,
            result: success.then(|| message.clone()),
            error: (!success).then(|| message.clone()),
            duration_seconds: Some(duration),
        });

        // Bookkeeping: counters, next_run, and the once-task shutdown.
        task.last_run = Some(finished);
        task.run_count += 1;
        if !success {
            task.fail_count += 1;
        }
        task.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        match compute_next_run(&task.trigger, task.last_run, finished, self.timezone) {
            Ok(Some(next)) => {
                task.next_run = Some(next);
                task.status = TaskStatus::Pending;
            }
            Ok(None) => {
                task.next_run = None;
                task.enabled = false;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "next_run recompute failed, disabling task");
                task.next_run = None;
                task.enabled = false;
            }
        }
        task.updated_at = finished;
        if let Err(e) = self.db.insert_task(&task) {
            error!(task_id = %task.id, error = %e, "failed to persist task after run");
        }
    }
}
