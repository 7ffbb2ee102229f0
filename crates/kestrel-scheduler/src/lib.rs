//! Persistent task scheduler.
//!
//! Tasks carry a trigger (once / interval / cron), a payload (a reminder
//! message or an agent prompt), and an optional IM owner for notifications.
//! A 1 s dispatcher loop fires due tasks through the executor under a
//! concurrency cap; every execution is recorded for audit. System tasks
//! (`system:` actions) bypass the LLM and call registered handlers.

pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod schedule;
pub mod types;

pub use db::TaskDb;
pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use executor::{AgentHandler, MessageSink, SystemTaskHandler, TaskExecutor};
pub use types::{
    ExecutionStatus, NewTask, ScheduledTask, TaskExecution, TaskKind, TaskStatus, Trigger,
};
