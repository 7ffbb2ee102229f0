//! Two-tier long-term memory: semantic facts plus episodic traces, backed by
//! one SQLite file with FTS5 mirrors.
//!
//! Raw conversation turns are archived as they happen; extraction turns the
//! salient ones into typed memories, either in real time or during the
//! nightly consolidation, which also handles dedup, decay, and the
//! MEMORY.md / USER.md refresh. A degraded memory never blocks chat — errors
//! here are logged and swallowed at the call sites.

pub mod consolidate;
pub mod db;
pub mod error;
pub mod extractor;
pub mod manager;
pub mod retrieval;
pub mod store;
pub mod types;

pub use error::{MemoryError, Result};
pub use manager::{MemoryManager, SummaryModel};
pub use store::MemoryStore;
pub use types::*;
