//! The memory subsystem's front door.
//!
//! Everything above this crate talks to `MemoryManager`: turn archiving,
//! retrieval for the prompt builder, explicit memory tools, the scratchpad,
//! and the nightly consolidation entry point. LLM access is injected
//! through [`SummaryModel`] so this crate stays below the client in the
//! dependency order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::consolidate::{self, ConsolidationReport};
use crate::error::Result;
use crate::extractor::{self, AddOutcome};
use crate::retrieval;
use crate::store::MemoryStore;
use crate::types::*;

/// A lightweight completion model (extraction, summaries, query
/// decomposition). The gateway wires this to the compiler endpoint pool.
#[async_trait]
pub trait SummaryModel: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

pub struct MemoryManager {
    store: Arc<MemoryStore>,
    model: Option<Arc<dyn SummaryModel>>,
    identity_dir: Option<PathBuf>,
    realtime_extraction: bool,
    retrieval_budget_tokens: usize,
    attachment_max_age_days: i64,
}

impl MemoryManager {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            model: None,
            identity_dir: None,
            realtime_extraction: true,
            retrieval_budget_tokens: 700,
            attachment_max_age_days: 90,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn SummaryModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_identity_dir(mut self, dir: &Path) -> Self {
        self.identity_dir = Some(dir.to_path_buf());
        self
    }

    pub fn with_realtime_extraction(mut self, enabled: bool) -> Self {
        self.realtime_extraction = enabled;
        self
    }

    pub fn with_retrieval_budget(mut self, tokens: usize) -> Self {
        self.retrieval_budget_tokens = tokens;
        self
    }

    pub fn with_attachment_max_age(mut self, days: i64) -> Self {
        self.attachment_max_age_days = days;
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Archive one turn; salient turns are also queued for extraction when
    /// real-time extraction is on. Never fails the caller — memory problems
    /// must not block chat.
    pub fn record_turn(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<&str>,
        tool_results: Option<&str>,
    ) {
        let turn_index =
            match self
                .store
                .save_turn(session_id, role, content, tool_calls, tool_results)
            {
                Ok(idx) => idx,
                Err(e) => {
                    warn!(session = %session_id, error = %e, "failed to archive turn");
                    return;
                }
            };

        if self.realtime_extraction && extractor::is_salient(content) {
            if let Err(e) = self
                .store
                .enqueue_extraction(session_id, turn_index, role, content)
            {
                warn!(session = %session_id, error = %e, "failed to enqueue extraction");
            }
        }
    }

    /// Process a batch of queued extractions now (between turns, off the hot
    /// path). No-op without a model.
    pub async fn process_extraction_queue(&self, batch: usize) -> usize {
        let Some(model) = &self.model else { return 0 };
        let items = match self.store.dequeue_extraction(batch) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "extraction dequeue failed");
                return 0;
            }
        };
        let mut added = 0;
        for item in items {
            match extractor::extract_candidates(model.as_ref(), &item.role, &item.content).await {
                Ok(candidates) => {
                    for cand in &candidates {
                        match extractor::add_with_dedup_oracle(
                            &self.store,
                            Some(model.as_ref()),
                            cand,
                            "realtime",
                            None,
                        )
                        .await
                        {
                            Ok(AddOutcome::Added(_)) => added += 1,
                            Ok(AddOutcome::Duplicate(_)) => {}
                            Err(e) => warn!(error = %e, "memory write failed"),
                        }
                    }
                    let _ = self.store.complete_extraction(item.queue_id, true);
                }
                Err(e) => {
                    debug!(queue_id = item.queue_id, error = %e, "extraction attempt failed");
                    let _ = self.store.complete_extraction(item.queue_id, false);
                }
            }
        }
        added
    }

    // ------------------------------------------------------------------
    // Explicit memory ops (tool handlers)
    // ------------------------------------------------------------------

    /// Add a memory through the dedup pipeline.
    pub fn add_memory(
        &self,
        content: &str,
        memory_type: MemoryType,
        importance: f64,
    ) -> Result<AddOutcome> {
        let candidate = MemoryCandidate {
            memory_type: memory_type.as_str().to_string(),
            content: content.to_string(),
            importance: importance.clamp(0.0, 1.0),
        };
        extractor::add_with_dedup(&self.store, &candidate, "explicit", None)
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SemanticMemory>> {
        Ok(self
            .store
            .search_memories(query, limit)?
            .into_iter()
            .map(|(m, _)| m)
            .collect())
    }

    pub fn forget(&self, id: &str) -> Result<bool> {
        self.store.delete_memory(id)
    }

    pub fn scratchpad(&self, user_id: &str) -> Result<Scratchpad> {
        Ok(self
            .store
            .get_scratchpad(user_id)?
            .unwrap_or_else(|| Scratchpad {
                user_id: user_id.to_string(),
                ..Default::default()
            }))
    }

    pub fn update_scratchpad(&self, pad: &Scratchpad) -> Result<()> {
        self.store.save_scratchpad(pad)
    }

    pub fn save_attachment(&self, att: &Attachment) -> Result<()> {
        self.store.save_attachment(att)
    }

    // ------------------------------------------------------------------
    // Retrieval & consolidation
    // ------------------------------------------------------------------

    /// Memory context block for the system prompt. Empty string on any
    /// failure — retrieval never blocks a turn.
    pub async fn retrieve(&self, query: &str, tech_persona: bool) -> String {
        match retrieval::retrieve(
            &self.store,
            self.model.as_deref(),
            query,
            self.retrieval_budget_tokens,
            tech_persona,
        )
        .await
        {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "memory retrieval failed");
                String::new()
            }
        }
    }

    /// The nightly pass — episodes, queue drain, dedup, decay, MD refresh.
    pub async fn consolidate_daily(&self) -> Result<ConsolidationReport> {
        consolidate::consolidate_daily(
            &self.store,
            self.model.as_deref(),
            self.identity_dir.as_deref(),
            self.attachment_max_age_days,
        )
        .await
    }
}
