//! Nightly consolidation.
//!
//! Raw turns become one Episode per session plus semantic memories; the
//! extraction queue is drained with retries; then the store is groomed:
//! word-overlap dedup clustering, short-term decay, expired rows, stale
//! attachments, and the MEMORY.md / USER.md refresh.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::extractor::{self, AddOutcome};
use crate::manager::SummaryModel;
use crate::store::MemoryStore;
use crate::types::*;

/// Two memories with word overlap at or above this are one cluster.
pub const DEDUP_OVERLAP_THRESHOLD: f64 = 0.7;
/// Short-term memories with an effective score below this (and fewer than 2
/// accesses) are demoted to transient.
const DECAY_FLOOR: f64 = 0.1;
const MEMORY_MD_MAX_CHARS: usize = 1500;
/// User-subject facts needed before USER.md is worth generating.
const USER_MD_MIN_FACTS: usize = 3;

#[derive(Debug, Default, Clone)]
pub struct ConsolidationReport {
    pub sessions_processed: usize,
    pub episodes_created: usize,
    pub memories_extracted: usize,
    pub memories_added: usize,
    pub queue_processed: usize,
    pub duplicates_removed: usize,
    pub memories_decayed: usize,
    pub expired_removed: usize,
    pub attachments_cleaned: usize,
    pub memory_md_refreshed: bool,
    pub user_md_refreshed: bool,
}

impl ConsolidationReport {
    pub fn summary(&self) -> String {
        format!(
            "consolidation: {} sessions, {} episodes, {} extracted, {} added, {} deduped, {} decayed, {} attachments cleaned",
            self.sessions_processed,
            self.episodes_created,
            self.memories_extracted,
            self.memories_added,
            self.duplicates_removed,
            self.memories_decayed,
            self.attachments_cleaned,
        )
    }
}

/// Run the full nightly pass.
pub async fn consolidate_daily(
    store: &MemoryStore,
    model: Option<&dyn SummaryModel>,
    identity_dir: Option<&Path>,
    attachment_max_age_days: i64,
) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport::default();

    process_unextracted_turns(store, model, &mut report).await?;
    drain_extraction_queue(store, model, &mut report).await?;
    report.duplicates_removed = dedup_sweep(store)?;
    let (decayed, expired) = compute_decay(store)?;
    report.memories_decayed = decayed;
    report.expired_removed = expired;
    report.attachments_cleaned = cleanup_stale_attachments(store, attachment_max_age_days)?;

    if let Some(dir) = identity_dir {
        report.memory_md_refreshed = refresh_memory_md(store, dir)?;
        report.user_md_refreshed = refresh_user_md(store, dir)?;
    }

    info!("{}", report.summary());
    Ok(report)
}

/// Group pending turns by session, emit one Episode each, extract semantic
/// memories from salient turns, and flip every processed turn to
/// `extracted = true`.
async fn process_unextracted_turns(
    store: &MemoryStore,
    model: Option<&dyn SummaryModel>,
    report: &mut ConsolidationReport,
) -> Result<()> {
    let turns = store.get_unextracted_turns(500)?;
    if turns.is_empty() {
        return Ok(());
    }

    let mut by_session: BTreeMap<String, Vec<ConversationTurn>> = BTreeMap::new();
    for turn in turns {
        by_session.entry(turn.session_id.clone()).or_default().push(turn);
    }

    for (session_id, turns) in by_session {
        report.sessions_processed += 1;
        let episode_id = Uuid::new_v4().to_string();
        let mut linked_ids: Vec<String> = Vec::new();

        for turn in &turns {
            if !extractor::is_salient(&turn.content) {
                continue;
            }
            let Some(model) = model else { continue };
            match extractor::extract_candidates(model, &turn.role, &turn.content).await {
                Ok(candidates) => {
                    report.memories_extracted += candidates.len();
                    for cand in &candidates {
                        match extractor::add_with_dedup_oracle(
                            store,
                            Some(model),
                            cand,
                            "consolidation",
                            Some(&episode_id),
                        )
                        .await?
                        {
                            AddOutcome::Added(id) => {
                                report.memories_added += 1;
                                linked_ids.push(id);
                            }
                            AddOutcome::Duplicate(_) => {}
                        }
                    }
                }
                Err(e) => warn!(session = %session_id, error = %e, "turn extraction failed"),
            }
        }

        let episode = build_episode(&episode_id, &session_id, &turns, linked_ids, model).await;
        store.save_episode(&episode)?;
        report.episodes_created += 1;

        let indices: Vec<i64> = turns.iter().map(|t| t.turn_index).collect();
        store.mark_turns_extracted(&session_id, &indices)?;
    }
    Ok(())
}

async fn build_episode(
    episode_id: &str,
    session_id: &str,
    turns: &[ConversationTurn],
    linked_memory_ids: Vec<String>,
    model: Option<&dyn SummaryModel>,
) -> Episode {
    let first_user = turns
        .iter()
        .find(|t| t.role == "user")
        .map(|t| truncate(&t.content, 120))
        .unwrap_or_default();

    let summary = match model {
        Some(model) => {
            let transcript: String = turns
                .iter()
                .map(|t| format!("{}: {}", t.role.to_uppercase(), truncate(&t.content, 400)))
                .collect::<Vec<_>>()
                .join("\n");
            match model
                .complete(
                    "Summarize this conversation in one or two sentences. Plain text only.",
                    &transcript,
                )
                .await
            {
                Ok(s) if !s.trim().is_empty() => truncate(s.trim(), 400),
                _ => fallback_summary(turns, &first_user),
            }
        }
        None => fallback_summary(turns, &first_user),
    };

    let error_seen = turns
        .iter()
        .any(|t| t.content.to_lowercase().contains("error") || t.content.contains("failed"));
    let outcome = if error_seen {
        EpisodeOutcome::Partial
    } else {
        EpisodeOutcome::Completed
    };

    Episode {
        id: episode_id.to_string(),
        session_id: session_id.to_string(),
        summary,
        goal: first_user,
        outcome,
        started_at: turns.first().map(|t| t.timestamp).unwrap_or_else(Utc::now),
        ended_at: turns.last().map(|t| t.timestamp).unwrap_or_else(Utc::now),
        action_nodes: serde_json::Value::Array(Vec::new()),
        entities: extract_entities(turns),
        tools_used: extract_tools(turns),
        linked_memory_ids,
        importance_score: (0.3 + turns.len() as f64 * 0.05).min(0.9),
    }
}

fn fallback_summary(turns: &[ConversationTurn], first_user: &str) -> String {
    if first_user.is_empty() {
        format!("Conversation with {} turns", turns.len())
    } else {
        format!("Conversation ({} turns) starting with: {first_user}", turns.len())
    }
}

/// Capitalized tokens and quoted strings across the session's text.
fn extract_entities(turns: &[ConversationTurn]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for turn in turns {
        for token in turn.content.split_whitespace() {
            let cleaned = token.trim_matches(|c: char| !c.is_alphanumeric());
            if cleaned.len() < 3 || cleaned.len() > 40 {
                continue;
            }
            let mut chars = cleaned.chars();
            let first_upper = chars.next().is_some_and(|c| c.is_uppercase());
            // Skip sentence-initial capitals by requiring a lowercase tail.
            if first_upper && chars.any(|c| c.is_lowercase()) {
                let lower = cleaned.to_lowercase();
                if seen.insert(lower) {
                    out.push(cleaned.to_string());
                }
            }
        }
        if out.len() >= 10 {
            break;
        }
    }
    out.truncate(10);
    out
}

/// Tool names from the archived `tool_calls` JSON on each turn.
fn extract_tools(turns: &[ConversationTurn]) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for turn in turns {
        let Some(raw) = &turn.tool_calls else { continue };
        let Ok(calls) = serde_json::from_str::<Vec<serde_json::Value>>(raw) else {
            continue;
        };
        for call in calls {
            if let Some(name) = call.get("name").and_then(|n| n.as_str()) {
                if seen.insert(name.to_string()) {
                    out.push(name.to_string());
                }
            }
        }
    }
    out
}

/// Drain the extraction queue in batches with per-item retry accounting.
async fn drain_extraction_queue(
    store: &MemoryStore,
    model: Option<&dyn SummaryModel>,
    report: &mut ConsolidationReport,
) -> Result<()> {
    loop {
        let batch = store.dequeue_extraction(10)?;
        if batch.is_empty() {
            return Ok(());
        }
        for item in batch {
            report.queue_processed += 1;
            let Some(model) = model else {
                store.complete_extraction(item.queue_id, true)?;
                continue;
            };
            match extractor::extract_candidates(model, &item.role, &item.content).await {
                Ok(candidates) => {
                    report.memories_extracted += candidates.len();
                    for cand in &candidates {
                        if let AddOutcome::Added(_) = extractor::add_with_dedup_oracle(
                            store,
                            Some(model),
                            cand,
                            "extraction_queue",
                            None,
                        )
                        .await?
                        {
                            report.memories_added += 1;
                        }
                    }
                    store.complete_extraction(item.queue_id, true)?;
                }
                Err(e) => {
                    warn!(queue_id = item.queue_id, error = %e, "queue extraction failed");
                    store.complete_extraction(item.queue_id, false)?;
                }
            }
        }
    }
}

/// O(n log n) per-type clustering: sort, then greedily assign each memory to
/// a cluster with any member overlapping ≥ 0.7. The best member survives,
/// the rest are deleted.
pub fn dedup_sweep(store: &MemoryStore) -> Result<usize> {
    let mut removed = 0;
    for memory_type in MemoryType::ALL {
        let mut group = store.query_memories(Some(memory_type), None, 1000)?;
        group.sort_by(|a, b| a.content.cmp(&b.content));

        let mut assigned = vec![false; group.len()];
        for i in 0..group.len() {
            if assigned[i] {
                continue;
            }
            let mut cluster = vec![i];
            assigned[i] = true;
            for j in (i + 1)..group.len() {
                if assigned[j] {
                    continue;
                }
                if word_overlap(&group[i].content, &group[j].content)
                    >= DEDUP_OVERLAP_THRESHOLD
                {
                    cluster.push(j);
                    assigned[j] = true;
                }
            }
            if cluster.len() < 2 {
                continue;
            }

            let best = *cluster
                .iter()
                .max_by(|&&a, &&b| {
                    let ma = &group[a];
                    let mb = &group[b];
                    ma.importance_score
                        .partial_cmp(&mb.importance_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(ma.access_count.cmp(&mb.access_count))
                        .then(ma.content.len().cmp(&mb.content.len()))
                        .then(ma.updated_at.cmp(&mb.updated_at))
                })
                .unwrap();
            for &idx in &cluster {
                if idx != best {
                    store.delete_memory(&group[idx].id)?;
                    removed += 1;
                }
            }
        }
    }
    Ok(removed)
}

/// Jaccard similarity over lowercase word sets.
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = words(a);
    let set_b: HashSet<String> = words(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let inter = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    inter / union
}

fn words(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Decay pass: demote faded short-term memories, drop expired rows.
pub fn compute_decay(store: &MemoryStore) -> Result<(usize, usize)> {
    let now = Utc::now();
    let mut demoted = 0;
    for mem in store.query_memories(None, Some(MemoryPriority::ShortTerm), 500)? {
        let last = mem.last_accessed_at.unwrap_or(mem.created_at);
        let days = (now - last).num_seconds().max(0) as f64 / 86_400.0;
        let effective = mem.importance_score * (1.0 - mem.decay_rate).powf(days);
        if effective < DECAY_FLOOR && mem.access_count < 2 {
            store.set_memory_priority(&mem.id, MemoryPriority::Transient)?;
            demoted += 1;
        }
    }
    let expired = store.cleanup_expired()?;
    Ok((demoted, expired))
}

fn cleanup_stale_attachments(store: &MemoryStore, max_age_days: i64) -> Result<usize> {
    let stale = store.stale_attachments(max_age_days)?;
    let mut removed = 0;
    for att in stale {
        if let Some(path) = &att.local_path {
            let _ = std::fs::remove_file(path);
        }
        if store.delete_attachment(&att.id)? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Rewrite MEMORY.md: top memories grouped by type, ≤ 1500 chars, ending
/// with the refresh timestamp.
pub fn refresh_memory_md(store: &MemoryStore, identity_dir: &Path) -> Result<bool> {
    std::fs::create_dir_all(identity_dir)?;
    let mut out = String::from("# MEMORY\n");
    let footer = format!("\n_refreshed {}_\n", Utc::now().format("%Y-%m-%d %H:%M UTC"));
    let budget = MEMORY_MD_MAX_CHARS.saturating_sub(footer.len());

    'outer: for memory_type in MemoryType::ALL {
        let memories = store.query_memories(Some(memory_type), None, 5)?;
        if memories.is_empty() {
            continue;
        }
        let header = format!("\n## {}\n", capitalize(memory_type.as_str()));
        if out.len() + header.len() > budget {
            break;
        }
        out.push_str(&header);
        for mem in memories {
            let line = format!("- {}\n", truncate(&mem.content, 160));
            if out.len() + line.len() > budget {
                break 'outer;
            }
            out.push_str(&line);
        }
    }

    out.push_str(&footer);
    std::fs::write(identity_dir.join("MEMORY.md"), &out)?;
    Ok(true)
}

/// Rewrite USER.md from user-subject facts, when there are enough of them.
pub fn refresh_user_md(store: &MemoryStore, identity_dir: &Path) -> Result<bool> {
    let all = store.query_memories(None, None, 500)?;
    let user_facts: Vec<&SemanticMemory> = all
        .iter()
        .filter(|m| m.subject.as_deref() == Some("user") || m.content.to_lowercase().contains("user"))
        .collect();
    if user_facts.len() < USER_MD_MIN_FACTS {
        return Ok(false);
    }

    let mut basic = Vec::new();
    let mut tech = Vec::new();
    let mut preferences = Vec::new();
    let mut projects = Vec::new();
    for mem in &user_facts {
        let line = format!("- {}\n", truncate(&mem.content, 160));
        match mem.memory_type {
            MemoryType::Skill | MemoryType::Error => tech.push(line),
            MemoryType::Preference | MemoryType::Rule => preferences.push(line),
            _ if mem.content.to_lowercase().contains("project")
                || mem.tags.iter().any(|t| t == "project") =>
            {
                projects.push(line)
            }
            _ => basic.push(line),
        }
    }

    let mut out = String::from("# USER\n");
    for (title, lines) in [
        ("Basic", basic),
        ("Tech", tech),
        ("Preferences", preferences),
        ("Projects", projects),
    ] {
        if lines.is_empty() {
            continue;
        }
        out.push_str(&format!("\n## {title}\n"));
        for line in lines.iter().take(10) {
            out.push_str(line);
        }
    }
    out.push_str(&format!(
        "\n_refreshed {}_\n",
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));

    std::fs::create_dir_all(identity_dir)?;
    std::fs::write(identity_dir.join("USER.md"), &out)?;
    Ok(true)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{cut}…")
}

fn capitalize(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().to_string() + c.as_str(),
    }
}
