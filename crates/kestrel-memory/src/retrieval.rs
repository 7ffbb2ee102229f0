//! Multi-way retrieval for the system prompt.
//!
//! Four recall paths per query — FTS over memories, the episode entity/tool
//! index, recently-touched high-importance memories, and (when the query
//! smells like a file hunt) attachment FTS. Candidates are merged by id and
//! reranked by a weighted sum, then formatted into a markdown block capped
//! at the caller's token budget.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::manager::SummaryModel;
use crate::store::MemoryStore;
use crate::types::{Episode, MemoryType, SemanticMemory};

const W_RELEVANCE: f64 = 0.4;
const W_RECENCY: f64 = 0.25;
const W_IMPORTANCE: f64 = 0.2;
const W_ACCESS: f64 = 0.15;
/// Boost applied to skill/error memories when a tech persona is active.
const PERSONA_BOOST: f64 = 1.2;
/// Recency half-life in days.
const RECENCY_HALF_LIFE_DAYS: f64 = 7.0;

const MAX_KEYWORDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    General,
    SearchMemory,
    SearchFile,
}

#[derive(Debug, Clone)]
pub struct DecomposedQuery {
    pub keywords: Vec<String>,
    pub intent: QueryIntent,
}

const DECOMPOSE_SYSTEM: &str = "Decompose the user's request into search keywords. Return ONLY \
JSON: {\"keywords\": [\"...\"], \"intent\": \"general|search_memory|search_file\"}. \
Use search_file when the user is looking for a photo, video, document or other file they sent.";

fn stop_words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| {
        [
            "the", "a", "an", "is", "are", "was", "were", "be", "been", "do", "does", "did",
            "have", "has", "had", "will", "would", "can", "could", "should", "what", "when",
            "where", "which", "who", "how", "why", "and", "or", "not", "for", "with", "about",
            "into", "that", "this", "these", "those", "it", "its", "you", "your", "me", "my",
            "i", "we", "our", "please", "tell", "show", "give",
        ]
        .into_iter()
        .collect()
    })
}

fn media_term_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(photo|photos|picture|image|video|screenshot|file|document|pdf|recording|voice|attachment)s?\b")
            .unwrap()
    })
}

/// Decompose a query via the lightweight model, falling back to the
/// rule-based tokenizer on any failure.
pub async fn decompose(model: Option<&dyn SummaryModel>, query: &str) -> DecomposedQuery {
    if let Some(model) = model {
        match model.complete(DECOMPOSE_SYSTEM, query).await {
            Ok(raw) => {
                if let Some(parsed) = parse_decomposition(&raw) {
                    return parsed;
                }
            }
            Err(e) => debug!(error = %e, "query decomposition model failed, using rules"),
        }
    }
    decompose_rules(query)
}

fn parse_decomposition(raw: &str) -> Option<DecomposedQuery> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    let v: serde_json::Value = serde_json::from_str(&raw[start..=end]).ok()?;
    let keywords: Vec<String> = v
        .get("keywords")?
        .as_array()?
        .iter()
        .filter_map(|k| k.as_str())
        .map(|s| s.to_string())
        .take(MAX_KEYWORDS)
        .collect();
    if keywords.is_empty() {
        return None;
    }
    let intent = match v.get("intent").and_then(|i| i.as_str()) {
        Some("search_file") => QueryIntent::SearchFile,
        Some("search_memory") => QueryIntent::SearchMemory,
        _ => QueryIntent::General,
    };
    Some(DecomposedQuery { keywords, intent })
}

/// Rule-based fallback: tokenize, drop stop words, keep tokens ≥ 2 chars.
pub fn decompose_rules(query: &str) -> DecomposedQuery {
    let keywords: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
        .filter(|t| !stop_words().contains(t.as_str()))
        .take(MAX_KEYWORDS)
        .collect();
    let intent = if media_term_re().is_match(query) {
        QueryIntent::SearchFile
    } else {
        QueryIntent::General
    };
    DecomposedQuery { keywords, intent }
}

struct Candidate {
    memory: SemanticMemory,
    relevance: f64,
    score: f64,
}

/// Retrieve and format the memory context block for `query`.
///
/// Returns an empty string when nothing relevant exists — callers inject
/// nothing rather than an empty header.
pub async fn retrieve(
    store: &MemoryStore,
    model: Option<&dyn SummaryModel>,
    query: &str,
    budget_tokens: usize,
    tech_persona: bool,
) -> Result<String> {
    let decomposed = decompose(model, query).await;
    if decomposed.keywords.is_empty() {
        return Ok(String::new());
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    // 1. Semantic — FTS over memory content with OR recall.
    let fts_query = decomposed.keywords.join(" OR ");
    for (i, (mem, _rank)) in store.search_memories(&fts_query, 15)?.into_iter().enumerate() {
        if seen.insert(mem.id.clone()) {
            candidates.push(Candidate {
                memory: mem,
                relevance: 1.0 / (1.0 + i as f64 * 0.1),
                score: 0.0,
            });
        }
    }

    // 2. Episodic — memories linked from matching episodes.
    let episodes = store.search_episodes(&decomposed.keywords, 5)?;
    for ep in &episodes {
        for id in &ep.linked_memory_ids {
            if seen.contains(id) {
                continue;
            }
            if let Some(mem) = store.get_memory(id)? {
                seen.insert(mem.id.clone());
                candidates.push(Candidate {
                    memory: mem,
                    relevance: 0.6,
                    score: 0.0,
                });
            }
        }
    }

    // 3. Recency — recently-touched memories with importance ≥ 0.6.
    for mem in store.recent_memories(0.6, 5)? {
        if seen.insert(mem.id.clone()) {
            candidates.push(Candidate {
                memory: mem,
                relevance: 0.3,
                score: 0.0,
            });
        }
    }

    // 4. Attachments — only when the query is file-shaped.
    let attachments = if decomposed.intent == QueryIntent::SearchFile {
        store.search_attachments(&decomposed.keywords, 5)?
    } else {
        Vec::new()
    };

    rerank(&mut candidates, tech_persona);

    let block = format_block(&candidates, &episodes, &attachments, budget_tokens);
    // Touch whatever made it into the prompt so recency recall stays live.
    for c in candidates.iter().take(10) {
        let _ = store.touch_memory(&c.memory.id);
    }
    Ok(block)
}

fn rerank(candidates: &mut [Candidate], tech_persona: bool) {
    let now = Utc::now();
    for c in candidates.iter_mut() {
        let last = c
            .memory
            .last_accessed_at
            .unwrap_or(c.memory.updated_at);
        let days = (now - last).num_seconds().max(0) as f64 / 86_400.0;
        let recency = 0.5_f64.powf(days / RECENCY_HALF_LIFE_DAYS);
        let access = ((1.0 + c.memory.access_count as f64).ln() / 5.0).min(1.0);

        let mut score = W_RELEVANCE * c.relevance
            + W_RECENCY * recency
            + W_IMPORTANCE * c.memory.importance_score
            + W_ACCESS * access;
        if tech_persona
            && matches!(
                c.memory.memory_type,
                MemoryType::Skill | MemoryType::Error
            )
        {
            score *= PERSONA_BOOST;
        }
        c.score = score;
    }
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

/// Render candidates as markdown, hard-capped at `budget_tokens` (≈4 chars
/// per token).
fn format_block(
    candidates: &[Candidate],
    episodes: &[Episode],
    attachments: &[crate::types::Attachment],
    budget_tokens: usize,
) -> String {
    if candidates.is_empty() && episodes.is_empty() && attachments.is_empty() {
        return String::new();
    }
    let budget_chars = budget_tokens * 4;
    let mut out = String::from("## Relevant memories\n");

    for c in candidates {
        let line = format!(
            "- [{}] {} (importance {:.1})\n",
            c.memory.memory_type, c.memory.content, c.memory.importance_score
        );
        if out.len() + line.len() > budget_chars {
            return out;
        }
        out.push_str(&line);
    }

    if !episodes.is_empty() {
        let header = "\n### Past episodes\n";
        if out.len() + header.len() > budget_chars {
            return out;
        }
        out.push_str(header);
        for ep in episodes {
            let line = format!(
                "- {} [{}] ({})\n",
                ep.summary,
                ep.outcome,
                ep.started_at.format("%Y-%m-%d")
            );
            if out.len() + line.len() > budget_chars {
                return out;
            }
            out.push_str(&line);
        }
    }

    if !attachments.is_empty() {
        let header = "\n### Matching files\n";
        if out.len() + header.len() > budget_chars {
            return out;
        }
        out.push_str(header);
        for att in attachments {
            let desc = att.description.as_deref().unwrap_or("");
            let line = format!("- {} ({}) {}\n", att.filename, att.mime_type, desc);
            if out.len() + line.len() > budget_chars {
                return out;
            }
            out.push_str(&line);
        }
    }

    out
}
