//! Turn-level memory extraction.
//!
//! Salient turns go through a lightweight model call that emits 0–3
//! candidates as a constrained JSON array (or the sentinel `NONE`).
//! Candidates pass string dedup, then a semantic dedup built from FTS
//! candidates plus cosine distance over term-frequency vectors. Survivors
//! become `memories` rows. Both user and assistant turns are candidates —
//! the model decides what is worth keeping.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;
use crate::manager::SummaryModel;
use crate::store::MemoryStore;
use crate::types::{MemoryCandidate, MemoryType, SemanticMemory};

/// Below this cosine distance two contents are the same memory.
pub const SEMANTIC_DUP_DISTANCE: f64 = 0.12;
/// Turns shorter than this are never worth a model call.
const MIN_SALIENT_CHARS: usize = 20;

const EXTRACTION_SYSTEM: &str = "You extract durable knowledge from a single conversation turn. \
Return ONLY a JSON array of at most 3 items, each: \
{\"type\": \"fact|preference|skill|error|rule|context\", \"content\": \"one sentence\", \
\"importance\": 0.5-1.0}. \
Keep only things worth remembering weeks later: stable facts about the user, stated \
preferences, lessons from errors, standing instructions. \
If nothing qualifies, return exactly NONE.";

fn greeting_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(hi|hello|hey|yo|ok|okay|thanks|thank you|good (morning|evening|night)|早|你好|谢谢)[\s!.,?]*$")
            .unwrap()
    })
}

/// Is this turn worth feeding to the extraction model at all?
pub fn is_salient(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.len() < MIN_SALIENT_CHARS {
        return false;
    }
    if trimmed.starts_with('/') {
        return false;
    }
    !greeting_re().is_match(trimmed)
}

/// Ask the model for candidates from one turn. `NONE` and malformed output
/// both yield an empty list; a bad extraction never blocks the turn.
pub async fn extract_candidates(
    model: &dyn SummaryModel,
    role: &str,
    content: &str,
) -> Result<Vec<MemoryCandidate>> {
    let prompt = format!("[{role}] {content}");
    let raw = model.complete(EXTRACTION_SYSTEM, &prompt).await?;
    Ok(parse_candidates(&raw))
}

/// Parse the model's reply: a JSON array, possibly wrapped in a code fence,
/// or the sentinel `NONE`.
pub fn parse_candidates(raw: &str) -> Vec<MemoryCandidate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    let json_str = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(s), Some(e)) if e > s => &trimmed[s..=e],
        _ => return Vec::new(),
    };
    let mut candidates: Vec<MemoryCandidate> =
        serde_json::from_str(json_str).unwrap_or_default();
    candidates.truncate(3);
    for c in &mut candidates {
        c.importance = c.importance.clamp(0.5, 1.0);
    }
    candidates.retain(|c| !c.content.trim().is_empty());
    candidates
}

/// The outcome of trying to add one candidate.
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added(String),
    /// An equivalent memory already exists; its confidence was bumped.
    Duplicate(String),
}

/// Cosine distances in this band are too close to call deterministically;
/// when a model is available they go to the duplicate oracle.
const ORACLE_BAND_MAX: f64 = 0.35;

const ORACLE_SYSTEM: &str = "You judge whether two short memory statements record the same fact. \
Paraphrases, reorderings and added filler are the SAME; different subjects, different values, or \
contradictions are DIFFERENT. Reply with exactly SAME or DIFFERENT.";

/// Async variant of [`add_with_dedup`]: deterministic dedup first, then the
/// LLM duplicate oracle for borderline pairs. Oracle failures fall back to
/// "not a duplicate".
pub async fn add_with_dedup_oracle(
    store: &MemoryStore,
    model: Option<&dyn SummaryModel>,
    candidate: &MemoryCandidate,
    source: &str,
    source_episode_id: Option<&str>,
) -> Result<AddOutcome> {
    if let Some(existing_id) = find_duplicate(store, &candidate.content)? {
        if let Some(existing) = store.get_memory(&existing_id)? {
            store.update_confidence(&existing_id, (existing.confidence + 0.1).min(1.0))?;
        }
        return Ok(AddOutcome::Duplicate(existing_id));
    }

    if let Some(model) = model {
        if let Some(borderline) = find_borderline(store, &candidate.content)? {
            if let Some(existing) = store.get_memory(&borderline)? {
                let prompt =
                    format!("A: {}\nB: {}", existing.content, candidate.content.trim());
                match model.complete(ORACLE_SYSTEM, &prompt).await {
                    Ok(reply) if reply.to_uppercase().contains("SAME") => {
                        store.update_confidence(
                            &borderline,
                            (existing.confidence + 0.1).min(1.0),
                        )?;
                        debug!(existing = %borderline, "oracle confirmed duplicate");
                        return Ok(AddOutcome::Duplicate(borderline));
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "duplicate oracle failed, keeping candidate"),
                }
            }
        }
    }

    add_with_dedup(store, candidate, source, source_episode_id)
}

/// The closest stored memory whose distance falls in the oracle band.
fn find_borderline(store: &MemoryStore, content: &str) -> Result<Option<String>> {
    let normalized = strip_common_prefixes(content);
    let query = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" OR ");
    if query.is_empty() {
        return Ok(None);
    }
    let new_vector = cached_vector(store, &normalized);
    let mut best: Option<(String, f64)> = None;
    for (mem, _) in store.search_memories(&query, 8)? {
        let existing = cached_vector(store, &strip_common_prefixes(&mem.content));
        let distance = cosine_distance(&new_vector, &existing);
        if distance >= SEMANTIC_DUP_DISTANCE && distance < ORACLE_BAND_MAX {
            match &best {
                Some((_, d)) if *d <= distance => {}
                _ => best = Some((mem.id, distance)),
            }
        }
    }
    Ok(best.map(|(id, _)| id))
}

/// Write a candidate through the dedup pipeline.
pub fn add_with_dedup(
    store: &MemoryStore,
    candidate: &MemoryCandidate,
    source: &str,
    source_episode_id: Option<&str>,
) -> Result<AddOutcome> {
    if let Some(existing_id) = find_duplicate(store, &candidate.content)? {
        if let Some(existing) = store.get_memory(&existing_id)? {
            store.update_confidence(&existing_id, (existing.confidence + 0.1).min(1.0))?;
        }
        debug!(existing = %existing_id, "memory candidate deduplicated");
        return Ok(AddOutcome::Duplicate(existing_id));
    }

    let memory_type: MemoryType = candidate
        .memory_type
        .parse()
        .unwrap_or(MemoryType::Context);
    let mut mem = SemanticMemory::new(candidate.content.trim(), memory_type);
    mem.importance_score = candidate.importance;
    mem.source = source.to_string();
    mem.source_episode_id = source_episode_id.map(String::from);
    store.save_memory(&mem)?;
    Ok(AddOutcome::Added(mem.id))
}

/// Exact match first, then FTS candidates scored by cosine distance over
/// term-frequency vectors (common lead-in prefixes stripped before
/// vectorizing, so "user prefers X" and "prefers X" compare equal).
pub fn find_duplicate(store: &MemoryStore, content: &str) -> Result<Option<String>> {
    let normalized = strip_common_prefixes(content);
    // OR-recall: any shared token makes a row a candidate; the cosine check
    // below does the precise comparison.
    let query = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" OR ");
    if query.is_empty() {
        return Ok(None);
    }
    let candidates = store.search_memories(&query, 8)?;
    let new_vector = cached_vector(store, &normalized);
    for (mem, _) in candidates {
        if mem.content.trim() == content.trim() {
            return Ok(Some(mem.id));
        }
        let existing = cached_vector(store, &strip_common_prefixes(&mem.content));
        if cosine_distance(&new_vector, &existing) < SEMANTIC_DUP_DISTANCE {
            return Ok(Some(mem.id));
        }
    }
    Ok(None)
}

/// Term vector for `normalized` content, going through the embedding cache
/// so repeated dedup passes don't re-vectorize the same rows.
fn cached_vector(store: &MemoryStore, normalized: &str) -> HashMap<String, f64> {
    let hash = content_hash(normalized);
    if let Ok(Some(blob)) = store.get_cached_embedding(&hash) {
        if let Ok(v) = serde_json::from_slice::<HashMap<String, f64>>(&blob) {
            return v;
        }
    }
    let vector = term_vector(normalized);
    if let Ok(blob) = serde_json::to_vec(&vector) {
        let _ = store.save_cached_embedding(&hash, &blob);
    }
    vector
}

/// Lead-ins that carry no meaning for similarity.
fn strip_common_prefixes(content: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)^(the\s+)?user\s+(prefers|likes|uses|wants|is|has|said)\s+").unwrap()
    });
    re.replace(content.trim(), "").to_lowercase()
}

fn term_vector(text: &str) -> HashMap<String, f64> {
    let mut v: HashMap<String, f64> = HashMap::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        *v.entry(token.to_lowercase()).or_insert(0.0) += 1.0;
    }
    v
}

fn cosine_distance(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 1.0;
    }
    let dot: f64 = a
        .iter()
        .filter_map(|(k, va)| b.get(k).map(|vb| va * vb))
        .sum();
    let norm_a: f64 = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

/// SHA-256 hex digest for the embedding cache key.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salience_filter() {
        assert!(!is_salient("hi"));
        assert!(!is_salient("thanks!"));
        assert!(!is_salient("/model qwen"));
        assert!(is_salient("I always deploy on Fridays, never remind me on weekends"));
    }

    #[test]
    fn parse_candidates_variants() {
        assert!(parse_candidates("NONE").is_empty());
        assert!(parse_candidates("  none  ").is_empty());
        assert!(parse_candidates("garbage with no array").is_empty());

        let parsed = parse_candidates(
            r#"Here you go:
```json
[{"type": "preference", "content": "user deploys on Fridays", "importance": 0.3}]
```"#,
        );
        assert_eq!(parsed.len(), 1);
        // Importance is clamped into [0.5, 1.0].
        assert!(parsed[0].importance >= 0.5);
    }

    #[test]
    fn exact_duplicate_detected() {
        let store = MemoryStore::open_in_memory().unwrap();
        let cand = MemoryCandidate {
            memory_type: "preference".into(),
            content: "user prefers dark roast coffee".into(),
            importance: 0.7,
        };
        let first = add_with_dedup(&store, &cand, "test", None).unwrap();
        assert!(matches!(first, AddOutcome::Added(_)));

        let second = add_with_dedup(&store, &cand, "test", None).unwrap();
        assert!(matches!(second, AddOutcome::Duplicate(_)));
        assert_eq!(store.count_memories(None).unwrap(), 1);
    }

    #[test]
    fn near_duplicate_detected_after_prefix_strip() {
        let store = MemoryStore::open_in_memory().unwrap();
        let a = MemoryCandidate {
            memory_type: "preference".into(),
            content: "user prefers dark roast coffee beans".into(),
            importance: 0.7,
        };
        add_with_dedup(&store, &a, "test", None).unwrap();

        let b = MemoryCandidate {
            memory_type: "preference".into(),
            content: "The user likes dark roast coffee beans".into(),
            importance: 0.7,
        };
        let outcome = add_with_dedup(&store, &b, "test", None).unwrap();
        assert!(matches!(outcome, AddOutcome::Duplicate(_)));
    }

    #[test]
    fn different_content_both_kept() {
        let store = MemoryStore::open_in_memory().unwrap();
        let a = MemoryCandidate {
            memory_type: "fact".into(),
            content: "user works at a robotics startup".into(),
            importance: 0.8,
        };
        let b = MemoryCandidate {
            memory_type: "preference".into(),
            content: "user prefers meetings before noon".into(),
            importance: 0.6,
        };
        assert!(matches!(
            add_with_dedup(&store, &a, "test", None).unwrap(),
            AddOutcome::Added(_)
        ));
        assert!(matches!(
            add_with_dedup(&store, &b, "test", None).unwrap(),
            AddOutcome::Added(_)
        ));
        assert_eq!(store.count_memories(None).unwrap(), 2);
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }

    struct OracleModel(&'static str);

    #[async_trait::async_trait]
    impl SummaryModel for OracleModel {
        async fn complete(&self, _system: &str, _prompt: &str) -> crate::error::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn oracle_resolves_borderline_pairs() {
        let store = MemoryStore::open_in_memory().unwrap();
        let first = MemoryCandidate {
            memory_type: "rule".into(),
            content: "user ships releases on friday evenings".into(),
            importance: 0.8,
        };
        add_with_dedup(&store, &first, "test", None).unwrap();

        // Close but not identical: outside the deterministic threshold,
        // inside the oracle band.
        let second = MemoryCandidate {
            memory_type: "rule".into(),
            content: "user ships releases on friday nights".into(),
            importance: 0.8,
        };

        // Oracle says SAME → deduplicated.
        let outcome = add_with_dedup_oracle(
            &store,
            Some(&OracleModel("SAME")),
            &second,
            "test",
            None,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, AddOutcome::Duplicate(_)));
        assert_eq!(store.count_memories(None).unwrap(), 1);

        // Oracle says DIFFERENT → both kept.
        let outcome = add_with_dedup_oracle(
            &store,
            Some(&OracleModel("DIFFERENT")),
            &second,
            "test",
            None,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, AddOutcome::Added(_)));
        assert_eq!(store.count_memories(None).unwrap(), 2);
    }
}
