//! All SQL against the memory database lives here.
//!
//! One connection guarded by a `Mutex`; WAL mode keeps readers concurrent.
//! Everything returns owned rows — callers never hold the lock.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::db;
use crate::error::{MemoryError, Result};
use crate::types::*;

pub struct MemoryStore {
    conn: Mutex<Connection>,
}

const MEMORY_COLUMNS: &str = "id, content, type, priority, subject, predicate, importance_score, \
     confidence, access_count, decay_rate, tags, source, created_at, updated_at, \
     last_accessed_at, expires_at, superseded_by, source_episode_id";

impl MemoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open_in_memory()?),
        })
    }

    // ------------------------------------------------------------------
    // Semantic memories
    // ------------------------------------------------------------------

    pub fn save_memory(&self, mem: &SemanticMemory) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO memories
             (id, content, type, priority, subject, predicate, importance_score,
              confidence, access_count, decay_rate, tags, source, created_at,
              updated_at, last_accessed_at, expires_at, superseded_by, source_episode_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            rusqlite::params![
                mem.id,
                mem.content,
                mem.memory_type.as_str(),
                mem.priority.as_str(),
                mem.subject,
                mem.predicate,
                mem.importance_score,
                mem.confidence,
                mem.access_count,
                mem.decay_rate,
                serde_json::to_string(&mem.tags)?,
                mem.source,
                mem.created_at.to_rfc3339(),
                mem.updated_at.to_rfc3339(),
                mem.last_accessed_at.map(|d| d.to_rfc3339()),
                mem.expires_at.map(|d| d.to_rfc3339()),
                mem.superseded_by,
                mem.source_episode_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<SemanticMemory>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
        match conn.query_row(&sql, [id], row_to_memory) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM memories WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    /// Memories of one type/priority, superseded rows excluded.
    pub fn query_memories(
        &self,
        memory_type: Option<MemoryType>,
        priority: Option<MemoryPriority>,
        limit: usize,
    ) -> Result<Vec<SemanticMemory>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE superseded_by IS NULL"
        );
        let mut params: Vec<String> = Vec::new();
        if let Some(t) = memory_type {
            params.push(t.as_str().to_string());
            sql.push_str(&format!(" AND type = ?{}", params.len()));
        }
        if let Some(p) = priority {
            params.push(p.as_str().to_string());
            sql.push_str(&format!(" AND priority = ?{}", params.len()));
        }
        params.push(limit.to_string());
        sql.push_str(&format!(
            " ORDER BY importance_score DESC, updated_at DESC LIMIT ?{}",
            params.len()
        ));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count_memories(&self, memory_type: Option<MemoryType>) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = match memory_type {
            Some(t) => conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE type = ?1 AND superseded_by IS NULL",
                [t.as_str()],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE superseded_by IS NULL",
                [],
                |r| r.get(0),
            )?,
        };
        Ok(n)
    }

    /// FTS5 search with BM25 ranking. Returns (memory, rank) pairs — rank is
    /// more negative for better matches, as SQLite reports it.
    pub fn search_memories(&self, query: &str, limit: usize) -> Result<Vec<(SemanticMemory, f64)>> {
        let sanitized = sanitize_fts_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {cols}, rank FROM memories m
             JOIN memories_fts f ON m.rowid = f.rowid
             WHERE memories_fts MATCH ?1 AND m.superseded_by IS NULL
             ORDER BY rank LIMIT ?2",
            cols = MEMORY_COLUMNS
                .split(", ")
                .map(|c| format!("m.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![sanitized, limit as i64], |row| {
            let mem = row_to_memory(row)?;
            let rank: f64 = row.get(18)?;
            Ok((mem, rank))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Recently-touched memories above an importance floor.
    pub fn recent_memories(
        &self,
        min_importance: f64,
        limit: usize,
    ) -> Result<Vec<SemanticMemory>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE superseded_by IS NULL AND importance_score >= ?1
             ORDER BY COALESCE(last_accessed_at, updated_at) DESC
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![min_importance, limit as i64],
            row_to_memory,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Bump access stats after a retrieval hit.
    pub fn touch_memory(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1
             WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn set_memory_priority(&self, id: &str, priority: MemoryPriority) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE memories SET priority = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![priority.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn mark_superseded(&self, id: &str, by: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE memories SET superseded_by = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![by, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn update_confidence(&self, id: &str, confidence: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE memories SET confidence = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![confidence, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Delete memories whose `expires_at` has passed. Returns how many.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM memories WHERE expires_at IS NOT NULL AND expires_at < ?1",
            [Utc::now().to_rfc3339()],
        )?;
        Ok(n)
    }

    /// Dump every memory row as JSON to `path`. Returns the row count.
    pub fn export_json(&self, path: &Path) -> Result<usize> {
        let memories = self.query_memories(None, None, usize::MAX >> 1)?;
        let json = serde_json::to_string_pretty(&memories)?;
        std::fs::write(path, json)?;
        Ok(memories.len())
    }

    // ------------------------------------------------------------------
    // Episodes
    // ------------------------------------------------------------------

    pub fn save_episode(&self, ep: &Episode) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO episodes
             (id, session_id, summary, goal, outcome, started_at, ended_at,
              action_nodes, entities, tools_used, linked_memory_ids, importance_score)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            rusqlite::params![
                ep.id,
                ep.session_id,
                ep.summary,
                ep.goal,
                ep.outcome.as_str(),
                ep.started_at.to_rfc3339(),
                ep.ended_at.to_rfc3339(),
                ep.action_nodes.to_string(),
                serde_json::to_string(&ep.entities)?,
                serde_json::to_string(&ep.tools_used)?,
                serde_json::to_string(&ep.linked_memory_ids)?,
                ep.importance_score,
            ],
        )?;
        Ok(())
    }

    pub fn get_episode(&self, id: &str) -> Result<Option<Episode>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT id, session_id, summary, goal, outcome, started_at, ended_at,
                    action_nodes, entities, tools_used, linked_memory_ids, importance_score
             FROM episodes WHERE id = ?1",
            [id],
            row_to_episode,
        ) {
            Ok(e) => Ok(Some(e)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    pub fn count_episodes(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM episodes", [], |r| r.get(0))?)
    }

    /// Keyword scan over the entity / tool-name columns.
    pub fn search_episodes(&self, keywords: &[String], limit: usize) -> Result<Vec<Episode>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let mut clauses = Vec::new();
        let mut params: Vec<String> = Vec::new();
        for kw in keywords {
            params.push(format!("%{}%", kw.to_lowercase()));
            let i = params.len();
            clauses.push(format!(
                "(LOWER(entities) LIKE ?{i} OR LOWER(tools_used) LIKE ?{i} OR LOWER(summary) LIKE ?{i})"
            ));
        }
        params.push(limit.to_string());
        let sql = format!(
            "SELECT id, session_id, summary, goal, outcome, started_at, ended_at,
                    action_nodes, entities, tools_used, linked_memory_ids, importance_score
             FROM episodes WHERE {} ORDER BY started_at DESC LIMIT ?{}",
            clauses.join(" OR "),
            params.len()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), row_to_episode)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Conversation turns
    // ------------------------------------------------------------------

    /// Append a turn. The index is computed inside the INSERT as
    /// `MAX(turn_index) + 1` so a restarted process never collides.
    pub fn save_turn(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<&str>,
        tool_results: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_turns
             (session_id, turn_index, role, content, tool_calls, tool_results, timestamp, extracted)
             VALUES (?1,
                     (SELECT COALESCE(MAX(turn_index), -1) + 1 FROM conversation_turns WHERE session_id = ?1),
                     ?2, ?3, ?4, ?5, ?6, 0)",
            rusqlite::params![
                session_id,
                role,
                content,
                tool_calls,
                tool_results,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let idx = conn.query_row(
            "SELECT MAX(turn_index) FROM conversation_turns WHERE session_id = ?1",
            [session_id],
            |r| r.get(0),
        )?;
        Ok(idx)
    }

    pub fn get_unextracted_turns(&self, limit: usize) -> Result<Vec<ConversationTurn>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, turn_index, role, content, tool_calls, tool_results, timestamp, extracted
             FROM conversation_turns WHERE extracted = 0
             ORDER BY session_id, turn_index LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_turn)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn mark_turns_extracted(&self, session_id: &str, turn_indices: &[i64]) -> Result<()> {
        if turn_indices.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = (2..=turn_indices.len() + 1)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "UPDATE conversation_turns SET extracted = 1
             WHERE session_id = ?1 AND turn_index IN ({placeholders})"
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(session_id.to_string())];
        for idx in turn_indices {
            params.push(Box::new(*idx));
        }
        conn.execute(
            &sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
        )?;
        Ok(())
    }

    pub fn get_session_turns(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, turn_index, role, content, tool_calls, tool_results, timestamp, extracted
             FROM conversation_turns WHERE session_id = ?1 ORDER BY turn_index",
        )?;
        let rows = stmt.query_map([session_id], row_to_turn)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, turn_index, role, content, tool_calls, tool_results, timestamp, extracted
             FROM conversation_turns WHERE session_id = ?1
             ORDER BY turn_index DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id, limit as i64], row_to_turn)?;
        let mut turns: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        turns.reverse();
        Ok(turns)
    }

    // ------------------------------------------------------------------
    // Extraction queue
    // ------------------------------------------------------------------

    pub fn enqueue_extraction(
        &self,
        session_id: &str,
        turn_index: i64,
        role: &str,
        content: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO extraction_queue
             (session_id, turn_index, role, content, status, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
            rusqlite::params![session_id, turn_index, role, content, now],
        )?;
        Ok(())
    }

    /// Atomically claim up to `batch` pending items: SELECT then UPDATE to
    /// `processing` (attempts + 1) inside one transaction.
    pub fn dequeue_extraction(&self, batch: usize) -> Result<Vec<ExtractionItem>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let items: Vec<ExtractionItem> = {
            let mut stmt = tx.prepare(
                "SELECT id, session_id, turn_index, role, content, attempts
                 FROM extraction_queue
                 WHERE status = 'pending' AND attempts < 3
                 ORDER BY id LIMIT ?1",
            )?;
            let rows = stmt.query_map([batch as i64], |row| {
                Ok(ExtractionItem {
                    queue_id: row.get(0)?,
                    session_id: row.get(1)?,
                    turn_index: row.get(2)?,
                    role: row.get(3)?,
                    content: row.get(4)?,
                    attempts: row.get(5)?,
                })
            })?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let now = Utc::now().to_rfc3339();
        for item in &items {
            tx.execute(
                "UPDATE extraction_queue
                 SET status = 'processing', attempts = attempts + 1, updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, item.queue_id],
            )?;
        }
        tx.commit()?;
        Ok(items)
    }

    /// Resolve a claimed item: `completed` on success; on failure, back to
    /// `pending` until the third attempt, then `failed` for good.
    pub fn complete_extraction(&self, queue_id: i64, success: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        if success {
            conn.execute(
                "UPDATE extraction_queue SET status = 'completed', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, queue_id],
            )?;
        } else {
            conn.execute(
                "UPDATE extraction_queue
                 SET status = CASE WHEN attempts >= 3 THEN 'failed' ELSE 'pending' END,
                     updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, queue_id],
            )?;
        }
        Ok(())
    }

    pub fn pending_extraction_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM extraction_queue WHERE status = 'pending'",
            [],
            |r| r.get(0),
        )?)
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    pub fn save_attachment(&self, att: &Attachment) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO attachments
             (id, session_id, episode_id, filename, mime_type, local_path, url,
              direction, description, transcription, extracted_text, tags, memory_ids, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            rusqlite::params![
                att.id,
                att.session_id,
                att.episode_id,
                att.filename,
                att.mime_type,
                att.local_path,
                att.url,
                att.direction.as_str(),
                att.description,
                att.transcription,
                att.extracted_text,
                serde_json::to_string(&att.tags)?,
                serde_json::to_string(&att.memory_ids)?,
                att.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn search_attachments(&self, keywords: &[String], limit: usize) -> Result<Vec<Attachment>> {
        let query = sanitize_fts_query(&keywords.join(" "));
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.session_id, a.episode_id, a.filename, a.mime_type, a.local_path,
                    a.url, a.direction, a.description, a.transcription, a.extracted_text,
                    a.tags, a.memory_ids, a.created_at
             FROM attachments a
             JOIN attachments_fts f ON a.rowid = f.rowid
             WHERE attachments_fts MATCH ?1
             ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![query, limit as i64], row_to_attachment)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Attachments older than `max_age_days` with nothing extracted from
    /// them and no memory links — candidates for cleanup.
    pub fn stale_attachments(&self, max_age_days: i64) -> Result<Vec<Attachment>> {
        let cutoff = (Utc::now() - chrono::Duration::days(max_age_days)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, episode_id, filename, mime_type, local_path, url,
                    direction, description, transcription, extracted_text, tags, memory_ids, created_at
             FROM attachments
             WHERE created_at < ?1
               AND (description IS NULL OR description = '')
               AND (transcription IS NULL OR transcription = '')
               AND (extracted_text IS NULL OR extracted_text = '')
               AND memory_ids = '[]'",
        )?;
        let rows = stmt.query_map([cutoff], row_to_attachment)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_attachment(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM attachments WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    // ------------------------------------------------------------------
    // Scratchpad
    // ------------------------------------------------------------------

    pub fn get_scratchpad(&self, user_id: &str) -> Result<Option<Scratchpad>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT user_id, content, active_projects, current_focus, open_questions,
                    next_steps, updated_at
             FROM scratchpad WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok(Scratchpad {
                    user_id: row.get(0)?,
                    content: row.get(1)?,
                    active_projects: row.get(2)?,
                    current_focus: row.get(3)?,
                    open_questions: row.get(4)?,
                    next_steps: row.get(5)?,
                    updated_at: parse_ts_opt(row.get::<_, Option<String>>(6)?),
                })
            },
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    pub fn save_scratchpad(&self, pad: &Scratchpad) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO scratchpad
             (user_id, content, active_projects, current_focus, open_questions, next_steps, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                pad.user_id,
                pad.content,
                pad.active_projects,
                pad.current_focus,
                pad.open_questions,
                pad.next_steps,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Embedding cache
    // ------------------------------------------------------------------

    pub fn get_cached_embedding(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT embedding FROM embedding_cache WHERE content_hash = ?1",
            [content_hash],
            |row| row.get(0),
        ) {
            Ok(blob) => Ok(Some(blob)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    pub fn save_cached_embedding(&self, content_hash: &str, embedding: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO embedding_cache (content_hash, embedding, created_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![content_hash, embedding, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping & helpers
// ---------------------------------------------------------------------------

/// FTS5 treats most punctuation as syntax; keep only word tokens and quote
/// nothing — a bad query must degrade to "no results", not an error.
pub fn sanitize_fts_query(query: &str) -> String {
    let tokens: Vec<&str> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .collect();
    tokens.join(" ")
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(parse_ts)
}

fn parse_json_list(s: String) -> Vec<String> {
    serde_json::from_str(&s).unwrap_or_default()
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<SemanticMemory> {
    let type_str: String = row.get(2)?;
    let priority_str: String = row.get(3)?;
    Ok(SemanticMemory {
        id: row.get(0)?,
        content: row.get(1)?,
        memory_type: type_str.parse().unwrap_or(MemoryType::Context),
        priority: priority_str.parse().unwrap_or(MemoryPriority::ShortTerm),
        subject: row.get(4)?,
        predicate: row.get(5)?,
        importance_score: row.get(6)?,
        confidence: row.get(7)?,
        access_count: row.get(8)?,
        decay_rate: row.get(9)?,
        tags: parse_json_list(row.get(10)?),
        source: row.get(11)?,
        created_at: parse_ts(row.get(12)?),
        updated_at: parse_ts(row.get(13)?),
        last_accessed_at: parse_ts_opt(row.get(14)?),
        expires_at: parse_ts_opt(row.get(15)?),
        superseded_by: row.get(16)?,
        source_episode_id: row.get(17)?,
    })
}

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let outcome_str: String = row.get(4)?;
    let action_nodes: String = row.get(7)?;
    Ok(Episode {
        id: row.get(0)?,
        session_id: row.get(1)?,
        summary: row.get(2)?,
        goal: row.get(3)?,
        outcome: outcome_str.parse().unwrap_or(EpisodeOutcome::Completed),
        started_at: parse_ts(row.get(5)?),
        ended_at: parse_ts(row.get(6)?),
        action_nodes: serde_json::from_str(&action_nodes)
            .unwrap_or(serde_json::Value::Array(Vec::new())),
        entities: parse_json_list(row.get(8)?),
        tools_used: parse_json_list(row.get(9)?),
        linked_memory_ids: parse_json_list(row.get(10)?),
        importance_score: row.get(11)?,
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationTurn> {
    Ok(ConversationTurn {
        session_id: row.get(0)?,
        turn_index: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        tool_calls: row.get(4)?,
        tool_results: row.get(5)?,
        timestamp: parse_ts(row.get(6)?),
        extracted: row.get::<_, i64>(7)? != 0,
    })
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
    let direction: String = row.get(7)?;
    Ok(Attachment {
        id: row.get(0)?,
        session_id: row.get(1)?,
        episode_id: row.get(2)?,
        filename: row.get(3)?,
        mime_type: row.get(4)?,
        local_path: row.get(5)?,
        url: row.get(6)?,
        direction: if direction == "outbound" {
            AttachmentDirection::Outbound
        } else {
            AttachmentDirection::Inbound
        },
        description: row.get(8)?,
        transcription: row.get(9)?,
        extracted_text: row.get(10)?,
        tags: parse_json_list(row.get(11)?),
        memory_ids: parse_json_list(row.get(12)?),
        created_at: parse_ts(row.get(13)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    #[test]
    fn memory_round_trip() {
        let s = store();
        let mut mem = SemanticMemory::new("the user prefers rust", MemoryType::Preference);
        mem.subject = Some("user".into());
        mem.tags = vec!["language".into()];
        s.save_memory(&mem).unwrap();

        let back = s.get_memory(&mem.id).unwrap().unwrap();
        assert_eq!(back.content, mem.content);
        assert_eq!(back.memory_type, MemoryType::Preference);
        assert_eq!(back.tags, vec!["language".to_string()]);
    }

    #[test]
    fn fts_search_finds_and_ranks() {
        let s = store();
        s.save_memory(&SemanticMemory::new(
            "user works on the kestrel agent project",
            MemoryType::Fact,
        ))
        .unwrap();
        s.save_memory(&SemanticMemory::new(
            "user drinks tea in the morning",
            MemoryType::Fact,
        ))
        .unwrap();

        let hits = s.search_memories("kestrel project", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].0.content.contains("kestrel"));
    }

    #[test]
    fn superseded_memories_hidden_from_search() {
        let s = store();
        let old = SemanticMemory::new("user lives in Berlin", MemoryType::Fact);
        let new = SemanticMemory::new("user lives in Munich", MemoryType::Fact);
        s.save_memory(&old).unwrap();
        s.save_memory(&new).unwrap();
        s.mark_superseded(&old.id, &new.id).unwrap();

        let hits = s.search_memories("lives", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, new.id);
    }

    #[test]
    fn turn_indices_are_monotonic() {
        let s = store();
        let i0 = s.save_turn("sess-1", "user", "hello", None, None).unwrap();
        let i1 = s.save_turn("sess-1", "assistant", "hi", None, None).unwrap();
        let i2 = s.save_turn("sess-1", "user", "bye", None, None).unwrap();
        assert_eq!((i0, i1, i2), (0, 1, 2));

        // Another session starts from zero again.
        let other = s.save_turn("sess-2", "user", "hey", None, None).unwrap();
        assert_eq!(other, 0);
    }

    #[test]
    fn extraction_queue_lifecycle() {
        let s = store();
        s.enqueue_extraction("sess-1", 0, "user", "I use neovim daily").unwrap();

        let batch = s.dequeue_extraction(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].attempts, 0);

        // Failure before the third attempt goes back to pending.
        s.complete_extraction(batch[0].queue_id, false).unwrap();
        assert_eq!(s.pending_extraction_count().unwrap(), 1);

        // Two more failed rounds exhaust the retries.
        for _ in 0..2 {
            let batch = s.dequeue_extraction(10).unwrap();
            assert_eq!(batch.len(), 1);
            s.complete_extraction(batch[0].queue_id, false).unwrap();
        }
        assert_eq!(s.pending_extraction_count().unwrap(), 0);
        assert!(s.dequeue_extraction(10).unwrap().is_empty());
    }

    #[test]
    fn stale_attachment_detection() {
        let s = store();
        let mut att = Attachment {
            id: "a1".into(),
            session_id: "sess".into(),
            episode_id: None,
            filename: "photo.jpg".into(),
            mime_type: "image/jpeg".into(),
            local_path: None,
            url: None,
            direction: AttachmentDirection::Inbound,
            description: None,
            transcription: None,
            extracted_text: None,
            tags: Vec::new(),
            memory_ids: Vec::new(),
            created_at: Utc::now() - chrono::Duration::days(120),
        };
        s.save_attachment(&att).unwrap();

        // A described attachment of the same age is kept.
        att.id = "a2".into();
        att.description = Some("vacation photo".into());
        s.save_attachment(&att).unwrap();

        let stale = s.stale_attachments(90).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "a1");
    }

    #[test]
    fn scratchpad_round_trip() {
        let s = store();
        assert!(s.get_scratchpad("u1").unwrap().is_none());
        s.save_scratchpad(&Scratchpad {
            user_id: "u1".into(),
            content: "notes".into(),
            active_projects: "kestrel".into(),
            current_focus: "memory".into(),
            open_questions: String::new(),
            next_steps: "ship it".into(),
            updated_at: None,
        })
        .unwrap();
        let pad = s.get_scratchpad("u1").unwrap().unwrap();
        assert_eq!(pad.active_projects, "kestrel");
        assert!(pad.updated_at.is_some());
    }

    #[test]
    fn export_writes_all_rows_as_json() {
        let s = store();
        s.save_memory(&SemanticMemory::new("user prefers rust", MemoryType::Preference))
            .unwrap();
        s.save_memory(&SemanticMemory::new("user lives in Porto", MemoryType::Fact))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let n = s.export_json(&path).unwrap();
        assert_eq!(n, 2);

        let parsed: Vec<SemanticMemory> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn sanitize_strips_fts_syntax() {
        assert_eq!(sanitize_fts_query("what's \"this\" AND (that)?"), "what s this AND that");
        assert_eq!(sanitize_fts_query("!!!"), "");
    }
}
