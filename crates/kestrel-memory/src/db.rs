//! Schema init and migration for the memory database.
//!
//! One SQLite file in WAL mode with a 5 s busy timeout. FTS5 virtual tables
//! mirror `memories` and `attachments` via insert/update/delete triggers, so
//! the index can never drift from the source rows.
//!
//! `_schema_meta.version` gates migrations: version 1 → 2 added the
//! subject/predicate/confidence/decay columns with idempotent `ALTER TABLE`s.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 2;

/// Open a connection with the standard pragmas applied.
pub fn open(path: &std::path::Path) -> Result<Connection> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    init_db(&conn)?;
    Ok(conn)
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    apply_pragmas(&conn)?;
    init_db(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}

/// Initialise tables, FTS mirrors, and triggers. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    let version = schema_version(conn)?;
    if version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if version < SCHEMA_VERSION {
        migrate(conn, version)?;
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i64> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _schema_meta (key TEXT PRIMARY KEY, value TEXT)",
        [],
    )?;
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM _schema_meta WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .ok();
    Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO _schema_meta (key, value) VALUES ('version', ?1)",
        [version.to_string()],
    )?;
    Ok(())
}

fn migrate(conn: &Connection, from: i64) -> Result<()> {
    info!(from, to = SCHEMA_VERSION, "migrating memory schema");
    if from < 2 {
        migrate_v1_to_v2(conn)?;
    }
    // Pick up tables, indexes, and triggers added since `from` (all guarded
    // by IF NOT EXISTS), then resync the FTS mirror with the new columns.
    create_tables(conn)?;
    conn.execute_batch("INSERT INTO memories_fts(memories_fts) VALUES('rebuild');")?;
    set_schema_version(conn, SCHEMA_VERSION)
}

/// v1 → v2: richer semantic-memory columns. Each ALTER is tolerated failing
/// ("duplicate column") so a half-applied migration can be re-run safely.
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    const NEW_COLUMNS: &[(&str, &str)] = &[
        ("subject", "TEXT"),
        ("predicate", "TEXT"),
        ("confidence", "REAL NOT NULL DEFAULT 0.8"),
        ("decay_rate", "REAL NOT NULL DEFAULT 0.05"),
        ("last_accessed_at", "TEXT"),
        ("superseded_by", "TEXT"),
        ("source_episode_id", "TEXT"),
    ];
    for (name, def) in NEW_COLUMNS {
        let _ = conn.execute(&format!("ALTER TABLE memories ADD COLUMN {name} {def}"), []);
    }
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memories (
            id                TEXT PRIMARY KEY,
            content           TEXT NOT NULL,
            type              TEXT NOT NULL,
            priority          TEXT NOT NULL DEFAULT 'short_term',
            subject           TEXT,
            predicate         TEXT,
            importance_score  REAL NOT NULL DEFAULT 0.5,
            confidence        REAL NOT NULL DEFAULT 0.8,
            access_count      INTEGER NOT NULL DEFAULT 0,
            decay_rate        REAL NOT NULL DEFAULT 0.05,
            tags              TEXT NOT NULL DEFAULT '[]',
            source            TEXT NOT NULL DEFAULT 'conversation',
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            last_accessed_at  TEXT,
            expires_at        TEXT,
            superseded_by     TEXT,
            source_episode_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_memories_type       ON memories(type);
        CREATE INDEX IF NOT EXISTS idx_memories_priority   ON memories(priority);
        CREATE INDEX IF NOT EXISTS idx_memories_created    ON memories(created_at);
        CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance_score);
        CREATE INDEX IF NOT EXISTS idx_memories_subject    ON memories(subject);

        CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
            content, subject, predicate, tags,
            content='memories', content_rowid='rowid'
        );
        CREATE TRIGGER IF NOT EXISTS memories_fts_ai AFTER INSERT ON memories BEGIN
            INSERT INTO memories_fts(rowid, content, subject, predicate, tags)
            VALUES (new.rowid, new.content, new.subject, new.predicate, new.tags);
        END;
        CREATE TRIGGER IF NOT EXISTS memories_fts_ad AFTER DELETE ON memories BEGIN
            INSERT INTO memories_fts(memories_fts, rowid, content, subject, predicate, tags)
            VALUES ('delete', old.rowid, old.content, old.subject, old.predicate, old.tags);
        END;
        CREATE TRIGGER IF NOT EXISTS memories_fts_au AFTER UPDATE ON memories BEGIN
            INSERT INTO memories_fts(memories_fts, rowid, content, subject, predicate, tags)
            VALUES ('delete', old.rowid, old.content, old.subject, old.predicate, old.tags);
            INSERT INTO memories_fts(rowid, content, subject, predicate, tags)
            VALUES (new.rowid, new.content, new.subject, new.predicate, new.tags);
        END;

        CREATE TABLE IF NOT EXISTS episodes (
            id                TEXT PRIMARY KEY,
            session_id        TEXT NOT NULL,
            summary           TEXT NOT NULL,
            goal              TEXT NOT NULL DEFAULT '',
            outcome           TEXT NOT NULL DEFAULT 'completed',
            started_at        TEXT NOT NULL,
            ended_at          TEXT NOT NULL,
            action_nodes      TEXT NOT NULL DEFAULT '[]',
            entities          TEXT NOT NULL DEFAULT '[]',
            tools_used        TEXT NOT NULL DEFAULT '[]',
            linked_memory_ids TEXT NOT NULL DEFAULT '[]',
            importance_score  REAL NOT NULL DEFAULT 0.5
        );
        CREATE INDEX IF NOT EXISTS idx_episodes_session ON episodes(session_id);
        CREATE INDEX IF NOT EXISTS idx_episodes_time    ON episodes(started_at);
        CREATE INDEX IF NOT EXISTS idx_episodes_outcome ON episodes(outcome);

        CREATE TABLE IF NOT EXISTS attachments (
            id             TEXT PRIMARY KEY,
            session_id     TEXT NOT NULL,
            episode_id     TEXT,
            filename       TEXT NOT NULL,
            mime_type      TEXT NOT NULL,
            local_path     TEXT,
            url            TEXT,
            direction      TEXT NOT NULL DEFAULT 'inbound',
            description    TEXT,
            transcription  TEXT,
            extracted_text TEXT,
            tags           TEXT NOT NULL DEFAULT '[]',
            memory_ids     TEXT NOT NULL DEFAULT '[]',
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_attach_session   ON attachments(session_id);
        CREATE INDEX IF NOT EXISTS idx_attach_mime      ON attachments(mime_type);
        CREATE INDEX IF NOT EXISTS idx_attach_direction ON attachments(direction);
        CREATE INDEX IF NOT EXISTS idx_attach_created   ON attachments(created_at);

        CREATE VIRTUAL TABLE IF NOT EXISTS attachments_fts USING fts5(
            filename, description, transcription, extracted_text, tags,
            content='attachments', content_rowid='rowid'
        );
        CREATE TRIGGER IF NOT EXISTS attachments_fts_ai AFTER INSERT ON attachments BEGIN
            INSERT INTO attachments_fts(rowid, filename, description, transcription, extracted_text, tags)
            VALUES (new.rowid, new.filename, new.description, new.transcription, new.extracted_text, new.tags);
        END;
        CREATE TRIGGER IF NOT EXISTS attachments_fts_ad AFTER DELETE ON attachments BEGIN
            INSERT INTO attachments_fts(attachments_fts, rowid, filename, description, transcription, extracted_text, tags)
            VALUES ('delete', old.rowid, old.filename, old.description, old.transcription, old.extracted_text, old.tags);
        END;
        CREATE TRIGGER IF NOT EXISTS attachments_fts_au AFTER UPDATE ON attachments BEGIN
            INSERT INTO attachments_fts(attachments_fts, rowid, filename, description, transcription, extracted_text, tags)
            VALUES ('delete', old.rowid, old.filename, old.description, old.transcription, old.extracted_text, old.tags);
            INSERT INTO attachments_fts(rowid, filename, description, transcription, extracted_text, tags)
            VALUES (new.rowid, new.filename, new.description, new.transcription, new.extracted_text, new.tags);
        END;

        CREATE TABLE IF NOT EXISTS conversation_turns (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id     TEXT NOT NULL,
            turn_index     INTEGER NOT NULL,
            role           TEXT NOT NULL,
            content        TEXT NOT NULL,
            tool_calls     TEXT,
            tool_results   TEXT,
            timestamp      TEXT NOT NULL,
            extracted      INTEGER NOT NULL DEFAULT 0,
            UNIQUE(session_id, turn_index)
        );
        CREATE INDEX IF NOT EXISTS idx_turns_session   ON conversation_turns(session_id);
        CREATE INDEX IF NOT EXISTS idx_turns_timestamp ON conversation_turns(timestamp);
        CREATE INDEX IF NOT EXISTS idx_turns_extracted ON conversation_turns(extracted);

        CREATE TABLE IF NOT EXISTS extraction_queue (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT NOT NULL,
            turn_index  INTEGER NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'pending',
            attempts    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_eq_status ON extraction_queue(status);

        CREATE TABLE IF NOT EXISTS scratchpad (
            user_id         TEXT PRIMARY KEY,
            content         TEXT NOT NULL DEFAULT '',
            active_projects TEXT NOT NULL DEFAULT '',
            current_focus   TEXT NOT NULL DEFAULT '',
            open_questions  TEXT NOT NULL DEFAULT '',
            next_steps      TEXT NOT NULL DEFAULT '',
            updated_at      TEXT
        );

        CREATE TABLE IF NOT EXISTS embedding_cache (
            content_hash TEXT PRIMARY KEY,
            embedding    BLOB NOT NULL,
            created_at   TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn fts_triggers_mirror_inserts() {
        let conn = open_in_memory().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO memories (id, content, type, created_at, updated_at)
             VALUES ('m1', 'the user prefers espresso', 'preference', ?1, ?1)",
            [&now],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'espresso'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM memories WHERE id = 'm1'", []).unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'espresso'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }

    #[test]
    fn v1_to_v2_migration_adds_columns() {
        let conn = Connection::open_in_memory().unwrap();
        // A minimal v1 memories table without the v2 columns.
        conn.execute_batch(
            "CREATE TABLE memories (
                id TEXT PRIMARY KEY, content TEXT NOT NULL, type TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'short_term',
                importance_score REAL NOT NULL DEFAULT 0.5,
                access_count INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',
                source TEXT NOT NULL DEFAULT 'conversation',
                created_at TEXT NOT NULL, updated_at TEXT NOT NULL,
                expires_at TEXT
            );
            CREATE TABLE _schema_meta (key TEXT PRIMARY KEY, value TEXT);
            INSERT INTO _schema_meta VALUES ('version', '1');",
        )
        .unwrap();

        init_db(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 2);
        // The new column exists and is queryable.
        let n: i64 = conn
            .query_row("SELECT COUNT(subject) FROM memories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
        // Running it again is harmless.
        init_db(&conn).unwrap();
    }
}
