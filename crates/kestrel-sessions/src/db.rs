use rusqlite::Connection;

use crate::error::Result;

/// Initialise the session archive table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS session_archive (
            session_key TEXT PRIMARY KEY,
            id          TEXT NOT NULL,
            channel     TEXT NOT NULL,
            chat_id     TEXT NOT NULL,
            user_id     TEXT NOT NULL,
            history     TEXT NOT NULL DEFAULT '[]',
            last_active TEXT NOT NULL,
            closed_at   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_archive_last_active
            ON session_archive(last_active DESC);",
    )?;
    Ok(())
}
