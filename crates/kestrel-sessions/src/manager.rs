//! Thread-safe session registry.
//!
//! Live sessions sit in a DashMap; the SQLite archive holds closed ones.
//! The gateway is the only writer of any single session's history (it
//! serializes per key), but lookups and the idle sweep run concurrently, so
//! each session is wrapped in its own mutex.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::db::init_db;
use crate::error::Result;
use crate::types::{Session, SessionKey, SessionState, SessionTurn};

pub struct SessionManager {
    live: DashMap<SessionKey, Arc<Mutex<Session>>>,
    conn: Option<Mutex<Connection>>,
    history_limit: usize,
    idle_timeout_secs: i64,
}

impl SessionManager {
    /// In-memory only: sessions do not survive a restart.
    pub fn new(history_limit: usize, idle_timeout_secs: i64) -> Self {
        Self {
            live: DashMap::new(),
            conn: None,
            history_limit,
            idle_timeout_secs,
        }
    }

    /// With a SQLite archive: closed sessions are flushed and restorable.
    pub fn with_storage(
        conn: Connection,
        history_limit: usize,
        idle_timeout_secs: i64,
    ) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            live: DashMap::new(),
            conn: Some(Mutex::new(conn)),
            history_limit,
            idle_timeout_secs,
        })
    }

    /// Fetch the live session for `key`, restoring from the archive or
    /// creating fresh. Exactly one session exists per key.
    pub fn get_or_create(&self, key: &SessionKey) -> Arc<Mutex<Session>> {
        if let Some(existing) = self.live.get(key) {
            return existing.clone();
        }

        let session = self
            .restore_from_archive(key)
            .unwrap_or_else(|| Session::new(key.clone(), self.history_limit));
        let arc = Arc::new(Mutex::new(session));
        // entry() resolves the race where two dispatchers create at once.
        self.live
            .entry(key.clone())
            .or_insert_with(|| arc)
            .value()
            .clone()
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Mutex<Session>>> {
        self.live.get(key).map(|s| s.clone())
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Keys of sessions active within the last `hours` (for system pushes
    /// like the daily self-check report).
    pub fn recently_active(&self, hours: i64) -> Vec<SessionKey> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        self.live
            .iter()
            .filter(|entry| {
                let s = entry.value().lock().unwrap();
                s.state == SessionState::Active && s.last_active >= cutoff
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Close and archive sessions idle past the timeout. Returns the keys
    /// that were closed.
    pub fn sweep_idle(&self) -> Vec<SessionKey> {
        let mut closed = Vec::new();
        let keys: Vec<SessionKey> = self.live.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(entry) = self.live.get(&key) else { continue };
            let should_close = {
                let s = entry.value().lock().unwrap();
                s.idle_secs() >= self.idle_timeout_secs
            };
            drop(entry);
            if should_close {
                if let Some((_, arc)) = self.live.remove(&key) {
                    let mut s = arc.lock().unwrap();
                    s.state = SessionState::Closed;
                    if let Err(e) = self.archive(&s) {
                        warn!(key = %key, error = %e, "failed to archive session");
                    }
                    info!(key = %key, turns = s.history.len(), "session closed (idle)");
                    closed.push(key);
                }
            }
        }
        closed
    }

    /// Flush every live session to the archive (shutdown path).
    pub fn flush_all(&self) {
        for entry in self.live.iter() {
            let s = entry.value().lock().unwrap();
            if let Err(e) = self.archive(&s) {
                warn!(key = %s.key, error = %e, "failed to flush session");
            }
        }
    }

    fn archive(&self, session: &Session) -> Result<()> {
        let Some(conn) = &self.conn else {
            return Ok(());
        };
        let conn = conn.lock().unwrap();
        let history: Vec<&SessionTurn> = session.history.iter().collect();
        conn.execute(
            "INSERT OR REPLACE INTO session_archive
             (session_key, id, channel, chat_id, user_id, history, last_active, closed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            rusqlite::params![
                session.key.format(),
                session.id,
                session.key.channel,
                session.key.chat_id,
                session.key.user_id,
                serde_json::to_string(&history)?,
                session.last_active.to_rfc3339(),
                (session.state == SessionState::Closed).then(|| Utc::now().to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn restore_from_archive(&self, key: &SessionKey) -> Option<Session> {
        let conn = self.conn.as_ref()?;
        let conn = conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT id, history FROM session_archive WHERE session_key = ?1",
                [key.format()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        let (id, history_json) = row?;
        let history: Vec<SessionTurn> = serde_json::from_str(&history_json).unwrap_or_default();
        debug!(key = %key, turns = history.len(), "restored session from archive");
        Some(Session::restore(id, key.clone(), history, self.history_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new("telegram", "42", "7")
    }

    #[test]
    fn one_session_per_key() {
        let mgr = SessionManager::new(50, 1800);
        let a = mgr.get_or_create(&key());
        let b = mgr.get_or_create(&key());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.live_count(), 1);
    }

    #[test]
    fn idle_sweep_closes_and_archive_restores() {
        let conn = Connection::open_in_memory().unwrap();
        let mgr = SessionManager::with_storage(conn, 50, 0).unwrap();

        {
            let session = mgr.get_or_create(&key());
            let mut s = session.lock().unwrap();
            s.append("user", "remember me");
            // Force the session to look idle.
            s.last_active = Utc::now() - chrono::Duration::hours(1);
        }

        let closed = mgr.sweep_idle();
        assert_eq!(closed, vec![key()]);
        assert_eq!(mgr.live_count(), 0);

        // The next message restores the archived history.
        let restored = mgr.get_or_create(&key());
        let s = restored.lock().unwrap();
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history[0].content, "remember me");
        assert_eq!(s.state, SessionState::Active);
    }

    #[test]
    fn recently_active_filters_by_window() {
        let mgr = SessionManager::new(50, 1800);
        mgr.get_or_create(&key());
        let stale_key = SessionKey::new("feishu", "9", "9");
        {
            let session = mgr.get_or_create(&stale_key);
            session.lock().unwrap().last_active = Utc::now() - chrono::Duration::hours(48);
        }

        let active = mgr.recently_active(24);
        assert_eq!(active, vec![key()]);
    }
}
