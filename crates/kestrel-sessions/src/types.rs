use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Identifies one conversation: exactly one session exists per key.
///
/// Wire format: `{channel}:{chat_id}:{user_id}` — chat and user ids may not
/// contain `:` on any supported platform, so the split is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel: String,
    pub chat_id: String,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn format(&self) -> String {
        format!("{}:{}:{}", self.channel, self.chat_id, self.user_id)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(SessionError::InvalidKey(s.to_string()));
        }
        Ok(Self {
            channel: parts[0].to_string(),
            chat_id: parts[1].to_string(),
            user_id: parts[2].to_string(),
        })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Closed,
}

/// One turn of a session's in-memory history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTurn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A live conversation.
///
/// History is bounded: appending past the limit trims the oldest turns. The
/// metadata map is per-turn scratch space for the gateway — pending images,
/// pending voices, the current inbound message — and is never persisted.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub key: SessionKey,
    pub state: SessionState,
    pub last_active: DateTime<Utc>,
    pub history: VecDeque<SessionTurn>,
    pub metadata: HashMap<String, serde_json::Value>,
    history_limit: usize,
}

impl Session {
    pub fn new(key: SessionKey, history_limit: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key,
            state: SessionState::Active,
            last_active: Utc::now(),
            history: VecDeque::new(),
            metadata: HashMap::new(),
            history_limit,
        }
    }

    /// Rebuild a session from its archived history.
    pub fn restore(
        id: String,
        key: SessionKey,
        history: Vec<SessionTurn>,
        history_limit: usize,
    ) -> Self {
        let mut session = Self::new(key, history_limit);
        session.id = id;
        session.history = history.into_iter().collect();
        session.trim();
        session
    }

    /// Append a turn, bumping `last_active` and trimming overflow.
    pub fn append(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.history.push_back(SessionTurn {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
        self.last_active = Utc::now();
        self.trim();
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub fn idle_secs(&self) -> i64 {
        (Utc::now() - self.last_active).num_seconds()
    }

    pub fn set_meta(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn take_meta(&mut self, key: &str) -> Option<serde_json::Value> {
        self.metadata.remove(key)
    }

    pub fn get_meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    fn trim(&mut self) {
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        let key = SessionKey::new("telegram", "42", "7");
        assert_eq!(key.format(), "telegram:42:7");
        assert_eq!(SessionKey::parse("telegram:42:7").unwrap(), key);
    }

    #[test]
    fn key_parse_rejects_malformed() {
        assert!(SessionKey::parse("telegram:42").is_err());
        assert!(SessionKey::parse("::").is_err());
    }

    #[test]
    fn history_is_bounded() {
        let mut session = Session::new(SessionKey::new("telegram", "1", "1"), 3);
        for i in 0..5 {
            session.append("user", format!("msg {i}"));
        }
        assert_eq!(session.history.len(), 3);
        assert_eq!(session.history.front().unwrap().content, "msg 2");
        assert_eq!(session.history.back().unwrap().content, "msg 4");
    }

    #[test]
    fn metadata_is_scratch_space() {
        let mut session = Session::new(SessionKey::new("telegram", "1", "1"), 10);
        session.set_meta("pending_images", serde_json::json!([{"local_path": "/tmp/a.jpg"}]));
        assert!(session.get_meta("pending_images").is_some());
        let taken = session.take_meta("pending_images").unwrap();
        assert!(taken.is_array());
        assert!(session.get_meta("pending_images").is_none());
    }
}
