use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of knowledge a semantic memory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Preference,
    Skill,
    Error,
    Rule,
    Context,
    PersonaTrait,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Preference => "preference",
            MemoryType::Skill => "skill",
            MemoryType::Error => "error",
            MemoryType::Rule => "rule",
            MemoryType::Context => "context",
            MemoryType::PersonaTrait => "persona_trait",
        }
    }

    pub const ALL: [MemoryType; 7] = [
        MemoryType::Fact,
        MemoryType::Preference,
        MemoryType::Skill,
        MemoryType::Error,
        MemoryType::Rule,
        MemoryType::Context,
        MemoryType::PersonaTrait,
    ];
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fact" => Ok(MemoryType::Fact),
            "preference" => Ok(MemoryType::Preference),
            "skill" => Ok(MemoryType::Skill),
            "error" => Ok(MemoryType::Error),
            "rule" => Ok(MemoryType::Rule),
            "context" => Ok(MemoryType::Context),
            "persona_trait" => Ok(MemoryType::PersonaTrait),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retention tier. Decay demotes SHORT_TERM memories; PERMANENT never decays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPriority {
    Transient,
    ShortTerm,
    LongTerm,
    Permanent,
}

impl MemoryPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPriority::Transient => "transient",
            MemoryPriority::ShortTerm => "short_term",
            MemoryPriority::LongTerm => "long_term",
            MemoryPriority::Permanent => "permanent",
        }
    }
}

impl std::str::FromStr for MemoryPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient" => Ok(MemoryPriority::Transient),
            "short_term" => Ok(MemoryPriority::ShortTerm),
            "long_term" => Ok(MemoryPriority::LongTerm),
            "permanent" => Ok(MemoryPriority::Permanent),
            other => Err(format!("unknown memory priority: {other}")),
        }
    }
}

impl std::fmt::Display for MemoryPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable, typed knowledge atom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMemory {
    pub id: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub priority: MemoryPriority,
    /// Who/what the memory is about (e.g. "user", "project:kestrel").
    pub subject: Option<String>,
    pub predicate: Option<String>,
    /// [0, 1] — drives retrieval ranking and decay survival.
    pub importance_score: f64,
    pub confidence: f64,
    pub access_count: i64,
    /// Per-day decay factor applied while the memory goes unaccessed.
    pub decay_rate: f64,
    pub tags: Vec<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// When set, this memory is excluded from retrieval and dedup pools.
    pub superseded_by: Option<String>,
    pub source_episode_id: Option<String>,
}

impl SemanticMemory {
    pub fn new(content: impl Into<String>, memory_type: MemoryType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            memory_type,
            priority: MemoryPriority::ShortTerm,
            subject: None,
            predicate: None,
            importance_score: 0.5,
            confidence: 0.8,
            access_count: 0,
            decay_rate: 0.05,
            tags: Vec::new(),
            source: "conversation".to_string(),
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
            expires_at: None,
            superseded_by: None,
            source_episode_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeOutcome {
    Success,
    Partial,
    Failed,
    Completed,
}

impl EpisodeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeOutcome::Success => "success",
            EpisodeOutcome::Partial => "partial",
            EpisodeOutcome::Failed => "failed",
            EpisodeOutcome::Completed => "completed",
        }
    }
}

impl std::str::FromStr for EpisodeOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(EpisodeOutcome::Success),
            "partial" => Ok(EpisodeOutcome::Partial),
            "failed" => Ok(EpisodeOutcome::Failed),
            "completed" => Ok(EpisodeOutcome::Completed),
            other => Err(format!("unknown episode outcome: {other}")),
        }
    }
}

impl std::fmt::Display for EpisodeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A summary of one session: what happened, how it ended, what was touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub session_id: String,
    pub summary: String,
    pub goal: String,
    pub outcome: EpisodeOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Ordered action trace, opaque JSON.
    pub action_nodes: serde_json::Value,
    pub entities: Vec<String>,
    pub tools_used: Vec<String>,
    /// Must reference existing SemanticMemory ids.
    pub linked_memory_ids: Vec<String>,
    pub importance_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentDirection {
    Inbound,
    Outbound,
}

impl AttachmentDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentDirection::Inbound => "inbound",
            AttachmentDirection::Outbound => "outbound",
        }
    }
}

/// A file exchanged in a conversation, plus any text we pulled out of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub session_id: String,
    pub episode_id: Option<String>,
    pub filename: String,
    pub mime_type: String,
    pub local_path: Option<String>,
    pub url: Option<String>,
    pub direction: AttachmentDirection,
    pub description: Option<String>,
    pub transcription: Option<String>,
    pub extracted_text: Option<String>,
    pub tags: Vec<String>,
    pub memory_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One archived conversation turn. Turn indices are monotonic per session;
/// the store assigns `MAX(turn_index) + 1` so restarts cannot collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub turn_index: i64,
    pub role: String,
    pub content: String,
    pub tool_calls: Option<String>,
    pub tool_results: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub extracted: bool,
}

/// Per-user working notes, surfaced only on explicit request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scratchpad {
    pub user_id: String,
    pub content: String,
    pub active_projects: String,
    pub current_focus: String,
    pub open_questions: String,
    pub next_steps: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One pending item in the extraction retry queue.
#[derive(Debug, Clone)]
pub struct ExtractionItem {
    pub queue_id: i64,
    pub session_id: String,
    pub turn_index: i64,
    pub role: String,
    pub content: String,
    pub attempts: i64,
}

/// A candidate memory emitted by the extraction model.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryCandidate {
    #[serde(rename = "type")]
    pub memory_type: String,
    pub content: String,
    pub importance: f64,
}
