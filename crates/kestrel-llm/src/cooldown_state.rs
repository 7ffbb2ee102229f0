//! Persisted extended-cooldown state.
//!
//! Only the terminal (60 s) escalation step survives a restart — short
//! cooldowns are cheap to re-earn, but a process bounce must not bypass an
//! endpoint that was failing hard moments ago. The file is written
//! atomically (tempfile + rename) on every escalation into the terminal
//! step and on every success that cleared one.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use tracing::{debug, warn};

use crate::provider::HealthSnapshot;

pub const STATE_FILE_NAME: &str = ".llm_cooldown_state.json";

/// Load the state file, pruning entries whose cooldown already expired.
/// A missing or unreadable file is an empty map — never an error.
pub fn load(path: &Path) -> HashMap<String, HealthSnapshot> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return HashMap::new(),
    };
    let mut map: HashMap<String, HealthSnapshot> = match serde_json::from_str(&raw) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cooldown state file unreadable, ignoring");
            return HashMap::new();
        }
    };

    let now = chrono::Utc::now().timestamp();
    map.retain(|_, snap| snap.cooldown_until > now);
    debug!(entries = map.len(), "loaded persisted cooldown state");
    map
}

/// Write the state file atomically. Errors are logged, not propagated — a
/// failed persistence write must never break a chat call.
pub fn save(path: &Path, state: &HashMap<String, HealthSnapshot>) {
    let Some(dir) = path.parent() else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(error = %e, "cannot create cooldown state dir");
        return;
    }

    let json = match serde_json::to_string_pretty(state) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "cannot serialize cooldown state");
            return;
        }
    };

    let tmp = match tempfile::NamedTempFile::new_in(dir) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "cannot create cooldown temp file");
            return;
        }
    };
    if let Err(e) = tmp.as_file().write_all(json.as_bytes()) {
        warn!(error = %e, "cannot write cooldown state");
        return;
    }
    if let Err(e) = tmp.persist(path) {
        warn!(error = %e, "cannot persist cooldown state");
    }
}
