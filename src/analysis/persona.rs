//! Per-room persona loading.
//!
//! The persona file captures how a host talks: tone, taboo phrases,
//! catchphrases, slang. It is re-read on every tick so edits land without a
//! restart; a missing or corrupt file silently yields the empty persona.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Host persona for one room.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Persona {
    /// One-phrase tone description, e.g. "亲切自然".
    pub tone: String,
    /// Phrases the host never says.
    pub taboos: Vec<String>,
    /// Signature phrases to weave into suggested lines.
    pub catchphrases: Vec<String>,
    /// Room slang: viewer term → meaning.
    pub slang: BTreeMap<String, String>,
}

impl Persona {
    /// Compact style summary carried on analysis payloads.
    pub fn style_profile(&self) -> String {
        if self.tone.is_empty() && self.catchphrases.is_empty() {
            return "自然直播风格".to_owned();
        }
        let mut profile = if self.tone.is_empty() {
            "自然".to_owned()
        } else {
            self.tone.clone()
        };
        if !self.catchphrases.is_empty() {
            profile.push_str("，口头禅：");
            profile.push_str(&self.catchphrases.join("、"));
        }
        profile
    }
}

/// Path of the persona file for a room.
pub fn persona_path(persist_root: &Path, room_id: &str) -> PathBuf {
    persist_root.join("persona").join(format!("{room_id}.toml"))
}

/// Load the persona for a room; missing or unreadable files are never an
/// error, they produce the empty persona.
pub fn load(persist_root: &Path, room_id: &str) -> Persona {
    let path = persona_path(persist_root, room_id);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return Persona::default();
    };
    match toml::from_str(&raw) {
        Ok(persona) => persona,
        Err(e) => {
            debug!(path = %path.display(), "persona file ignored: {e}");
            Persona::default()
        }
    }
}
