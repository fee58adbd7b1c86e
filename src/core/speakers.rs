//! Speaker registry: mapping engine labels to user labels.
//!
//! The engine labels diarized speakers `S1`, `S2`, ... within a session.
//! Pre-enrolled speakers come with opaque identifiers bound to the API
//! credential; when a `SpeakersResult` ties an engine label to a known
//! identifier, the registry substitutes the user label on subsequently
//! emitted segments. Substitution is advisory only and never rewrites
//! segments already emitted.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::SpeakerIdentifier;
use crate::core::messages::SpeakerResultEntry;

static ENGINE_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^S\d+$").expect("engine label pattern"));

/// Whether a label uses the reserved engine pattern `S<N>`.
pub fn is_engine_label(label: &str) -> bool {
    ENGINE_LABEL.is_match(label)
}

/// Known speakers and the engine-label mapping learned this session.
#[derive(Debug, Default)]
pub struct SpeakerRegistry {
    /// identifier -> user label, from pre-enrolled speakers.
    known: HashMap<String, String>,
    /// engine label (`S1`) -> user label, learned from `SpeakersResult`.
    mapping: HashMap<String, String>,
}

impl SpeakerRegistry {
    pub fn new(known_speakers: &[SpeakerIdentifier]) -> Self {
        let mut known = HashMap::new();
        for speaker in known_speakers {
            for identifier in &speaker.speaker_identifiers {
                known.insert(identifier.clone(), speaker.label.clone());
            }
        }
        Self {
            known,
            mapping: HashMap::new(),
        }
    }

    /// Ingest a `SpeakersResult`. Entries whose identifiers match a
    /// known speaker teach the registry an engine-label mapping; entries
    /// already carrying a user label map to themselves.
    pub fn ingest(&mut self, speakers: &[SpeakerResultEntry]) {
        for entry in speakers {
            if let Some(label) = entry
                .speaker_identifiers
                .iter()
                .find_map(|id| self.known.get(id))
            {
                if is_engine_label(&entry.label) {
                    debug!(engine = %entry.label, label = %label, "speaker identified");
                    self.mapping.insert(entry.label.clone(), label.clone());
                }
            }
        }
    }

    /// Resolve an engine label to its user label, if one is known.
    pub fn resolve(&self, speaker_id: &str) -> Option<&str> {
        self.mapping.get(speaker_id).map(String::as_str)
    }

    /// Apply the mapping to a speaker id, passing unknown ids through.
    pub fn display_label<'a>(&'a self, speaker_id: &'a str) -> &'a str {
        self.resolve(speaker_id).unwrap_or(speaker_id)
    }

    /// Number of learned engine-label mappings.
    pub fn mapped_count(&self) -> usize {
        self.mapping.len()
    }
}
