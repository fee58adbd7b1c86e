//! Transcript assembly: reconciling partial and final word batches.
//!
//! The STT engine streams `AddPartialTranscript` and `AddTranscript`
//! payloads. Partials are hypotheses that may be revised wholesale by the
//! next batch; finals are committed and stable. [`FragmentBuffer`]
//! accumulates both into one ordered word list: each new batch drops all
//! buffered partials, keeps the committed finals, and appends the
//! incoming fragments. A trim watermark discards words that were already
//! emitted downstream.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{SpeakerFocusConfig, SpeakerFocusMode};
use crate::core::messages::TranscriptPayload;

/// Speakers whose label is wrapped in double underscores (e.g.
/// `__ASSISTANT__`) are dropped on ingest. Used to keep an agent's own
/// voice out of its transcript.
static RESERVED_SPEAKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^__[A-Z0-9_]{2,}__$").expect("reserved speaker pattern"));

/// Filler words per language, for engines that do not tag disfluencies.
fn is_disfluent_content(content: &str, language: &str) -> bool {
    let fillers: &[&str] = match language {
        "en" => &["um", "uh", "er", "erm", "hmm", "mm"],
        "de" => &["äh", "ähm", "hm"],
        "es" => &["eh", "em", "este"],
        _ => &["um", "uh", "er"],
    };
    let lowered = content.to_lowercase();
    fillers.contains(&lowered.as_str())
}

/// Whether punctuation glues to the neighbouring word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Previous,
    Next,
}

/// The kind of a speech fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Word,
    Punctuation,
}

/// One word or punctuation mark from the transcript stream.
///
/// Times are seconds since session start. `start_time <= end_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechFragment {
    /// Arrival order; ties on timestamps preserve this order.
    pub idx: u64,
    pub start_time: f64,
    pub end_time: f64,
    pub language: String,
    pub kind: FragmentKind,
    pub is_eos: bool,
    pub is_final: bool,
    pub is_disfluency: bool,
    pub attaches_to: Option<Attachment>,
    pub content: String,
    pub speaker: Option<String>,
    pub confidence: f64,
}

impl SpeechFragment {
    pub fn is_word(&self) -> bool {
        self.kind == FragmentKind::Word
    }

    pub fn is_punctuation(&self) -> bool {
        self.kind == FragmentKind::Punctuation
    }
}

/// Summary of one applied batch, handed to the segmentation engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WordsUpdated {
    /// Final fragments committed by this batch.
    pub new_finals: usize,
    /// Partial fragments now in the buffer (the revised hypothesis).
    pub revised_partials: usize,
    /// Latest end time observed so far.
    pub latest_time: f64,
    /// Whether anything is buffered after the update.
    pub has_fragments: bool,
}

/// Ordered word buffer with partial/final reconciliation.
pub struct FragmentBuffer {
    fragments: Vec<SpeechFragment>,
    focus: SpeakerFocusConfig,
    default_language: String,
    next_idx: u64,
    /// Fragments starting before this time were emitted and are gone.
    trim_before: f64,
    latest_time: f64,
}

impl FragmentBuffer {
    pub fn new(focus: SpeakerFocusConfig, default_language: impl Into<String>) -> Self {
        Self {
            fragments: Vec::new(),
            focus,
            default_language: default_language.into(),
            next_idx: 0,
            trim_before: 0.0,
            latest_time: 0.0,
        }
    }

    /// Replace the focus configuration. Takes effect on the next batch;
    /// already-buffered fragments are not re-filtered.
    pub fn update_focus(&mut self, focus: SpeakerFocusConfig) {
        self.focus = focus;
    }

    pub fn focus(&self) -> &SpeakerFocusConfig {
        &self.focus
    }

    /// Whether a speaker survives the ingest filter.
    fn admits(&self, speaker: &str) -> bool {
        if RESERVED_SPEAKER.is_match(speaker) {
            return false;
        }
        if self.focus.ignore_speakers.iter().any(|s| s == speaker) {
            return false;
        }
        if self.focus.focus_mode == SpeakerFocusMode::Ignore
            && !self.focus.focus_speakers.is_empty()
            && !self.focus.focus_speakers.iter().any(|s| s == speaker)
        {
            return false;
        }
        true
    }

    /// Apply one transcript payload.
    ///
    /// Finals commit: they survive subsequent batches and deduplicate
    /// against already-committed finals with the same start time, content
    /// and speaker. Partials are a full replacement of the previous
    /// partial hypothesis.
    pub fn apply(&mut self, payload: &TranscriptPayload, is_final: bool) -> WordsUpdated {
        let mut incoming: Vec<SpeechFragment> = Vec::with_capacity(payload.results.len());

        for result in &payload.results {
            let Some(alt) = result.best() else { continue };
            if alt.content.is_empty() {
                continue;
            }
            if result.start_time < self.trim_before {
                continue;
            }
            if let Some(speaker) = &alt.speaker {
                if !self.admits(speaker) {
                    continue;
                }
            }

            let language = alt
                .language
                .clone()
                .unwrap_or_else(|| self.default_language.clone());
            let is_punctuation = result.is_punctuation();
            let is_disfluency = !is_punctuation
                && (alt.tags.iter().any(|t| t == "disfluency")
                    || is_disfluent_content(&alt.content, &language));

            let fragment = SpeechFragment {
                idx: self.next_id(),
                start_time: result.start_time,
                end_time: result.end_time.max(result.start_time),
                language,
                kind: if is_punctuation {
                    FragmentKind::Punctuation
                } else {
                    FragmentKind::Word
                },
                is_eos: result.is_eos,
                is_final,
                is_disfluency,
                attaches_to: match result.attaches_to.as_deref() {
                    Some("previous") => Some(Attachment::Previous),
                    Some("next") => Some(Attachment::Next),
                    _ => None,
                },
                content: alt.content.clone(),
                speaker: alt.speaker.clone(),
                confidence: alt.confidence,
            };

            // Repeated finals for the same word are idempotent.
            if is_final
                && self.fragments.iter().any(|f| {
                    f.is_final
                        && f.start_time == fragment.start_time
                        && f.content == fragment.content
                        && f.speaker == fragment.speaker
                })
            {
                continue;
            }

            self.latest_time = self.latest_time.max(fragment.end_time);
            incoming.push(fragment);
        }

        let new_finals = if is_final { incoming.len() } else { 0 };

        // Finals are retained; every partial is superseded by this batch.
        self.fragments
            .retain(|f| f.is_final && f.start_time >= self.trim_before);
        self.fragments.extend(incoming);
        self.fragments.sort_by_key(|f| f.idx);

        // A leading previous-attached punctuation belongs to an emitted
        // word; drop it.
        while self
            .fragments
            .first()
            .is_some_and(|f| f.is_punctuation() && f.attaches_to == Some(Attachment::Previous))
        {
            self.fragments.remove(0);
        }

        WordsUpdated {
            new_finals,
            revised_partials: self.fragments.iter().filter(|f| !f.is_final).count(),
            latest_time: self.latest_time,
            has_fragments: !self.fragments.is_empty(),
        }
    }

    /// Drop everything starting before `time`. Called after downstream
    /// emitted segments up to that point.
    pub fn trim_before(&mut self, time: f64) {
        self.trim_before = self.trim_before.max(time);
        let watermark = self.trim_before;
        self.fragments.retain(|f| f.start_time >= watermark);
    }

    /// The buffered fragments, oldest first.
    pub fn fragments(&self) -> &[SpeechFragment] {
        &self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Latest end time observed across the session.
    pub fn latest_time(&self) -> f64 {
        self.latest_time
    }

    /// Append a synthetic end-of-sentence mark after the last fragment.
    pub fn push_synthetic_eos(&mut self) {
        let Some(last) = self.fragments.last() else {
            return;
        };
        let fragment = SpeechFragment {
            idx: self.next_idx,
            start_time: last.end_time,
            end_time: last.end_time,
            language: last.language.clone(),
            kind: FragmentKind::Punctuation,
            is_eos: true,
            is_final: true,
            is_disfluency: false,
            attaches_to: Some(Attachment::Previous),
            content: ".".to_string(),
            speaker: last.speaker.clone(),
            confidence: 1.0,
        };
        self.next_idx += 1;
        self.fragments.push(fragment);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_idx;
        self.next_idx += 1;
        id
    }
}
