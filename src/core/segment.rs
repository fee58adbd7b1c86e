//! Speech segmentation: grouping words into per-speaker segments.
//!
//! A segment is a contiguous run of fragments from one speaker, bounded
//! by a speaker change, a sentence boundary, or an inter-word gap larger
//! than the configured limit. Segments are annotated pure-functionally
//! from their fragment sequence; the engine additionally decides when a
//! partial re-emission is warranted (the emit cadence) and which
//! segments have closed and become final.

use serde::Serialize;

use crate::config::{EmitCadence, SpeakerFocusConfig};
use crate::core::transcript::{Attachment, FragmentBuffer, SpeechFragment};

/// Facts derivable from a segment's word sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Annotation {
    HasPartial,
    HasFinal,
    StartsWithFinal,
    EndsWithFinal,
    EndsWithEos,
    EndsWithPunctuation,
    VerySlowSpeaker,
    SlowSpeaker,
    FastSpeaker,
    HasDisfluency,
    EndsWithDisfluency,
}

/// Word rate below which a segment is annotated very slow.
const VERY_SLOW_SPEAKER_WPM: f64 = 80.0;

/// Word rate below which a segment is annotated slow.
const SLOW_SPEAKER_WPM: f64 = 110.0;

/// Ordered, duplicate-free set of [`Annotation`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AnnotationSet(Vec<Annotation>);

impl AnnotationSet {
    pub fn add(&mut self, annotation: Annotation) {
        if !self.0.contains(&annotation) {
            self.0.push(annotation);
        }
    }

    /// All of the given annotations are present.
    pub fn has(&self, annotations: &[Annotation]) -> bool {
        annotations.iter().all(|a| self.0.contains(a))
    }

    /// Any of the given annotations is present.
    pub fn any(&self, annotations: &[Annotation]) -> bool {
        annotations.iter().any(|a| self.0.contains(a))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-word data attached to segments when `include_results` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentWord {
    pub content: String,
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
    pub is_final: bool,
}

/// A contiguous run of words from one speaker.
///
/// `start_time`/`end_time` are the min/max of the contained words.
/// Emitted segments copy everything they need from the fragments; they
/// never reference the word buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeakerSegment {
    pub speaker_id: Option<String>,
    pub is_active: bool,
    pub language: Option<String>,
    pub text: String,
    pub start_time: f64,
    pub end_time: f64,
    pub annotations: AnnotationSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<SegmentWord>>,
}

/// Segment emission produced by one engine step.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// Open segments whose rendered content changed.
    Partial {
        segments: Vec<SpeakerSegment>,
        start_time: f64,
        end_time: f64,
    },
    /// Closed segments; their text is stable from here on.
    Final {
        segments: Vec<SpeakerSegment>,
        start_time: f64,
        end_time: f64,
    },
}

/// Tunables for [`SegmentationEngine`].
#[derive(Debug, Clone)]
pub struct SegmentationOptions {
    /// Largest in-segment silence, seconds.
    pub max_intra_gap: f64,
    /// Words-per-minute threshold for the fast-speaker annotation.
    pub fast_speaker_wpm: f64,
    pub emit_cadence: EmitCadence,
    /// Attach per-word data to emitted segments.
    pub include_results: bool,
}

/// Converts the fragment buffer into segment emissions.
pub struct SegmentationEngine {
    options: SegmentationOptions,
    /// Word delimiter from the session's language pack.
    word_delimiter: String,
    prev_full: String,
    prev_stripped: String,
    prev_end_time: f64,
}

impl SegmentationEngine {
    pub fn new(options: SegmentationOptions) -> Self {
        Self {
            options,
            word_delimiter: " ".to_string(),
            prev_full: String::new(),
            prev_stripped: String::new(),
            prev_end_time: 0.0,
        }
    }

    /// Adopt the delimiter announced in `RecognitionStarted`.
    pub fn set_word_delimiter(&mut self, delimiter: impl Into<String>) {
        self.word_delimiter = delimiter.into();
    }

    /// Recompute segments after a word update and decide what to emit.
    ///
    /// Closed segments are emitted as [`SegmentEvent::Final`] and their
    /// fragments trimmed from the buffer, so a segment range is final at
    /// most once. Remaining open segments are emitted as
    /// [`SegmentEvent::Partial`] when the cadence filter sees a change.
    pub fn on_words_updated(&mut self, buffer: &mut FragmentBuffer) -> Vec<SegmentEvent> {
        let segments = self.build_segments(buffer.fragments(), buffer.focus());
        if segments.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();

        // Leading run of closed segments. A segment is closed when its
        // sentence finished on committed words, or when a later segment
        // follows it and nothing in it can change any more.
        let last_index = segments.len() - 1;
        let mut closed = 0usize;
        for (i, segment) in segments.iter().enumerate() {
            let finished_sentence = segment
                .annotations
                .has(&[Annotation::EndsWithFinal, Annotation::EndsWithEos]);
            let superseded =
                i < last_index && !segment.annotations.any(&[Annotation::HasPartial]);
            if finished_sentence || superseded {
                closed = i + 1;
            } else {
                break;
            }
        }

        let (final_segments, open_segments) = segments.split_at(closed);

        if !final_segments.is_empty() {
            let end_time = final_segments[final_segments.len() - 1].end_time;
            events.push(SegmentEvent::Final {
                segments: final_segments.to_vec(),
                start_time: final_segments[0].start_time,
                end_time,
            });
            buffer.trim_before(end_time);
            self.reset_change_tracking();
        }

        if !open_segments.is_empty() {
            if let Some(event) = self.partial_event(open_segments) {
                events.push(event);
            }
        }

        events
    }

    /// Emit everything buffered as final, unconditionally.
    pub fn finalize(&mut self, buffer: &mut FragmentBuffer) -> Vec<SegmentEvent> {
        let segments = self.build_segments(buffer.fragments(), buffer.focus());
        self.reset_change_tracking();
        if segments.is_empty() {
            return Vec::new();
        }
        let start_time = segments[0].start_time;
        let end_time = segments[segments.len() - 1].end_time;
        buffer.trim_before(end_time);
        vec![SegmentEvent::Final {
            segments,
            start_time,
            end_time,
        }]
    }

    /// The currently open segments, without emission bookkeeping.
    pub fn current_segments(&self, buffer: &FragmentBuffer) -> Vec<SpeakerSegment> {
        self.build_segments(buffer.fragments(), buffer.focus())
    }

    fn reset_change_tracking(&mut self) {
        self.prev_full.clear();
        self.prev_stripped.clear();
        self.prev_end_time = 0.0;
    }

    fn partial_event(&mut self, open: &[SpeakerSegment]) -> Option<SegmentEvent> {
        let full = render_view(open, false);
        let stripped = render_view(open, true);
        let end_time = open[open.len() - 1].end_time;

        let is_new = self.prev_full.is_empty() && !full.is_empty();
        let full_changed = full != self.prev_full;
        let stripped_changed = stripped != self.prev_stripped;
        let timing_changed = end_time != self.prev_end_time;

        let should_emit = match self.options.emit_cadence {
            EmitCadence::Words => is_new || stripped_changed,
            EmitCadence::Complete => is_new || full_changed,
            EmitCadence::CompletePlusTiming => is_new || full_changed || timing_changed,
            // Sentence mode holds partials; only finals are surfaced.
            EmitCadence::Sentences => false,
        };

        self.prev_full = full;
        self.prev_stripped = stripped;
        self.prev_end_time = end_time;

        should_emit.then(|| SegmentEvent::Partial {
            segments: open.to_vec(),
            start_time: open[0].start_time,
            end_time,
        })
    }

    /// Group fragments into annotated segments.
    fn build_segments(
        &self,
        fragments: &[SpeechFragment],
        focus: &SpeakerFocusConfig,
    ) -> Vec<SpeakerSegment> {
        let mut groups: Vec<Vec<&SpeechFragment>> = Vec::new();
        let mut current: Vec<&SpeechFragment> = Vec::new();

        for fragment in fragments {
            let boundary = match current.last() {
                Some(prev) => {
                    let speaker_changed = prev.speaker != fragment.speaker;
                    // Attached punctuation stays with its word.
                    let gap_exceeded = fragment.attaches_to != Some(Attachment::Previous)
                        && fragment.start_time - prev.end_time > self.options.max_intra_gap;
                    let sentence_done = prev.is_eos;
                    speaker_changed || gap_exceeded || sentence_done
                }
                None => false,
            };
            if boundary && !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            current.push(fragment);
        }
        if !current.is_empty() {
            groups.push(current);
        }

        groups
            .into_iter()
            .filter_map(|group| self.segment_from_group(group, focus))
            .collect()
    }

    fn segment_from_group(
        &self,
        mut group: Vec<&SpeechFragment>,
        focus: &SpeakerFocusConfig,
    ) -> Option<SpeakerSegment> {
        // Edge punctuation that glues to a word outside this group is
        // meaningless on its own.
        while group
            .first()
            .is_some_and(|f| f.is_punctuation() && f.attaches_to == Some(Attachment::Previous))
        {
            group.remove(0);
        }
        while group
            .last()
            .is_some_and(|f| f.is_punctuation() && f.attaches_to == Some(Attachment::Next))
        {
            group.pop();
        }
        if group.is_empty() {
            return None;
        }

        let start_time = group
            .iter()
            .map(|f| f.start_time)
            .fold(f64::INFINITY, f64::min);
        let end_time = group.iter().map(|f| f.end_time).fold(0.0, f64::max);

        let speaker_id = group[0].speaker.clone();
        let is_active = focus.focus_speakers.is_empty()
            || speaker_id
                .as_deref()
                .is_some_and(|s| focus.focus_speakers.iter().any(|f| f == s));

        let mut text = String::new();
        for fragment in &group {
            if text.is_empty() || fragment.attaches_to == Some(Attachment::Previous) {
                text.push_str(&fragment.content);
            } else {
                text.push_str(&self.word_delimiter);
                text.push_str(&fragment.content);
            }
        }

        let words = self.options.include_results.then(|| {
            group
                .iter()
                .map(|f| SegmentWord {
                    content: f.content.clone(),
                    start_time: f.start_time,
                    end_time: f.end_time,
                    confidence: f.confidence,
                    is_final: f.is_final,
                })
                .collect()
        });

        Some(SpeakerSegment {
            speaker_id,
            is_active,
            language: Some(group[0].language.clone()),
            text,
            start_time,
            end_time,
            annotations: self.annotate(&group),
            words,
        })
    }

    fn annotate(&self, group: &[&SpeechFragment]) -> AnnotationSet {
        let mut set = AnnotationSet::default();
        let first = group[0];
        let last = group[group.len() - 1];

        if group.iter().any(|f| !f.is_final) {
            set.add(Annotation::HasPartial);
        }
        if group.iter().any(|f| f.is_final) {
            set.add(Annotation::HasFinal);
        }
        if first.is_final {
            set.add(Annotation::StartsWithFinal);
        }
        if last.is_final {
            set.add(Annotation::EndsWithFinal);
        }
        if last.is_eos {
            set.add(Annotation::EndsWithEos);
        }
        if last.is_punctuation() {
            set.add(Annotation::EndsWithPunctuation);
        }
        if group.iter().any(|f| f.is_disfluency) {
            set.add(Annotation::HasDisfluency);
        }

        // Trailing disfluency: the last word, or the word just before a
        // closing punctuation mark.
        let trailing_word = group.iter().rev().find(|f| f.is_word());
        if trailing_word.is_some_and(|f| f.is_disfluency) {
            set.add(Annotation::EndsWithDisfluency);
        }

        let words: Vec<&&SpeechFragment> = group.iter().filter(|f| f.is_word()).collect();
        if words.len() > 1 {
            let window = &words[words.len().saturating_sub(5)..];
            let span = window[window.len() - 1].end_time - window[0].start_time;
            if span > 0.0 {
                let wpm = window.len() as f64 / (span / 60.0);
                if wpm < VERY_SLOW_SPEAKER_WPM {
                    set.add(Annotation::VerySlowSpeaker);
                } else if wpm < SLOW_SPEAKER_WPM {
                    set.add(Annotation::SlowSpeaker);
                } else if wpm > self.options.fast_speaker_wpm {
                    set.add(Annotation::FastSpeaker);
                }
            }
        }

        set
    }
}

/// Render segments to one comparable string for change detection.
fn render_view(segments: &[SpeakerSegment], words_only: bool) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('|');
        if let Some(speaker) = &segment.speaker_id {
            out.push_str(speaker);
        }
        out.push('|');
        if words_only {
            // Strip anything that is not part of the raw words.
            let stripped: String = segment
                .text
                .chars()
                .filter(|c| !matches!(c, '.' | ',' | '?' | '!' | ';' | ':'))
                .collect();
            out.push_str(&stripped);
        } else {
            out.push_str(&segment.text);
        }
        out.push('|');
    }
    out
}
