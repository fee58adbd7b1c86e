//! Configuration for the voice agent and the underlying RT session.
//!
//! [`VoiceAgentConfig`] is the single object users build (or load from a
//! preset); it is converted into the wire-level [`TranscriptionConfig`]
//! and [`AudioFormat`] records that go into `StartRecognition`.

mod presets;

pub use presets::Preset;

use serde::{Deserialize, Serialize};

use crate::errors::{VoiceError, VoiceResult};

/// Default RT endpoint when neither the config nor the environment
/// provides one.
pub const DEFAULT_RT_URL: &str = "wss://eu2.rt.speechmatics.com/v2";

/// Environment variable overriding the endpoint URL.
pub const RT_URL_ENV: &str = "SPEECHMATICS_RT_URL";

/// Supported audio encodings for streamed PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// 16-bit signed little-endian PCM, 2 bytes per sample.
    #[default]
    PcmS16le,
    /// 32-bit float little-endian PCM, 4 bytes per sample.
    PcmF32le,
    /// 8-bit mu-law, 1 byte per sample.
    Mulaw,
}

impl AudioEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioEncoding::PcmS16le => 2,
            AudioEncoding::PcmF32le => 4,
            AudioEncoding::Mulaw => 1,
        }
    }

    /// Wire name used in `audio_format`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::PcmS16le => "pcm_s16le",
            AudioEncoding::PcmF32le => "pcm_f32le",
            AudioEncoding::Mulaw => "mulaw",
        }
    }
}

/// Accuracy/latency tradeoff for the acoustic model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingPoint {
    Standard,
    #[default]
    Enhanced,
}

/// Policy deciding when the current speaker's turn is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOfTurnPolicy {
    /// Close the turn on the service's `EndOfUtterance`.
    #[default]
    Fixed,
    /// Open a content-aware prediction window on `EndOfUtterance`.
    Adaptive,
    /// Ask an acoustic classifier over the recent audio.
    Smart,
    /// Only an explicit `finalize(end_of_turn)` closes a turn.
    External,
}

/// How speakers outside the focus set are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerFocusMode {
    /// Emit segments for all speakers, mark only focused ones active.
    #[default]
    Retain,
    /// Suppress non-focused speakers entirely, partials included.
    Ignore,
}

/// Cadence filter for partial segment emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitCadence {
    /// Emit whenever the word content (punctuation stripped) changed.
    Words,
    /// Emit whenever the full rendered text changed.
    #[default]
    Complete,
    /// Like `Complete`, but word timing changes also trigger emission.
    CompletePlusTiming,
    /// Hold partials; emit finals on completed sentences only.
    Sentences,
}

/// One custom dictionary entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalVocabEntry {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sounds_like: Vec<String>,
}

/// A pre-enrolled speaker: a user-visible label plus the opaque
/// identifiers issued by the service for that voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerIdentifier {
    pub label: String,
    pub speaker_identifiers: Vec<String>,
}

/// Per-speaker filter controlling emission and the `is_active` marker.
///
/// `focus_speakers` and `ignore_speakers` must be disjoint. Both accept
/// engine labels (`S1`) or enrolled labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakerFocusConfig {
    #[serde(default)]
    pub focus_speakers: Vec<String>,
    #[serde(default)]
    pub ignore_speakers: Vec<String>,
    #[serde(default)]
    pub focus_mode: SpeakerFocusMode,
}

/// Settings for the smart-turn classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartTurnConfig {
    /// Probability at or above which the turn is considered complete.
    pub threshold: f32,
    /// Seconds of trailing PCM retained for classification.
    pub audio_window_secs: f64,
}

impl Default for SmartTurnConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            audio_window_secs: 8.0,
        }
    }
}

/// WebSocket connection tuning. All durations are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub open_timeout: f64,
    pub close_timeout: f64,
    pub ping_interval: f64,
    pub ping_timeout: f64,
    /// High-water mark for unacknowledged audio frames; `send_audio`
    /// waits for a slot once this many frames are queued.
    pub max_in_flight_frames: usize,
    /// Attempts for DNS/TCP-level connect failures.
    pub connect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            open_timeout: 30.0,
            close_timeout: 10.0,
            ping_interval: 20.0,
            ping_timeout: 60.0,
            max_in_flight_frames: 256,
            connect_attempts: 3,
        }
    }
}

/// Top-level configuration for a [`crate::core::agent::VoiceAgent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceAgentConfig {
    // Service
    pub language: String,
    pub operating_point: OperatingPoint,
    pub domain: Option<String>,
    pub output_locale: Option<String>,
    /// Endpoint override; falls back to `SPEECHMATICS_RT_URL`, then the
    /// production default.
    pub url: Option<String>,
    /// Application identifier appended to the endpoint URL.
    pub app: Option<String>,

    // Timing
    pub max_delay: f64,
    pub end_of_utterance_silence_trigger: f64,
    pub end_of_utterance_max_delay: f64,
    pub turn_policy: EndOfTurnPolicy,
    /// Largest in-segment silence before a new segment opens.
    /// Defaults to `max_delay` when unset.
    pub max_intra_gap: Option<f64>,

    // Vocabulary / punctuation
    pub additional_vocab: Vec<AdditionalVocabEntry>,
    pub punctuation_overrides: Option<serde_json::Value>,

    // Diarization
    pub enable_diarization: bool,
    pub speaker_sensitivity: f64,
    pub max_speakers: Option<u32>,
    pub prefer_current_speaker: bool,
    pub speaker_focus: SpeakerFocusConfig,
    pub known_speakers: Vec<SpeakerIdentifier>,

    // Segment emission
    pub emit_cadence: EmitCadence,
    /// Append a synthetic "." when a finalized turn lacks one.
    pub add_trailing_eos: bool,
    /// Words-per-minute above which a segment is annotated fast.
    pub fast_speaker_wpm: f64,
    /// Include per-word data on emitted segments.
    pub include_results: bool,

    // Smart turn
    pub smart_turn: SmartTurnConfig,

    // Audio
    pub sample_rate: u32,
    pub audio_encoding: AudioEncoding,

    // Transport
    pub connection: ConnectionConfig,
}

impl Default for VoiceAgentConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            operating_point: OperatingPoint::Enhanced,
            domain: None,
            output_locale: None,
            url: None,
            app: None,
            max_delay: 0.7,
            end_of_utterance_silence_trigger: 0.2,
            end_of_utterance_max_delay: 10.0,
            turn_policy: EndOfTurnPolicy::Fixed,
            max_intra_gap: None,
            additional_vocab: Vec::new(),
            punctuation_overrides: None,
            enable_diarization: false,
            speaker_sensitivity: 0.5,
            max_speakers: None,
            prefer_current_speaker: false,
            speaker_focus: SpeakerFocusConfig::default(),
            known_speakers: Vec::new(),
            emit_cadence: EmitCadence::Complete,
            add_trailing_eos: false,
            fast_speaker_wpm: 250.0,
            include_results: false,
            smart_turn: SmartTurnConfig::default(),
            sample_rate: 16000,
            audio_encoding: AudioEncoding::PcmS16le,
            connection: ConnectionConfig::default(),
        }
    }
}

impl VoiceAgentConfig {
    /// Load one of the named presets.
    pub fn preset(preset: Preset) -> Self {
        preset.config()
    }

    /// Effective intra-segment gap limit.
    pub fn intra_gap(&self) -> f64 {
        self.max_intra_gap.unwrap_or(self.max_delay)
    }

    /// Validate the configuration. Called by the agent before connect;
    /// failures are fatal and nothing is sent on the wire.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.max_delay <= 0.0 {
            return Err(VoiceError::Configuration(
                "max_delay must be positive".to_string(),
            ));
        }
        if self.end_of_utterance_silence_trigger >= self.max_delay {
            return Err(VoiceError::Configuration(format!(
                "end_of_utterance_silence_trigger ({}) must be lower than max_delay ({})",
                self.end_of_utterance_silence_trigger, self.max_delay
            )));
        }
        if self.end_of_utterance_max_delay < self.max_delay {
            return Err(VoiceError::Configuration(format!(
                "end_of_utterance_max_delay ({}) must be at least max_delay ({})",
                self.end_of_utterance_max_delay, self.max_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.speaker_sensitivity) {
            return Err(VoiceError::Configuration(
                "speaker_sensitivity must be within [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.smart_turn.threshold) {
            return Err(VoiceError::Configuration(
                "smart_turn.threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.sample_rate == 0 {
            return Err(VoiceError::Configuration(
                "sample_rate must be positive".to_string(),
            ));
        }

        let focus = &self.speaker_focus;
        if let Some(label) = focus
            .focus_speakers
            .iter()
            .find(|s| focus.ignore_speakers.contains(s))
        {
            return Err(VoiceError::Configuration(format!(
                "speaker '{label}' appears in both focus_speakers and ignore_speakers"
            )));
        }

        // `S<N>` is reserved for labels the engine assigns.
        if let Some(speaker) = self
            .known_speakers
            .iter()
            .find(|s| crate::core::speakers::is_engine_label(&s.label))
        {
            return Err(VoiceError::Configuration(format!(
                "known speaker label '{}' uses the reserved S<N> pattern",
                speaker.label
            )));
        }

        Ok(())
    }

    /// Build the wire transcription config for `StartRecognition`.
    pub fn transcription_config(&self) -> TranscriptionConfig {
        let mut config = TranscriptionConfig {
            language: self.language.clone(),
            operating_point: self.operating_point,
            output_locale: self.output_locale.clone(),
            domain: self.domain.clone(),
            diarization: self.enable_diarization.then(|| "speaker".to_string()),
            enable_partials: Some(true),
            max_delay: Some(self.max_delay),
            additional_vocab: None,
            punctuation_overrides: self.punctuation_overrides.clone(),
            speaker_diarization_config: None,
            conversation_config: None,
        };

        if !self.additional_vocab.is_empty() {
            config.additional_vocab = Some(self.additional_vocab.clone());
        }

        if self.enable_diarization {
            config.speaker_diarization_config = Some(SpeakerDiarizationConfig {
                speaker_sensitivity: Some(self.speaker_sensitivity),
                prefer_current_speaker: Some(self.prefer_current_speaker),
                max_speakers: self.max_speakers,
                speakers: (!self.known_speakers.is_empty()).then(|| self.known_speakers.clone()),
            });
        }

        // External turns ignore server endpointing, so don't request it.
        if self.turn_policy != EndOfTurnPolicy::External {
            config.conversation_config = Some(ConversationConfig {
                end_of_utterance_silence_trigger: Some(self.end_of_utterance_silence_trigger),
            });
        }

        config
    }

    /// Build the wire audio format record.
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            kind: "raw".to_string(),
            encoding: self.audio_encoding,
            sample_rate: self.sample_rate,
        }
    }
}

/// Wire-level transcription options carried by `StartRecognition` and
/// `SetRecognitionConfig`. `None` fields are omitted from the JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub language: String,
    pub operating_point: OperatingPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diarization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_partials: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_vocab: Option<Vec<AdditionalVocabEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub punctuation_overrides: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_diarization_config: Option<SpeakerDiarizationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_config: Option<ConversationConfig>,
}

/// Speaker diarization options inside [`TranscriptionConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerDiarizationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_speakers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_current_speaker: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speakers: Option<Vec<SpeakerIdentifier>>,
}

/// End-of-utterance endpointing options inside [`TranscriptionConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_utterance_silence_trigger: Option<f64>,
}

/// Wire audio format record inside `StartRecognition`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    #[serde(rename = "type")]
    pub kind: String,
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
}
