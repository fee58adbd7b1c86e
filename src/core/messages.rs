//! WebSocket message types for the RT transcription API.
//!
//! Two frame categories share the socket:
//!
//! - **Structured frames**: JSON text payloads with a `message`
//!   discriminator. [`ClientMessage`] covers the upstream kinds,
//!   [`ServerMessage`] the downstream kinds.
//! - **Binary frames**: raw PCM audio with no per-frame header. These
//!   never pass through this module; the session writes them directly.
//!
//! Parsing peeks at the `message` field first and only then decodes the
//! full payload. Unknown discriminators map to [`ServerMessage::Unknown`]
//! so newer servers don't break older clients; malformed JSON is a hard
//! protocol error.

use serde::{Deserialize, Serialize};

use crate::config::{AudioFormat, TranscriptionConfig};
use crate::errors::{VoiceError, VoiceResult};

// =============================================================================
// Outgoing messages (client to server)
// =============================================================================

/// Structured frames sent from client to server.
///
/// Audio is sent as raw binary WebSocket frames, not through this enum.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "message")]
pub enum ClientMessage {
    /// Opens the recognition session. Must be the first frame.
    StartRecognition {
        audio_format: AudioFormat,
        transcription_config: TranscriptionConfig,
    },
    /// No more audio will be sent. `last_seq_no` is the 1-based count of
    /// binary frames transmitted since the session opened.
    EndOfStream { last_seq_no: u64 },
    /// Updates transcription options mid-session.
    SetRecognitionConfig {
        transcription_config: TranscriptionConfig,
    },
    /// Requests a `SpeakersResult` with the session's speaker data.
    GetSpeakers,
}

impl ClientMessage {
    /// Serialize to the JSON text payload.
    pub fn to_json(&self) -> VoiceResult<String> {
        serde_json::to_string(self)
            .map_err(|e| VoiceError::Protocol(format!("failed to encode client message: {e}")))
    }
}

// =============================================================================
// Incoming messages (server to client)
// =============================================================================

/// Information about the language pack serving the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguagePackInfo {
    #[serde(default)]
    pub adapted: bool,
    #[serde(default = "default_true")]
    pub itn: bool,
    #[serde(default = "default_language_description")]
    pub language_description: String,
    #[serde(default = "default_word_delimiter")]
    pub word_delimiter: String,
    #[serde(default = "default_writing_direction")]
    pub writing_direction: String,
}

fn default_true() -> bool {
    true
}

fn default_language_description() -> String {
    "English".to_string()
}

fn default_word_delimiter() -> String {
    " ".to_string()
}

fn default_writing_direction() -> String {
    "left-to-right".to_string()
}

impl Default for LanguagePackInfo {
    fn default() -> Self {
        Self {
            adapted: false,
            itn: true,
            language_description: default_language_description(),
            word_delimiter: default_word_delimiter(),
            writing_direction: default_writing_direction(),
        }
    }
}

/// `RecognitionStarted` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecognitionStarted {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub language_pack_info: Option<LanguagePackInfo>,
}

/// Time range attached to transcript and utterance payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct TimeMetadata {
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
}

/// Metadata block on `AddTranscript` / `AddPartialTranscript`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TranscriptMetadata {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
}

/// One recognition alternative for a result.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultAlternative {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One word or punctuation result inside a transcript payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecognitionResult {
    /// `"word"` or `"punctuation"`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
    /// Marks the end of a sentence.
    #[serde(default)]
    pub is_eos: bool,
    /// `"previous"` or `"next"` for punctuation that glues to a word.
    #[serde(default)]
    pub attaches_to: Option<String>,
    #[serde(default)]
    pub alternatives: Vec<ResultAlternative>,
}

impl RecognitionResult {
    pub fn is_word(&self) -> bool {
        self.kind == "word"
    }

    pub fn is_punctuation(&self) -> bool {
        self.kind == "punctuation"
    }

    /// The first (best) alternative, if any.
    pub fn best(&self) -> Option<&ResultAlternative> {
        self.alternatives.first()
    }
}

/// `AddTranscript` / `AddPartialTranscript` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TranscriptPayload {
    #[serde(default)]
    pub metadata: TranscriptMetadata,
    #[serde(default)]
    pub results: Vec<RecognitionResult>,
}

/// One entry of a `SpeakersResult`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpeakerResultEntry {
    pub label: String,
    #[serde(default)]
    pub speaker_identifiers: Vec<String>,
}

/// `Info` / `Warning` / `Error` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerNotice {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub reason: String,
}

/// Structured frames received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// The session is live; audio may now be sent.
    RecognitionStarted(RecognitionStarted),
    /// Acknowledges one binary audio frame. `seq_no` is 1-based and
    /// matches the client's count of frames sent.
    AudioAdded { seq_no: u64 },
    /// Interim transcription; may be revised.
    AddPartialTranscript(TranscriptPayload),
    /// Committed transcription; stable for the session.
    AddTranscript(TranscriptPayload),
    /// Silence-based endpointing signal from the service.
    EndOfUtterance { metadata: TimeMetadata },
    /// Speaker data for the session.
    SpeakersResult { speakers: Vec<SpeakerResultEntry> },
    /// Informational notice.
    Info(ServerNotice),
    /// Non-fatal warning, forwarded to listeners.
    Warning(ServerNotice),
    /// Unrecoverable server error; terminates the session.
    Error(ServerNotice),
    /// All transcripts have been delivered; the session is over.
    EndOfTranscript,
    /// A discriminator this client does not know. Logged and ignored.
    Unknown(String),
}

impl ServerMessage {
    /// Parse a text frame.
    ///
    /// Malformed JSON (or JSON without a `message` field) is a protocol
    /// error and fails the session. An unknown `message` value parses
    /// successfully as [`ServerMessage::Unknown`].
    pub fn parse(text: &str) -> VoiceResult<Self> {
        #[derive(Deserialize)]
        struct MessagePeek {
            message: String,
        }

        let peek: MessagePeek = serde_json::from_str(text)
            .map_err(|e| VoiceError::Protocol(format!("malformed server frame: {e}")))?;

        fn decode_err(kind: &str) -> impl FnOnce(serde_json::Error) -> VoiceError + '_ {
            move |e| VoiceError::Protocol(format!("malformed {kind} frame: {e}"))
        }

        match peek.message.as_str() {
            "RecognitionStarted" => {
                let payload: RecognitionStarted = serde_json::from_str(text).map_err(decode_err(&peek.message))?;
                Ok(ServerMessage::RecognitionStarted(payload))
            }
            "AudioAdded" => {
                #[derive(Deserialize)]
                struct AudioAdded {
                    seq_no: u64,
                }
                let payload: AudioAdded = serde_json::from_str(text).map_err(decode_err(&peek.message))?;
                Ok(ServerMessage::AudioAdded {
                    seq_no: payload.seq_no,
                })
            }
            "AddPartialTranscript" => {
                let payload: TranscriptPayload = serde_json::from_str(text).map_err(decode_err(&peek.message))?;
                Ok(ServerMessage::AddPartialTranscript(payload))
            }
            "AddTranscript" => {
                let payload: TranscriptPayload = serde_json::from_str(text).map_err(decode_err(&peek.message))?;
                Ok(ServerMessage::AddTranscript(payload))
            }
            "EndOfUtterance" => {
                #[derive(Deserialize)]
                struct EndOfUtterance {
                    #[serde(default)]
                    metadata: TimeMetadata,
                }
                let payload: EndOfUtterance = serde_json::from_str(text).map_err(decode_err(&peek.message))?;
                Ok(ServerMessage::EndOfUtterance {
                    metadata: payload.metadata,
                })
            }
            "SpeakersResult" => {
                #[derive(Deserialize)]
                struct SpeakersResult {
                    #[serde(default)]
                    speakers: Vec<SpeakerResultEntry>,
                }
                let payload: SpeakersResult = serde_json::from_str(text).map_err(decode_err(&peek.message))?;
                Ok(ServerMessage::SpeakersResult {
                    speakers: payload.speakers,
                })
            }
            "Info" => {
                let payload: ServerNotice = serde_json::from_str(text).map_err(decode_err(&peek.message))?;
                Ok(ServerMessage::Info(payload))
            }
            "Warning" => {
                let payload: ServerNotice = serde_json::from_str(text).map_err(decode_err(&peek.message))?;
                Ok(ServerMessage::Warning(payload))
            }
            "Error" => {
                let payload: ServerNotice = serde_json::from_str(text).map_err(decode_err(&peek.message))?;
                Ok(ServerMessage::Error(payload))
            }
            "EndOfTranscript" => Ok(ServerMessage::EndOfTranscript),
            _ => Ok(ServerMessage::Unknown(peek.message)),
        }
    }

    /// Whether this message carries transcript words.
    pub fn is_transcript(&self) -> bool {
        matches!(
            self,
            ServerMessage::AddPartialTranscript(_) | ServerMessage::AddTranscript(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoiceAgentConfig;

    // =========================================================================
    // ClientMessage serialization
    // =========================================================================

    #[test]
    fn start_recognition_wire_shape() {
        let config = VoiceAgentConfig::default();
        let msg = ClientMessage::StartRecognition {
            audio_format: config.audio_format(),
            transcription_config: config.transcription_config(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["message"], "StartRecognition");
        assert_eq!(json["audio_format"]["type"], "raw");
        assert_eq!(json["transcription_config"]["language"], "en");
    }

    #[test]
    fn end_of_stream_carries_last_seq_no() {
        let msg = ClientMessage::EndOfStream { last_seq_no: 10 };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["message"], "EndOfStream");
        assert_eq!(json["last_seq_no"], 10);
    }

    #[test]
    fn set_recognition_config_wraps_the_config() {
        let msg = ClientMessage::SetRecognitionConfig {
            transcription_config: VoiceAgentConfig::default().transcription_config(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["message"], "SetRecognitionConfig");
        assert_eq!(json["transcription_config"]["enable_partials"], true);
    }

    #[test]
    fn get_speakers_is_bare() {
        let json: serde_json::Value =
            serde_json::from_str(&ClientMessage::GetSpeakers.to_json().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"message": "GetSpeakers"}));
    }

    // =========================================================================
    // ServerMessage parsing
    // =========================================================================

    #[test]
    fn parse_recognition_started() {
        let text = r#"{
            "message": "RecognitionStarted",
            "id": "2f4b6a9c",
            "language_pack_info": {"word_delimiter": " ", "language_description": "English"}
        }"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::RecognitionStarted(started) => {
                assert_eq!(started.id.as_deref(), Some("2f4b6a9c"));
                let pack = started.language_pack_info.unwrap();
                assert_eq!(pack.word_delimiter, " ");
                assert!(pack.itn);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_audio_added() {
        let msg = ServerMessage::parse(r#"{"message": "AudioAdded", "seq_no": 7}"#).unwrap();
        assert_eq!(msg, ServerMessage::AudioAdded { seq_no: 7 });
    }

    #[test]
    fn parse_partial_transcript_words() {
        let text = r#"{
            "message": "AddPartialTranscript",
            "metadata": {"transcript": "Welcome", "start_time": 0.36, "end_time": 0.92},
            "results": [{
                "type": "word",
                "start_time": 0.36,
                "end_time": 0.92,
                "alternatives": [{"content": "Welcome", "confidence": 0.83, "speaker": "S1"}]
            }]
        }"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::AddPartialTranscript(payload) => {
                assert_eq!(payload.results.len(), 1);
                let result = &payload.results[0];
                assert!(result.is_word());
                assert_eq!(result.best().unwrap().content, "Welcome");
                assert_eq!(result.best().unwrap().speaker.as_deref(), Some("S1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_final_with_punctuation_and_eos() {
        let text = r#"{
            "message": "AddTranscript",
            "metadata": {"transcript": "Hello.", "start_time": 0.1, "end_time": 0.6},
            "results": [
                {"type": "word", "start_time": 0.1, "end_time": 0.5,
                 "alternatives": [{"content": "Hello", "confidence": 0.99}]},
                {"type": "punctuation", "start_time": 0.5, "end_time": 0.5,
                 "is_eos": true, "attaches_to": "previous",
                 "alternatives": [{"content": ".", "confidence": 1.0}]}
            ]
        }"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::AddTranscript(payload) => {
                assert_eq!(payload.results.len(), 2);
                assert!(payload.results[1].is_punctuation());
                assert!(payload.results[1].is_eos);
                assert_eq!(payload.results[1].attaches_to.as_deref(), Some("previous"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_end_of_utterance() {
        let text = r#"{"message": "EndOfUtterance", "metadata": {"start_time": 1.0, "end_time": 1.2}}"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::EndOfUtterance { metadata } => {
                assert_eq!(metadata.end_time, 1.2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_speakers_result() {
        let text = r#"{
            "message": "SpeakersResult",
            "speakers": [{"label": "S1", "speaker_identifiers": ["spkr_abc"]}]
        }"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::SpeakersResult { speakers } => {
                assert_eq!(speakers.len(), 1);
                assert_eq!(speakers[0].label, "S1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_error_notice() {
        let text = r#"{"message": "Error", "type": "invalid_audio_type", "reason": "bad format"}"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::Error(notice) => {
                assert_eq!(notice.kind, "invalid_audio_type");
                assert_eq!(notice.reason, "bad format");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_end_of_transcript() {
        let msg = ServerMessage::parse(r#"{"message": "EndOfTranscript"}"#).unwrap();
        assert_eq!(msg, ServerMessage::EndOfTranscript);
    }

    #[test]
    fn unknown_discriminator_is_tolerated() {
        let msg = ServerMessage::parse(r#"{"message": "AddTranslation", "results": []}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown("AddTranslation".to_string()));
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        assert!(matches!(
            ServerMessage::parse("{not json"),
            Err(VoiceError::Protocol(_))
        ));
        assert!(matches!(
            ServerMessage::parse(r#"{"no_message_field": 1}"#),
            Err(VoiceError::Protocol(_))
        ));
    }
}
