//! Core engine: session transport, transcript assembly, segmentation,
//! turn detection and the facade tying them together.

pub mod agent;
pub mod audio;
pub mod events;
pub mod messages;
pub mod segment;
pub mod session;
pub mod smart_turn;
pub mod speakers;
pub mod transcript;
pub mod turn;

pub use agent::VoiceAgent;
pub use events::{AgentEvent, AgentEventKind, EventEmitter, ListenerId};
pub use messages::{ClientMessage, LanguagePackInfo, ServerMessage};
pub use segment::{Annotation, AnnotationSet, SegmentEvent, SpeakerSegment};
pub use session::{RtSession, SessionEvent, SessionOptions, SessionStart, SessionState};
pub use smart_turn::{TurnClassifier, TurnPrediction};
pub use speakers::SpeakerRegistry;
pub use turn::{TurnDetector, TurnPhase};
