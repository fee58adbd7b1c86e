//! Real-time speech-to-text client with a voice-agent layer on top:
//! speech segmentation, speaker focus and end-of-turn detection.
//!
//! The transport speaks the Speechmatics RT WebSocket protocol. On top
//! of the raw per-word transcription stream, [`core::agent::VoiceAgent`]
//! groups words into per-speaker segments, annotates them (sentence
//! boundaries, disfluencies, speaking rate) and decides when a
//! conversational turn has ended under one of four interchangeable
//! policies.
//!
//! # Quick start
//!
//! ```no_run
//! use sm_voice::config::{Preset, VoiceAgentConfig};
//! use sm_voice::core::agent::VoiceAgent;
//! use sm_voice::core::events::AgentEventKind;
//!
//! # async fn run() -> Result<(), sm_voice::errors::VoiceError> {
//! // Reads SPEECHMATICS_API_KEY from the environment.
//! let mut agent = VoiceAgent::new(VoiceAgentConfig::preset(Preset::Adaptive));
//!
//! agent.on(AgentEventKind::Segments, |event| println!("{event:?}"));
//! agent.on(AgentEventKind::EndOfTurn, |event| println!("{event:?}"));
//!
//! agent.connect().await?;
//! // ... stream PCM with agent.send_audio(...) ...
//! agent.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod core;
pub mod errors;

// Re-export commonly used items for convenience
pub use auth::{AuthProvider, StaticKeyAuth};
pub use config::{Preset, VoiceAgentConfig};
pub use core::agent::VoiceAgent;
pub use core::events::{AgentEvent, AgentEventKind};
pub use errors::{VoiceError, VoiceResult};
