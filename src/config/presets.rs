//! Named configuration presets.
//!
//! Each preset tunes the latency/accuracy balance and the turn policy
//! for a common deployment shape. Values not listed here keep the
//! [`VoiceAgentConfig`] defaults.

use std::str::FromStr;

use super::{EmitCadence, EndOfTurnPolicy, VoiceAgentConfig};
use crate::errors::VoiceError;

/// The named presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Lowest latency: turns close on the first server end-of-utterance,
    /// partials emitted on any word change. Not suited to conversation.
    Fast,
    /// Conversational default: the end-of-turn window adapts to
    /// disfluencies, pauses and sentence completion.
    Adaptive,
    /// Conversation with an acoustic classifier confirming turn ends.
    SmartTurn,
    /// Meeting transcription: sentence-grained finals, generous delays.
    Scribe,
    /// Live captions: single stream, no diarization, timing updates.
    Captions,
    /// The caller drives turn ends; server endpointing is ignored.
    External,
}

impl Preset {
    /// All presets, in documentation order.
    pub const ALL: [Preset; 6] = [
        Preset::Fast,
        Preset::Adaptive,
        Preset::SmartTurn,
        Preset::Scribe,
        Preset::Captions,
        Preset::External,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Fast => "fast",
            Preset::Adaptive => "adaptive",
            Preset::SmartTurn => "smart_turn",
            Preset::Scribe => "scribe",
            Preset::Captions => "captions",
            Preset::External => "external",
        }
    }

    /// Build the configuration for this preset.
    pub fn config(&self) -> VoiceAgentConfig {
        match self {
            Preset::Fast => VoiceAgentConfig {
                max_delay: 0.5,
                end_of_utterance_silence_trigger: 0.15,
                turn_policy: EndOfTurnPolicy::Fixed,
                enable_diarization: true,
                emit_cadence: EmitCadence::Words,
                ..Default::default()
            },
            Preset::Adaptive => VoiceAgentConfig {
                max_delay: 0.9,
                end_of_utterance_silence_trigger: 0.2,
                turn_policy: EndOfTurnPolicy::Adaptive,
                enable_diarization: true,
                emit_cadence: EmitCadence::Complete,
                ..Default::default()
            },
            Preset::SmartTurn => VoiceAgentConfig {
                max_delay: 1.0,
                end_of_utterance_silence_trigger: 0.3,
                turn_policy: EndOfTurnPolicy::Smart,
                enable_diarization: true,
                emit_cadence: EmitCadence::Complete,
                ..Default::default()
            },
            Preset::Scribe => VoiceAgentConfig {
                max_delay: 1.2,
                end_of_utterance_silence_trigger: 0.3,
                turn_policy: EndOfTurnPolicy::Fixed,
                enable_diarization: true,
                emit_cadence: EmitCadence::Sentences,
                add_trailing_eos: true,
                ..Default::default()
            },
            Preset::Captions => VoiceAgentConfig {
                max_delay: 0.7,
                end_of_utterance_silence_trigger: 0.2,
                turn_policy: EndOfTurnPolicy::Fixed,
                enable_diarization: false,
                emit_cadence: EmitCadence::CompletePlusTiming,
                ..Default::default()
            },
            Preset::External => VoiceAgentConfig {
                max_delay: 0.7,
                end_of_utterance_silence_trigger: 0.2,
                turn_policy: EndOfTurnPolicy::External,
                enable_diarization: true,
                emit_cadence: EmitCadence::Complete,
                ..Default::default()
            },
        }
    }
}

impl FromStr for Preset {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Preset::Fast),
            "adaptive" => Ok(Preset::Adaptive),
            "smart_turn" => Ok(Preset::SmartTurn),
            "scribe" => Ok(Preset::Scribe),
            "captions" => Ok(Preset::Captions),
            "external" => Ok(Preset::External),
            other => Err(VoiceError::Configuration(format!(
                "unknown preset '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_preset_validates() {
        for preset in Preset::ALL {
            preset.config().validate().unwrap();
        }
    }

    #[test]
    fn preset_lookup_by_name() {
        for preset in Preset::ALL {
            assert_eq!(preset.name().parse::<Preset>().unwrap(), preset);
        }
        assert!("turbo".parse::<Preset>().is_err());
    }

    #[test]
    fn fast_preset_values() {
        let config = Preset::Fast.config();
        assert_eq!(config.max_delay, 0.5);
        assert_eq!(config.end_of_utterance_silence_trigger, 0.15);
        assert_eq!(config.turn_policy, EndOfTurnPolicy::Fixed);
        assert!(config.enable_diarization);
        assert_eq!(config.emit_cadence, EmitCadence::Words);
    }

    #[test]
    fn captions_preset_disables_diarization() {
        let config = Preset::Captions.config();
        assert!(!config.enable_diarization);
        assert_eq!(config.emit_cadence, EmitCadence::CompletePlusTiming);
    }

    #[test]
    fn smart_turn_preset_uses_smart_policy() {
        let config = Preset::SmartTurn.config();
        assert_eq!(config.turn_policy, EndOfTurnPolicy::Smart);
        assert_eq!(config.max_delay, 1.0);
        assert_eq!(config.end_of_utterance_silence_trigger, 0.3);
    }
}
