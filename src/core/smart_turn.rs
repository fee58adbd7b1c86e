//! Smart-turn classifier capability.
//!
//! The acoustic model that scores "has this speaker finished their
//! turn?" lives outside the core. It plugs in through [`TurnClassifier`];
//! when the capability is absent the turn detector logs one warning and
//! downgrades to the adaptive policy.

use async_trait::async_trait;

use crate::errors::{VoiceError, VoiceResult};

/// Outcome of one classifier invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnPrediction {
    /// `probability >= threshold` at the configured threshold.
    pub complete: bool,
    /// P(turn complete), in [0, 1].
    pub probability: f32,
}

/// Acoustic end-of-turn classifier over a short PCM window.
#[async_trait]
pub trait TurnClassifier: Send + Sync {
    /// Prepare the classifier (load weights, warm up). Called once
    /// before the first inference.
    async fn load(&self) -> VoiceResult<()>;

    /// Score the probability that the speaker has completed their turn.
    /// `pcm` is signed 16-bit mono at `sample_rate`.
    async fn infer(&self, pcm: &[i16], sample_rate: u32) -> VoiceResult<f32>;
}

/// Run the classifier and apply the decision threshold.
pub async fn predict(
    classifier: &dyn TurnClassifier,
    pcm: &[i16],
    sample_rate: u32,
    threshold: f32,
) -> VoiceResult<TurnPrediction> {
    if pcm.is_empty() {
        return Err(VoiceError::CapabilityAbsent(
            "no buffered audio for turn classification".to_string(),
        ));
    }
    let probability = classifier.infer(pcm, sample_rate).await?;
    Ok(TurnPrediction {
        complete: probability >= threshold,
        probability,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::FixedClassifier;
    use super::*;

    #[tokio::test]
    async fn prediction_applies_threshold() {
        let classifier = FixedClassifier::new(0.85);
        let prediction = predict(&classifier, &[0i16; 1600], 16000, 0.8).await.unwrap();
        assert!(prediction.complete);
        assert_eq!(prediction.probability, 0.85);

        let prediction = predict(&classifier, &[0i16; 1600], 16000, 0.9).await.unwrap();
        assert!(!prediction.complete);
    }

    #[tokio::test]
    async fn empty_audio_is_rejected() {
        let classifier = FixedClassifier::new(0.5);
        assert!(matches!(
            predict(&classifier, &[], 16000, 0.8).await,
            Err(VoiceError::CapabilityAbsent(_))
        ));
    }
}
