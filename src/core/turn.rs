//! End-of-turn detection.
//!
//! A turn moves `open -> closing -> closed`. The active policy decides
//! when to begin closing; the close itself lands only after a short
//! quiescence window with no new words, so racing word arrivals cannot
//! produce duplicate `EndOfTurn`s. A hard ceiling closes any open turn
//! regardless of policy.
//!
//! Timers run as spawned sleep tasks that post a generation-stamped
//! [`TurnTimerEvent`] back to the owner's processing loop; arming a new
//! timer invalidates the previous one, so two timers can never act on
//! the same turn.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{EndOfTurnPolicy, SmartTurnConfig};
use crate::core::audio::AudioRingBuffer;
use crate::core::segment::{Annotation, SpeakerSegment};
use crate::core::smart_turn::{predict, TurnClassifier};

/// Seconds of word silence required to land a close.
pub const MIN_QUIESCENCE: f64 = 0.05;

/// Turn lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// No turn in progress.
    Idle,
    /// Words have arrived; the turn is live.
    Open,
    /// A close was decided; waiting out the quiescence window.
    Closing,
}

/// Timer and classifier callbacks posted to the owning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTimerEvent {
    /// An adaptive/smart prediction window elapsed with no new word.
    WindowElapsed { generation: u64 },
    /// The quiescence window elapsed; the close may land.
    QuiescenceElapsed { generation: u64 },
    /// The hard ceiling elapsed for the current turn.
    CeilingElapsed { generation: u64 },
    /// The smart classifier voted on the current turn.
    SmartResult { generation: u64, complete: bool },
}

/// Instructions for the owner after feeding the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnCommand {
    /// Surface an `EndOfTurnPrediction` with the window length.
    EmitPrediction {
        turn_id: u64,
        ttl: f64,
        reasons: Vec<String>,
    },
    /// Flush buffered segments as final and emit `EndOfTurn`.
    FinalizeTurn { turn_id: u64 },
}

/// Timing inputs for the policies. All seconds.
#[derive(Debug, Clone, Copy)]
pub struct TurnTiming {
    pub silence_trigger: f64,
    pub max_delay: f64,
    pub max_ceiling: f64,
}

/// Policy-driven end-of-turn state machine.
pub struct TurnDetector {
    policy: EndOfTurnPolicy,
    timing: TurnTiming,
    smart_config: SmartTurnConfig,
    classifier: Option<Arc<dyn TurnClassifier>>,
    /// PCM ring for the smart policy; appended by the audio path.
    audio_ring: Option<Arc<AudioRingBuffer>>,
    events_tx: mpsc::UnboundedSender<TurnTimerEvent>,

    phase: TurnPhase,
    turn_id: u64,
    /// Validity stamp for window/quiescence/smart callbacks.
    generation: u64,
    /// Validity stamp for the per-turn ceiling.
    ceiling_generation: u64,
    window_task: Option<JoinHandle<()>>,
    quiescence_task: Option<JoinHandle<()>>,
    ceiling_task: Option<JoinHandle<()>>,
}

impl TurnDetector {
    /// Build a detector. A smart policy without a classifier downgrades
    /// to adaptive with a single warning.
    pub fn new(
        requested_policy: EndOfTurnPolicy,
        timing: TurnTiming,
        smart_config: SmartTurnConfig,
        classifier: Option<Arc<dyn TurnClassifier>>,
        audio_ring: Option<Arc<AudioRingBuffer>>,
        events_tx: mpsc::UnboundedSender<TurnTimerEvent>,
    ) -> Self {
        let policy = match requested_policy {
            EndOfTurnPolicy::Smart if classifier.is_none() => {
                warn!("smart turn classifier unavailable, falling back to adaptive policy");
                EndOfTurnPolicy::Adaptive
            }
            other => other,
        };

        Self {
            policy,
            timing,
            smart_config,
            classifier,
            audio_ring,
            events_tx,
            phase: TurnPhase::Idle,
            turn_id: 0,
            generation: 0,
            ceiling_generation: 0,
            window_task: None,
            quiescence_task: None,
            ceiling_task: None,
        }
    }

    /// The policy actually in effect (after any downgrade).
    pub fn policy(&self) -> EndOfTurnPolicy {
        self.policy
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Id the next `EndOfTurn` will carry.
    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    /// The ring the audio path appends to (smart policy only).
    pub fn audio_ring(&self) -> Option<&Arc<AudioRingBuffer>> {
        self.audio_ring.as_ref()
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// A word arrived. Opens the turn, or cancels an in-flight close or
    /// prediction window.
    pub fn on_word_activity(&mut self) {
        match self.phase {
            TurnPhase::Idle => {
                self.phase = TurnPhase::Open;
                self.arm_ceiling();
                debug!(turn_id = self.turn_id, "turn opened");
            }
            TurnPhase::Open => {
                // A pending prediction window is void once speech resumes.
                if self.window_task.is_some() {
                    self.invalidate_timers();
                }
            }
            TurnPhase::Closing => {
                debug!(turn_id = self.turn_id, "close cancelled by word activity");
                self.invalidate_timers();
                self.phase = TurnPhase::Open;
            }
        }
    }

    /// Server end-of-utterance. The policy decides what happens next.
    pub fn on_end_of_utterance(&mut self, last_segment: Option<&SpeakerSegment>) -> Vec<TurnCommand> {
        if self.phase != TurnPhase::Open {
            return Vec::new();
        }

        match self.policy {
            EndOfTurnPolicy::Fixed => {
                self.begin_close();
                Vec::new()
            }
            EndOfTurnPolicy::Adaptive => {
                let (ttl, reasons) = self.adaptive_window(last_segment, None);
                self.arm_window(ttl);
                vec![TurnCommand::EmitPrediction {
                    turn_id: self.turn_id,
                    ttl,
                    reasons,
                }]
            }
            EndOfTurnPolicy::Smart => {
                self.spawn_smart_inference();
                Vec::new()
            }
            EndOfTurnPolicy::External => Vec::new(),
        }
    }

    /// Timer/classifier callback from the owner's loop.
    pub fn on_timer_event(&mut self, event: TurnTimerEvent) -> Vec<TurnCommand> {
        match event {
            TurnTimerEvent::WindowElapsed { generation } => {
                if generation == self.generation && self.phase == TurnPhase::Open {
                    debug!(turn_id = self.turn_id, "prediction window elapsed");
                    self.begin_close();
                }
                Vec::new()
            }
            TurnTimerEvent::QuiescenceElapsed { generation } => {
                if generation == self.generation && self.phase == TurnPhase::Closing {
                    return vec![self.close_turn()];
                }
                Vec::new()
            }
            TurnTimerEvent::CeilingElapsed { generation } => {
                if generation == self.ceiling_generation && self.phase != TurnPhase::Idle {
                    info!(turn_id = self.turn_id, "turn ceiling reached, forcing close");
                    self.begin_close();
                }
                Vec::new()
            }
            TurnTimerEvent::SmartResult { generation, complete } => {
                if generation != self.generation || self.phase != TurnPhase::Open {
                    return Vec::new();
                }
                if complete {
                    self.begin_close();
                } else {
                    debug!(turn_id = self.turn_id, "classifier voted incomplete, turn stays open");
                }
                Vec::new()
            }
        }
    }

    /// Explicit close requested via `finalize(end_of_turn)`. Closes the
    /// current turn immediately; under the external policy this is the
    /// only close path besides the ceiling.
    pub fn force_close(&mut self) -> Vec<TurnCommand> {
        if self.phase == TurnPhase::Idle {
            return Vec::new();
        }
        vec![self.close_turn()]
    }

    /// Abort all timers; the session is over.
    pub fn shutdown(&mut self) {
        self.invalidate_timers();
        self.cancel_ceiling();
        self.phase = TurnPhase::Idle;
    }

    // =========================================================================
    // Close sequencing
    // =========================================================================

    fn begin_close(&mut self) {
        if self.phase != TurnPhase::Open {
            return;
        }
        self.phase = TurnPhase::Closing;
        self.arm_quiescence();
    }

    fn close_turn(&mut self) -> TurnCommand {
        let turn_id = self.turn_id;
        self.turn_id += 1;
        self.phase = TurnPhase::Idle;
        self.invalidate_timers();
        self.cancel_ceiling();
        info!(turn_id, "turn closed");
        TurnCommand::FinalizeTurn { turn_id }
    }

    // =========================================================================
    // Adaptive window
    // =========================================================================

    /// Window length from the content of the last active segment,
    /// clamped to `[silence_trigger, max_delay]`.
    fn adaptive_window(
        &self,
        last_segment: Option<&SpeakerSegment>,
        smart_vote: Option<bool>,
    ) -> (f64, Vec<String>) {
        let mut reasons: Vec<String> = Vec::new();
        let mut multiplier = 1.0;

        if let Some(segment) = last_segment {
            let annotations = &segment.annotations;
            if annotations.has(&[Annotation::VerySlowSpeaker]) {
                multiplier += 3.0;
                reasons.push("very_slow_speaker".to_string());
            }
            if annotations.has(&[Annotation::SlowSpeaker]) {
                multiplier += 2.0;
                reasons.push("slow_speaker".to_string());
            }
            if annotations.has(&[Annotation::EndsWithDisfluency]) {
                multiplier += 2.5;
                reasons.push("ends_with_disfluency".to_string());
            } else if annotations.has(&[Annotation::HasDisfluency]) {
                multiplier += 0.25;
                reasons.push("has_disfluency".to_string());
            }
            // The sentence state adjusts the window only at the
            // extremes: nothing sentence-final yet widens it, a
            // committed end of sentence narrows it. Other trailing
            // punctuation (a comma, say) still counts as unfinished.
            if !annotations.has(&[Annotation::EndsWithEos]) {
                multiplier += 1.0;
                reasons.push("does_not_end_with_eos".to_string());
            } else if annotations.has(&[Annotation::EndsWithEos, Annotation::EndsWithFinal]) {
                multiplier -= 0.3;
                reasons.push("ends_with_eos_and_final".to_string());
            }
        } else {
            reasons.push("no_segments".to_string());
        }

        if let Some(vote) = smart_vote {
            if vote {
                multiplier -= 1.0;
                reasons.push("classifier_complete".to_string());
            } else {
                multiplier += 2.5;
                reasons.push("classifier_incomplete".to_string());
            }
        }

        let base = self.timing.silence_trigger;
        let ttl = (base * multiplier).clamp(base, self.timing.max_delay);
        (ttl, reasons)
    }

    // =========================================================================
    // Smart inference
    // =========================================================================

    fn spawn_smart_inference(&mut self) {
        let (Some(classifier), Some(ring)) = (self.classifier.clone(), self.audio_ring.clone())
        else {
            // Policy construction guarantees both; treat as a window.
            let (ttl, _) = self.adaptive_window(None, None);
            self.arm_window(ttl);
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let threshold = self.smart_config.threshold;
        let window_secs = self.smart_config.audio_window_secs;
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            let end = ring.total_time();
            let pcm = AudioRingBuffer::as_i16_samples(&ring.slice(end - window_secs, end));
            let complete = match predict(&*classifier, &pcm, ring.sample_rate(), threshold).await {
                Ok(prediction) => {
                    debug!(
                        probability = prediction.probability,
                        complete = prediction.complete,
                        "smart turn prediction"
                    );
                    prediction.complete
                }
                Err(e) => {
                    // Inference trouble must not hold the turn open.
                    warn!("smart turn inference failed: {e}, closing on timeout path");
                    true
                }
            };
            let _ = tx.send(TurnTimerEvent::SmartResult { generation, complete });
        });
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn invalidate_timers(&mut self) {
        self.generation += 1;
        if let Some(task) = self.window_task.take() {
            task.abort();
        }
        if let Some(task) = self.quiescence_task.take() {
            task.abort();
        }
    }

    fn arm_window(&mut self, ttl: f64) {
        self.invalidate_timers();
        let generation = self.generation;
        let tx = self.events_tx.clone();
        self.window_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(ttl.max(0.0))).await;
            let _ = tx.send(TurnTimerEvent::WindowElapsed { generation });
        }));
    }

    fn arm_quiescence(&mut self) {
        self.invalidate_timers();
        let generation = self.generation;
        let tx = self.events_tx.clone();
        self.quiescence_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(MIN_QUIESCENCE)).await;
            let _ = tx.send(TurnTimerEvent::QuiescenceElapsed { generation });
        }));
    }

    fn arm_ceiling(&mut self) {
        self.cancel_ceiling();
        let generation = self.ceiling_generation;
        let ceiling = self.timing.max_ceiling;
        let tx = self.events_tx.clone();
        self.ceiling_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(ceiling.max(0.0))).await;
            let _ = tx.send(TurnTimerEvent::CeilingElapsed { generation });
        }));
    }

    fn cancel_ceiling(&mut self) {
        self.ceiling_generation += 1;
        if let Some(task) = self.ceiling_task.take() {
            task.abort();
        }
    }
}

impl Drop for TurnDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::segment::AnnotationSet;

    fn timing() -> TurnTiming {
        TurnTiming {
            silence_trigger: 0.2,
            max_delay: 1.0,
            max_ceiling: 10.0,
        }
    }

    fn detector(policy: EndOfTurnPolicy) -> (TurnDetector, mpsc::UnboundedReceiver<TurnTimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let detector = TurnDetector::new(
            policy,
            timing(),
            SmartTurnConfig::default(),
            None,
            None,
            tx,
        );
        (detector, rx)
    }

    fn segment_with(annotations: &[Annotation]) -> SpeakerSegment {
        let mut set = AnnotationSet::default();
        for a in annotations {
            set.add(*a);
        }
        SpeakerSegment {
            speaker_id: Some("S1".into()),
            is_active: true,
            language: Some("en".into()),
            text: "test".into(),
            start_time: 0.0,
            end_time: 0.6,
            annotations: set,
            words: None,
        }
    }

    #[tokio::test]
    async fn fixed_policy_closes_after_quiescence() {
        let (mut det, mut rx) = detector(EndOfTurnPolicy::Fixed);
        det.on_word_activity();
        assert_eq!(det.phase(), TurnPhase::Open);

        let commands = det.on_end_of_utterance(None);
        assert!(commands.is_empty());
        assert_eq!(det.phase(), TurnPhase::Closing);

        // Quiescence timer fires; drain the real timer event.
        let event = rx.recv().await.unwrap();
        let commands = det.on_timer_event(event);
        assert_eq!(commands, vec![TurnCommand::FinalizeTurn { turn_id: 0 }]);
        assert_eq!(det.phase(), TurnPhase::Idle);
        assert_eq!(det.turn_id(), 1);
    }

    #[tokio::test]
    async fn word_during_quiescence_cancels_the_close() {
        let (mut det, _rx) = detector(EndOfTurnPolicy::Fixed);
        det.on_word_activity();
        det.on_end_of_utterance(None);
        assert_eq!(det.phase(), TurnPhase::Closing);

        det.on_word_activity();
        assert_eq!(det.phase(), TurnPhase::Open);

        // Even if the cancelled quiescence timer had managed to fire,
        // its stamp (generation 1) is stale and must be ignored.
        let stale = TurnTimerEvent::QuiescenceElapsed { generation: 1 };
        assert!(det.on_timer_event(stale).is_empty());
        assert_eq!(det.turn_id(), 0);
    }

    #[tokio::test]
    async fn adaptive_window_is_clamped_and_reported() {
        let (mut det, _rx) = detector(EndOfTurnPolicy::Adaptive);
        det.on_word_activity();

        let segment = segment_with(&[Annotation::HasDisfluency]);
        let commands = det.on_end_of_utterance(Some(&segment));
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            TurnCommand::EmitPrediction { turn_id, ttl, reasons } => {
                assert_eq!(*turn_id, 0);
                // has_disfluency (+0.25) and no end of sentence (+1.0).
                assert!(*ttl > 0.2 && *ttl <= 1.0, "ttl out of bounds: {ttl}");
                assert!(reasons.contains(&"has_disfluency".to_string()));
                assert!(reasons.contains(&"does_not_end_with_eos".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn adaptive_window_never_leaves_bounds() {
        let (det, _rx) = detector(EndOfTurnPolicy::Adaptive);
        let cases = [
            segment_with(&[]),
            segment_with(&[Annotation::EndsWithDisfluency]),
            segment_with(&[
                Annotation::EndsWithEos,
                Annotation::EndsWithPunctuation,
                Annotation::EndsWithFinal,
            ]),
            segment_with(&[Annotation::HasDisfluency, Annotation::EndsWithPunctuation]),
            segment_with(&[Annotation::VerySlowSpeaker, Annotation::EndsWithDisfluency]),
            segment_with(&[Annotation::SlowSpeaker]),
        ];
        for segment in &cases {
            let (ttl, _) = det.adaptive_window(Some(segment), None);
            assert!(
                (0.2..=1.0).contains(&ttl),
                "window {ttl} outside [silence_trigger, max_delay]"
            );
        }
    }

    #[tokio::test]
    async fn committed_eos_shrinks_the_window() {
        let (det, _rx) = detector(EndOfTurnPolicy::Adaptive);
        let plain = segment_with(&[]);
        let finished = segment_with(&[
            Annotation::EndsWithEos,
            Annotation::EndsWithPunctuation,
            Annotation::EndsWithFinal,
        ]);
        let (ttl_plain, _) = det.adaptive_window(Some(&plain), None);
        let (ttl_finished, reasons) = det.adaptive_window(Some(&finished), None);
        assert!(ttl_finished < ttl_plain);
        assert!(reasons.contains(&"ends_with_eos_and_final".to_string()));
    }

    #[tokio::test]
    async fn trailing_comma_still_widens_the_window() {
        let (det, _rx) = detector(EndOfTurnPolicy::Adaptive);
        // A comma is punctuation but not a sentence end; the speaker is
        // mid-thought and gets the full widening.
        let comma = segment_with(&[Annotation::EndsWithPunctuation, Annotation::EndsWithFinal]);
        let (ttl, reasons) = det.adaptive_window(Some(&comma), None);
        assert!(ttl > 0.2, "comma must not be treated as a sentence end: {ttl}");
        assert!(reasons.contains(&"does_not_end_with_eos".to_string()));
    }

    #[tokio::test]
    async fn partial_eos_gets_no_reduction() {
        let (det, _rx) = detector(EndOfTurnPolicy::Adaptive);
        // The sentence mark is still a hypothesis; the reduction waits
        // for the committed word.
        let partial_eos = segment_with(&[
            Annotation::EndsWithEos,
            Annotation::EndsWithPunctuation,
            Annotation::HasPartial,
        ]);
        let (ttl, reasons) = det.adaptive_window(Some(&partial_eos), None);
        assert_eq!(ttl, 0.2);
        assert!(!reasons.contains(&"ends_with_eos_and_final".to_string()));
        assert!(!reasons.contains(&"does_not_end_with_eos".to_string()));
    }

    #[tokio::test]
    async fn slow_speakers_widen_the_window() {
        let (det, _rx) = detector(EndOfTurnPolicy::Adaptive);
        let plain = segment_with(&[]);
        let slow = segment_with(&[Annotation::SlowSpeaker]);
        let very_slow = segment_with(&[Annotation::VerySlowSpeaker]);

        let (ttl_plain, _) = det.adaptive_window(Some(&plain), None);
        let (ttl_slow, reasons_slow) = det.adaptive_window(Some(&slow), None);
        let (ttl_very_slow, reasons_very_slow) = det.adaptive_window(Some(&very_slow), None);

        assert!(ttl_slow > ttl_plain);
        assert!(ttl_very_slow >= ttl_slow);
        assert!(reasons_slow.contains(&"slow_speaker".to_string()));
        assert!(reasons_very_slow.contains(&"very_slow_speaker".to_string()));
    }

    #[tokio::test]
    async fn adaptive_close_fires_once_after_window() {
        let (mut det, mut rx) = detector(EndOfTurnPolicy::Adaptive);
        det.on_word_activity();
        let commands = det.on_end_of_utterance(Some(&segment_with(&[Annotation::EndsWithEos])));
        assert_eq!(commands.len(), 1);

        // Window elapses.
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TurnTimerEvent::WindowElapsed { .. }));
        assert!(det.on_timer_event(event).is_empty());
        assert_eq!(det.phase(), TurnPhase::Closing);

        // Quiescence elapses.
        let event = rx.recv().await.unwrap();
        let commands = det.on_timer_event(event);
        assert_eq!(commands, vec![TurnCommand::FinalizeTurn { turn_id: 0 }]);
    }

    #[tokio::test]
    async fn word_cancels_adaptive_window() {
        let (mut det, _rx) = detector(EndOfTurnPolicy::Adaptive);
        det.on_word_activity();
        det.on_end_of_utterance(Some(&segment_with(&[])));

        // Speech resumes before the window elapses; the armed window
        // (generation 1) is invalidated.
        det.on_word_activity();

        let stale = TurnTimerEvent::WindowElapsed { generation: 1 };
        assert!(det.on_timer_event(stale).is_empty());
        assert_eq!(det.phase(), TurnPhase::Open);
    }

    #[tokio::test]
    async fn external_policy_ignores_end_of_utterance() {
        let (mut det, _rx) = detector(EndOfTurnPolicy::External);
        det.on_word_activity();
        for _ in 0..3 {
            assert!(det.on_end_of_utterance(None).is_empty());
        }
        assert_eq!(det.phase(), TurnPhase::Open);

        let commands = det.force_close();
        assert_eq!(commands, vec![TurnCommand::FinalizeTurn { turn_id: 0 }]);
        assert_eq!(det.turn_id(), 1);
    }

    #[tokio::test]
    async fn force_close_when_idle_is_a_no_op() {
        let (mut det, _rx) = detector(EndOfTurnPolicy::External);
        assert!(det.force_close().is_empty());
    }

    #[tokio::test]
    async fn smart_without_classifier_downgrades_to_adaptive() {
        let (det, _rx) = detector(EndOfTurnPolicy::Smart);
        assert_eq!(det.policy(), EndOfTurnPolicy::Adaptive);
    }

    #[tokio::test]
    async fn smart_vote_complete_closes_the_turn() {
        use crate::core::smart_turn::testing::FixedClassifier;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ring = Arc::new(AudioRingBuffer::new(16000, 2, 320, 8.0));
        ring.push_bytes(&vec![0u8; 640 * 50]);
        let mut det = TurnDetector::new(
            EndOfTurnPolicy::Smart,
            timing(),
            SmartTurnConfig::default(),
            Some(Arc::new(FixedClassifier::new(0.95))),
            Some(ring),
            tx,
        );
        assert_eq!(det.policy(), EndOfTurnPolicy::Smart);

        det.on_word_activity();
        assert!(det.on_end_of_utterance(None).is_empty());

        let event = rx.recv().await.unwrap();
        match event {
            TurnTimerEvent::SmartResult { complete, .. } => assert!(complete),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(det.on_timer_event(event).is_empty());
        assert_eq!(det.phase(), TurnPhase::Closing);
    }

    #[tokio::test]
    async fn smart_vote_incomplete_keeps_the_turn_open() {
        use crate::core::smart_turn::testing::FixedClassifier;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ring = Arc::new(AudioRingBuffer::new(16000, 2, 320, 8.0));
        ring.push_bytes(&vec![0u8; 640 * 50]);
        let mut det = TurnDetector::new(
            EndOfTurnPolicy::Smart,
            timing(),
            SmartTurnConfig::default(),
            Some(Arc::new(FixedClassifier::new(0.1))),
            Some(ring),
            tx,
        );

        det.on_word_activity();
        det.on_end_of_utterance(None);

        let event = rx.recv().await.unwrap();
        assert!(det.on_timer_event(event).is_empty());
        assert_eq!(det.phase(), TurnPhase::Open);
    }

    #[tokio::test]
    async fn ceiling_closes_a_stuck_turn() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut det = TurnDetector::new(
            EndOfTurnPolicy::External,
            TurnTiming {
                silence_trigger: 0.2,
                max_delay: 1.0,
                max_ceiling: 0.05,
            },
            SmartTurnConfig::default(),
            None,
            None,
            tx,
        );
        det.on_word_activity();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TurnTimerEvent::CeilingElapsed { .. }));
        assert!(det.on_timer_event(event).is_empty());
        assert_eq!(det.phase(), TurnPhase::Closing);

        let event = rx.recv().await.unwrap();
        let commands = det.on_timer_event(event);
        assert_eq!(commands, vec![TurnCommand::FinalizeTurn { turn_id: 0 }]);
    }

    #[tokio::test]
    async fn turn_ids_are_sequential() {
        let (mut det, mut rx) = detector(EndOfTurnPolicy::Fixed);
        for expected in 0..3u64 {
            det.on_word_activity();
            det.on_end_of_utterance(None);
            let event = rx.recv().await.unwrap();
            let commands = det.on_timer_event(event);
            assert_eq!(commands, vec![TurnCommand::FinalizeTurn { turn_id: expected }]);
        }
    }
}
