//! The voice agent facade.
//!
//! [`VoiceAgent`] wires the RT session, transcript assembly, speech
//! segmentation, turn detection and the speaker registry behind one
//! surface. A single processing loop consumes session events, timer
//! callbacks and facade commands, so listener callbacks fire in receipt
//! order and no component needs cross-task locking.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, StaticKeyAuth};
use crate::config::{EndOfTurnPolicy, SpeakerFocusConfig, VoiceAgentConfig, DEFAULT_RT_URL, RT_URL_ENV};
use crate::core::audio::AudioRingBuffer;
use crate::core::events::{AgentEvent, AgentEventKind, EventEmitter, ListenerId};
use crate::core::messages::{ClientMessage, ServerMessage, TimeMetadata};
use crate::core::segment::{SegmentEvent, SegmentationEngine, SegmentationOptions, SpeakerSegment};
use crate::core::session::{RtSession, SessionEvent, SessionOptions, SessionStart};
use crate::core::smart_turn::TurnClassifier;
use crate::core::speakers::{is_engine_label, SpeakerRegistry};
use crate::core::transcript::FragmentBuffer;
use crate::core::turn::{TurnCommand, TurnDetector, TurnTimerEvent, TurnTiming};
use crate::errors::{VoiceError, VoiceResult};

/// Ring frame size in samples; 20 ms at 16 kHz.
const RING_FRAME_SAMPLES: usize = 320;

/// Requests posted from the facade into the processing loop.
enum AgentCommand {
    UpdateFocus(SpeakerFocusConfig),
    Finalize { end_of_turn: bool },
}

/// Real-time voice agent client.
///
/// Construct with a [`VoiceAgentConfig`] (or a preset), register
/// listeners, then `connect` and stream audio:
///
/// ```no_run
/// use sm_voice::config::{Preset, VoiceAgentConfig};
/// use sm_voice::core::agent::VoiceAgent;
/// use sm_voice::core::events::AgentEventKind;
///
/// # async fn run() -> Result<(), sm_voice::errors::VoiceError> {
/// let mut agent = VoiceAgent::new(VoiceAgentConfig::preset(Preset::Adaptive));
/// agent.on(AgentEventKind::Segments, |event| {
///     println!("{event:?}");
/// });
/// agent.connect().await?;
/// agent.send_audio(vec![0u8; 640]).await?;
/// agent.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct VoiceAgent {
    config: VoiceAgentConfig,
    /// Endpoint resolved at construction: config, then environment,
    /// then the production default.
    resolved_url: String,
    auth: Option<Arc<dyn AuthProvider>>,
    classifier: Option<Arc<dyn TurnClassifier>>,
    emitter: Arc<EventEmitter>,

    session: Option<Arc<RtSession>>,
    audio_ring: Option<Arc<AudioRingBuffer>>,
    command_tx: Option<mpsc::UnboundedSender<AgentCommand>>,
    loop_task: Option<tokio::task::JoinHandle<()>>,
}

impl VoiceAgent {
    pub fn new(config: VoiceAgentConfig) -> Self {
        let resolved_url = config
            .url
            .clone()
            .or_else(|| std::env::var(RT_URL_ENV).ok().filter(|u| !u.is_empty()))
            .unwrap_or_else(|| DEFAULT_RT_URL.to_string());
        Self {
            config,
            resolved_url,
            auth: None,
            classifier: None,
            emitter: Arc::new(EventEmitter::new()),
            session: None,
            audio_ring: None,
            command_tx: None,
            loop_task: None,
        }
    }

    /// Use an explicit API key instead of the environment.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.auth = Some(Arc::new(StaticKeyAuth::new(api_key)));
        self
    }

    /// Use a custom credential provider.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Plug in the smart-turn classifier capability.
    pub fn with_classifier(mut self, classifier: Arc<dyn TurnClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> &VoiceAgentConfig {
        &self.config
    }

    // =========================================================================
    // Listener registration
    // =========================================================================

    pub fn on<F>(&self, kind: AgentEventKind, listener: F) -> ListenerId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.emitter.on(kind, listener)
    }

    pub fn once<F>(&self, kind: AgentEventKind, listener: F) -> ListenerId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.emitter.once(kind, listener)
    }

    pub fn off(&self, kind: AgentEventKind, id: ListenerId) -> bool {
        self.emitter.off(kind, id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Validate the configuration, connect and start processing.
    pub async fn connect(&mut self) -> VoiceResult<SessionStart> {
        if self.session.is_some() {
            return Err(VoiceError::Closed("already connected".to_string()));
        }
        self.config.validate()?;

        let auth: Arc<dyn AuthProvider> = match &self.auth {
            Some(auth) => auth.clone(),
            None => Arc::new(StaticKeyAuth::from_env()?),
        };

        // The classifier must be ready before the first utterance; a
        // load failure downgrades exactly like an absent capability.
        let mut classifier = None;
        if self.config.turn_policy == EndOfTurnPolicy::Smart {
            if let Some(candidate) = &self.classifier {
                match candidate.load().await {
                    Ok(()) => classifier = Some(candidate.clone()),
                    Err(e) => warn!("smart turn classifier failed to load: {e}"),
                }
            }
        }

        let options = SessionOptions {
            url: self.resolved_url.clone(),
            app: self.config.app.clone(),
            connection: self.config.connection.clone(),
            transcription: self.config.transcription_config(),
            audio_format: self.config.audio_format(),
        };
        let mut session = RtSession::new(options, auth);
        let session_events = session
            .take_events()
            .expect("fresh session always has an event stream");

        let started = session.connect().await?;
        info!(
            session_id = started.session_id.as_deref().unwrap_or("unknown"),
            "voice agent connected"
        );

        let audio_ring = classifier.as_ref().map(|_| {
            Arc::new(AudioRingBuffer::new(
                self.config.sample_rate,
                self.config.audio_encoding.bytes_per_sample(),
                RING_FRAME_SAMPLES,
                self.config.smart_turn.audio_window_secs,
            ))
        });

        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let detector = TurnDetector::new(
            self.config.turn_policy,
            TurnTiming {
                silence_trigger: self.config.end_of_utterance_silence_trigger,
                max_delay: self.config.max_delay,
                max_ceiling: self.config.end_of_utterance_max_delay,
            },
            self.config.smart_turn.clone(),
            classifier,
            audio_ring.clone(),
            turn_tx,
        );

        let mut engine = SegmentationEngine::new(SegmentationOptions {
            max_intra_gap: self.config.intra_gap(),
            fast_speaker_wpm: self.config.fast_speaker_wpm,
            emit_cadence: self.config.emit_cadence,
            include_results: self.config.include_results,
        });
        engine.set_word_delimiter(started.language_pack_info.word_delimiter.clone());

        self.emitter.emit(&AgentEvent::RecognitionStarted {
            session_id: started.session_id.clone(),
            language_pack_info: started.language_pack_info.clone(),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let agent_loop = AgentLoop {
            emitter: self.emitter.clone(),
            buffer: FragmentBuffer::new(
                self.config.speaker_focus.clone(),
                self.config.language.clone(),
            ),
            engine,
            detector,
            registry: SpeakerRegistry::new(&self.config.known_speakers),
            add_trailing_eos: self.config.add_trailing_eos,
            turn_start: None,
            turn_end: 0.0,
        };

        let session = Arc::new(session);
        self.session = Some(session.clone());
        self.audio_ring = audio_ring;
        self.command_tx = Some(command_tx);
        self.loop_task = Some(tokio::spawn(agent_loop.run(
            session_events,
            turn_rx,
            command_rx,
        )));

        Ok(started)
    }

    /// Stream one chunk of PCM audio.
    pub async fn send_audio(&self, payload: impl Into<Bytes>) -> VoiceResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| VoiceError::NotStarted("agent is not connected".to_string()))?;
        let payload = payload.into();
        if let Some(ring) = &self.audio_ring {
            ring.push_bytes(&payload);
        }
        session.send_audio(payload).await
    }

    /// Send a raw control frame to the service.
    pub fn send_control(&self, message: ClientMessage) -> VoiceResult<()> {
        self.session
            .as_ref()
            .ok_or_else(|| VoiceError::NotStarted("agent is not connected".to_string()))?
            .send_control(message)
    }

    /// Emit everything buffered, optionally closing the current turn.
    /// Under the external turn policy this is the only way a turn ends.
    pub fn finalize(&self, end_of_turn: bool) -> VoiceResult<()> {
        self.command(AgentCommand::Finalize { end_of_turn })
    }

    /// Replace the speaker focus configuration. Applies to words
    /// ingested after this call; emitted segments are not rewritten.
    pub fn update_focus(&self, focus: SpeakerFocusConfig) -> VoiceResult<()> {
        if let Some(label) = focus
            .focus_speakers
            .iter()
            .find(|s| focus.ignore_speakers.contains(s))
        {
            return Err(VoiceError::Configuration(format!(
                "speaker '{label}' appears in both focus_speakers and ignore_speakers"
            )));
        }
        self.command(AgentCommand::UpdateFocus(focus))
    }

    fn command(&self, command: AgentCommand) -> VoiceResult<()> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| VoiceError::NotStarted("agent is not connected".to_string()))?
            .send(command)
            .map_err(|_| VoiceError::Closed("processing loop ended".to_string()))
    }

    /// Drain and close: flush queued audio, exchange `EndOfStream` /
    /// `EndOfTranscript`, then close the socket.
    pub async fn disconnect(&mut self) -> VoiceResult<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.command_tx = None;
        self.audio_ring = None;

        let result = session.finalize().await;
        if result.is_err() {
            session.request_close();
        }

        if let Some(task) = self.loop_task.take() {
            let _ = timeout(Duration::from_secs(5), task).await;
        }

        match result {
            Ok(()) => Ok(()),
            // A session that already drained or failed is not an error
            // for disconnect.
            Err(VoiceError::Closed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Processing loop
// =============================================================================

/// Single-consumer state machine behind the facade. Every mutation of
/// the word buffer, segmentation state and turn state happens here.
struct AgentLoop {
    emitter: Arc<EventEmitter>,
    buffer: FragmentBuffer,
    engine: SegmentationEngine,
    detector: TurnDetector,
    registry: SpeakerRegistry,
    add_trailing_eos: bool,
    /// Start of the range covered by the current turn.
    turn_start: Option<f64>,
    turn_end: f64,
}

impl AgentLoop {
    async fn run(
        mut self,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut turn_events: mpsc::UnboundedReceiver<TurnTimerEvent>,
        mut commands: mpsc::UnboundedReceiver<AgentCommand>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;

                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        // Facade dropped its sender; keep serving
                        // session events until the session ends.
                        None => commands_open = false,
                    }
                }

                event = turn_events.recv() => {
                    if let Some(event) = event {
                        let commands = self.detector.on_timer_event(event);
                        self.run_turn_commands(commands);
                    }
                }

                event = session_events.recv() => {
                    match event {
                        Some(SessionEvent::Message(message)) => self.handle_server_message(message),
                        Some(SessionEvent::Fatal(error)) => {
                            self.detector.shutdown();
                            self.emitter.emit(&AgentEvent::Error { error });
                            break;
                        }
                        Some(SessionEvent::Closed) | None => {
                            self.detector.shutdown();
                            break;
                        }
                    }
                }
            }
        }
        debug!("agent processing loop ended");
    }

    fn handle_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::UpdateFocus(focus) => {
                self.buffer.update_focus(focus);
            }
            AgentCommand::Finalize { end_of_turn } => {
                if end_of_turn {
                    let commands = self.detector.force_close();
                    if commands.is_empty() {
                        // No open turn; just flush the buffer.
                        self.flush_segments();
                    } else {
                        self.run_turn_commands(commands);
                    }
                } else {
                    self.flush_segments();
                }
            }
        }
    }

    fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::AddPartialTranscript(payload) => {
                let update = self.buffer.apply(&payload, false);
                if update.revised_partials > 0 || update.new_finals > 0 {
                    self.detector.on_word_activity();
                }
                let events = self.engine.on_words_updated(&mut self.buffer);
                self.emit_segment_events(events);
            }
            ServerMessage::AddTranscript(payload) => {
                let update = self.buffer.apply(&payload, true);
                if update.new_finals > 0 {
                    self.detector.on_word_activity();
                }
                let events = self.engine.on_words_updated(&mut self.buffer);
                self.emit_segment_events(events);
            }
            ServerMessage::EndOfUtterance { metadata } => {
                self.emitter.emit(&AgentEvent::EndOfUtterance { metadata });
                let segments = self.engine.current_segments(&self.buffer);
                let last_active = segments.iter().rev().find(|s| s.is_active).cloned();
                let commands = self.detector.on_end_of_utterance(last_active.as_ref());
                self.run_turn_commands(commands);
            }
            ServerMessage::SpeakersResult { speakers } => {
                self.registry.ingest(&speakers);
                self.emitter.emit(&AgentEvent::SpeakersResult { speakers });
            }
            ServerMessage::Info(notice) => {
                self.emitter.emit(&AgentEvent::Info { notice });
            }
            ServerMessage::Warning(notice) => {
                self.emitter.emit(&AgentEvent::Warning { notice });
            }
            ServerMessage::EndOfTranscript => {
                // Flush whatever is still buffered, settle the open
                // turn, then report the end of the stream.
                self.flush_segments();
                let commands = self.detector.force_close();
                self.run_turn_commands(commands);
                self.emitter.emit(&AgentEvent::EndOfTranscript);
            }
            // Handled by the session driver.
            ServerMessage::RecognitionStarted(_)
            | ServerMessage::AudioAdded { .. }
            | ServerMessage::Error(_)
            | ServerMessage::Unknown(_) => {}
        }
    }

    fn run_turn_commands(&mut self, commands: Vec<TurnCommand>) {
        for command in commands {
            match command {
                TurnCommand::EmitPrediction { turn_id, ttl, reasons } => {
                    self.emitter.emit(&AgentEvent::EndOfTurnPrediction {
                        turn_id,
                        ttl,
                        reasons,
                    });
                }
                TurnCommand::FinalizeTurn { turn_id } => {
                    self.flush_segments();
                    let metadata = TimeMetadata {
                        start_time: self.turn_start.unwrap_or(self.turn_end),
                        end_time: self.turn_end,
                    };
                    self.turn_start = None;
                    self.emitter.emit(&AgentEvent::EndOfTurn { turn_id, metadata });
                }
            }
        }
    }

    /// Emit everything buffered as final segments.
    fn flush_segments(&mut self) {
        if self.add_trailing_eos && !self.buffer.is_empty() {
            let needs_eos = !self
                .engine
                .current_segments(&self.buffer)
                .last()
                .map(|s| {
                    s.annotations
                        .has(&[crate::core::segment::Annotation::EndsWithEos])
                })
                .unwrap_or(true);
            if needs_eos {
                self.buffer.push_synthetic_eos();
            }
        }
        let events = self.engine.finalize(&mut self.buffer);
        self.emit_segment_events(events);
    }

    fn emit_segment_events(&mut self, events: Vec<SegmentEvent>) {
        for event in events {
            match event {
                SegmentEvent::Partial {
                    segments,
                    start_time,
                    end_time,
                } => {
                    self.note_turn_range(start_time, end_time);
                    self.emitter.emit(&AgentEvent::PartialSegments {
                        segments: self.relabel(segments),
                        metadata: TimeMetadata {
                            start_time,
                            end_time,
                        },
                    });
                }
                SegmentEvent::Final {
                    segments,
                    start_time,
                    end_time,
                } => {
                    self.note_turn_range(start_time, end_time);
                    self.emitter.emit(&AgentEvent::Segments {
                        segments: self.relabel(segments),
                        metadata: TimeMetadata {
                            start_time,
                            end_time,
                        },
                    });
                }
            }
        }
    }

    fn note_turn_range(&mut self, start_time: f64, end_time: f64) {
        if self.turn_start.is_none() {
            self.turn_start = Some(start_time);
        }
        self.turn_end = self.turn_end.max(end_time);
    }

    /// Substitute enrolled labels for engine labels at emission time.
    fn relabel(&self, mut segments: Vec<SpeakerSegment>) -> Vec<SpeakerSegment> {
        if self.registry.mapped_count() == 0 {
            return segments;
        }
        for segment in &mut segments {
            if let Some(speaker_id) = &segment.speaker_id {
                if is_engine_label(speaker_id) {
                    if let Some(label) = self.registry.resolve(speaker_id) {
                        segment.speaker_id = Some(label.to_string());
                    }
                }
            }
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmitCadence, Preset, SmartTurnConfig};
    use crate::core::messages::{ServerNotice, SpeakerResultEntry};
    use crate::core::segment::{SegmentationEngine, SegmentationOptions};
    use parking_lot::Mutex;

    fn loop_with(
        config: &VoiceAgentConfig,
    ) -> (
        AgentLoop,
        Arc<Mutex<Vec<AgentEvent>>>,
        mpsc::UnboundedReceiver<TurnTimerEvent>,
    ) {
        let emitter = Arc::new(EventEmitter::new());
        let seen: Arc<Mutex<Vec<AgentEvent>>> = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            AgentEventKind::PartialSegments,
            AgentEventKind::Segments,
            AgentEventKind::EndOfUtterance,
            AgentEventKind::EndOfTurnPrediction,
            AgentEventKind::EndOfTurn,
            AgentEventKind::SpeakersResult,
            AgentEventKind::Warning,
            AgentEventKind::EndOfTranscript,
        ] {
            let sink = seen.clone();
            emitter.on(kind, move |event| sink.lock().push(event.clone()));
        }

        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let detector = TurnDetector::new(
            config.turn_policy,
            TurnTiming {
                silence_trigger: config.end_of_utterance_silence_trigger,
                max_delay: config.max_delay,
                max_ceiling: config.end_of_utterance_max_delay,
            },
            SmartTurnConfig::default(),
            None,
            None,
            turn_tx,
        );

        let agent_loop = AgentLoop {
            emitter,
            buffer: FragmentBuffer::new(config.speaker_focus.clone(), config.language.clone()),
            engine: SegmentationEngine::new(SegmentationOptions {
                max_intra_gap: config.intra_gap(),
                fast_speaker_wpm: config.fast_speaker_wpm,
                emit_cadence: config.emit_cadence,
                include_results: config.include_results,
            }),
            detector,
            registry: SpeakerRegistry::new(&config.known_speakers),
            add_trailing_eos: config.add_trailing_eos,
            turn_start: None,
            turn_end: 0.0,
        };
        (agent_loop, seen, turn_rx)
    }

    fn server(json: &str) -> ServerMessage {
        ServerMessage::parse(json).unwrap()
    }

    fn word(message: &str, content: &str, start: f64, end: f64, speaker: &str) -> String {
        format!(
            r#"{{"message": "{message}", "metadata": {{"transcript": "{content}", "start_time": {start}, "end_time": {end}}},
                "results": [{{"type": "word", "start_time": {start}, "end_time": {end},
                "alternatives": [{{"content": "{content}", "confidence": 0.9, "speaker": "{speaker}"}}]}}]}}"#
        )
    }

    #[tokio::test]
    async fn partial_then_final_reconciliation() {
        let config = VoiceAgentConfig {
            emit_cadence: EmitCadence::Complete,
            ..Default::default()
        };
        let (mut agent_loop, seen, _turn_rx) = loop_with(&config);

        agent_loop.handle_server_message(server(&word(
            "AddPartialTranscript",
            "Welcome",
            0.36,
            0.92,
            "S1",
        )));
        agent_loop.handle_server_message(server(&word(
            "AddPartialTranscript",
            "Welcome to",
            0.36,
            1.6,
            "S1",
        )));

        let final_sentence = r#"{"message": "AddTranscript",
            "metadata": {"transcript": "Welcome to Speechmatics.", "start_time": 0.36, "end_time": 1.32},
            "results": [
                {"type": "word", "start_time": 0.36, "end_time": 0.6,
                 "alternatives": [{"content": "Welcome", "confidence": 0.95, "speaker": "S1"}]},
                {"type": "word", "start_time": 0.7, "end_time": 0.8,
                 "alternatives": [{"content": "to", "confidence": 0.99, "speaker": "S1"}]},
                {"type": "word", "start_time": 0.9, "end_time": 1.32,
                 "alternatives": [{"content": "Speechmatics", "confidence": 0.97, "speaker": "S1"}]},
                {"type": "punctuation", "start_time": 1.32, "end_time": 1.32, "is_eos": true,
                 "attaches_to": "previous",
                 "alternatives": [{"content": ".", "confidence": 1.0, "speaker": "S1"}]}
            ]}"#;
        agent_loop.handle_server_message(server(final_sentence));

        let events = seen.lock();
        let partials: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::PartialSegments { .. }))
            .collect();
        assert_eq!(partials.len(), 2);

        let finals: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Segments { segments, .. } => Some(segments),
                _ => None,
            })
            .collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0][0].text, "Welcome to Speechmatics.");
    }

    #[tokio::test]
    async fn ignored_speaker_never_surfaces() {
        let config = VoiceAgentConfig {
            speaker_focus: SpeakerFocusConfig {
                ignore_speakers: vec!["S3".into()],
                focus_mode: crate::config::SpeakerFocusMode::Ignore,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut agent_loop, seen, _turn_rx) = loop_with(&config);

        agent_loop.handle_server_message(server(&word("AddTranscript", "one", 0.0, 0.3, "S1")));
        agent_loop.handle_server_message(server(&word("AddTranscript", "three", 0.4, 0.7, "S3")));
        agent_loop.handle_server_message(server(&word("AddTranscript", "two", 0.8, 1.1, "S2")));
        agent_loop.handle_command(AgentCommand::Finalize { end_of_turn: false });

        let events = seen.lock();
        for event in events.iter() {
            let segments = match event {
                AgentEvent::PartialSegments { segments, .. }
                | AgentEvent::Segments { segments, .. } => segments,
                _ => continue,
            };
            assert!(
                segments.iter().all(|s| s.speaker_id.as_deref() != Some("S3")),
                "S3 leaked into emission"
            );
        }
        // S1 and S2 still came through.
        let texts: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Segments { segments, .. } => {
                    Some(segments.iter().map(|s| s.text.clone()).collect::<Vec<_>>())
                }
                _ => None,
            })
            .flatten()
            .collect();
        assert!(texts.contains(&"one".to_string()));
        assert!(texts.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn external_policy_needs_explicit_finalize() {
        let config = Preset::External.config();
        let (mut agent_loop, seen, _turn_rx) = loop_with(&config);

        agent_loop.handle_server_message(server(&word("AddTranscript", "hello", 0.0, 0.4, "S1")));
        for _ in 0..3 {
            agent_loop.handle_server_message(server(
                r#"{"message": "EndOfUtterance", "metadata": {"start_time": 0.4, "end_time": 0.6}}"#,
            ));
        }
        assert!(
            !seen.lock().iter().any(|e| matches!(e, AgentEvent::EndOfTurn { .. })),
            "external policy closed a turn on its own"
        );

        agent_loop.handle_command(AgentCommand::Finalize { end_of_turn: true });

        let events = seen.lock();
        let turns: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::EndOfTurn { turn_id, .. } => Some(*turn_id),
                _ => None,
            })
            .collect();
        assert_eq!(turns, vec![0]);
    }

    #[tokio::test]
    async fn speakers_result_relabels_future_segments_only() {
        let config = VoiceAgentConfig {
            enable_diarization: true,
            known_speakers: vec![crate::config::SpeakerIdentifier {
                label: "Alice".into(),
                speaker_identifiers: vec!["spkr_a".into()],
            }],
            ..Default::default()
        };
        let (mut agent_loop, seen, _turn_rx) = loop_with(&config);

        agent_loop.handle_server_message(server(&word("AddTranscript", "before", 0.0, 0.3, "S1")));
        agent_loop.handle_command(AgentCommand::Finalize { end_of_turn: false });

        agent_loop.handle_server_message(server(
            r#"{"message": "SpeakersResult",
                "speakers": [{"label": "S1", "speaker_identifiers": ["spkr_a"]}]}"#,
        ));

        agent_loop.handle_server_message(server(&word("AddTranscript", "after", 1.0, 1.3, "S1")));
        agent_loop.handle_command(AgentCommand::Finalize { end_of_turn: false });

        let events = seen.lock();
        let speaker_by_text: Vec<(String, String)> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Segments { segments, .. } => Some(
                    segments
                        .iter()
                        .map(|s| (s.text.clone(), s.speaker_id.clone().unwrap_or_default()))
                        .collect::<Vec<_>>(),
                ),
                _ => None,
            })
            .flatten()
            .collect();

        assert!(speaker_by_text.contains(&("before".to_string(), "S1".to_string())));
        assert!(speaker_by_text.contains(&("after".to_string(), "Alice".to_string())));
    }

    #[tokio::test]
    async fn end_of_transcript_flushes_and_reports() {
        let config = VoiceAgentConfig::default();
        let (mut agent_loop, seen, _turn_rx) = loop_with(&config);

        agent_loop.handle_server_message(server(&word("AddTranscript", "tail", 0.0, 0.4, "S1")));
        agent_loop.handle_server_message(server(r#"{"message": "EndOfTranscript"}"#));

        let events = seen.lock();
        let mut saw_segments = false;
        let mut saw_end = false;
        for event in events.iter() {
            match event {
                AgentEvent::Segments { segments, .. } => {
                    saw_segments = true;
                    assert_eq!(segments[0].text, "tail");
                    assert!(!saw_end, "segments must precede EndOfTranscript");
                }
                AgentEvent::EndOfTranscript => saw_end = true,
                _ => {}
            }
        }
        assert!(saw_segments);
        assert!(saw_end);
    }

    #[tokio::test]
    async fn focus_update_applies_to_later_words_only() {
        let config = VoiceAgentConfig::default();
        let (mut agent_loop, seen, _turn_rx) = loop_with(&config);

        agent_loop.handle_server_message(server(&word("AddTranscript", "early", 0.0, 0.3, "S2")));
        agent_loop.handle_command(AgentCommand::Finalize { end_of_turn: false });

        agent_loop.handle_command(AgentCommand::UpdateFocus(SpeakerFocusConfig {
            ignore_speakers: vec!["S2".into()],
            ..Default::default()
        }));

        agent_loop.handle_server_message(server(&word("AddTranscript", "late", 1.0, 1.3, "S2")));
        agent_loop.handle_command(AgentCommand::Finalize { end_of_turn: false });

        let events = seen.lock();
        let final_texts: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Segments { segments, .. } => {
                    Some(segments.iter().map(|s| s.text.clone()).collect::<Vec<_>>())
                }
                _ => None,
            })
            .flatten()
            .collect();
        assert!(final_texts.contains(&"early".to_string()));
        assert!(!final_texts.contains(&"late".to_string()));
    }

    #[tokio::test]
    async fn adaptive_utterance_end_opens_a_prediction_window() {
        let config = Preset::Adaptive.config();
        let (mut agent_loop, seen, _turn_rx) = loop_with(&config);

        agent_loop.handle_server_message(server(&word("AddTranscript", "hello", 0.0, 0.4, "S1")));
        agent_loop.handle_server_message(server(
            r#"{"message": "EndOfUtterance", "metadata": {"start_time": 0.4, "end_time": 0.6}}"#,
        ));

        let events = seen.lock();
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::EndOfUtterance { .. })));
        let prediction = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::EndOfTurnPrediction { turn_id, ttl, .. } => Some((*turn_id, *ttl)),
                _ => None,
            })
            .expect("adaptive policy must announce its window");
        assert_eq!(prediction.0, 0);
        assert!(
            prediction.1 >= config.end_of_utterance_silence_trigger
                && prediction.1 <= config.max_delay
        );
    }

    #[tokio::test]
    async fn warnings_are_forwarded() {
        let config = VoiceAgentConfig::default();
        let (mut agent_loop, seen, _turn_rx) = loop_with(&config);
        agent_loop.handle_server_message(ServerMessage::Warning(ServerNotice {
            kind: "duration_limit_approaching".into(),
            reason: "9 minutes left".into(),
        }));
        assert!(matches!(
            seen.lock().as_slice(),
            [AgentEvent::Warning { .. }]
        ));
    }

    #[tokio::test]
    async fn speakers_result_event_carries_entries() {
        let config = VoiceAgentConfig::default();
        let (mut agent_loop, seen, _turn_rx) = loop_with(&config);
        agent_loop.handle_server_message(ServerMessage::SpeakersResult {
            speakers: vec![SpeakerResultEntry {
                label: "S1".into(),
                speaker_identifiers: vec!["spkr_z".into()],
            }],
        });
        let events = seen.lock();
        assert!(matches!(
            events.as_slice(),
            [AgentEvent::SpeakersResult { speakers }] if speakers.len() == 1
        ));
    }
}
