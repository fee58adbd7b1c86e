//! Typed event dispatch for the voice agent.
//!
//! The wire keeps its string discriminators; everything that crosses the
//! public boundary is the [`AgentEvent`] enum. Listeners register per
//! [`AgentEventKind`] with `on`/`once` and deregister with `off` using
//! the returned [`ListenerId`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::messages::{LanguagePackInfo, ServerNotice, SpeakerResultEntry, TimeMetadata};
use crate::core::segment::SpeakerSegment;
use crate::errors::VoiceError;

/// Events delivered to listeners.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The session is live. Carries the server-assigned id and language
    /// pack details.
    RecognitionStarted {
        session_id: Option<String>,
        language_pack_info: LanguagePackInfo,
    },
    /// Open segments whose content changed.
    PartialSegments {
        segments: Vec<SpeakerSegment>,
        metadata: TimeMetadata,
    },
    /// Finalized segments; their text will not change.
    Segments {
        segments: Vec<SpeakerSegment>,
        metadata: TimeMetadata,
    },
    /// The service's silence-based endpointing signal.
    EndOfUtterance { metadata: TimeMetadata },
    /// An adaptive or smart prediction window opened.
    EndOfTurnPrediction {
        turn_id: u64,
        /// Seconds until the turn finalizes if no new word arrives.
        ttl: f64,
        /// What contributed to the window length.
        reasons: Vec<String>,
    },
    /// A conversational turn completed. Emitted exactly once per turn.
    EndOfTurn { turn_id: u64, metadata: TimeMetadata },
    /// Speaker data from the service.
    SpeakersResult { speakers: Vec<SpeakerResultEntry> },
    /// Informational notice from the server.
    Info { notice: ServerNotice },
    /// Non-fatal warning from the server.
    Warning { notice: ServerNotice },
    /// Terminal session error. No events follow this one.
    Error { error: VoiceError },
    /// The server delivered all transcripts.
    EndOfTranscript,
}

/// Discriminants of [`AgentEvent`], used as listener keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentEventKind {
    RecognitionStarted,
    PartialSegments,
    Segments,
    EndOfUtterance,
    EndOfTurnPrediction,
    EndOfTurn,
    SpeakersResult,
    Info,
    Warning,
    Error,
    EndOfTranscript,
}

impl AgentEvent {
    pub fn kind(&self) -> AgentEventKind {
        match self {
            AgentEvent::RecognitionStarted { .. } => AgentEventKind::RecognitionStarted,
            AgentEvent::PartialSegments { .. } => AgentEventKind::PartialSegments,
            AgentEvent::Segments { .. } => AgentEventKind::Segments,
            AgentEvent::EndOfUtterance { .. } => AgentEventKind::EndOfUtterance,
            AgentEvent::EndOfTurnPrediction { .. } => AgentEventKind::EndOfTurnPrediction,
            AgentEvent::EndOfTurn { .. } => AgentEventKind::EndOfTurn,
            AgentEvent::SpeakersResult { .. } => AgentEventKind::SpeakersResult,
            AgentEvent::Info { .. } => AgentEventKind::Info,
            AgentEvent::Warning { .. } => AgentEventKind::Warning,
            AgentEvent::Error { .. } => AgentEventKind::Error,
            AgentEvent::EndOfTranscript => AgentEventKind::EndOfTranscript,
        }
    }
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

struct Registration {
    id: ListenerId,
    listener: Listener,
    once: bool,
}

/// Listener registry. Callbacks run synchronously on the agent's
/// processing loop, so dispatch order matches receipt order.
#[derive(Default)]
pub struct EventEmitter {
    inner: Mutex<EmitterState>,
}

#[derive(Default)]
struct EmitterState {
    handlers: HashMap<AgentEventKind, Vec<Registration>>,
    next_id: u64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persistent listener.
    pub fn on<F>(&self, kind: AgentEventKind, listener: F) -> ListenerId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(listener), false)
    }

    /// Register a listener that fires at most once.
    pub fn once<F>(&self, kind: AgentEventKind, listener: F) -> ListenerId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(listener), true)
    }

    fn register(&self, kind: AgentEventKind, listener: Listener, once: bool) -> ListenerId {
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = ListenerId(state.next_id);
        state
            .handlers
            .entry(kind)
            .or_default()
            .push(Registration { id, listener, once });
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, kind: AgentEventKind, id: ListenerId) -> bool {
        let mut state = self.inner.lock();
        let Some(registrations) = state.handlers.get_mut(&kind) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        before != registrations.len()
    }

    /// Number of listeners for an event kind.
    pub fn listener_count(&self, kind: AgentEventKind) -> usize {
        self.inner
            .lock()
            .handlers
            .get(&kind)
            .map_or(0, |r| r.len())
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.inner.lock().handlers.clear();
    }

    /// Dispatch an event. One-shot listeners are removed before their
    /// callback runs; callbacks execute outside the registry lock so a
    /// listener may re-register or remove others.
    pub fn emit(&self, event: &AgentEvent) {
        let to_call: Vec<Listener> = {
            let mut state = self.inner.lock();
            let Some(registrations) = state.handlers.get_mut(&event.kind()) else {
                return;
            };
            let listeners: Vec<Listener> =
                registrations.iter().map(|r| r.listener.clone()).collect();
            registrations.retain(|r| !r.once);
            listeners
        };

        if to_call.is_empty() {
            debug!(kind = ?event.kind(), "no listener for event");
        }
        for listener in to_call {
            listener(event);
        }
    }
}
