//! Error types for the voice client.
//!
//! Errors are split along the lifecycle: failures before the session
//! reaches `Started` (auth, connection, configuration) are distinct from
//! failures afterwards (transport, protocol, server), because only the
//! former may be retried.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Error taxonomy for sessions and the voice agent.
#[derive(Debug, Clone, Error)]
pub enum VoiceError {
    /// Missing or rejected credential. Never retried.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TCP/TLS/WebSocket failure while establishing the connection.
    /// Bounded retry is allowed for this variant only.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Socket failure after the session started. Fatal for the session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame, unexpected message ordering or a sequence
    /// number mismatch. Fatal for the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unrecoverable error reported by the server.
    #[error("Server error ({kind}): {reason}")]
    Server { kind: String, reason: String },

    /// The outbound audio queue is gone or rejected the frame.
    #[error("Audio backpressure: {0}")]
    Backpressure(String),

    /// Configuration validation failed before connect.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation that requires a started session was called too
    /// early or too late.
    #[error("Session not started: {0}")]
    NotStarted(String),

    /// The session is draining or closed.
    #[error("Session closed: {0}")]
    Closed(String),

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// An optional capability (e.g. the smart-turn classifier) is not
    /// available. Non-fatal; callers downgrade and continue.
    #[error("Capability unavailable: {0}")]
    CapabilityAbsent(String),
}

impl VoiceError {
    /// Whether the error happened before the session was established
    /// and the connect may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoiceError::Connection(_))
    }

    /// Whether the error terminates an established session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::Auth(_)
                | VoiceError::Transport(_)
                | VoiceError::Protocol(_)
                | VoiceError::Server { .. }
        )
    }
}
