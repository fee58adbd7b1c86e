//! Real-time WebSocket session.
//!
//! One [`RtSession`] owns one socket. `connect` performs the upgrade and
//! the `StartRecognition` handshake inline; after `RecognitionStarted`
//! a driver task takes the socket and multiplexes:
//!
//! - outbound control frames (drained before audio),
//! - outbound binary audio from a bounded queue (the backpressure bound),
//! - inbound frames, forwarded to the session's event channel in receipt
//!   order,
//! - ping/pong liveness.
//!
//! The driver is the only task that touches the socket, so frame order
//! on the wire matches submission order. Audio sequence numbers are
//! assigned at transmission; `EndOfStream` carries the final count and
//! the drain completes once the server has acknowledged every frame and
//! sent `EndOfTranscript`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::{AuthPlacement, AuthProvider};
use crate::config::{AudioFormat, ConnectionConfig, TranscriptionConfig};
use crate::core::messages::{ClientMessage, LanguagePackInfo, ServerMessage};
use crate::errors::{VoiceError, VoiceResult};

const SDK_QUERY_VALUE: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));
const CONNECT_BACKOFF_BASE_MS: u64 = 250;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Session lifecycle states.
///
/// `Idle -> Connecting -> Started -> Draining -> Closed`, with `Failed`
/// terminal for any error after `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Started,
    Draining,
    Failed,
    Closed,
}

/// What `connect` returns once the server confirms the session.
#[derive(Debug, Clone)]
pub struct SessionStart {
    pub session_id: Option<String>,
    pub language_pack_info: LanguagePackInfo,
}

/// Frames and terminal conditions delivered to the session's consumer,
/// in receipt order.
#[derive(Debug)]
pub enum SessionEvent {
    /// A structured server frame.
    Message(ServerMessage),
    /// The session failed; no further events follow.
    Fatal(VoiceError),
    /// The session drained and closed cleanly; no further events follow.
    Closed,
}

/// Connection inputs for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub url: String,
    /// Application identifier for the `sm-app` query parameter.
    pub app: Option<String>,
    pub connection: ConnectionConfig,
    pub transcription: TranscriptionConfig,
    pub audio_format: AudioFormat,
}

enum DriverCommand {
    Control(ClientMessage),
    Finalize { done: oneshot::Sender<VoiceResult<()>> },
    Close,
}

/// A full-duplex RT transcription session.
pub struct RtSession {
    options: SessionOptions,
    auth: Arc<dyn AuthProvider>,
    request_id: String,

    state: Arc<RwLock<SessionState>>,
    audio_seq_sent: Arc<AtomicU64>,
    audio_seq_acked: Arc<AtomicU64>,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,

    command_tx: Option<mpsc::UnboundedSender<DriverCommand>>,
    audio_tx: Option<mpsc::Sender<Bytes>>,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl RtSession {
    pub fn new(options: SessionOptions, auth: Arc<dyn AuthProvider>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            options,
            auth,
            request_id: uuid::Uuid::new_v4().to_string(),
            state: Arc::new(RwLock::new(SessionState::Idle)),
            audio_seq_sent: Arc::new(AtomicU64::new(0)),
            audio_seq_acked: Arc::new(AtomicU64::new(0)),
            events_tx,
            events_rx: Some(events_rx),
            command_tx: None,
            audio_tx: None,
            driver: None,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Binary frames transmitted so far.
    pub fn audio_seq_sent(&self) -> u64 {
        self.audio_seq_sent.load(Ordering::Acquire)
    }

    /// Highest `AudioAdded.seq_no` received.
    pub fn audio_seq_acked(&self) -> u64 {
        self.audio_seq_acked.load(Ordering::Acquire)
    }

    /// Take the inbound event stream. Yields events in receipt order;
    /// can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Build the endpoint URL with tracking query parameters and, for
    /// query-placed auth, the `jwt` parameter.
    fn endpoint_url(&self, token: &str) -> VoiceResult<Url> {
        let mut url = Url::parse(&self.options.url)
            .map_err(|e| VoiceError::Configuration(format!("invalid endpoint URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            let app = self.options.app.as_deref().unwrap_or(env!("CARGO_PKG_NAME"));
            query.append_pair("sm-app", app);
            query.append_pair("sm-sdk", SDK_QUERY_VALUE);
            if self.auth.placement() == AuthPlacement::QueryParam {
                query.append_pair("jwt", token);
            }
        }
        Ok(url)
    }

    /// Connect, run the handshake and reach `Started`.
    ///
    /// DNS/TCP-level failures retry with exponential backoff up to the
    /// configured attempt count; auth rejections never retry. Any error
    /// after `Started` is terminal for the session.
    pub async fn connect(&mut self) -> VoiceResult<SessionStart> {
        {
            let mut state = self.state.write();
            if *state != SessionState::Idle {
                return Err(VoiceError::NotStarted(format!(
                    "connect called in state {:?}",
                    *state
                )));
            }
            *state = SessionState::Connecting;
        }

        let result = self.connect_inner().await;
        if result.is_err() {
            *self.state.write() = SessionState::Closed;
        }
        result
    }

    async fn connect_inner(&mut self) -> VoiceResult<SessionStart> {
        let token = self.auth.bearer_token().await?;
        let url = self.endpoint_url(&token)?;
        let open_timeout = Duration::from_secs_f64(self.options.connection.open_timeout);

        let mut ws = self.open_socket(&url, &token, open_timeout).await?;

        let start = ClientMessage::StartRecognition {
            audio_format: self.options.audio_format.clone(),
            transcription_config: self.options.transcription.clone(),
        };
        ws.send(Message::Text(start.to_json()?.into()))
            .await
            .map_err(|e| VoiceError::Transport(format!("failed to send StartRecognition: {e}")))?;

        // Wait for RecognitionStarted, forwarding anything informational
        // that arrives first.
        let started = timeout(open_timeout, async {
            loop {
                let frame = ws.next().await.ok_or_else(|| {
                    VoiceError::Transport("connection closed during handshake".to_string())
                })?;
                let frame = frame
                    .map_err(|e| VoiceError::Transport(format!("handshake receive error: {e}")))?;
                let Message::Text(text) = frame else { continue };

                match ServerMessage::parse(&text)? {
                    ServerMessage::RecognitionStarted(started) => {
                        return Ok::<_, VoiceError>(started)
                    }
                    ServerMessage::Error(notice) => {
                        return Err(VoiceError::Server {
                            kind: notice.kind,
                            reason: notice.reason,
                        })
                    }
                    ServerMessage::Unknown(kind) => {
                        debug!(kind = %kind, "ignoring unknown message during handshake");
                    }
                    other => {
                        let _ = self.events_tx.send(SessionEvent::Message(other));
                    }
                }
            }
        })
        .await
        .map_err(|_| VoiceError::Timeout("no RecognitionStarted before open_timeout".to_string()))??;

        info!(
            session_id = started.id.as_deref().unwrap_or("unknown"),
            request_id = %self.request_id,
            "recognition started"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) =
            mpsc::channel::<Bytes>(self.options.connection.max_in_flight_frames.max(1));
        self.command_tx = Some(command_tx);
        self.audio_tx = Some(audio_tx);

        *self.state.write() = SessionState::Started;

        let driver = Driver {
            state: self.state.clone(),
            audio_seq_sent: self.audio_seq_sent.clone(),
            audio_seq_acked: self.audio_seq_acked.clone(),
            events_tx: self.events_tx.clone(),
            connection: self.options.connection.clone(),
        };
        self.driver = Some(tokio::spawn(driver.run(ws, command_rx, audio_rx)));

        Ok(SessionStart {
            session_id: started.id,
            language_pack_info: started.language_pack_info.unwrap_or_default(),
        })
    }

    async fn open_socket(
        &self,
        url: &Url,
        token: &str,
        open_timeout: Duration,
    ) -> VoiceResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let attempts = self.options.connection.connect_attempts.max(1);
        let mut last_error = VoiceError::Connection("no connect attempt made".to_string());

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff =
                    Duration::from_millis(CONNECT_BACKOFF_BASE_MS << (attempt - 1).min(4));
                debug!(attempt, ?backoff, "retrying connect");
                tokio::time::sleep(backoff).await;
            }

            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| VoiceError::Configuration(format!("invalid request: {e}")))?;
            {
                let headers = request.headers_mut();
                headers.insert(
                    "X-Request-Id",
                    self.request_id
                        .parse()
                        .map_err(|_| VoiceError::Configuration("bad request id".to_string()))?,
                );
                if self.auth.placement() == AuthPlacement::Header {
                    headers.insert(
                        "Authorization",
                        format!("Bearer {token}")
                            .parse()
                            .map_err(|_| VoiceError::Auth("token is not header-safe".to_string()))?,
                    );
                }
            }

            match timeout(open_timeout, connect_async(request)).await {
                Ok(Ok((ws, _response))) => return Ok(ws),
                Ok(Err(e)) => {
                    let error = classify_connect_error(e);
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    last_error = error;
                }
                Err(_) => {
                    last_error =
                        VoiceError::Connection("timed out opening WebSocket".to_string());
                }
            }
        }

        Err(last_error)
    }

    /// Queue one binary audio frame. Waits for a queue slot when the
    /// in-flight bound is reached; the frame is transmitted in
    /// submission order and counted in `audio_seq_sent` at transmission.
    pub async fn send_audio(&self, payload: Bytes) -> VoiceResult<()> {
        match self.state() {
            SessionState::Started => {}
            SessionState::Idle | SessionState::Connecting => {
                return Err(VoiceError::NotStarted(
                    "send_audio before session started".to_string(),
                ))
            }
            other => {
                return Err(VoiceError::Closed(format!(
                    "send_audio in state {other:?}"
                )))
            }
        }
        let audio_tx = self
            .audio_tx
            .as_ref()
            .ok_or_else(|| VoiceError::NotStarted("session has no audio channel".to_string()))?;
        audio_tx
            .send(payload)
            .await
            .map_err(|_| VoiceError::Backpressure("audio queue closed".to_string()))
    }

    /// Enqueue a structured control frame. Control frames jump ahead of
    /// queued audio.
    pub fn send_control(&self, message: ClientMessage) -> VoiceResult<()> {
        if self.state() != SessionState::Started {
            return Err(VoiceError::NotStarted(
                "send_control before session started".to_string(),
            ));
        }
        self.command_tx
            .as_ref()
            .ok_or_else(|| VoiceError::NotStarted("session has no control channel".to_string()))?
            .send(DriverCommand::Control(message))
            .map_err(|_| VoiceError::Closed("session driver gone".to_string()))
    }

    /// Flush queued audio, send `EndOfStream` with the final sequence
    /// number, and drain until the server acknowledged every frame and
    /// sent `EndOfTranscript`. Resolves once the socket closed cleanly.
    pub async fn finalize(&self) -> VoiceResult<()> {
        if self.state() != SessionState::Started {
            return Err(VoiceError::Closed(format!(
                "finalize in state {:?}",
                self.state()
            )));
        }
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| VoiceError::NotStarted("session has no control channel".to_string()))?;

        let (done_tx, done_rx) = oneshot::channel();
        command_tx
            .send(DriverCommand::Finalize { done: done_tx })
            .map_err(|_| VoiceError::Closed("session driver gone".to_string()))?;

        done_rx
            .await
            .map_err(|_| VoiceError::Closed("session ended during drain".to_string()))?
    }

    /// Ask the driver to close without draining. Unlike
    /// [`close`](Self::close) this does not wait for the driver to
    /// finish; the event stream reports the outcome.
    pub fn request_close(&self) {
        if let Some(command_tx) = &self.command_tx {
            let _ = command_tx.send(DriverCommand::Close);
        }
    }

    /// Hard close: drop the socket without draining.
    pub async fn close(&mut self) {
        if let Some(command_tx) = self.command_tx.take() {
            let _ = command_tx.send(DriverCommand::Close);
        }
        self.audio_tx = None;
        if let Some(driver) = self.driver.take() {
            let _ = timeout(Duration::from_secs(2), driver).await;
        }
        let mut state = self.state.write();
        if *state != SessionState::Failed {
            *state = SessionState::Closed;
        }
    }
}

impl Drop for RtSession {
    fn drop(&mut self) {
        if let Some(command_tx) = self.command_tx.take() {
            let _ = command_tx.send(DriverCommand::Close);
        }
    }
}

fn classify_connect_error(error: tokio_tungstenite::tungstenite::Error) -> VoiceError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match error {
        WsError::Http(response) => {
            let status = response.status();
            if status == 401 || status == 403 {
                VoiceError::Auth(format!("handshake rejected: HTTP {status}"))
            } else {
                VoiceError::Connection(format!("handshake failed: HTTP {status}"))
            }
        }
        other => VoiceError::Connection(format!("WebSocket connect failed: {other}")),
    }
}

// =============================================================================
// Driver task
// =============================================================================

struct Driver {
    state: Arc<RwLock<SessionState>>,
    audio_seq_sent: Arc<AtomicU64>,
    audio_seq_acked: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    connection: ConnectionConfig,
}

enum Inbound {
    Continue,
    CleanClose,
    Fatal(VoiceError),
}

impl Driver {
    async fn run(
        self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
        mut audio_rx: mpsc::Receiver<Bytes>,
    ) {
        let (mut sink, mut stream) = ws.split();

        let mut draining = false;
        let mut eot_seen = false;
        let mut finalize_done: Option<oneshot::Sender<VoiceResult<()>>> = None;
        // Far-future deadline until draining starts.
        let mut drain_deadline = Instant::now() + Duration::from_secs(86_400);

        let mut ping_tick =
            tokio::time::interval(Duration::from_secs_f64(self.connection.ping_interval.max(1.0)));
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_tick.tick().await; // first tick is immediate
        let pong_timeout = Duration::from_secs_f64(self.connection.ping_timeout);
        let mut last_pong = Instant::now();

        let outcome: Result<(), VoiceError> = loop {
            // Graceful completion: everything acked and transcript done.
            if draining
                && eot_seen
                && self.audio_seq_acked.load(Ordering::Acquire)
                    >= self.audio_seq_sent.load(Ordering::Acquire)
            {
                break Ok(());
            }

            tokio::select! {
                biased;

                command = command_rx.recv() => {
                    match command {
                        Some(DriverCommand::Control(message)) => {
                            let json = match message.to_json() {
                                Ok(json) => json,
                                Err(e) => break Err(e),
                            };
                            if let Err(e) = sink.send(Message::Text(json.into())).await {
                                break Err(VoiceError::Transport(format!("control send failed: {e}")));
                            }
                        }
                        Some(DriverCommand::Finalize { done }) => {
                            if draining {
                                let _ = done.send(Err(VoiceError::Closed(
                                    "already draining".to_string(),
                                )));
                                continue;
                            }
                            draining = true;
                            *self.state.write() = SessionState::Draining;
                            finalize_done = Some(done);
                            drain_deadline = Instant::now()
                                + Duration::from_secs_f64(self.connection.close_timeout);

                            // Flush every frame accepted before finalize.
                            audio_rx.close();
                            let mut flush_error = None;
                            while let Ok(frame) = audio_rx.try_recv() {
                                if let Err(e) = self.transmit_audio(&mut sink, frame).await {
                                    flush_error = Some(e);
                                    break;
                                }
                            }
                            if let Some(e) = flush_error {
                                break Err(e);
                            }

                            let last_seq_no = self.audio_seq_sent.load(Ordering::Acquire);
                            info!(last_seq_no, "sending EndOfStream");
                            let eos = ClientMessage::EndOfStream { last_seq_no };
                            let json = match eos.to_json() {
                                Ok(json) => json,
                                Err(e) => break Err(e),
                            };
                            if let Err(e) = sink.send(Message::Text(json.into())).await {
                                break Err(VoiceError::Transport(format!(
                                    "EndOfStream send failed: {e}"
                                )));
                            }
                        }
                        Some(DriverCommand::Close) | None => {
                            debug!("hard close requested");
                            let _ = sink.send(Message::Close(None)).await;
                            break Ok(());
                        }
                    }
                }

                frame = audio_rx.recv(), if !draining => {
                    match frame {
                        Some(payload) => {
                            if let Err(e) = self.transmit_audio(&mut sink, payload).await {
                                break Err(e);
                            }
                        }
                        // Sender dropped; nothing more to transmit.
                        None => {}
                    }
                }

                frame = stream.next() => {
                    match self.handle_inbound(frame, &mut eot_seen, &mut draining, &mut last_pong, &mut sink).await {
                        Inbound::Continue => {}
                        Inbound::CleanClose => break Ok(()),
                        Inbound::Fatal(e) => break Err(e),
                    }
                }

                _ = ping_tick.tick() => {
                    if last_pong.elapsed() > pong_timeout {
                        break Err(VoiceError::Timeout(format!(
                            "no pong within {}s",
                            self.connection.ping_timeout
                        )));
                    }
                    if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                        break Err(VoiceError::Transport(format!("ping failed: {e}")));
                    }
                }

                _ = tokio::time::sleep_until(drain_deadline), if draining => {
                    break Err(VoiceError::Timeout(
                        "drain did not complete within close_timeout".to_string(),
                    ));
                }
            }
        };

        // Close the socket either way; bounded by close_timeout.
        let close_timeout = Duration::from_secs_f64(self.connection.close_timeout);
        let _ = timeout(close_timeout, async {
            let _ = sink.send(Message::Close(None)).await;
            while let Some(Ok(frame)) = stream.next().await {
                if matches!(frame, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                *self.state.write() = SessionState::Closed;
                if let Some(done) = finalize_done.take() {
                    let _ = done.send(Ok(()));
                }
                let _ = self.events_tx.send(SessionEvent::Closed);
                info!("session closed");
            }
            Err(error) => {
                *self.state.write() = SessionState::Failed;
                error!("session failed: {error}");
                if let Some(done) = finalize_done.take() {
                    let _ = done.send(Err(error.clone()));
                }
                let _ = self.events_tx.send(SessionEvent::Fatal(error));
            }
        }
    }

    async fn transmit_audio(&self, sink: &mut WsSink, payload: Bytes) -> VoiceResult<()> {
        sink.send(Message::Binary(payload.to_vec().into()))
            .await
            .map_err(|e| VoiceError::Transport(format!("audio send failed: {e}")))?;
        self.audio_seq_sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn handle_inbound(
        &self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        eot_seen: &mut bool,
        draining: &mut bool,
        last_pong: &mut Instant,
        sink: &mut WsSink,
    ) -> Inbound {
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                return Inbound::Fatal(VoiceError::Transport(format!("receive error: {e}")))
            }
            None => {
                return if *draining || *eot_seen {
                    Inbound::CleanClose
                } else {
                    Inbound::Fatal(VoiceError::Transport(
                        "connection closed by server".to_string(),
                    ))
                }
            }
        };

        // Any inbound traffic proves the peer is alive.
        *last_pong = Instant::now();

        match frame {
            Message::Text(text) => {
                let message = match ServerMessage::parse(&text) {
                    Ok(message) => message,
                    Err(e) => return Inbound::Fatal(e),
                };
                match message {
                    ServerMessage::AudioAdded { seq_no } => {
                        let sent = self.audio_seq_sent.load(Ordering::Acquire);
                        if seq_no > sent {
                            return Inbound::Fatal(VoiceError::Protocol(format!(
                                "AudioAdded seq_no {seq_no} exceeds {sent} frames sent"
                            )));
                        }
                        self.audio_seq_acked.fetch_max(seq_no, Ordering::AcqRel);
                    }
                    ServerMessage::Error(notice) => {
                        return Inbound::Fatal(VoiceError::Server {
                            kind: notice.kind,
                            reason: notice.reason,
                        });
                    }
                    ServerMessage::EndOfTranscript => {
                        *eot_seen = true;
                        // A server-initiated end also drains the session.
                        if !*draining {
                            *draining = true;
                            *self.state.write() = SessionState::Draining;
                        }
                        let _ = self
                            .events_tx
                            .send(SessionEvent::Message(ServerMessage::EndOfTranscript));
                    }
                    ServerMessage::Unknown(kind) => {
                        debug!(kind = %kind, "ignoring unknown server message");
                    }
                    other => {
                        let _ = self.events_tx.send(SessionEvent::Message(other));
                    }
                }
                Inbound::Continue
            }
            Message::Ping(payload) => {
                if let Err(e) = sink.send(Message::Pong(payload)).await {
                    return Inbound::Fatal(VoiceError::Transport(format!("pong failed: {e}")));
                }
                Inbound::Continue
            }
            Message::Pong(_) => Inbound::Continue,
            Message::Close(_) => {
                if *draining || *eot_seen {
                    Inbound::CleanClose
                } else {
                    Inbound::Fatal(VoiceError::Transport(
                        "server sent close before end of transcript".to_string(),
                    ))
                }
            }
            Message::Binary(payload) => {
                warn!(bytes = payload.len(), "unexpected binary frame from server");
                Inbound::Continue
            }
            Message::Frame(_) => Inbound::Continue,
        }
    }
}
