//! Connection Manager
//!
//! Owns one duplex WebSocket connection scoped to a chat session. The socket
//! lives in a spawned task; the manager talks to it over an outbound queue
//! and hears back through two channels:
//!
//! - a `watch` channel carrying the current [`ConnectionStatus`]
//! - an ordered event channel carrying status transitions interleaved with
//!   decoded frames, so a consumer sees `Connected`, the frames, then the
//!   terminal transition in exactly the order they happened.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, InboundEvent, OutboundFrame};
use crate::error::{ChatError, ChatResult};
use crate::models::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a connection reports, tagged with the session it is scoped to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Status {
        session_id: SessionId,
        status: ConnectionStatus,
    },
    /// The handshake was refused or timed out. Always followed by
    /// `Status { status: Error }`.
    HandshakeFailed {
        session_id: SessionId,
        error: ChatError,
    },
    Frame {
        session_id: SessionId,
        event: InboundEvent,
    },
}

impl ConnectionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            ConnectionEvent::Status { session_id, .. }
            | ConnectionEvent::HandshakeFailed { session_id, .. }
            | ConnectionEvent::Frame { session_id, .. } => *session_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Base WebSocket URL, e.g. `ws://127.0.0.1:8000`.
    pub ws_url: Url,
    pub connect_timeout: Duration,
    pub outbound_buffer: usize,
}

/// Build `{ws_url}/chat/ws/{session_id}?token={token}`.
pub fn socket_url(base: &Url, session_id: SessionId, token: &str) -> ChatResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ChatError::Config(format!("invalid websocket base url: {base}")))?
        .pop_if_empty()
        .extend(["chat", "ws", &session_id.to_string()]);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

/// Reports status and frames for one connect attempt. Stale attempts (after
/// a disconnect or a newer connect) are silenced.
#[derive(Clone)]
struct Reporter {
    session_id: SessionId,
    attempt: u64,
    current_attempt: Arc<AtomicU64>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Reporter {
    fn is_current(&self) -> bool {
        self.current_attempt.load(Ordering::SeqCst) == self.attempt
    }

    fn status(&self, next: ConnectionStatus) {
        // The attempt check runs under the watch lock so a concurrent
        // disconnect() cannot be overwritten by a late transition.
        self.status.send_if_modified(|status| {
            if !self.is_current() {
                return false;
            }
            let _ = self.events.send(ConnectionEvent::Status {
                session_id: self.session_id,
                status: next,
            });
            let changed = *status != next;
            *status = next;
            changed
        });
    }

    fn handshake_failed(&self, error: ChatError) {
        if self.is_current() {
            let _ = self.events.send(ConnectionEvent::HandshakeFailed {
                session_id: self.session_id,
                error,
            });
        }
    }

    fn frame(&self, event: InboundEvent) {
        if self.is_current() {
            let _ = self.events.send(ConnectionEvent::Frame {
                session_id: self.session_id,
                event,
            });
        }
    }
}

struct Live {
    session_id: SessionId,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    status: Arc<watch::Sender<ConnectionStatus>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    attempt: Arc<AtomicU64>,
    live: Option<Live>,
}

impl ConnectionManager {
    /// Create a manager and the receiving end of its event channel.
    ///
    /// Dropping the receiver silences the manager; dropping the manager
    /// closes the socket.
    pub fn new(settings: ConnectionSettings) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let manager = Self {
            settings,
            status: Arc::new(status),
            events,
            attempt: Arc::new(AtomicU64::new(0)),
            live: None,
        };
        (manager, events_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// The session the current (or last) connection is scoped to.
    pub fn session_id(&self) -> Option<SessionId> {
        self.live.as_ref().map(|live| live.session_id)
    }

    /// Start connecting to `session_id`. Returns once the attempt is under
    /// way; the outcome arrives on the status and event channels.
    pub fn connect(&mut self, session_id: SessionId, token: &str) -> ChatResult<()> {
        if token.trim().is_empty() {
            return Err(ChatError::AuthRequired);
        }

        match self.status() {
            ConnectionStatus::Connecting => return Err(ChatError::AlreadyConnecting),
            ConnectionStatus::Connected if self.session_id() == Some(session_id) => {
                debug!(session_id = %session_id, "already connected");
                return Ok(());
            }
            _ => {}
        }

        let url = socket_url(&self.settings.ws_url, session_id, token)?;
        self.teardown();

        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let reporter = Reporter {
            session_id,
            attempt,
            current_attempt: self.attempt.clone(),
            status: self.status.clone(),
            events: self.events.clone(),
        };
        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(self.settings.outbound_buffer.max(1));

        reporter.status(ConnectionStatus::Connecting);
        tokio::spawn(run_socket(
            url,
            self.settings.connect_timeout,
            reporter,
            outbound_rx,
            cancel.clone(),
        ));

        self.live = Some(Live {
            session_id,
            outbound,
            cancel,
        });
        Ok(())
    }

    /// Tear down the connection. Idempotent.
    pub fn disconnect(&mut self) {
        let had_connection = self.teardown();
        // Invalidate the old attempt before publishing, so its task cannot
        // report over this transition.
        self.attempt.fetch_add(1, Ordering::SeqCst);
        let previous = self.status.send_replace(ConnectionStatus::Disconnected);
        if let Some(session_id) = had_connection {
            if previous != ConnectionStatus::Disconnected {
                let _ = self.events.send(ConnectionEvent::Status {
                    session_id,
                    status: ConnectionStatus::Disconnected,
                });
            }
        }
    }

    /// Queue a frame for the socket. Fails with `NotConnected` (nothing was
    /// transmitted) unless connected to the frame's session.
    pub fn send(&self, frame: OutboundFrame) -> ChatResult<()> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ChatError::NotConnected);
        }
        let Some(live) = self.live.as_ref().filter(|l| l.session_id == frame.session_id) else {
            return Err(ChatError::NotConnected);
        };
        live.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => ChatError::NotConnected,
            mpsc::error::TrySendError::Full(_) => ChatError::SendFailed {
                reason: "outbound queue is full".to_string(),
            },
        })
    }

    fn teardown(&mut self) -> Option<SessionId> {
        let live = self.live.take()?;
        live.cancel.cancel();
        Some(live.session_id)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.cancel.cancel();
        }
    }
}

async fn run_socket(
    url: Url,
    connect_timeout: Duration,
    reporter: Reporter,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) {
    let session_id = reporter.session_id;

    let handshake = tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    );
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = handshake => result,
    };

    let ws_stream = match result {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => {
            let error = ChatError::from_tungstenite(e);
            warn!(session_id = %session_id, error = %error, "websocket handshake failed");
            reporter.handshake_failed(error);
            reporter.status(ConnectionStatus::Error);
            return;
        }
        Err(_) => {
            warn!(
                session_id = %session_id,
                timeout_secs = connect_timeout.as_secs(),
                "websocket handshake timed out"
            );
            reporter.handshake_failed(ChatError::ProtocolViolation(
                "handshake timed out".to_string(),
            ));
            reporter.status(ConnectionStatus::Error);
            return;
        }
    };

    info!(session_id = %session_id, "connected");
    reporter.status(ConnectionStatus::Connected);

    let (mut ws_write, mut ws_read) = ws_stream.split();

    let terminal = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client closing".into(),
                };
                let _ = ws_write.send(tungstenite::Message::Close(Some(close))).await;
                debug!(session_id = %session_id, "connection cancelled");
                // disconnect() has already published the transition.
                return;
            }

            Some(frame) = outbound_rx.recv() => {
                let json = match codec::encode(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(tungstenite::Message::Text(json.into())).await {
                    warn!(session_id = %session_id, error = %e, "websocket write failed");
                    break ConnectionStatus::Error;
                }
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match codec::decode(session_id, &text) {
                            Ok(Some(event)) => reporter.frame(event),
                            Ok(None) => {}
                            Err(e) => {
                                warn!(session_id = %session_id, error = %e, "dropping frame");
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        break close_status(session_id, frame.as_ref());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "websocket read failed");
                        break ConnectionStatus::Error;
                    }
                    None => {
                        warn!(session_id = %session_id, "websocket ended without close frame");
                        break ConnectionStatus::Error;
                    }
                }
            }
        }
    };

    reporter.status(terminal);
}

fn close_status(session_id: SessionId, frame: Option<&CloseFrame>) -> ConnectionStatus {
    match frame.map(|f| f.code) {
        None | Some(CloseCode::Normal) | Some(CloseCode::Away) => {
            info!(session_id = %session_id, "connection closed");
            ConnectionStatus::Disconnected
        }
        Some(code) => {
            warn!(
                session_id = %session_id,
                code = u16::from(code),
                reason = %frame.map(|f| f.reason.as_str()).unwrap_or_default(),
                "connection closed abnormally"
            );
            ConnectionStatus::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(ws_url: &str) -> ConnectionSettings {
        ConnectionSettings {
            ws_url: Url::parse(ws_url).unwrap(),
            connect_timeout: Duration::from_secs(2),
            outbound_buffer: 8,
        }
    }

    #[test]
    fn test_socket_url_carries_session_and_token() {
        let base = Url::parse("ws://localhost:8000").unwrap();
        let url = socket_url(&base, SessionId(42), "a b&c").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/chat/ws/42?token=a+b%26c");

        let base = Url::parse("wss://example.com/api/").unwrap();
        let url = socket_url(&base, SessionId(1), "t").unwrap();
        assert_eq!(url.as_str(), "wss://example.com/api/chat/ws/1?token=t");
    }

    #[test]
    fn test_close_codes() {
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let away = CloseFrame {
            code: CloseCode::Away,
            reason: "".into(),
        };
        let policy = CloseFrame {
            code: CloseCode::Policy,
            reason: "unauthorized".into(),
        };
        assert_eq!(close_status(SessionId(1), Some(&normal)), ConnectionStatus::Disconnected);
        assert_eq!(close_status(SessionId(1), Some(&away)), ConnectionStatus::Disconnected);
        assert_eq!(close_status(SessionId(1), None), ConnectionStatus::Disconnected);
        assert_eq!(close_status(SessionId(1), Some(&policy)), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_blank_token_fails_before_network() {
        let (mut manager, mut events) = ConnectionManager::new(settings("ws://127.0.0.1:9"));
        assert_eq!(manager.connect(SessionId(1), "  "), Err(ChatError::AuthRequired));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let (manager, _events) = ConnectionManager::new(settings("ws://127.0.0.1:9"));
        assert_eq!(
            manager.send(OutboundFrame::new(SessionId(1), "hi")),
            Err(ChatError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_second_connect_while_connecting_is_rejected() {
        // A listener that accepts TCP but never answers the upgrade keeps the
        // first attempt in `connecting`.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let (mut manager, mut events) =
            ConnectionManager::new(settings(&format!("ws://{addr}")));
        manager.connect(SessionId(1), "tok").unwrap();
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        assert_eq!(
            manager.connect(SessionId(1), "tok"),
            Err(ChatError::AlreadyConnecting)
        );

        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            seen.push(ev);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::Status {
                    session_id: SessionId(1),
                    status: ConnectionStatus::Connecting
                },
                ConnectionEvent::Status {
                    session_id: SessionId(1),
                    status: ConnectionStatus::Disconnected
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_handshake_timeout_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut settings = settings(&format!("ws://{addr}"));
        settings.connect_timeout = Duration::from_secs(1);
        let (mut manager, mut events) = ConnectionManager::new(settings);
        manager.connect(SessionId(5), "tok").unwrap();

        let mut status = manager.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == ConnectionStatus::Error),
        )
        .await
        .expect("handshake never timed out")
        .unwrap();

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Status { status: ConnectionStatus::Connecting, .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::HandshakeFailed {
                session_id: SessionId(5),
                error: ChatError::ProtocolViolation(_),
            })
        ));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Status { status: ConnectionStatus::Error, .. })
        ));
    }

    #[tokio::test]
    async fn test_refused_handshake_reports_error() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (mut manager, mut events) =
            ConnectionManager::new(settings(&format!("ws://{addr}")));
        manager.connect(SessionId(3), "tok").unwrap();

        let mut status = manager.subscribe();
        status
            .wait_for(|s| *s == ConnectionStatus::Error)
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Status { status: ConnectionStatus::Connecting, .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::HandshakeFailed { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Status { status: ConnectionStatus::Error, .. })
        ));

        // Error accepts a fresh connect.
        assert!(manager.connect(SessionId(3), "tok").is_ok());
    }
}
