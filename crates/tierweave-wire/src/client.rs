//! Client role of a tier connection: dial out, authenticate, buffer
//! while disconnected, reconnect with a bounded retry budget.
//!
//! The dialing tier opens a single outbound websocket to a peer tier.
//! Frames sent while disconnected accumulate in an outgoing buffer and
//! are flushed in order on the next successful connect. On socket loss
//! the client reconnects immediately; a session that lasted at least
//! [`ClientConfig::session_reset`] refills the retry budget, anything
//! shorter consumes one unit. When the budget hits zero the client
//! gives up and surfaces [`ClientEvent::Failed`] carrying every frame
//! it could not deliver, so the caller can persist or resubmit them.
//!
//! Keepalive is the websocket's native ping/pong: tungstenite answers
//! pings automatically while the read loop is polled.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::frame::{self, Control, Frame};

const EVENT_CHANNEL_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── ClientConfig ─────────────────────────────────────────────────────

/// Connection parameters for the client role.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Peer tier websocket address, e.g. `ws://server.local:3001`.
    pub url: Url,

    /// Identity announced in the `auth` frame (this tier's name).
    pub identity: String,

    /// Auth token. `None` skips the `auth` frame entirely — used only
    /// for the `set-auth-token` pairing bootstrap.
    pub token: Option<String>,

    /// Hard bound on a single connect attempt. Default: 10s.
    pub connect_timeout: Duration,

    /// Connect attempts available before giving up. Default: 3.
    pub retry_budget: u32,

    /// A session lasting at least this long refills the retry budget.
    /// Default: 60s.
    pub session_reset: Duration,

    /// Pause between consecutive short-session retries. Default: none —
    /// the budget, not a backoff curve, is what prevents a tight loop
    /// against a permanently-unreachable peer.
    pub retry_delay: Duration,
}

impl ClientConfig {
    pub fn new(url: Url, identity: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url,
            identity: identity.into(),
            token,
            connect_timeout: Duration::from_secs(10),
            retry_budget: 3,
            session_reset: Duration::from_secs(60),
            retry_delay: Duration::ZERO,
        }
    }
}

// ── ClientEvent ──────────────────────────────────────────────────────

/// Events surfaced by a [`TierClient`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Socket established and auth frame sent; buffered frames flushed.
    Connected,

    /// A `data` frame arrived; `control` already stripped.
    Message(Frame),

    /// Reply to a `set-auth-token` pairing request.
    Pairing { ok: bool },

    /// The client gave up: retry budget exhausted or the peer requested
    /// session close. Carries every buffered-but-unsent frame.
    Failed { undelivered: Vec<Frame> },

    /// Expected teardown after [`TierClient::close`].
    Closed,
}

// ── TierClient ───────────────────────────────────────────────────────

enum Cmd {
    Send(Frame),
    Close,
}

/// Handle to the client side of a tier connection.
///
/// Cheaply cloneable; the connection itself lives in a background task
/// spawned by [`open`](Self::open).
#[derive(Clone)]
pub struct TierClient {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
}

impl TierClient {
    /// Spawn the connection task and start dialing.
    ///
    /// Returns immediately; subscribe to observe `Connected` /
    /// `Failed`. The first connect attempt is bounded by
    /// [`ClientConfig::connect_timeout`].
    pub fn open(config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let task_events = events.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            client_loop(config, cmd_rx, task_events, task_cancel).await;
        });

        Self {
            cmd_tx,
            events,
            cancel,
        }
    }

    /// Queue a frame for delivery. Sent immediately when connected,
    /// otherwise buffered until the next successful connect. The buffer
    /// is unbounded — bounding its growth is the caller's job.
    pub fn send(&self, frame: Frame) {
        if self.cmd_tx.send(Cmd::Send(frame)).is_err() {
            debug!("send after connection task ended; frame dropped");
        }
    }

    /// Send a `set-auth-token` pairing request. The peer replies with
    /// [`ClientEvent::Pairing`] and closes the connection.
    pub fn set_auth_token(&self, token: &str) {
        self.send(frame::set_auth_token_frame(token));
    }

    /// Request expected teardown: the ensuing socket close is not
    /// treated as a failure and no reconnect is attempted.
    pub fn close(&self) {
        if self.cmd_tx.send(Cmd::Close).is_err() {
            self.cancel.cancel();
        }
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

// ── Connection loop ──────────────────────────────────────────────────

enum SessionEnd {
    /// `close()` was called; teardown was expected.
    Requested,
    /// Peer sent a `close` control frame.
    PeerClose,
    /// Socket lost without a close handshake.
    Lost,
}

/// Main loop: connect → session → on loss, consume or refill the retry
/// budget → reconnect. Mirrors a connect/read/backoff loop with the
/// budget replacing an unbounded backoff curve.
async fn client_loop(
    config: ClientConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
) {
    let mut buffer: VecDeque<Frame> = VecDeque::new();
    let mut retries_left = config.retry_budget;

    loop {
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_once(&config) => result,
        };

        match attempt {
            Ok(mut ws) => {
                if let Err(e) = start_session(&config, &mut ws, &mut buffer).await {
                    warn!(error = %e, "session setup failed");
                    retries_left = retries_left.saturating_sub(1);
                    if retries_left == 0 {
                        give_up(&mut buffer, &mut cmd_rx, &events);
                        break;
                    }
                    tokio::time::sleep(config.retry_delay).await;
                    continue;
                }

                let _ = events.send(ClientEvent::Connected);
                let connected_at = Instant::now();

                match run_session(&mut ws, &mut buffer, &mut cmd_rx, &cancel, &events).await {
                    SessionEnd::Requested => {
                        let _ = events.send(ClientEvent::Closed);
                        break;
                    }
                    SessionEnd::PeerClose => {
                        info!("peer requested session close");
                        give_up(&mut buffer, &mut cmd_rx, &events);
                        break;
                    }
                    SessionEnd::Lost => {
                        if connected_at.elapsed() >= config.session_reset {
                            debug!("sustained session; retry budget refilled");
                            retries_left = config.retry_budget;
                        } else {
                            retries_left = retries_left.saturating_sub(1);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, retries_left, "connect attempt failed");
                retries_left = retries_left.saturating_sub(1);
            }
        }

        if retries_left == 0 {
            give_up(&mut buffer, &mut cmd_rx, &events);
            break;
        }
        tokio::time::sleep(config.retry_delay).await;
    }

    debug!("client connection loop exiting");
}

/// Establish the socket, bounded by the hard connect timeout.
async fn connect_once(config: &ClientConfig) -> Result<WsStream, Error> {
    let uri: tungstenite::http::Uri = config
        .url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::Connect(e.to_string()))?;
    let request = ClientRequestBuilder::new(uri);

    let connect = tokio_tungstenite::connect_async(request);
    match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(Ok((ws, _response))) => {
            debug!(url = %config.url, "tier connection established");
            Ok(ws)
        }
        Ok(Err(e)) => Err(Error::Connect(e.to_string())),
        Err(_) => Err(Error::ConnectTimeout {
            timeout_secs: config.connect_timeout.as_secs(),
        }),
    }
}

/// Post-connect setup: send the `auth` frame (if a token is
/// configured), then flush the outgoing buffer in order, tagging any
/// untagged frame as `data`.
async fn start_session(
    config: &ClientConfig,
    ws: &mut WsStream,
    buffer: &mut VecDeque<Frame>,
) -> Result<(), Error> {
    if let Some(token) = &config.token {
        let auth = frame::auth_frame(&config.identity, token);
        send_frame(ws, &auth).await?;
    }

    while let Some(mut f) = buffer.pop_front() {
        frame::tag_data(&mut f);
        if let Err(e) = send_frame(ws, &f).await {
            buffer.push_front(f);
            return Err(e);
        }
    }
    Ok(())
}

async fn send_frame(ws: &mut WsStream, f: &Frame) -> Result<(), Error> {
    ws.send(tungstenite::Message::text(frame::serialize(f)))
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))
}

/// Pump the established session until it ends one way or another.
async fn run_session(
    ws: &mut WsStream,
    buffer: &mut VecDeque<Frame>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Cmd>,
    cancel: &CancellationToken,
    events: &broadcast::Sender<ClientEvent>,
) -> SessionEnd {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = send_frame(ws, &frame::close_frame()).await;
                let _ = ws.close(None).await;
                return SessionEnd::Requested;
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Send(mut f)) => {
                    frame::tag_data(&mut f);
                    if let Err(e) = send_frame(ws, &f).await {
                        warn!(error = %e, "send failed; frame re-buffered");
                        buffer.push_back(f);
                        return SessionEnd::Lost;
                    }
                }
                Some(Cmd::Close) | None => {
                    let _ = send_frame(ws, &frame::close_frame()).await;
                    let _ = ws.close(None).await;
                    return SessionEnd::Requested;
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    if let Some(f) = frame::parse_frame(text.as_str()) {
                        match frame::control_of(&f) {
                            Some(Control::Data) => {
                                let _ = events.send(ClientEvent::Message(frame::strip_control(f)));
                            }
                            Some(Control::Close) => return SessionEnd::PeerClose,
                            Some(Control::AuthTokenOk) => {
                                let _ = events.send(ClientEvent::Pairing { ok: true });
                            }
                            Some(Control::AuthTokenError) => {
                                let _ = events.send(ClientEvent::Pairing { ok: false });
                            }
                            _ => {
                                // Forward/backward compat: unknown control
                                // values are not fatal.
                                warn!(
                                    control = frame::raw_control(&f).unwrap_or("<missing>"),
                                    "ignoring frame with unexpected control"
                                );
                            }
                        }
                    }
                }
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {
                    // tungstenite answers pings automatically.
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    return SessionEnd::Lost;
                }
                Some(Ok(_)) => {
                    // Binary / raw frames are not part of the protocol.
                }
                Some(Err(e)) => {
                    warn!(error = %e, "websocket error");
                    return SessionEnd::Lost;
                }
            },
        }
    }
}

/// Surface everything still undelivered — the caller decides whether
/// to persist, discard, or retry out-of-band.
fn give_up(
    buffer: &mut VecDeque<Frame>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Cmd>,
    events: &broadcast::Sender<ClientEvent>,
) {
    let mut undelivered: Vec<Frame> = buffer.drain(..).collect();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let Cmd::Send(f) = cmd {
            undelivered.push(f);
        }
    }
    warn!(
        undelivered = undelivered.len(),
        "giving up on tier connection"
    );
    let _ = events.send(ClientEvent::Failed { undelivered });
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_protocol() {
        let url = Url::parse("ws://127.0.0.1:9/").unwrap();
        let cfg = ClientConfig::new(url, "phone", Some("tok".into()));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.retry_budget, 3);
        assert_eq!(cfg.session_reset, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn sustained_sessions_refill_the_retry_budget() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        // Accept, hold each session past the reset threshold, drop it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let _ = ws.close(None).await;
                }
            }
        });

        let url = Url::parse(&format!("ws://{addr}/")).unwrap();
        let mut cfg = ClientConfig::new(url, "phone", Some("tok".into()));
        cfg.session_reset = Duration::from_millis(50);
        cfg.retry_delay = Duration::from_millis(10);

        let client = TierClient::open(cfg);
        let mut rx = client.subscribe();

        // Five reconnections exceed the budget of three; each session
        // outlives session_reset, so the budget keeps refilling.
        let mut connects = 0;
        while connects < 5 {
            match rx.recv().await.unwrap() {
                ClientEvent::Connected => connects += 1,
                ClientEvent::Failed { .. } => {
                    panic!("budget must refill after sustained sessions");
                }
                _ => {}
            }
        }
        assert!(accepted.load(Ordering::SeqCst) >= 5);
        client.close();
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_buffered_frames() {
        // Nothing listens on this address: grab an ephemeral port and
        // release it so connects fail fast.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/")).unwrap();
        let mut cfg = ClientConfig::new(url, "phone", Some("tok".into()));
        cfg.connect_timeout = Duration::from_millis(500);
        cfg.retry_delay = Duration::from_millis(10);

        let client = TierClient::open(cfg);
        let mut rx = client.subscribe();

        let mut f = Frame::new();
        f.insert("seq".into(), serde_json::Value::from(1));
        client.send(f);

        loop {
            match rx.recv().await.unwrap() {
                ClientEvent::Failed { undelivered } => {
                    assert_eq!(undelivered.len(), 1);
                    assert_eq!(undelivered[0]["seq"], 1);
                    break;
                }
                other => panic!("unexpected event before Failed: {other:?}"),
            }
        }
    }
}
