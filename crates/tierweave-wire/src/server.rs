//! Server role of a tier connection: accept inbound sockets, gate them
//! behind authentication, and keep one live session per peer identity.
//!
//! Every accepted socket starts unauthenticated. Pre-auth it may only
//! pair (`set-auth-token`, a one-shot bootstrap that stores a token if
//! none exists and then closes) or authenticate (`auth`). A `None`
//! configured token never matches an `auth` attempt — until pairing has
//! run, every session is rejected. On successful auth the socket is
//! registered under its identity, any previous socket for that identity
//! is forcibly terminated, and frames buffered while the identity was
//! offline are flushed in order. No `data` frame reaches subscribers
//! from an unauthenticated socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::frame::{self, Control, Frame};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── ServerConfig ─────────────────────────────────────────────────────

/// Tunables for the accepting role.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Keepalive ping period per authenticated peer. Default: 30 min.
    pub keepalive: Duration,

    /// How long a graceful close waits for the peer's own socket close
    /// before forcing termination. Default: 10s.
    pub close_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30 * 60),
            close_timeout: Duration::from_secs(10),
        }
    }
}

// ── ServerEvent ──────────────────────────────────────────────────────

/// Events surfaced by a [`TierServer`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A `data` frame arrived from an authenticated peer; `control`
    /// already stripped.
    Message { identity: String, frame: Frame },

    /// A peer completed authentication.
    Connected { identity: String },

    /// A peer's session ended (graceful or lost). Its outgoing buffer
    /// is preserved for the next authenticated reconnection.
    Disconnected { identity: String },
}

// ── TierServer ───────────────────────────────────────────────────────

enum PeerCmd {
    Send(Frame),
    Close,
}

struct PeerHandle {
    epoch: u64,
    tx: mpsc::UnboundedSender<PeerCmd>,
    cancel: CancellationToken,
}

/// Handle to the accepting side of a tier's connections.
#[derive(Clone)]
pub struct TierServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    local_addr: SocketAddr,
    /// identity → live authenticated session.
    peers: DashMap<String, PeerHandle>,
    /// identity → frames queued while that identity is offline.
    buffers: DashMap<String, Vec<Frame>>,
    /// Configured auth token. `None` until pairing; observable so the
    /// embedding process can persist a newly paired token.
    token: watch::Sender<Option<String>>,
    events: broadcast::Sender<ServerEvent>,
    epoch: AtomicU64,
    cancel: CancellationToken,
}

impl TierServer {
    /// Bind the listener and start accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        token: Option<String>,
        config: ServerConfig,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (token_tx, _) = watch::channel(token);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(ServerInner {
            config,
            local_addr,
            peers: DashMap::new(),
            buffers: DashMap::new(),
            token: token_tx,
            events,
            epoch: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        let accept_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            accept_loop(listener, accept_inner).await;
        });

        info!(addr = %local_addr, "tier server listening");
        Ok(Self { inner })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Queue a frame for one identity (`to = Some`) or broadcast to
    /// every known identity (`to = None`). Live peers get it
    /// immediately; offline identities get it buffered for their next
    /// authenticated reconnection.
    pub fn send(&self, frame: Frame, to: Option<&str>) {
        match to {
            Some(identity) => self.send_one(frame, identity),
            None => {
                for identity in self.known_identities() {
                    self.send_one(frame.clone(), &identity);
                }
            }
        }
    }

    fn send_one(&self, frame: Frame, identity: &str) {
        self.inner.route(frame, identity);
    }

    /// Every identity this server has seen: live peers plus identities
    /// with buffered frames.
    pub fn known_identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.peers.iter().map(|e| e.key().clone()).collect();
        for e in self.inner.buffers.iter() {
            if !ids.contains(e.key()) {
                ids.push(e.key().clone());
            }
        }
        ids
    }

    /// Gracefully close one peer's session: a `close` frame, then up to
    /// `close_timeout` waiting for the peer's own socket close, then a
    /// forced termination.
    pub fn close_one(&self, identity: &str) {
        if let Some(peer) = self.inner.peers.get(identity) {
            let _ = peer.tx.send(PeerCmd::Close);
        }
    }

    /// Gracefully close every peer session and stop accepting.
    pub fn close(&self) {
        for peer in self.inner.peers.iter() {
            let _ = peer.tx.send(PeerCmd::Close);
        }
        self.inner.cancel.cancel();
    }

    /// Subscribe to inbound messages and session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Observe the configured auth token. Updated by a successful
    /// `set-auth-token` pairing; the embedding process persists it.
    pub fn token_watch(&self) -> watch::Receiver<Option<String>> {
        self.inner.token.subscribe()
    }
}

impl ServerInner {
    /// Deliver to the live session if there is one, otherwise into the
    /// identity's offline buffer. A send that fails because the session
    /// task just ended hands the frame back; it is buffered, not lost.
    fn route(&self, frame: Frame, identity: &str) {
        let frame = if let Some(peer) = self.peers.get(identity) {
            match peer.tx.send(PeerCmd::Send(frame)) {
                Ok(()) => return,
                Err(e) => match e.0 {
                    PeerCmd::Send(f) => f,
                    PeerCmd::Close => return,
                },
            }
        } else {
            frame
        };
        self.buffers.entry(identity.into()).or_default().push(frame);
    }
}

// ── Accept loop ──────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, inner: Arc<ServerInner>) {
    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "inbound tier connection");
                    let conn_inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        handle_socket(stream, conn_inner).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            },
        }
    }
    debug!("accept loop exiting");
}

// ── Per-socket lifecycle ─────────────────────────────────────────────

/// Drive one socket from handshake through authentication to its
/// authenticated session. The socket carries no application data until
/// `auth` succeeds.
async fn handle_socket(stream: TcpStream, inner: Arc<ServerInner>) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            return;
        }
    };

    // Pre-auth: only `set-auth-token` and `auth` are honored.
    let identity = loop {
        let msg = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return,
            msg = ws.next() => msg,
        };
        match msg {
            Some(Ok(tungstenite::Message::Text(text))) => {
                let Some(f) = frame::parse_frame(text.as_str()) else {
                    continue;
                };
                match frame::control_of(&f) {
                    Some(Control::SetAuthToken) => {
                        handle_pairing(&mut ws, &f, &inner).await;
                        return;
                    }
                    Some(Control::Auth) => {
                        match check_auth(&f, &inner) {
                            Ok(identity) => break identity,
                            Err(e) => {
                                // Fatal to this socket: terminated
                                // without a close handshake.
                                warn!(error = %e, "auth rejected");
                                return;
                            }
                        }
                    }
                    _ => {
                        warn!(
                            control = frame::raw_control(&f).unwrap_or("<missing>"),
                            "ignoring pre-auth frame"
                        );
                    }
                }
            }
            Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {}
            Some(Ok(_)) | Some(Err(_)) | None => return,
        }
    };

    run_peer(ws, identity, inner).await;
}

/// One-time pairing bootstrap: store the offered token if none is
/// configured, reply, close. Never a persistent session.
async fn handle_pairing(ws: &mut WebSocketStream<TcpStream>, f: &Frame, inner: &ServerInner) {
    let offered = f.get("token").and_then(serde_json::Value::as_str);
    let reply = match offered {
        Some(token) if inner.token.borrow().is_none() => {
            info!("auth token paired");
            // send_replace updates the value even with no receivers
            // subscribed yet; plain send would fail and drop the token.
            inner.token.send_replace(Some(token.into()));
            frame::auth_token_ok_frame()
        }
        _ => frame::auth_token_error_frame(),
    };
    let _ = send_frame(ws, &reply).await;
    let _ = ws.close(None).await;
}

fn check_auth(f: &Frame, inner: &ServerInner) -> Result<String, Error> {
    let identity = f
        .get("identity")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let offered = f.get("token").and_then(serde_json::Value::as_str);

    let configured = inner.token.borrow().clone();
    // A `None` configured token never matches: until pairing has run,
    // every auth attempt is rejected.
    match (configured, offered) {
        (Some(expected), Some(got)) if expected == got && !identity.is_empty() => Ok(identity),
        _ => Err(Error::AuthRejected { identity }),
    }
}

enum PeerEnd {
    /// Graceful: requested locally or by the peer's `close` frame.
    Closed,
    /// Socket lost without a close handshake.
    Lost,
    /// A newer authenticated socket took over this identity.
    Superseded,
}

/// Promote an authenticated socket: register it, supersede any previous
/// socket for the identity, flush the offline buffer in order, then
/// pump the session.
async fn run_peer(mut ws: WebSocketStream<TcpStream>, identity: String, inner: Arc<ServerInner>) {
    let epoch = inner.epoch.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let handle = PeerHandle {
        epoch,
        tx,
        cancel: cancel.clone(),
    };
    if let Some(previous) = inner.peers.insert(identity.clone(), handle) {
        info!(identity, "newer connection supersedes previous socket");
        previous.cancel.cancel();
    }

    // Flush frames buffered while this identity was offline, in order.
    if let Some((_, queued)) = inner.buffers.remove(&identity) {
        debug!(identity, frames = queued.len(), "flushing offline buffer");
        let mut queued = queued.into_iter();
        for mut f in queued.by_ref() {
            frame::tag_data(&mut f);
            if send_frame(&mut ws, &f).await.is_err() {
                // Connection already gone: keep the rest for next time.
                let rest: Vec<Frame> = queued.collect();
                inner
                    .peers
                    .remove_if(&identity, |_, h| h.epoch == epoch);
                strand(&inner, &identity, &mut rx, rest);
                return;
            }
        }
    }

    info!(identity, "peer authenticated");
    let _ = inner.events.send(ServerEvent::Connected {
        identity: identity.clone(),
    });

    let end = peer_session(&mut ws, &identity, &mut rx, &cancel, &inner).await;

    match end {
        PeerEnd::Superseded => {
            // Registry entry already belongs to the newer socket.
            debug!(identity, "superseded socket terminated");
        }
        PeerEnd::Closed | PeerEnd::Lost => {
            if matches!(end, PeerEnd::Lost) {
                warn!(identity, "tier connection lost");
            }
            let removed = inner
                .peers
                .remove_if(&identity, |_, h| h.epoch == epoch)
                .is_some();
            if removed {
                let _ = inner.events.send(ServerEvent::Disconnected {
                    identity: identity.clone(),
                });
            }
        }
    }

    strand(&inner, &identity, &mut rx, Vec::new());
}

/// Preserve frames still queued on a finished session's command
/// channel: they were accepted by `send` and must reach the identity's
/// next session, not vanish with the receiver. `ahead` carries frames
/// that precede them (an interrupted buffer flush).
fn strand(
    inner: &ServerInner,
    identity: &str,
    rx: &mut mpsc::UnboundedReceiver<PeerCmd>,
    mut ahead: Vec<Frame>,
) {
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        if let PeerCmd::Send(f) = cmd {
            ahead.push(f);
        }
    }
    if ahead.is_empty() {
        return;
    }
    debug!(identity, frames = ahead.len(), "re-queueing frames from ended session");

    // A superseding session may already be live; it owns delivery now.
    if let Some(peer) = inner.peers.get(identity) {
        for f in ahead {
            if let Err(e) = peer.tx.send(PeerCmd::Send(f)) {
                if let PeerCmd::Send(f) = e.0 {
                    inner.buffers.entry(identity.into()).or_default().push(f);
                }
            }
        }
        return;
    }

    // These frames are older than anything routed to the buffer after
    // the session ended, so they go in front.
    let mut entry = inner.buffers.entry(identity.into()).or_default();
    ahead.extend(entry.drain(..));
    *entry = ahead;
}

async fn peer_session(
    ws: &mut WebSocketStream<TcpStream>,
    identity: &str,
    rx: &mut mpsc::UnboundedReceiver<PeerCmd>,
    cancel: &CancellationToken,
    inner: &ServerInner,
) -> PeerEnd {
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.config.keepalive,
        inner.config.keepalive,
    );

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return PeerEnd::Superseded,
            _ = keepalive.tick() => {
                if ws
                    .send(tungstenite::Message::Ping(Vec::new().into()))
                    .await
                    .is_err()
                {
                    return PeerEnd::Lost;
                }
            }
            cmd = rx.recv() => match cmd {
                Some(PeerCmd::Send(mut f)) => {
                    frame::tag_data(&mut f);
                    if let Err(e) = send_frame(ws, &f).await {
                        warn!(identity, error = %e, "send failed; frame re-buffered");
                        inner.buffers.entry(identity.into()).or_default().push(f);
                        return PeerEnd::Lost;
                    }
                }
                Some(PeerCmd::Close) | None => {
                    let _ = send_frame(ws, &frame::close_frame()).await;
                    graceful_close(ws, inner.config.close_timeout).await;
                    return PeerEnd::Closed;
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    let Some(f) = frame::parse_frame(text.as_str()) else {
                        continue;
                    };
                    match frame::control_of(&f) {
                        Some(Control::Data) => {
                            let _ = inner.events.send(ServerEvent::Message {
                                identity: identity.into(),
                                frame: frame::strip_control(f),
                            });
                        }
                        Some(Control::Close) => {
                            let _ = ws.close(None).await;
                            return PeerEnd::Closed;
                        }
                        _ => {
                            // Post-auth, only `data` is meaningful;
                            // unknown controls are not fatal.
                            warn!(
                                identity,
                                control = frame::raw_control(&f).unwrap_or("<missing>"),
                                "ignoring frame with unexpected control"
                            );
                        }
                    }
                }
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {}
                Some(Ok(tungstenite::Message::Close(_))) | None => return PeerEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(identity, error = %e, "websocket error");
                    return PeerEnd::Lost;
                }
            },
        }
    }
}

/// Bounded graceful shutdown: wait for the peer's own close, then force
/// (drop the socket) if it does not arrive in time.
async fn graceful_close(ws: &mut WebSocketStream<TcpStream>, timeout: Duration) {
    let wait = async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(tungstenite::Message::Close(_)) | Err(_) => break,
                _ => {
                    // Late frames during the close window are dropped.
                }
            }
        }
    };
    if tokio::time::timeout(timeout, wait).await.is_err() {
        warn!("peer did not close in time; terminating");
    }
}

async fn send_frame<S>(ws: &mut WebSocketStream<S>, f: &Frame) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(tungstenite::Message::text(frame::serialize(f)))
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))
}
