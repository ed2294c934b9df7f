use thiserror::Error;

/// Top-level error type for the `tierweave-wire` crate.
///
/// Covers both connection roles: dialing (connect, retry exhaustion)
/// and accepting (bind, per-peer sends). `tierweave-core` maps these
/// into domain-level diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Client role ─────────────────────────────────────────────────
    /// Websocket connect attempt failed (refused, DNS, TLS, ...).
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Connect attempt exceeded the hard timeout.
    #[error("Connection timed out after {timeout_secs}s")]
    ConnectTimeout { timeout_secs: u64 },

    /// The retry budget is exhausted; `undelivered` frames were still
    /// buffered when the client gave up. The frames themselves travel
    /// on the `ClientEvent::Failed` event.
    #[error("Reconnection budget exhausted with {undelivered} undelivered frame(s)")]
    RetriesExhausted { undelivered: usize },

    /// Invalid connection URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Server role ─────────────────────────────────────────────────
    /// Could not bind the listening socket.
    #[error("Bind failed: {0}")]
    Bind(#[from] std::io::Error),

    /// Peer failed authentication; the socket was terminated without
    /// a close handshake.
    #[error("Authentication failed for peer {identity}")]
    AuthRejected { identity: String },

    // ── Either role ─────────────────────────────────────────────────
    /// The connection is closed (or was never opened).
    #[error("Connection closed")]
    Closed,

    /// Websocket protocol error on an established connection.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl Error {
    /// `true` if the failure is a transient network condition that the
    /// reconnect machinery handles on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::ConnectTimeout { .. } | Self::WebSocket(_)
        )
    }
}
