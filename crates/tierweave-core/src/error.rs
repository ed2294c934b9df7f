// ── Core error types ──
//
// Domain-facing errors from tierweave-core. Consumers never see raw
// transport failures: the `From<tierweave_wire::Error>` impl translates
// wire-layer errors into domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Channel resolution ───────────────────────────────────────────
    /// The device has no channel of that name for the requested mode.
    #[error("Device {device} has no '{kind}' channel")]
    NoSuchChannel { device: String, kind: String },

    /// A required platform capability is missing locally. The caller is
    /// expected to fall back to a proxied instance on a tier that has
    /// the capability, not to retry in place.
    #[error("Channel '{kind}' on {device} not supported here: requires capability '{capability}'")]
    ChannelNotSupported {
        device: String,
        kind: String,
        capability: String,
    },

    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    #[error("No builtin named '{name}'")]
    UnknownBuiltin { name: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String },

    #[error("Channel open failed: {message}")]
    OpenFailed { message: String },

    // ── Proxying ─────────────────────────────────────────────────────
    /// The proxy manager could not supply a remote stand-in.
    #[error("Proxy to tier '{target}' unavailable: {reason}")]
    ProxyUnavailable { target: String, reason: String },

    // ── Persistence ──────────────────────────────────────────────────
    /// Loading persisted channel state failed.
    #[error("State load failed for {id}: {reason}")]
    StateLoad { id: String, reason: String },

    /// Flushing persisted channel state failed. Callers of `close()`
    /// treat this as best-effort: logged, never blocking shutdown of
    /// unrelated channels.
    #[error("State flush failed for {id}: {reason}")]
    StateFlush { id: String, reason: String },

    // ── Transport (wrapped, not exposed raw) ─────────────────────────
    #[error("Tier connection failed: {message}")]
    ConnectionFailed { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<tierweave_wire::Error> for CoreError {
    fn from(err: tierweave_wire::Error) -> Self {
        match err {
            tierweave_wire::Error::AuthRejected { identity } => CoreError::ConnectionFailed {
                message: format!("authentication rejected for peer {identity}"),
            },
            tierweave_wire::Error::RetriesExhausted { undelivered } => {
                CoreError::ConnectionFailed {
                    message: format!(
                        "reconnection budget exhausted ({undelivered} undelivered frames)"
                    ),
                }
            }
            other => CoreError::ConnectionFailed {
                message: other.to_string(),
            },
        }
    }
}
