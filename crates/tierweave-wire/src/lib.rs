//! Inter-tier transport for tierweave: a duplex, authenticated,
//! auto-reconnecting message channel between exactly two tiers,
//! carrying JSON control/data frames over a websocket.
//!
//! - **[`TierClient`]** — the dialing role: single outbound socket with
//!   a hard connect timeout, an outgoing buffer for frames sent while
//!   disconnected, and a bounded retry budget that refills after a
//!   sustained session. Exhaustion surfaces the undelivered buffer to
//!   the caller instead of silently dropping it.
//!
//! - **[`TierServer`]** — the accepting role: a table of authenticated
//!   peers keyed by identity, per-identity offline buffers, one-shot
//!   `set-auth-token` pairing, keepalive pings, and bounded graceful
//!   close with a forced fallback.
//!
//! - **[`frame`]** — the JSON frame model. Unknown control values and
//!   malformed frames are logged and dropped; the connection survives
//!   partial protocol mismatches across versions.
//!
//! Within one connection, frames are delivered in send order once
//! authenticated; frames queued before that are replayed in their
//! original order. There is no cross-connection ordering guarantee.

pub mod client;
pub mod error;
pub mod frame;
pub mod server;

pub use client::{ClientConfig, ClientEvent, TierClient};
pub use error::Error;
pub use frame::{Control, Frame};
pub use server::{ServerConfig, ServerEvent, TierServer};
