//! The channel contract and its shared, reference-counted wrapper.
//!
//! A channel is a single trigger/query/action endpoint bound to one
//! device. Concrete channel implementations (HTTP polling, Bluetooth,
//! pipe-backed system channels, proxies to another tier) all live
//! behind the [`Channel`] trait; the virtualization core never knows
//! which one it is holding.
//!
//! The factory vends [`ChannelHandle`]s: at most one per logical
//! channel identity per process. The handle owns the open/close
//! reference count — N holders balance to exactly one underlying
//! device-level open and one close — and the optional persisted-state
//! binder, flushed when the last holder releases the channel.

pub mod factory;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use strum::{Display, EnumString};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::CoreError;
use state::StateBinder;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One emitted or consumed event: a tuple of JSON values. The rule
/// layer owns any schema beyond that.
pub type EventTuple = Vec<Value>;

// ── ChannelMode ──────────────────────────────────────────────────────

/// What kind of endpoint a channel request names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ChannelMode {
    /// Trigger: produces events (`r` on the wire).
    Read,
    /// Query: produces values on demand (`q`).
    Query,
    /// Action: consumes events (anything else).
    Action,
}

impl ChannelMode {
    /// The single-letter wire form used in proxied channel ids.
    pub fn letter(self) -> char {
        match self {
            Self::Read => 'r',
            Self::Query => 'q',
            Self::Action => 'w',
        }
    }

    pub fn from_letter(c: char) -> Self {
        match c {
            'r' => Self::Read,
            'q' => Self::Query,
            _ => Self::Action,
        }
    }
}

// ── Channel trait ────────────────────────────────────────────────────

/// A trigger/query/action endpoint bound to one device.
///
/// `open`/`close` are the device-level operations; reference counting
/// happens one level up in [`ChannelHandle`], so implementations can
/// assume balanced, non-reentrant calls.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn open(&self) -> Result<(), CoreError>;

    async fn close(&self) -> Result<(), CoreError>;

    /// Subscribe to events this channel emits (trigger/query producer
    /// side). Action channels own a dormant outlet nothing publishes to.
    fn subscribe(&self) -> broadcast::Receiver<EventTuple>;

    /// Push an event into the channel (action consumer side).
    async fn send_event(&self, _tuple: EventTuple) -> Result<(), CoreError> {
        Err(CoreError::Unsupported {
            operation: "send_event on a non-action channel".into(),
        })
    }
}

// ── ChannelBuilder ───────────────────────────────────────────────────

/// The single construction entry point a device exposes per channel
/// kind and mode. The capability list is declared here, once, when the
/// channel is registered — not probed per call.
pub trait ChannelBuilder: Send + Sync {
    /// Platform capabilities this channel needs. `channel-state` marks
    /// the channel as stateful and is satisfied by this layer.
    fn required_capabilities(&self) -> &[String] {
        &[]
    }

    fn create(
        &self,
        device: Arc<dyn Device>,
        params: &[Value],
        state: Option<StateBinder>,
    ) -> Result<Arc<dyn Channel>, CoreError>;
}

// ── EventOutlet ──────────────────────────────────────────────────────

/// Broadcast outlet a concrete channel embeds to emit event tuples.
/// Emitting with no subscribers is a no-op, not an error. Clones share
/// the same underlying broadcast channel.
#[derive(Debug, Clone)]
pub struct EventOutlet {
    tx: broadcast::Sender<EventTuple>,
}

impl EventOutlet {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventTuple> {
        self.tx.subscribe()
    }

    pub fn emit(&self, tuple: EventTuple) {
        // Send errors just mean no active subscribers right now.
        let _ = self.tx.send(tuple);
    }
}

impl Default for EventOutlet {
    fn default() -> Self {
        Self::new()
    }
}

// ── ChannelHandle ────────────────────────────────────────────────────

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    Closing,
}

struct Lifecycle {
    state: ChannelState,
    holders: u32,
}

/// The shared wrapper the factory caches and vends.
///
/// Holders never own the channel: the factory's instance cache does,
/// for the process lifetime. The async mutex serializes lifecycle
/// transitions, so there is no "two first openers" race.
pub struct ChannelHandle {
    unique_id: String,
    inner: Arc<dyn Channel>,
    state_binder: Option<StateBinder>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("unique_id", &self.unique_id)
            .finish_non_exhaustive()
    }
}

impl ChannelHandle {
    pub(crate) fn new(
        unique_id: String,
        inner: Arc<dyn Channel>,
        state_binder: Option<StateBinder>,
    ) -> Self {
        Self {
            unique_id,
            inner,
            state_binder,
            lifecycle: Mutex::new(Lifecycle {
                state: ChannelState::Closed,
                holders: 0,
            }),
        }
    }

    /// The deduplication identity: `deviceId-kind` or
    /// `deviceId-kind-filterString`.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub async fn state(&self) -> ChannelState {
        self.lifecycle.lock().await.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventTuple> {
        self.inner.subscribe()
    }

    pub async fn send_event(&self, tuple: EventTuple) -> Result<(), CoreError> {
        self.inner.send_event(tuple).await
    }

    /// Register a holder. The device-level open runs only for the
    /// first; later holders return once the channel is already open.
    pub async fn open(&self) -> Result<(), CoreError> {
        let mut lc = self.lifecycle.lock().await;
        lc.holders += 1;
        if lc.holders > 1 {
            return Ok(());
        }

        lc.state = ChannelState::Opening;
        if let Some(binder) = &self.state_binder {
            if let Err(e) = binder.load().await {
                lc.holders -= 1;
                lc.state = ChannelState::Closed;
                return Err(e);
            }
        }
        match self.inner.open().await {
            Ok(()) => {
                lc.state = ChannelState::Open;
                debug!(id = %self.unique_id, "channel opened");
                Ok(())
            }
            Err(e) => {
                lc.holders -= 1;
                lc.state = ChannelState::Closed;
                Err(e)
            }
        }
    }

    /// Release a holder. The device-level close runs only when the last
    /// holder releases; persisted state is flushed at that point.
    pub async fn close(&self) -> Result<(), CoreError> {
        let mut lc = self.lifecycle.lock().await;
        if lc.holders == 0 {
            return Ok(());
        }
        lc.holders -= 1;
        if lc.holders > 0 {
            return Ok(());
        }

        lc.state = ChannelState::Closing;
        let result = self.inner.close().await;
        if let Some(binder) = &self.state_binder {
            if let Err(e) = binder.close().await {
                // Best-effort: persistence trouble must not block
                // shutdown of unrelated channels.
                warn!(id = %self.unique_id, error = %e, "state flush on close failed");
            }
        }
        lc.state = ChannelState::Closed;
        debug!(id = %self.unique_id, "channel closed");
        result
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::CountingChannel;

    #[tokio::test]
    async fn n_holders_one_physical_open_and_close() {
        let inner = Arc::new(CountingChannel::new());
        let handle = ChannelHandle::new("dev-kind".into(), inner.clone(), None);

        for _ in 0..3 {
            handle.open().await.unwrap();
        }
        assert_eq!(inner.opens(), 1);
        assert_eq!(handle.state().await, ChannelState::Open);

        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(inner.closes(), 0, "close must wait for the last holder");

        handle.close().await.unwrap();
        assert_eq!(inner.closes(), 1);
        assert_eq!(handle.state().await, ChannelState::Closed);
    }

    #[tokio::test]
    async fn unbalanced_close_is_a_no_op() {
        let inner = Arc::new(CountingChannel::new());
        let handle = ChannelHandle::new("dev-kind".into(), inner.clone(), None);

        handle.close().await.unwrap();
        assert_eq!(inner.closes(), 0);
    }

    #[tokio::test]
    async fn failed_open_leaves_channel_closed() {
        let inner = Arc::new(CountingChannel::failing());
        let handle = ChannelHandle::new("dev-kind".into(), inner, None);

        assert!(handle.open().await.is_err());
        assert_eq!(handle.state().await, ChannelState::Closed);
        // A later close must not underflow the holder count.
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_event_defaults_to_unsupported() {
        let inner = Arc::new(CountingChannel::new());
        let handle = ChannelHandle::new("dev-kind".into(), inner, None);
        let result = handle.send_event(vec![serde_json::json!(1)]).await;
        assert!(matches!(result, Err(CoreError::Unsupported { .. })));
    }

    #[test]
    fn mode_letters() {
        assert_eq!(ChannelMode::Read.letter(), 'r');
        assert_eq!(ChannelMode::from_letter('q'), ChannelMode::Query);
        assert_eq!(ChannelMode::from_letter('x'), ChannelMode::Action);
    }
}
