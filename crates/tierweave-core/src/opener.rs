//! Selector-driven channel lifecycle.
//!
//! An opener binds a selector, channel kind, mode, and parameter set
//! to the live device population: one open channel per matching
//! device, channels opened as devices arrive and closed as they leave.
//! The opener's observable channel set is what the rule layer actually
//! consumes; it never touches the factory directly.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::factory::ChannelFactory;
use crate::channel::{ChannelHandle, ChannelMode};
use crate::device::{Device, DeviceEvent, DeviceRegistry, DeviceView, Selector};
use crate::error::CoreError;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Membership change in an opener's channel set.
#[derive(Clone)]
pub enum OpenerEvent {
    Added(Arc<ChannelHandle>),
    Removed(Arc<ChannelHandle>),
}

impl std::fmt::Debug for OpenerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added(c) => write!(f, "Added({})", c.unique_id()),
            Self::Removed(c) => write!(f, "Removed({})", c.unique_id()),
        }
    }
}

struct OpenerInner {
    factory: Arc<ChannelFactory>,
    view: DeviceView,
    kind: String,
    mode: ChannelMode,
    params: Vec<Value>,
    /// channel uniqueId → the handle this opener holds open.
    channels: DashMap<String, Arc<ChannelHandle>>,
    events: broadcast::Sender<OpenerEvent>,
    cancel: CancellationToken,
}

/// One open channel per device matching a selector, kept current as
/// the device population changes.
pub struct ChannelOpener {
    inner: Arc<OpenerInner>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChannelOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOpener")
            .field("kind", &self.inner.kind)
            .field("mode", &self.inner.mode)
            .field("channels", &self.inner.channels.len())
            .finish_non_exhaustive()
    }
}

impl ChannelOpener {
    pub fn new(
        factory: Arc<ChannelFactory>,
        registry: &Arc<DeviceRegistry>,
        selector: Selector,
        kind: impl Into<String>,
        mode: ChannelMode,
        params: Vec<Value>,
    ) -> Result<Self, CoreError> {
        let view = registry.view(selector)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(OpenerInner {
                factory,
                view,
                kind: kind.into(),
                mode,
                params,
                channels: DashMap::new(),
                events,
                cancel: CancellationToken::new(),
            }),
            task: std::sync::Mutex::new(None),
        })
    }

    /// Open a channel for every current member, then follow membership
    /// changes. Per-device failures are logged and tolerated; one
    /// misbehaving device never blocks the rest of the set.
    pub async fn start(&self) {
        // Subscribe before the initial sweep so arrivals racing the
        // sweep are not lost; duplicates are rebalanced in open_for.
        self.inner.view.start();
        let mut rx = self.inner.view.subscribe();

        for device in self.inner.view.values() {
            self.inner.open_for(&device).await;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = inner.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(DeviceEvent::Added(device)) => inner.open_for(&device).await,
                        Ok(DeviceEvent::Removed(device)) => {
                            inner.remove_device(device.unique_id()).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "opener lagged behind its device view");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// The currently open channels.
    pub fn values(&self) -> Vec<Arc<ChannelHandle>> {
        self.inner
            .channels
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OpenerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop following the view and release every held channel.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.view.stop();
        if let Ok(mut task) = self.task.lock() {
            task.take();
        }

        let held: Vec<_> = self
            .inner
            .channels
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for id in held {
            if let Some((_, channel)) = self.inner.channels.remove(&id) {
                if let Err(e) = channel.close().await {
                    warn!(id = %id, error = %e, "channel close on opener stop failed");
                }
                let _ = self.inner.events.send(OpenerEvent::Removed(channel));
            }
        }
    }
}

impl OpenerInner {
    async fn open_for(&self, device: &Arc<dyn Device>) {
        let handle = match self
            .factory
            .get_opened_channel(device, &self.kind, self.mode, &self.params)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    device = %device.unique_id(),
                    kind = %self.kind,
                    error = %e,
                    "channel open failed",
                );
                return;
            }
        };

        match self.channels.entry(handle.unique_id().to_string()) {
            Entry::Occupied(_) => {
                // Already holding this channel (device replaced, or an
                // arrival raced the initial sweep). Balance the extra
                // open we just took.
                if let Err(e) = handle.close().await {
                    warn!(id = %handle.unique_id(), error = %e, "rebalancing close failed");
                }
            }
            Entry::Vacant(entry) => {
                debug!(id = %handle.unique_id(), "opener tracking channel");
                entry.insert(Arc::clone(&handle));
                let _ = self.events.send(OpenerEvent::Added(handle));
            }
        }
    }

    async fn remove_device(&self, device_id: &str) {
        let prefix = format!("{device_id}-");
        let departing: Vec<_> = self
            .channels
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();

        for id in departing {
            if let Some((_, channel)) = self.channels.remove(&id) {
                if let Err(e) = channel.close().await {
                    warn!(id = %id, error = %e, "channel close on device removal failed");
                }
                debug!(id = %id, "opener released channel for removed device");
                let _ = self.events.send(OpenerEvent::Removed(channel));
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
