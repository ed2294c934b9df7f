//! Channel identity, deduplication, persistence wiring, and placement.
//!
//! `get_channel` resolves `(device, kind, mode, params)` to the single
//! canonical [`ChannelHandle`] for that logical identity in this
//! process. `get_opened_channel` additionally decides placement: local
//! instantiation when this tier owns the device (or the device is
//! global), a proxy channel from the proxy manager otherwise.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::state::{DEFAULT_DEBOUNCE, KvStore, StateBinder};
use crate::channel::{ChannelHandle, ChannelMode};
use crate::device::{Device, DeviceEvent, DeviceRegistry};
use crate::error::CoreError;
use crate::platform::{self, Platform};
use crate::proxy::ProxyManager;
use crate::tier::Tier;

// ── Channel identity ─────────────────────────────────────────────────

/// Serialize a constant-filter parameter set into the id suffix that
/// keeps differently-filtered subscriptions distinct. Applied to
/// read-mode channels only; an empty parameter set has no suffix.
pub fn filter_string(params: &[Value]) -> Option<String> {
    if params.is_empty() {
        return None;
    }
    let tokens: Vec<String> = params
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    Some(tokens.join("-"))
}

fn channel_id(device_id: &str, kind: &str, filter: Option<&str>) -> String {
    match filter {
        Some(f) => format!("{device_id}-{kind}-{f}"),
        None => format!("{device_id}-{kind}"),
    }
}

// ── ChannelFactory ───────────────────────────────────────────────────

/// Process-wide channel cache and constructor.
pub struct ChannelFactory {
    own_tier: Tier,
    platform: Arc<dyn Platform>,
    store: Arc<dyn KvStore>,
    proxies: Arc<dyn ProxyManager>,
    /// uniqueId → the one live instance for that identity.
    cache: DashMap<String, Arc<ChannelHandle>>,
    debounce: Duration,
}

impl ChannelFactory {
    pub fn new(
        own_tier: Tier,
        platform: Arc<dyn Platform>,
        store: Arc<dyn KvStore>,
        proxies: Arc<dyn ProxyManager>,
    ) -> Self {
        Self {
            own_tier,
            platform,
            store,
            proxies,
            cache: DashMap::new(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Override the state-flush debounce window (tests, mostly).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn own_tier(&self) -> Tier {
        self.own_tier
    }

    /// Resolve the canonical channel instance for a logical identity,
    /// constructing it if the cache has none.
    ///
    /// With `for_open`, every declared capability must be available on
    /// this platform (`channel-state` is always satisfied — it is
    /// provided by this layer). A missing capability fails with
    /// [`CoreError::ChannelNotSupported`], telling the caller to
    /// request a proxied instance from a tier that has it.
    pub fn get_channel(
        &self,
        device: &Arc<dyn Device>,
        kind: &str,
        mode: ChannelMode,
        params: &[Value],
        for_open: bool,
    ) -> Result<Arc<ChannelHandle>, CoreError> {
        let builder =
            device
                .channel_builder(kind, mode)
                .ok_or_else(|| CoreError::NoSuchChannel {
                    device: device.unique_id().into(),
                    kind: kind.into(),
                })?;

        if for_open {
            for capability in builder.required_capabilities() {
                if capability != platform::CHANNEL_STATE
                    && !self.platform.has_capability(capability)
                {
                    return Err(CoreError::ChannelNotSupported {
                        device: device.unique_id().into(),
                        kind: kind.into(),
                        capability: capability.clone(),
                    });
                }
            }
        }

        let filter = match mode {
            ChannelMode::Read => filter_string(params),
            ChannelMode::Query | ChannelMode::Action => None,
        };
        let id = channel_id(device.unique_id(), kind, filter.as_deref());

        if let Some(existing) = self.cache.get(&id) {
            return Ok(Arc::clone(existing.value()));
        }

        let stateful = builder
            .required_capabilities()
            .iter()
            .any(|c| c == platform::CHANNEL_STATE);
        let binder = stateful.then(|| {
            StateBinder::new(id.clone(), Arc::clone(&self.store), self.debounce)
        });

        let channel = builder.create(Arc::clone(device), params, binder.clone())?;
        let handle = Arc::new(ChannelHandle::new(id.clone(), channel, binder.clone()));

        match self.cache.entry(id) {
            Entry::Occupied(entry) => {
                // Lost the construction race: keep the cached instance,
                // quietly close the orphan's state binder.
                if let Some(orphan) = binder {
                    tokio::spawn(async move {
                        if let Err(e) = orphan.close().await {
                            debug!(id = %orphan.id(), error = %e, "orphan binder close failed");
                        }
                    });
                }
                Ok(Arc::clone(entry.get()))
            }
            Entry::Vacant(entry) => {
                debug!(id = %handle.unique_id(), "channel instance created");
                entry.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    /// Resolve and open, with placement: local when this tier owns the
    /// device (or it is global), proxied to the owning tier otherwise.
    pub async fn get_opened_channel(
        &self,
        device: &Arc<dyn Device>,
        kind: &str,
        mode: ChannelMode,
        params: &[Value],
    ) -> Result<Arc<ChannelHandle>, CoreError> {
        if device.owner_tier().is_local_to(self.own_tier) {
            let handle = self.get_channel(device, kind, mode, params, true)?;
            handle.open().await?;
            return Ok(handle);
        }

        // Read-mode ids encode the serialized constant filter, so
        // differently-filtered subscriptions stay distinct proxies —
        // the same dedup semantics as local channels.
        let filter = match mode {
            ChannelMode::Read => filter_string(params),
            ChannelMode::Query | ChannelMode::Action => None,
        };
        let id = channel_id(device.unique_id(), kind, filter.as_deref());
        let target = device.owner_tier();

        if let Some(existing) = self.cache.get(&id) {
            let handle = Arc::clone(existing.value());
            drop(existing);
            handle.open().await?;
            return Ok(handle);
        }

        debug!(id = %id, target = %target, "requesting proxy channel");
        let proxy = self
            .proxies
            .get_proxy_channel(&id, target, Some(Arc::clone(device)), None, kind, mode, params)
            .await?;
        let handle = Arc::new(ChannelHandle::new(id.clone(), proxy, None));

        let handle = match self.cache.entry(id) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&handle));
                handle
            }
        };
        handle.open().await?;
        Ok(handle)
    }

    /// Purge every cached channel belonging to a removed device.
    /// Closing the purged channels is the opener's responsibility.
    pub fn evict_device(&self, device_id: &str) {
        let prefix = format!("{device_id}-");
        let before = self.cache.len();
        self.cache.retain(|id, _| !id.starts_with(&prefix));
        let purged = before - self.cache.len();
        if purged > 0 {
            debug!(device = %device_id, purged, "evicted channels for removed device");
        }
    }

    /// Follow the registry and evict cached channels as devices go.
    pub fn watch_registry(self: &Arc<Self>, registry: &DeviceRegistry) -> JoinHandle<()> {
        let mut rx = registry.subscribe();
        let factory = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(DeviceEvent::Removed(device)) => {
                        factory.evict_device(device.unique_id());
                    }
                    Ok(DeviceEvent::Added(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "factory lagged behind the device registry");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn cached_ids(&self) -> Vec<String> {
        self.cache.iter().map(|e| e.key().clone()).collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
