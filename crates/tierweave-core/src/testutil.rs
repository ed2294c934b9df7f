//! Shared test doubles: counting channels/builders, mock devices, and
//! a recording proxy manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::channel::state::StateBinder;
use crate::channel::{Channel, ChannelBuilder, ChannelMode, EventOutlet, EventTuple};
use crate::device::Device;
use crate::error::CoreError;
use crate::proxy::ProxyManager;
use crate::tier::Tier;

// ── CountingChannel ──────────────────────────────────────────────────

/// Channel that counts its device-level opens and closes.
pub struct CountingChannel {
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_open: bool,
    outlet: EventOutlet,
}

impl CountingChannel {
    pub fn new() -> Self {
        Self {
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_open: false,
            outlet: EventOutlet::new(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::new()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn emit(&self, tuple: EventTuple) {
        self.outlet.emit(tuple);
    }
}

#[async_trait]
impl Channel for CountingChannel {
    async fn open(&self) -> Result<(), CoreError> {
        if self.fail_open {
            return Err(CoreError::OpenFailed {
                message: "configured to fail".into(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EventTuple> {
        self.outlet.subscribe()
    }
}

// ── CountingBuilder ──────────────────────────────────────────────────

struct BuilderShared {
    capabilities: Vec<String>,
    fail_open: bool,
    created: AtomicUsize,
    last_binder: std::sync::Mutex<Option<StateBinder>>,
    channels: std::sync::Mutex<Vec<Arc<CountingChannel>>>,
}

/// Builder producing [`CountingChannel`]s, with shared counters so a
/// clone handed to a device can still be inspected by the test.
#[derive(Clone)]
pub struct CountingBuilder {
    shared: Arc<BuilderShared>,
}

impl CountingBuilder {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BuilderShared {
                capabilities: Vec::new(),
                fail_open: false,
                created: AtomicUsize::new(0),
                last_binder: std::sync::Mutex::new(None),
                channels: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn requiring<I, S>(self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shared: Arc::new(BuilderShared {
                capabilities: capabilities.into_iter().map(Into::into).collect(),
                fail_open: self.shared.fail_open,
                created: AtomicUsize::new(0),
                last_binder: std::sync::Mutex::new(None),
                channels: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn failing_open(self) -> Self {
        Self {
            shared: Arc::new(BuilderShared {
                capabilities: self.shared.capabilities.clone(),
                fail_open: true,
                created: AtomicUsize::new(0),
                last_binder: std::sync::Mutex::new(None),
                channels: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn last_state_binder(&self) -> Option<StateBinder> {
        self.shared.last_binder.lock().ok()?.clone()
    }

    pub fn opened_channels(&self) -> usize {
        self.for_each_channel(CountingChannel::opens)
    }

    pub fn closed_channels(&self) -> usize {
        self.for_each_channel(CountingChannel::closes)
    }

    fn for_each_channel(&self, count: fn(&CountingChannel) -> usize) -> usize {
        self.shared
            .channels
            .lock()
            .map(|channels| channels.iter().map(|c| count(c)).sum())
            .unwrap_or(0)
    }
}

impl ChannelBuilder for CountingBuilder {
    fn required_capabilities(&self) -> &[String] {
        &self.shared.capabilities
    }

    fn create(
        &self,
        _device: Arc<dyn Device>,
        _params: &[Value],
        state: Option<StateBinder>,
    ) -> Result<Arc<dyn Channel>, CoreError> {
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.shared.last_binder.lock() {
            *last = state;
        }
        let channel = if self.shared.fail_open {
            Arc::new(CountingChannel::failing())
        } else {
            Arc::new(CountingChannel::new())
        };
        if let Ok(mut channels) = self.shared.channels.lock() {
            channels.push(Arc::clone(&channel));
        }
        Ok(channel)
    }
}

// ── MockDevice ───────────────────────────────────────────────────────

/// Minimal device with fixed attributes and per-kind builders.
pub struct MockDevice {
    id: String,
    tier: Tier,
    attributes: HashMap<String, String>,
    builders: HashMap<String, Arc<dyn ChannelBuilder>>,
}

impl MockDevice {
    pub fn new(id: impl Into<String>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            tier,
            attributes: HashMap::new(),
            builders: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_builder(mut self, kind: impl Into<String>, builder: CountingBuilder) -> Self {
        self.builders.insert(kind.into(), Arc::new(builder));
        self
    }

    pub fn into_arc(self) -> Arc<dyn Device> {
        Arc::new(self)
    }
}

impl Device for MockDevice {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn owner_tier(&self) -> Tier {
        self.tier
    }

    fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.get(key).cloned()
    }

    fn channel_builder(&self, kind: &str, _mode: ChannelMode) -> Option<Arc<dyn ChannelBuilder>> {
        self.builders.get(kind).map(Arc::clone)
    }
}

// ── RecordingProxyManager ────────────────────────────────────────────

/// One recorded `get_proxy_channel` request.
#[derive(Debug, Clone)]
pub struct ProxyCall {
    pub channel_id: String,
    pub target_tier: Tier,
    pub kind: String,
    pub mode: ChannelMode,
    pub params: Vec<Value>,
}

/// Proxy manager that records every request and vends counting
/// channels in place of real cross-tier proxies.
pub struct RecordingProxyManager {
    calls: std::sync::Mutex<Vec<ProxyCall>>,
    proxies: std::sync::Mutex<Vec<Arc<CountingChannel>>>,
}

impl RecordingProxyManager {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            proxies: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ProxyCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Emit an event as if it arrived over the most recently created
    /// proxy channel.
    pub fn emit_on_last_proxy(&self, tuple: EventTuple) {
        if let Ok(proxies) = self.proxies.lock() {
            if let Some(proxy) = proxies.last() {
                proxy.emit(tuple);
            }
        }
    }
}

#[async_trait]
impl ProxyManager for RecordingProxyManager {
    async fn get_proxy_channel(
        &self,
        channel_id: &str,
        target_tier: Tier,
        _device: Option<Arc<dyn Device>>,
        _local: Option<Arc<dyn Channel>>,
        kind: &str,
        mode: ChannelMode,
        params: &[Value],
    ) -> Result<Arc<dyn Channel>, CoreError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ProxyCall {
                channel_id: channel_id.to_string(),
                target_tier,
                kind: kind.to_string(),
                mode,
                params: params.to_vec(),
            });
        }
        let proxy = Arc::new(CountingChannel::new());
        if let Ok(mut proxies) = self.proxies.lock() {
            proxies.push(Arc::clone(&proxy));
        }
        Ok(proxy)
    }
}
