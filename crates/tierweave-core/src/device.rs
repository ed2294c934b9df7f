//! The devices registry and selector-driven device views.
//!
//! Devices are opaque to the virtualization core beyond their identity,
//! owning tier, attributes, and channel-builder lookup. The registry is
//! the process-wide source of truth; views are live, observable subsets
//! matching a selector, and view membership changes are the sole driver
//! of channel lifecycle in the opener.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{ChannelBuilder, ChannelMode};
use crate::error::CoreError;
use crate::tier::Tier;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Device ───────────────────────────────────────────────────────────

/// A device instance, supplied by the (out-of-scope) authoring layer.
pub trait Device: Send + Sync {
    fn unique_id(&self) -> &str;

    /// Which tier instantiated/owns this device; `Global` devices are
    /// local everywhere.
    fn owner_tier(&self) -> Tier;

    /// Attribute lookup for selector matching.
    fn attribute(&self, key: &str) -> Option<String>;

    /// Resolve the channel builder for a kind in the given mode —
    /// trigger, query, or action capability sets collapsed into one
    /// mode-keyed lookup.
    fn channel_builder(&self, kind: &str, mode: ChannelMode) -> Option<Arc<dyn ChannelBuilder>>;
}

/// Membership change in the registry or a view.
#[derive(Clone)]
pub enum DeviceEvent {
    Added(Arc<dyn Device>),
    Removed(Arc<dyn Device>),
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added(d) => write!(f, "Added({})", d.unique_id()),
            Self::Removed(d) => write!(f, "Removed({})", d.unique_id()),
        }
    }
}

// ── DeviceRegistry ───────────────────────────────────────────────────

/// Process-wide registry of live devices plus named builtin singletons
/// (`timer`, `notify`, `return`, pipe-backed system devices, ...).
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<dyn Device>>,
    builtins: DashMap<String, Arc<dyn Device>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            devices: DashMap::new(),
            builtins: DashMap::new(),
            events,
        }
    }

    /// Insert or replace a device. Replacement emits `Removed` for the
    /// old instance before `Added` for the new one.
    pub fn add(&self, device: Arc<dyn Device>) {
        let id = device.unique_id().to_string();
        if let Some(old) = self.devices.insert(id.clone(), Arc::clone(&device)) {
            let _ = self.events.send(DeviceEvent::Removed(old));
        }
        debug!(device = %id, "device added");
        let _ = self.events.send(DeviceEvent::Added(device));
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn Device>> {
        let removed = self.devices.remove(id).map(|(_, d)| d);
        if let Some(device) = &removed {
            debug!(device = %id, "device removed");
            let _ = self.events.send(DeviceEvent::Removed(Arc::clone(device)));
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Device>> {
        self.devices.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Register a fixed builtin singleton (not part of the dynamic
    /// device population; resolved by `Selector::Builtin`).
    pub fn register_builtin(&self, name: impl Into<String>, device: Arc<dyn Device>) {
        self.builtins.insert(name.into(), device);
    }

    pub fn builtin(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.builtins.get(name).map(|r| Arc::clone(r.value()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Resolve a selector into a view. Builtins become fixed singleton
    /// views; everything else observes the live registry.
    pub fn view(self: &Arc<Self>, selector: Selector) -> Result<DeviceView, CoreError> {
        match selector {
            Selector::Builtin(name) => {
                let device = self
                    .builtin(&name)
                    .ok_or(CoreError::UnknownBuiltin { name })?;
                Ok(DeviceView::fixed(vec![device]))
            }
            other => Ok(DeviceView::dynamic(Arc::clone(self), other)),
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Selector ─────────────────────────────────────────────────────────

/// How an opener picks its devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// One specific device by id.
    Id(String),
    /// Every device whose attribute `key` equals `value`.
    Attribute { key: String, value: String },
    /// A fixed builtin singleton (`timer`, `notify`, ...).
    Builtin(String),
}

impl Selector {
    fn matches(&self, device: &Arc<dyn Device>) -> bool {
        match self {
            Self::Id(id) => device.unique_id() == id,
            Self::Attribute { key, value } => {
                device.attribute(key).as_deref() == Some(value.as_str())
            }
            // Builtins never match registry devices.
            Self::Builtin(_) => false,
        }
    }
}

// ── DeviceView ───────────────────────────────────────────────────────

enum ViewKind {
    Fixed(Vec<Arc<dyn Device>>),
    Dynamic {
        registry: Arc<DeviceRegistry>,
        selector: Selector,
    },
}

/// A live, observable set of devices matching a selector.
pub struct DeviceView {
    kind: ViewKind,
    events: broadcast::Sender<DeviceEvent>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeviceView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ViewKind::Fixed(devices) => f
                .debug_struct("DeviceView")
                .field("fixed", &devices.len())
                .finish_non_exhaustive(),
            ViewKind::Dynamic { selector, .. } => f
                .debug_struct("DeviceView")
                .field("selector", selector)
                .finish_non_exhaustive(),
        }
    }
}

impl DeviceView {
    fn fixed(devices: Vec<Arc<dyn Device>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kind: ViewKind::Fixed(devices),
            events,
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        }
    }

    fn dynamic(registry: Arc<DeviceRegistry>, selector: Selector) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kind: ViewKind::Dynamic { registry, selector },
            events,
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Current members.
    pub fn values(&self) -> Vec<Arc<dyn Device>> {
        match &self.kind {
            ViewKind::Fixed(devices) => devices.clone(),
            ViewKind::Dynamic { registry, selector } => registry
                .snapshot()
                .into_iter()
                .filter(|d| selector.matches(d))
                .collect(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Begin observing. Fixed views have nothing to observe.
    pub fn start(&self) {
        let ViewKind::Dynamic { registry, selector } = &self.kind else {
            return;
        };
        let mut rx = registry.subscribe();
        let selector = selector.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            let device = match &event {
                                DeviceEvent::Added(d) | DeviceEvent::Removed(d) => d,
                            };
                            if selector.matches(device) {
                                let _ = events.send(event);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "device view lagged behind the registry");
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

    /// Stop observing; pending events are discarded.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Ok(mut task) = self.task.lock() {
            task.take();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::MockDevice;

    fn registry() -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new())
    }

    #[tokio::test]
    async fn add_and_remove_emit_events() {
        let reg = registry();
        let mut rx = reg.subscribe();

        let device = MockDevice::new("lamp-1", Tier::Server).into_arc();
        reg.add(Arc::clone(&device));
        assert!(matches!(rx.recv().await.unwrap(), DeviceEvent::Added(d) if d.unique_id() == "lamp-1"));

        reg.remove("lamp-1").unwrap();
        assert!(matches!(rx.recv().await.unwrap(), DeviceEvent::Removed(d) if d.unique_id() == "lamp-1"));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn attribute_view_filters_membership_and_events() {
        let reg = registry();
        reg.add(
            MockDevice::new("lamp-1", Tier::Server)
                .with_attribute("room", "kitchen")
                .into_arc(),
        );
        reg.add(
            MockDevice::new("lamp-2", Tier::Server)
                .with_attribute("room", "bedroom")
                .into_arc(),
        );

        let view = reg
            .view(Selector::Attribute {
                key: "room".into(),
                value: "kitchen".into(),
            })
            .unwrap();
        let members = view.values();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].unique_id(), "lamp-1");

        view.start();
        let mut rx = view.subscribe();

        // A non-matching device must not surface through the view.
        reg.add(
            MockDevice::new("lamp-3", Tier::Server)
                .with_attribute("room", "bedroom")
                .into_arc(),
        );
        reg.add(
            MockDevice::new("lamp-4", Tier::Server)
                .with_attribute("room", "kitchen")
                .into_arc(),
        );

        match rx.recv().await.unwrap() {
            DeviceEvent::Added(d) => assert_eq!(d.unique_id(), "lamp-4"),
            other => panic!("unexpected event: {other:?}"),
        }
        view.stop();
    }

    #[tokio::test]
    async fn builtin_selector_resolves_to_fixed_singleton() {
        let reg = registry();
        reg.register_builtin("timer", MockDevice::new("timer", Tier::Global).into_arc());

        let view = reg.view(Selector::Builtin("timer".into())).unwrap();
        let members = view.values();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].unique_id(), "timer");

        // Registry churn never affects a fixed view.
        reg.add(MockDevice::new("timer-imposter", Tier::Server).into_arc());
        assert_eq!(view.values().len(), 1);
    }

    #[test]
    fn unknown_builtin_is_an_error() {
        let reg = registry();
        let err = reg.view(Selector::Builtin("nope".into())).unwrap_err();
        assert!(matches!(err, CoreError::UnknownBuiltin { .. }));
    }

    #[tokio::test]
    async fn replacing_a_device_emits_removed_then_added() {
        let reg = registry();
        reg.add(MockDevice::new("lamp-1", Tier::Server).into_arc());

        let mut rx = reg.subscribe();
        reg.add(MockDevice::new("lamp-1", Tier::Cloud).into_arc());

        assert!(matches!(rx.recv().await.unwrap(), DeviceEvent::Removed(_)));
        assert!(matches!(rx.recv().await.unwrap(), DeviceEvent::Added(d) if d.owner_tier() == Tier::Cloud));
    }
}
