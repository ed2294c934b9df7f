//! Named, tier-spanning publish/subscribe pipes.
//!
//! A pipe has one sink and any number of sources. The sink fans sent
//! events out to every source attached at delivery time; a pipe with
//! no attached source drops events rather than queueing them. Sources
//! come in two shapes: a local source on the tier where the subscriber
//! lives (aggregating one proxy per other tier), and a proxy-source
//! stub on a remote tier whose emitted events travel back over the
//! tier connection.
//!
//! Every endpoint is created on first reference and deleted when its
//! holder releases it; a pipe has no existence once all ends are gone.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelMode, EventOutlet, EventTuple};
use crate::error::CoreError;
use crate::proxy::ProxyManager;
use crate::tier::Tier;

use async_trait::async_trait;
use serde_json::Value;

fn pipe_channel_id(name: &str) -> String {
    format!("pipe-{name}")
}

// ── PipeManager ──────────────────────────────────────────────────────

struct PipeInner {
    own_tier: Tier,
    proxies: Arc<dyn ProxyManager>,
    sinks: DashMap<String, Arc<PipeSink>>,
    sources: DashMap<String, Arc<LocalPipeSource>>,
    proxy_sources: DashMap<(String, Tier), Arc<ProxyPipeSource>>,
}

/// Hands out pipe endpoints by name and keeps them cross-wired.
#[derive(Clone)]
pub struct PipeManager {
    inner: Arc<PipeInner>,
}

impl PipeManager {
    pub fn new(own_tier: Tier, proxies: Arc<dyn ProxyManager>) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                own_tier,
                proxies,
                sinks: DashMap::new(),
                sources: DashMap::new(),
                proxy_sources: DashMap::new(),
            }),
        }
    }

    /// The sink end of a named pipe. At most one per name per process.
    pub fn local_sink(&self, name: &str) -> Arc<PipeSink> {
        Arc::clone(
            self.inner
                .sinks
                .entry(name.to_string())
                .or_insert_with(|| {
                    debug!(pipe = %name, "pipe sink created");
                    Arc::new(PipeSink {
                        name: name.to_string(),
                        registry: Arc::downgrade(&self.inner),
                    })
                })
                .value(),
        )
    }

    /// The local source end: the endpoint on the tier where a
    /// subscriber actually lives. Aggregates one proxy channel per
    /// other tier so remotely-produced events arrive here too.
    pub fn local_source(&self, name: &str) -> Arc<LocalPipeSource> {
        Arc::clone(
            self.inner
                .sources
                .entry(name.to_string())
                .or_insert_with(|| {
                    debug!(pipe = %name, "local pipe source created");
                    Arc::new(LocalPipeSource {
                        name: name.to_string(),
                        outlet: EventOutlet::new(),
                        registry: Arc::downgrade(&self.inner),
                        upstream: Mutex::new(Vec::new()),
                        cancel: CancellationToken::new(),
                    })
                })
                .value(),
        )
    }

    /// The source-shaped stub handed to the proxy layer when `tier`
    /// asks this tier to supply the pipe's source endpoint.
    pub fn proxy_source(&self, name: &str, tier: Tier) -> Arc<ProxyPipeSource> {
        Arc::clone(
            self.inner
                .proxy_sources
                .entry((name.to_string(), tier))
                .or_insert_with(|| {
                    debug!(pipe = %name, tier = %tier, "proxy pipe source created");
                    Arc::new(ProxyPipeSource {
                        name: name.to_string(),
                        tier,
                        outlet: EventOutlet::new(),
                        registry: Arc::downgrade(&self.inner),
                    })
                })
                .value(),
        )
    }
}

// ── PipeSink ─────────────────────────────────────────────────────────

/// The producing end of a named pipe.
pub struct PipeSink {
    name: String,
    registry: Weak<PipeInner>,
}

impl PipeSink {
    /// Fan an event out to every source attached when delivery runs.
    ///
    /// Delivery is deferred to a spawned task so a producer never
    /// re-enters its consumers synchronously. Best-effort and
    /// at-most-once: a source that detaches before the task runs does
    /// not receive the event, and zero attached sources drops it.
    pub fn send(&self, event: EventTuple) {
        let name = self.name.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let Some(inner) = registry.upgrade() else {
                return;
            };
            if let Some(source) = inner.sources.get(&name) {
                source.accept(event.clone());
            }
            for entry in &inner.proxy_sources {
                if entry.key().0 == name {
                    entry.value().accept(event.clone());
                }
            }
        });
    }

    /// Release the sink; the name's sink slot becomes free.
    pub fn release(&self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.sinks.remove(&self.name);
            debug!(pipe = %self.name, "pipe sink released");
        }
    }
}

// ── LocalPipeSource ──────────────────────────────────────────────────

/// The consuming end of a named pipe on the subscriber's own tier.
///
/// Channel-shaped so openers and rules can hold it like any other
/// channel. Opening requests the source endpoint of the same pipe from
/// every other tier through the proxy manager and forwards each
/// proxy's events into this source's own outlet.
pub struct LocalPipeSource {
    name: String,
    outlet: EventOutlet,
    registry: Weak<PipeInner>,
    upstream: Mutex<Vec<Arc<dyn Channel>>>,
    cancel: CancellationToken,
}

impl LocalPipeSource {
    fn accept(&self, event: EventTuple) {
        self.outlet.emit(event);
    }
}

#[async_trait]
impl Channel for LocalPipeSource {
    async fn open(&self) -> Result<(), CoreError> {
        let Some(inner) = self.registry.upgrade() else {
            return Err(CoreError::Internal("pipe manager is gone".into()));
        };
        let mut upstream = self.upstream.lock().await;
        if !upstream.is_empty() {
            return Ok(());
        }

        let params = [Value::String(self.name.clone())];
        for tier in Tier::ALL {
            if tier == inner.own_tier {
                continue;
            }
            let proxy = match inner
                .proxies
                .get_proxy_channel(
                    &pipe_channel_id(&self.name),
                    tier,
                    None,
                    None,
                    "pipe",
                    ChannelMode::Read,
                    &params,
                )
                .await
            {
                Ok(proxy) => proxy,
                Err(e) => {
                    // An unreachable tier must not take the whole pipe
                    // down; its events just will not arrive.
                    warn!(pipe = %self.name, tier = %tier, error = %e, "pipe proxy unavailable");
                    continue;
                }
            };
            if let Err(e) = proxy.open().await {
                warn!(pipe = %self.name, tier = %tier, error = %e, "pipe proxy open failed");
                continue;
            }

            let mut rx = proxy.subscribe();
            let outlet = self.outlet.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Ok(tuple) => outlet.emit(tuple),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "pipe source lagged behind its proxy");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
            upstream.push(proxy);
        }
        debug!(pipe = %self.name, upstream = upstream.len(), "local pipe source opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.cancel.cancel();
        let mut upstream = self.upstream.lock().await;
        for proxy in upstream.drain(..) {
            if let Err(e) = proxy.close().await {
                warn!(pipe = %self.name, error = %e, "pipe proxy close failed");
            }
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.sources.remove(&self.name);
        }
        debug!(pipe = %self.name, "local pipe source closed");
        Ok(())
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventTuple> {
        self.outlet.subscribe()
    }
}

// ── ProxyPipeSource ──────────────────────────────────────────────────

/// Source-shaped stub living on the tier remote from the subscriber.
/// The local sink pushes into it like any source; whatever it emits is
/// read by the proxy layer and carried over the tier connection toward
/// the remote tier's local source.
pub struct ProxyPipeSource {
    name: String,
    tier: Tier,
    outlet: EventOutlet,
    registry: Weak<PipeInner>,
}

impl ProxyPipeSource {
    fn accept(&self, event: EventTuple) {
        self.outlet.emit(event);
    }
}

#[async_trait]
impl Channel for ProxyPipeSource {
    async fn open(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), CoreError> {
        if let Some(inner) = self.registry.upgrade() {
            inner
                .proxy_sources
                .remove(&(self.name.clone(), self.tier));
            debug!(pipe = %self.name, tier = %self.tier, "proxy pipe source released");
        }
        Ok(())
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventTuple> {
        self.outlet.subscribe()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
