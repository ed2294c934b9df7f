//! Channel virtualization core: the layer between device
//! implementations and the rule engine that consumes them.
//!
//! This crate owns channel identity, lifecycle, persistence, and
//! placement for a multi-tier deployment:
//!
//! - **[`ChannelFactory`]** — Process-wide dedup cache and constructor.
//!   [`get_channel()`](channel::factory::ChannelFactory::get_channel)
//!   resolves a `(device, kind, mode, params)` identity to the single
//!   live instance; [`get_opened_channel()`](channel::factory::ChannelFactory::get_opened_channel)
//!   additionally decides local-versus-proxied placement by owning tier.
//!
//! - **[`ChannelHandle`]** — Shared wrapper vended by the factory.
//!   Reference-counts holders so N opens balance to exactly one
//!   device-level open/close, and flushes the optional persisted-state
//!   binder when the last holder releases.
//!
//! - **[`StateBinder`]** ([`channel::state`]) — Debounced persistence
//!   of per-channel key/value state over a pluggable [`KvStore`].
//!
//! - **[`DeviceRegistry`]** / **[`DeviceView`]** — The live device
//!   population, builtin singletons, and selector-filtered observable
//!   subsets driving channel lifecycle.
//!
//! - **[`ChannelOpener`]** — One open channel per device matching a
//!   selector, tracked incrementally as devices come and go.
//!
//! - **[`PipeManager`]** ([`pipes`]) — Named tier-spanning pub/sub:
//!   one sink fans out to local and per-remote-tier proxy sources.
//!
//! Cross-tier transport itself lives in `tierweave-wire`; this crate
//! only consumes it through the [`ProxyManager`] seam.

pub mod channel;
pub mod device;
pub mod error;
pub mod opener;
pub mod pipes;
pub mod platform;
pub mod proxy;
pub mod tier;

#[cfg(test)]
mod testutil;

// ── Primary re-exports ──────────────────────────────────────────────
pub use channel::factory::{ChannelFactory, filter_string};
pub use channel::state::{JsonFileStore, KvStore, MemoryKvStore, StateBinder};
pub use channel::{
    Channel, ChannelBuilder, ChannelHandle, ChannelMode, ChannelState, EventOutlet, EventTuple,
};
pub use device::{Device, DeviceEvent, DeviceRegistry, DeviceView, Selector};
pub use error::CoreError;
pub use opener::{ChannelOpener, OpenerEvent};
pub use pipes::{LocalPipeSource, PipeManager, PipeSink, ProxyPipeSource};
pub use platform::{CHANNEL_STATE, Platform, StaticPlatform};
pub use proxy::ProxyManager;
pub use tier::Tier;
