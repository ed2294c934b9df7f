//! Seam to the proxy manager collaborator.
//!
//! The proxy manager lives outside this crate, built atop the tier
//! connections in `tierweave-wire`. Given a channel id and a target
//! tier it yields a channel-shaped stand-in that forwards opens,
//! closes, and events across the established connection. The factory
//! calls it for devices owned elsewhere; the pipe manager calls it to
//! reach remote pipe source endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::channel::{Channel, ChannelMode};
use crate::device::Device;
use crate::error::CoreError;
use crate::tier::Tier;

/// Supplies proxy channels addressed to another tier.
#[async_trait]
pub trait ProxyManager: Send + Sync {
    /// Obtain a local stand-in for `channel_id` on `target_tier`.
    ///
    /// `device` is the owning device when the request is device-bound
    /// (`None` for pipe endpoints). `local` is the local counterpart
    /// channel when this tier supplies one end of the pair.
    async fn get_proxy_channel(
        &self,
        channel_id: &str,
        target_tier: Tier,
        device: Option<Arc<dyn Device>>,
        local: Option<Arc<dyn Channel>>,
        kind: &str,
        mode: ChannelMode,
        params: &[Value],
    ) -> Result<Arc<dyn Channel>, CoreError>;
}
