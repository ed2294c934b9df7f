//! Platform capability probe.
//!
//! Channel builders declare the capabilities they need (`bluetooth`,
//! `gps`, ...); the factory checks them against the running platform
//! before instantiating locally. `channel-state` is special: it is
//! provided by this layer, not the platform, and is always satisfied.

use std::collections::HashSet;

/// Capability name satisfied by the channel-state persistence layer
/// rather than the platform.
pub const CHANNEL_STATE: &str = "channel-state";

/// Probe for what the current platform can do.
pub trait Platform: Send + Sync {
    fn has_capability(&self, name: &str) -> bool;
}

/// A fixed capability set, typically loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticPlatform {
    capabilities: HashSet<String>,
}

impl StaticPlatform {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

impl Platform for StaticPlatform {
    fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_platform_reports_configured_capabilities() {
        let platform = StaticPlatform::new(["bluetooth", "gps"]);
        assert!(platform.has_capability("bluetooth"));
        assert!(!platform.has_capability("zigbee"));
    }
}
