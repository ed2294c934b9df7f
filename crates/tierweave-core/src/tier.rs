//! Tier identity: the cooperating processes that together run the
//! system. Each device is owned by exactly one tier (or by `Global`,
//! which means "instantiate locally wherever it is used").

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One of the cooperating processes in a deployment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Phone,
    Server,
    Cloud,
    /// Owned everywhere: channels on a global device are always
    /// instantiated locally, never proxied.
    Global,
}

impl Tier {
    /// Whether a device owned by `self` should be instantiated locally
    /// on tier `own`.
    pub fn is_local_to(self, own: Tier) -> bool {
        self == own || self == Tier::Global
    }

    /// The concrete tiers a deployment can span (excludes `Global`).
    pub const ALL: [Tier; 3] = [Tier::Phone, Tier::Server, Tier::Cloud];
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn string_round_trip() {
        for tier in [Tier::Phone, Tier::Server, Tier::Cloud, Tier::Global] {
            assert_eq!(Tier::from_str(&tier.to_string()).unwrap(), tier);
        }
    }

    #[test]
    fn global_is_local_everywhere() {
        for own in Tier::ALL {
            assert!(Tier::Global.is_local_to(own));
        }
        assert!(Tier::Server.is_local_to(Tier::Server));
        assert!(!Tier::Server.is_local_to(Tier::Phone));
    }
}
