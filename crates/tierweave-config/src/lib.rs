//! Shared configuration for tierweave processes.
//!
//! One TOML file describes a whole deployment from each tier's point
//! of view: which tier this process is, where it listens, how to reach
//! its peers, and where persisted channel state lives. Values merge
//! from file then `TIERWEAVE_`-prefixed environment variables. The
//! paired auth token obtained during first-contact bootstrap is
//! written back here so later runs authenticate directly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tierweave_core::Tier;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration for one tier process.
#[derive(Debug, Deserialize, Serialize)]
pub struct TierConfig {
    /// Which tier this process runs as.
    pub tier: Tier,

    /// Listen address for inbound tier connections ("host:port").
    /// Leaf tiers that only dial out may omit it.
    pub listen: Option<String>,

    /// Peers this tier dials, keyed by tier name.
    #[serde(default)]
    pub peers: BTreeMap<Tier, Peer>,

    /// Auth token for tier connections. Absent until the
    /// first-contact pairing writes it back.
    pub auth_token: Option<String>,

    /// Directory for persisted channel state. Defaults under the
    /// platform data dir.
    pub state_dir: Option<PathBuf>,

    /// Override for the channel-state flush debounce, in milliseconds.
    pub debounce_ms: Option<u64>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            tier: Tier::Server,
            listen: None,
            peers: BTreeMap::new(),
            auth_token: None,
            state_dir: None,
            debounce_ms: None,
        }
    }
}

/// How to reach one peer tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Peer {
    /// WebSocket URL of the peer's tier server (ws:// or wss://).
    pub url: String,
}

impl TierConfig {
    /// The auth token wrapped for handling; `None` before pairing.
    pub fn auth_token(&self) -> Option<SecretString> {
        self.auth_token.clone().map(SecretString::from)
    }

    /// The channel-state directory, resolved to its default when the
    /// file does not set one.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("io", "tierweave", "tierweave").map_or_else(
                || PathBuf::from(".tierweave/state"),
                |dirs| dirs.data_dir().join("state"),
            )
        })
    }

    /// The channel-state flush debounce.
    pub fn debounce(&self) -> Option<Duration> {
        self.debounce_ms.map(Duration::from_millis)
    }

    /// Parse and return the URL for one peer.
    pub fn peer_url(&self, tier: Tier) -> Result<url::Url, ConfigError> {
        let peer = self.peers.get(&tier).ok_or_else(|| ConfigError::Validation {
            field: "peers".into(),
            reason: format!("no peer configured for tier '{tier}'"),
        })?;
        parse_peer_url(tier, &peer.url)
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tier == Tier::Global {
            return Err(ConfigError::Validation {
                field: "tier".into(),
                reason: "'global' names device ownership, not a runnable tier".into(),
            });
        }
        for (tier, peer) in &self.peers {
            if *tier == self.tier {
                return Err(ConfigError::Validation {
                    field: "peers".into(),
                    reason: format!("tier '{tier}' cannot peer with itself"),
                });
            }
            if *tier == Tier::Global {
                return Err(ConfigError::Validation {
                    field: "peers".into(),
                    reason: "'global' is not a dialable tier".into(),
                });
            }
            parse_peer_url(*tier, &peer.url)?;
        }
        Ok(())
    }
}

fn parse_peer_url(tier: Tier, raw: &str) -> Result<url::Url, ConfigError> {
    let url: url::Url = raw.parse().map_err(|_| ConfigError::Validation {
        field: format!("peers.{tier}.url"),
        reason: format!("invalid URL: {raw}"),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::Validation {
            field: format!("peers.{tier}.url"),
            reason: format!("expected ws:// or wss://, got '{other}'"),
        }),
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "tierweave", "tierweave").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("tierweave");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load configuration from an explicit file plus the environment.
pub fn load_config_from(path: &std::path::Path) -> Result<TierConfig, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(TierConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TIERWEAVE_"));

    let config: TierConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from the canonical path plus the environment.
pub fn load_config() -> Result<TierConfig, ConfigError> {
    load_config_from(&config_path())
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize and write configuration to an explicit path.
pub fn save_config_to(path: &std::path::Path, cfg: &TierConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

/// Serialize and write configuration to the canonical path.
pub fn save_config(cfg: &TierConfig) -> Result<(), ConfigError> {
    save_config_to(&config_path(), cfg)
}

/// Persist a freshly paired auth token into an existing config file,
/// so the next run authenticates without re-pairing.
pub fn store_auth_token(path: &std::path::Path, token: &str) -> Result<(), ConfigError> {
    let mut cfg = load_config_from(path)?;
    cfg.auth_token = Some(token.to_string());
    save_config_to(path, &cfg)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn full_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
                tier = "server"
                listen = "0.0.0.0:9000"
                auth_token = "sekrit"
                debounce_ms = 250

                [peers.cloud]
                url = "wss://cloud.example.net/tier"
            "#,
        );

        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.tier, Tier::Server);
        assert_eq!(cfg.listen.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(cfg.debounce(), Some(Duration::from_millis(250)));
        assert!(cfg.auth_token().is_some());
        assert_eq!(
            cfg.peer_url(Tier::Cloud).unwrap().as_str(),
            "wss://cloud.example.net/tier"
        );
        assert!(matches!(
            cfg.peer_url(Tier::Phone),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.tier, Tier::Server);
        assert!(cfg.peers.is_empty());
        assert!(cfg.auth_token().is_none());
        assert!(cfg.debounce().is_none());
    }

    #[test]
    fn global_tier_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "tier = \"global\"\n");
        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn self_peering_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
                tier = "phone"

                [peers.phone]
                url = "ws://localhost:9000"
            "#,
        );
        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn non_websocket_peer_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
                tier = "phone"

                [peers.server]
                url = "https://example.net"
            "#,
        );
        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn store_auth_token_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
                tier = "phone"

                [peers.server]
                url = "ws://server.local:9000"
            "#,
        );

        store_auth_token(&path, "fresh-token").unwrap();

        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.auth_token.as_deref(), Some("fresh-token"));
        // The rest of the file survives the rewrite. Url normalizes
        // the empty path to "/".
        assert_eq!(cfg.tier, Tier::Phone);
        assert_eq!(
            cfg.peer_url(Tier::Server).unwrap().as_str(),
            "ws://server.local:9000/"
        );
    }

    #[test]
    fn state_dir_default_is_stable() {
        let cfg = TierConfig::default();
        let dir = cfg.state_dir();
        assert!(dir.ends_with("state"));

        let explicit = TierConfig {
            state_dir: Some(PathBuf::from("/var/lib/tw")),
            ..TierConfig::default()
        };
        assert_eq!(explicit.state_dir(), PathBuf::from("/var/lib/tw"));
    }
}
