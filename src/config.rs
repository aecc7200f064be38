use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tilesync_core::PeerId;
use tilesync_net::{NetConfig, QuicConfig};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "tilesync.toml";

/// Contents of `tilesync.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub net: NetConfig,
    pub quic: QuicConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable id of this process. Zero picks a random id at startup.
    pub peer_id: u64,
    pub display_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id: 0,
            display_name: "player".into(),
        }
    }
}

impl IdentityConfig {
    /// Configured id, or a fresh random one when unset.
    pub fn resolve_peer(&self) -> PeerId {
        if self.peer_id != 0 {
            return PeerId(self.peer_id);
        }
        loop {
            let candidate = PeerId(rand::random());
            if !candidate.is_none() {
                return candidate;
            }
        }
    }
}

impl AppConfig {
    /// Load from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    AppConfig::default()
                }
            },
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    warn!("Config not found at {}. Using defaults", path.display());
                } else {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                AppConfig::default()
            }
        }
    }
}
