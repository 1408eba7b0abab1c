// SPDX-License-Identifier: MIT OR Apache-2.0

//! File-backed configuration for the network layer.
//!
//! One TOML file carries every timing knob plus the ICE/STUN list handed
//! to a WebRTC-backed peer connector. Loading a missing file writes the
//! defaults so users have something to edit.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::HubConfig;
use crate::lobby::LobbyConfig;
use crate::mesh::{HostRole, MeshConfig};
use crate::signaling::SignalingConfig;
use partynet_core::RoomId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Application namespace; rooms only collide within one namespace.
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// ICE/STUN servers for WebRTC-backed connectors.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    /// Mesh: a peer silent longer than this is considered gone.
    #[serde(with = "humantime_serde", default = "default_peer_timeout")]
    pub peer_timeout: Duration,
    /// Mesh: how long discovery waits before solo-host promotion.
    #[serde(with = "humantime_serde", default = "default_discovery_window")]
    pub discovery_window: Duration,
    /// Relay hub: eviction threshold for silent sandboxed contexts.
    #[serde(with = "humantime_serde", default = "default_stale_timeout")]
    pub stale_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    /// Lobby: bound on each negotiation milestone.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Signaling: rooms expire this long after creation.
    #[serde(with = "humantime_serde", default = "default_room_ttl")]
    pub room_ttl: Duration,
}

fn default_app_id() -> String {
    "partynet".to_string()
}

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_peer_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_discovery_window() -> Duration {
    Duration::from_secs(3)
}

fn default_stale_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_room_ttl() -> Duration {
    Duration::from_secs(300)
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            ice_servers: default_ice_servers(),
            heartbeat_interval: default_heartbeat_interval(),
            peer_timeout: default_peer_timeout(),
            discovery_window: default_discovery_window(),
            stale_timeout: default_stale_timeout(),
            sweep_interval: default_sweep_interval(),
            connect_timeout: default_connect_timeout(),
            room_ttl: default_room_ttl(),
        }
    }
}

impl NetworkConfig {
    pub fn mesh(&self, room_id: impl Into<RoomId>) -> MeshConfig {
        MeshConfig {
            app_id: self.app_id.clone(),
            room_id: room_id.into(),
            player_id: None,
            role: HostRole::Auto,
            heartbeat_interval: self.heartbeat_interval,
            peer_timeout: self.peer_timeout,
            discovery_window: self.discovery_window,
        }
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            stale_timeout: self.stale_timeout,
            sweep_interval: self.sweep_interval,
        }
    }

    pub fn lobby(&self) -> LobbyConfig {
        LobbyConfig {
            player_id: None,
            share_code: None,
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn signaling(&self) -> SignalingConfig {
        SignalingConfig {
            room_ttl: self.room_ttl,
            sweep_interval: self.sweep_interval,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_content =
            toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        tracing::info!("Saved config to: {}", path.display());
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("dev", "partynet", "partynet")
        .context("Failed to determine config directory")?;
    Ok(proj_dirs.config_dir().join("config.toml"))
}

/// Load `path`, writing the defaults there first when it does not exist.
pub fn load_or_default(path: &Path) -> Result<NetworkConfig> {
    if !path.exists() {
        tracing::info!("Config file not found, creating default at: {}", path.display());
        let default_config = NetworkConfig::default();
        default_config.save(path)?;
        return Ok(default_config);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str::<NetworkConfig>(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.app_id, "partynet");
        assert!(!config.ice_servers.is_empty());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert!(config.stale_timeout > config.peer_timeout);
    }

    #[test]
    fn test_config_serialization() {
        let config = NetworkConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();

        let deserialized: NetworkConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.app_id, config.app_id);
        assert_eq!(deserialized.discovery_window, config.discovery_window);
        assert_eq!(deserialized.room_ttl, config.room_ttl);
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let config: NetworkConfig = toml::from_str(r#"app_id = "mygame""#).unwrap();
        assert_eq!(config.app_id, "mygame");
        assert_eq!(config.connect_timeout, default_connect_timeout());
    }

    #[test]
    fn test_load_save_config() -> Result<()> {
        let temp_dir = tempdir()?;
        let config_path = temp_dir.path().join("config.toml");

        // First load writes the defaults.
        let config = load_or_default(&config_path)?;
        assert!(config_path.exists());
        assert_eq!(config.app_id, "partynet");

        // A saved change survives the round trip.
        let mut config = config;
        config.app_id = "mygame".to_string();
        config.save(&config_path)?;
        let reloaded = load_or_default(&config_path)?;
        assert_eq!(reloaded.app_id, "mygame");
        Ok(())
    }

    #[test]
    fn test_component_configs_inherit_knobs() {
        let mut config = NetworkConfig::default();
        config.heartbeat_interval = Duration::from_secs(7);
        config.stale_timeout = Duration::from_secs(77);

        let mesh = config.mesh("arena");
        assert_eq!(mesh.room_id, "arena");
        assert_eq!(mesh.heartbeat_interval, Duration::from_secs(7));

        let hub = config.hub();
        assert_eq!(hub.stale_timeout, Duration::from_secs(77));
    }
}
