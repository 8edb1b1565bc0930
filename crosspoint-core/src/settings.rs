//! Persisted application settings: a single JSON file holding the
//! engine configuration, controller connection details and the recent
//! router history.

use std::io;
use std::path::Path;
use std::str::FromStr;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::model::RouterConfig;

/// Router history is LRU-bounded to this many entries.
pub const MAX_ROUTER_HISTORY: usize = 10;

/// Which wire protocol an engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    Videohub,
    Swp08,
    GvNative,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 3] =
        [ProtocolKind::Videohub, ProtocolKind::Swp08, ProtocolKind::GvNative];

    /// Standard TCP port for the protocol.
    pub fn default_port(self) -> u16 {
        match self {
            ProtocolKind::Videohub => crosspoint_protocol::videohub::VIDEOHUB_PORT,
            ProtocolKind::Swp08 => crosspoint_protocol::swp08::SWP08_PORT,
            ProtocolKind::GvNative => crosspoint_protocol::gvnative::GVNATIVE_PORT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Videohub => "videohub",
            ProtocolKind::Swp08 => "swp08",
            ProtocolKind::GvNative => "gvnative",
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "videohub" => Ok(ProtocolKind::Videohub),
            "swp08" | "sw-p-08" | "probel" => Ok(ProtocolKind::Swp08),
            "gvnative" | "gv-native" | "gv" => Ok(ProtocolKind::GvNative),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One remembered controller target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterHistoryEntry {
    pub host: String,
    pub port: u16,
    pub protocol: ProtocolKind,
}

/// The settings blob persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub protocol: ProtocolKind,
    pub inputs: u32,
    pub outputs: u32,
    pub levels: u32,
    pub port: u16,
    pub model_name: String,
    pub friendly_name: String,
    pub auto_start: bool,
    pub controller_host: String,
    pub controller_port: u16,
    pub auto_reconnect: bool,
    pub router_history: Vec<RouterHistoryEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::Videohub,
            inputs: 12,
            outputs: 12,
            levels: 1,
            port: ProtocolKind::Videohub.default_port(),
            model_name: "Crosspoint 12x12".to_string(),
            friendly_name: "Crosspoint Router".to_string(),
            auto_start: false,
            controller_host: "127.0.0.1".to_string(),
            controller_port: ProtocolKind::Videohub.default_port(),
            auto_reconnect: true,
            router_history: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from disk; a missing file yields the defaults.
    pub fn load(path: &Path) -> io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let settings = serde_json::from_str(&contents).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad settings file: {e}"))
                })?;
                info!("Loaded settings from {}", path.display());
                Ok(settings)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("No settings file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        std::fs::write(path, contents)
    }

    /// Record a controller target, most recent first, deduplicated by
    /// `(host, port, protocol)` and bounded to [`MAX_ROUTER_HISTORY`].
    pub fn remember_router(&mut self, host: &str, port: u16, protocol: ProtocolKind) {
        self.router_history
            .retain(|e| !(e.host == host && e.port == port && e.protocol == protocol));
        self.router_history.insert(
            0,
            RouterHistoryEntry {
                host: host.to_string(),
                port,
                protocol,
            },
        );
        self.router_history.truncate(MAX_ROUTER_HISTORY);
    }

    /// Matrix configuration described by these settings.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            inputs: self.inputs,
            outputs: self.outputs,
            levels: self.levels,
            model_name: self.model_name.clone(),
            friendly_name: self.friendly_name.clone(),
            ..RouterConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.inputs = 40;
        settings.remember_router("10.0.0.5", 9990, ProtocolKind::Videohub);
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn test_history_is_lru_by_triple() {
        let mut settings = Settings::default();
        for port in 0..12u16 {
            settings.remember_router("host", 9000 + port, ProtocolKind::Swp08);
        }
        assert_eq!(settings.router_history.len(), MAX_ROUTER_HISTORY);
        assert_eq!(settings.router_history[0].port, 9011);

        // re-adding an existing triple moves it to the front
        settings.remember_router("host", 9005, ProtocolKind::Swp08);
        assert_eq!(settings.router_history.len(), MAX_ROUTER_HISTORY);
        assert_eq!(settings.router_history[0].port, 9005);
        let count = settings
            .router_history
            .iter()
            .filter(|e| e.port == 9005)
            .count();
        assert_eq!(count, 1);

        // same port, different protocol is a distinct entry
        settings.remember_router("host", 9005, ProtocolKind::GvNative);
        assert_eq!(settings.router_history[0].protocol, ProtocolKind::GvNative);
        assert_eq!(settings.router_history[1].port, 9005);
    }

    #[test]
    fn test_protocol_kind_parsing() {
        assert_eq!("videohub".parse::<ProtocolKind>().unwrap(), ProtocolKind::Videohub);
        assert_eq!("SW-P-08".parse::<ProtocolKind>().unwrap(), ProtocolKind::Swp08);
        assert_eq!("gv".parse::<ProtocolKind>().unwrap(), ProtocolKind::GvNative);
        assert!("telnet".parse::<ProtocolKind>().is_err());
    }
}
