use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::peer::TransportKind;
use crate::transport::{BeaconConfig, DirectSettings, LinkSettings, ServiceSettings, SERVICE_TYPE};
use crate::wire::WireFormatKind;

/// Runtime settings. Every field has a default, so a config file only
/// needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name advertised to other peers. Falls back to the host name.
    pub display_name: Option<String>,
    pub bind_addr: IpAddr,
    pub broadcast_addr: IpAddr,
    pub broadcast_port: u16,
    pub direct_port: u16,
    pub direct_discovery_port: u16,
    pub service_port: u16,
    pub service_type: String,
    pub discovery_interval_ms: u64,
    pub discovery_jitter: f64,
    pub read_timeout_ms: u64,
    pub max_missed_keepalives: u32,
    pub connect_timeout_ms: u64,
    pub peer_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub format: WireFormatKind,
    /// Transports started by default, in routing priority order.
    pub transports: Vec<TransportKind>,
    pub log_filter: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: None,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_port: 5555,
            direct_port: 5556,
            direct_discovery_port: 5557,
            service_port: 5558,
            service_type: SERVICE_TYPE.to_string(),
            discovery_interval_ms: 5_000,
            discovery_jitter: 0.2,
            read_timeout_ms: 10_000,
            max_missed_keepalives: 3,
            connect_timeout_ms: 5_000,
            peer_timeout_ms: 300_000,
            sweep_interval_ms: 30_000,
            format: WireFormatKind::Json,
            transports: vec![
                TransportKind::Direct,
                TransportKind::Broadcast,
                TransportKind::Service,
            ],
            log_filter: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("discovery_interval_ms", self.discovery_interval_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("peer_timeout_ms", self.peer_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        if !(0.0..=1.0).contains(&self.discovery_jitter) {
            return Err(ConfigError::Invalid(format!(
                "discovery_jitter must be between 0 and 1, got {}",
                self.discovery_jitter
            )));
        }

        let mut seen = BTreeSet::new();
        let ports = [
            ("broadcast_port", self.broadcast_port),
            ("direct_port", self.direct_port),
            ("direct_discovery_port", self.direct_discovery_port),
            ("service_port", self.service_port),
        ];
        for (name, port) in ports {
            // Port 0 asks the OS for any free port, so it may repeat.
            if port != 0 && !seen.insert(port) {
                return Err(ConfigError::Invalid(format!("{} {} is already in use", name, port)));
            }
        }

        if self.transports.is_empty() {
            return Err(ConfigError::Invalid("no transports enabled".into()));
        }
        Ok(())
    }

    /// Routing priority: enabled transports first, then the rest.
    pub fn priority(&self) -> Vec<TransportKind> {
        let mut order: Vec<TransportKind> = Vec::new();
        for kind in self.transports.iter().chain(TransportKind::ALL.iter()) {
            if !order.contains(kind) {
                order.push(*kind);
            }
        }
        order
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    fn beacon(&self, port: u16) -> BeaconConfig {
        BeaconConfig {
            bind: SocketAddr::new(self.bind_addr, port),
            target: SocketAddr::new(self.broadcast_addr, port),
            interval: self.discovery_interval(),
            jitter: self.discovery_jitter,
        }
    }

    pub fn broadcast_settings(&self) -> BeaconConfig {
        self.beacon(self.broadcast_port)
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            max_missed_keepalives: self.max_missed_keepalives,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn direct_settings(&self) -> DirectSettings {
        DirectSettings {
            listen: SocketAddr::new(self.bind_addr, self.direct_port),
            beacon: self.beacon(self.direct_discovery_port),
            link: self.link_settings(),
        }
    }

    pub fn service_settings(&self, display_name: &str) -> ServiceSettings {
        ServiceSettings {
            listen: SocketAddr::new(self.bind_addr, self.service_port),
            service_type: self.service_type.clone(),
            display_name: display_name.to_string(),
            link: self.link_settings(),
        }
    }
}
