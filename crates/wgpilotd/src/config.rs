//! Engine configuration.
//!
//! Configuration for the wgpilot daemon, including:
//! - The managed WireGuard interface and its subnet
//! - Client config rendering policy
//! - Public endpoint discovery
//! - Telemetry sampling and traffic alerts

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use url::Url;
use wgpilot_alerts::{TrafficThresholds, WebhookConfig};
use wgpilot_wireguard::{AddressAllocator, AllowedIp, CommandInterfaceConfig};

use crate::error::{EngineError, Result};
use crate::render::ClientPolicy;

/// Linux limit on interface name length.
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// The managed WireGuard interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterfaceSection {
    /// Interface name, e.g. `wg0`.
    pub name: String,
    /// VPN subnet peers are allocated from.
    pub subnet: Ipv4Net,
    /// Address of the server inside the subnet.
    pub server_address: Ipv4Addr,
    /// UDP listen port.
    pub listen_port: u16,
    /// Canonical server config path.
    pub config_path: PathBuf,
    /// File holding the server private key (base64).
    pub private_key_path: PathBuf,
    /// Bound on every external command.
    pub command_timeout_secs: u64,
    /// A peer is online if its last handshake is at most this old.
    pub handshake_window_secs: u64,
}

impl Default for InterfaceSection {
    fn default() -> Self {
        Self {
            name: "wg0".to_string(),
            subnet: Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 24)
                .unwrap_or_else(|_| Ipv4Net::from(Ipv4Addr::new(10, 0, 0, 0))),
            server_address: Ipv4Addr::new(10, 0, 0, 1),
            listen_port: 51820,
            config_path: PathBuf::from("/etc/wireguard/wg0.conf"),
            private_key_path: PathBuf::from("/etc/wgpilot/server.key"),
            command_timeout_secs: 10,
            handshake_window_secs: 180,
        }
    }
}

/// How client configs are rendered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientSection {
    /// DNS servers pushed to clients. Empty omits the `DNS` line.
    pub dns: Vec<IpAddr>,
    /// Routes clients send through the tunnel.
    pub allowed_ips: String,
    /// Keepalive interval in seconds.
    pub persistent_keepalive: u16,
    /// Directory holding one `peer_<id>.conf` artifact per peer.
    pub config_dir: PathBuf,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            dns: Vec::new(),
            allowed_ips: "0.0.0.0/0, ::/0".to_string(),
            persistent_keepalive: 25,
            config_dir: PathBuf::from("/var/lib/wgpilot/configs"),
        }
    }
}

/// Public endpoint discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointSection {
    /// Fixed public host. Skips the lookup when set.
    pub public_host: Option<String>,
    /// Service returning the caller's public address as plain text.
    pub lookup_url: String,
    /// Bound on the lookup request.
    pub lookup_timeout_secs: u64,
    /// How long a looked up address is reused.
    pub cache_ttl_secs: u64,
}

impl Default for EndpointSection {
    fn default() -> Self {
        Self {
            public_host: None,
            lookup_url: "https://api.ipify.org".to_string(),
            lookup_timeout_secs: 5,
            cache_ttl_secs: 3600,
        }
    }
}

/// Periodic sampling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetrySection {
    /// Seconds between samples.
    pub poll_interval_secs: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
        }
    }
}

/// Traffic alerts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertSection {
    /// Hourly download threshold in GB.
    pub download_threshold_gb: f64,
    /// Hourly upload threshold in GB.
    pub upload_threshold_gb: f64,
    /// Webhook receiving alerts. Unset disables delivery.
    pub webhook_url: Option<String>,
    /// Bound on each webhook request.
    pub webhook_timeout_secs: u64,
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            download_threshold_gb: 10.0,
            upload_threshold_gb: 5.0,
            webhook_url: None,
            webhook_timeout_secs: 10,
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// SQLite database path.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Interface settings.
    #[serde(default)]
    pub interface: InterfaceSection,
    /// Client rendering settings.
    #[serde(default)]
    pub clients: ClientSection,
    /// Endpoint discovery settings.
    #[serde(default)]
    pub endpoint: EndpointSection,
    /// Telemetry settings.
    #[serde(default)]
    pub telemetry: TelemetrySection,
    /// Alert settings.
    #[serde(default)]
    pub alerts: AlertSection,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/wgpilot/wgpilot.db")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            interface: InterfaceSection::default(),
            clients: ClientSection::default(),
            endpoint: EndpointSection::default(),
            telemetry: TelemetrySection::default(),
            alerts: AlertSection::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("failed to serialize config: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let iface = &self.interface;

        if iface.name.is_empty() || iface.name.len() > MAX_INTERFACE_NAME_LEN {
            return Err(EngineError::Config(format!(
                "interface name must be 1 to {MAX_INTERFACE_NAME_LEN} characters"
            )));
        }
        if !iface
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(EngineError::Config(
                "interface name must contain only alphanumeric characters, '-', '_' and '.'"
                    .to_string(),
            ));
        }

        if iface.subnet.prefix_len() > 30 {
            return Err(EngineError::Config(format!(
                "subnet {} is too small to hold any peer",
                iface.subnet
            )));
        }
        // Reports a server address outside the subnet or on its edges.
        self.allocator()?;
        let trunc = iface.subnet.trunc();
        if iface.server_address == trunc.network() || iface.server_address == trunc.broadcast() {
            return Err(EngineError::Config(format!(
                "server address {} must be a host address of {trunc}",
                iface.server_address
            )));
        }

        if iface.listen_port == 0 {
            return Err(EngineError::Config("listen_port cannot be 0".to_string()));
        }
        for (name, value) in [
            ("interface.command_timeout_secs", iface.command_timeout_secs),
            ("interface.handshake_window_secs", iface.handshake_window_secs),
            ("endpoint.lookup_timeout_secs", self.endpoint.lookup_timeout_secs),
            ("telemetry.poll_interval_secs", self.telemetry.poll_interval_secs),
            ("alerts.webhook_timeout_secs", self.alerts.webhook_timeout_secs),
        ] {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be greater than 0")));
            }
        }

        self.client_policy()?;

        if let Some(host) = &self.endpoint.public_host {
            if host.trim().is_empty() {
                return Err(EngineError::Config("endpoint.public_host cannot be blank".to_string()));
            }
        }
        check_http_url("endpoint.lookup_url", &self.endpoint.lookup_url)?;
        if let Some(url) = &self.alerts.webhook_url {
            if !url.trim().is_empty() {
                check_http_url("alerts.webhook_url", url)?;
            }
        }
        self.thresholds()?;

        Ok(())
    }

    /// Builds the address allocator for the configured subnet.
    ///
    /// # Errors
    ///
    /// Returns an error if the server address lies outside the subnet.
    pub fn allocator(&self) -> Result<AddressAllocator> {
        AddressAllocator::new(self.interface.subnet, self.interface.server_address)
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Builds the client rendering policy.
    ///
    /// # Errors
    ///
    /// Returns an error if `clients.allowed_ips` does not parse.
    pub fn client_policy(&self) -> Result<ClientPolicy> {
        let allowed_ips = AllowedIp::parse_list(&self.clients.allowed_ips).map_err(|e| {
            EngineError::Config(format!("clients.allowed_ips: {e}"))
        })?;
        if allowed_ips.is_empty() {
            return Err(EngineError::Config("clients.allowed_ips cannot be empty".to_string()));
        }
        Ok(ClientPolicy {
            dns: self.clients.dns.clone(),
            allowed_ips,
            persistent_keepalive: self.clients.persistent_keepalive,
        })
    }

    /// Returns the alert thresholds.
    ///
    /// # Errors
    ///
    /// Returns an error if a threshold is negative or not finite.
    pub fn thresholds(&self) -> Result<TrafficThresholds> {
        Ok(TrafficThresholds::new(
            self.alerts.download_threshold_gb,
            self.alerts.upload_threshold_gb,
        )?)
    }

    /// Returns the webhook settings.
    #[must_use]
    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig::new(self.alerts.webhook_url.clone())
            .with_timeout(Duration::from_secs(self.alerts.webhook_timeout_secs))
    }

    /// Returns the settings for the `wg`-backed interface controller.
    #[must_use]
    pub fn command_interface_config(&self) -> CommandInterfaceConfig {
        CommandInterfaceConfig::new(&self.interface.name, &self.interface.config_path)
            .with_command_timeout(Duration::from_secs(self.interface.command_timeout_secs))
            .with_handshake_window(Duration::from_secs(self.interface.handshake_window_secs))
    }

    /// Returns the sampling period.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.poll_interval_secs)
    }
}

fn check_http_url(field: &str, value: &str) -> Result<()> {
    let invalid = |reason: String| {
        EngineError::Config(format!("{field} must be an http(s) URL, got '{value}': {reason}"))
    };
    let url = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}
