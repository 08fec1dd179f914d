//! WireGuard configuration file generation and parsing.
//!
//! This module handles the INI-style format understood by `wg-quick`. The
//! writer is pure; the parser accepts everything the writer emits and
//! ignores keys it does not model (`PostUp`, `SaveConfig`, ...).

use std::fmt::Write as FmtWrite;
use std::net::IpAddr;

use crate::error::{Result, WireGuardError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::types::{AllowedIp, Endpoint};

/// The `[Interface]` section plus its peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// The interface's private key.
    pub private_key: PrivateKey,
    /// Addresses assigned to this interface.
    pub addresses: Vec<AllowedIp>,
    /// Optional listen port.
    pub listen_port: Option<u16>,
    /// DNS servers pushed to the client.
    pub dns: Vec<IpAddr>,
    /// Optional MTU.
    pub mtu: Option<u16>,
    /// `[Peer]` sections, in file order.
    pub peers: Vec<PeerConfig>,
}

impl InterfaceConfig {
    /// Creates a new interface configuration with the given private key.
    #[must_use]
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            private_key,
            addresses: Vec::new(),
            listen_port: None,
            dns: Vec::new(),
            mtu: None,
            peers: Vec::new(),
        }
    }

    /// Sets the listen port.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Adds an address.
    #[must_use]
    pub fn with_address(mut self, address: AllowedIp) -> Self {
        self.addresses.push(address);
        self
    }

    /// Adds DNS servers.
    #[must_use]
    pub fn with_dns(mut self, dns: impl IntoIterator<Item = IpAddr>) -> Self {
        self.dns.extend(dns);
        self
    }

    /// Sets the MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }
}

/// One `[Peer]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Optional preshared key.
    pub preshared_key: Option<PresharedKey>,
    /// Optional endpoint.
    pub endpoint: Option<Endpoint>,
    /// Allowed IPs for this peer.
    pub allowed_ips: Vec<AllowedIp>,
    /// Optional persistent keepalive interval in seconds.
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// Creates a new peer config with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }

    /// Sets the preshared key, if any.
    #[must_use]
    pub fn with_preshared_key(mut self, key: Option<PresharedKey>) -> Self {
        self.preshared_key = key;
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Adds allowed IPs.
    #[must_use]
    pub fn with_allowed_ips(mut self, ips: impl IntoIterator<Item = AllowedIp>) -> Self {
        self.allowed_ips.extend(ips);
        self
    }

    /// Sets the persistent keepalive interval.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }
}

/// Renders an [`InterfaceConfig`] as `wg-quick` configuration text.
#[must_use]
pub fn generate_wg_config(config: &InterfaceConfig) -> String {
    let mut output = String::new();

    output.push_str("[Interface]\n");
    let _ = writeln!(output, "PrivateKey = {}", config.private_key.to_base64());

    if !config.addresses.is_empty() {
        let _ = writeln!(output, "Address = {}", AllowedIp::join(&config.addresses));
    }

    if let Some(port) = config.listen_port {
        let _ = writeln!(output, "ListenPort = {port}");
    }

    if !config.dns.is_empty() {
        let dns: Vec<String> = config.dns.iter().map(ToString::to_string).collect();
        let _ = writeln!(output, "DNS = {}", dns.join(", "));
    }

    if let Some(mtu) = config.mtu {
        let _ = writeln!(output, "MTU = {mtu}");
    }

    for peer in &config.peers {
        output.push_str("\n[Peer]\n");
        let _ = writeln!(output, "PublicKey = {}", peer.public_key);

        if let Some(psk) = &peer.preshared_key {
            let _ = writeln!(output, "PresharedKey = {}", psk.to_base64());
        }

        if let Some(endpoint) = &peer.endpoint {
            let _ = writeln!(output, "Endpoint = {endpoint}");
        }

        if !peer.allowed_ips.is_empty() {
            let _ = writeln!(output, "AllowedIPs = {}", AllowedIp::join(&peer.allowed_ips));
        }

        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(output, "PersistentKeepalive = {keepalive}");
        }
    }

    output
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

fn parse_error(line: usize, message: impl Into<String>) -> WireGuardError {
    WireGuardError::ParseError {
        line,
        message: message.into(),
    }
}

/// Parses `wg-quick` configuration text.
///
/// # Errors
///
/// Returns [`WireGuardError::ParseError`] naming the offending line.
pub fn parse_wg_config(config_str: &str) -> Result<InterfaceConfig> {
    let mut section = Section::None;
    let mut interface = ParsedInterface::default();
    let mut peers: Vec<PeerConfig> = Vec::new();
    let mut current_peer: Option<(usize, ParsedPeer)> = None;

    for (index, raw) in config_str.lines().enumerate() {
        let line_number = index + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if let Some((start, peer)) = current_peer.take() {
                peers.push(peer.build(start)?);
            }
            section = match name {
                "Interface" => Section::Interface,
                "Peer" => {
                    current_peer = Some((line_number, ParsedPeer::default()));
                    Section::Peer
                }
                _ => return Err(parse_error(line_number, format!("unknown section: {name}"))),
            };
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_error(line_number, format!("invalid line format: {line}")));
        };
        let (key, value) = (key.trim(), value.trim());

        match (section, current_peer.as_mut()) {
            (Section::None, _) => {
                return Err(parse_error(line_number, "key-value pair outside of section"));
            }
            (Section::Interface, _) => interface.parse_key(key, value, line_number)?,
            (Section::Peer, Some((_, peer))) => peer.parse_key(key, value, line_number)?,
            (Section::Peer, None) => {}
        }
    }

    if let Some((start, peer)) = current_peer {
        peers.push(peer.build(start)?);
    }

    interface.build(peers)
}

#[derive(Default)]
struct ParsedInterface {
    private_key: Option<PrivateKey>,
    addresses: Vec<AllowedIp>,
    listen_port: Option<u16>,
    dns: Vec<IpAddr>,
    mtu: Option<u16>,
}

impl ParsedInterface {
    fn parse_key(&mut self, key: &str, value: &str, line: usize) -> Result<()> {
        match key {
            "PrivateKey" => {
                self.private_key = Some(
                    PrivateKey::from_base64(value)
                        .map_err(|_| parse_error(line, "invalid PrivateKey"))?,
                );
            }
            "Address" => {
                let addrs = AllowedIp::parse_list(value)
                    .map_err(|e| parse_error(line, format!("invalid Address: {e}")))?;
                self.addresses.extend(addrs);
            }
            "ListenPort" => {
                self.listen_port =
                    Some(value.parse().map_err(|_| parse_error(line, "invalid ListenPort"))?);
            }
            "DNS" => {
                for server in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    self.dns.push(
                        server.parse().map_err(|_| {
                            parse_error(line, format!("invalid DNS address: {server}"))
                        })?,
                    );
                }
            }
            "MTU" => {
                self.mtu = Some(value.parse().map_err(|_| parse_error(line, "invalid MTU"))?);
            }
            _ => {}
        }
        Ok(())
    }

    fn build(self, peers: Vec<PeerConfig>) -> Result<InterfaceConfig> {
        let private_key = self
            .private_key
            .ok_or_else(|| parse_error(0, "missing PrivateKey in [Interface] section"))?;
        Ok(InterfaceConfig {
            private_key,
            addresses: self.addresses,
            listen_port: self.listen_port,
            dns: self.dns,
            mtu: self.mtu,
            peers,
        })
    }
}

#[derive(Default)]
struct ParsedPeer {
    public_key: Option<PublicKey>,
    preshared_key: Option<PresharedKey>,
    endpoint: Option<Endpoint>,
    allowed_ips: Vec<AllowedIp>,
    persistent_keepalive: Option<u16>,
}

impl ParsedPeer {
    fn parse_key(&mut self, key: &str, value: &str, line: usize) -> Result<()> {
        match key {
            "PublicKey" => {
                self.public_key = Some(
                    PublicKey::from_base64(value)
                        .map_err(|_| parse_error(line, "invalid PublicKey"))?,
                );
            }
            "PresharedKey" => {
                self.preshared_key = Some(
                    PresharedKey::from_base64(value)
                        .map_err(|_| parse_error(line, "invalid PresharedKey"))?,
                );
            }
            "Endpoint" => {
                self.endpoint = Some(
                    value
                        .parse()
                        .map_err(|_| parse_error(line, format!("invalid Endpoint: {value}")))?,
                );
            }
            "AllowedIPs" => {
                let ips = AllowedIp::parse_list(value)
                    .map_err(|e| parse_error(line, format!("invalid AllowedIPs: {e}")))?;
                self.allowed_ips.extend(ips);
            }
            "PersistentKeepalive" => {
                // wg-quick accepts "off" as an explicit disable.
                if value != "off" {
                    self.persistent_keepalive = Some(
                        value
                            .parse()
                            .map_err(|_| parse_error(line, "invalid PersistentKeepalive"))?,
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn build(self, line: usize) -> Result<PeerConfig> {
        let public_key = self
            .public_key
            .ok_or_else(|| parse_error(line, "missing PublicKey in [Peer] section"))?;
        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}
