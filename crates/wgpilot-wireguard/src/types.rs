//! Core types shared by the config format and the interface controller.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;

/// An allowed IP address or network in CIDR notation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowedIp {
    network: IpNet,
}

impl AllowedIp {
    /// Creates a new allowed IP from an `IpNet`.
    #[must_use]
    pub fn new(network: IpNet) -> Self {
        Self { network }
    }

    /// Returns the network.
    #[must_use]
    pub fn network(&self) -> &IpNet {
        &self.network
    }

    /// Parses a comma separated list such as `0.0.0.0/0, ::/0`.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry is not valid CIDR notation.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect()
    }

    /// Joins a list back into the `a, b` form used in config files.
    #[must_use]
    pub fn join(ips: &[Self]) -> String {
        ips.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for AllowedIp {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self> {
        let network = s
            .parse::<IpNet>()
            .map_err(|e| WireGuardError::InvalidCidr(format!("{s}: {e}")))?;
        Ok(Self { network })
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// A peer endpoint as written in config files: a hostname or IP plus a port.
///
/// The host is kept as text because the public endpoint is frequently a DNS
/// name. IPv6 literals are stored without brackets and re-bracketed on
/// display.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map_or(host.clone(), str::to_string);
        Self { host, port }
    }

    /// Returns the host part.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Endpoint {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| WireGuardError::InvalidEndpoint(format!("missing port in {s:?}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| WireGuardError::InvalidEndpoint(format!("bad port in {s:?}: {e}")))?;
        if host.is_empty() || host == "[]" {
            return Err(WireGuardError::InvalidEndpoint(format!("missing host in {s:?}")));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Live view of one peer as reported by the running interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStat {
    /// Handshake is non-zero and inside the recency window.
    pub online: bool,
    /// Cumulative bytes received from the peer.
    pub rx_bytes: u64,
    /// Cumulative bytes sent to the peer.
    pub tx_bytes: u64,
    /// Last endpoint the peer was seen at.
    pub endpoint: Option<String>,
    /// Epoch seconds of the latest handshake, 0 if never.
    pub latest_handshake: u64,
}

impl LiveStat {
    /// The stat reported for a peer the interface does not know about.
    #[must_use]
    pub fn offline() -> Self {
        Self::default()
    }
}

/// Live stats for every peer on the interface, keyed by public key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveStats {
    peers: HashMap<PublicKey, LiveStat>,
}

impl LiveStats {
    /// Creates an empty stats table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the stat for a peer.
    pub fn insert(&mut self, key: PublicKey, stat: LiveStat) {
        self.peers.insert(key, stat);
    }

    /// Returns the stat for a peer, or [`LiveStat::offline`] if it is absent.
    #[must_use]
    pub fn get(&self, key: &PublicKey) -> LiveStat {
        self.peers.get(key).cloned().unwrap_or_default()
    }

    /// Returns the stat only if the interface reported the peer.
    #[must_use]
    pub fn reported(&self, key: &PublicKey) -> Option<&LiveStat> {
        self.peers.get(key)
    }

    /// Returns true if the interface reported the peer.
    #[must_use]
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.peers.contains_key(key)
    }

    /// Number of reported peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peers were reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterates over reported peers.
    pub fn iter(&self) -> impl Iterator<Item = (&PublicKey, &LiveStat)> {
        self.peers.iter()
    }
}

impl FromIterator<(PublicKey, LiveStat)> for LiveStats {
    fn from_iter<T: IntoIterator<Item = (PublicKey, LiveStat)>>(iter: T) -> Self {
        Self {
            peers: iter.into_iter().collect(),
        }
    }
}
