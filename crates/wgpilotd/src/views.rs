//! Serializable views returned by the engine.
//!
//! None of these carry private or preshared key material.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use wgpilot_store::{PeerCounts, PeerRecord};
use wgpilot_wireguard::{LiveStat, PublicKey};

/// A peer as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerView {
    /// Peer id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// VPN address.
    pub address: Ipv4Addr,
    /// Public key.
    pub public_key: PublicKey,
    /// Whether the peer is on the live interface.
    pub enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time the peer was seen online.
    pub last_seen: Option<DateTime<Utc>>,
    /// Cumulative bytes received from the peer.
    pub total_rx: u64,
    /// Cumulative bytes sent to the peer.
    pub total_tx: u64,
}

impl From<&PeerRecord> for PeerView {
    fn from(record: &PeerRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            address: record.address,
            public_key: record.public_key,
            enabled: record.enabled,
            created_at: record.created_at,
            last_seen: record.last_seen,
            total_rx: record.total_rx,
            total_tx: record.total_tx,
        }
    }
}

/// A freshly created peer and the config its owner imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedPeer {
    /// The new peer.
    pub peer: PeerView,
    /// Client config text.
    pub client_config: String,
}

/// Live status of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    /// Peer id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// VPN address.
    pub address: Ipv4Addr,
    /// Whether the peer is enabled.
    pub enabled: bool,
    /// Handshake within the online window.
    pub online: bool,
    /// Bytes received from the peer.
    pub rx_bytes: u64,
    /// Bytes sent to the peer.
    pub tx_bytes: u64,
    /// Remote address of the peer, if it has one.
    pub endpoint: Option<String>,
    /// Epoch seconds of the last handshake, 0 for never.
    pub latest_handshake: u64,
    /// Last time the peer was seen online.
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerStats {
    /// Combines a stored peer with its live status. Peers the interface does
    /// not report keep their stored totals and show as offline.
    #[must_use]
    pub fn new(record: &PeerRecord, live: Option<&LiveStat>) -> Self {
        let (online, rx_bytes, tx_bytes, endpoint, latest_handshake) = match live {
            Some(stat) => (
                stat.online,
                stat.rx_bytes,
                stat.tx_bytes,
                stat.endpoint.clone(),
                stat.latest_handshake,
            ),
            None => (false, record.total_rx, record.total_tx, None, 0),
        };
        Self {
            id: record.id,
            name: record.name.clone(),
            address: record.address,
            enabled: record.enabled,
            online,
            rx_bytes,
            tx_bytes,
            endpoint,
            latest_handshake,
            last_seen: record.last_seen,
        }
    }
}

/// Server settings and peer counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSummary {
    /// `host:port` clients connect to.
    pub endpoint: String,
    /// Whether the endpoint host is actually known.
    pub endpoint_resolved: bool,
    /// Server public key.
    pub server_public_key: PublicKey,
    /// WireGuard interface name.
    pub interface: String,
    /// Host network interface carrying the default route, if known.
    pub primary_interface: Option<String>,
    /// UDP listen port.
    pub listen_port: u16,
    /// VPN subnet.
    pub subnet: Ipv4Net,
    /// Peer counts.
    pub peers: PeerCounts,
    /// Hourly download alert threshold in GB.
    pub download_threshold_gb: f64,
    /// Hourly upload alert threshold in GB.
    pub upload_threshold_gb: f64,
    /// Whether alerts are delivered to a webhook.
    pub webhook_configured: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpilot_wireguard::{KeyGenerator, OsKeyGenerator};

    fn record() -> PeerRecord {
        let keys = OsKeyGenerator.generate().expect("keys");
        PeerRecord {
            id: 3,
            name: "phone".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 4),
            public_key: keys.public,
            private_key: keys.private,
            preshared_key: Some(keys.preshared),
            enabled: true,
            created_at: Utc::now(),
            last_seen: None,
            total_rx: 700,
            total_tx: 900,
        }
    }

    #[test]
    fn view_omits_secrets() {
        let record = record();
        let json = serde_json::to_string(&PeerView::from(&record)).expect("serialize");
        assert!(!json.contains(&record.private_key.to_base64()));
        assert!(json.contains(&record.public_key.to_base64()));
    }

    #[test]
    fn unreported_peer_keeps_stored_totals() {
        let stats = PeerStats::new(&record(), None);
        assert!(!stats.online);
        assert_eq!((stats.rx_bytes, stats.tx_bytes), (700, 900));
        assert_eq!(stats.latest_handshake, 0);
        assert!(stats.endpoint.is_none());
    }

    #[test]
    fn reported_peer_uses_live_counters() {
        let live = LiveStat {
            online: true,
            rx_bytes: 1,
            tx_bytes: 2,
            endpoint: Some("198.51.100.9:40000".to_string()),
            latest_handshake: 1_700_000_000,
        };
        let stats = PeerStats::new(&record(), Some(&live));
        assert!(stats.online);
        assert_eq!((stats.rx_bytes, stats.tx_bytes), (1, 2));
        assert_eq!(stats.endpoint.as_deref(), Some("198.51.100.9:40000"));
    }
}
