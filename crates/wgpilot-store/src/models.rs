//! Row types.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wgpilot_wireguard::{PresharedKey, PrivateKey, PublicKey};

/// A provisioned peer as persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    /// Row id, assigned on insert and never reused while the row exists.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// VPN address, unique across peers.
    pub address: Ipv4Addr,
    /// Public key, unique across peers.
    pub public_key: PublicKey,
    /// Private key, kept so the client config can be re-rendered.
    pub private_key: PrivateKey,
    /// Optional preshared key.
    pub preshared_key: Option<PresharedKey>,
    /// Whether the peer belongs on the live interface.
    pub enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time a live poll saw the peer online.
    pub last_seen: Option<DateTime<Utc>>,
    /// Cumulative bytes received, as of the last poll.
    pub total_rx: u64,
    /// Cumulative bytes transmitted, as of the last poll.
    pub total_tx: u64,
}

/// Fields supplied when inserting a peer.
#[derive(Clone, Debug)]
pub struct NewPeer {
    /// Display name.
    pub name: String,
    /// VPN address.
    pub address: Ipv4Addr,
    /// Public key.
    pub public_key: PublicKey,
    /// Private key.
    pub private_key: PrivateKey,
    /// Optional preshared key.
    pub preshared_key: Option<PresharedKey>,
    /// Initial enabled flag.
    pub enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// One point of a peer's bandwidth history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSample {
    /// Row id.
    pub id: i64,
    /// Owning peer.
    pub peer_id: i64,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Cumulative received bytes at that instant.
    pub rx_bytes: u64,
    /// Cumulative transmitted bytes at that instant.
    pub tx_bytes: u64,
}

/// Live counters for one peer, written back by a poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleUpdate {
    /// Peer the counters belong to.
    pub peer_id: i64,
    /// Cumulative received bytes.
    pub rx_bytes: u64,
    /// Cumulative transmitted bytes.
    pub tx_bytes: u64,
    /// Whether the peer was online; only online peers bump `last_seen`.
    pub online: bool,
}

/// Peer totals for the settings summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCounts {
    /// All peers.
    pub total: usize,
    /// Enabled peers.
    pub enabled: usize,
    /// Disabled peers.
    pub disabled: usize,
}
