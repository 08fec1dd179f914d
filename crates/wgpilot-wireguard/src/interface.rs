//! Control of the live WireGuard interface.
//!
//! [`InterfaceController`] is the seam between the provisioning engine and
//! the privileged world. [`crate::command::CommandInterface`] drives the real
//! interface through `wg`/`wg-quick`; [`FakeInterface`] keeps everything in
//! memory for tests and dry runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{PeerConfig, parse_wg_config};
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{LiveStat, LiveStats};

/// Default window inside which a handshake counts as "online".
pub const DEFAULT_HANDSHAKE_WINDOW: Duration = Duration::from_secs(180);

/// Identity of the server side of the tunnel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    /// Public key of the WireGuard interface.
    pub server_public_key: PublicKey,
    /// Name of the host's primary (default route) network interface.
    pub primary_interface: String,
}

/// Operations on the single local WireGuard interface.
///
/// Implementations serialize their own mutations; stats reads may run
/// concurrently with them.
pub trait InterfaceController: Send + Sync {
    /// Persists `config` to the canonical path and reloads the interface's
    /// peer set in place.
    fn apply_server_config(&self, config: &str) -> impl Future<Output = Result<()>> + Send;

    /// Persists `config` to the canonical path without touching the live
    /// interface.
    fn write_server_config(&self, config: &str) -> impl Future<Output = Result<()>> + Send;

    /// Adds or removes one peer on the live interface. Removing a peer that
    /// is not live succeeds.
    fn set_peer_enabled(
        &self,
        peer: &PeerConfig,
        enabled: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Reads per-peer counters and handshake state.
    fn query_live_stats(&self) -> impl Future<Output = Result<LiveStats>> + Send;

    /// Returns the server public key and the primary network interface.
    fn identity_info(&self) -> impl Future<Output = Result<IdentityInfo>> + Send;
}

/// Returns whether a handshake at `latest_handshake` is recent at `now`.
#[must_use]
pub fn is_online(latest_handshake: u64, now: u64, window: Duration) -> bool {
    latest_handshake != 0 && now.saturating_sub(latest_handshake) <= window.as_secs()
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[derive(Clone, Debug)]
struct FakePeer {
    config: PeerConfig,
    rx_bytes: u64,
    tx_bytes: u64,
    latest_handshake: u64,
    endpoint: Option<String>,
}

impl FakePeer {
    fn new(config: PeerConfig) -> Self {
        Self {
            config,
            rx_bytes: 0,
            tx_bytes: 0,
            latest_handshake: 0,
            endpoint: None,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    peers: HashMap<PublicKey, FakePeer>,
    written_config: Option<String>,
}

/// In-memory [`InterfaceController`] with failure injection.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Clone)]
pub struct FakeInterface {
    identity: IdentityInfo,
    window: Duration,
    state: Arc<RwLock<FakeState>>,
    fail_apply: Arc<AtomicBool>,
    fail_set_peer: Arc<AtomicBool>,
    fail_query: Arc<AtomicBool>,
    apply_count: Arc<AtomicUsize>,
}

impl FakeInterface {
    /// Creates a fake interface owned by `server_public_key`.
    #[must_use]
    pub fn new(server_public_key: PublicKey) -> Self {
        Self {
            identity: IdentityInfo {
                server_public_key,
                primary_interface: "eth0".to_string(),
            },
            window: DEFAULT_HANDSHAKE_WINDOW,
            state: Arc::new(RwLock::new(FakeState::default())),
            fail_apply: Arc::new(AtomicBool::new(false)),
            fail_set_peer: Arc::new(AtomicBool::new(false)),
            fail_query: Arc::new(AtomicBool::new(false)),
            apply_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets the handshake recency window.
    #[must_use]
    pub fn with_handshake_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Makes `apply_server_config` fail until reset.
    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Makes `set_peer_enabled` fail until reset.
    pub fn fail_set_peer(&self, fail: bool) {
        self.fail_set_peer.store(fail, Ordering::SeqCst);
    }

    /// Makes `query_live_stats` fail until reset.
    pub fn fail_query(&self, fail: bool) {
        self.fail_query.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `apply_server_config` calls.
    pub fn apply_count(&self) -> usize {
        self.apply_count.load(Ordering::SeqCst)
    }

    /// Public keys of the peers currently live, sorted by base64.
    pub async fn live_peers(&self) -> Vec<PublicKey> {
        let state = self.state.read().await;
        let mut keys: Vec<PublicKey> = state.peers.keys().copied().collect();
        keys.sort_by_key(PublicKey::to_base64);
        keys
    }

    /// The live config of one peer.
    pub async fn live_peer(&self, key: &PublicKey) -> Option<PeerConfig> {
        self.state.read().await.peers.get(key).map(|p| p.config.clone())
    }

    /// The last config text persisted through the controller.
    pub async fn written_config(&self) -> Option<String> {
        self.state.read().await.written_config.clone()
    }

    /// Sets the cumulative counters of a live peer.
    pub async fn simulate_traffic(
        &self,
        key: &PublicKey,
        rx_bytes: u64,
        tx_bytes: u64,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let peer = state
            .peers
            .get_mut(key)
            .ok_or_else(|| WireGuardError::InterfaceQuery(format!("peer {key} is not live")))?;
        peer.rx_bytes = rx_bytes;
        peer.tx_bytes = tx_bytes;
        Ok(())
    }

    /// Records a handshake from `endpoint` at `timestamp` epoch seconds.
    pub async fn simulate_handshake(
        &self,
        key: &PublicKey,
        timestamp: u64,
        endpoint: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let peer = state
            .peers
            .get_mut(key)
            .ok_or_else(|| WireGuardError::InterfaceQuery(format!("peer {key} is not live")))?;
        peer.latest_handshake = timestamp;
        peer.endpoint = Some(endpoint.to_string());
        Ok(())
    }

    /// Zeroes every counter, as an interface restart does.
    pub async fn simulate_restart(&self) {
        let mut state = self.state.write().await;
        for peer in state.peers.values_mut() {
            peer.rx_bytes = 0;
            peer.tx_bytes = 0;
            peer.latest_handshake = 0;
        }
    }
}

impl InterfaceController for FakeInterface {
    async fn apply_server_config(&self, config: &str) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(WireGuardError::InterfaceApply(
                "injected failure: wg syncconf exited with status 1".to_string(),
            ));
        }
        let parsed = parse_wg_config(config)?;

        let mut state = self.state.write().await;
        state.written_config = Some(config.to_string());
        // syncconf semantics: keep counters of peers that survive.
        let mut previous = std::mem::take(&mut state.peers);
        for peer in parsed.peers {
            let entry = match previous.remove(&peer.public_key) {
                Some(mut live) => {
                    live.config = peer;
                    live
                }
                None => FakePeer::new(peer),
            };
            state.peers.insert(entry.config.public_key, entry);
        }
        self.apply_count.fetch_add(1, Ordering::SeqCst);
        debug!(peers = state.peers.len(), "fake interface synced");
        Ok(())
    }

    async fn write_server_config(&self, config: &str) -> Result<()> {
        self.state.write().await.written_config = Some(config.to_string());
        Ok(())
    }

    async fn set_peer_enabled(&self, peer: &PeerConfig, enabled: bool) -> Result<()> {
        if self.fail_set_peer.load(Ordering::SeqCst) {
            return Err(WireGuardError::InterfaceApply(
                "injected failure: wg set exited with status 1".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        if enabled {
            state
                .peers
                .entry(peer.public_key)
                .and_modify(|live| live.config = peer.clone())
                .or_insert_with(|| FakePeer::new(peer.clone()));
        } else {
            state.peers.remove(&peer.public_key);
        }
        Ok(())
    }

    async fn query_live_stats(&self) -> Result<LiveStats> {
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(WireGuardError::InterfaceQuery(
                "injected failure: wg show exited with status 1".to_string(),
            ));
        }
        let now = unix_now();
        let state = self.state.read().await;
        Ok(state
            .peers
            .iter()
            .map(|(key, peer)| {
                let stat = LiveStat {
                    online: is_online(peer.latest_handshake, now, self.window),
                    rx_bytes: peer.rx_bytes,
                    tx_bytes: peer.tx_bytes,
                    endpoint: peer.endpoint.clone(),
                    latest_handshake: peer.latest_handshake,
                };
                (*key, stat)
            })
            .collect())
    }

    async fn identity_info(&self) -> Result<IdentityInfo> {
        Ok(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterfaceConfig, generate_wg_config};
    use crate::keys::{KeyPair, PrivateKey};

    fn key(n: u8) -> PublicKey {
        PublicKey::from_bytes([n; 32])
    }

    fn server_config(peers: &[PublicKey]) -> String {
        let config = peers.iter().fold(
            InterfaceConfig::new(PrivateKey::from_bytes([1; 32])).with_listen_port(51820),
            |config, key| {
                config.with_peer(
                    PeerConfig::new(*key).with_allowed_ips(["10.0.0.2/32".parse().expect("cidr")]),
                )
            },
        );
        generate_wg_config(&config)
    }

    fn fake() -> FakeInterface {
        let server = KeyPair::generate().expect("keys");
        FakeInterface::new(*server.public_key())
    }

    #[test]
    fn online_requires_recent_nonzero_handshake() {
        let window = Duration::from_secs(180);
        assert!(!is_online(0, 1_000, window));
        assert!(is_online(1_000, 1_180, window));
        assert!(!is_online(1_000, 1_181, window));
        // Clock skew: handshake reported in the future still counts.
        assert!(is_online(2_000, 1_000, window));
    }

    #[tokio::test]
    async fn apply_replaces_peer_set_and_keeps_counters() {
        let wg = fake();
        wg.apply_server_config(&server_config(&[key(2), key(3)]))
            .await
            .expect("apply");
        wg.simulate_traffic(&key(2), 100, 200).await.expect("traffic");

        wg.apply_server_config(&server_config(&[key(2)]))
            .await
            .expect("apply");

        assert_eq!(wg.live_peers().await, vec![key(2)]);
        let stats = wg.query_live_stats().await.expect("stats");
        assert_eq!(stats.get(&key(2)).rx_bytes, 100);
        assert_eq!(wg.apply_count(), 2);
    }

    #[tokio::test]
    async fn removing_absent_peer_is_noop() {
        let wg = fake();
        wg.set_peer_enabled(&PeerConfig::new(key(9)), false)
            .await
            .expect("remove absent peer");
        assert!(wg.live_peers().await.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let wg = fake();
        wg.fail_apply(true);
        wg.fail_set_peer(true);
        wg.fail_query(true);
        assert!(matches!(
            wg.apply_server_config(&server_config(&[])).await,
            Err(WireGuardError::InterfaceApply(_))
        ));
        assert!(wg.set_peer_enabled(&PeerConfig::new(key(2)), true).await.is_err());
        assert!(wg.query_live_stats().await.is_err());
        assert_eq!(wg.apply_count(), 0);
    }

    #[tokio::test]
    async fn handshake_marks_peer_online() {
        let wg = fake();
        wg.set_peer_enabled(&PeerConfig::new(key(4)), true)
            .await
            .expect("add");
        wg.simulate_handshake(&key(4), unix_now(), "198.51.100.4:40000")
            .await
            .expect("handshake");

        let stats = wg.query_live_stats().await.expect("stats");
        let stat = stats.get(&key(4));
        assert!(stat.online);
        assert_eq!(stat.endpoint.as_deref(), Some("198.51.100.4:40000"));
    }

    #[tokio::test]
    async fn restart_zeroes_counters() {
        let wg = fake();
        wg.set_peer_enabled(&PeerConfig::new(key(5)), true)
            .await
            .expect("add");
        wg.simulate_traffic(&key(5), 500, 600).await.expect("traffic");
        wg.simulate_restart().await;
        let stats = wg.query_live_stats().await.expect("stats");
        assert_eq!(stats.get(&key(5)).rx_bytes, 0);
    }
}
