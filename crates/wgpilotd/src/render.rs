//! Rendering of server and client WireGuard configs from peer records.
//!
//! Rendering is pure: the same records always produce the same text, which
//! is what lets a disable/enable round trip restore the server config
//! byte for byte.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};
use wgpilot_store::PeerRecord;
use wgpilot_wireguard::{
    AllowedIp, Endpoint, InterfaceConfig, PeerConfig, PrivateKey, PublicKey, generate_wg_config,
};

use crate::error::{EngineError, Result};

/// The server side of the tunnel.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    private_key: PrivateKey,
    public_key: PublicKey,
    address: Ipv4Net,
    listen_port: u16,
}

impl ServerIdentity {
    /// Creates the identity for a server at `address` inside `subnet`.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` is not inside `subnet`.
    pub fn new(
        private_key: PrivateKey,
        address: Ipv4Addr,
        subnet: Ipv4Net,
        listen_port: u16,
    ) -> Result<Self> {
        if !subnet.contains(&address) {
            return Err(EngineError::Config(format!(
                "server address {address} is outside {subnet}"
            )));
        }
        let address = Ipv4Net::new(address, subnet.prefix_len())
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self {
            public_key: private_key.public_key(),
            private_key,
            address,
            listen_port,
        })
    }

    /// The server public key.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The server's tunnel address with the subnet prefix.
    #[must_use]
    pub const fn address(&self) -> Ipv4Net {
        self.address
    }

    /// The UDP listen port.
    #[must_use]
    pub const fn listen_port(&self) -> u16 {
        self.listen_port
    }
}

/// Per-deployment client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPolicy {
    /// DNS servers pushed to clients.
    pub dns: Vec<IpAddr>,
    /// Routes clients send through the tunnel.
    pub allowed_ips: Vec<AllowedIp>,
    /// Keepalive interval in seconds.
    pub persistent_keepalive: u16,
}

fn host_route(address: Ipv4Addr) -> AllowedIp {
    AllowedIp::new(IpNet::V4(Ipv4Net::from(address)))
}

/// The server's view of one peer: its key and its single /32.
#[must_use]
pub fn server_peer(peer: &PeerRecord) -> PeerConfig {
    PeerConfig::new(peer.public_key)
        .with_preshared_key(peer.preshared_key.clone())
        .with_allowed_ips([host_route(peer.address)])
}

/// Renders the server config. Only enabled peers are included, in id order.
#[must_use]
pub fn render_server_config(identity: &ServerIdentity, peers: &[PeerRecord]) -> String {
    let mut enabled: Vec<&PeerRecord> = peers.iter().filter(|p| p.enabled).collect();
    enabled.sort_by_key(|p| p.id);

    let config = enabled.into_iter().fold(
        InterfaceConfig::new(identity.private_key.clone())
            .with_address(AllowedIp::new(IpNet::V4(identity.address)))
            .with_listen_port(identity.listen_port),
        |config, peer| config.with_peer(server_peer(peer)),
    );
    generate_wg_config(&config)
}

/// Renders the config a client imports to join the tunnel.
#[must_use]
pub fn render_client_config(
    peer: &PeerRecord,
    server_public_key: &PublicKey,
    endpoint: &Endpoint,
    policy: &ClientPolicy,
) -> String {
    let server = PeerConfig::new(*server_public_key)
        .with_preshared_key(peer.preshared_key.clone())
        .with_endpoint(endpoint.clone())
        .with_allowed_ips(policy.allowed_ips.iter().cloned())
        .with_persistent_keepalive(policy.persistent_keepalive);

    let config = InterfaceConfig::new(peer.private_key.clone())
        .with_address(host_route(peer.address))
        .with_dns(policy.dns.iter().copied())
        .with_peer(server);
    generate_wg_config(&config)
}
