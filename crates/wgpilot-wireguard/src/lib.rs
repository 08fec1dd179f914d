//! WireGuard building blocks for wgpilot.
//!
//! This crate owns everything that speaks the WireGuard dialect: Curve25519
//! key material, the INI-style configuration format, address allocation
//! inside the VPN subnet, and the [`InterfaceController`] seam through which
//! the live interface is reconciled and inspected.

pub mod allocator;
pub mod command;
pub mod config;
pub mod error;
pub mod interface;
pub mod keys;
pub mod types;

pub use allocator::AddressAllocator;
pub use command::{CommandInterface, CommandInterfaceConfig};
pub use config::{InterfaceConfig, PeerConfig, generate_wg_config, parse_wg_config};
pub use error::{Result, WireGuardError};
pub use interface::{DEFAULT_HANDSHAKE_WINDOW, FakeInterface, IdentityInfo, InterfaceController};
pub use keys::{
    KEY_SIZE, KeyGenerator, KeyMaterial, KeyPair, OsKeyGenerator, PresharedKey, PrivateKey,
    PublicKey,
};
pub use types::{AllowedIp, Endpoint, LiveStat, LiveStats};
