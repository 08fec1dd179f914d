//! wgpilotd - WireGuard peer provisioning and traffic telemetry.
//!
//! The daemon owns one WireGuard interface. It hands out tunnel addresses,
//! generates key material, renders server and client configs, keeps the
//! live interface in sync with the stored peers, and samples per-peer
//! counters to build bandwidth history and raise traffic alerts.
//!
//! [`Engine`] is the entry point; everything else is a part it wires
//! together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod keyfile;
pub mod lifecycle;
pub mod lockfile;
pub mod render;
pub mod sampler;
pub mod units;
pub mod views;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use endpoint::{AddressLookup, HttpLookup, PublicEndpointResolver};
pub use engine::{ENDPOINT_PLACEHOLDER, Engine, SystemEngine};
pub use error::{EngineError, Result};
pub use lifecycle::PeerLifecycleManager;
pub use lockfile::LockFile;
pub use render::{ClientPolicy, ServerIdentity, render_client_config, render_server_config};
pub use sampler::{SampleReport, TelemetrySampler};
pub use units::{format_bytes, hours_before};
pub use views::{CreatedPeer, PeerStats, PeerView, SettingsSummary};
