//! Persistence for wgpilot.
//!
//! Two tables live in one SQLite file:
//!
//! - `peers`: one row per provisioned peer, including its key material and
//!   cumulative traffic counters.
//! - `bandwidth_history`: append-only counter samples written by the
//!   telemetry sampler. Samples go away with their peer and never otherwise.

pub mod db;
pub mod error;
pub mod models;

pub use db::Database;
pub use error::{Result, StoreError};
pub use models::{BandwidthSample, NewPeer, PeerCounts, PeerRecord, SampleUpdate};
