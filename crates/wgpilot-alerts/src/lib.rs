//! Traffic anomaly detection and alert delivery for wgpilot.
//!
//! The [`AnomalyDetector`] compares a peer's live counters with the oldest
//! sample of the trailing hour and raises an [`AlertEvent`] when the
//! download or upload volume crosses its threshold. Events are handed to an
//! [`AlertSink`]; the [`WebhookDispatcher`] POSTs them as JSON.
//!
//! # Example
//!
//! ```rust
//! use wgpilot_alerts::{AnomalyDetector, TrafficThresholds};
//! use wgpilot_store::Database;
//!
//! let db = Database::open_memory().unwrap();
//! let detector = AnomalyDetector::new(db, TrafficThresholds::new(10.0, 5.0).unwrap());
//! assert_eq!(detector.thresholds().download_gb, 10.0);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod channels;
pub mod detector;
pub mod error;
pub mod types;

pub use channels::{AlertSink, DeliveryResult, MemorySink, WebhookConfig, WebhookDispatcher};
pub use detector::AnomalyDetector;
pub use error::{AlertError, Result};
pub use types::{AlertEvent, AlertSeverity, TrafficThresholds, UNUSUAL_TRAFFIC};
