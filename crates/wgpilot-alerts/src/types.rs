//! Core types for traffic alerting.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};

/// Event name carried by traffic alerts.
pub const UNUSUAL_TRAFFIC: &str = "unusual_traffic";

/// Bytes per GB as used in thresholds and alert details.
pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// The severity level of an alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational alert, no action required.
    Info,
    /// Warning alert, should be investigated.
    #[default]
    Warning,
    /// Critical alert, requires immediate attention.
    Critical,
}

impl AlertSeverity {
    /// Returns the severity as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hourly traffic volumes above which a peer is reported.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficThresholds {
    /// Download (peer rx) threshold in GB per hour.
    pub download_gb: f64,
    /// Upload (peer tx) threshold in GB per hour.
    pub upload_gb: f64,
}

impl TrafficThresholds {
    /// Creates thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::InvalidConfig`] if either value is negative or
    /// not finite.
    pub fn new(download_gb: f64, upload_gb: f64) -> Result<Self> {
        for (name, value) in [("download", download_gb), ("upload", upload_gb)] {
            if !value.is_finite() || value < 0.0 {
                return Err(AlertError::InvalidConfig {
                    reason: format!("{name} threshold must be a non-negative number, got {value}"),
                });
            }
        }
        Ok(Self {
            download_gb,
            upload_gb,
        })
    }
}

impl Default for TrafficThresholds {
    fn default() -> Self {
        Self {
            download_gb: 10.0,
            upload_gb: 5.0,
        }
    }
}

/// An alert raised for one peer.
///
/// Serializes to the webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Event name, e.g. [`UNUSUAL_TRAFFIC`].
    pub event: String,
    /// Display name of the peer.
    pub peer_name: String,
    /// VPN address of the peer.
    pub peer_ip: Ipv4Addr,
    /// Human readable summary.
    pub details: String,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub severity: AlertSeverity,
    /// Bytes received from the peer during the window.
    pub rx_bytes: u64,
    /// Bytes sent to the peer during the window.
    pub tx_bytes: u64,
}
