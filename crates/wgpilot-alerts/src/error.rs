//! Error types for the wgpilot-alerts crate.

use thiserror::Error;

/// Errors that can occur while detecting or delivering alerts.
#[derive(Debug, Error)]
pub enum AlertError {
    /// Invalid threshold or channel configuration.
    #[error("invalid alert configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration is invalid.
        reason: String,
    },

    /// No webhook URL is configured.
    #[error("no webhook url configured")]
    NotConfigured,

    /// Webhook delivery failed.
    #[error("webhook delivery failed: {reason}")]
    DeliveryFailed {
        /// Why delivery failed.
        reason: String,
    },

    /// Reading bandwidth history failed.
    #[error("history lookup failed: {0}")]
    Store(#[from] wgpilot_store::StoreError),
}

/// Result type for alert operations.
pub type Result<T> = std::result::Result<T, AlertError>;
