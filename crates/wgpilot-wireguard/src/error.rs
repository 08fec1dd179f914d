//! Error types for WireGuard operations.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while handling keys, configs or the live interface.
#[derive(Debug, Error)]
pub enum WireGuardError {
    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// The entropy source could not produce key material.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid `host:port` endpoint.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration text could not be parsed.
    #[error("parse error at line {line}: {message}")]
    ParseError {
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// Every host address in the subnet is taken.
    #[error("address space exhausted: no free host address left in {subnet}")]
    AddressSpaceExhausted {
        /// The subnet that ran out of addresses.
        subnet: String,
    },

    /// A privileged reconciliation command failed.
    #[error("interface apply failed: {0}")]
    InterfaceApply(String),

    /// Reading the live interface state failed.
    #[error("interface query failed: {0}")]
    InterfaceQuery(String),

    /// Writing a rendered config to disk failed.
    #[error("config persistence failed: {0}")]
    ConfigPersistence(String),

    /// An external command exceeded its time bound.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// The command that timed out.
        operation: String,
        /// The bound that was exceeded.
        after: Duration,
    },
}

impl From<base64::DecodeError> for WireGuardError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidBase64(err.to_string())
    }
}

/// Result type for WireGuard operations.
pub type Result<T> = std::result::Result<T, WireGuardError>;
