//! Error types for wgpilotd.

use std::time::Duration;

use thiserror::Error;
use wgpilot_alerts::AlertError;
use wgpilot_store::StoreError;
use wgpilot_wireguard::WireGuardError;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fresh key material could not be produced.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The VPN subnet has no free host address left.
    #[error("address space exhausted: no free host address left in {subnet}")]
    AddressSpaceExhausted {
        /// The exhausted subnet.
        subnet: String,
    },

    /// Reconciling the live interface failed.
    #[error("interface apply failed: {0}")]
    InterfaceApply(String),

    /// Reading the live interface failed.
    #[error("interface query failed: {0}")]
    InterfaceQuery(String),

    /// Writing a config or artifact to disk failed.
    #[error("config persistence failed: {0}")]
    ConfigPersistence(String),

    /// The lifecycle lock file could not be taken.
    #[error("lock failed: {0}")]
    Lock(String),

    /// The requested peer does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An external command or request exceeded its bound.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// What timed out.
        operation: String,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// The public address lookup failed.
    #[error("endpoint lookup failed: {0}")]
    EndpointLookup(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid caller input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Persistence failure.
    #[error("store error: {0}")]
    Store(StoreError),

    /// Alerting setup failure.
    #[error("alerting error: {0}")]
    Alert(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireGuardError> for EngineError {
    fn from(err: WireGuardError) -> Self {
        match err {
            WireGuardError::KeyGeneration(msg) => Self::KeyGeneration(msg),
            WireGuardError::AddressSpaceExhausted { subnet } => {
                Self::AddressSpaceExhausted { subnet }
            }
            WireGuardError::InterfaceApply(msg) => Self::InterfaceApply(msg),
            WireGuardError::InterfaceQuery(msg) => Self::InterfaceQuery(msg),
            WireGuardError::ConfigPersistence(msg) => Self::ConfigPersistence(msg),
            WireGuardError::Timeout { operation, after } => Self::Timeout { operation, after },
            other => Self::Config(other.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other),
        }
    }
}

impl From<AlertError> for EngineError {
    fn from(err: AlertError) -> Self {
        match err {
            AlertError::Store(store) => store.into(),
            AlertError::InvalidConfig { reason } => Self::Config(reason),
            other => Self::Alert(other.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: EngineError = StoreError::peer_not_found(7).into();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(err.to_string(), "peer 7 not found");
    }

    #[test_case(
        WireGuardError::KeyGeneration("no entropy".into()),
        "key generation failed: no entropy" ;
        "keygen"
    )]
    #[test_case(
        WireGuardError::InterfaceApply("exit 1".into()),
        "interface apply failed: exit 1" ;
        "apply"
    )]
    #[test_case(
        WireGuardError::AddressSpaceExhausted { subnet: "10.0.0.0/30".into() },
        "address space exhausted: no free host address left in 10.0.0.0/30" ;
        "exhausted"
    )]
    #[test_case(
        WireGuardError::Timeout { operation: "wg show".into(), after: Duration::from_secs(10) },
        "wg show timed out after 10s" ;
        "timeout"
    )]
    fn wireguard_errors_keep_their_cause(err: WireGuardError, expected: &str) {
        assert_eq!(EngineError::from(err).to_string(), expected);
    }

    #[test]
    fn alert_store_error_unwraps() {
        let err: EngineError = AlertError::Store(StoreError::peer_not_found(1)).into();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
