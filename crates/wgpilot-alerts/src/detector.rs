//! Hourly traffic anomaly detection.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use wgpilot_store::{Database, PeerRecord};
use wgpilot_wireguard::LiveStat;

use crate::error::Result;
use crate::types::{AlertEvent, AlertSeverity, BYTES_PER_GB, TrafficThresholds, UNUSUAL_TRAFFIC};

/// Flags peers whose traffic over the trailing window exceeds a threshold.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    db: Database,
    thresholds: TrafficThresholds,
    window: Duration,
}

impl AnomalyDetector {
    /// Creates a detector with a one hour window.
    #[must_use]
    pub fn new(db: Database, thresholds: TrafficThresholds) -> Self {
        Self {
            db,
            thresholds,
            window: Duration::hours(1),
        }
    }

    /// Returns the configured thresholds.
    #[must_use]
    pub const fn thresholds(&self) -> &TrafficThresholds {
        &self.thresholds
    }

    /// Evaluates one peer against its history.
    ///
    /// The baseline is the oldest sample inside `[now - 1h, now]`. Nothing is
    /// reported until the peer has at least an hour of history, and counter
    /// resets never produce negative volumes. Download is checked before
    /// upload; at most one event is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the history cannot be read.
    pub fn evaluate(
        &self,
        peer: &PeerRecord,
        current: &LiveStat,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>> {
        let since = now - self.window;

        let Some(first) = self.db.earliest_sample(peer.id)? else {
            return Ok(None);
        };
        if first.timestamp > since {
            debug!(peer_id = peer.id, "less than an hour of history, skipping");
            return Ok(None);
        }
        let Some(baseline) = self.db.oldest_sample_since(peer.id, since)? else {
            return Ok(None);
        };

        let rx_delta = current.rx_bytes.saturating_sub(baseline.rx_bytes);
        let tx_delta = current.tx_bytes.saturating_sub(baseline.tx_bytes);
        let rx_gb = rx_delta as f64 / BYTES_PER_GB;
        let tx_gb = tx_delta as f64 / BYTES_PER_GB;

        let details = if rx_gb > self.thresholds.download_gb {
            format!("Downloaded {rx_gb:.2}GB in the last hour")
        } else if tx_gb > self.thresholds.upload_gb {
            format!("Uploaded {tx_gb:.2}GB in the last hour")
        } else {
            return Ok(None);
        };

        warn!(
            peer_id = peer.id,
            peer = %peer.name,
            rx_bytes = rx_delta,
            tx_bytes = tx_delta,
            "{details}"
        );
        Ok(Some(AlertEvent {
            event: UNUSUAL_TRAFFIC.to_string(),
            peer_name: peer.name.clone(),
            peer_ip: peer.address,
            details,
            timestamp: now,
            severity: AlertSeverity::Warning,
            rx_bytes: rx_delta,
            tx_bytes: tx_delta,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::Ipv4Addr;
    use wgpilot_store::NewPeer;
    use wgpilot_wireguard::{KeyGenerator, OsKeyGenerator};

    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time")
    }

    fn setup() -> (AnomalyDetector, PeerRecord) {
        let db = Database::open_memory().expect("db");
        let keys = OsKeyGenerator.generate().expect("keys");
        let peer = db
            .insert_peer(&NewPeer {
                name: "laptop".to_string(),
                address: Ipv4Addr::new(10, 0, 0, 2),
                public_key: keys.public,
                private_key: keys.private,
                preshared_key: Some(keys.preshared),
                enabled: true,
                created_at: now() - Duration::days(1),
            })
            .expect("insert");
        (AnomalyDetector::new(db, TrafficThresholds::default()), peer)
    }

    fn live(rx: u64, tx: u64) -> LiveStat {
        LiveStat {
            online: true,
            rx_bytes: rx,
            tx_bytes: tx,
            endpoint: None,
            latest_handshake: 0,
        }
    }

    #[test]
    fn no_history_no_alert() {
        let (detector, peer) = setup();
        let alert = detector.evaluate(&peer, &live(100 * GB, 0), now()).expect("evaluate");
        assert!(alert.is_none());
    }

    #[test]
    fn less_than_an_hour_of_history_no_alert() {
        let (detector, peer) = setup();
        detector
            .db
            .insert_sample(peer.id, now() - Duration::minutes(59), 0, 0)
            .expect("sample");
        let alert = detector.evaluate(&peer, &live(100 * GB, 0), now()).expect("evaluate");
        assert!(alert.is_none());
    }

    #[test]
    fn download_over_threshold_alerts() {
        let (detector, peer) = setup();
        detector
            .db
            .insert_sample(peer.id, now() - Duration::hours(1), 0, 0)
            .expect("sample");

        let alert = detector
            .evaluate(&peer, &live(12 * GB, 0), now())
            .expect("evaluate")
            .expect("alert");
        assert_eq!(alert.details, "Downloaded 12.00GB in the last hour");
        assert_eq!(alert.event, "unusual_traffic");
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert_eq!(alert.peer_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(alert.rx_bytes, 12 * GB);
        assert_eq!(alert.timestamp, now());
    }

    #[test]
    fn counter_reset_clamps_to_zero() {
        let (detector, peer) = setup();
        detector
            .db
            .insert_sample(peer.id, now() - Duration::hours(1), 500 * MB, 500 * MB)
            .expect("sample");
        let alert = detector
            .evaluate(&peer, &live(100 * MB, 100 * MB), now())
            .expect("evaluate");
        assert!(alert.is_none());
    }

    #[test]
    fn download_wins_over_upload() {
        let (detector, peer) = setup();
        detector
            .db
            .insert_sample(peer.id, now() - Duration::hours(2), 0, 0)
            .expect("sample");
        detector
            .db
            .insert_sample(peer.id, now() - Duration::minutes(50), GB, GB)
            .expect("sample");

        let alert = detector
            .evaluate(&peer, &live(20 * GB, 20 * GB), now())
            .expect("evaluate")
            .expect("alert");
        assert!(alert.details.starts_with("Downloaded 19.00GB"));
        assert_eq!(alert.tx_bytes, 19 * GB);
    }

    #[test]
    fn upload_only_alert() {
        let (detector, peer) = setup();
        detector
            .db
            .insert_sample(peer.id, now() - Duration::hours(1), 0, 0)
            .expect("sample");
        let alert = detector
            .evaluate(&peer, &live(GB, 6 * GB), now())
            .expect("evaluate")
            .expect("alert");
        assert_eq!(alert.details, "Uploaded 6.00GB in the last hour");
    }

    #[test]
    fn exactly_at_threshold_does_not_alert() {
        let (detector, peer) = setup();
        detector
            .db
            .insert_sample(peer.id, now() - Duration::hours(1), 0, 0)
            .expect("sample");
        let alert = detector
            .evaluate(&peer, &live(10 * GB, 5 * GB), now())
            .expect("evaluate");
        assert!(alert.is_none());
    }

    #[test]
    fn old_history_without_recent_sample_no_alert() {
        let (detector, peer) = setup();
        detector
            .db
            .insert_sample(peer.id, now() - Duration::hours(3), 0, 0)
            .expect("sample");
        let alert = detector.evaluate(&peer, &live(50 * GB, 0), now()).expect("evaluate");
        assert!(alert.is_none());
    }

    proptest::proptest! {
        #[test]
        fn volumes_within_thresholds_never_alert(
            rx in 0..=10 * GB,
            tx in 0..=5 * GB,
            base_rx in 0..GB,
            base_tx in 0..GB,
        ) {
            let (detector, peer) = setup();
            detector
                .db
                .insert_sample(peer.id, now() - Duration::hours(1), base_rx, base_tx)
                .expect("sample");
            let current = live(base_rx + rx, base_tx + tx);
            let alert = detector.evaluate(&peer, &current, now()).expect("evaluate");
            proptest::prop_assert!(alert.is_none());
        }
    }
}
