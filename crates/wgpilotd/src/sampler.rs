//! Periodic bandwidth sampling.
//!
//! Each tick reads the live counters once, persists a sample for every peer
//! the interface reports, and runs the anomaly detector over the same
//! snapshot. Alerts go to an [`AlertSink`]; delivery problems never fail a
//! tick.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use wgpilot_alerts::{AlertSink, AnomalyDetector};
use wgpilot_store::{Database, SampleUpdate};
use wgpilot_wireguard::InterfaceController;

use crate::clock::Clock;
use crate::error::Result;

/// Outcome of one sampling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleReport {
    /// Peers sampled.
    pub sampled: usize,
    /// Stored peers the interface did not report, or that were deleted
    /// before their sample was stored.
    pub skipped: usize,
    /// Alerts raised.
    pub alerts: usize,
}

/// Samples live counters into the store and raises traffic alerts.
#[derive(Debug)]
pub struct TelemetrySampler<I, A> {
    db: Database,
    interface: Arc<I>,
    detector: AnomalyDetector,
    sink: A,
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl<I, A> TelemetrySampler<I, A>
where
    I: InterfaceController + 'static,
    A: AlertSink + 'static,
{
    /// Creates a sampler ticking every `period`.
    pub fn new(
        db: Database,
        interface: Arc<I>,
        detector: AnomalyDetector,
        sink: A,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> Self {
        Self {
            db,
            interface,
            detector,
            sink,
            clock,
            period,
        }
    }

    /// The alert sink.
    pub const fn sink(&self) -> &A {
        &self.sink
    }

    /// Runs one sampling pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be queried or the store
    /// fails. Nothing is written when the query fails.
    pub async fn run_once(&self) -> Result<SampleReport> {
        let now = self.clock.now();
        let stats = self.interface.query_live_stats().await?;
        let peers = self.db.list_peers()?;

        let mut observed = Vec::with_capacity(peers.len());
        let mut updates = Vec::with_capacity(peers.len());
        for peer in &peers {
            if let Some(stat) = stats.reported(&peer.public_key) {
                updates.push(SampleUpdate {
                    peer_id: peer.id,
                    rx_bytes: stat.rx_bytes,
                    tx_bytes: stat.tx_bytes,
                    online: stat.online,
                });
                observed.push((peer, stat));
            }
        }

        let sampled = self.db.record_samples(&updates, now)?;
        let mut report = SampleReport {
            sampled,
            skipped: peers.len() - sampled,
            alerts: 0,
        };

        for (peer, stat) in observed {
            if let Some(event) = self.detector.evaluate(peer, stat, now)? {
                self.sink.dispatch(&event).await;
                report.alerts += 1;
            }
        }

        debug!(
            sampled = report.sampled,
            skipped = report.skipped,
            alerts = report.alerts,
            "bandwidth sampled"
        );
        Ok(report)
    }

    /// Spawns the periodic loop. The first pass runs one period after the
    /// start. Setting `shutdown` to `true` stops the loop after any pass in
    /// progress has finished.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(period_secs = self.period.as_secs(), "telemetry sampler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "sampling pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("telemetry sampler stopped");
        })
    }
}
