//! The engine facade.
//!
//! [`Engine`] wires the store, the interface controller, the lifecycle
//! manager, the sampler and the endpoint resolver together and exposes the
//! operations a CLI or API layer calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wgpilot_alerts::{AlertSink, AnomalyDetector, WebhookDispatcher};
use wgpilot_store::{BandwidthSample, Database, SampleUpdate};
use wgpilot_wireguard::{
    CommandInterface, Endpoint, InterfaceController, OsKeyGenerator, PrivateKey, PublicKey,
};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::endpoint::{AddressLookup, HttpLookup, PublicEndpointResolver};
use crate::error::Result;
use crate::keyfile::load_private_key;
use crate::lifecycle::PeerLifecycleManager;
use crate::lockfile::LockFile;
use crate::render::ServerIdentity;
use crate::sampler::{SampleReport, TelemetrySampler};
use crate::views::{CreatedPeer, PeerStats, PeerView, SettingsSummary};

/// Host written into client configs while the public address is unknown.
pub const ENDPOINT_PLACEHOLDER: &str = "your-server-address";

/// Engine backed by the real interface, a webhook and an HTTP lookup.
pub type SystemEngine = Engine<CommandInterface, WebhookDispatcher, HttpLookup>;

struct SamplerTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Provisions peers and samples their traffic.
pub struct Engine<I, A, L> {
    config: EngineConfig,
    db: Database,
    interface: Arc<I>,
    lifecycle: PeerLifecycleManager<I, OsKeyGenerator>,
    sampler: Arc<TelemetrySampler<I, A>>,
    resolver: PublicEndpointResolver<L>,
    clock: Arc<dyn Clock>,
    task: Mutex<Option<SamplerTask>>,
}

impl SystemEngine {
    /// Builds an engine from configuration alone: opens the database, loads
    /// the server key and drives the interface through `wg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the key cannot be
    /// loaded or the database cannot be opened.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let server_key = load_private_key(&config.interface.private_key_path)?;
        let db = Database::open(&config.database_path)?;
        let interface = CommandInterface::new(config.command_interface_config());
        let sink = WebhookDispatcher::new(config.webhook_config())?;
        let lookup = HttpLookup::new(
            config.endpoint.lookup_url.clone(),
            Duration::from_secs(config.endpoint.lookup_timeout_secs),
        )?;
        Self::new(config, server_key, db, interface, sink, lookup, Arc::new(SystemClock))
    }
}

impl<I, A, L> Engine<I, A, L>
where
    I: InterfaceController + 'static,
    A: AlertSink + 'static,
    L: AddressLookup,
{
    /// Assembles an engine from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::Config`] if the configuration is invalid.
    pub fn new(
        config: EngineConfig,
        server_key: PrivateKey,
        db: Database,
        interface: I,
        sink: A,
        lookup: L,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let interface = Arc::new(interface);

        let identity = ServerIdentity::new(
            server_key,
            config.interface.server_address,
            config.interface.subnet,
            config.interface.listen_port,
        )?;
        let lifecycle = PeerLifecycleManager::new(
            db.clone(),
            Arc::clone(&interface),
            OsKeyGenerator,
            config.allocator()?,
            identity,
            config.client_policy()?,
            config.clients.config_dir.clone(),
            Arc::clone(&clock),
        )
        .with_lock_file(LockFile::beside(&config.database_path));
        let sampler = Arc::new(TelemetrySampler::new(
            db.clone(),
            Arc::clone(&interface),
            AnomalyDetector::new(db.clone(), config.thresholds()?),
            sink,
            Arc::clone(&clock),
            config.poll_interval(),
        ));
        let resolver = PublicEndpointResolver::new(
            config.endpoint.public_host.clone(),
            lookup,
            Duration::from_secs(config.endpoint.cache_ttl_secs),
            Arc::clone(&clock),
        );

        Ok(Self {
            config,
            db,
            interface,
            lifecycle,
            sampler,
            resolver,
            clock,
            task: Mutex::new(None),
        })
    }

    /// The configuration the engine runs with.
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The server public key derived from the configured private key.
    pub fn server_public_key(&self) -> &PublicKey {
        self.lifecycle.identity().public_key()
    }

    /// The sink alerts are delivered to.
    pub fn alert_sink(&self) -> &A {
        self.sampler.sink()
    }

    /// Reconciles the interface with the stored peers and starts periodic
    /// sampling. Calling it while running does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial reconcile fails.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        self.lifecycle.reconcile().await?;

        let (shutdown, rx) = watch::channel(false);
        let handle = Arc::clone(&self.sampler).spawn(rx);
        *task = Some(SamplerTask { shutdown, handle });
        info!(
            interface = %self.config.interface.name,
            poll_interval_secs = self.config.telemetry.poll_interval_secs,
            "engine started"
        );
        Ok(())
    }

    /// Stops periodic sampling, waiting for a pass in progress to finish.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        if task.shutdown.send(true).is_err() {
            debug!("sampler already gone before shutdown was signalled");
        }
        if let Err(e) = task.handle.await {
            error!(error = %e, "sampler task ended abnormally");
        }
        info!("engine stopped");
    }

    /// Whether periodic sampling is running.
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Creates an enabled peer and returns its client config.
    ///
    /// # Errors
    ///
    /// See [`PeerLifecycleManager::create`].
    pub async fn create_peer(&self, name: &str) -> Result<CreatedPeer> {
        let endpoint = self.server_endpoint().await;
        let (record, client_config) = self.lifecycle.create(name, &endpoint).await?;
        Ok(CreatedPeer {
            peer: PeerView::from(&record),
            client_config,
        })
    }

    /// Enables or disables a peer.
    ///
    /// # Errors
    ///
    /// See [`PeerLifecycleManager::set_enabled`].
    pub async fn toggle_peer(&self, id: i64, enabled: bool) -> Result<PeerView> {
        let record = self.lifecycle.set_enabled(id, enabled).await?;
        Ok(PeerView::from(&record))
    }

    /// Deletes a peer with its history.
    ///
    /// # Errors
    ///
    /// See [`PeerLifecycleManager::delete`].
    pub async fn delete_peer(&self, id: i64) -> Result<()> {
        self.lifecycle.delete(id).await?;
        Ok(())
    }

    /// Lists all peers in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn list_peers(&self) -> Result<Vec<PeerView>> {
        Ok(self.db.list_peers()?.iter().map(PeerView::from).collect())
    }

    /// Reads live status for every stored peer and refreshes the stored
    /// totals of the peers the interface reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be queried.
    pub async fn peer_stats(&self) -> Result<Vec<PeerStats>> {
        let stats = self.interface.query_live_stats().await?;
        let peers = self.db.list_peers()?;

        let updates: Vec<SampleUpdate> = peers
            .iter()
            .filter_map(|peer| {
                stats.reported(&peer.public_key).map(|stat| SampleUpdate {
                    peer_id: peer.id,
                    rx_bytes: stat.rx_bytes,
                    tx_bytes: stat.tx_bytes,
                    online: stat.online,
                })
            })
            .collect();
        self.db.refresh_live_totals(&updates, self.clock.now())?;

        Ok(self
            .db
            .list_peers()?
            .iter()
            .map(|peer| PeerStats::new(peer, stats.reported(&peer.public_key)))
            .collect())
    }

    /// Summarizes the server settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails. An unreadable interface identity
    /// falls back to the configured key.
    pub async fn settings_summary(&self) -> Result<SettingsSummary> {
        let host = self.resolver.resolve().await;
        let endpoint = self.endpoint_for(host.as_deref());

        let (server_public_key, primary_interface) = match self.interface.identity_info().await {
            Ok(info) => (info.server_public_key, Some(info.primary_interface)),
            Err(e) => {
                warn!(error = %e, "failed to read interface identity");
                (*self.server_public_key(), None)
            }
        };

        Ok(SettingsSummary {
            endpoint: endpoint.to_string(),
            endpoint_resolved: host.is_some(),
            server_public_key,
            interface: self.config.interface.name.clone(),
            primary_interface,
            listen_port: self.config.interface.listen_port,
            subnet: self.config.interface.subnet,
            peers: self.db.peer_counts()?,
            download_threshold_gb: self.config.alerts.download_threshold_gb,
            upload_threshold_gb: self.config.alerts.upload_threshold_gb,
            webhook_configured: self.config.webhook_config().url.is_some(),
        })
    }

    /// Renders the client config of a peer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::NotFound`] for an unknown id.
    pub async fn client_config_text(&self, id: i64) -> Result<String> {
        let endpoint = self.server_endpoint().await;
        self.lifecycle.client_config(id, &endpoint)
    }

    /// The text to encode in a QR code for a peer: its client config.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::NotFound`] for an unknown id.
    pub async fn qr_payload(&self, id: i64) -> Result<String> {
        self.client_config_text(id).await
    }

    /// Returns a peer's samples taken at or after `since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::NotFound`] for an unknown id.
    pub fn bandwidth_history(&self, id: i64, since: DateTime<Utc>) -> Result<Vec<BandwidthSample>> {
        self.db.require_peer(id)?;
        Ok(self.db.samples_since(id, since)?)
    }

    /// Re-applies the stored peer set to the live interface.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::InterfaceApply`] on failure.
    pub async fn reconcile(&self) -> Result<()> {
        self.lifecycle.reconcile().await
    }

    /// Runs one sampling pass outside the periodic schedule.
    ///
    /// # Errors
    ///
    /// See [`TelemetrySampler::run_once`].
    pub async fn sample_once(&self) -> Result<SampleReport> {
        self.sampler.run_once().await
    }

    /// Looks the public address up again and rewrites every client config
    /// artifact with it. Returns the host, if known.
    ///
    /// # Errors
    ///
    /// Returns an error if an artifact cannot be written.
    pub async fn refresh_endpoint(&self) -> Result<Option<String>> {
        self.resolver.expire();
        let host = self.resolver.resolve().await;
        if let Some(host) = &host {
            let endpoint = self.endpoint_for(Some(host));
            let rewritten = self.lifecycle.rewrite_artifacts(&endpoint).await?;
            info!(%endpoint, rewritten, "client configs refreshed");
        }
        Ok(host)
    }

    async fn server_endpoint(&self) -> Endpoint {
        let host = self.resolver.resolve().await;
        if host.is_none() {
            warn!("public address unknown, client config uses a placeholder endpoint");
        }
        self.endpoint_for(host.as_deref())
    }

    fn endpoint_for(&self, host: Option<&str>) -> Endpoint {
        Endpoint::new(
            host.unwrap_or(ENDPOINT_PLACEHOLDER),
            self.config.interface.listen_port,
        )
    }
}
