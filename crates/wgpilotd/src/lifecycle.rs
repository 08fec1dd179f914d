//! Peer lifecycle: create, enable/disable, delete and reconcile.
//!
//! Every mutation holds one lock from address allocation until the live
//! interface has been updated, so concurrent creates never race on an
//! address and the on-disk server config always reflects the records that
//! were committed last. The lock is an in-process mutex plus, when
//! configured, an advisory [`LockFile`] that extends it to other processes.
//! Failed steps undo the earlier ones before the error is returned.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use wgpilot_store::{Database, NewPeer, PeerRecord};
use wgpilot_wireguard::{AddressAllocator, Endpoint, InterfaceController, KeyGenerator};

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::lockfile::{LockFile, LockFileGuard};
use crate::render::{
    ClientPolicy, ServerIdentity, render_client_config, render_server_config, server_peer,
};

/// Longest accepted peer name.
pub const MAX_PEER_NAME_LEN: usize = 100;

/// Provisions and retires peers.
#[derive(Debug)]
pub struct PeerLifecycleManager<I, K> {
    db: Database,
    interface: Arc<I>,
    keys: K,
    allocator: AddressAllocator,
    identity: ServerIdentity,
    policy: ClientPolicy,
    config_dir: PathBuf,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
    lock_file: Option<LockFile>,
}

/// Both halves of the lifecycle lock; released together on drop.
struct Exclusive<'a> {
    _local: MutexGuard<'a, ()>,
    _file: Option<LockFileGuard>,
}

impl<I, K> PeerLifecycleManager<I, K>
where
    I: InterfaceController,
    K: KeyGenerator,
{
    /// Creates a manager. Client configs are written to `config_dir`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        interface: Arc<I>,
        keys: K,
        allocator: AddressAllocator,
        identity: ServerIdentity,
        policy: ClientPolicy,
        config_dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            interface,
            keys,
            allocator,
            identity,
            policy,
            config_dir: config_dir.into(),
            clock,
            lock: Mutex::new(()),
            lock_file: None,
        }
    }

    /// Also serializes mutations with other processes through `lock_file`.
    #[must_use]
    pub fn with_lock_file(mut self, lock_file: LockFile) -> Self {
        self.lock_file = Some(lock_file);
        self
    }

    /// The server identity.
    #[must_use]
    pub const fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Path of the client config artifact for `peer_id`.
    #[must_use]
    pub fn artifact_path(&self, peer_id: i64) -> PathBuf {
        self.config_dir.join(format!("peer_{peer_id}.conf"))
    }

    /// Creates an enabled peer and returns it with its client config.
    ///
    /// On any failure after the record was inserted, the record and its
    /// artifact are removed and the interface is re-synced to the remaining
    /// peers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidInput`] for a bad name,
    /// [`EngineError::KeyGeneration`], [`EngineError::AddressSpaceExhausted`],
    /// [`EngineError::ConfigPersistence`] or [`EngineError::InterfaceApply`].
    pub async fn create(&self, name: &str, endpoint: &Endpoint) -> Result<(PeerRecord, String)> {
        let name = validate_name(name)?;
        let keys = self.keys.generate()?;

        let _guard = self.exclusive().await?;

        let in_use = self.db.peer_addresses()?;
        let address = self.allocator.next_address(&in_use)?;
        let record = self.db.insert_peer(&NewPeer {
            name,
            address,
            public_key: keys.public,
            private_key: keys.private,
            preshared_key: Some(keys.preshared),
            enabled: true,
            created_at: self.clock.now(),
        })?;

        match self.provision(&record, endpoint).await {
            Ok(client_config) => {
                info!(peer_id = record.id, peer = %record.name, %address, "peer created");
                Ok((record, client_config))
            }
            Err(e) => {
                warn!(peer_id = record.id, error = %e, "peer creation failed, rolling back");
                self.undo_create(&record).await;
                Err(e)
            }
        }
    }

    async fn provision(&self, record: &PeerRecord, endpoint: &Endpoint) -> Result<String> {
        let client_config =
            render_client_config(record, self.identity.public_key(), endpoint, &self.policy);
        write_artifact(&self.artifact_path(record.id), &client_config).await?;

        let server_config = self.server_config()?;
        self.interface.apply_server_config(&server_config).await?;
        Ok(client_config)
    }

    async fn exclusive(&self) -> Result<Exclusive<'_>> {
        let local = self.lock.lock().await;
        let file = match &self.lock_file {
            Some(lock_file) => Some(lock_file.acquire().await?),
            None => None,
        };
        Ok(Exclusive {
            _local: local,
            _file: file,
        })
    }

    async fn undo_create(&self, record: &PeerRecord) {
        if let Err(e) = remove_artifact(&self.artifact_path(record.id)).await {
            error!(peer_id = record.id, error = %e, "failed to remove client config");
        }
        if let Err(e) = self.db.delete_peer(record.id) {
            error!(peer_id = record.id, error = %e, "failed to delete peer record");
            return;
        }
        self.resync().await;
    }

    /// Applies the full config rendered from the records, logging failures.
    async fn resync(&self) {
        match self.server_config() {
            Ok(config) => {
                if let Err(e) = self.interface.apply_server_config(&config).await {
                    error!(error = %e, "failed to re-sync interface after rollback");
                }
            }
            Err(e) => error!(error = %e, "failed to render server config after rollback"),
        }
    }

    /// Enables or disables a peer without touching its keys or address.
    ///
    /// The server config is rewritten to disk and the single peer is added
    /// to or removed from the live interface. If the live change fails, the
    /// flag and the config file are restored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id,
    /// [`EngineError::ConfigPersistence`] or [`EngineError::InterfaceApply`].
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<PeerRecord> {
        let _guard = self.exclusive().await?;

        let record = self.db.require_peer(id)?;
        let previous = record.enabled;

        self.db.set_enabled(id, enabled)?;
        if let Err(e) = self.persist_server_config().await {
            self.restore_enabled(id, previous).await;
            return Err(e);
        }
        if let Err(e) = self
            .interface
            .set_peer_enabled(&server_peer(&record), enabled)
            .await
        {
            warn!(peer_id = id, error = %e, "live peer update failed, reverting");
            self.restore_enabled(id, previous).await;
            return Err(e.into());
        }

        info!(peer_id = id, enabled, "peer toggled");
        Ok(PeerRecord { enabled, ..record })
    }

    async fn restore_enabled(&self, id: i64, enabled: bool) {
        if let Err(e) = self.db.set_enabled(id, enabled) {
            error!(peer_id = id, error = %e, "failed to restore enabled flag");
            return;
        }
        if let Err(e) = self.persist_server_config().await {
            error!(peer_id = id, error = %e, "failed to restore server config");
        }
    }

    /// Deletes a peer, its artifact and its samples.
    ///
    /// The peer is first removed from the live interface; if that fails
    /// nothing else is touched. If a later step fails, the interface is
    /// re-synced to the records so a peer that is still stored is live again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id,
    /// [`EngineError::InterfaceApply`] or [`EngineError::ConfigPersistence`].
    pub async fn delete(&self, id: i64) -> Result<PeerRecord> {
        let _guard = self.exclusive().await?;

        let record = self.db.require_peer(id)?;
        self.interface
            .set_peer_enabled(&server_peer(&record), false)
            .await?;

        if let Err(e) = self.retire(id).await {
            warn!(peer_id = id, error = %e, "peer deletion failed, re-syncing interface");
            self.resync().await;
            return Err(e);
        }

        info!(peer_id = id, peer = %record.name, "peer deleted");
        Ok(record)
    }

    async fn retire(&self, id: i64) -> Result<()> {
        remove_artifact(&self.artifact_path(id)).await?;
        self.db.delete_peer(id)?;
        self.persist_server_config().await
    }

    /// Re-renders the server config from the records and applies it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InterfaceApply`] if the interface rejects it.
    pub async fn reconcile(&self) -> Result<()> {
        let _guard = self.exclusive().await?;
        let config = self.server_config()?;
        self.interface.apply_server_config(&config).await?;
        debug!("interface reconciled with stored peers");
        Ok(())
    }

    /// Renders the client config of a stored peer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn client_config(&self, id: i64, endpoint: &Endpoint) -> Result<String> {
        let record = self.db.require_peer(id)?;
        Ok(render_client_config(
            &record,
            self.identity.public_key(),
            endpoint,
            &self.policy,
        ))
    }

    /// Rewrites every client config artifact for a new endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConfigPersistence`] on the first failed write.
    pub async fn rewrite_artifacts(&self, endpoint: &Endpoint) -> Result<usize> {
        let _guard = self.exclusive().await?;
        let peers = self.db.list_peers()?;
        for record in &peers {
            let text =
                render_client_config(record, self.identity.public_key(), endpoint, &self.policy);
            write_artifact(&self.artifact_path(record.id), &text).await?;
        }
        Ok(peers.len())
    }

    fn server_config(&self) -> Result<String> {
        let peers = self.db.list_peers()?;
        Ok(render_server_config(&self.identity, &peers))
    }

    async fn persist_server_config(&self) -> Result<()> {
        let config = self.server_config()?;
        self.interface.write_server_config(&config).await?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::InvalidInput("peer name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_PEER_NAME_LEN {
        return Err(EngineError::InvalidInput(format!(
            "peer name cannot exceed {MAX_PEER_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(EngineError::InvalidInput(
            "peer name cannot contain control characters".to_string(),
        ));
    }
    Ok(name.to_string())
}

async fn write_artifact(path: &Path, contents: &str) -> Result<()> {
    let persist = |e: std::io::Error| {
        EngineError::ConfigPersistence(format!("failed to write {}: {e}", path.display()))
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(persist)?;
    }
    tokio::fs::write(path, contents).await.map_err(persist)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(persist)?;
    }
    Ok(())
}

async fn remove_artifact(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::ConfigPersistence(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}
