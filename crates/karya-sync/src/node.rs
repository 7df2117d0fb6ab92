//! A sync node: one store, one attachment directory, one orchestrator.
//!
//! The node wires the engine together from a [`NodeConfig`] and exposes both
//! sides of sync: the orchestrator that drives cycles against upstream peers
//! and the [`Endpoint`] that downstream nodes call.

use std::sync::Arc;

use karya_sync_core::{PeerId, Tier};
use karya_sync_engine::{
    server, CycleOutcome, Endpoint, FileStorage, HttpTransport, SyncOrchestrator, SyncScheduler,
    TableRegistry, Transport, ViewRefresher,
};
use karya_sync_store::{SqliteStore, Store, SyncPeer};

use crate::config::{NodeConfig, PeerConfig};
use crate::error::Result;

pub struct Node {
    config: NodeConfig,
    store: Arc<SqliteStore>,
    storage: FileStorage,
    registry: Arc<TableRegistry>,
    transport: Arc<dyn Transport>,
    endpoint: Arc<Endpoint>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl Node {
    /// Open a node that talks to its peers over HTTP.
    ///
    /// Download URLs it hands out point at its own HTTP routes.
    pub async fn open(config: NodeConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.node_id.clone(), &config.sync)?);
        Self::assemble(config, transport, Some(server::FILES_PATH)).await
    }

    /// Open a node with a caller-supplied transport.
    ///
    /// Creates the database and attachment directories as needed and
    /// registers the configured peers.
    pub async fn with_transport(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::assemble(config, transport, None).await
    }

    async fn assemble(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        url_base: Option<&str>,
    ) -> Result<Self> {
        if let Some(dir) = config
            .database_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::create_dir_all(&config.files_root).await?;

        let store = Arc::new(SqliteStore::open(&config.database_path)?);
        let storage = FileStorage::new(&config.files_root);
        let registry = Arc::new(TableRegistry::standard());

        let mut endpoint = Endpoint::new(
            config.node_id.clone(),
            config.tier,
            store.clone(),
            storage.clone(),
            registry.clone(),
        );
        if let Some(base) = url_base {
            endpoint = endpoint.with_url_base(base);
        }
        let endpoint = Arc::new(endpoint);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            config.tier,
            store.clone(),
            transport.clone(),
            storage.clone(),
            registry.clone(),
            config.sync.clone(),
        ));

        let node = Self {
            config,
            store,
            storage,
            registry,
            transport,
            endpoint,
            orchestrator,
        };
        node.register_peers().await?;

        tracing::info!(
            node = %node.config.node_id,
            tier = %node.config.tier,
            peers = node.config.peers.len(),
            "node opened"
        );
        Ok(node)
    }

    /// Refresh derived views at the end of every cycle.
    pub fn with_view_refresher(mut self, refresher: Arc<dyn ViewRefresher>) -> Self {
        let mut sync = self.config.sync.clone();
        sync.refresh_views = true;
        self.orchestrator = Arc::new(
            SyncOrchestrator::new(
                self.config.tier,
                self.store.clone(),
                self.transport.clone(),
                self.storage.clone(),
                self.registry.clone(),
                sync,
            )
            .with_view_refresher(refresher),
        );
        self
    }

    /// Store the configured peers. A credential renewed by an earlier run is
    /// kept in preference to the configured one.
    async fn register_peers(&self) -> Result<()> {
        for peer in &self.config.peers {
            self.register_peer(peer).await?;
        }
        Ok(())
    }

    pub async fn register_peer(&self, peer: &PeerConfig) -> Result<()> {
        let stored = self.store.get_peer(&peer.id).await?;

        let mut record = SyncPeer::new(peer.id.clone(), peer.tier, peer.base_url.clone());
        match stored {
            Some(SyncPeer {
                token: Some(token),
                token_expires_at,
                ..
            }) => {
                record.token = Some(token);
                record.token_expires_at = token_expires_at;
            }
            _ => record.token = peer.token.clone(),
        }

        self.store.upsert_peer(&record).await?;
        tracing::debug!(peer = %peer.id, tier = %peer.tier, "registered peer");
        Ok(())
    }

    pub fn id(&self) -> &PeerId {
        &self.config.node_id
    }

    pub fn tier(&self) -> Tier {
        self.config.tier
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Run one cycle against a single peer.
    pub async fn sync_with(&self, peer: &PeerId) -> CycleOutcome {
        self.orchestrator.run_cycle(peer).await
    }

    /// Run one cycle against every upstream peer.
    pub async fn sync_all(&self) -> Vec<(PeerId, CycleOutcome)> {
        self.scheduler().tick().await
    }

    /// A scheduler ticking at the configured interval.
    pub fn scheduler(&self) -> SyncScheduler {
        SyncScheduler::new(self.orchestrator.clone(), self.config.sync.tick_interval)
    }
}
