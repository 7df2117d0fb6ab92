//! Periodic sync.
//!
//! Ticks at a fixed interval and runs one cycle against every upstream peer
//! in turn. A tick that arrives while a cycle is still running is skipped,
//! not queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use karya_sync_core::PeerId;

use crate::orchestrator::{CycleOutcome, SyncOrchestrator};

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run one cycle against every registered peer above this node.
    pub async fn tick(&self) -> Vec<(PeerId, CycleOutcome)> {
        let local = self.orchestrator.tier();
        let peers = match self.orchestrator.store().list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::error!("failed to list peers: {}", e);
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for peer in peers.into_iter().filter(|p| p.tier.is_above(local)) {
            let outcome = self.orchestrator.run_cycle(&peer.id).await;
            if let CycleOutcome::Aborted(reason) = &outcome {
                tracing::warn!(peer = %peer.id, "sync cycle aborted: {}", reason);
            }
            outcomes.push((peer.id, outcome));
        }
        outcomes
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval = ?self.interval, "sync scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("sync scheduler stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karya_sync_core::Tier;
    use karya_sync_store::{MemoryStore, Store, SyncPeer};

    use crate::config::SyncConfig;
    use crate::endpoint::Endpoint;
    use crate::files::FileStorage;
    use crate::registry::TableRegistry;
    use crate::transport::memory::MemoryNetwork;

    async fn scheduler(dir: &std::path::Path) -> (Arc<MemoryStore>, SyncScheduler) {
        let network = MemoryNetwork::new();
        network
            .register(Arc::new(Endpoint::new(
                PeerId::new("central"),
                Tier::Central,
                Arc::new(MemoryStore::new()),
                FileStorage::new(dir.join("central")),
                Arc::new(TableRegistry::standard()),
            )))
            .await;

        let store = Arc::new(MemoryStore::new());
        store
            .upsert_peer(&SyncPeer::new(PeerId::new("central"), Tier::Central, "memory://central"))
            .await
            .unwrap();
        store
            .upsert_peer(&SyncPeer::new(PeerId::new("phone-1"), Tier::Client, ""))
            .await
            .unwrap();

        let orchestrator = SyncOrchestrator::new(
            Tier::Edge,
            store.clone(),
            Arc::new(network.transport(PeerId::new("box-1"), Tier::Edge)),
            FileStorage::new(dir.join("edge")),
            Arc::new(TableRegistry::standard()),
            SyncConfig::default(),
        );
        (store, SyncScheduler::new(Arc::new(orchestrator), Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn test_tick_only_syncs_upstream_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (_, scheduler) = scheduler(dir.path()).await;

        let outcomes = scheduler.tick().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, PeerId::new("central"));
        assert!(matches!(outcomes[0].1, CycleOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (store, scheduler) = scheduler(dir.path()).await;
        let (tx, rx) = watch::channel(false);

        let handle = scheduler.spawn(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let peer = store.get_peer(&PeerId::new("central")).await.unwrap().unwrap();
        assert!(peer.token.is_some());
    }
}
