//! Sync cycle orchestration.
//!
//! One cycle against an upstream peer runs these stages in order:
//!
//! 1. renew the credential (the cycle is aborted if this fails)
//! 2. upload files the peer does not hold
//! 3. send local changes, in rounds of at most `batch_limit` rows per table
//! 4. receive the peer's changes, page by page
//! 5. fetch download URLs for files only the peer holds
//! 6. download files that have a URL
//! 7. optionally refresh derived views
//!
//! A failed stage is logged and recorded; the remaining stages still run.
//! At most one cycle runs per orchestrator at any time.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use karya_sync_core::{codec, ChangeBatch, PeerId, Record, TableName, Tier, Timestamp};
use karya_sync_store::{Direction, Store, StoreExt, SyncPeer};

use crate::applier::{ApplyReport, RecordApplier};
use crate::collector::ChangeCollector;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::files::{FileOutcome, FileStorage, FileTransferManager, TransferReport};
use crate::registry::{TableRegistry, TableSpec};
use crate::transport::Transport;

/// Rebuilds derived local views once a cycle has written new rows.
#[async_trait]
pub trait ViewRefresher: Send + Sync {
    async fn refresh(&self) -> Result<()>;
}

/// The stages of a cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    RenewCredential,
    UploadFiles,
    SendChanges,
    ReceiveChanges,
    RenewFileUrls,
    DownloadFiles,
    RefreshViews,
}

impl Stage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::RenewCredential => "renew_credential",
            Stage::UploadFiles => "upload_files",
            Stage::SendChanges => "send_changes",
            Stage::ReceiveChanges => "receive_changes",
            Stage::RenewFileUrls => "renew_file_urls",
            Stage::DownloadFiles => "download_files",
            Stage::RefreshViews => "refresh_views",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

/// Everything that happened during one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub peer: PeerId,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub stages: Vec<StageReport>,
    pub rows_sent: usize,
    pub rows_received: usize,
    pub applied: Vec<ApplyReport>,
    pub transfers: Vec<FileOutcome>,
}

impl CycleReport {
    fn new(peer: PeerId, started_at: Timestamp) -> Self {
        Self {
            peer,
            started_at,
            finished_at: started_at,
            stages: Vec::new(),
            rows_sent: 0,
            rows_received: 0,
            applied: Vec::new(),
            transfers: Vec::new(),
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| &s.outcome)
    }

    /// Every stage completed or was skipped.
    pub fn is_clean(&self) -> bool {
        self.stages
            .iter()
            .all(|s| !matches!(s.outcome, StageOutcome::Failed(_)))
    }

    fn record<T>(&mut self, stage: Stage, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.stages.push(StageReport {
                    stage,
                    outcome: StageOutcome::Completed,
                });
                Some(value)
            }
            Err(e) => {
                tracing::error!(stage = %stage, "stage failed: {}", e);
                self.stages.push(StageReport {
                    stage,
                    outcome: StageOutcome::Failed(e.to_string()),
                });
                None
            }
        }
    }

    fn record_transfers(&mut self, stage: Stage, result: Result<TransferReport>) {
        if let Some(transfers) = self.record(stage, result) {
            self.transfers.extend(transfers.outcomes);
        }
    }

    fn skip(&mut self, stage: Stage) {
        self.stages.push(StageReport {
            stage,
            outcome: StageOutcome::Skipped,
        });
    }
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The cycle stopped before exchanging any data.
    Aborted(String),
    /// Another cycle was in progress; nothing was done.
    AlreadyRunning,
}

/// Releases the single-flight flag when dropped.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives sync cycles for one node.
pub struct SyncOrchestrator {
    tier: Tier,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    registry: Arc<TableRegistry>,
    collector: ChangeCollector,
    applier: RecordApplier,
    files: FileTransferManager,
    config: SyncConfig,
    refresher: Option<Arc<dyn ViewRefresher>>,
    running: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        tier: Tier,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        storage: FileStorage,
        registry: Arc<TableRegistry>,
        config: SyncConfig,
    ) -> Self {
        Self {
            collector: ChangeCollector::new(store.clone()),
            applier: RecordApplier::new(store.clone(), registry.clone(), tier),
            files: FileTransferManager::new(store.clone(), storage, transport.clone()),
            tier,
            store,
            transport,
            registry,
            config,
            refresher: None,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_view_refresher(mut self, refresher: Arc<dyn ViewRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Whether a cycle is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one full cycle against `peer_id`.
    ///
    /// Returns [`CycleOutcome::AlreadyRunning`] immediately if a cycle is
    /// already in progress.
    pub async fn run_cycle(&self, peer_id: &PeerId) -> CycleOutcome {
        let Some(_guard) = CycleGuard::acquire(&self.running) else {
            tracing::info!(peer = %peer_id, "sync cycle already running, skipping");
            return CycleOutcome::AlreadyRunning;
        };

        let span = tracing::info_span!("sync_cycle", peer = %peer_id);
        self.cycle(peer_id).instrument(span).await
    }

    async fn cycle(&self, peer_id: &PeerId) -> CycleOutcome {
        let started_at = Timestamp::now();
        tracing::info!("starting sync cycle");

        let mut peer = match self.store.get_peer(peer_id).await {
            Ok(Some(peer)) => peer,
            Ok(None) => return CycleOutcome::Aborted(format!("unknown peer {}", peer_id)),
            Err(e) => return CycleOutcome::Aborted(format!("failed to load peer: {}", e)),
        };

        if let Err(e) = self.renew_credential(&mut peer).await {
            tracing::warn!("credential renewal failed, aborting cycle: {}", e);
            return CycleOutcome::Aborted(format!("credential renewal failed: {}", e));
        }

        let mut report = CycleReport::new(peer.id.clone(), started_at);
        report.record(Stage::RenewCredential, Ok(()));

        let uploads = self.files.upload_pending(&peer).await;
        report.record_transfers(Stage::UploadFiles, uploads);

        let sent = self.send_changes(&peer, started_at).await;
        if let Some(rows) = report.record(Stage::SendChanges, sent) {
            report.rows_sent = rows;
        }

        let received = self.receive_changes(&peer).await;
        if let Some((rows, applied)) = report.record(Stage::ReceiveChanges, received) {
            report.rows_received = rows;
            report.applied = applied;
        }

        let urls = self.files.renew_urls(&peer).await;
        report.record_transfers(Stage::RenewFileUrls, urls);

        let downloads = self.files.download_pending(&peer).await;
        report.record_transfers(Stage::DownloadFiles, downloads);

        match (&self.refresher, self.config.refresh_views) {
            (Some(refresher), true) => {
                let refreshed = refresher.refresh().await;
                report.record(Stage::RefreshViews, refreshed);
            }
            _ => report.skip(Stage::RefreshViews),
        }

        report.finished_at = Timestamp::now();
        tracing::info!(
            sent = report.rows_sent,
            received = report.rows_received,
            transfers = report.transfers.len(),
            clean = report.is_clean(),
            "sync cycle finished"
        );
        CycleOutcome::Completed(report)
    }

    async fn renew_credential(&self, peer: &mut SyncPeer) -> Result<()> {
        let renewed = self.transport.renew_token(peer).await?;
        peer.token = Some(renewed.token);
        peer.token_expires_at = renewed.expires_at;
        self.store.upsert_peer(peer).await?;
        tracing::debug!(expires_at = ?peer.token_expires_at, "credential renewed");
        Ok(())
    }

    /// Push rows changed up to `until`, round by round.
    ///
    /// The first round is always delivered, even when it is empty, so the
    /// peer sees the node check in. A table's sent watermark only moves after
    /// the peer has taken the round.
    async fn send_changes(&self, peer: &SyncPeer, until: Timestamp) -> Result<usize> {
        let limit = self.config.effective_batch_limit();
        let specs: Vec<&TableSpec> = self.registry.mutable_by(self.tier).collect();
        let mut total = 0;
        let mut round = 0usize;

        loop {
            round += 1;
            let mut batches = Vec::new();
            let mut marks = Vec::new();
            let mut any_full = false;

            for spec in &specs {
                let since = self
                    .store
                    .get_checkpoint(&peer.id, &spec.name, Direction::Sent)
                    .await?;
                let page = self.collector.collect(&spec.name, since, until, limit).await?;
                any_full |= page.is_full;
                if !page.rows.is_empty() {
                    marks.push((*spec, page.watermark));
                    batches.push(ChangeBatch::new(spec.name.clone(), page.rows));
                }
            }

            if batches.is_empty() && round > 1 {
                break;
            }

            let rows: usize = batches.iter().map(ChangeBatch::len).sum();
            let payload = codec::encode(&batches)?;
            self.transport.push_updates(peer, payload).await?;
            total += rows;
            tracing::debug!(round, tables = batches.len(), rows, "sent changes");

            for (batch, (spec, watermark)) in batches.iter().zip(marks) {
                self.store
                    .advance_checkpoint(&peer.id, &spec.name, Direction::Sent, watermark)
                    .await?;
                self.mark_sent(spec, &batch.rows).await?;
            }

            if !any_full {
                break;
            }
        }

        tracing::info!(rows = total, "send stage finished");
        Ok(total)
    }

    /// Apply the table's post-send transition to rows that have not changed
    /// since they were collected.
    async fn mark_sent(&self, spec: &TableSpec, rows: &[Record]) -> Result<()> {
        let now = Timestamp::now();
        for row in rows {
            let id = row.id()?;
            let sent_at = row.last_updated_at()?;
            let Some(current) = self.store.get_record(&spec.name, id).await? else {
                continue;
            };
            if current.last_updated_at()? != sent_at {
                continue;
            }
            if let Some(marked) = spec.handler.mark_sent(&current, now)? {
                self.store.put_record(&spec.name, &marked).await?;
            }
        }
        Ok(())
    }

    /// Pull and apply the peer's changes until every table is caught up.
    ///
    /// Pulls start at the lowest received watermark over all tables. Tables
    /// that were neither full nor held back by a failed row are known to be
    /// complete up to the newest row in the response and are advanced there.
    async fn receive_changes(&self, peer: &SyncPeer) -> Result<(usize, Vec<ApplyReport>)> {
        let limit = self.config.effective_batch_limit();
        let names = self.registry.names();
        let marks = self
            .store
            .watermarks(&peer.id, &names, Direction::Received)
            .await?;
        let mut from = marks
            .iter()
            .map(|(_, ts)| *ts)
            .min()
            .unwrap_or(Timestamp::EPOCH);

        let mut received = 0;
        let mut reports = Vec::new();

        loop {
            let payload = self.transport.pull_updates(peer, from, limit).await?;
            let mut batches = codec::decode(&payload)?;
            batches.sort_by_key(|b| self.registry.position(&b.table_name).unwrap_or(usize::MAX));

            let newest = batches.iter().filter_map(ChangeBatch::max_last_updated_at).max();
            let mut held: HashSet<TableName> = HashSet::new();
            let mut next_from: Option<Timestamp> = None;

            for batch in batches {
                let table = batch.table_name.clone();
                let full = batch.len() >= limit;
                let page_max = batch.max_last_updated_at();
                received += batch.len();

                let report = self.applier.apply(peer.tier, &table, batch.rows).await;
                if self.registry.get(&table).is_some() {
                    if let Some(watermark) = report.safe_watermark() {
                        self.store
                            .advance_checkpoint(&peer.id, &table, Direction::Received, watermark)
                            .await?;
                    }
                }

                if report.failed_count() > 0 {
                    held.insert(table.clone());
                }
                if full {
                    held.insert(table.clone());
                    if let Some(max) = page_max {
                        next_from = Some(next_from.map_or(max, |n| n.min(max)));
                    }
                }
                reports.push(report);
            }

            if let Some(newest) = newest {
                for name in names.iter().filter(|n| !held.contains(*n)) {
                    self.store
                        .advance_checkpoint(&peer.id, name, Direction::Received, newest)
                        .await?;
                }
            }

            match next_from {
                Some(next) if next > from => from = next,
                _ => break,
            }
        }

        tracing::info!(rows = received, "receive stage finished");
        Ok((received, reports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use karya_sync_core::{FileRecord, FileSidecar};
    use karya_sync_store::MemoryStore;
    use tokio::sync::Notify;

    use crate::endpoint::{Endpoint, UploadOutcome};
    use crate::transport::memory::{MemoryNetwork, MemoryTransport};
    use crate::transport::RenewedToken;

    struct Harness {
        _dirs: (tempfile::TempDir, tempfile::TempDir),
        network: Arc<MemoryNetwork>,
        central: Arc<Endpoint>,
        edge_store: Arc<MemoryStore>,
        edge_storage: FileStorage,
    }

    fn central_id() -> PeerId {
        PeerId::new("central")
    }

    async fn harness() -> Harness {
        let central_dir = tempfile::tempdir().unwrap();
        let edge_dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();

        let central = Arc::new(Endpoint::new(
            central_id(),
            Tier::Central,
            Arc::new(MemoryStore::new()),
            FileStorage::new(central_dir.path()),
            Arc::new(TableRegistry::standard()),
        ));
        network.register(central.clone()).await;

        let edge_store = Arc::new(MemoryStore::new());
        edge_store
            .upsert_peer(&SyncPeer::new(central_id(), Tier::Central, "memory://central"))
            .await
            .unwrap();

        Harness {
            edge_storage: FileStorage::new(edge_dir.path()),
            _dirs: (central_dir, edge_dir),
            network,
            central,
            edge_store,
        }
    }

    fn orchestrator(h: &Harness, transport: Arc<dyn Transport>, config: SyncConfig) -> SyncOrchestrator {
        SyncOrchestrator::new(
            Tier::Edge,
            h.edge_store.clone(),
            transport,
            h.edge_storage.clone(),
            Arc::new(TableRegistry::standard()),
            config,
        )
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected a completed cycle, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cycle_exchanges_rows_both_ways() {
        let h = harness().await;
        h.central
            .store()
            .put_record(&TableName::TASK, &Record::new("t-1", Timestamp::from_millis(10)))
            .await
            .unwrap();
        h.edge_store
            .put_record(&TableName::WORKER, &Record::new("w-1", Timestamp::from_millis(20)))
            .await
            .unwrap();

        let transport = Arc::new(h.network.transport(PeerId::new("box-1"), Tier::Edge));
        let orch = orchestrator(&h, transport, SyncConfig::default());
        let report = completed(orch.run_cycle(&central_id()).await);

        assert!(report.is_clean());
        assert_eq!(report.rows_sent, 1);
        assert!(h.central.store().get_record(&TableName::WORKER, "w-1").await.unwrap().is_some());
        assert!(h.edge_store.get_record(&TableName::TASK, "t-1").await.unwrap().is_some());
        assert_eq!(report.stage(Stage::RefreshViews), Some(&StageOutcome::Skipped));

        let peer = h.edge_store.get_peer(&central_id()).await.unwrap().unwrap();
        assert!(peer.token.is_some());
        assert_eq!(
            h.edge_store
                .get_checkpoint(&central_id(), &TableName::WORKER, Direction::Sent)
                .await
                .unwrap(),
            Timestamp::from_millis(20)
        );
    }

    #[tokio::test]
    async fn test_send_runs_in_rounds_and_marks_submitted() {
        let h = harness().await;
        for i in 0..5 {
            let row = Record::new(format!("a-{}", i), Timestamp::from_millis(i + 1))
                .with("status", "completed");
            h.edge_store
                .put_record(&TableName::MICROTASK_ASSIGNMENT, &row)
                .await
                .unwrap();
        }

        let transport = Arc::new(h.network.transport(PeerId::new("box-1"), Tier::Edge));
        let config = SyncConfig {
            batch_limit: 2,
            ..SyncConfig::default()
        };
        let orch = orchestrator(&h, transport, config);
        let report = completed(orch.run_cycle(&central_id()).await);

        assert_eq!(report.rows_sent, 5);
        assert_eq!(
            h.central
                .store()
                .count_records(&TableName::MICROTASK_ASSIGNMENT)
                .await
                .unwrap(),
            5
        );
        let local = h
            .edge_store
            .get_record(&TableName::MICROTASK_ASSIGNMENT, "a-0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.get_str("status"), Some("submitted"));
        assert_eq!(local.last_updated_at().unwrap(), Timestamp::from_millis(1));
    }

    #[tokio::test]
    async fn test_offline_peer_aborts_cycle() {
        let h = harness().await;
        h.network.set_offline(&central_id(), true).await;

        let transport = Arc::new(h.network.transport(PeerId::new("box-1"), Tier::Edge));
        let orch = orchestrator(&h, transport, SyncConfig::default());
        assert!(matches!(orch.run_cycle(&central_id()).await, CycleOutcome::Aborted(_)));
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_unknown_peer_aborts_cycle() {
        let h = harness().await;
        let transport = Arc::new(h.network.transport(PeerId::new("box-1"), Tier::Edge));
        let orch = orchestrator(&h, transport, SyncConfig::default());
        assert!(matches!(
            orch.run_cycle(&PeerId::new("elsewhere")).await,
            CycleOutcome::Aborted(_)
        ));
    }

    struct CountingRefresher(AtomicUsize);

    #[async_trait]
    impl ViewRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_view_refresh_runs_when_enabled() {
        let h = harness().await;
        let refresher = Arc::new(CountingRefresher(AtomicUsize::new(0)));
        let transport = Arc::new(h.network.transport(PeerId::new("box-1"), Tier::Edge));
        let config = SyncConfig {
            refresh_views: true,
            ..SyncConfig::default()
        };
        let orch = orchestrator(&h, transport, config).with_view_refresher(refresher.clone());

        let report = completed(orch.run_cycle(&central_id()).await);
        assert_eq!(report.stage(Stage::RefreshViews), Some(&StageOutcome::Completed));
        assert_eq!(refresher.0.load(Ordering::SeqCst), 1);
    }

    /// Holds credential renewal until released.
    struct GatedTransport {
        inner: MemoryTransport,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn renew_token(&self, peer: &SyncPeer) -> Result<RenewedToken> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.renew_token(peer).await
        }

        async fn push_updates(&self, peer: &SyncPeer, payload: Bytes) -> Result<()> {
            self.inner.push_updates(peer, payload).await
        }

        async fn pull_updates(&self, peer: &SyncPeer, from: Timestamp, limit: usize) -> Result<Bytes> {
            self.inner.pull_updates(peer, from, limit).await
        }

        async fn upload_file(
            &self,
            peer: &SyncPeer,
            sidecar: &FileSidecar,
            contents: Bytes,
        ) -> Result<UploadOutcome> {
            self.inner.upload_file(peer, sidecar, contents).await
        }

        async fn file_access(&self, peer: &SyncPeer, file_id: &str) -> Result<FileRecord> {
            self.inner.file_access(peer, file_id).await
        }

        async fn download(&self, peer: &SyncPeer, url: &str) -> Result<Bytes> {
            self.inner.download(peer, url).await
        }

        fn local_node_id(&self) -> PeerId {
            self.inner.local_node_id()
        }
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_refused() {
        let h = harness().await;
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let transport = Arc::new(GatedTransport {
            inner: h.network.transport(PeerId::new("box-1"), Tier::Edge),
            entered: entered.clone(),
            release: release.clone(),
        });
        let orch = Arc::new(orchestrator(&h, transport, SyncConfig::default()));

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_cycle(&central_id()).await })
        };
        entered.notified().await;
        assert!(orch.is_running());

        assert!(matches!(
            orch.run_cycle(&central_id()).await,
            CycleOutcome::AlreadyRunning
        ));

        release.notify_one();
        completed(first.await.unwrap());
        assert!(!orch.is_running());
    }
}
