//! Test fixtures and helpers.
//!
//! Row builders for the Karya tables and a [`TestFixture`] that runs several
//! nodes on one in-memory network, each with its own temporary database and
//! attachment directory.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;

use karya_sync::{Node, NodeConfig, PeerConfig};
use karya_sync_core::{
    codec, AssignmentStatus, ChangeBatch, Checksum, ChecksumAlgorithm, FileRecord, FileSidecar,
    PeerId, Record, TableName, Tier, Timestamp,
};
use karya_sync_engine::transport::memory::{MemoryNetwork, MemoryTransport};
use karya_sync_engine::{
    CycleOutcome, CycleReport, RenewedToken, Result as EngineResult, SyncConfig, Transport,
    UploadOutcome,
};
use karya_sync_store::{Store, SyncPeer};

/// Container holding recorded worker output.
pub const OUTPUT_CONTAINER: &str = "microtask-assignment-output";

// ─────────────────────────────────────────────────────────────────────────────
// Row builders
// ─────────────────────────────────────────────────────────────────────────────

pub fn task(id: &str, at: Timestamp) -> Record {
    Record::new(id, at)
        .with("name", format!("task {}", id))
        .with("scenario_name", "speech-data")
}

pub fn microtask(id: &str, task_id: &str, at: Timestamp) -> Record {
    Record::new(id, at)
        .with("task_id", task_id)
        .with("input", json!({ "sentence": format!("sentence for {}", id) }))
}

pub fn worker(id: &str, box_id: &str, at: Timestamp) -> Record {
    Record::new(id, at)
        .with("box_id", box_id)
        .with("access_code", format!("code-{}", id))
}

pub fn assignment(
    id: &str,
    microtask_id: &str,
    worker_id: &str,
    status: AssignmentStatus,
    at: Timestamp,
) -> Record {
    Record::new(id, at)
        .with("microtask_id", microtask_id)
        .with("worker_id", worker_id)
        .with("status", status.as_str())
}

/// Metadata for `contents`, stored under [`OUTPUT_CONTAINER`].
pub fn file_record(id: &str, contents: &[u8], at: Timestamp) -> FileRecord {
    let checksum = Checksum::compute(ChecksumAlgorithm::Md5, contents);
    FileRecord::new(id, OUTPUT_CONTAINER, format!("{}.tgz", id), &checksum, at)
}

// ─────────────────────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────────────────────

/// Several nodes sharing one in-memory network.
pub struct TestFixture {
    network: Arc<MemoryNetwork>,
    dir: TempDir,
    sync: SyncConfig,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_sync_config(SyncConfig::default())
    }

    pub fn with_sync_config(sync: SyncConfig) -> Self {
        Self {
            network: MemoryNetwork::new(),
            dir: tempfile::tempdir().expect("failed to create temp dir"),
            sync,
        }
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// An in-memory transport speaking for node `id`.
    pub fn transport(&self, id: &str, tier: Tier) -> MemoryTransport {
        self.network.transport(PeerId::new(id), tier)
    }

    /// The config a fixture node is opened with.
    pub fn config(&self, id: &str, tier: Tier, upstream: Option<&Node>) -> NodeConfig {
        let mut config = NodeConfig::new(tier, PeerId::new(id));
        config.database_path = self.root().join(id).join("sync.db");
        config.files_root = self.root().join(id).join("files");
        config.sync = self.sync.clone();
        if let Some(up) = upstream {
            config.peers.push(PeerConfig {
                id: up.id().clone(),
                tier: up.tier(),
                base_url: format!("memory://{}", up.id()),
                token: None,
            });
        }
        config
    }

    /// Open a node and make its endpoint reachable.
    pub async fn node(&self, id: &str, tier: Tier, upstream: Option<&Node>) -> Node {
        let transport = Arc::new(self.transport(id, tier));
        self.node_with_transport(id, tier, upstream, transport).await
    }

    pub async fn node_with_transport(
        &self,
        id: &str,
        tier: Tier,
        upstream: Option<&Node>,
        transport: Arc<dyn Transport>,
    ) -> Node {
        let node = Node::with_transport(self.config(id, tier, upstream), transport)
            .await
            .expect("failed to open test node");
        self.network.register(node.endpoint().clone()).await;
        node
    }

    pub async fn set_offline(&self, node: &Node, offline: bool) {
        self.network.set_offline(node.id(), offline).await;
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Store rows directly, as local application code would.
pub async fn put_rows(node: &Node, table: &TableName, rows: &[Record]) {
    let store = node.store();
    for row in rows {
        store.put_record(table, row).await.expect("failed to store row");
    }
}

/// Write `contents` to the node's attachment directory and store a record
/// marking them present locally.
pub async fn record_local_file(node: &Node, id: &str, contents: &[u8], at: Timestamp) -> FileRecord {
    let mut file = file_record(id, contents, at);
    let declared = file.declared_checksum().expect("valid checksum");
    node.storage()
        .write_verified(&file.id, &file.container_name, &file.name, &declared, contents)
        .await
        .expect("failed to write file");
    file.present_locally = true;
    node.store().put_file(&file).await.expect("failed to store file record");
    file
}

/// Unwrap a completed cycle.
pub fn completed(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {:?}", other),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport wrappers
// ─────────────────────────────────────────────────────────────────────────────

/// Records every pushed payload before delivering it.
pub struct RecordingTransport {
    inner: Arc<dyn Transport>,
    pushed: Mutex<Vec<Vec<ChangeBatch>>>,
}

impl RecordingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            pushed: Mutex::new(Vec::new()),
        }
    }

    /// Decoded payloads, one per push, oldest first.
    pub fn pushes(&self) -> Vec<Vec<ChangeBatch>> {
        self.pushed.lock().expect("lock poisoned").clone()
    }

    pub fn clear(&self) {
        self.pushed.lock().expect("lock poisoned").clear();
    }
}

/// Holds credential renewal until released, so a cycle can be kept open.
pub struct GatedTransport {
    inner: Arc<dyn Transport>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl GatedTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    /// Resolves once a cycle is waiting at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn renew_token(&self, peer: &SyncPeer) -> EngineResult<RenewedToken> {
        self.inner.renew_token(peer).await
    }

    async fn push_updates(&self, peer: &SyncPeer, payload: Bytes) -> EngineResult<()> {
        let batches = codec::decode(&payload)?;
        self.pushed.lock().expect("lock poisoned").push(batches);
        self.inner.push_updates(peer, payload).await
    }

    async fn pull_updates(&self, peer: &SyncPeer, from: Timestamp, limit: usize) -> EngineResult<Bytes> {
        self.inner.pull_updates(peer, from, limit).await
    }

    async fn upload_file(
        &self,
        peer: &SyncPeer,
        sidecar: &FileSidecar,
        contents: Bytes,
    ) -> EngineResult<UploadOutcome> {
        self.inner.upload_file(peer, sidecar, contents).await
    }

    async fn file_access(&self, peer: &SyncPeer, file_id: &str) -> EngineResult<FileRecord> {
        self.inner.file_access(peer, file_id).await
    }

    async fn download(&self, peer: &SyncPeer, url: &str) -> EngineResult<Bytes> {
        self.inner.download(peer, url).await
    }

    fn local_node_id(&self) -> PeerId {
        self.inner.local_node_id()
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn renew_token(&self, peer: &SyncPeer) -> EngineResult<RenewedToken> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.renew_token(peer).await
    }

    async fn push_updates(&self, peer: &SyncPeer, payload: Bytes) -> EngineResult<()> {
        self.inner.push_updates(peer, payload).await
    }

    async fn pull_updates(&self, peer: &SyncPeer, from: Timestamp, limit: usize) -> EngineResult<Bytes> {
        self.inner.pull_updates(peer, from, limit).await
    }

    async fn upload_file(
        &self,
        peer: &SyncPeer,
        sidecar: &FileSidecar,
        contents: Bytes,
    ) -> EngineResult<UploadOutcome> {
        self.inner.upload_file(peer, sidecar, contents).await
    }

    async fn file_access(&self, peer: &SyncPeer, file_id: &str) -> EngineResult<FileRecord> {
        self.inner.file_access(peer, file_id).await
    }

    async fn download(&self, peer: &SyncPeer, url: &str) -> EngineResult<Bytes> {
        self.inner.download(peer, url).await
    }

    fn local_node_id(&self) -> PeerId {
        self.inner.local_node_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_builders() {
        let at = Timestamp::from_millis(1_000);
        let row = assignment("a-1", "m-1", "w-1", AssignmentStatus::Completed, at);
        assert_eq!(row.id().unwrap(), "a-1");
        assert_eq!(row.status().unwrap(), Some(AssignmentStatus::Completed));
        assert_eq!(microtask("m-1", "t-1", at).get_str("task_id"), Some("t-1"));

        let file = file_record("f-1", b"audio", at);
        assert_eq!(file.checksum.len(), 32);
        assert_eq!(file.container_name, OUTPUT_CONTAINER);
    }

    #[tokio::test]
    async fn test_fixture_nodes_are_isolated() {
        let fixture = TestFixture::new();
        let central = fixture.node("central", Tier::Central, None).await;
        let edge = fixture.node("box-1", Tier::Edge, Some(&central)).await;

        put_rows(&central, &TableName::TASK, &[task("t-1", Timestamp::from_millis(1))]).await;
        assert_eq!(edge.store().count_records(&TableName::TASK).await.unwrap(), 0);

        let peers = edge.store().list_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, PeerId::new("central"));
    }

    #[tokio::test]
    async fn test_record_local_file_marks_presence() {
        let fixture = TestFixture::new();
        let node = fixture.node("phone-1", Tier::Client, None).await;

        let file = record_local_file(&node, "f-1", b"audio", Timestamp::from_millis(5)).await;
        assert!(node.storage().exists(OUTPUT_CONTAINER, &file.name).await.unwrap());
        assert!(node.store().get_file("f-1").await.unwrap().unwrap().present_locally);
    }
}
