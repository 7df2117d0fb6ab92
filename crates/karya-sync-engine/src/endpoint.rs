//! The serving side of sync.
//!
//! An [`Endpoint`] answers the calls a downstream node makes: it hands out
//! pages of changes, applies pushed batches, stores verified uploads and
//! issues download URLs. It knows nothing about HTTP; a server or the
//! in-memory transport sits in front of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use karya_sync_core::{codec, ChangeBatch, FileRecord, FileSidecar, PeerId, Tier, Timestamp};
use karya_sync_store::Store;

use crate::applier::{ApplyReport, RecordApplier};
use crate::collector::ChangeCollector;
use crate::error::{Result, SyncError};
use crate::files::FileStorage;
use crate::registry::TableRegistry;
use crate::transport::{memory, RenewedToken};

/// How long an issued credential stays valid.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// What happened to an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    /// The bytes were verified and written.
    Stored,
    /// Verified bytes with the same checksum were already held.
    AlreadyPresent,
}

/// Server side of one node.
pub struct Endpoint {
    id: PeerId,
    tier: Tier,
    store: Arc<dyn Store>,
    storage: FileStorage,
    registry: Arc<TableRegistry>,
    applier: RecordApplier,
    collector: ChangeCollector,
    url_base: String,
    /// Current credential of each downstream node that has renewed one.
    tokens: Mutex<HashMap<PeerId, String>>,
}

impl Endpoint {
    pub fn new(
        id: PeerId,
        tier: Tier,
        store: Arc<dyn Store>,
        storage: FileStorage,
        registry: Arc<TableRegistry>,
    ) -> Self {
        let url_base = format!("{}{}", memory::SCHEME, id);
        Self {
            applier: RecordApplier::new(store.clone(), registry.clone(), tier),
            collector: ChangeCollector::new(store.clone()),
            id,
            tier,
            store,
            storage,
            registry,
            url_base,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Prefix of the download URLs handed out by [`Endpoint::file_access`].
    pub fn with_url_base(mut self, url_base: impl Into<String>) -> Self {
        self.url_base = url_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    /// Issue a fresh random credential to `caller`, replacing its previous one.
    pub async fn renew_token(&self, caller: &PeerId) -> Result<RenewedToken> {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let token = hex::encode(bytes);
        self.tokens.lock().await.insert(caller.clone(), token.clone());

        let lifetime = i64::try_from(TOKEN_LIFETIME.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Timestamp::from_millis(Timestamp::now().as_millis().saturating_add(lifetime));
        tracing::debug!(endpoint = %self.id, caller = %caller, "issued credential");
        Ok(RenewedToken {
            token,
            expires_at: Some(expires_at),
        })
    }

    /// Check the credential `caller` presented.
    ///
    /// A caller that has never renewed is let through, so a freshly
    /// provisioned node can obtain its first token.
    pub async fn authorize(&self, caller: &PeerId, presented: Option<&str>) -> Result<()> {
        match self.tokens.lock().await.get(caller) {
            None => Ok(()),
            Some(current) if presented == Some(current.as_str()) => Ok(()),
            Some(_) => Err(SyncError::NotAuthorized(format!(
                "credential of {} refused by {}",
                caller, self.id
            ))),
        }
    }

    /// One page per table of the rows `caller` may see that changed after
    /// `from`, encoded.
    ///
    /// Tables with nothing new are left out of the payload.
    pub async fn updates_for(
        &self,
        caller: &PeerId,
        caller_tier: Tier,
        from: Timestamp,
        limit: usize,
    ) -> Result<Bytes> {
        let until = Timestamp::now();
        let limit = limit.max(1);
        let mut batches = Vec::new();

        for spec in self.registry.iter() {
            let scope = spec.scope_for(caller_tier, caller);
            let page = self
                .collector
                .collect_scoped(&spec.name, scope.as_ref(), from, until, limit)
                .await?;
            if !page.rows.is_empty() {
                batches.push(ChangeBatch::new(spec.name.clone(), page.rows));
            }
        }

        tracing::debug!(
            endpoint = %self.id,
            caller = %caller,
            tables = batches.len(),
            rows = batches.iter().map(ChangeBatch::len).sum::<usize>(),
            "serving updates"
        );
        Ok(codec::encode(&batches)?)
    }

    /// Decode and apply a payload pushed by `caller`, a node of tier `sender`.
    ///
    /// A payload that does not decode is refused before anything is written.
    /// Rows `caller` does not own are rejected one by one.
    pub async fn accept_updates(
        &self,
        caller: &PeerId,
        sender: Tier,
        payload: &[u8],
    ) -> Result<Vec<ApplyReport>> {
        let batches = codec::decode(payload)?;

        let mut reports = Vec::with_capacity(batches.len());
        for batch in batches {
            let report = self
                .applier
                .apply_from_peer(sender, caller, &batch.table_name, batch.rows)
                .await;
            reports.push(report);
        }

        tracing::info!(
            endpoint = %self.id,
            caller = %caller,
            sender = %sender,
            applied = reports.iter().map(ApplyReport::applied_count).sum::<usize>(),
            rejected = reports.iter().map(ApplyReport::rejected_count).sum::<usize>(),
            failed = reports.iter().map(ApplyReport::failed_count).sum::<usize>(),
            "accepted updates"
        );
        Ok(reports)
    }

    /// Verify and store uploaded bytes, then mark the file present here.
    ///
    /// Bytes that do not match the declared checksum, or a sidecar that
    /// disagrees with the stored row, are refused and change nothing. If the
    /// metadata row has not arrived yet a placeholder is stored at the epoch
    /// so that the real row always wins when it does.
    pub async fn accept_upload(&self, sidecar: &FileSidecar, contents: &[u8]) -> Result<UploadOutcome> {
        let declared = sidecar.declared_checksum()?;
        let existing = self.store.get_file(&sidecar.id).await?;

        if let Some(file) = &existing {
            let recorded = file.declared_checksum()?;
            if recorded != declared {
                return Err(SyncError::ChecksumMismatch {
                    file_id: sidecar.id.clone(),
                    declared: recorded.as_hex().to_string(),
                    computed: declared.as_hex().to_string(),
                });
            }

            let on_disk = self
                .storage
                .checksum(&sidecar.container_name, &sidecar.name, declared.algorithm())
                .await?;
            if file.present_locally && on_disk.as_ref() == Some(&declared) {
                tracing::debug!(file_id = %sidecar.id, "upload already present");
                return Ok(UploadOutcome::AlreadyPresent);
            }
        }

        self.storage
            .write_verified(
                &sidecar.id,
                &sidecar.container_name,
                &sidecar.name,
                &declared,
                contents,
            )
            .await?;

        let mut file = existing.unwrap_or_else(|| {
            FileRecord::new(
                &sidecar.id,
                &sidecar.container_name,
                &sidecar.name,
                &declared,
                Timestamp::EPOCH,
            )
        });
        file.present_locally = true;
        self.store.put_file(&file).await?;

        tracing::info!(file_id = %sidecar.id, bytes = contents.len(), "stored upload");
        Ok(UploadOutcome::Stored)
    }

    /// The file row with a download URL filled in.
    pub async fn file_access(&self, file_id: &str) -> Result<FileRecord> {
        let mut file = self
            .store
            .get_file(file_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("file {}", file_id)))?;

        if !file.present_locally {
            return Err(SyncError::NotFound(format!("bytes of file {}", file_id)));
        }
        // Validates the path segments.
        self.storage.path_for(&file.container_name, &file.name)?;

        file.url = Some(format!("{}/{}/{}", self.url_base, file.container_name, file.name));
        Ok(file)
    }

    /// Bytes of a stored attachment.
    pub async fn read_file(&self, container: &str, name: &str) -> Result<Bytes> {
        self.storage.read(container, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karya_sync_core::{Checksum, ChecksumAlgorithm, Record, TableName};
    use karya_sync_store::MemoryStore;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    fn endpoint(dir: &std::path::Path, tier: Tier) -> Endpoint {
        Endpoint::new(
            PeerId::new("central"),
            tier,
            Arc::new(MemoryStore::new()),
            FileStorage::new(dir),
            Arc::new(TableRegistry::standard()),
        )
    }

    fn sidecar(id: &str, contents: &[u8]) -> FileSidecar {
        let sum = Checksum::compute(ChecksumAlgorithm::Md5, contents);
        FileRecord::new(id, "in", format!("{}.wav", id), &sum, Timestamp::from_millis(1)).sidecar()
    }

    #[tokio::test]
    async fn test_updates_skip_empty_tables() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Central);
        endpoint
            .store()
            .put_record(&TableName::TASK, &Record::new("t-1", Timestamp::from_millis(3)))
            .await
            .unwrap();

        let box_1 = peer("box-1");
        let batches = codec::decode(
            &endpoint.updates_for(&box_1, Tier::Edge, Timestamp::EPOCH, 10).await.unwrap(),
        )
        .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].table_name, TableName::TASK);

        let later = codec::decode(
            &endpoint
                .updates_for(&box_1, Tier::Edge, Timestamp::from_millis(3), 10)
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Central);

        let err = endpoint
            .accept_updates(&peer("box-1"), Tier::Edge, b"definitely not gzip")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedPayload(_)));
        assert_eq!(endpoint.store().count_records(&TableName::WORKER).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upload_mismatch_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Central);
        let sidecar = sidecar("f-1", b"expected bytes");

        let err = endpoint.accept_upload(&sidecar, b"other bytes").await.unwrap_err();
        assert!(matches!(err, SyncError::ChecksumMismatch { .. }));
        assert!(endpoint.store().get_file("f-1").await.unwrap().is_none());
        assert!(!endpoint.storage().exists("in", "f-1.wav").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_creates_placeholder_then_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Central);
        let sidecar = sidecar("f-1", b"audio");

        assert_eq!(endpoint.accept_upload(&sidecar, b"audio").await.unwrap(), UploadOutcome::Stored);
        let file = endpoint.store().get_file("f-1").await.unwrap().unwrap();
        assert!(file.present_locally);
        assert_eq!(file.last_updated_at, Timestamp::EPOCH);

        assert_eq!(
            endpoint.accept_upload(&sidecar, b"audio").await.unwrap(),
            UploadOutcome::AlreadyPresent
        );
    }

    #[tokio::test]
    async fn test_upload_keeps_existing_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Central);
        let sum = Checksum::compute(ChecksumAlgorithm::Md5, b"audio");
        let file = FileRecord::new("f-1", "in", "f-1.wav", &sum, Timestamp::from_millis(42));
        endpoint.store().put_file(&file).await.unwrap();

        endpoint.accept_upload(&file.sidecar(), b"audio").await.unwrap();
        let stored = endpoint.store().get_file("f-1").await.unwrap().unwrap();
        assert!(stored.present_locally);
        assert_eq!(stored.last_updated_at, Timestamp::from_millis(42));
    }

    #[tokio::test]
    async fn test_file_access_requires_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Central).with_url_base("https://files.example/");
        let sum = Checksum::compute(ChecksumAlgorithm::Md5, b"audio");
        let file = FileRecord::new("f-1", "in", "f-1.wav", &sum, Timestamp::from_millis(1));
        endpoint.store().put_file(&file).await.unwrap();

        assert!(matches!(endpoint.file_access("f-1").await, Err(SyncError::NotFound(_))));
        assert!(matches!(endpoint.file_access("nope").await, Err(SyncError::NotFound(_))));

        endpoint.accept_upload(&file.sidecar(), b"audio").await.unwrap();
        let access = endpoint.file_access("f-1").await.unwrap();
        assert_eq!(access.url.as_deref(), Some("https://files.example/in/f-1.wav"));
    }

    #[tokio::test]
    async fn test_authorize_before_and_after_renewal() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Central);
        let box_1 = peer("box-1");
        assert!(endpoint.authorize(&box_1, None).await.is_ok());

        let token = endpoint.renew_token(&box_1).await.unwrap();
        assert_eq!(token.token.len(), 64);
        assert!(token.expires_at.unwrap() > Timestamp::now());
        assert!(endpoint.authorize(&box_1, Some(&token.token)).await.is_ok());
        assert!(endpoint.authorize(&box_1, None).await.is_err());
    }

    #[tokio::test]
    async fn test_each_caller_keeps_its_own_credential() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Edge);
        let (phone_1, phone_2) = (peer("phone-1"), peer("phone-2"));

        let first = endpoint.renew_token(&phone_1).await.unwrap();
        let second = endpoint.renew_token(&phone_2).await.unwrap();
        assert_ne!(first.token, second.token);

        assert!(endpoint.authorize(&phone_1, Some(&first.token)).await.is_ok());
        assert!(endpoint.authorize(&phone_2, Some(&second.token)).await.is_ok());
        assert!(matches!(
            endpoint.authorize(&phone_1, Some(&second.token)).await,
            Err(SyncError::NotAuthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_updates_are_scoped_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Edge);
        let table = TableName::MICROTASK_ASSIGNMENT;
        for (id, worker) in [("a-1", "phone-1"), ("a-2", "phone-2")] {
            let row = Record::new(id, Timestamp::from_millis(5))
                .with("worker_id", worker)
                .with("status", "assigned");
            endpoint.store().put_record(&table, &row).await.unwrap();
        }
        endpoint
            .store()
            .put_record(&TableName::TASK, &Record::new("t-1", Timestamp::from_millis(5)))
            .await
            .unwrap();

        let batches = codec::decode(
            &endpoint
                .updates_for(&peer("phone-1"), Tier::Client, Timestamp::EPOCH, 10)
                .await
                .unwrap(),
        )
        .unwrap();
        let assignments = batches.iter().find(|b| b.table_name == table).unwrap();
        let ids: Vec<_> = assignments.rows.iter().map(|r| r.id().unwrap()).collect();
        assert_eq!(ids, vec!["a-1"]);
        assert!(batches.iter().any(|b| b.table_name == TableName::TASK));
    }

    #[tokio::test]
    async fn test_pushed_rows_of_another_phone_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path(), Tier::Edge);
        let table = TableName::MICROTASK_ASSIGNMENT;
        let rows = vec![
            Record::new("a-1", Timestamp::from_millis(5))
                .with("worker_id", "phone-1")
                .with("status", "completed"),
            Record::new("a-2", Timestamp::from_millis(6))
                .with("worker_id", "phone-2")
                .with("status", "completed"),
        ];
        let payload = codec::encode(&[ChangeBatch::new(table.clone(), rows)]).unwrap();

        let reports = endpoint
            .accept_updates(&peer("phone-1"), Tier::Client, &payload)
            .await
            .unwrap();
        assert_eq!(reports[0].applied_count(), 1);
        assert_eq!(reports[0].rejected_count(), 1);
        assert!(endpoint.store().get_record(&table, "a-1").await.unwrap().is_some());
        assert!(endpoint.store().get_record(&table, "a-2").await.unwrap().is_none());
    }
}
