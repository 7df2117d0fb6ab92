//! Attachment storage and transfer.
//!
//! Bytes live on disk under `<root>/<container>/<name>`. A file is only ever
//! marked present after its bytes hash to the declared checksum; downloads
//! land in a `.part` file that is renamed into place once verified.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use karya_sync_core::{Checksum, ChecksumAlgorithm, ChecksumHasher, FileRecord};
use karya_sync_store::{FileFilter, Store, SyncPeer};

use crate::endpoint::UploadOutcome;
use crate::error::{Result, SyncError};
use crate::transport::Transport;

const READ_CHUNK: usize = 64 * 1024;

/// Local attachment directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

fn check_segment(segment: &str) -> Result<()> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0']);
    if bad {
        return Err(SyncError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the on-disk path of an attachment.
    pub fn path_for(&self, container: &str, name: &str) -> Result<PathBuf> {
        check_segment(container)?;
        check_segment(name)?;
        Ok(self.root.join(container).join(name))
    }

    pub async fn exists(&self, container: &str, name: &str) -> Result<bool> {
        let path = self.path_for(container, name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Hash the stored bytes, or `None` if there are none.
    pub async fn checksum(
        &self,
        container: &str,
        name: &str,
        algorithm: ChecksumAlgorithm,
    ) -> Result<Option<Checksum>> {
        let path = self.path_for(container, name)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut hasher = ChecksumHasher::new(algorithm);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Some(hasher.finalize()))
    }

    pub async fn read(&self, container: &str, name: &str) -> Result<Bytes> {
        let path = self.path_for(container, name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SyncError::NotFound(format!("{}/{}", container, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write `contents` and keep them only if they hash to `declared`.
    ///
    /// On mismatch nothing is left on disk and the previous copy, if any, is
    /// untouched.
    pub async fn write_verified(
        &self,
        file_id: &str,
        container: &str,
        name: &str,
        declared: &Checksum,
        contents: &[u8],
    ) -> Result<Checksum> {
        let path = self.path_for(container, name)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let part = path.with_file_name(format!("{}.part", name));

        let mut hasher = ChecksumHasher::new(declared.algorithm());
        let mut out = tokio::fs::File::create(&part).await?;
        for chunk in contents.chunks(READ_CHUNK) {
            hasher.update(chunk);
            out.write_all(chunk).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        let computed = hasher.finalize();
        if computed != *declared {
            tokio::fs::remove_file(&part).await?;
            return Err(SyncError::ChecksumMismatch {
                file_id: file_id.to_string(),
                declared: declared.as_hex().to_string(),
                computed: computed.as_hex().to_string(),
            });
        }

        tokio::fs::rename(&part, &path).await?;
        Ok(computed)
    }
}

/// Presence of one attachment during a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    NotPresent,
    Transferring,
    Present,
}

impl TransferState {
    pub fn begin(self) -> Self {
        match self {
            TransferState::Present => TransferState::Present,
            _ => TransferState::Transferring,
        }
    }

    pub fn finish(self, ok: bool) -> Self {
        match (self, ok) {
            (TransferState::Transferring, true) => TransferState::Present,
            (TransferState::Transferring, false) => TransferState::NotPresent,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
    RenewUrl,
}

/// Result of handling one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub id: String,
    pub direction: TransferDirection,
    /// Presence on the receiving side after the attempt.
    pub state: TransferState,
    /// The bytes were already there and nothing was transferred.
    pub deduplicated: bool,
    pub error: Option<String>,
}

/// Per-file outcomes of one transfer stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub outcomes: Vec<FileOutcome>,
}

impl TransferReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Moves attachments between this node and one peer.
#[derive(Clone)]
pub struct FileTransferManager {
    store: Arc<dyn Store>,
    storage: FileStorage,
    transport: Arc<dyn Transport>,
}

impl FileTransferManager {
    pub fn new(store: Arc<dyn Store>, storage: FileStorage, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            storage,
            transport,
        }
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    /// Push every file held here but not by the peer.
    pub async fn upload_pending(&self, peer: &SyncPeer) -> Result<TransferReport> {
        let mut report = TransferReport::default();

        for file in self.store.list_files(FileFilter::PendingUpload).await? {
            let state = TransferState::NotPresent.begin();
            let outcome = match self.upload_one(peer, &file).await {
                Ok(uploaded) => FileOutcome {
                    id: file.id.clone(),
                    direction: TransferDirection::Upload,
                    state: state.finish(true),
                    deduplicated: uploaded == UploadOutcome::AlreadyPresent,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(file_id = %file.id, "upload failed: {}", e);
                    FileOutcome {
                        id: file.id.clone(),
                        direction: TransferDirection::Upload,
                        state: state.finish(false),
                        deduplicated: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        tracing::info!(
            uploaded = report.succeeded(),
            failed = report.failed(),
            "upload stage finished"
        );
        Ok(report)
    }

    async fn upload_one(&self, peer: &SyncPeer, file: &FileRecord) -> Result<UploadOutcome> {
        let declared = file.declared_checksum()?;
        let computed = self
            .storage
            .checksum(&file.container_name, &file.name, file.algorithm)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("local bytes of file {}", file.id)))?;

        if computed != declared {
            return Err(SyncError::ChecksumMismatch {
                file_id: file.id.clone(),
                declared: declared.as_hex().to_string(),
                computed: computed.as_hex().to_string(),
            });
        }

        let contents = self.storage.read(&file.container_name, &file.name).await?;
        let uploaded = self
            .transport
            .upload_file(peer, &file.sidecar(), contents)
            .await?;

        self.update_file(file, |f| f.present_remotely = true).await?;
        Ok(uploaded)
    }

    /// Fetch a download URL for every file only the peer holds.
    pub async fn renew_urls(&self, peer: &SyncPeer) -> Result<TransferReport> {
        let mut report = TransferReport::default();

        for file in self.store.list_files(FileFilter::NeedsUrl).await? {
            let result: Result<()> = async {
                let access = self.transport.file_access(peer, &file.id).await?;
                let url = access
                    .url
                    .ok_or_else(|| SyncError::NotFound(format!("url for file {}", file.id)))?;
                self.update_file(&file, |f| f.url = Some(url)).await
            }
            .await;

            if let Err(e) = &result {
                tracing::warn!(file_id = %file.id, "url renewal failed: {}", e);
            }
            report.outcomes.push(FileOutcome {
                id: file.id.clone(),
                direction: TransferDirection::RenewUrl,
                state: TransferState::NotPresent,
                deduplicated: false,
                error: result.err().map(|e| e.to_string()),
            });
        }

        Ok(report)
    }

    /// Fetch every file that has a download URL and is not held here.
    pub async fn download_pending(&self, peer: &SyncPeer) -> Result<TransferReport> {
        let mut report = TransferReport::default();

        for file in self.store.list_files(FileFilter::PendingDownload).await? {
            let state = TransferState::NotPresent.begin();
            let outcome = match self.download_one(peer, &file).await {
                Ok(deduplicated) => FileOutcome {
                    id: file.id.clone(),
                    direction: TransferDirection::Download,
                    state: state.finish(true),
                    deduplicated,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(file_id = %file.id, "download failed: {}", e);
                    let mut error = e.to_string();
                    if let Err(clear) = self.update_file(&file, |f| f.url = None).await {
                        tracing::warn!(file_id = %file.id, "failed to clear stale url: {}", clear);
                        error = format!("{}; clearing url failed: {}", error, clear);
                    }
                    FileOutcome {
                        id: file.id.clone(),
                        direction: TransferDirection::Download,
                        state: state.finish(false),
                        deduplicated: false,
                        error: Some(error),
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        tracing::info!(
            downloaded = report.succeeded(),
            failed = report.failed(),
            "download stage finished"
        );
        Ok(report)
    }

    /// Returns `true` when the bytes were already on disk.
    async fn download_one(&self, peer: &SyncPeer, file: &FileRecord) -> Result<bool> {
        let declared = file.declared_checksum()?;

        let existing = self
            .storage
            .checksum(&file.container_name, &file.name, file.algorithm)
            .await?;
        if existing.as_ref() == Some(&declared) {
            tracing::debug!(file_id = %file.id, "bytes already present, skipping download");
            self.mark_present(file).await?;
            return Ok(true);
        }

        let url = file
            .url
            .as_deref()
            .ok_or_else(|| SyncError::NotFound(format!("url for file {}", file.id)))?;
        let contents = self.transport.download(peer, url).await?;
        self.storage
            .write_verified(&file.id, &file.container_name, &file.name, &declared, &contents)
            .await?;

        self.mark_present(file).await?;
        Ok(false)
    }

    async fn mark_present(&self, file: &FileRecord) -> Result<()> {
        self.update_file(file, |f| {
            f.present_locally = true;
            f.url = None;
        })
        .await
    }

    /// Re-read the row and apply `change` if its content is still the same.
    ///
    /// Presence updates never touch `last_updated_at`.
    async fn update_file(&self, seen: &FileRecord, change: impl FnOnce(&mut FileRecord)) -> Result<()> {
        let Some(mut current) = self.store.get_file(&seen.id).await? else {
            return Ok(());
        };
        if current.checksum != seen.checksum || current.algorithm != seen.algorithm {
            tracing::debug!(file_id = %seen.id, "file changed during transfer, leaving flags alone");
            return Ok(());
        }
        change(&mut current);
        self.store.put_file(&current).await?;
        Ok(())
    }
}
