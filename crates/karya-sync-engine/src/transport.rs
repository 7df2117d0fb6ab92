//! Transport abstraction for the sync protocol.
//!
//! The orchestrator only ever talks to an upstream peer through [`Transport`].
//! [`HttpTransport`] speaks the peer's HTTP API; [`memory::MemoryTransport`]
//! routes calls straight into in-process [`Endpoint`]s for tests.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use karya_sync_core::{codec, FileRecord, FileSidecar, PeerId, Timestamp};
use karya_sync_store::SyncPeer;

use crate::config::SyncConfig;
use crate::endpoint::{Endpoint, UploadOutcome};
use crate::error::{Result, SyncError};

/// Header carrying the caller's node id.
pub const PEER_ID_HEADER: &str = "peer-id";
/// Header carrying the caller's credential.
pub const TOKEN_HEADER: &str = "id-token";

/// A credential handed out by an upstream peer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewedToken {
    #[serde(alias = "id_token")]
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
}

impl fmt::Debug for RenewedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewedToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Calls a node makes against its upstream peer.
///
/// Every call carries the caller's identity and the peer's current token.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Exchange the current credential for a fresh one.
    async fn renew_token(&self, peer: &SyncPeer) -> Result<RenewedToken>;

    /// Deliver an encoded list of change batches.
    async fn push_updates(&self, peer: &SyncPeer, payload: Bytes) -> Result<()>;

    /// Fetch an encoded list of change batches newer than `from`.
    async fn pull_updates(&self, peer: &SyncPeer, from: Timestamp, limit: usize) -> Result<Bytes>;

    /// Upload the bytes of one attachment.
    async fn upload_file(
        &self,
        peer: &SyncPeer,
        sidecar: &FileSidecar,
        contents: Bytes,
    ) -> Result<UploadOutcome>;

    /// Look up a file record, including a fresh download URL.
    async fn file_access(&self, peer: &SyncPeer, file_id: &str) -> Result<FileRecord>;

    /// Fetch the bytes behind a download URL.
    async fn download(&self, peer: &SyncPeer, url: &str) -> Result<Bytes>;

    /// Get the local node's identity.
    fn local_node_id(&self) -> PeerId;
}

/// HTTP transport backed by `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    node_id: PeerId,
}

fn map_request_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout(e.to_string())
    } else if e.is_decode() {
        SyncError::MalformedPayload(e.to_string())
    } else {
        SyncError::Connectivity(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(SyncError::NotAuthorized(format!("{}: {}", status, message)));
    }
    Err(SyncError::Rejected {
        status: status.as_u16(),
        message,
    })
}

impl HttpTransport {
    pub fn new(node_id: PeerId, config: &SyncConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Connectivity(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, node_id })
    }

    fn url(peer: &SyncPeer, path: &str) -> String {
        format!("{}/{}", peer.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, request: reqwest::RequestBuilder, peer: &SyncPeer) -> reqwest::RequestBuilder {
        let request = request.header(PEER_ID_HEADER, self.node_id.as_str());
        match &peer.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(map_request_error)?;
        check_status(response).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn renew_token(&self, peer: &SyncPeer) -> Result<RenewedToken> {
        let request = self.authed(self.client.get(Self::url(peer, "renew-token")), peer);
        let response = self.send(request).await?;
        response.json().await.map_err(map_request_error)
    }

    async fn push_updates(&self, peer: &SyncPeer, payload: Bytes) -> Result<()> {
        let request = self
            .authed(self.client.post(Self::url(peer, "updates")), peer)
            .header(reqwest::header::CONTENT_TYPE, codec::CONTENT_TYPE)
            .body(payload);
        self.send(request).await?;
        Ok(())
    }

    async fn pull_updates(&self, peer: &SyncPeer, from: Timestamp, limit: usize) -> Result<Bytes> {
        let request = self
            .authed(self.client.get(Self::url(peer, "updates")), peer)
            .query(&[("from", from.to_rfc3339()), ("limit", limit.to_string())]);
        let response = self.send(request).await?;
        response.bytes().await.map_err(map_request_error)
    }

    async fn upload_file(
        &self,
        peer: &SyncPeer,
        sidecar: &FileSidecar,
        contents: Bytes,
    ) -> Result<UploadOutcome> {
        let data = serde_json::to_string(sidecar).map_err(|e| SyncError::Encoding(e.to_string()))?;
        let file = reqwest::multipart::Part::bytes(contents.to_vec())
            .file_name(sidecar.name.clone())
            .mime_str(codec::CONTENT_TYPE)
            .map_err(|e| SyncError::Encoding(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("data", data)
            .part("file", file);

        let request = self
            .authed(self.client.put(Self::url(peer, "upload-file")), peer)
            .multipart(form);
        let response = self.send(request).await?;
        let body = response.bytes().await.map_err(map_request_error)?;

        // Peers that answer with something else have still stored the bytes.
        Ok(serde_json::from_slice(&body).unwrap_or(UploadOutcome::Stored))
    }

    async fn file_access(&self, peer: &SyncPeer, file_id: &str) -> Result<FileRecord> {
        let path = format!("file/{}", file_id);
        let request = self.authed(self.client.get(Self::url(peer, &path)), peer);
        let response = self.send(request).await?;
        response.json().await.map_err(map_request_error)
    }

    async fn download(&self, peer: &SyncPeer, url: &str) -> Result<Bytes> {
        // Relative URLs point back at the peer and need our credential;
        // absolute ones are pre-signed.
        let request = if url.starts_with('/') {
            self.authed(self.client.get(Self::url(peer, url.trim_start_matches('/'))), peer)
        } else {
            self.client.get(url)
        };
        let response = self.send(request).await?;
        response.bytes().await.map_err(map_request_error)
    }

    fn local_node_id(&self) -> PeerId {
        self.node_id.clone()
    }
}

/// An in-process transport for testing.
///
/// Each registered [`Endpoint`] plays the server side of one peer. Peers can
/// be taken offline to simulate lost connectivity.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use karya_sync_core::Tier;
    use tokio::sync::RwLock;

    /// URL scheme of download links handed out by in-process endpoints.
    pub const SCHEME: &str = "memory://";

    /// Shared state for the memory transport network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        endpoints: RwLock<HashMap<PeerId, Arc<Endpoint>>>,
        offline: RwLock<HashSet<PeerId>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make an endpoint reachable under its own id.
        pub async fn register(&self, endpoint: Arc<Endpoint>) {
            self.endpoints
                .write()
                .await
                .insert(endpoint.id().clone(), endpoint);
        }

        /// Cut or restore connectivity to one peer.
        pub async fn set_offline(&self, peer: &PeerId, offline: bool) {
            let mut set = self.offline.write().await;
            if offline {
                set.insert(peer.clone());
            } else {
                set.remove(peer);
            }
        }

        /// Create a transport for a node of the given tier.
        pub fn transport(self: &Arc<Self>, node_id: PeerId, tier: Tier) -> MemoryTransport {
            MemoryTransport {
                node_id,
                tier,
                network: Arc::clone(self),
            }
        }

        async fn reach(&self, peer: &PeerId) -> Result<Arc<Endpoint>> {
            if self.offline.read().await.contains(peer) {
                return Err(SyncError::Connectivity(format!("peer {} is offline", peer)));
            }
            self.endpoints
                .read()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| SyncError::Connectivity(format!("peer {} not found", peer)))
        }
    }

    /// In-memory transport implementation.
    #[derive(Clone)]
    pub struct MemoryTransport {
        node_id: PeerId,
        tier: Tier,
        network: Arc<MemoryNetwork>,
    }

    impl MemoryTransport {
        async fn authorized(&self, peer: &SyncPeer) -> Result<Arc<Endpoint>> {
            let endpoint = self.network.reach(&peer.id).await?;
            endpoint
                .authorize(&self.node_id, peer.token.as_deref())
                .await?;
            Ok(endpoint)
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn renew_token(&self, peer: &SyncPeer) -> Result<RenewedToken> {
            self.authorized(peer).await?.renew_token(&self.node_id).await
        }

        async fn push_updates(&self, peer: &SyncPeer, payload: Bytes) -> Result<()> {
            let endpoint = self.authorized(peer).await?;
            endpoint
                .accept_updates(&self.node_id, self.tier, &payload)
                .await?;
            Ok(())
        }

        async fn pull_updates(&self, peer: &SyncPeer, from: Timestamp, limit: usize) -> Result<Bytes> {
            self.authorized(peer)
                .await?
                .updates_for(&self.node_id, self.tier, from, limit)
                .await
        }

        async fn upload_file(
            &self,
            peer: &SyncPeer,
            sidecar: &FileSidecar,
            contents: Bytes,
        ) -> Result<UploadOutcome> {
            let endpoint = self.authorized(peer).await?;
            endpoint.accept_upload(sidecar, &contents).await
        }

        async fn file_access(&self, peer: &SyncPeer, file_id: &str) -> Result<FileRecord> {
            self.authorized(peer).await?.file_access(file_id).await
        }

        async fn download(&self, _peer: &SyncPeer, url: &str) -> Result<Bytes> {
            let path = url
                .strip_prefix(SCHEME)
                .ok_or_else(|| SyncError::NotFound(format!("unsupported url {}", url)))?;
            let mut parts = path.splitn(3, '/');
            let (Some(host), Some(container), Some(name)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(SyncError::NotFound(format!("malformed url {}", url)));
            };

            let endpoint = self.network.reach(&PeerId::new(host)).await?;
            endpoint.read_file(container, name).await
        }

        fn local_node_id(&self) -> PeerId {
            self.node_id.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use std::sync::Arc;

    use karya_sync_core::{ChangeBatch, Checksum, ChecksumAlgorithm, Record, TableName, Tier};
    use karya_sync_store::{MemoryStore, Store};

    use crate::files::FileStorage;
    use crate::registry::TableRegistry;

    async fn central(network: &Arc<MemoryNetwork>, root: &std::path::Path) -> Arc<Endpoint> {
        let endpoint = Arc::new(Endpoint::new(
            PeerId::new("central"),
            Tier::Central,
            Arc::new(MemoryStore::new()),
            FileStorage::new(root),
            Arc::new(TableRegistry::standard()),
        ));
        network.register(endpoint.clone()).await;
        endpoint
    }

    fn peer() -> SyncPeer {
        SyncPeer::new(PeerId::new("central"), Tier::Central, "memory://central")
    }

    #[test]
    fn test_renewed_token_accepts_id_token_field() {
        let token: RenewedToken =
            serde_json::from_str(r#"{"id_token":"abc","expires_at":"2030-01-01T00:00:00.000Z"}"#)
                .unwrap();
        assert_eq!(token.token, "abc");
        assert!(token.expires_at.is_some());
        assert!(!format!("{:?}", token).contains("abc"));
    }

    #[tokio::test]
    async fn test_memory_transport_push_and_pull() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let endpoint = central(&network, dir.path()).await;
        let transport = network.transport(PeerId::new("box-1"), Tier::Edge);

        let row = Record::new("w-1", Timestamp::from_millis(5)).with("full_name", "Asha");
        let payload = codec::encode(&[ChangeBatch::new(TableName::WORKER, vec![row])]).unwrap();
        transport.push_updates(&peer(), payload).await.unwrap();
        assert_eq!(endpoint.store().count_records(&TableName::WORKER).await.unwrap(), 1);

        let pulled = transport.pull_updates(&peer(), Timestamp::EPOCH, 10).await.unwrap();
        let batches = codec::decode(&pulled).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].table_name, TableName::WORKER);
    }

    #[tokio::test]
    async fn test_offline_peer_is_a_connectivity_error() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        central(&network, dir.path()).await;
        network.set_offline(&PeerId::new("central"), true).await;

        let transport = network.transport(PeerId::new("box-1"), Tier::Edge);
        let err = transport.renew_token(&peer()).await.unwrap_err();
        assert!(err.is_connectivity());

        network.set_offline(&PeerId::new("central"), false).await;
        assert!(transport.renew_token(&peer()).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_token_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        central(&network, dir.path()).await;
        let transport = network.transport(PeerId::new("box-1"), Tier::Edge);

        let token = transport.renew_token(&peer()).await.unwrap();
        let stale = peer().with_token("not-the-token");
        assert!(matches!(
            transport.pull_updates(&stale, Timestamp::EPOCH, 10).await,
            Err(SyncError::NotAuthorized(_))
        ));

        let fresh = peer().with_token(token.token);
        assert!(transport.pull_updates(&fresh, Timestamp::EPOCH, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_two_callers_renew_independently() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        central(&network, dir.path()).await;
        let first = network.transport(PeerId::new("box-1"), Tier::Edge);
        let second = network.transport(PeerId::new("box-2"), Tier::Edge);

        let token_1 = first.renew_token(&peer()).await.unwrap();
        let token_2 = second.renew_token(&peer()).await.unwrap();

        let as_first = peer().with_token(token_1.token);
        let as_second = peer().with_token(token_2.token);
        assert!(first.pull_updates(&as_first, Timestamp::EPOCH, 10).await.is_ok());
        assert!(second.pull_updates(&as_second, Timestamp::EPOCH, 10).await.is_ok());
        assert!(matches!(
            second.pull_updates(&as_first, Timestamp::EPOCH, 10).await,
            Err(SyncError::NotAuthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_download_follows_file_access_url() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let endpoint = central(&network, dir.path()).await;
        let transport = network.transport(PeerId::new("box-1"), Tier::Edge);

        let checksum = Checksum::compute(ChecksumAlgorithm::Md5, b"audio");
        let file = karya_sync_core::FileRecord::new("f-1", "in", "f-1.wav", &checksum, Timestamp::from_millis(1));
        let outcome = transport
            .upload_file(&peer(), &file.sidecar(), Bytes::from_static(b"audio"))
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Stored);
        assert!(endpoint.storage().exists("in", "f-1.wav").await.unwrap());

        let access = transport.file_access(&peer(), "f-1").await.unwrap();
        let url = access.url.unwrap();
        assert_eq!(url, "memory://central/in/f-1.wav");
        assert_eq!(transport.download(&peer(), &url).await.unwrap(), Bytes::from_static(b"audio"));
    }
}
