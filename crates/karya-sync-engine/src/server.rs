//! HTTP front of an [`Endpoint`].
//!
//! Serves the routes [`HttpTransport`](crate::HttpTransport) calls. Every
//! request names its caller in the `peer-id` header and, once the caller has
//! renewed a credential, carries it in `id-token`. Callers are always one
//! tier below the serving node.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;

use karya_sync_core::{codec, FileRecord, FileSidecar, PeerId, Tier, Timestamp};

use crate::applier::ApplyReport;
use crate::endpoint::{Endpoint, UploadOutcome};
use crate::error::SyncError;
use crate::transport::{RenewedToken, PEER_ID_HEADER, TOKEN_HEADER};

/// Path prefix of the download URLs handed out over HTTP.
pub const FILES_PATH: &str = "/files";

/// Largest request body accepted, uploads included.
pub const MAX_BODY_BYTES: usize = 128 * 1024 * 1024;

/// Rows per table served when a pull names no limit.
pub const DEFAULT_PAGE_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Sync(e) => match e {
                SyncError::NotAuthorized(_) => StatusCode::UNAUTHORIZED,
                SyncError::NotFound(_) => StatusCode::NOT_FOUND,
                SyncError::MalformedPayload(_)
                | SyncError::ChecksumMismatch { .. }
                | SyncError::InvalidRecord(_)
                | SyncError::InvalidPath(_)
                | SyncError::UnknownTable(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ServerResult<T> = std::result::Result<T, ServerError>;

#[derive(Clone)]
pub struct ServerState {
    endpoint: Arc<Endpoint>,
}

/// The authenticated downstream node behind a request.
#[derive(Debug, Clone)]
struct Caller {
    id: PeerId,
    tier: Tier,
}

pub fn router(endpoint: Arc<Endpoint>) -> Router {
    let state = ServerState { endpoint };

    Router::new()
        .route("/renew-token", get(renew_token))
        .route("/updates", get(pull_updates).post(push_updates))
        .route("/upload-file", put(upload_file))
        .route("/file/{id}", get(file_access))
        .route("/files/{container}/{name}", get(file_bytes))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_caller))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Serve `endpoint` on `listener` until `shutdown` resolves.
pub async fn serve(
    endpoint: Arc<Endpoint>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> crate::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(endpoint = %endpoint.id(), %addr, "serving sync endpoint");
    axum::serve(listener, router(endpoint))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> ServerResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ServerError::BadRequest(format!("{} header is not text", name)))
        })
        .transpose()
}

async fn require_caller(
    State(state): State<ServerState>,
    mut request: Request,
    next: Next,
) -> ServerResult<Response> {
    let headers = request.headers();
    let id = header_str(headers, PEER_ID_HEADER)?
        .filter(|id| !id.is_empty())
        .map(PeerId::new)
        .ok_or_else(|| ServerError::Unauthorized(format!("missing {} header", PEER_ID_HEADER)))?;
    let token = header_str(headers, TOKEN_HEADER)?;

    let tier = state.endpoint.tier().below().ok_or_else(|| {
        ServerError::Unauthorized(format!("{} serves no downstream nodes", state.endpoint.id()))
    })?;
    state.endpoint.authorize(&id, token).await?;

    request.extensions_mut().insert(Caller { id, tier });
    Ok(next.run(request).await)
}

async fn renew_token(
    State(state): State<ServerState>,
    Extension(caller): Extension<Caller>,
) -> ServerResult<Json<RenewedToken>> {
    Ok(Json(state.endpoint.renew_token(&caller.id).await?))
}

#[derive(Debug, Deserialize)]
struct UpdatesQuery {
    from: Option<String>,
    limit: Option<usize>,
}

async fn pull_updates(
    State(state): State<ServerState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<UpdatesQuery>,
) -> ServerResult<Response> {
    let from = match query.from.as_deref() {
        Some(raw) => raw
            .parse::<Timestamp>()
            .map_err(|e| ServerError::BadRequest(format!("from: {}", e)))?,
        None => Timestamp::EPOCH,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);

    let payload = state
        .endpoint
        .updates_for(&caller.id, caller.tier, from, limit)
        .await?;
    Ok(([(header::CONTENT_TYPE, codec::CONTENT_TYPE)], payload).into_response())
}

/// Row counts of an accepted push.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushSummary {
    pub applied: usize,
    pub rejected: usize,
    pub failed: usize,
}

async fn push_updates(
    State(state): State<ServerState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> ServerResult<Json<PushSummary>> {
    let reports = state
        .endpoint
        .accept_updates(&caller.id, caller.tier, &body)
        .await?;
    Ok(Json(PushSummary {
        applied: reports.iter().map(ApplyReport::applied_count).sum(),
        rejected: reports.iter().map(ApplyReport::rejected_count).sum(),
        failed: reports.iter().map(ApplyReport::failed_count).sum(),
    }))
}

async fn upload_file(
    State(state): State<ServerState>,
    Extension(caller): Extension<Caller>,
    mut multipart: Multipart,
) -> ServerResult<Json<UploadOutcome>> {
    let mut sidecar: Option<FileSidecar> = None;
    let mut contents: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("data") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(e.to_string()))?;
                let parsed = serde_json::from_str(&text)
                    .map_err(|e| ServerError::BadRequest(format!("data: {}", e)))?;
                sidecar = Some(parsed);
            }
            Some("file") => {
                contents = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ServerError::BadRequest(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let sidecar = sidecar.ok_or_else(|| ServerError::BadRequest("missing data part".into()))?;
    let contents = contents.ok_or_else(|| ServerError::BadRequest("missing file part".into()))?;
    tracing::debug!(caller = %caller.id, file_id = %sidecar.id, "receiving upload");

    Ok(Json(state.endpoint.accept_upload(&sidecar, &contents).await?))
}

async fn file_access(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ServerResult<Json<FileRecord>> {
    Ok(Json(state.endpoint.file_access(&id).await?))
}

async fn file_bytes(
    State(state): State<ServerState>,
    Path((container, name)): Path<(String, String)>,
) -> ServerResult<Response> {
    let contents = state.endpoint.read_file(&container, &name).await?;
    Ok(([(header::CONTENT_TYPE, codec::CONTENT_TYPE)], contents).into_response())
}
