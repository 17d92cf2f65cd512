//! HTTP transport: an axum router exposing the protocol surface.
//!
//! Reference names travel as one path segment (percent-encoded when they
//! contain `/`). The sparse-metadata POST and the batch-metadata POST are
//! distinct routes, so neither captures the other's path space.

use std::io;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::odb::Odb;
use crate::protocol::core::ZetaService;
use crate::protocol::fetch;
use crate::protocol::push::{handle_push, PushRequest};
use crate::protocol::types::{
    FetchParams, Operation, PushStats, MEDIA_BLOB, MEDIA_BLOBS, MEDIA_JSON, MEDIA_METADATA,
    MEDIA_METADATA_COMPRESSED, MEDIA_REPORT,
};

/// Error wrapper carrying the transport classification.
struct ApiError(ZetaError);

impl From<ZetaError> for ApiError {
    fn from(e: ZetaError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, self.0.public_message()).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the protocol router.
pub fn router(service: ZetaService) -> Router {
    Router::new()
        .route("/{ns}/{repo}/reference/{refname}", get(ls_reference).post(push))
        .route(
            "/{ns}/{repo}/reference/{refname}/objects/batch",
            post(batch_check),
        )
        .route(
            "/{ns}/{repo}/reference/{refname}/objects/{oid}",
            put(put_object),
        )
        .route("/{ns}/{repo}/metadata/batch", post(batch_metadata))
        .route("/{ns}/{repo}/metadata/{rev}", get(metadata).post(metadata_sparse))
        .route("/{ns}/{repo}/objects/batch", post(batch_objects))
        .route("/{ns}/{repo}/objects/share", post(share_objects))
        .route("/{ns}/{repo}/objects/{oid}", get(single_object))
        .route("/{ns}/{repo}/authorization", post(authorization))
        .with_state(Arc::new(service))
}

async fn authed_repo(
    service: &ZetaService,
    ns: &str,
    repo: &str,
    headers: &HeaderMap,
    operation: Operation,
) -> Result<Odb, ApiError> {
    let (repo_model, odb) = service.open_repo(ns, repo).await?;
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let ctx = service.auth.authenticate(&repo_model, authorization).await?;
    service.auth.authorize(&ctx, &repo_model, operation).await?;
    Ok(odb)
}

fn wants_compressed(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains(MEDIA_METADATA_COMPRESSED))
        .unwrap_or(false)
}

fn stream_response(rx: ReceiverStream<Vec<u8>>, content_type: &'static str) -> Response {
    let body = Body::from_stream(rx.map(|chunk| Ok::<_, io::Error>(bytes::Bytes::from(chunk))));
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

fn parse_oid(raw: &str) -> Result<ObjectHash, ApiError> {
    ObjectHash::from_str(raw)
        .map_err(|e| ApiError(ZetaError::Malformed(e)))
}

/// GET /{ns}/{repo}/reference/{refname}
async fn ls_reference(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo, refname)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Download).await?;
    let result = fetch::ls_reference(&service, &odb, &refname).await?;
    Ok((
        [(header::CONTENT_TYPE, MEDIA_JSON)],
        Json(result),
    )
        .into_response())
}

/// GET /{ns}/{repo}/metadata/{rev}
async fn metadata(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo, rev)): Path<(String, String, String)>,
    Query(params): Query<FetchParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Download).await?;
    let head = service.resolve_rev(&odb, &rev).await?;
    let compressed = wants_compressed(&headers);
    let rx = fetch::metadata_stream(
        odb,
        &service.config.transfer,
        head,
        &params,
        Vec::new(),
        compressed,
    )
    .await?;
    let content_type = if compressed {
        MEDIA_METADATA_COMPRESSED
    } else {
        MEDIA_METADATA
    };
    Ok(stream_response(rx, content_type))
}

/// POST /{ns}/{repo}/metadata/{rev} — body is a newline-delimited path
/// list selecting a sparse subtree walk.
async fn metadata_sparse(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo, rev)): Path<(String, String, String)>,
    Query(params): Query<FetchParams>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Download).await?;
    let head = service.resolve_rev(&odb, &rev).await?;
    let compressed = wants_compressed(&headers);
    let paths: Vec<String> = body
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    let rx = fetch::metadata_stream(
        odb,
        &service.config.transfer,
        head,
        &params,
        paths,
        compressed,
    )
    .await?;
    let content_type = if compressed {
        MEDIA_METADATA_COMPRESSED
    } else {
        MEDIA_METADATA
    };
    Ok(stream_response(rx, content_type))
}

/// POST /{ns}/{repo}/metadata/batch — newline-delimited id list.
async fn batch_metadata(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Download).await?;
    let ids = fetch::parse_id_lines(&body)?;
    let compressed = wants_compressed(&headers);
    let rx =
        fetch::batch_metadata_stream(odb, &service.config.transfer, ids, compressed).await?;
    let content_type = if compressed {
        MEDIA_METADATA_COMPRESSED
    } else {
        MEDIA_METADATA
    };
    Ok(stream_response(rx, content_type))
}

#[derive(Deserialize, Default)]
struct ObjectParams {
    #[serde(default)]
    offset: Option<u64>,
}

/// GET /{ns}/{repo}/objects/{oid} — single blob, range-aware via the
/// `offset` query parameter or a `Range: bytes=<start>-` header.
async fn single_object(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo, oid)): Path<(String, String, String)>,
    Query(params): Query<ObjectParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Download).await?;
    let oid = parse_oid(&oid)?;
    let offset = match params.offset {
        Some(offset) => offset,
        None => headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range_start)
            .unwrap_or(0),
    };
    let rx = fetch::single_object_stream(odb, oid, offset).await?;
    Ok(stream_response(rx, MEDIA_BLOB))
}

/// POST /{ns}/{repo}/objects/batch — many small blobs in one stream.
async fn batch_objects(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Download).await?;
    let ids = fetch::parse_id_lines(&body)?;
    let rx = fetch::batch_objects_stream(odb, &service.config.transfer, ids).await?;
    Ok(stream_response(rx, MEDIA_BLOBS))
}

/// POST /{ns}/{repo}/objects/share — presigned URLs.
async fn share_objects(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Download).await?;
    let ids = fetch::parse_id_lines(&body)?;
    let entries =
        fetch::share_objects(&odb, service.config.remote.share_ttl_secs, &ids).await?;
    Ok(([(header::CONTENT_TYPE, MEDIA_JSON)], Json(entries)).into_response())
}

/// POST /{ns}/{repo}/reference/{refname}/objects/batch — existence probe.
async fn batch_check(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo, _refname)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Upload).await?;
    let ids = fetch::parse_id_lines(&body)?;
    let entries = fetch::batch_check(&odb, &ids).await?;
    Ok(([(header::CONTENT_TYPE, MEDIA_JSON)], Json(entries)).into_response())
}

#[derive(Deserialize)]
struct PutObjectParams {
    size: u64,
}

/// PUT /{ns}/{repo}/reference/{refname}/objects/{oid} — upload one large
/// object, streamed to disk and then to the blob store.
async fn put_object(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo, _refname, oid)): Path<(String, String, String, String)>,
    Query(params): Query<PutObjectParams>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Upload).await?;
    let oid = parse_oid(&oid)?;

    // Spool the body to disk so hashing can stream from a seekable file.
    let mut spool = tokio::fs::File::from_std(
        tempfile::tempfile().map_err(ZetaError::from)?,
    );
    let mut stream = body.into_data_stream();
    let mut received: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ZetaError::Transient(format!("body stream: {e}")))?;
        received += chunk.len() as u64;
        if received > params.size {
            return Err(ZetaError::malformed("body exceeds declared size").into());
        }
        spool.write_all(&chunk).await.map_err(ZetaError::from)?;
    }
    if received != params.size {
        return Err(ZetaError::malformed(format!(
            "declared {} bytes, received {received}",
            params.size
        ))
        .into());
    }
    spool.flush().await.map_err(ZetaError::from)?;

    let mut std_file = spool.into_std().await;
    use std::io::Seek;
    std_file
        .seek(std::io::SeekFrom::Start(0))
        .map_err(ZetaError::from)?;

    let cancel = CancellationToken::new();
    let stored = odb.hash_to(&mut std_file, params.size, &cancel).await?;
    if stored != oid {
        return Err(ZetaError::integrity(format!(
            "uploaded object hashes to {stored}, expected {oid}"
        ))
        .into());
    }
    Ok(StatusCode::OK.into_response())
}

#[derive(Deserialize)]
struct PushParams {
    #[serde(rename = "old-rev")]
    old_rev: String,
    #[serde(rename = "new-rev")]
    new_rev: String,
    #[serde(default)]
    stats: Option<String>,
}

/// POST /{ns}/{repo}/reference/{refname} — push.
async fn push(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo, refname)): Path<(String, String, String)>,
    Query(params): Query<PushParams>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Response> {
    let odb = authed_repo(&service, &ns, &repo, &headers, Operation::Upload).await?;

    let request = PushRequest {
        refname: refname.clone(),
        old: parse_oid(&params.old_rev)?,
        new: parse_oid(&params.new_rev)?,
        stats: match &params.stats {
            Some(raw) => Some(PushStats::from_str(raw)?),
            None => None,
        },
    };

    // The CAS precheck runs inside handle_push, but a conflict before any
    // sideband output must surface as a plain 409.
    let (tx, rx) = mpsc::channel::<String>(64);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(async move {
        handle_push(&odb, &request, &body, &tx, &cancel).await
    });

    // Collect the sideband; pushes report line-by-line.
    let mut lines = Vec::new();
    let mut rx = rx;
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }
    handle
        .await
        .map_err(|e| ZetaError::Fatal(format!("push task panicked: {e}")))??;

    Ok((
        [(header::CONTENT_TYPE, MEDIA_REPORT)],
        lines.concat(),
    )
        .into_response())
}

#[derive(Deserialize)]
struct AuthorizationRequest {
    operation: Operation,
}

/// POST /{ns}/{repo}/authorization — exchange Basic credentials for a
/// bearer token.
async fn authorization(
    State(service): State<Arc<ZetaService>>,
    Path((ns, repo)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<AuthorizationRequest>,
) -> ApiResult<Response> {
    let (repo_model, _) = service.open_repo(&ns, &repo).await?;
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let ctx = service.auth.authenticate(&repo_model, authorization).await?;
    let issued = service
        .auth
        .issue_token(&ctx, &repo_model, request.operation)
        .await?;
    Ok(([(header::CONTENT_TYPE, MEDIA_JSON)], Json(issued)).into_response())
}

/// `bytes=<start>-…` → start.
fn parse_range_start(value: &str) -> Option<u64> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, _) = rest.split_once('-')?;
    start.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Range header starts parse; malformed ones fall back to zero.
    #[test]
    fn range_start_parsing() {
        assert_eq!(parse_range_start("bytes=1073741824-2147483647"), Some(1073741824));
        assert_eq!(parse_range_start("bytes=0-"), Some(0));
        assert_eq!(parse_range_start("items=3-4"), None);
        assert_eq!(parse_range_start("bytes=x-"), None);
    }
}
