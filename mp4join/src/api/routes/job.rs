//! Job lifecycle routes.
//!
//! Creation, status polling, part upload, output download, and
//! destruction. Every route after creation checks that the request comes
//! from the address that created the job.

use std::net::SocketAddr;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    CreateJobParams, CreateJobResponse, DestroyJobResponse, JobStatusResponse,
};
use crate::api::server::AppState;
use crate::error::Error;
use crate::job::PartUpload;

/// Create the job router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(create_job))
        .route("/{id}", get(job_status).delete(destroy_job))
        .route("/{id}/download", get(download_output))
        .route("/{id}/{part}", post(upload_part))
}

/// Allocate a new job for the calling address.
///
/// A quota refusal is a soft failure: the response stays 200 with
/// `success: false` and a human-readable reason, so polling clients can
/// retry without special-casing the status code.
async fn create_job(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<CreateJobParams>,
) -> ApiResult<Json<CreateJobResponse>> {
    let raw = params.parts.unwrap_or_default();
    let part_count = parse_part_count(&raw)
        .ok_or_else(|| ApiError::bad_request(format!("invalid parts value: {raw:?}")))?;

    match state.registry.create_job(addr.ip(), part_count) {
        Ok(id) => Ok(Json(CreateJobResponse::created(id))),
        Err(err @ Error::QuotaExceeded { .. }) => {
            debug!(owner = %addr.ip(), "job refused: {err}");
            Ok(Json(CreateJobResponse::refused(err.to_string())))
        }
        Err(err) => Err(err.into()),
    }
}

/// Report the derived status of a job.
async fn job_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let view = state
        .registry
        .inspect(&id)
        .ok_or_else(|| Error::not_found("job", &id))?;
    if view.owner != addr.ip() {
        return Err(Error::WrongOwner { id }.into());
    }

    Ok(Json(JobStatusResponse {
        status: view.status,
    }))
}

/// Receive one part's bytes.
///
/// Admission (ownership, state, index, declared length) happens before the
/// body is read. The guard returned by the registry keeps the part index
/// reserved while bytes stream to disk; dropping it on any failure deletes
/// the partial file and frees the index for a retry.
async fn upload_part(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((id, part)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<StatusCode> {
    let part = parse_part_index(&part)
        .ok_or_else(|| ApiError::bad_request(format!("invalid part index: {part:?}")))?;

    let declared = content_length(&headers);
    let path = state.store.part_path(&id, part);
    let guard = state
        .registry
        .begin_part_upload(addr.ip(), &id, part, declared, path)?;

    write_part(&guard, body).await?;
    guard.finish();

    debug!(job_id = %id, part, "part received");
    Ok(StatusCode::OK)
}

/// Stream the assembled output back to its owner.
///
/// The streamer enforces the newest-wins per-address rule and the global
/// cap; a missing output (not yet rendered, already downloaded, or swept)
/// surfaces as a 503 rather than a 404 so clients can distinguish it from
/// an unknown job.
async fn download_output(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let view = state
        .registry
        .inspect(&id)
        .ok_or_else(|| Error::not_found("job", &id))?;
    if view.owner != addr.ip() {
        return Err(Error::WrongOwner { id }.into());
    }

    let output = state.store.output_path(&id);
    let stream = state.streamer.start(addr.ip(), output).await?;
    let size = stream.size();

    info!(job_id = %id, owner = %addr.ip(), bytes = size, "download started");

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(format!("failed to build response: {e}")))?;

    Ok(response)
}

/// Cancel a job and discard its files.
///
/// Kills the render process if one is active; the dispatcher removes the
/// files once the killed process exits, otherwise they are removed here.
/// The job stays tracked (and counted against the quota) until eviction.
async fn destroy_job(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> ApiResult<Json<DestroyJobResponse>> {
    let view = state
        .registry
        .inspect(&id)
        .ok_or_else(|| Error::not_found("job", &id))?;
    if view.owner != addr.ip() {
        return Err(Error::WrongOwner { id }.into());
    }

    let outcome = state.registry.destroy_job(&id)?;
    if outcome.render_active {
        info!(job_id = %id, "destroy requested while rendering, cleanup deferred");
    } else {
        state.store.remove_job_files(&id, outcome.part_count).await;
        info!(job_id = %id, "job destroyed");
    }

    Ok(Json(DestroyJobResponse::destroyed()))
}

/// Write the request body to the part's file, holding it to the declared
/// length exactly. The chunk that would cross the declared length is not
/// written at all.
async fn write_part(guard: &PartUpload, body: Body) -> ApiResult<()> {
    let declared = guard.declared();
    let file = File::create(guard.path()).await.map_err(Error::from)?;
    let mut sink = BufWriter::new(file);
    let mut stream = body.into_data_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            debug!("part upload stream failed: {err}");
            ApiError::bad_request("upload stream aborted")
        })?;
        written += chunk.len() as u64;
        if written > declared {
            return Err(Error::LengthMismatch { declared, written }.into());
        }
        sink.write_all(&chunk).await.map_err(Error::from)?;
    }

    if written != declared {
        return Err(Error::LengthMismatch { declared, written }.into());
    }
    sink.flush().await.map_err(Error::from)?;

    Ok(())
}

/// Parse a part count query value: base-ten digits with no leading zero.
fn parse_part_count(raw: &str) -> Option<u32> {
    if raw.is_empty() || raw.starts_with('0') || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Parse a part index path segment: base-ten digits only.
fn parse_part_index(raw: &str) -> Option<u32> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}
