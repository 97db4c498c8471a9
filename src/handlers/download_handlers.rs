//! HTTP handlers for skin downloads.
//! Streams published archives from disk without buffering them in memory;
//! resolving (and building) the archive is delegated to `DepotService`.

use crate::{
    errors::AppError,
    models::skin::SkinId,
    services::{artifact::ArtifactHandle, depot_service::DepotService},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

/// GET `/skins/bundle`: every skin on record in one archive.
pub async fn download_bundle(State(service): State<DepotService>) -> Result<Response, AppError> {
    let handle = service.bundle().await?;
    artifact_response(&handle).await
}

/// GET `/skins/{id}/download`: one skin's archive, rebuilt on every request.
pub async fn download_skin(
    State(service): State<DepotService>,
    Path(id): Path<SkinId>,
) -> Result<Response, AppError> {
    let handle = service.skin(id).await?;
    artifact_response(&handle).await
}

async fn artifact_response(handle: &ArtifactHandle) -> Result<Response, AppError> {
    // Open before sending headers; the file may be replaced but never truncated.
    let file = handle.open().await?;
    let len = file.metadata().await?.len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    set_archive_headers(response.headers_mut(), handle.download_name(), len);
    Ok(response)
}

fn set_archive_headers(headers: &mut HeaderMap, download_name: &str, len: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(download_name))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
}

/// `attachment` with an ASCII `filename` fallback, plus an RFC 5987
/// `filename*` carrying the exact UTF-8 name when the two differ.
fn content_disposition(download_name: &str) -> String {
    let fallback: String = download_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    if fallback == download_name {
        format!("attachment; filename=\"{fallback}\"")
    } else {
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(download_name)
        )
    }
}
