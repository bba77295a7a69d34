use axum::{
    Extension, Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use mitra_db::models::{UploadRow, to_millis};
use mitra_types::api::{Claims, FileUrl, UploadResponse};
use mitra_types::rules::{self, MAX_ATTACHMENT_BYTES};

use crate::auth::AppState;
use crate::error::ApiError;

const MAX_FILENAME_CHARS: usize = 255;

/// POST /api/chatbox/upload: multipart field `file`, at most 10 MB, allowed
/// mime types only. The returned URL is what `sendMessage` references.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => break field,
            Ok(Some(_)) => continue,
            Ok(None) => return Err(ApiError::BadRequest("missing multipart field 'file'".into())),
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return Err(ApiError::PayloadTooLarge);
            }
            Err(e) => return Err(ApiError::BadRequest(e.body_text())),
        }
    };

    let filename = sanitize_filename(field.file_name().unwrap_or_default());
    let mime_type = field
        .content_type()
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if !rules::is_allowed_mime(&mime_type) {
        warn!("{} uploaded disallowed type '{}'", claims.username, mime_type);
        return Err(ApiError::UnsupportedType(if mime_type.is_empty() {
            "unknown".into()
        } else {
            mime_type
        }));
    }

    let mut data: Vec<u8> = Vec::new();
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if (data.len() + chunk.len()) as u64 > MAX_ATTACHMENT_BYTES {
                    return Err(ApiError::PayloadTooLarge);
                }
                data.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return Err(ApiError::PayloadTooLarge);
            }
            Err(e) => return Err(ApiError::BadRequest(e.body_text())),
        }
    }
    if data.is_empty() {
        return Err(ApiError::BadRequest("file is empty".into()));
    }

    let upload_id = Uuid::new_v4();
    let sha256 = state.storage.write(upload_id, &data).await.map_err(|e| {
        error!("Failed to store upload {}: {}", upload_id, e);
        ApiError::Internal
    })?;

    let size_bytes = data.len() as u64;
    let row = UploadRow {
        id: upload_id.to_string(),
        uploader_id: claims.sub.to_string(),
        filename: filename.clone(),
        mime_type: mime_type.clone(),
        size_bytes: size_bytes as i64,
        sha256,
        created_at: to_millis(Utc::now()),
    };
    let db = state.actions.db().clone();
    let recorded = tokio::task::spawn_blocking(move || db.insert_upload(&row))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal
        })?;
    if let Err(e) = recorded {
        if let Err(cleanup) = state.storage.delete_file(upload_id).await {
            warn!("Failed to remove orphaned upload {}: {}", upload_id, cleanup);
        }
        return Err(e.into());
    }

    info!(
        "{} ({}) uploaded {} ({} bytes, {})",
        claims.username, claims.sub, upload_id, size_bytes, mime_type
    );

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            file_url: FileUrl {
                url: format!("{}/api/chatbox/files/{}", state.public_url, upload_id),
                filename,
            },
            file_type: mime_type,
            size_bytes,
        }),
    ))
}

/// GET /api/chatbox/files/{file_id}: stream the stored bytes back.
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let db = state.actions.db().clone();
    let row = tokio::task::spawn_blocking(move || db.get_upload(file_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal
        })??
        .ok_or(ApiError::NotFound)?;

    let etag = format!("\"{}\"", row.sha256);
    let unchanged = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == etag));
    if unchanged {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
    }

    let file = state.storage.open(file_id).await.map_err(|e| {
        error!("Upload {} has metadata but no file: {}", file_id, e);
        ApiError::NotFound
    })?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, header_value(&row.mime_type)?);
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(row.size_bytes.max(0) as u64));
    response_headers.insert(header::ETAG, header_value(&etag)?);
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&format!(
            "inline; filename=\"{}\"",
            row.filename.replace(['"', '\\'], "_")
        ))?,
    );

    Ok((StatusCode::OK, response_headers, body).into_response())
}

fn header_value(raw: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(raw).map_err(|_| {
        error!("Unrepresentable header value '{}'", raw);
        ApiError::Internal
    })
}

/// Last path component, control characters stripped, non-empty.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_FILENAME_CHARS)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
