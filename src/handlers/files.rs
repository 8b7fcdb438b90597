use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::{
    errors::{AppError, Result},
    handlers::AppState,
    middleware::AuthenticatedUser,
    models::{FileResponse, UploadRequest},
    utils::file::{content_disposition, display_name, resolve_mime_type},
};

pub async fn list_files(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<FileResponse>>> {
    Ok(Json(state.files.list(user.id).await?))
}

pub async fn upload_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<FileResponse>)> {
    let max_file_size = state.config.max_file_size;
    let mut upload: Option<UploadRequest> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let name = display_name(field.file_name());
        let mime_type = resolve_mime_type(field.content_type(), &name);

        // Size is whatever actually arrives; nothing reaches the blob store
        // until the whole part is known to fit the per-file limit.
        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| AppError::Validation(format!("Failed to read upload: {}", e)))?
        {
            if bytes.len() + chunk.len() > max_file_size {
                return Err(AppError::Validation(format!(
                    "File exceeds the maximum size of {} bytes",
                    max_file_size
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        upload = Some(UploadRequest {
            name,
            mime_type,
            bytes,
        });
        break;
    }

    let upload = upload.ok_or_else(|| AppError::Validation("No file uploaded".to_string()))?;
    let file = state.files.upload(user.id, upload).await?;

    Ok((StatusCode::CREATED, Json(file)))
}

pub async fn download_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_id): Path<Uuid>,
) -> Result<Response> {
    let download = state.files.download(user.id, file_id).await?;
    let file = download.file;

    let headers = [
        (header::CONTENT_TYPE, file.mime_type.clone()),
        (header::CONTENT_LENGTH, file.size.to_string()),
        (header::CONTENT_DISPOSITION, content_disposition(&file.name)),
    ];
    let body = Body::from_stream(ReaderStream::new(download.reader));

    Ok((headers, body).into_response())
}

pub async fn delete_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    state.files.delete(user.id, file_id).await?;
    Ok(Json(json!({ "success": true })))
}
