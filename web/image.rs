use crate::AppState;
use axum::{
    extract::{
        Multipart, Path, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::StatusCode,
};
use bytes::BytesMut;
use imgvault::{
    app::{AppError, ImageUpload},
    format::{Formatted, ResponseFormat},
};
use serde_json::{Value, json};
use thiserror::Error;

/// Name of the multipart field carrying the image.
const FILE_FIELD: &str = "file";

pub async fn post_image(
    State(state): State<AppState>,
    format: ResponseFormat,
    multipart: Result<Multipart, MultipartRejection>,
) -> Formatted {
    reply(format, create(&state, multipart.ok()).await)
}

pub async fn get_images(State(state): State<AppState>, format: ResponseFormat) -> Formatted {
    reply(format, list(&state).await)
}

pub async fn put_image(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    format: ResponseFormat,
    multipart: Result<Multipart, MultipartRejection>,
) -> Formatted {
    reply(format, replace(&state, id, multipart.ok()).await)
}

pub async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    format: ResponseFormat,
) -> Formatted {
    reply(format, delete(&state, id).await)
}

async fn create(state: &AppState, multipart: Option<Multipart>) -> Result<Value, ImageError> {
    let upload = read_upload(multipart).await?;
    let uploaded = state.images.upload(upload).await?;

    Ok(json!({
        "message": "Image uploaded successfully",
        "filename": uploaded.filename,
        "access_url": uploaded.access_url,
    }))
}

async fn list(state: &AppState) -> Result<Value, ImageError> {
    let images = state.images.list().await?;

    Ok(json!({ "images": images }))
}

async fn replace(
    state: &AppState,
    id: i64,
    multipart: Option<Multipart>,
) -> Result<Value, ImageError> {
    let upload = read_upload(multipart).await?;
    let replaced = state.images.replace(id, upload).await?;

    Ok(json!({
        "message": "Image updated successfully",
        "new_url": replaced.new_url,
    }))
}

async fn delete(state: &AppState, id: i64) -> Result<Value, ImageError> {
    state.images.delete(id).await?;

    Ok(json!({ "message": "Image deleted successfully" }))
}

/// Reads the `file` part of a form, if there is one with a filename.
///
/// A request that is not a multipart form at all carries no file either, so
/// the controller decides between not found and a missing file. Other fields
/// are skipped. The whole part is buffered; the request body limit bounds its
/// size.
async fn read_upload(multipart: Option<Multipart>) -> Result<Option<ImageUpload>, ImageError> {
    let Some(mut multipart) = multipart else {
        return Ok(None);
    };

    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let Some(filename) = field.file_name().filter(|f| !f.is_empty()).map(str::to_string)
        else {
            return Ok(None);
        };
        let content_type = field.content_type().map(str::to_string);

        let mut data = BytesMut::new();
        while let Some(chunk) = field.chunk().await? {
            data.extend_from_slice(&chunk);
        }

        return Ok(Some(ImageUpload::new(
            filename,
            content_type.as_deref(),
            data.freeze(),
        )));
    }

    Ok(None)
}

fn reply(format: ResponseFormat, result: Result<Value, ImageError>) -> Formatted {
    match result {
        Ok(payload) => Formatted::ok(format, payload),
        Err(e) => {
            let status = e.status();
            if status.is_server_error() {
                tracing::error!(error = %e, "request failed");
            }
            Formatted::new(format, status, json!({ "error": e.to_string() }))
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    App(#[from] AppError),

    #[error("malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),
}

impl ImageError {
    fn status(&self) -> StatusCode {
        match self {
            ImageError::Multipart(e) => e.status(),
            ImageError::App(app_error) => match app_error {
                AppError::MissingFile => StatusCode::BAD_REQUEST,
                AppError::NotFound { .. } => StatusCode::NOT_FOUND,
                AppError::Storage(_) => StatusCode::BAD_GATEWAY,
                AppError::Database(database_error) if database_error.is_unavailable() => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}
