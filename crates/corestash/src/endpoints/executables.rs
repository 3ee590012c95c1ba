use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;

use crate::service::CoreService;

use super::{stream_file, ResponseError};

/// Existence check used by forwarders to decide whether to ship the binary
/// with an upload. Responds with an empty 200 or 404.
pub async fn exists(
    State(service): State<CoreService>,
    Path(hash): Path<String>,
) -> Result<StatusCode, ResponseError> {
    let store = service.store();
    let exists = tokio::task::spawn_blocking(move || store.executable_exists(&hash)).await??;
    if exists {
        Ok(StatusCode::OK)
    } else {
        Err(ResponseError::not_found("no such executable"))
    }
}

pub async fn download(
    State(service): State<CoreService>,
    Path(hash): Path<String>,
) -> Result<Response, ResponseError> {
    let store = service.store();
    let file = tokio::task::spawn_blocking(move || store.executable(&hash)).await??;
    stream_file(file).await
}
