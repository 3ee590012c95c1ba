//! Static assets for the browser application.
//!
//! The bundle itself is built and deployed separately; this only serves
//! files out of the configured assets directory.

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::header;
use axum::response::Response;

use crate::service::CoreService;

use super::ResponseError;

pub async fn serve(
    State(service): State<CoreService>,
    UrlPath(path): UrlPath<String>,
) -> Result<Response, ResponseError> {
    let Some(dir) = service.config().assets_dir.clone() else {
        return Err(ResponseError::not_found("no assets directory configured"));
    };

    // The wildcard segment is percent-decoded by the router; refuse
    // anything that could climb out of the assets directory.
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ResponseError::not_found("no such asset"));
    }

    let full = dir.join(&path);
    let content = match tokio::fs::read(&full).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ResponseError::not_found("no such asset"));
        }
        Err(err) => return Err(err.into()),
    };

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type(&path))
        .header(header::CONTENT_LENGTH, content.len())
        .body(Body::from(content))?)
}

fn content_type(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}
