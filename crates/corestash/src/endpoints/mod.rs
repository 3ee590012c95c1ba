use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use corestash_common::About;

use crate::service::CoreService;

mod assets;
mod cores;
mod delay;
mod error;
mod executables;

pub use error::ResponseError;

/// HTML shell bootstrapping the browser application; the assets it refers
/// to are served from the configured assets directory.
const SHELL: &str = include_str!("home.html");

pub fn create_app(service: CoreService) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/about", get(about))
        .route("/cores", post(cores::ingest).get(cores::search))
        .route("/cores/{uid}", get(cores::download).delete(cores::delete))
        .route("/cores/{uid}/_analyze", post(cores::analyze))
        .route(
            "/executables/{hash}",
            get(executables::download).head(executables::exists),
        )
        .route("/metrics", get(metrics))
        .route("/assets/{*path}", get(assets::serve))
        .layer(middleware::from_fn(delay::layer))
        .with_state(service)
}

async fn home() -> Html<&'static str> {
    Html(SHELL)
}

async fn about() -> Json<About> {
    Json(About {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        commit: env!("CORESTASH_GIT_COMMIT").to_owned(),
        built_at: env!("CORESTASH_BUILT_AT").to_owned(),
    })
}

/// Streams a stored file with its length and modification time.
async fn stream_file(file: std::fs::File) -> Result<Response, ResponseError> {
    let meta = file.metadata()?;
    let modified = meta.modified().ok();

    let file = tokio::fs::File::from_std(file);
    let stream = tokio_util::io::ReaderStream::new(file);

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, meta.len());
    if let Some(modified) = modified {
        response = response.header(header::LAST_MODIFIED, http_date(modified));
    }
    Ok(response.body(Body::from_stream(stream))?)
}

fn http_date(time: std::time::SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

async fn metrics(State(service): State<CoreService>) -> Result<Response, ResponseError> {
    let text = service
        .metrics()
        .encode()
        .map_err(anyhow::Error::from)?;
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(text))?
        .into_response())
}
