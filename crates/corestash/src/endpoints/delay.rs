//! The `delay=<duration>` query parameter, honored on every endpoint.
//!
//! Testing aid: lets clients and tests simulate a slow server without
//! touching the handlers.

use std::time::Duration;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

pub async fn layer(request: Request, next: Next) -> Response {
    if let Some(delay) = request.uri().query().and_then(parse_delay) {
        tokio::time::sleep(delay).await;
    }
    next.run(request).await
}

fn parse_delay(query: &str) -> Option<Duration> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("delay="))
        .and_then(|value| humantime::parse_duration(value).ok())
}
