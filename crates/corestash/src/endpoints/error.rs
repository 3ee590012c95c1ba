use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use corestash_common::ApiError;

use crate::index::IndexError;
use crate::store::StoreError;

/// An error bubbling out of a handler, rendered as the JSON `{error}` body
/// with the matching status code.
#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl ResponseError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            err: anyhow::anyhow!(message.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            err: anyhow::anyhow!(message.into()),
        }
    }
}

impl From<anyhow::Error> for ResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl From<StoreError> for ResponseError {
    fn from(err: StoreError) -> Self {
        let status = if err.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<IndexError> for ResponseError {
    fn from(err: IndexError) -> Self {
        let status = match err {
            IndexError::NotFound => StatusCode::NOT_FOUND,
            IndexError::Query(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<std::io::Error> for ResponseError {
    fn from(err: std::io::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl From<axum::http::Error> for ResponseError {
    fn from(err: axum::http::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl From<tokio::task::JoinError> for ResponseError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("request failed: {:#}", self.err);
        }
        let body = ApiError {
            error: format!("{:#}", self.err),
        };
        let mut response = Json(body).into_response();
        *response.status_mut() = self.status;
        response
    }
}
