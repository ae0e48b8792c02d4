use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use roster_service::store::StoreError;
use roster_service::types::{FetchError, ValidationError};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

/// The detail of every 500 response. The actual error only goes to the log and Sentry.
const INTERNAL_DETAIL: &str = "internal server error";

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<FetchError> for ResponseError {
    fn from(err: FetchError) -> Self {
        let status = match err {
            FetchError::NotFound => StatusCode::NOT_FOUND,
            ref err if err.is_deadline() => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<StoreError> for ResponseError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::NotFound => StatusCode::NOT_FOUND,
            StoreError::Conflict => StatusCode::CONFLICT,
            StoreError::Timeout(_) | StoreError::Canceled => StatusCode::GATEWAY_TIMEOUT,
            StoreError::Database(_) | StoreError::Pool(_) | StoreError::Unavailable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<ValidationError> for ResponseError {
    fn from(err: ValidationError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            err: err.into(),
        }
    }
}

impl From<JsonRejection> for ResponseError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            err: anyhow::anyhow!(rejection.body_text()),
        }
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((code, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status: code,
            err: anyhow::anyhow!(msg),
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

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        let body = if self.status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self.err, "request failed");
            capture_anyhow(&self.err);
            ApiErrorResponse::internal()
        } else {
            ApiErrorResponse::from(self.err)
        };

        let mut response = Json(body).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    causes: Option<Vec<String>>,
}

impl ApiErrorResponse {
    pub fn internal() -> Self {
        ApiErrorResponse {
            detail: Some(INTERNAL_DETAIL.to_owned()),
            causes: None,
        }
    }
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse { detail, causes }
    }
}
