use std::error::Error as StdError;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::LibraryError;

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const CALLER_REQUIRED: &str = "caller_required";
    pub const UNAVAILABLE: &str = "unavailable";
}

/// Diagnostics carried on a response for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    hint: Option<String>,
    retry_after: Option<u64>,
    report: ErrorReport,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        hint: Option<String>,
    ) -> Self {
        let message = message.into();
        let report = ErrorReport::from_message(
            "infra::http",
            status,
            format!("{code}: {}", hint.as_deref().unwrap_or(&message)),
        );
        Self {
            status,
            code,
            message,
            hint,
            retry_after: None,
            report,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn caller_required() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::CALLER_REQUIRED,
            "x-caller-id header is required for narrative requests",
            None,
        )
    }

    pub fn unavailable(source: &'static str, error: &dyn StdError) -> Self {
        let mut api = Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::UNAVAILABLE,
            "Service unavailable",
            None,
        );
        api.report = ErrorReport::from_error(source, StatusCode::SERVICE_UNAVAILABLE, error);
        api
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(err: &LibraryError) -> StatusCode {
    match err {
        LibraryError::Input(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LibraryError::ComputationFailed(_) => StatusCode::BAD_GATEWAY,
        LibraryError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        LibraryError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        LibraryError::LockUnavailable { .. } => StatusCode::CONFLICT,
        LibraryError::BudgetExceeded { .. } | LibraryError::CoordinationUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl From<LibraryError> for ApiError {
    fn from(err: LibraryError) -> Self {
        let status = status_for(&err);
        let retry_after = err.retry_after_secs();
        // Upstream and storage details stay in the logs.
        let message = if err.is_caller_error() || retry_after.is_some() {
            err.to_string()
        } else {
            match &err {
                LibraryError::ComputationFailed(_) => "Geometry computation failed".to_string(),
                _ => "Book storage is unavailable".to_string(),
            }
        };
        let hint = retry_after.map(|secs| format!("Retry after {secs} seconds"));

        Self {
            status,
            code: err.code(),
            message,
            hint,
            retry_after,
            report: ErrorReport::from_error("application::library", status, &err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message,
                hint: self.hint,
                retry_after_seconds: self.retry_after,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        self.report.attach(&mut response);
        response
    }
}
