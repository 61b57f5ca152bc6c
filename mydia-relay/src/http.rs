use core::fmt;
use core::panic::Location;
use std::error::Error as StdError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Machine-readable error codes carried by every error response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorCode {
    Validation,
    NotFound,
    AlreadyConsumed,
    Expired,
    Unauthorized,
    VersionIncompatible,
    TunnelDisconnected,
    InstanceOffline,
    Timeout,
    Conflict,
    RateLimited,
    Internal,
}

pub struct HttpErrorBuilder {
    pub code: StatusCode,
    pub error_code: ApiErrorCode,
    pub loc: &'static Location<'static>,
    pub msg: Option<&'static str>,
}

impl HttpErrorBuilder {
    #[inline]
    #[track_caller]
    pub fn new(code: StatusCode, error_code: ApiErrorCode) -> Self {
        Self {
            code,
            error_code,
            loc: Location::caller(),
            msg: None,
        }
    }

    #[inline]
    pub fn err<T: Into<Box<dyn StdError + Sync + Send + 'static>>>(self) -> impl FnOnce(T) -> HttpError {
        move |source| HttpError {
            code: self.code,
            error_code: self.error_code,
            loc: self.loc,
            msg: self.msg,
            source: Some(source.into()),
        }
    }

    #[inline]
    pub fn msg(self, msg: &'static str) -> HttpError {
        HttpError {
            code: self.code,
            error_code: self.error_code,
            loc: self.loc,
            msg: Some(msg),
            source: None,
        }
    }
}

pub struct HttpError {
    pub code: StatusCode,
    pub error_code: ApiErrorCode,
    pub loc: &'static Location<'static>,
    pub msg: Option<&'static str>,
    pub source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl HttpError {
    #[inline]
    #[track_caller]
    pub fn validation() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::BAD_REQUEST, ApiErrorCode::Validation)
    }

    #[inline]
    #[track_caller]
    pub fn unauthorized() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::UNAUTHORIZED, ApiErrorCode::Unauthorized)
    }

    #[inline]
    #[track_caller]
    pub fn not_found() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::NOT_FOUND, ApiErrorCode::NotFound)
    }

    #[inline]
    #[track_caller]
    pub fn conflict() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::CONFLICT, ApiErrorCode::Conflict)
    }

    #[inline]
    #[track_caller]
    pub fn expired() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::GONE, ApiErrorCode::Expired)
    }

    #[inline]
    #[track_caller]
    pub fn already_consumed() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::CONFLICT, ApiErrorCode::AlreadyConsumed)
    }

    #[inline]
    #[track_caller]
    pub fn instance_offline() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::SERVICE_UNAVAILABLE, ApiErrorCode::InstanceOffline)
    }

    #[inline]
    #[track_caller]
    pub fn tunnel_disconnected() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::BAD_GATEWAY, ApiErrorCode::TunnelDisconnected)
    }

    #[inline]
    #[track_caller]
    pub fn timeout() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::GATEWAY_TIMEOUT, ApiErrorCode::Timeout)
    }

    #[inline]
    #[track_caller]
    pub fn rate_limited() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::TOO_MANY_REQUESTS, ApiErrorCode::RateLimited)
    }

    #[inline]
    #[track_caller]
    pub fn internal() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR, ApiErrorCode::Internal)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.code, self.loc)?;

        if let Some(msg) = self.msg {
            write!(f, ": {msg}")?;
        }

        if let Some(source) = self.source.as_deref() {
            write!(f, " [source: {source}")?;
            for cause in anyhow::Chain::new(source).skip(1) {
                write!(f, ", because {cause}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error_code: ApiErrorCode,
    message: String,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        error!(error = %self);

        let message = self
            .msg
            .map(str::to_owned)
            .or_else(|| self.source.as_deref().map(|source| format!("{source}")))
            .unwrap_or_else(|| self.code.canonical_reason().unwrap_or("error").to_owned());

        let body = ErrorBody {
            error_code: self.error_code,
            message,
        };

        (self.code, Json(body)).into_response()
    }
}
