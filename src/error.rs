use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

/// Typed domain error shared by every subsystem. The HTTP layer maps each
/// variant to a stable machine code and the common response envelope.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("rate limit exceeded")]
    RateLimited { limit: i64, remaining: i64, reset: i64 },
    #[error("{0}")]
    NotFound(String),
    #[error("{detail}")]
    Validation { detail: String, fields: Option<Value> },
    /// Well-formed but semantically out-of-range input (422).
    #[error("{detail}")]
    Unprocessable { detail: String, fields: Option<Value> },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    UpstreamUnavailable(String),
    #[error("upstream circuit breaker is open")]
    CircuitOpen,
    #[error("analytics store unavailable: {0}")]
    AnalyticsUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::Unauthorized(detail.into())
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::Forbidden(detail.into())
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::NotFound(detail.into())
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation { detail: detail.into(), fields: None }
    }

    /// Validation error with a structured payload (`provided`,
    /// `expected_format`, `suggestion`, `examples`, ...).
    pub fn validation_with(detail: impl Into<String>, fields: Value) -> Self {
        Self::Validation { detail: detail.into(), fields: Some(fields) }
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::Unprocessable { detail: detail.into(), fields: None }
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Conflict(detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// Stable machine code, part of the wire contract.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation { .. } | Self::Unprocessable { .. } => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::UpstreamUnavailable(_) | Self::AnalyticsUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "authentication_error",
            Self::Forbidden(_) => "authorization_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::NotFound(_) => "not_found_error",
            Self::Validation { .. } | Self::Unprocessable { .. } => "validation_error",
            Self::Conflict(_) => "conflict_error",
            Self::UpstreamUnavailable(_) | Self::AnalyticsUnavailable(_) => "upstream_error",
            Self::CircuitOpen => "circuit_breaker_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UpstreamUnavailable(_) | Self::AnalyticsUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// RFC 7807-shaped body. `detail` never carries internal messages for
    /// 500s; those are logged and replaced with a generic line.
    pub fn envelope(&self) -> Value {
        let detail = match self {
            Self::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let mut body = json!({
            "success": false,
            "error_type": self.error_type(),
            "error_code": self.error_code(),
            "detail": detail,
            "instance": format!("urn:osservatorio:error:{}", uuid::Uuid::new_v4()),
            "timestamp": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        });
        if let Self::Validation { fields: Some(fields), .. }
        | Self::Unprocessable { fields: Some(fields), .. } = self
        {
            body["fields"] = fields.clone();
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.envelope();
        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { limit, remaining, reset } = self {
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", limit.to_string().parse().unwrap());
            headers.insert("X-RateLimit-Remaining", remaining.to_string().parse().unwrap());
            headers.insert("X-RateLimit-Reset", reset.to_string().parse().unwrap());
        }
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row not found".to_string()),
            rusqlite::Error::SqliteFailure(e, ref msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(msg.clone().unwrap_or_else(|| "constraint violation".to_string()))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<clickhouse::error::Error> for ApiError {
    fn from(err: clickhouse::error::Error) -> Self {
        Self::AnalyticsUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json error: {err}"))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
