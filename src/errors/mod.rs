use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;
use tracing_subscriber::filter::FromEnvError;

/// Main error type for flapi operations.
///
/// Every variant maps onto exactly one category of the error taxonomy
/// (validation / authentication / authorization / not-found / rate-limit /
/// conflict / template / database / configuration / internal); `status_code`
/// and the `IntoResponse` impl below are the single place that mapping is
/// performed.
#[derive(Error, Debug)]
pub enum ApitapError {
    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("DataFusion error: {0}")]
    Datafusion(#[from] datafusion::error::DataFusionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid header name: {0}")]
    HeaderName(#[from] reqwest::header::InvalidHeaderName),

    #[error("Invalid header value: {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] datafusion::arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] datafusion::parquet::errors::ParquetError),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Template error: {0}")]
    Minijinja(#[from] minijinja::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Schedule error: {0}")]
    ScheduleError(#[from] JobSchedulerError),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Tracing From Env Error: {0}")]
    FromEnvError(#[from] FromEnvError),

    /// 400 — required-missing, type-mismatch, out-of-range, bad-regex,
    /// unknown-enum, unknown-body-field (strict mode).
    #[error("Invalid parameter: {0}")]
    Validation(String),

    /// 401 — missing/invalid credentials, signature failure, expired token,
    /// wrong issuer/audience.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// 403 — authenticated but lacking a required role.
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// 404 — unknown endpoint/slug/cache.
    #[error("Not found: {0}")]
    NotFound(String),

    /// 429 — rate limit exceeded.
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// 409 — refresh already in progress for an explicit admin trigger.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 500 — unbalanced template tag, include cycle.
    #[error("Template error: {0}")]
    Template(String),

    /// 500/504 — engine-reported failure or a cancelled/timed-out query.
    #[error("Database error: {0}")]
    Database(String),

    /// 504 — request deadline expired before the engine call returned.
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Pagination error: {0}")]
    PaginationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type that uses ApitapError
pub type Result<T> = std::result::Result<T, ApitapError>;

impl ApitapError {
    /// The HTTP status code this error maps to, per the error taxonomy (spec §7).
    pub fn status_code(&self) -> StatusCode {
        use ApitapError::*;
        match self {
            Validation(_) | PaginationError(_) => StatusCode::BAD_REQUEST,
            Authentication(_) => StatusCode::UNAUTHORIZED,
            Authorization(_) => StatusCode::FORBIDDEN,
            NotFound(_) => StatusCode::NOT_FOUND,
            RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            Conflict(_) => StatusCode::CONFLICT,
            Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Template(_) | Minijinja(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Database(_) | Datafusion(_) | Arrow(_) | Parquet(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ConfigError(_) | SerdeYaml(_) | WalkDir(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApitapError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ApitapError::ConfigError("missing url".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing url");
    }

    #[test]
    fn validation_error_maps_to_400() {
        let err = ApitapError::Validation("id must be >= 1".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn authentication_error_maps_to_401() {
        let err = ApitapError::Authentication("invalid signature".to_string());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = ApitapError::NotFound("no such endpoint".to_string());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn conflict_maps_to_409() {
        let err = ApitapError::Conflict("refresh already running".to_string());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn rate_limit_maps_to_429() {
        let err = ApitapError::RateLimit("too many requests".to_string());
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn timeout_maps_to_504() {
        let err = ApitapError::Timeout("engine call cancelled".to_string());
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}
