//! Error taxonomy and the structured error log.
//!
//! Handlers return `AppError`; the `IntoResponse` impl maps each kind to
//! its HTTP status and a JSON envelope. Background ingest deliberately
//! bypasses this mapping (see `http::tracking`) so mobile clients never
//! see a non-200 and start a retry storm.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("authentication required: {0}")]
    Auth(String),

    #[error("forbidden: {0}")]
    Authz(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("location rejected: {reason}")]
    LocationRejected { reason: String, code: &'static str },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("downstream error: {0}")]
    Downstream(String),

    #[error("internal error: {0}")]
    Fatal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Authz(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::LocationRejected { .. } => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Cache degradation is absorbed internally; if one leaks this
            // far something upstream forgot to fall back.
            AppError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Downstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "AUTH_REQUIRED",
            AppError::Authz(_) => "FORBIDDEN",
            AppError::Validation(_) => "INVALID_REQUEST",
            AppError::LocationRejected { code, .. } => code,
            AppError::Conflict(_) => "CONFLICT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Storage(_) => "STORAGE_UNAVAILABLE",
            AppError::Cache(_) => "CACHE_UNAVAILABLE",
            AppError::Downstream(_) => "DOWNSTREAM_FAILED",
            AppError::Fatal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.error_code(), error = %self, "request_failed");
        } else {
            warn!(code = self.error_code(), error = %self, "request_rejected");
        }
        let mut body = json!({
            "success": false,
            "error": self.to_string(),
            "errorCode": self.error_code(),
        });
        if matches!(self, AppError::Storage(_)) {
            body["retryAfterSeconds"] = json!(5);
        }
        (status, Json(body)).into_response()
    }
}

/// Transient I/O error classes that should not escalate retry pressure.
/// Matched by substring against whatever the underlying client printed.
const RECOVERABLE_PATTERNS: [&str; 7] = [
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "EPIPE",
    "connection reset",
    "connection refused",
    "timed out",
];

/// True when the message looks like transient network noise rather than a
/// real fault worth escalating.
pub fn is_recoverable_noise(message: &str) -> bool {
    let lower = message.to_lowercase();
    RECOVERABLE_PATTERNS.iter().any(|p| lower.contains(&p.to_lowercase()))
}

// ---------------------------------------------------------------------------
// Error log
// ---------------------------------------------------------------------------

/// Structured error sink backed by the `error_logs` table.
///
/// When the database itself is the victim the row write fails; the entry
/// still lands in the process log via tracing, which is the fallback sink.
#[derive(Clone)]
pub struct ErrorLogger {
    pool: Option<PgPool>,
}

impl ErrorLogger {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool: Some(pool) })
    }

    /// Console-only logger for tests and degraded startup.
    pub fn console_only() -> Arc<Self> {
        Arc::new(Self { pool: None })
    }

    pub async fn log(
        &self,
        service: &str,
        error_type: &str,
        message: &str,
        user_id: Option<i64>,
        metadata: serde_json::Value,
    ) {
        error!(service, error_type, user_id, message, "service_error");
        let Some(pool) = &self.pool else { return };

        let result = sqlx::query(
            r#"
            INSERT INTO error_logs (service, error_type, message, user_id, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(service)
        .bind(error_type)
        .bind(message)
        .bind(user_id)
        .bind(&metadata)
        .execute(pool)
        .await;

        if let Err(e) = result {
            // The console line above already carries the payload.
            warn!(error = %e, "error_log_write_failed");
        }
    }

    /// Delete entries older than `days` days. Returns rows purged.
    pub async fn purge_older_than_days(&self, days: i64) -> Result<u64, sqlx::Error> {
        let Some(pool) = &self.pool else { return Ok(0) };
        let done = sqlx::query(
            "DELETE FROM error_logs WHERE created_at < now() - ($1 || ' days')::interval",
        )
        .bind(days.to_string())
        .execute(pool)
        .await?;
        Ok(done.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::Auth("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Authz("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Conflict("shift already active".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Fatal("invariant".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_location_rejected_carries_reason_code() {
        let e = AppError::LocationRejected {
            reason: "speed 200 km/h exceeds limit".into(),
            code: "SPEED_LIMIT",
        };
        assert_eq!(e.error_code(), "SPEED_LIMIT");
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_recoverable_noise_classification() {
        assert!(is_recoverable_noise("read failed: ECONNRESET"));
        assert!(is_recoverable_noise("operation timed out after 10s"));
        assert!(is_recoverable_noise("Connection refused (os error 111)"));
        assert!(!is_recoverable_noise("duplicate key value violates unique constraint"));
        assert!(!is_recoverable_noise("permission denied for table shifts"));
    }
}
