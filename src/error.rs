use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Errors raised anywhere in the synchronization pipeline.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("elasticsearch HTTP error: {0}")]
    SearchHttp(#[from] reqwest::Error),
    #[error("elasticsearch returned status {status}: {body}")]
    SearchStatus { status: StatusCode, body: String },
    #[error("bulk request rejected {failed} of {total} documents: {reason}")]
    BulkRejected {
        failed: usize,
        total: usize,
        reason: String,
        retryable: bool,
    },
    #[error("state store error: {0}")]
    State(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{operation} still failing after backoff reached the {ceiling:?} ceiling: {source}")]
    RetryExhausted {
        operation: String,
        ceiling: Duration,
        #[source]
        source: Box<EtlError>,
    },
}

impl EtlError {
    pub fn search_status(status: StatusCode, body: String) -> Self {
        EtlError::SearchStatus { status, body }
    }

    /// Whether retrying the failed call has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::Database(err) => sqlx_error_is_transient(err),
            EtlError::SearchHttp(err) => {
                err.is_connect()
                    || err.is_timeout()
                    || err.is_request()
                    || err.status().map(status_is_transient).unwrap_or(false)
            }
            EtlError::SearchStatus { status, .. } => status_is_transient(*status),
            EtlError::BulkRejected { retryable, .. } => *retryable,
            EtlError::Io(_) => true,
            EtlError::Migration(_)
            | EtlError::State(_)
            | EtlError::Json(_)
            | EtlError::InvalidTimestamp(_)
            | EtlError::Config(_)
            | EtlError::RetryExhausted { .. } => false,
        }
    }
}

pub(crate) fn status_is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn sqlx_error_is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| {
                // 08xxx connection exceptions, serialization failure, deadlock, admin shutdown
                code.starts_with("08") || code == "40001" || code == "40P01" || code == "57P01"
            })
            .unwrap_or(false),
        _ => false,
    }
}
