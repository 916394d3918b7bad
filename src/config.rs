use crate::error::EtlError;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value >= 1.0)
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Retry policy shared by every relational and search-engine call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub start_delay: Duration,
    pub factor: f64,
    pub ceiling: Duration,
}

impl BackoffConfig {
    pub fn from_env() -> Self {
        Self {
            start_delay: env_duration_millis("ETL_BACKOFF_START_MS", 100),
            factor: env_f64("ETL_BACKOFF_FACTOR", 2.0),
            ceiling: env_duration_millis("ETL_BACKOFF_CEILING_MS", 10_000),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(100),
            factor: 2.0,
            ceiling: Duration::from_secs(10),
        }
    }
}

/// Connection settings for the Elasticsearch cluster.
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    pub base_url: String,
    pub index: String,
    pub request_timeout: Duration,
}

impl ElasticsearchConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("ELASTICSEARCH_URL", "http://elasticsearch:9200"),
            index: env_string("ELASTICSEARCH_INDEX", "movies"),
            request_timeout: env_duration_millis("ELASTICSEARCH_TIMEOUT_MS", 30_000),
        }
    }
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Where the watermark is persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorStoreKind {
    #[default]
    Postgres,
    File,
    Memory,
}

impl fmt::Display for CursorStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CursorStoreKind::Postgres => "postgres",
            CursorStoreKind::File => "file",
            CursorStoreKind::Memory => "memory",
        })
    }
}

impl FromStr for CursorStoreKind {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" | "" => Ok(CursorStoreKind::Postgres),
            "file" | "json" => Ok(CursorStoreKind::File),
            "memory" => Ok(CursorStoreKind::Memory),
            other => Err(EtlError::Config(format!(
                "unknown state backend '{other}' (expected postgres, file or memory)"
            ))),
        }
    }
}

/// Top-level runtime configuration for the ETL process.
#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub database_url: Option<String>,
    pub elasticsearch: ElasticsearchConfig,
    pub page_size: usize,
    pub backoff: BackoffConfig,
    pub state_backend: CursorStoreKind,
    pub state_path: PathBuf,
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, EtlError> {
        let state_backend = env::var("ETL_STATE_BACKEND")
            .ok()
            .map(|value| value.parse::<CursorStoreKind>())
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            elasticsearch: ElasticsearchConfig::from_env(),
            page_size: env_usize("ETL_PAGE_SIZE", crate::extract::DEFAULT_PAGE_SIZE),
            backoff: BackoffConfig::from_env(),
            state_backend,
            state_path: PathBuf::from(env_string("ETL_STATE_PATH", "./etl_state.json")),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, EtlError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| EtlError::Config("DATABASE_URL is not set".to_string()))
    }
}
