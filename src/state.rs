//! Watermark persistence.
//!
//! The watermark is two timestamps stored under flat keys: `current_time`, captured
//! when a run starts, and `last_extracted_time`, the `current_time` of the last run
//! that completed without error. Stores only need `get`/`set`; an empty store means
//! nothing has been synchronized yet.

use crate::config::{CursorStoreKind, EtlConfig};
use crate::error::EtlError;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CURRENT_TIME_KEY: &str = "current_time";
pub const LAST_EXTRACTED_KEY: &str = "last_extracted_time";

/// Baseline used when no run has ever completed.
pub const EPOCH: &str = "0001-01-01 00:00:00.000";

/// Durable key-value storage for the watermark.
pub trait CursorStore {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, EtlError>> + Send;
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), EtlError>> + Send;
}

/// Time window scanned by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub current_time: DateTime<Utc>,
    pub last_extracted_time: DateTime<Utc>,
}

impl Watermark {
    /// Build the window for a run starting at `now`.
    ///
    /// A stored baseline later than `now` (clock skew between hosts) pins
    /// `current_time` to the baseline so the window never runs backwards.
    pub fn new(last_extracted_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let last_extracted_time = last_extracted_time.unwrap_or_else(epoch);
        let current_time = if last_extracted_time > now {
            warn!(
                "stored {LAST_EXTRACTED_KEY} {} is ahead of the local clock {}; using it as the window end",
                format_timestamp(last_extracted_time),
                format_timestamp(now)
            );
            last_extracted_time
        } else {
            now
        };

        Self {
            current_time,
            last_extracted_time,
        }
    }

    /// Read the baseline from `store` and stamp the window end with `now`.
    pub async fn capture<S: CursorStore>(store: &S, now: DateTime<Utc>) -> Result<Self, EtlError> {
        let last = load_timestamp(store, LAST_EXTRACTED_KEY).await?;
        let watermark = Self::new(last, now);
        store
            .set(CURRENT_TIME_KEY, &format_timestamp(watermark.current_time))
            .await?;
        Ok(watermark)
    }

    pub fn is_first_run(&self) -> bool {
        self.last_extracted_time == epoch()
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse RFC 3339 values as well as naive ISO-8601 values, which are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, EtlError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| EtlError::InvalidTimestamp(raw.to_string()))
}

pub async fn load_timestamp<S: CursorStore>(
    store: &S,
    key: &str,
) -> Result<Option<DateTime<Utc>>, EtlError> {
    match store.get(key).await? {
        Some(raw) if !raw.trim().is_empty() => parse_timestamp(&raw).map(Some),
        _ => Ok(None),
    }
}

/// Watermark table in the same Postgres database as the content schema.
#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CursorStore for PgCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EtlError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM etl_state WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EtlError> {
        sqlx::query(
            r#"INSERT INTO etl_state (key, value, updated_at)
               VALUES ($1, $2, NOW())
               ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at"#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        debug!("etl_state: {key} = {value}");
        Ok(())
    }
}

/// JSON object on local disk. Each save merges into the existing object and
/// replaces the file atomically.
#[derive(Debug, Clone)]
pub struct JsonFileCursorStore {
    path: PathBuf,
}

impl JsonFileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(path: &Path) -> Result<HashMap<String, String>, EtlError> {
        match std::fs::read(path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_all(path: &Path, state: &HashMap<String, String>) -> Result<(), EtlError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut file, state)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|err| EtlError::Io(err.error))?;
        Ok(())
    }
}

impl CursorStore for JsonFileCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EtlError> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            Self::read_all(&path).map(|mut state| state.remove(&key))
        })
        .await
        .map_err(|err| EtlError::State(format!("state file reader panicked: {err}")))?
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EtlError> {
        let path = self.path.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || {
            let mut state = Self::read_all(&path)?;
            state.insert(key, value);
            Self::write_all(&path, &state)
        })
        .await
        .map_err(|err| EtlError::State(format!("state file writer panicked: {err}")))?
    }
}

/// Process-local store, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.lock().clone()
    }
}

impl CursorStore for MemoryCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EtlError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EtlError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store picked at runtime from configuration.
#[derive(Clone)]
pub enum AnyCursorStore {
    Postgres(PgCursorStore),
    File(JsonFileCursorStore),
    Memory(MemoryCursorStore),
}

impl AnyCursorStore {
    pub fn from_config(config: &EtlConfig, pool: Option<&PgPool>) -> Result<Self, EtlError> {
        match config.state_backend {
            CursorStoreKind::Postgres => pool
                .map(|pool| AnyCursorStore::Postgres(PgCursorStore::new(pool.clone())))
                .ok_or_else(|| {
                    EtlError::Config("postgres state backend requires DATABASE_URL".to_string())
                }),
            CursorStoreKind::File => Ok(AnyCursorStore::File(JsonFileCursorStore::new(
                config.state_path.clone(),
            ))),
            CursorStoreKind::Memory => Ok(AnyCursorStore::Memory(MemoryCursorStore::new())),
        }
    }
}

impl CursorStore for AnyCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EtlError> {
        match self {
            AnyCursorStore::Postgres(store) => store.get(key).await,
            AnyCursorStore::File(store) => store.get(key).await,
            AnyCursorStore::Memory(store) => store.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), EtlError> {
        match self {
            AnyCursorStore::Postgres(store) => store.set(key, value).await,
            AnyCursorStore::File(store) => store.set(key, value).await,
            AnyCursorStore::Memory(store) => store.set(key, value).await,
        }
    }
}
