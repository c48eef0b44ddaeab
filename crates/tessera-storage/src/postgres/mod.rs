//! PostgreSQL backends.
//!
//! Objects are stored as JSONB rows keyed by `(path, id)`, namespace epochs
//! in a high-water-mark table and permissions in two link tables. Every
//! statement runs inside the database transaction opened by `begin` and is
//! bounded by the configured query timeout.

mod objects;
mod permissions;
mod query;

use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, instrument};
use url::Url;

use crate::error::{StorageError, StorageResult};

pub use objects::{PostgresStorage, PostgresStorageTx};
pub use permissions::{PostgresPermissions, PostgresPermissionsTx};

/// Default query timeout in seconds.
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Default health check timeout in seconds.
const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// Connection string parameters consumed by [`PostgresConfig::from_url`].
const POOL_PARAMS: [&str; 4] = [
    "max_connections",
    "min_connections",
    "connect_timeout",
    "query_timeout",
];

/// PostgreSQL configuration options.
#[derive(Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    pub min_connections: u32,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Maximum time a single statement may take before it fails with
    /// `StorageError::QueryTimeout`.
    pub query_timeout_secs: u64,
    /// Timeout for pings in seconds.
    pub health_check_timeout_secs: u64,
}

// Custom Debug implementation to hide credentials in database_url
impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .field("health_check_timeout_secs", &self.health_check_timeout_secs)
            .finish()
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/tessera".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            health_check_timeout_secs: DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
        }
    }
}

impl PostgresConfig {
    /// Builds a configuration from a connection URL.
    ///
    /// The pool parameters `max_connections`, `min_connections`,
    /// `connect_timeout` and `query_timeout` (seconds) may be given as query
    /// parameters; they are removed from the URL handed to the driver.
    pub fn from_url(url: &Url) -> StorageResult<Self> {
        let mut config = Self::default();
        let mut retained = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "max_connections" => config.max_connections = parse_param(&key, &value)?,
                "min_connections" => config.min_connections = parse_param(&key, &value)?,
                "connect_timeout" => config.connect_timeout_secs = parse_param(&key, &value)?,
                "query_timeout" => config.query_timeout_secs = parse_param(&key, &value)?,
                _ => retained.push((key.to_string(), value.to_string())),
            }
        }

        let mut database_url = url.clone();
        database_url.set_query(None);
        if !retained.is_empty() {
            database_url.query_pairs_mut().extend_pairs(retained);
        }
        config.database_url = database_url.into();
        Ok(config)
    }

    pub(crate) fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub(crate) fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

fn parse_param<T: FromStr>(key: &str, value: &str) -> StorageResult<T> {
    value.parse().map_err(|_| StorageError::InvalidUrl {
        kind: "postgres",
        url: format!("{key}={value}"),
    })
}

/// Reports whether a query parameter is consumed by [`PostgresConfig`].
pub fn is_pool_param(key: &str) -> bool {
    POOL_PARAMS.contains(&key)
}

/// Opens a connection pool.
#[instrument(skip(config))]
pub(crate) async fn connect_pool(config: &PostgresConfig) -> StorageResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.database_url)
        .await
        .map_err(|e| StorageError::ConnectionError {
            message: e.to_string(),
        })
}

/// Wraps an async operation with a timeout and records metrics.
///
/// # Metrics
/// - `tessera_storage_query_duration_seconds` - Histogram of query durations
/// - `tessera_storage_query_timeout_total` - Counter of timeout events
pub(crate) async fn execute_with_timeout_and_metrics<T, F>(
    operation: &str,
    timeout: Duration,
    future: F,
) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, future).await;
    let duration = start.elapsed().as_secs_f64();

    let (status, final_result) = match result {
        Ok(Ok(value)) => ("success", Ok(value)),
        Ok(Err(e)) => ("error", Err(e)),
        Err(_elapsed) => (
            "timeout",
            Err(StorageError::QueryTimeout {
                operation: operation.to_string(),
                timeout,
            }),
        ),
    };

    metrics::histogram!(
        "tessera_storage_query_duration_seconds",
        "operation" => operation.to_string(),
        "backend" => "postgres",
        "status" => status.to_string()
    )
    .record(duration);

    if status == "timeout" {
        metrics::counter!(
            "tessera_storage_query_timeout_total",
            "operation" => operation.to_string(),
            "backend" => "postgres"
        )
        .increment(1);
    }

    final_result
}

/// Runs `SELECT 1` within the health check timeout.
pub(crate) async fn ping(pool: &PgPool, timeout: Duration) -> StorageResult<()> {
    execute_with_timeout_and_metrics("ping", timeout, async {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map_err(|e| StorageError::ConnectionError {
                message: format!("database ping failed: {e}"),
            })?;
        Ok(())
    })
    .await
}

/// Normalizes driver errors: missing rows become `NotFound`, everything
/// else a `QueryError` carrying `context`.
pub(crate) fn db_error(context: &'static str, path: &str) -> impl FnOnce(sqlx::Error) -> StorageError {
    let path = path.to_string();
    move |e| match e {
        sqlx::Error::RowNotFound => StorageError::NotFound { path },
        e => StorageError::QueryError {
            message: format!("Failed to {context}: {e}"),
        },
    }
}

/// Creates the metainfo table and checks the stored schema version.
///
/// Returns the stored version, 0 on a fresh database. A version newer than
/// `supported` is refused.
pub(crate) async fn check_schema_version(
    pool: &PgPool,
    field: &str,
    supported: i32,
) -> StorageResult<i32> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metainfo (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StorageError::MigrationError {
        message: format!("Failed to create metainfo table: {e}"),
    })?;

    let stored: Option<String> = sqlx::query_scalar("SELECT value FROM metainfo WHERE name = $1")
        .bind(field)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::MigrationError {
            message: format!("Failed to read {field}: {e}"),
        })?;

    let version = match stored {
        Some(raw) => raw.trim().parse::<i32>().map_err(|e| StorageError::MigrationError {
            message: format!("Invalid {field} {raw:?}: {e}"),
        })?,
        None => 0,
    };
    if version > supported {
        return Err(StorageError::MigrationError {
            message: format!("{field} {version} is newer than supported version {supported}"),
        });
    }
    debug!(field, version, supported, "Checked schema version");
    Ok(version)
}

/// Records the schema version in metainfo.
pub(crate) async fn store_schema_version(pool: &PgPool, field: &str, version: i32) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO metainfo (name, value) VALUES ($1, $2) \
         ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(field)
    .bind(version.to_string())
    .execute(pool)
    .await
    .map_err(|e| StorageError::MigrationError {
        message: format!("Failed to store {field}: {e}"),
    })?;
    Ok(())
}
