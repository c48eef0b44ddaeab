//! PostgreSQL object storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres, Row, Transaction};
use tessera_domain::{Epoch, Helpers, Object, Path};
use tracing::{debug, instrument};
use url::Url;

use super::query::{like_prefix, ObjectQuery};
use super::{
    check_schema_version, connect_pool, db_error, execute_with_timeout_and_metrics, ping,
    store_schema_version, PostgresConfig,
};
use crate::error::{StorageError, StorageResult};
use crate::traits::{
    CountOptions, Inclusion, ListOptions, StorageBackend, StorageTransaction, UpdateHandle,
};

const SCHEMA_VERSION: i32 = 1;
const SCHEMA_VERSION_FIELD: &str = "storage_schema_version";

const OBJECT_COLUMNS: &str = "SELECT id, last_modified, deleted, data FROM storage_objects";

/// Raises the epoch of a namespace to at least the candidate, or one past
/// its previous value, and returns it.
const SQL_BUMP_EPOCH: &str = r#"
INSERT INTO storage_timestamps (path, last_modified)
VALUES ($1, $2)
ON CONFLICT (path) DO UPDATE SET
  last_modified = GREATEST(EXCLUDED.last_modified, storage_timestamps.last_modified + 1)
RETURNING last_modified
"#;

/// Inserts an object, resurrecting a tombstone but never replacing a live
/// row. Returns no row on conflict with a live object.
const SQL_CREATE_OBJECT: &str = r#"
INSERT INTO storage_objects (path, id, data, last_modified, deleted)
VALUES ($1, $2, $3, $4, FALSE)
ON CONFLICT (path, id) DO UPDATE SET
  data = EXCLUDED.data,
  last_modified = EXCLUDED.last_modified,
  deleted = FALSE
WHERE storage_objects.deleted
RETURNING last_modified
"#;

const SQL_UPDATE_OBJECT: &str = r#"
INSERT INTO storage_objects (path, id, data, last_modified, deleted)
VALUES ($1, $2, $3, $4, FALSE)
ON CONFLICT (path, id) DO UPDATE SET
  data = EXCLUDED.data,
  last_modified = EXCLUDED.last_modified,
  deleted = FALSE
"#;

/// PostgreSQL implementation of [`StorageBackend`].
pub struct PostgresStorage {
    pool: PgPool,
    config: PostgresConfig,
    helpers: Arc<dyn Helpers>,
}

impl std::fmt::Debug for PostgresStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PostgresStorage {
    /// Wraps an existing pool. Does not run migrations.
    pub fn new(pool: PgPool, config: PostgresConfig, helpers: Arc<dyn Helpers>) -> Self {
        Self {
            pool,
            config,
            helpers,
        }
    }

    /// Connects, then creates or verifies the schema.
    #[instrument(skip(config, helpers))]
    pub async fn from_config(config: PostgresConfig, helpers: Arc<dyn Helpers>) -> StorageResult<Self> {
        let pool = connect_pool(&config).await?;
        let storage = Self::new(pool, config, helpers);
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Connects using a `postgres://` URL.
    pub async fn connect(url: &Url, helpers: Arc<dyn Helpers>) -> StorageResult<Self> {
        Self::from_config(PostgresConfig::from_url(url)?, helpers).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the object tables if missing.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> StorageResult<()> {
        let version = check_schema_version(&self.pool, SCHEMA_VERSION_FIELD, SCHEMA_VERSION).await?;
        if version == SCHEMA_VERSION {
            return Ok(());
        }
        debug!("Running storage migrations");

        let statements = [
            (
                "create storage_objects table",
                r#"
                CREATE TABLE IF NOT EXISTS storage_objects (
                    path TEXT NOT NULL,
                    id TEXT NOT NULL,
                    data JSONB NOT NULL DEFAULT '{}',
                    last_modified BIGINT NOT NULL,
                    deleted BOOLEAN NOT NULL DEFAULT FALSE,
                    PRIMARY KEY (path, id)
                )
                "#,
            ),
            (
                "create listing index",
                "CREATE INDEX IF NOT EXISTS idx_storage_objects_path_last_modified \
                 ON storage_objects (path, last_modified DESC)",
            ),
            (
                "create tombstone index",
                "CREATE INDEX IF NOT EXISTS idx_storage_objects_tombstones \
                 ON storage_objects (last_modified) WHERE deleted",
            ),
            (
                "create storage_timestamps table",
                r#"
                CREATE TABLE IF NOT EXISTS storage_timestamps (
                    path TEXT PRIMARY KEY,
                    last_modified BIGINT NOT NULL
                )
                "#,
            ),
        ];
        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::MigrationError {
                    message: format!("Failed to {what}: {e}"),
                })?;
        }

        store_schema_version(&self.pool, SCHEMA_VERSION_FIELD, SCHEMA_VERSION).await
    }
}

#[async_trait]
impl StorageBackend for PostgresStorage {
    async fn ping(&self) -> StorageResult<()> {
        ping(&self.pool, self.config.health_check_timeout()).await
    }

    #[instrument(skip(self))]
    async fn begin(&self) -> StorageResult<Box<dyn StorageTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError {
                message: format!("Failed to begin transaction: {e}"),
            })?;
        Ok(Box::new(PostgresStorageTx {
            tx: Some(tx),
            helpers: Arc::clone(&self.helpers),
            timeout: self.config.query_timeout(),
        }))
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Transaction of [`PostgresStorage`]. Dropping it without commit rolls
/// the database transaction back.
pub struct PostgresStorageTx {
    tx: Option<Transaction<'static, Postgres>>,
    helpers: Arc<dyn Helpers>,
    timeout: Duration,
}

impl PostgresStorageTx {
    fn conn(&mut self) -> StorageResult<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(StorageError::TxDone)
    }
}

fn require_node(path: &Path) -> StorageResult<()> {
    if path.is_node() {
        Ok(())
    } else {
        Err(StorageError::invalid_path(path))
    }
}

fn require_leaf(path: &Path) -> StorageResult<()> {
    if path.is_node() {
        Err(StorageError::invalid_path(path))
    } else {
        Ok(())
    }
}

fn row_to_object(row: &PgRow) -> StorageResult<Object> {
    let decode = |e: sqlx::Error| StorageError::SerializationError {
        message: format!("Failed to decode object row: {e}"),
    };
    let Json(data): Json<Value> = row.try_get("data").map_err(decode)?;
    Ok(Object {
        id: row.try_get("id").map_err(decode)?,
        mod_time: Epoch(row.try_get("last_modified").map_err(decode)?),
        deleted: row.try_get("deleted").map_err(decode)?,
        extra: into_map(data),
    })
}

fn into_map(data: Value) -> Map<String, Value> {
    match data {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn bump_epoch(conn: &mut PgConnection, ns: &str, now: Epoch) -> StorageResult<Epoch> {
    let epoch: i64 = sqlx::query_scalar(SQL_BUMP_EPOCH)
        .bind(ns)
        .bind(now.0)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("bump namespace epoch", ns))?;
    Ok(Epoch(epoch))
}

async fn fetch_object(conn: &mut PgConnection, path: &Path, for_update: bool) -> StorageResult<Object> {
    let (ns, id) = path.split();
    let sql = if for_update {
        format!("{OBJECT_COLUMNS} WHERE path = $1 AND id = $2 AND NOT deleted FOR UPDATE")
    } else {
        format!("{OBJECT_COLUMNS} WHERE path = $1 AND id = $2 AND NOT deleted")
    };
    let row = sqlx::query(&sql)
        .bind(ns)
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("get object", path.as_str()))?;
    row_to_object(&row)
}

async fn object_exists(conn: &mut PgConnection, ns: &str, id: &str) -> StorageResult<bool> {
    let found: Option<bool> = sqlx::query_scalar(
        "SELECT TRUE FROM storage_objects WHERE path = $1 AND id = $2 AND NOT deleted LIMIT 1",
    )
    .bind(ns)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("check object", ns))?;
    Ok(found.is_some())
}

async fn create_object(
    conn: &mut PgConnection,
    helpers: &dyn Helpers,
    path: &Path,
    obj: &mut Object,
) -> StorageResult<()> {
    let ns = path.namespace();
    let exists = |id: &str| StorageError::ObjectExists {
        path: path.with_object_id(id).into_string(),
    };

    if obj.id.is_empty() {
        obj.id = helpers.next_id();
    } else if object_exists(conn, ns, &obj.id).await? {
        return Err(exists(&obj.id));
    }

    let epoch = bump_epoch(conn, ns, Epoch::now()).await?;
    let created: Option<i64> = sqlx::query_scalar(SQL_CREATE_OBJECT)
        .bind(ns)
        .bind(&obj.id)
        .bind(Json(&obj.extra))
        .bind(epoch.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("create object", ns))?;
    if created.is_none() {
        return Err(exists(&obj.id));
    }

    obj.mod_time = epoch;
    obj.deleted = false;
    Ok(())
}

async fn update_object(conn: &mut PgConnection, handle: &mut UpdateHandle) -> StorageResult<()> {
    let path = handle.path().clone();
    let (ns, id) = path.split();
    let obj = handle.object_mut();
    if obj.id.is_empty() {
        obj.id = id.to_string();
    }

    let epoch = bump_epoch(conn, ns, Epoch::now()).await?;
    sqlx::query(SQL_UPDATE_OBJECT)
        .bind(ns)
        .bind(&obj.id)
        .bind(Json(&obj.extra))
        .bind(epoch.0)
        .execute(&mut *conn)
        .await
        .map_err(db_error("update object", path.as_str()))?;

    obj.mod_time = epoch;
    obj.deleted = false;
    Ok(())
}

/// Flags a live row as deleted under a fresh namespace epoch.
async fn tomb(conn: &mut PgConnection, ns: &str, id: &str, now: Epoch) -> StorageResult<Epoch> {
    let epoch = bump_epoch(conn, ns, now).await?;
    sqlx::query(
        "UPDATE storage_objects SET deleted = TRUE, last_modified = $3 \
         WHERE path = $1 AND id = $2 AND NOT deleted",
    )
    .bind(ns)
    .bind(id)
    .bind(epoch.0)
    .execute(&mut *conn)
    .await
    .map_err(db_error("delete object", ns))?;
    Ok(epoch)
}

/// Soft-deletes the object at `path` and everything nested below it.
async fn delete_object(
    conn: &mut PgConnection,
    path: &Path,
    now: Epoch,
    require_exact: bool,
) -> StorageResult<Option<Object>> {
    let (ns, id) = path.split();
    let data: Option<Json<Value>> = sqlx::query_scalar(
        "SELECT data FROM storage_objects WHERE path = $1 AND id = $2 AND NOT deleted FOR UPDATE",
    )
    .bind(ns)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("lock object", path.as_str()))?;

    let deleted = match data {
        Some(Json(data)) => {
            let epoch = tomb(conn, ns, id, now).await?;
            Some(Object {
                id: id.to_string(),
                mod_time: epoch,
                deleted: true,
                extra: into_map(data),
            })
        }
        None if require_exact => return Ok(None),
        None => None,
    };

    let pattern = format!("{}/%", like_prefix(path.as_str()));
    let nested: Vec<(String, String)> = sqlx::query_as(
        "SELECT path, id FROM storage_objects \
         WHERE path LIKE $1 AND NOT deleted ORDER BY path, id",
    )
    .bind(&pattern)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("list nested objects", path.as_str()))?;
    for (nns, nid) in nested {
        tomb(conn, &nns, &nid, now).await?;
    }

    Ok(deleted)
}

#[async_trait]
impl StorageTransaction for PostgresStorageTx {
    async fn commit(&mut self) -> StorageResult<()> {
        let tx = self.tx.take().ok_or(StorageError::TxDone)?;
        tx.commit().await.map_err(|e| StorageError::TransactionError {
            message: format!("Failed to commit transaction: {e}"),
        })?;
        debug!("storage transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        let tx = self.tx.take().ok_or(StorageError::TxDone)?;
        tx.rollback().await.map_err(|e| StorageError::TransactionError {
            message: format!("Failed to roll back transaction: {e}"),
        })?;
        debug!("storage transaction rolled back");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn flush(&mut self) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("flush", timeout, async {
            sqlx::query("TRUNCATE storage_objects, storage_timestamps")
                .execute(&mut *conn)
                .await
                .map_err(db_error("flush storage", ""))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn purge(&mut self, older_than: Epoch) -> StorageResult<i64> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("purge", timeout, async {
            let result = sqlx::query(
                "DELETE FROM storage_objects WHERE deleted AND ($1 OR last_modified < $2)",
            )
            .bind(older_than.is_zero())
            .bind(older_than.0)
            .execute(&mut *conn)
            .await
            .map_err(db_error("purge tombstones", ""))?;
            debug!(purged = result.rows_affected(), "purged tombstones");
            Ok(result.rows_affected() as i64)
        })
        .await
    }

    async fn mod_time(&mut self, path: &Path) -> StorageResult<Epoch> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        require_node(path)?;
        execute_with_timeout_and_metrics("mod_time", timeout, async {
            let epoch: Option<i64> =
                sqlx::query_scalar("SELECT last_modified FROM storage_timestamps WHERE path = $1")
                    .bind(path.namespace())
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(db_error("get namespace epoch", path.as_str()))?;
            Ok(epoch.map(Epoch).unwrap_or_default())
        })
        .await
    }

    async fn exists(&mut self, path: &Path) -> StorageResult<bool> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        require_leaf(path)?;
        let (ns, id) = path.split();
        execute_with_timeout_and_metrics("exists", timeout, object_exists(conn, ns, id)).await
    }

    async fn get(&mut self, path: &Path) -> StorageResult<Object> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        require_leaf(path)?;
        execute_with_timeout_and_metrics("get", timeout, fetch_object(conn, path, false)).await
    }

    async fn get_for_update(&mut self, path: &Path) -> StorageResult<UpdateHandle> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        require_leaf(path)?;
        let obj = execute_with_timeout_and_metrics("get_for_update", timeout, fetch_object(conn, path, true))
            .await?;
        Ok(UpdateHandle::new(path.clone(), obj))
    }

    #[instrument(skip(self, obj), fields(id = %obj.id))]
    async fn create(&mut self, path: &Path, obj: &mut Object) -> StorageResult<()> {
        let timeout = self.timeout;
        let helpers = Arc::clone(&self.helpers);
        let conn = self.conn()?;
        require_node(path)?;
        execute_with_timeout_and_metrics("create", timeout, create_object(conn, helpers.as_ref(), path, obj))
            .await
    }

    #[instrument(skip(self, handle), fields(path = %handle.path()))]
    async fn update(&mut self, handle: &mut UpdateHandle) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        require_leaf(handle.path())?;
        execute_with_timeout_and_metrics("update", timeout, update_object(conn, handle)).await
    }

    #[instrument(skip(self))]
    async fn delete(&mut self, path: &Path) -> StorageResult<Object> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        require_leaf(path)?;
        execute_with_timeout_and_metrics("delete", timeout, delete_object(conn, path, Epoch::now(), true))
            .await?
            .ok_or_else(|| StorageError::not_found(path))
    }

    async fn list_all(&mut self, path: &Path, opts: &ListOptions) -> StorageResult<Vec<Object>> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        require_node(path)?;

        let mut query = ObjectQuery::new(OBJECT_COLUMNS);
        query.namespace(path.namespace());
        query.inclusion(opts.include);
        query.condition(&opts.condition);
        query.pagination(&opts.pagination);
        query.order_by(&opts.sort);
        query.limit(opts.limit);
        debug!(sql = query.sql(), "listing objects");

        execute_with_timeout_and_metrics("list_all", timeout, async {
            let rows = query
                .builder()
                .build()
                .fetch_all(&mut *conn)
                .await
                .map_err(db_error("list objects", path.as_str()))?;
            rows.iter().map(row_to_object).collect()
        })
        .await
    }

    async fn count_all(&mut self, path: &Path, opts: &CountOptions) -> StorageResult<i64> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        require_node(path)?;

        let mut query = ObjectQuery::new("SELECT COUNT(*) FROM storage_objects");
        query.namespace(path.namespace());
        query.inclusion(Inclusion::Live);
        query.condition(&opts.condition);

        execute_with_timeout_and_metrics("count_all", timeout, async {
            query
                .builder()
                .build_query_scalar::<i64>()
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error("count objects", path.as_str()))
        })
        .await
    }

    #[instrument(skip(self, paths), fields(count = paths.len()))]
    async fn delete_all(&mut self, paths: &[Path]) -> StorageResult<(Epoch, Vec<Path>)> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        let now = Epoch::now();

        execute_with_timeout_and_metrics("delete_all", timeout, async {
            let mut mod_time = Epoch::ZERO;
            let mut deleted = Vec::new();
            for path in paths.iter().filter(|p| !p.is_node()) {
                if let Some(tomb) = delete_object(conn, path, now, false).await? {
                    mod_time = mod_time.max(tomb.mod_time);
                    deleted.push(path.clone());
                }
            }
            Ok((mod_time, deleted))
        })
        .await
    }

    async fn num_entries(&mut self) -> StorageResult<i64> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("num_entries", timeout, async {
            sqlx::query_scalar("SELECT COUNT(1) FROM storage_objects WHERE NOT deleted")
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error("count entries", ""))
        })
        .await
    }
}
