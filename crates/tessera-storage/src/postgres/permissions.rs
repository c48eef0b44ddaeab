//! PostgreSQL permission storage.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{PgConnection, Postgres, QueryBuilder, Transaction};
use tessera_domain::permission::implicit_principals;
use tessera_domain::{Ace, Path, PermissionSet};
use tracing::{debug, instrument};
use url::Url;

use super::query::like_prefix;
use super::{
    check_schema_version, connect_pool, db_error, execute_with_timeout_and_metrics, ping,
    store_schema_version, PostgresConfig,
};
use crate::error::{StorageError, StorageResult};
use crate::traits::{PermissionBackend, PermissionTransaction};

const SCHEMA_VERSION: i32 = 1;
const SCHEMA_VERSION_FIELD: &str = "permission_schema_version";

/// PostgreSQL implementation of [`PermissionBackend`].
pub struct PostgresPermissions {
    pool: PgPool,
    config: PostgresConfig,
}

impl std::fmt::Debug for PostgresPermissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPermissions")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PostgresPermissions {
    /// Wraps an existing pool. Does not run migrations.
    pub fn new(pool: PgPool, config: PostgresConfig) -> Self {
        Self { pool, config }
    }

    /// Connects, then creates or verifies the schema.
    #[instrument(skip(config))]
    pub async fn from_config(config: PostgresConfig) -> StorageResult<Self> {
        let pool = connect_pool(&config).await?;
        let permissions = Self::new(pool, config);
        permissions.run_migrations().await?;
        Ok(permissions)
    }

    /// Connects using a `postgres://` URL.
    pub async fn connect(url: &Url) -> StorageResult<Self> {
        Self::from_config(PostgresConfig::from_url(url)?).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the permission tables if missing.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> StorageResult<()> {
        let version = check_schema_version(&self.pool, SCHEMA_VERSION_FIELD, SCHEMA_VERSION).await?;
        if version == SCHEMA_VERSION {
            return Ok(());
        }
        debug!("Running permission migrations");

        let statements = [
            (
                "create permission_paths table",
                r#"
                CREATE TABLE IF NOT EXISTS permission_paths (
                    path TEXT NOT NULL,
                    permission TEXT NOT NULL,
                    principal TEXT NOT NULL,
                    PRIMARY KEY (path, permission, principal)
                )
                "#,
            ),
            (
                "create permission lookup index",
                "CREATE INDEX IF NOT EXISTS idx_permission_paths_principal \
                 ON permission_paths (principal, permission)",
            ),
            (
                "create permission_principals table",
                r#"
                CREATE TABLE IF NOT EXISTS permission_principals (
                    user_id TEXT NOT NULL,
                    principal TEXT NOT NULL,
                    PRIMARY KEY (user_id, principal)
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
impl PermissionBackend for PostgresPermissions {
    async fn ping(&self) -> StorageResult<()> {
        ping(&self.pool, self.config.health_check_timeout()).await
    }

    #[instrument(skip(self))]
    async fn begin(&self) -> StorageResult<Box<dyn PermissionTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError {
                message: format!("Failed to begin transaction: {e}"),
            })?;
        Ok(Box::new(PostgresPermissionsTx {
            tx: Some(tx),
            timeout: self.config.query_timeout(),
        }))
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Transaction of [`PostgresPermissions`].
pub struct PostgresPermissionsTx {
    tx: Option<Transaction<'static, Postgres>>,
    timeout: Duration,
}

impl PostgresPermissionsTx {
    fn conn(&mut self) -> StorageResult<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(StorageError::TxDone)
    }
}

/// Appends `( (permission = $ AND path ...) OR ... )` for the ACEs.
///
/// Leaf ACEs match their path exactly, node ACEs every immediate child of
/// their namespace.
fn push_ace_constraints(builder: &mut QueryBuilder<'static, Postgres>, aces: &[Ace]) {
    builder.push("(");
    for (i, ace) in aces.iter().enumerate() {
        if i > 0 {
            builder.push(" OR ");
        }
        builder.push("(permission = ");
        builder.push_bind(ace.perm.clone());
        if ace.path.is_node() {
            let prefix = format!("{}/", like_prefix(ace.path.namespace()));
            builder.push(" AND path LIKE ");
            builder.push_bind(format!("{prefix}%"));
            builder.push(" AND path NOT LIKE ");
            builder.push_bind(format!("{prefix}%/%"));
        } else {
            builder.push(" AND path = ");
            builder.push_bind(ace.path.as_str().to_string());
        }
        builder.push(")");
    }
    builder.push(")");
}

async fn insert_entries(
    conn: &mut PgConnection,
    path: &Path,
    entries: Vec<(String, String)>,
) -> StorageResult<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO permission_paths (path, permission, principal) ",
    );
    builder.push_values(entries, |mut row, (perm, principal)| {
        row.push_bind(path.as_str().to_string())
            .push_bind(perm)
            .push_bind(principal);
    });
    builder.push(" ON CONFLICT DO NOTHING");
    builder
        .build()
        .execute(&mut *conn)
        .await
        .map_err(db_error("insert permissions", path.as_str()))?;
    Ok(())
}

fn flatten(set: &PermissionSet) -> Vec<(String, String)> {
    set.iter()
        .flat_map(|(perm, principals)| principals.iter().map(move |p| (perm.clone(), p.clone())))
        .collect()
}

#[async_trait]
impl PermissionTransaction for PostgresPermissionsTx {
    async fn commit(&mut self) -> StorageResult<()> {
        let tx = self.tx.take().ok_or(StorageError::TxDone)?;
        tx.commit().await.map_err(|e| StorageError::TransactionError {
            message: format!("Failed to commit transaction: {e}"),
        })
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        let tx = self.tx.take().ok_or(StorageError::TxDone)?;
        tx.rollback().await.map_err(|e| StorageError::TransactionError {
            message: format!("Failed to roll back transaction: {e}"),
        })
    }

    #[instrument(skip(self))]
    async fn flush(&mut self) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("flush_permissions", timeout, async {
            sqlx::query("TRUNCATE permission_paths, permission_principals")
                .execute(&mut *conn)
                .await
                .map_err(db_error("flush permissions", ""))?;
            Ok(())
        })
        .await
    }

    async fn get_user_principals(&mut self, user_id: &str) -> StorageResult<Vec<String>> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        let ids = implicit_principals(user_id);
        execute_with_timeout_and_metrics("get_user_principals", timeout, async {
            let linked: Vec<String> = sqlx::query_scalar(
                "SELECT DISTINCT principal FROM permission_principals WHERE user_id = ANY($1)",
            )
            .bind(&ids)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("get user principals", user_id))?;

            let set: BTreeSet<String> = ids.iter().cloned().chain(linked).collect();
            Ok(set.into_iter().collect())
        })
        .await
    }

    async fn add_user_principal(&mut self, principal: &str, user_ids: &[String]) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        if user_ids.is_empty() {
            return Ok(());
        }
        execute_with_timeout_and_metrics("add_user_principal", timeout, async {
            let mut builder =
                QueryBuilder::<Postgres>::new("INSERT INTO permission_principals (user_id, principal) ");
            builder.push_values(user_ids, |mut row, user_id| {
                row.push_bind(user_id.clone()).push_bind(principal.to_string());
            });
            builder.push(" ON CONFLICT DO NOTHING");
            builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(db_error("add user principal", principal))?;
            Ok(())
        })
        .await
    }

    async fn remove_user_principal(&mut self, principal: &str, user_ids: &[String]) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("remove_user_principal", timeout, async {
            sqlx::query("DELETE FROM permission_principals WHERE principal = $1 AND user_id = ANY($2)")
                .bind(principal)
                .bind(user_ids)
                .execute(&mut *conn)
                .await
                .map_err(db_error("remove user principal", principal))?;
            Ok(())
        })
        .await
    }

    async fn purge_user_principals(&mut self, principals: &[String]) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("purge_user_principals", timeout, async {
            let result = sqlx::query("DELETE FROM permission_principals WHERE principal = ANY($1)")
                .bind(principals)
                .execute(&mut *conn)
                .await
                .map_err(db_error("purge user principals", ""))?;
            debug!(removed = result.rows_affected(), "purged principal links");
            Ok(())
        })
        .await
    }

    async fn get_ace_principals(&mut self, ace: &Ace) -> StorageResult<Vec<String>> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("get_ace_principals", timeout, async {
            sqlx::query_scalar(
                "SELECT principal FROM permission_paths \
                 WHERE path = $1 AND permission = $2 ORDER BY principal",
            )
            .bind(ace.path.as_str())
            .bind(&ace.perm)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("get ace principals", ace.path.as_str()))
        })
        .await
    }

    async fn add_ace_principal(&mut self, principal: &str, ace: &Ace) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics(
            "add_ace_principal",
            timeout,
            insert_entries(conn, &ace.path, vec![(ace.perm.clone(), principal.to_string())]),
        )
        .await
    }

    async fn remove_ace_principal(&mut self, principal: &str, ace: &Ace) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("remove_ace_principal", timeout, async {
            sqlx::query(
                "DELETE FROM permission_paths WHERE path = $1 AND permission = $2 AND principal = $3",
            )
            .bind(ace.path.as_str())
            .bind(&ace.perm)
            .bind(principal)
            .execute(&mut *conn)
            .await
            .map_err(db_error("remove ace principal", ace.path.as_str()))?;
            Ok(())
        })
        .await
    }

    async fn get_all_ace_principals(&mut self, aces: &[Ace]) -> StorageResult<Vec<String>> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        if aces.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Postgres>::new("SELECT DISTINCT principal FROM permission_paths WHERE ");
        push_ace_constraints(&mut builder, aces);
        builder.push(" ORDER BY principal");

        execute_with_timeout_and_metrics("get_all_ace_principals", timeout, async {
            builder
                .build_query_scalar::<String>()
                .fetch_all(&mut *conn)
                .await
                .map_err(db_error("get all ace principals", ""))
        })
        .await
    }

    async fn get_permissions(&mut self, path: &Path) -> StorageResult<PermissionSet> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("get_permissions", timeout, async {
            let rows: Vec<(String, String)> = sqlx::query_as(
                "SELECT permission, principal FROM permission_paths \
                 WHERE path = $1 ORDER BY permission, principal",
            )
            .bind(path.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("get permissions", path.as_str()))?;

            let mut set = PermissionSet::new();
            for (perm, principal) in rows {
                set.entry(perm).or_default().push(principal);
            }
            Ok(set)
        })
        .await
    }

    #[instrument(skip(self, set))]
    async fn create_permissions(&mut self, path: &Path, set: &PermissionSet) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("create_permissions", timeout, insert_entries(conn, path, flatten(set)))
            .await
    }

    #[instrument(skip(self, set))]
    async fn merge_permissions(&mut self, path: &Path, set: &PermissionSet) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        if set.is_empty() {
            return Ok(());
        }
        let perms: Vec<String> = set.keys().cloned().collect();
        execute_with_timeout_and_metrics("merge_permissions", timeout, async {
            sqlx::query("DELETE FROM permission_paths WHERE path = $1 AND permission = ANY($2)")
                .bind(path.as_str())
                .bind(&perms)
                .execute(&mut *conn)
                .await
                .map_err(db_error("clear merged permissions", path.as_str()))?;
            insert_entries(conn, path, flatten(set)).await
        })
        .await
    }

    #[instrument(skip(self, paths), fields(count = paths.len()))]
    async fn delete_permissions(&mut self, paths: &[Path]) -> StorageResult<()> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        if paths.is_empty() {
            return Ok(());
        }
        let exact: Vec<String> = paths.iter().map(|p| p.as_str().to_string()).collect();
        let nested: Vec<String> = paths
            .iter()
            .map(|p| format!("{}/%", like_prefix(p.as_str())))
            .collect();
        execute_with_timeout_and_metrics("delete_permissions", timeout, async {
            let result = sqlx::query(
                "DELETE FROM permission_paths WHERE path = ANY($1) OR path LIKE ANY($2)",
            )
            .bind(&exact)
            .bind(&nested)
            .execute(&mut *conn)
            .await
            .map_err(db_error("delete permissions", ""))?;
            debug!(removed = result.rows_affected(), "deleted permission entries");
            Ok(())
        })
        .await
    }

    async fn get_accessible_paths(&mut self, principals: &[String], aces: &[Ace]) -> StorageResult<Vec<Path>> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        if principals.is_empty() || aces.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Postgres>::new("SELECT DISTINCT path FROM permission_paths WHERE principal = ANY(");
        builder.push_bind(principals.to_vec());
        builder.push(") AND ");
        push_ace_constraints(&mut builder, aces);
        builder.push(" ORDER BY path");

        execute_with_timeout_and_metrics("get_accessible_paths", timeout, async {
            let paths = builder
                .build_query_scalar::<String>()
                .fetch_all(&mut *conn)
                .await
                .map_err(db_error("get accessible paths", ""))?;
            Ok(paths.into_iter().map(Path::from).collect())
        })
        .await
    }

    async fn num_entries(&mut self) -> StorageResult<i64> {
        let timeout = self.timeout;
        let conn = self.conn()?;
        execute_with_timeout_and_metrics("num_permission_entries", timeout, async {
            sqlx::query_scalar(
                "SELECT (SELECT COUNT(1) FROM permission_paths) \
                      + (SELECT COUNT(1) FROM permission_principals)",
            )
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error("count permission entries", ""))
        })
        .await
    }
}
