//! Backend bootstrap.
//!
//! [`Services`] connects the storage, permission and cache backends named
//! by the configuration and opens the paired transactions a request works
//! in.

use std::sync::Arc;
use std::time::Duration;

use tessera_domain::Helpers;
use tessera_storage::postgres::is_pool_param;
use tessera_storage::{
    registry, spend_nonce, Cache, PermissionBackend, PermissionTransaction, StorageBackend,
    StorageResult, StorageTransaction,
};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{BackendSettings, PaginationSettings, ServerConfig};

/// Connected backends.
pub struct Services {
    storage: Arc<dyn StorageBackend>,
    permission: Arc<dyn PermissionBackend>,
    cache: Arc<dyn Cache>,
    pagination: PaginationSettings,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("pagination", &self.pagination)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Connects every backend named in `config`.
    #[instrument(skip_all)]
    pub async fn connect(config: &ServerConfig, helpers: Arc<dyn Helpers>) -> StorageResult<Self> {
        registry::register_builtin();

        let storage = registry::storage()
            .connect(&backend_dsn(&config.storage), Arc::clone(&helpers))
            .await?;
        let permission = registry::permission()
            .connect(&backend_dsn(&config.permission), Arc::clone(&helpers))
            .await?;
        let cache = registry::cache().connect(&config.cache.url, helpers).await?;

        info!(
            storage = scheme(&config.storage.url),
            permission = scheme(&config.permission.url),
            cache = scheme(&config.cache.url),
            "backends connected"
        );
        Ok(Self::new(storage, permission, cache, config.pagination.clone()))
    }

    /// Wraps already connected backends.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        permission: Arc<dyn PermissionBackend>,
        cache: Arc<dyn Cache>,
        pagination: PaginationSettings,
    ) -> Self {
        Self {
            storage,
            permission,
            cache,
            pagination,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn permission(&self) -> &Arc<dyn PermissionBackend> {
        &self.permission
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn pagination(&self) -> &PaginationSettings {
        &self.pagination
    }

    /// Pings every backend.
    pub async fn ping(&self) -> StorageResult<()> {
        self.storage.ping().await?;
        self.permission.ping().await?;
        self.cache.ping().await
    }

    /// Opens a storage and a permission transaction. The storage
    /// transaction is rolled back if the permission one cannot be opened.
    pub async fn begin(&self) -> StorageResult<RequestTxn> {
        let mut store = self.storage.begin().await?;
        let perms = match self.permission.begin().await {
            Ok(perms) => perms,
            Err(e) => {
                if let Err(rollback) = store.rollback().await {
                    warn!(error = %rollback, "failed to roll back storage transaction");
                }
                return Err(e);
            }
        };
        Ok(RequestTxn { store, perms })
    }

    /// Stores a fresh pagination nonce valid for the configured lifetime.
    pub async fn issue_nonce(&self) -> StorageResult<String> {
        let nonce = format!("pagination-token-{}", Uuid::new_v4());
        let ttl = Duration::from_secs(self.pagination.token_validity_secs);
        self.cache.set(&nonce, b"1".to_vec(), ttl).await?;
        debug!(%nonce, ?ttl, "issued pagination nonce");
        Ok(nonce)
    }

    /// Spends a nonce issued by [`issue_nonce`](Self::issue_nonce).
    pub async fn spend_nonce(&self, nonce: &str) -> StorageResult<()> {
        spend_nonce(self.cache.as_ref(), nonce).await
    }

    /// Closes every backend.
    pub async fn close(&self) -> StorageResult<()> {
        self.storage.close().await?;
        self.permission.close().await?;
        self.cache.close().await
    }
}

/// The storage and permission transactions of one request.
///
/// Both are committed or rolled back together, on a best-effort basis: a
/// failure on one does not undo the other.
pub struct RequestTxn {
    pub store: Box<dyn StorageTransaction>,
    pub perms: Box<dyn PermissionTransaction>,
}

impl RequestTxn {
    /// Commits both transactions and returns the first error.
    pub async fn commit(mut self) -> StorageResult<()> {
        let store = self.store.commit().await;
        let perms = self.perms.commit().await;
        store.and(perms)
    }

    /// Rolls back both transactions and returns the first error.
    pub async fn rollback(mut self) -> StorageResult<()> {
        let store = self.store.rollback().await;
        let perms = self.perms.rollback().await;
        store.and(perms)
    }
}

fn scheme(dsn: &str) -> &str {
    dsn.split_once(':').map_or(dsn, |(scheme, _)| scheme)
}

/// Appends the pool settings to PostgreSQL connection strings, unless the
/// string already carries them.
fn backend_dsn(settings: &BackendSettings) -> String {
    let Ok(mut url) = Url::parse(&settings.url) else {
        return settings.url.clone();
    };
    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return settings.url.clone();
    }

    let present: Vec<String> = url
        .query_pairs()
        .map(|(key, _)| key.into_owned())
        .filter(|key| is_pool_param(key))
        .collect();
    let defaults = [
        ("max_connections", settings.max_connections.to_string()),
        ("connect_timeout", settings.connect_timeout_secs.to_string()),
        ("query_timeout", settings.query_timeout_secs.to_string()),
    ];
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &defaults {
            if !present.iter().any(|p| p == key) {
                pairs.append_pair(key, value);
            }
        }
    }
    url.into()
}
