//! Backend registries keyed by connection string scheme.
//!
//! Each backend family has one process-wide registry. Factories are
//! registered once during startup, before any backend is connected;
//! [`register_builtin`] adds the memory and PostgreSQL implementations.

use std::future::Future;
use std::sync::{Arc, LazyLock, Once};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tessera_domain::Helpers;
use tracing::debug;
use url::Url;

use crate::cache::{Cache, MemoryCache};
use crate::error::{StorageError, StorageResult};
use crate::memory::{MemoryPermissions, MemoryStorage};
use crate::postgres::{PostgresPermissions, PostgresStorage};
use crate::traits::{PermissionBackend, StorageBackend};

/// Builds a backend from a parsed connection URL.
pub type Factory<B> =
    Arc<dyn Fn(Url, Arc<dyn Helpers>) -> BoxFuture<'static, StorageResult<Arc<B>>> + Send + Sync>;

/// Maps connection string schemes to backend factories.
pub struct Registry<B: ?Sized> {
    kind: &'static str,
    factories: DashMap<String, Factory<B>>,
}

impl<B: ?Sized + Send + Sync + 'static> Registry<B> {
    /// Creates an empty registry. `kind` names the backend family in errors.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: DashMap::new(),
        }
    }

    /// Registers the factory for a scheme.
    ///
    /// # Panics
    ///
    /// Panics if the scheme is already registered. Registration happens at
    /// startup, where a collision is a programming error.
    pub fn register<F, Fut>(&self, scheme: &str, factory: F)
    where
        F: Fn(Url, Arc<dyn Helpers>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StorageResult<Arc<B>>> + Send + 'static,
    {
        match self.factories.entry(scheme.to_string()) {
            Entry::Occupied(_) => panic!("{} backend {scheme:?} registered twice", self.kind),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(move |url: Url, helpers: Arc<dyn Helpers>| {
                    factory(url, helpers).boxed()
                }));
            }
        }
        debug!(kind = self.kind, scheme, "registered backend");
    }

    /// Connects the backend selected by the scheme of `dsn`.
    pub async fn connect(&self, dsn: &str, helpers: Arc<dyn Helpers>) -> StorageResult<Arc<B>> {
        let url = Url::parse(dsn).map_err(|_| StorageError::InvalidUrl {
            kind: self.kind,
            url: dsn.to_string(),
        })?;
        let factory = self
            .factories
            .get(url.scheme())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StorageError::UnknownScheme {
                kind: self.kind,
                scheme: url.scheme().to_string(),
            })?;
        debug!(kind = self.kind, scheme = url.scheme(), "connecting backend");
        factory(url, helpers).await
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        schemes.sort();
        schemes
    }
}

static STORAGE: LazyLock<Registry<dyn StorageBackend>> = LazyLock::new(|| Registry::new("storage"));
static PERMISSION: LazyLock<Registry<dyn PermissionBackend>> =
    LazyLock::new(|| Registry::new("permission"));
static CACHE: LazyLock<Registry<dyn Cache>> = LazyLock::new(|| Registry::new("cache"));

/// The storage backend registry.
pub fn storage() -> &'static Registry<dyn StorageBackend> {
    &STORAGE
}

/// The permission backend registry.
pub fn permission() -> &'static Registry<dyn PermissionBackend> {
    &PERMISSION
}

/// The cache registry.
pub fn cache() -> &'static Registry<dyn Cache> {
    &CACHE
}

/// Registers the built-in backends. Safe to call more than once.
pub fn register_builtin() {
    static BUILTIN: Once = Once::new();
    BUILTIN.call_once(|| {
        storage().register("memory", connect_memory_storage);
        storage().register("postgres", connect_postgres_storage);
        storage().register("postgresql", connect_postgres_storage);

        permission().register("memory", connect_memory_permissions);
        permission().register("postgres", connect_postgres_permissions);
        permission().register("postgresql", connect_postgres_permissions);

        cache().register("memory", connect_memory_cache);
    });
}

async fn connect_memory_storage(_: Url, helpers: Arc<dyn Helpers>) -> StorageResult<Arc<dyn StorageBackend>> {
    Ok(Arc::new(MemoryStorage::new(helpers)))
}

async fn connect_postgres_storage(url: Url, helpers: Arc<dyn Helpers>) -> StorageResult<Arc<dyn StorageBackend>> {
    Ok(Arc::new(PostgresStorage::connect(&url, helpers).await?))
}

async fn connect_memory_permissions(_: Url, _: Arc<dyn Helpers>) -> StorageResult<Arc<dyn PermissionBackend>> {
    Ok(Arc::new(MemoryPermissions::new()))
}

async fn connect_postgres_permissions(url: Url, _: Arc<dyn Helpers>) -> StorageResult<Arc<dyn PermissionBackend>> {
    Ok(Arc::new(PostgresPermissions::connect(&url).await?))
}

async fn connect_memory_cache(_: Url, _: Arc<dyn Helpers>) -> StorageResult<Arc<dyn Cache>> {
    Ok(Arc::new(MemoryCache::default()))
}
