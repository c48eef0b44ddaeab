//! Storage and permission backend traits.
//!
//! Every backend hands out single-use transactions. After `commit` or
//! `rollback` has been called once, every further call on the transaction
//! (including another `commit`) fails with [`StorageError::TxDone`].
//!
//! [`StorageError::TxDone`]: crate::error::StorageError::TxDone

use async_trait::async_trait;
use tessera_domain::{Ace, Condition, ConditionSet, Epoch, Object, Path, PermissionSet, SortOrder};

use crate::error::StorageResult;

/// Which objects a listing considers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Inclusion {
    /// Live objects only.
    #[default]
    Live,
    /// Live objects and tombstones.
    All,
}

/// Options of [`StorageTransaction::list_all`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Filters every returned object must match.
    pub condition: Condition,
    /// Keyset pagination conditions, any of which must match.
    pub pagination: ConditionSet,
    pub include: Inclusion,
    pub sort: Vec<SortOrder>,
    /// Maximum number of objects, 0 for no limit.
    pub limit: usize,
}

/// Options of [`StorageTransaction::count_all`].
#[derive(Debug, Clone, Default)]
pub struct CountOptions {
    pub condition: Condition,
}

/// An object read for update.
///
/// Obtained from [`StorageTransaction::get_for_update`], modified in place
/// and written back with [`StorageTransaction::update`].
#[derive(Debug, Clone)]
pub struct UpdateHandle {
    path: Path,
    object: Object,
}

impl UpdateHandle {
    pub fn new(path: Path, object: Object) -> Self {
        Self { path, object }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut Object {
        &mut self.object
    }

    pub fn into_object(self) -> Object {
        self.object
    }
}

/// Object storage backend.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Verifies the backend is reachable.
    async fn ping(&self) -> StorageResult<()>;

    /// Opens a transaction.
    async fn begin(&self) -> StorageResult<Box<dyn StorageTransaction>>;

    /// Releases backend resources.
    async fn close(&self) -> StorageResult<()>;
}

/// A unit of work against an object storage backend.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn commit(&mut self) -> StorageResult<()>;

    async fn rollback(&mut self) -> StorageResult<()>;

    /// Erases all objects, tombstones and namespace timestamps.
    async fn flush(&mut self) -> StorageResult<()>;

    /// Hard-deletes tombstones older than `older_than`, or all tombstones
    /// when `older_than` is zero. Returns the number of purged entries.
    async fn purge(&mut self, older_than: Epoch) -> StorageResult<i64>;

    /// Latest modification epoch of a namespace, zero if never written.
    /// Requires a node path.
    async fn mod_time(&mut self, path: &Path) -> StorageResult<Epoch>;

    /// Reports whether a live object exists at a leaf path.
    async fn exists(&mut self, path: &Path) -> StorageResult<bool>;

    /// Reads a live object.
    async fn get(&mut self, path: &Path) -> StorageResult<Object>;

    /// Reads a live object for a later [`update`](Self::update).
    async fn get_for_update(&mut self, path: &Path) -> StorageResult<UpdateHandle>;

    /// Stores a new object under a node path.
    ///
    /// An ID is minted when `obj.id` is empty. The object's modification
    /// time is set to the new namespace epoch.
    async fn create(&mut self, path: &Path, obj: &mut Object) -> StorageResult<()>;

    /// Writes back the object held by the handle and stamps its new epoch.
    async fn update(&mut self, handle: &mut UpdateHandle) -> StorageResult<()>;

    /// Soft-deletes the object at a leaf path together with every object
    /// nested below it. Returns the tombstone of the object itself.
    async fn delete(&mut self, path: &Path) -> StorageResult<Object>;

    /// Lists the objects of a namespace.
    async fn list_all(&mut self, path: &Path, opts: &ListOptions) -> StorageResult<Vec<Object>>;

    /// Counts the live objects of a namespace matching a condition.
    async fn count_all(&mut self, path: &Path, opts: &CountOptions) -> StorageResult<i64>;

    /// Deletes several leaf paths and their nested objects, skipping
    /// missing ones. Returns the highest tombstone epoch and the paths of
    /// the objects deleted directly.
    async fn delete_all(&mut self, paths: &[Path]) -> StorageResult<(Epoch, Vec<Path>)>;

    /// Number of live objects.
    async fn num_entries(&mut self) -> StorageResult<i64>;
}

/// Permission backend.
#[async_trait]
pub trait PermissionBackend: Send + Sync + 'static {
    async fn ping(&self) -> StorageResult<()>;

    async fn begin(&self) -> StorageResult<Box<dyn PermissionTransaction>>;

    async fn close(&self) -> StorageResult<()>;
}

/// A unit of work against a permission backend.
#[async_trait]
pub trait PermissionTransaction: Send {
    async fn commit(&mut self) -> StorageResult<()>;

    async fn rollback(&mut self) -> StorageResult<()>;

    /// Erases all principals and permissions.
    async fn flush(&mut self) -> StorageResult<()>;

    /// Principals of a user: the user itself, the implicit system groups
    /// and every principal linked explicitly. Sorted.
    async fn get_user_principals(&mut self, user_id: &str) -> StorageResult<Vec<String>>;

    /// Links a principal to each of the given users.
    async fn add_user_principal(&mut self, principal: &str, user_ids: &[String]) -> StorageResult<()>;

    /// Unlinks a principal from each of the given users.
    async fn remove_user_principal(&mut self, principal: &str, user_ids: &[String]) -> StorageResult<()>;

    /// Unlinks the given principals from every user.
    async fn purge_user_principals(&mut self, principals: &[String]) -> StorageResult<()>;

    /// Principals granted exactly this ACE. Sorted.
    async fn get_ace_principals(&mut self, ace: &Ace) -> StorageResult<Vec<String>>;

    async fn add_ace_principal(&mut self, principal: &str, ace: &Ace) -> StorageResult<()>;

    async fn remove_ace_principal(&mut self, principal: &str, ace: &Ace) -> StorageResult<()>;

    /// Union of the principals of every stored entry matched by any of the
    /// ACEs. Node-path ACEs match immediate children. Sorted.
    async fn get_all_ace_principals(&mut self, aces: &[Ace]) -> StorageResult<Vec<String>>;

    /// All permissions recorded on a path.
    async fn get_permissions(&mut self, path: &Path) -> StorageResult<PermissionSet>;

    /// Adds permissions, keeping existing ones.
    async fn create_permissions(&mut self, path: &Path, set: &PermissionSet) -> StorageResult<()>;

    /// Replaces the principals of each permission named in `set`; an empty
    /// list clears that permission. Other permissions are untouched.
    async fn merge_permissions(&mut self, path: &Path, set: &PermissionSet) -> StorageResult<()>;

    /// Deletes all permissions on the paths and on every path nested below.
    async fn delete_permissions(&mut self, paths: &[Path]) -> StorageResult<()>;

    /// Concrete paths matched by any ACE on which any of the principals is
    /// recorded. Sorted.
    async fn get_accessible_paths(&mut self, principals: &[String], aces: &[Ace]) -> StorageResult<Vec<Path>>;

    /// Number of principal links plus permission entries.
    async fn num_entries(&mut self) -> StorageResult<i64>;
}
