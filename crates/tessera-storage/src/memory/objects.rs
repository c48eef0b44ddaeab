//! In-memory object storage.
//!
//! Objects live in two namespace trees: the live tree and the dead tree of
//! tombstones. A single lock serializes transactions; each transaction
//! journals the namespaces it touches and restores them on rollback.
//!
//! Intended for development and testing only.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tessera_domain::filter::{matches_any, matches_condition};
use tessera_domain::sort::compare_objects;
use tessera_domain::{Epoch, Helpers, Object, Path};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use super::journal::Journal;
use crate::error::{StorageError, StorageResult};
use crate::traits::{
    CountOptions, Inclusion, ListOptions, StorageBackend, StorageTransaction, UpdateHandle,
};

/// Objects of one namespace and the latest epoch assigned in it.
#[derive(Debug, Clone, Default)]
struct Node {
    objects: BTreeMap<String, Object>,
    mod_time: Epoch,
}

impl Node {
    /// Stores a copy of `obj`, stamping it with the next namespace epoch.
    fn put(&mut self, obj: &mut Object, now: Epoch) {
        let epoch = now.after(self.mod_time);
        self.mod_time = epoch;
        obj.mod_time = epoch;
        self.objects.insert(obj.id.clone(), obj.clone());
    }

    /// Stores `obj` as is.
    fn force_put(&mut self, obj: Object) {
        self.objects.insert(obj.id.clone(), obj);
    }

    /// Removes an object and returns it as a tombstone stamped with the
    /// next namespace epoch.
    fn del(&mut self, object_id: &str, now: Epoch) -> Option<Object> {
        let mut obj = self.objects.remove(object_id)?;
        let epoch = now.after(self.mod_time);
        self.mod_time = epoch;
        obj.mod_time = epoch;
        obj.deleted = true;
        Some(obj)
    }
}

type Tree = HashMap<String, Node>;

#[derive(Debug, Clone, Default)]
struct Trees {
    live: Tree,
    dead: Tree,
}

/// In-memory implementation of [`StorageBackend`].
pub struct MemoryStorage {
    trees: Arc<Mutex<Trees>>,
    helpers: Arc<dyn Helpers>,
}

impl MemoryStorage {
    pub fn new(helpers: Arc<dyn Helpers>) -> Self {
        Self {
            trees: Arc::new(Mutex::new(Trees::default())),
            helpers,
        }
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage").finish_non_exhaustive()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    #[instrument(skip(self))]
    async fn begin(&self) -> StorageResult<Box<dyn StorageTransaction>> {
        let guard = Arc::clone(&self.trees).lock_owned().await;
        debug!("memory storage transaction started");
        Ok(Box::new(MemoryStorageTx {
            session: Some(Session::new(guard)),
            helpers: Arc::clone(&self.helpers),
        }))
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Exclusive access to the trees plus the undo state of one transaction.
struct Session {
    trees: OwnedMutexGuard<Trees>,
    live_undo: Journal<String, Node>,
    dead_undo: Journal<String, Node>,
    /// Trees as they were before the first flush.
    flushed: Option<Trees>,
}

impl Session {
    fn new(trees: OwnedMutexGuard<Trees>) -> Self {
        Self {
            trees,
            live_undo: Journal::default(),
            dead_undo: Journal::default(),
            flushed: None,
        }
    }

    // After a flush the snapshot already covers every namespace.
    fn touch_live(&mut self, ns: &str) {
        if self.flushed.is_none() {
            self.live_undo.record(&self.trees.live, ns);
        }
    }

    fn touch_dead(&mut self, ns: &str) {
        if self.flushed.is_none() {
            self.dead_undo.record(&self.trees.dead, ns);
        }
    }

    fn flush(&mut self) {
        let previous = std::mem::take(&mut *self.trees);
        if self.flushed.is_none() {
            self.flushed = Some(previous);
        }
    }

    fn rollback(self) {
        let Session {
            mut trees,
            live_undo,
            dead_undo,
            flushed,
        } = self;
        if let Some(snapshot) = flushed {
            *trees = snapshot;
        }
        live_undo.restore(&mut trees.live);
        dead_undo.restore(&mut trees.dead);
    }

    fn live_get(&self, path: &Path) -> Option<&Object> {
        let (ns, id) = path.split();
        self.trees.live.get(ns)?.objects.get(id)
    }

    fn unlink_dead(&mut self, ns: &str, object_id: &str) {
        let present = self
            .trees
            .dead
            .get(ns)
            .is_some_and(|node| node.objects.contains_key(object_id));
        if !present {
            return;
        }
        self.touch_dead(ns);
        if let Some(node) = self.trees.dead.get_mut(ns) {
            node.objects.remove(object_id);
            if node.objects.is_empty() {
                self.trees.dead.remove(ns);
            }
        }
    }

    fn put_live(&mut self, ns: &str, obj: &mut Object, now: Epoch) {
        self.touch_live(ns);
        self.trees
            .live
            .entry(ns.to_string())
            .or_default()
            .put(obj, now);
    }

    fn tomb(&mut self, ns: &str, obj: Object) {
        self.touch_dead(ns);
        self.trees
            .dead
            .entry(ns.to_string())
            .or_default()
            .force_put(obj);
    }

    /// Soft-deletes the object at `path` and everything nested below it.
    ///
    /// Returns the tombstone of the object itself. With `require_exact`,
    /// nested objects are left alone when the object does not exist.
    fn delete(&mut self, path: &Path, now: Epoch, require_exact: bool) -> Option<Object> {
        let (ns, id) = path.split();
        let exists = self
            .trees
            .live
            .get(ns)
            .is_some_and(|node| node.objects.contains_key(id));
        let deleted = if exists {
            self.touch_live(ns);
            let tomb = self
                .trees
                .live
                .get_mut(ns)
                .and_then(|node| node.del(id, now));
            if let Some(tomb) = &tomb {
                self.tomb(ns, tomb.clone());
            }
            tomb
        } else {
            None
        };
        if deleted.is_none() && require_exact {
            return None;
        }

        let prefix = format!("{path}/");
        let nested: Vec<String> = self
            .trees
            .live
            .iter()
            .filter(|(nns, node)| nns.starts_with(&prefix) && !node.objects.is_empty())
            .map(|(nns, _)| nns.clone())
            .collect();
        for nns in nested {
            self.touch_live(&nns);
            let tombs: Vec<Object> = match self.trees.live.get_mut(&nns) {
                Some(node) => {
                    let ids: Vec<String> = node.objects.keys().cloned().collect();
                    ids.iter().filter_map(|oid| node.del(oid, now)).collect()
                }
                None => Vec::new(),
            };
            for tomb in tombs {
                self.tomb(&nns, tomb);
            }
        }
        deleted
    }
}

/// Transaction of [`MemoryStorage`]. Holds the backend lock until it is
/// committed, rolled back or dropped.
pub struct MemoryStorageTx {
    session: Option<Session>,
    helpers: Arc<dyn Helpers>,
}

impl MemoryStorageTx {
    fn session(&mut self) -> StorageResult<&mut Session> {
        self.session.as_mut().ok_or(StorageError::TxDone)
    }
}

impl Drop for MemoryStorageTx {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("memory storage transaction dropped without commit, rolling back");
            session.rollback();
        }
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

#[async_trait]
impl StorageTransaction for MemoryStorageTx {
    async fn commit(&mut self) -> StorageResult<()> {
        self.session.take().ok_or(StorageError::TxDone)?;
        debug!("memory storage transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        let session = self.session.take().ok_or(StorageError::TxDone)?;
        session.rollback();
        debug!("memory storage transaction rolled back");
        Ok(())
    }

    async fn flush(&mut self) -> StorageResult<()> {
        self.session()?.flush();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge(&mut self, older_than: Epoch) -> StorageResult<i64> {
        let session = self.session()?;
        let namespaces: Vec<String> = session.trees.dead.keys().cloned().collect();

        let mut purged = 0i64;
        for ns in namespaces {
            session.touch_dead(&ns);
            let Some(node) = session.trees.dead.get_mut(&ns) else {
                continue;
            };
            let before = node.objects.len();
            if older_than.is_zero() {
                node.objects.clear();
            } else {
                node.objects.retain(|_, obj| obj.mod_time >= older_than);
            }
            purged += (before - node.objects.len()) as i64;
            if node.objects.is_empty() {
                session.trees.dead.remove(&ns);
            }
        }
        debug!(purged, "purged tombstones");
        Ok(purged)
    }

    async fn mod_time(&mut self, path: &Path) -> StorageResult<Epoch> {
        let session = self.session()?;
        require_node(path)?;
        Ok(session
            .trees
            .live
            .get(path.namespace())
            .map(|node| node.mod_time)
            .unwrap_or_default())
    }

    async fn exists(&mut self, path: &Path) -> StorageResult<bool> {
        let session = self.session()?;
        require_leaf(path)?;
        Ok(session.live_get(path).is_some())
    }

    async fn get(&mut self, path: &Path) -> StorageResult<Object> {
        let session = self.session()?;
        require_leaf(path)?;
        session
            .live_get(path)
            .cloned()
            .ok_or_else(|| StorageError::not_found(path))
    }

    async fn get_for_update(&mut self, path: &Path) -> StorageResult<UpdateHandle> {
        let obj = self.get(path).await?;
        Ok(UpdateHandle::new(path.clone(), obj))
    }

    #[instrument(skip(self, obj), fields(id = %obj.id))]
    async fn create(&mut self, path: &Path, obj: &mut Object) -> StorageResult<()> {
        let helpers = Arc::clone(&self.helpers);
        let session = self.session()?;
        require_node(path)?;

        let ns = path.namespace();
        if obj.id.is_empty() {
            obj.id = helpers.next_id();
        } else if session
            .trees
            .live
            .get(ns)
            .is_some_and(|node| node.objects.contains_key(&obj.id))
        {
            return Err(StorageError::ObjectExists {
                path: path.with_object_id(&obj.id).into_string(),
            });
        }

        obj.deleted = false;
        session.unlink_dead(ns, &obj.id);
        session.put_live(ns, obj, Epoch::now());
        Ok(())
    }

    #[instrument(skip(self, handle), fields(path = %handle.path()))]
    async fn update(&mut self, handle: &mut UpdateHandle) -> StorageResult<()> {
        let session = self.session()?;
        let path = handle.path().clone();
        require_leaf(&path)?;

        let (ns, id) = path.split();
        let obj = handle.object_mut();
        if obj.id.is_empty() {
            obj.id = id.to_string();
        }
        obj.deleted = false;
        session.unlink_dead(ns, &obj.id);
        session.put_live(ns, obj, Epoch::now());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&mut self, path: &Path) -> StorageResult<Object> {
        let session = self.session()?;
        require_leaf(path)?;
        session
            .delete(path, Epoch::now(), true)
            .ok_or_else(|| StorageError::not_found(path))
    }

    async fn list_all(&mut self, path: &Path, opts: &ListOptions) -> StorageResult<Vec<Object>> {
        let session = self.session()?;
        require_node(path)?;

        let ns = path.namespace();
        let mut trees = vec![&session.trees.live];
        if opts.include == Inclusion::All {
            trees.push(&session.trees.dead);
        }

        let mut objects: Vec<Object> = trees
            .into_iter()
            .filter_map(|tree| tree.get(ns))
            .flat_map(|node| node.objects.values())
            .filter(|obj| matches_condition(obj, &opts.condition))
            .filter(|obj| matches_any(obj, &opts.pagination))
            .cloned()
            .collect();

        if !opts.sort.is_empty() {
            objects.sort_by(|a, b| compare_objects(a, b, &opts.sort));
        }
        if opts.limit > 0 {
            objects.truncate(opts.limit);
        }
        Ok(objects)
    }

    async fn count_all(&mut self, path: &Path, opts: &CountOptions) -> StorageResult<i64> {
        let session = self.session()?;
        require_node(path)?;

        let count = session
            .trees
            .live
            .get(path.namespace())
            .map(|node| {
                node.objects
                    .values()
                    .filter(|obj| matches_condition(obj, &opts.condition))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as i64)
    }

    #[instrument(skip(self, paths), fields(count = paths.len()))]
    async fn delete_all(&mut self, paths: &[Path]) -> StorageResult<(Epoch, Vec<Path>)> {
        let session = self.session()?;
        let now = Epoch::now();

        let mut mod_time = Epoch::ZERO;
        let mut deleted = Vec::new();
        for path in paths.iter().filter(|p| !p.is_node()) {
            if let Some(tomb) = session.delete(path, now, false) {
                mod_time = mod_time.max(tomb.mod_time);
                deleted.push(path.clone());
            }
        }
        Ok((mod_time, deleted))
    }

    async fn num_entries(&mut self) -> StorageResult<i64> {
        let session = self.session()?;
        let count: usize = session.trees.live.values().map(|n| n.objects.len()).sum();
        Ok(count as i64)
    }
}
