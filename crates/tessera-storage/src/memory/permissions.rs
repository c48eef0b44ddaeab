//! In-memory permission storage.
//!
//! Shares the locking and rollback model of the in-memory object storage:
//! one open transaction at a time, with user links journaled per user ID and
//! permission entries journaled per path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tessera_domain::{Ace, Path, PermissionSet, AUTHENTICATED, EVERYONE};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use super::journal::Journal;
use crate::error::{StorageError, StorageResult};
use crate::traits::{PermissionBackend, PermissionTransaction};

type Principals = BTreeSet<String>;
type Entries = BTreeMap<String, Principals>;

#[derive(Debug, Clone, Default)]
struct Tables {
    /// Explicit principals per user ID.
    users: HashMap<String, Principals>,
    /// Principals per permission per path.
    perms: HashMap<Path, Entries>,
}

/// In-memory implementation of [`PermissionBackend`].
#[derive(Debug, Default)]
pub struct MemoryPermissions {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryPermissions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermissionBackend for MemoryPermissions {
    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    #[instrument(skip(self))]
    async fn begin(&self) -> StorageResult<Box<dyn PermissionTransaction>> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        debug!("memory permission transaction started");
        Ok(Box::new(MemoryPermissionsTx {
            session: Some(Session::new(guard)),
        }))
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

struct Session {
    tables: OwnedMutexGuard<Tables>,
    users_undo: Journal<String, Principals>,
    perms_undo: Journal<Path, Entries>,
    flushed: Option<Tables>,
}

impl Session {
    fn new(tables: OwnedMutexGuard<Tables>) -> Self {
        Self {
            tables,
            users_undo: Journal::default(),
            perms_undo: Journal::default(),
            flushed: None,
        }
    }

    fn touch_user(&mut self, user_id: &str) {
        if self.flushed.is_none() {
            self.users_undo.record(&self.tables.users, user_id);
        }
    }

    fn touch_path(&mut self, path: &Path) {
        if self.flushed.is_none() {
            self.perms_undo.record(&self.tables.perms, path);
        }
    }

    fn flush(&mut self) {
        let previous = std::mem::take(&mut *self.tables);
        if self.flushed.is_none() {
            self.flushed = Some(previous);
        }
    }

    fn rollback(self) {
        let Session {
            mut tables,
            users_undo,
            perms_undo,
            flushed,
        } = self;
        if let Some(snapshot) = flushed {
            *tables = snapshot;
        }
        users_undo.restore(&mut tables.users);
        perms_undo.restore(&mut tables.perms);
    }

    /// Applies `f` to the entries of `path`, dropping the path once empty.
    fn edit_path(&mut self, path: &Path, f: impl FnOnce(&mut Entries)) {
        self.touch_path(path);
        let entries = self.tables.perms.entry(path.clone()).or_default();
        f(entries);
        entries.retain(|_, principals| !principals.is_empty());
        if entries.is_empty() {
            self.tables.perms.remove(path);
        }
    }

    fn edit_user(&mut self, user_id: &str, f: impl FnOnce(&mut Principals)) {
        self.touch_user(user_id);
        let principals = self.tables.users.entry(user_id.to_string()).or_default();
        f(principals);
        if principals.is_empty() {
            self.tables.users.remove(user_id);
        }
    }

    fn ace_principals(&self, ace: &Ace) -> Option<&Principals> {
        self.tables.perms.get(&ace.path)?.get(&ace.perm)
    }
}

/// Transaction of [`MemoryPermissions`].
pub struct MemoryPermissionsTx {
    session: Option<Session>,
}

impl MemoryPermissionsTx {
    fn session(&mut self) -> StorageResult<&mut Session> {
        self.session.as_mut().ok_or(StorageError::TxDone)
    }
}

impl Drop for MemoryPermissionsTx {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("memory permission transaction dropped without commit, rolling back");
            session.rollback();
        }
    }
}

#[async_trait]
impl PermissionTransaction for MemoryPermissionsTx {
    async fn commit(&mut self) -> StorageResult<()> {
        self.session.take().ok_or(StorageError::TxDone)?;
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        let session = self.session.take().ok_or(StorageError::TxDone)?;
        session.rollback();
        Ok(())
    }

    async fn flush(&mut self) -> StorageResult<()> {
        self.session()?.flush();
        Ok(())
    }

    async fn get_user_principals(&mut self, user_id: &str) -> StorageResult<Vec<String>> {
        let session = self.session()?;
        let users = &session.tables.users;
        let linked = |id: &str| users.get(id).into_iter().flatten().cloned();

        let mut set: Principals = linked(user_id).collect();
        set.insert(user_id.to_string());
        match user_id {
            EVERYONE => {}
            AUTHENTICATED => {
                set.insert(EVERYONE.to_string());
                set.extend(linked(EVERYONE));
            }
            _ => {
                set.insert(AUTHENTICATED.to_string());
                set.insert(EVERYONE.to_string());
                set.extend(linked(AUTHENTICATED));
                set.extend(linked(EVERYONE));
            }
        }
        Ok(set.into_iter().collect())
    }

    async fn add_user_principal(&mut self, principal: &str, user_ids: &[String]) -> StorageResult<()> {
        let session = self.session()?;
        for user_id in user_ids {
            session.edit_user(user_id, |set| {
                set.insert(principal.to_string());
            });
        }
        Ok(())
    }

    async fn remove_user_principal(&mut self, principal: &str, user_ids: &[String]) -> StorageResult<()> {
        let session = self.session()?;
        for user_id in user_ids {
            if session.tables.users.contains_key(user_id.as_str()) {
                session.edit_user(user_id, |set| {
                    set.remove(principal);
                });
            }
        }
        Ok(())
    }

    async fn purge_user_principals(&mut self, principals: &[String]) -> StorageResult<()> {
        let session = self.session()?;
        if principals.is_empty() {
            return Ok(());
        }
        let affected: Vec<String> = session
            .tables
            .users
            .iter()
            .filter(|(_, set)| principals.iter().any(|p| set.contains(p)))
            .map(|(user_id, _)| user_id.clone())
            .collect();
        for user_id in affected {
            session.edit_user(&user_id, |set| {
                for principal in principals {
                    set.remove(principal);
                }
            });
        }
        Ok(())
    }

    async fn get_ace_principals(&mut self, ace: &Ace) -> StorageResult<Vec<String>> {
        let session = self.session()?;
        Ok(session
            .ace_principals(ace)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_ace_principal(&mut self, principal: &str, ace: &Ace) -> StorageResult<()> {
        let session = self.session()?;
        session.edit_path(&ace.path, |entries| {
            entries
                .entry(ace.perm.clone())
                .or_default()
                .insert(principal.to_string());
        });
        Ok(())
    }

    async fn remove_ace_principal(&mut self, principal: &str, ace: &Ace) -> StorageResult<()> {
        let session = self.session()?;
        if session.ace_principals(ace).is_some_and(|set| set.contains(principal)) {
            session.edit_path(&ace.path, |entries| {
                if let Some(set) = entries.get_mut(&ace.perm) {
                    set.remove(principal);
                }
            });
        }
        Ok(())
    }

    async fn get_all_ace_principals(&mut self, aces: &[Ace]) -> StorageResult<Vec<String>> {
        let session = self.session()?;
        let mut union = Principals::new();
        for (path, entries) in &session.tables.perms {
            for ace in aces.iter().filter(|ace| ace.path.contains(path)) {
                if let Some(set) = entries.get(&ace.perm) {
                    union.extend(set.iter().cloned());
                }
            }
        }
        Ok(union.into_iter().collect())
    }

    async fn get_permissions(&mut self, path: &Path) -> StorageResult<PermissionSet> {
        let session = self.session()?;
        Ok(session
            .tables
            .perms
            .get(path)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(perm, set)| (perm.clone(), set.iter().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self, set))]
    async fn create_permissions(&mut self, path: &Path, set: &PermissionSet) -> StorageResult<()> {
        let session = self.session()?;
        if set.values().all(Vec::is_empty) {
            return Ok(());
        }
        session.edit_path(path, |entries| {
            for (perm, principals) in set {
                entries
                    .entry(perm.clone())
                    .or_default()
                    .extend(principals.iter().cloned());
            }
        });
        Ok(())
    }

    #[instrument(skip(self, set))]
    async fn merge_permissions(&mut self, path: &Path, set: &PermissionSet) -> StorageResult<()> {
        let session = self.session()?;
        if set.is_empty() {
            return Ok(());
        }
        session.edit_path(path, |entries| {
            for (perm, principals) in set {
                entries.insert(perm.clone(), principals.iter().cloned().collect());
            }
        });
        Ok(())
    }

    #[instrument(skip(self, paths), fields(count = paths.len()))]
    async fn delete_permissions(&mut self, paths: &[Path]) -> StorageResult<()> {
        let session = self.session()?;
        let doomed: Vec<Path> = session
            .tables
            .perms
            .keys()
            .filter(|stored| paths.iter().any(|p| is_same_or_nested(stored, p)))
            .cloned()
            .collect();
        for path in doomed {
            session.touch_path(&path);
            session.tables.perms.remove(&path);
        }
        Ok(())
    }

    async fn get_accessible_paths(&mut self, principals: &[String], aces: &[Ace]) -> StorageResult<Vec<Path>> {
        let session = self.session()?;
        if principals.is_empty() || aces.is_empty() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<Path> = session
            .tables
            .perms
            .iter()
            .filter(|(path, entries)| {
                entries.iter().any(|(perm, allowed)| {
                    aces.iter().any(|ace| ace.perm == *perm && ace.path.contains(path))
                        && principals.iter().any(|p| allowed.contains(p))
                })
            })
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn num_entries(&mut self) -> StorageResult<i64> {
        let session = self.session()?;
        let links: usize = session.tables.users.values().map(BTreeSet::len).sum();
        let entries: usize = session
            .tables
            .perms
            .values()
            .flat_map(BTreeMap::values)
            .map(BTreeSet::len)
            .sum();
        Ok((links + entries) as i64)
    }
}

/// True if `stored` equals `root` or lies below it.
fn is_same_or_nested(stored: &Path, root: &Path) -> bool {
    stored == root
        || stored
            .as_str()
            .strip_prefix(root.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}
