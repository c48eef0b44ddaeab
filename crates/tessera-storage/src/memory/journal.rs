//! Undo journal for the in-memory backends.
//!
//! A transaction records the original value of every map entry the first
//! time it touches it. Restoring the journal writes those values back (or
//! removes entries that did not exist), leaving untouched entries alone.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
pub(crate) struct Journal<K, V> {
    saved: HashMap<K, Option<V>>,
}

impl<K, V> Default for Journal<K, V> {
    fn default() -> Self {
        Self {
            saved: HashMap::new(),
        }
    }
}

impl<K, V> Journal<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Saves the current state of `key` unless it was saved before.
    pub(crate) fn record<Q>(&mut self, map: &HashMap<K, V>, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ToOwned<Owned = K> + ?Sized,
    {
        if !self.saved.contains_key(key) {
            self.saved.insert(key.to_owned(), map.get(key).cloned());
        }
    }

    /// Writes every saved entry back into `map`.
    pub(crate) fn restore(self, map: &mut HashMap<K, V>) {
        for (key, value) in self.saved {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }
}
