//! In-memory object stores fed by the watch loops.
//!
//! The cluster-API side hands each controller a stream of typed events;
//! the store is the local indexer the reconcilers read current state from,
//! so syncs always observe the latest object rather than the event that
//! enqueued them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A keyed snapshot store for watched objects.
pub struct ObjectStore<K> {
    objects: Arc<RwLock<HashMap<String, K>>>,
}

impl<K> Clone for ObjectStore<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<K> Default for ObjectStore<K>
where
    K: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ObjectStore<K>
where
    K: Clone,
{
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, key: &str) -> Option<K> {
        self.objects.read().unwrap().get(key).cloned()
    }

    /// Insert or replace, returning the previous object if any.
    pub fn insert(&self, key: &str, object: K) -> Option<K> {
        self.objects
            .write()
            .unwrap()
            .insert(key.to_string(), object)
    }

    pub fn remove(&self, key: &str) -> Option<K> {
        self.objects.write().unwrap().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().unwrap().keys().cloned().collect()
    }

    /// All objects matching a predicate; the poor man's secondary index.
    pub fn list_filtered(&self, predicate: impl Fn(&K) -> bool) -> Vec<K> {
        self.objects
            .read()
            .unwrap()
            .values()
            .filter(|obj| predicate(obj))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_roundtrip() {
        let store: ObjectStore<String> = ObjectStore::new();
        assert!(store.insert("a", "1".to_string()).is_none());
        assert_eq!(store.insert("a", "2".to_string()), Some("1".to_string()));
        assert_eq!(store.get("a"), Some("2".to_string()));
        assert_eq!(store.remove("a"), Some("2".to_string()));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_list_filtered() {
        let store: ObjectStore<i32> = ObjectStore::new();
        store.insert("a", 1);
        store.insert("b", 2);
        store.insert("c", 3);
        let mut odd = store.list_filtered(|v| v % 2 == 1);
        odd.sort();
        assert_eq!(odd, vec![1, 3]);
    }
}
