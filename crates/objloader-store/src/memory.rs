use std::collections::HashMap;
use std::sync::RwLock;

use objloader_types::{BaseId, Item};

use crate::error::StoreResult;
use crate::traits::ObjectStore;

/// In-memory, HashMap-based object store.
///
/// Intended for tests and embedding. Items are cloned on read and write.
pub struct InMemoryObjectStore {
    items: RwLock<HashMap<BaseId, Item>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// A store pre-populated with `items`.
    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let map = items
            .into_iter()
            .map(|item| (item.base_id.clone(), item))
            .collect();
        Self {
            items: RwLock::new(map),
        }
    }

    /// Sorted list of stored ids.
    pub fn all_ids(&self) -> Vec<BaseId> {
        let map = self.items.read().expect("lock poisoned");
        let mut ids: Vec<BaseId> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.items.write().expect("lock poisoned").clear();
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn get(&self, id: &BaseId) -> StoreResult<Option<Item>> {
        Ok(self.items.read().expect("lock poisoned").get(id).cloned())
    }

    fn get_many(&self, ids: &[BaseId]) -> StoreResult<Vec<Option<Item>>> {
        let map = self.items.read().expect("lock poisoned");
        Ok(ids.iter().map(|id| map.get(id).cloned()).collect())
    }

    fn put_batch(&self, items: &[Item]) -> StoreResult<usize> {
        let mut map = self.items.write().expect("lock poisoned");
        let mut stored = 0;
        for item in items {
            // Same id always means same content; keep the first copy.
            map.entry(item.base_id.clone()).or_insert_with(|| {
                stored += 1;
                item.clone()
            });
        }
        Ok(stored)
    }

    fn len(&self) -> usize {
        self.items.read().expect("lock poisoned").len()
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("item_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objloader_types::Base;
    use serde_json::json;

    fn item(id: &str) -> Item {
        Item::new(Base::new(id).with_field("payload", json!({ "n": id.len() })))
    }

    #[test]
    fn put_and_get() {
        let store = InMemoryObjectStore::new();
        assert_eq!(store.put_batch(&[item("a"), item("b")]).unwrap(), 2);
        assert_eq!(store.get(&BaseId::new("a")).unwrap(), Some(item("a")));
        assert!(store.get(&BaseId::new("zz")).unwrap().is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn double_write_is_idempotent() {
        let store = InMemoryObjectStore::new();
        store.put_batch(&[item("a")]).unwrap();
        assert_eq!(store.put_batch(&[item("a")]).unwrap(), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&BaseId::new("a")).unwrap(), Some(item("a")));
    }

    #[test]
    fn get_many_preserves_order() {
        let store = InMemoryObjectStore::with_items([item("a"), item("c")]);
        let ids: Vec<BaseId> = ["c", "b", "a"].into_iter().map(BaseId::from).collect();
        let got = store.get_many(&ids).unwrap();
        assert_eq!(got[0].as_ref().map(|i| i.base_id.as_str()), Some("c"));
        assert!(got[1].is_none());
        assert_eq!(got[2].as_ref().map(|i| i.base_id.as_str()), Some("a"));
    }

    #[test]
    fn all_ids_sorted_and_clear() {
        let store = InMemoryObjectStore::with_items([item("b"), item("a")]);
        assert_eq!(store.all_ids(), vec![BaseId::new("a"), BaseId::new("b")]);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn contains_uses_get() {
        let store = InMemoryObjectStore::with_items([item("a")]);
        assert!(store.contains(&BaseId::new("a")).unwrap());
        assert!(!store.contains(&BaseId::new("b")).unwrap());
    }
}
