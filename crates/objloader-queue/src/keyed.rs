use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Insertion-ordered map: re-adding a key replaces its value but keeps its
/// original position.
#[derive(Debug)]
pub struct KeyedQueue<K, V> {
    values: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> KeyedQueue<K, V> {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Insert or replace. Returns `true` if the key was new.
    pub fn upsert(&mut self, key: K, value: V) -> bool {
        if let Some(slot) = self.values.get_mut(&key) {
            *slot = value;
            return false;
        }
        self.order.push_back(key.clone());
        self.values.insert(key, value);
        true
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Remove and return up to `n` values from the front, oldest first.
    pub fn take_front(&mut self, n: usize) -> Vec<V> {
        let n = n.min(self.order.len());
        let mut out = Vec::with_capacity(n);
        for key in self.order.drain(..n) {
            if let Some(v) = self.values.remove(&key) {
                out.push(v);
            }
        }
        out
    }

    pub fn take_all(&mut self) -> Vec<V> {
        self.take_front(self.order.len())
    }
}

impl<K: Eq + Hash + Clone, V> Default for KeyedQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
