//! In-memory keyspace backing one database: a value table plus an expire
//! table keyed by absolute unix milliseconds. Expired keys are collected
//! lazily on lookup and in bounded batches by the cron sweep.

use cinder_core::keyspace::Keyspace;
use cinder_core::object::Obj;
use hashbrown::HashMap;

pub struct MemoryStore {
    data: HashMap<Vec<u8>, Obj>,
    expires: HashMap<Vec<u8>, u64>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore { data: HashMap::new(), expires: HashMap::new() }
    }

    #[inline]
    fn expired(&self, key: &[u8], now_ms: u64) -> bool {
        match self.expires.get(key) {
            Some(&at) => at <= now_ms,
            None => false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

impl Keyspace for MemoryStore {
    fn lookup(&mut self, key: &[u8], now_ms: u64) -> Option<Obj> {
        if self.expired(key, now_ms) {
            self.data.remove(key);
            self.expires.remove(key);
            return None;
        }
        self.data.get(key).cloned()
    }

    fn add(&mut self, key: &[u8], value: Obj) {
        self.data.insert(key.to_vec(), value);
        self.expires.remove(key);
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key);
        self.data.remove(key).is_some()
    }

    fn set_expire(&mut self, key: &[u8], at_ms: u64) {
        if self.data.contains_key(key) {
            self.expires.insert(key.to_vec(), at_ms);
        }
    }

    fn get_expire(&self, key: &[u8]) -> Option<u64> {
        self.expires.get(key).copied()
    }

    fn remove_expire(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key).is_some()
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn sweep_expired(&mut self, now_ms: u64, limit: usize) -> Vec<Vec<u8>> {
        let doomed: Vec<Vec<u8>> = self
            .expires
            .iter()
            .filter(|(_, &at)| at <= now_ms)
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &doomed {
            self.data.remove(key.as_slice());
            self.expires.remove(key.as_slice());
        }
        doomed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(bytes: &[u8]) -> Obj {
        Obj::new_string_raw(bytes.to_vec())
    }

    #[test]
    fn test_add_lookup_delete() {
        let mut store = MemoryStore::new();
        store.add(b"k", obj(b"v"));
        assert!(store.lookup(b"k", 0).is_some());
        assert_eq!(store.len(), 1);
        assert!(store.delete(b"k"));
        assert!(!store.delete(b"k"));
        assert!(store.lookup(b"k", 0).is_none());
    }

    #[test]
    fn test_lazy_expiration() {
        let mut store = MemoryStore::new();
        store.add(b"k", obj(b"v"));
        store.set_expire(b"k", 100);

        assert!(store.lookup(b"k", 99).is_some());
        assert!(store.lookup(b"k", 100).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_add_clears_previous_expire() {
        let mut store = MemoryStore::new();
        store.add(b"k", obj(b"v1"));
        store.set_expire(b"k", 100);
        store.add(b"k", obj(b"v2"));
        assert_eq!(store.get_expire(b"k"), None);
        assert!(store.lookup(b"k", 500).is_some());
    }

    #[test]
    fn test_expire_requires_key() {
        let mut store = MemoryStore::new();
        store.set_expire(b"ghost", 100);
        assert_eq!(store.get_expire(b"ghost"), None);
    }

    #[test]
    fn test_sweep_bounded() {
        let mut store = MemoryStore::new();
        for i in 0..10u8 {
            let key = vec![b'k', i];
            store.add(&key, obj(b"v"));
            store.set_expire(&key, 10);
        }
        let first = store.sweep_expired(100, 4);
        assert_eq!(first.len(), 4);
        let rest = store.sweep_expired(100, 100);
        assert_eq!(rest.len(), 6);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_persist() {
        let mut store = MemoryStore::new();
        store.add(b"k", obj(b"v"));
        store.set_expire(b"k", 100);
        assert!(store.remove_expire(b"k"));
        assert!(!store.remove_expire(b"k"));
        assert!(store.lookup(b"k", 1000).is_some());
    }
}
