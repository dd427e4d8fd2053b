use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// In-memory key/value map exposed to scripts as `kv`.
///
/// Readers (`get`, `keys`) share the lock; `set` and `delete` are exclusive.
/// Nothing is persisted.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: RwLock<HashMap<String, Value>>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.insert(key.into(), value);
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.remove(key).is_some()
    }

    /// All keys in ascending order.
    pub fn keys(&self) -> Vec<String> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = data.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
