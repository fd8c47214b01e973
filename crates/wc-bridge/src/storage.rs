use crate::Result;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// String key-value persistence backing the session store.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: String) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// JSON values on top of any [`StorageAdapter`].
pub trait JsonStorage {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>>;
    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()>;
}

impl<S: StorageAdapter + ?Sized> JsonStorage for S {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, serde_json::to_string(value)?)
    }
}

/// Process-local storage, used by tests and embedders without persistence.
#[derive(Clone)]
pub struct InMemoryStorage {
    store: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        self.store.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.store.lock().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .store
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::{json, Value};

    #[test]
    fn test_list_is_sorted_and_prefix_scoped() {
        let storage = InMemoryStorage::new();
        storage.put("wc-session/b", "{}".to_string()).unwrap();
        storage.put("wc-session/a", "{}".to_string()).unwrap();
        storage.put("wc-context/a", "{}".to_string()).unwrap();

        assert_eq!(
            storage.list("wc-session/").unwrap(),
            vec!["wc-session/a".to_string(), "wc-session/b".to_string()]
        );
        storage.del("wc-session/a").unwrap();
        storage.del("wc-session/a").unwrap();
        assert_eq!(storage.list("wc-session/").unwrap().len(), 1);
    }

    #[test]
    fn test_json_values_through_a_trait_object() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        storage.put_json("k", &json!({ "account": "0x1" })).unwrap();

        let value: Value = storage.get_json("k").unwrap().unwrap();
        assert_eq!(value["account"], "0x1");
        assert!(storage.get_json::<Value>("missing").unwrap().is_none());

        storage.put("broken", "{".to_string()).unwrap();
        assert!(matches!(storage.get_json::<Value>("broken"), Err(Error::Json(_))));
    }
}
