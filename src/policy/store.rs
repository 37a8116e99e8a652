//! Per-evaluator storage: an in-memory map from policy name to an opaque
//! JSON object, mutated only through write transactions. Every reload builds
//! a fresh store, so policies must treat their stored state as best-effort.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::policy::errors::PolicyError;

#[derive(Debug, Default)]
pub struct Store {
    objects: RwLock<BTreeMap<String, Value>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored object for a policy, as of now. Policies that were never
    /// written read as an empty object.
    pub fn read(&self, policy: &str) -> Value {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(policy)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Open a write transaction. Writes are staged and applied atomically on
    /// commit; dropping the transaction without committing aborts it.
    pub fn begin_write(&self) -> StoreTransaction<'_> {
        StoreTransaction {
            store: self,
            staged: BTreeMap::new(),
        }
    }
}

#[must_use = "a transaction does nothing unless committed"]
pub struct StoreTransaction<'a> {
    store: &'a Store,
    staged: BTreeMap<String, Value>,
}

impl StoreTransaction<'_> {
    pub fn write(&mut self, policy: &str, value: Value) -> Result<(), PolicyError> {
        if !value.is_object() {
            return Err(PolicyError::StorageWrite(format!(
                "value for policy `{policy}` is not an object"
            )));
        }
        self.staged.insert(policy.to_string(), value);
        Ok(())
    }

    pub fn commit(self) {
        let mut objects = self
            .store
            .objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (policy, value) in self.staged {
            objects.insert(policy, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwritten_policy_reads_empty_object() {
        let store = Store::new();
        assert_eq!(store.read("nope"), json!({}));
    }

    #[test]
    fn test_commit_applies_staged_writes() {
        let store = Store::new();
        let mut tx = store.begin_write();
        tx.write("a", json!({"seen": 1})).unwrap();
        tx.write("b", json!({})).unwrap();
        tx.commit();
        assert_eq!(store.read("a"), json!({"seen": 1}));
        assert_eq!(store.policy_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_drop_without_commit_aborts() {
        let store = Store::new();
        {
            let mut tx = store.begin_write();
            tx.write("a", json!({"seen": 1})).unwrap();
        }
        assert_eq!(store.read("a"), json!({}));
    }

    #[test]
    fn test_non_object_write_rejected() {
        let store = Store::new();
        let mut tx = store.begin_write();
        assert!(tx.write("a", json!("scalar")).is_err());
    }
}
