//! In-memory implementation of the persistence port.
//!
//! Backs the CLI's batch mode and the test suite. A `BTreeMap` keeps keys
//! ordered so prefix scans come back sorted, matching what a real ordered
//! key-value backend would return.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{BatchOp, PersistenceError, PersistencePort};

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.lock().expect("memory store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistencePort for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let mut data = self.data.lock().expect("memory store poisoned");
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let data = self.data.lock().expect("memory store poisoned");
        Ok(data.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        let mut data = self.data.lock().expect("memory store poisoned");
        data.remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let data = self.data.lock().expect("memory store poisoned");
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn atomic_batch(&self, ops: Vec<BatchOp>) -> Result<(), PersistenceError> {
        // Single lock held across the whole batch gives all-or-nothing
        // semantics for free: no partial state is ever observable.
        let mut data = self.data.lock().expect("memory store poisoned");
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
