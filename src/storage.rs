//! In-process key/value storage with prefix listing and named index sets.
//!
//! The sole authoritative state per spec §3/§5: every operation here is
//! individually consistent, but composite operations (write value + update
//! index) are not transactional — callers must tolerate a missing-from-index
//! entry on read.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;

struct Inner {
    entries: HashMap<String, serde_json::Value>,
    insertion_order: VecDeque<String>,
    indexes: HashMap<String, HashSet<String>>,
    max_entries: usize,
    eviction_batch_percent: f64,
}

impl Inner {
    fn evict_if_needed(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let batch = ((self.max_entries as f64) * self.eviction_batch_percent).ceil() as usize;
        let batch = batch.max(1);
        for _ in 0..batch {
            match self.insertion_order.pop_front() {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Memory-backed implementation of the storage contract.
pub struct Storage {
    inner: RwLock<Inner>,
}

impl Storage {
    pub fn new(max_entries: usize, eviction_batch_percent: f64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
                indexes: HashMap::new(),
                max_entries,
                eviction_batch_percent,
            }),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let json = serde_json::to_value(value)?;
        let mut inner = self.inner.write().await;
        if !inner.entries.contains_key(key) {
            inner.insertion_order.push_back(key.to_string());
        }
        inner.entries.insert(key.to_string(), json);
        inner.evict_if_needed();
        Ok(())
    }

    pub async fn delete(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.entries.remove(key);
    }

    pub async fn list(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub async fn get_batch<T: DeserializeOwned>(&self, keys: &[String]) -> HashMap<String, T> {
        let inner = self.inner.read().await;
        let mut out = HashMap::new();
        for key in keys {
            if let Some(v) = inner.entries.get(key) {
                if let Ok(parsed) = serde_json::from_value(v.clone()) {
                    out.insert(key.clone(), parsed);
                }
            }
        }
        out
    }

    pub async fn set_batch<T: Serialize>(&self, items: &[(String, T)]) -> anyhow::Result<()> {
        for (key, value) in items {
            self.set(key, value).await?;
        }
        Ok(())
    }

    pub async fn add_to_index(&self, index_key: &str, value: &str) {
        let mut inner = self.inner.write().await;
        inner
            .indexes
            .entry(index_key.to_string())
            .or_default()
            .insert(value.to_string());
    }

    /// Idempotent: removing an absent value is a no-op.
    pub async fn remove_from_index(&self, index_key: &str, value: &str) {
        let mut inner = self.inner.write().await;
        if let Some(set) = inner.indexes.get_mut(index_key) {
            set.remove(value);
        }
    }

    pub async fn get_index(&self, index_key: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .indexes
            .get(index_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes all entries and indexes. Mirrors the "closing the store"
    /// contract in spec §4.5.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.insertion_order.clear();
        inner.indexes.clear();
    }
}
