//! Process-lifetime storage backed by a concurrent map.

use super::KvStore;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-memory storage. Contents are lost when the process exits.
///
/// Cloning shares the same map.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<DashMap<String, String>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Simulate the medium going away; every call fails until restored.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("in-memory store unavailable".to_string()));
        }
        Ok(())
    }
}

impl KvStore for InMemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_available()?;
        self.records.insert(key.to_string(), value.to_string());
        debug!("✓ Memory PUT {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        Ok(self.records.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        self.records.remove(key);
        debug!("✓ Memory DELETE {}", key);
        Ok(())
    }
}
