use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{DataStore, Partition};
use crate::error::StoreError;

/// In-process [`DataStore`] for tests and ephemeral deployments.
///
/// `set_fail_writes(true)` makes every write and delete fail and
/// `set_fail_reads(true)` does the same for reads and lists, which is how
/// persistence failures are exercised.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(Partition, String), Value>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, op: &'static str, partition: Partition, path: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::persistence(
                op,
                format!("{}/{}", partition.as_str(), path),
                "store is read-only",
            ));
        }
        Ok(())
    }

    fn check_readable(&self, op: &'static str, partition: Partition, path: &str) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::persistence(
                op,
                format!("{}/{}", partition.as_str(), path),
                "store is unavailable",
            ));
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn read(&self, partition: Partition, path: &str) -> Result<Option<Value>, StoreError> {
        self.check_readable("read", partition, path)?;
        let entries = self.entries.read().await;
        Ok(entries.get(&(partition, path.to_string())).cloned())
    }

    async fn write(&self, partition: Partition, path: &str, value: Value) -> Result<(), StoreError> {
        self.check_writable("write", partition, path)?;
        self.entries.write().await.insert((partition, path.to_string()), value);
        Ok(())
    }

    async fn delete(&self, partition: Partition, path: &str) -> Result<(), StoreError> {
        self.check_writable("delete", partition, path)?;
        self.entries.write().await.remove(&(partition, path.to_string()));
        Ok(())
    }

    async fn list(&self, partition: Partition, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.check_readable("list", partition, prefix)?;
        let entries = self.entries.read().await;
        Ok(entries
            .range((partition, prefix.to_string())..)
            .take_while(|((p, path), _)| *p == partition && path.starts_with(prefix))
            .map(|((_, path), value)| (path.clone(), value.clone()))
            .collect())
    }
}
