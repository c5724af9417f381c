//! Fault injection around [`MemoryStore`] for failure-path tests.

use super::{KeyValue, KvStore, LeaseRenewer, MemoryStore, StoreError, WatchReceiver};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Delegates to a [`MemoryStore`], failing deletes on demand and optionally
/// rewriting one key right after the next prefix read.
#[derive(Default)]
pub(crate) struct FaultyStore {
    pub inner: MemoryStore,
    fail_deletes: AtomicBool,
    write_after_list: Mutex<Option<(String, Vec<u8>)>>,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite `key` with `value` once, just after the next `get_prefix`
    /// has taken its snapshot.
    pub fn write_after_next_list(&self, key: &str, value: Vec<u8>) {
        *self.write_after_list.lock() = Some((key.to_string(), value));
    }

    fn check_delete(&self) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("delete rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FaultyStore {
    async fn lease_grant(&self, ttl: i64) -> Result<i64, StoreError> {
        self.inner.lease_grant(ttl).await
    }

    async fn lease_keep_alive(&self, lease_id: i64) -> Result<Box<dyn LeaseRenewer>, StoreError> {
        self.inner.lease_keep_alive(lease_id).await
    }

    async fn lease_revoke(&self, lease_id: i64) -> Result<(), StoreError> {
        self.inner.lease_revoke(lease_id).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<(), StoreError> {
        self.inner.put(key, value, lease).await
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: i64,
    ) -> Result<bool, StoreError> {
        self.inner.create_if_absent(key, value, lease).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let snapshot = self.inner.get_prefix(prefix).await?;
        let pending = self.write_after_list.lock().take();
        if let Some((key, value)) = pending {
            self.inner.put(&key, value, None).await?;
        }
        Ok(snapshot)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.inner.count_prefix(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_delete()?;
        self.inner.delete(key).await
    }

    async fn delete_if_value(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        self.check_delete()?;
        self.inner.delete_if_value(key, expected).await
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchReceiver, StoreError> {
        self.inner.watch_prefix(prefix).await
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.inner.health().await
    }
}
