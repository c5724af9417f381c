//! In-Memory Store
//!
//! A single-process stand-in for etcd with the semantics the coordinator relies
//! on: leases expire on the tokio clock and take their keys with them, creates
//! are atomic, and prefix watches see every put and delete.
//!
//! Lease expiry is evaluated lazily at the start of every operation, so tests
//! running with a paused clock advance deterministically.

use super::{KeyValue, KvStore, LeaseRenewer, StoreError, WatchEvent, WatchEventKind, WatchReceiver};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct StoredValue {
    value: Vec<u8>,
    lease: Option<i64>,
}

#[derive(Debug)]
struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, StoredValue>,
    leases: HashMap<i64, LeaseEntry>,
    next_lease_id: i64,
    watchers: Vec<Watcher>,
    unavailable: bool,
}

impl MemoryState {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn expire_leases(&mut self) {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            trace!(lease_id = lease_id, "Lease expired");
            self.drop_lease(lease_id);
        }
    }

    fn drop_lease(&mut self, lease_id: i64) -> bool {
        if self.leases.remove(&lease_id).is_none() {
            return false;
        }

        let bound: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, stored)| stored.lease == Some(lease_id))
            .map(|(key, _)| key.clone())
            .collect();

        for key in bound {
            self.entries.remove(&key);
            self.notify(WatchEventKind::Delete, &key);
        }
        true
    }

    fn check_lease(&self, lease: Option<i64>) -> Result<(), StoreError> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => Err(StoreError::LeaseNotFound(id)),
            _ => Ok(()),
        }
    }

    fn write(&mut self, key: &str, value: Vec<u8>, lease: Option<i64>) {
        self.entries
            .insert(key.to_string(), StoredValue { value, lease });
        self.notify(WatchEventKind::Put, key);
    }

    fn notify(&mut self, kind: WatchEventKind, key: &str) {
        self.watchers.retain(|watcher| {
            if !key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(WatchEvent {
                    kind,
                    key: key.to_string(),
                })
                .is_ok()
        });
    }
}

/// In-process store with etcd-like lease semantics
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Drop every watch sender, closing all open watch streams.
    pub fn close_watches(&self) {
        self.state.lock().watchers.clear();
    }

    /// Number of leases currently alive.
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.expire_leases();
        state.leases.len()
    }

    /// Lease bound to `key`, if any.
    pub fn lease_of(&self, key: &str) -> Option<i64> {
        let mut state = self.state.lock();
        state.expire_leases();
        state.entries.get(key).and_then(|stored| stored.lease)
    }
}

struct MemoryLeaseRenewer {
    store: MemoryStore,
    lease_id: i64,
}

#[async_trait]
impl LeaseRenewer for MemoryLeaseRenewer {
    async fn renew(&mut self) -> Result<Option<i64>, StoreError> {
        let mut state = self.store.state.lock();
        state.check_available()?;
        state.expire_leases();

        match state.leases.get_mut(&self.lease_id) {
            Some(lease) => {
                lease.deadline = Instant::now() + lease.ttl;
                Ok(Some(lease.ttl.as_secs() as i64))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn lease_grant(&self, ttl: i64) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        state.next_lease_id += 1;
        let lease_id = state.next_lease_id;
        let ttl = Duration::from_secs(ttl.max(1) as u64);
        state.leases.insert(
            lease_id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(lease_id)
    }

    async fn lease_keep_alive(&self, lease_id: i64) -> Result<Box<dyn LeaseRenewer>, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        if !state.leases.contains_key(&lease_id) {
            return Err(StoreError::LeaseNotFound(lease_id));
        }
        Ok(Box::new(MemoryLeaseRenewer {
            store: self.clone(),
            lease_id,
        }))
    }

    async fn lease_revoke(&self, lease_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        if state.drop_lease(lease_id) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease_id))
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();
        state.check_lease(lease)?;

        state.write(key, value, lease);
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.check_lease(Some(lease))?;

        state.write(key, value, Some(lease));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        Ok(state.entries.get(key).map(|stored| stored.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| KeyValue {
                key: key.clone(),
                value: stored.value.clone(),
            })
            .collect())
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .count())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        if state.entries.remove(key).is_some() {
            state.notify(WatchEventKind::Delete, key);
        }
        Ok(())
    }

    async fn delete_if_value(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        if state.entries.get(key).map(|stored| stored.value.as_slice()) != Some(expected) {
            return Ok(false);
        }
        state.entries.remove(key);
        state.notify(WatchEventKind::Delete, key);
        Ok(true)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchReceiver, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire_leases();

        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.state.lock().check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(10).await.unwrap();

        assert!(store.create_if_absent("/k", b"a".to_vec(), lease).await.unwrap());
        assert!(!store.create_if_absent("/k", b"b".to_vec(), lease).await.unwrap());
        assert_eq!(store.get("/k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_put_requires_live_lease() {
        let store = MemoryStore::new();
        let err = store.put("/k", b"v".to_vec(), Some(99)).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseNotFound(99)));
    }

    #[tokio::test]
    async fn test_revoke_cascades_to_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(10).await.unwrap();
        store.put("/a/1", b"x".to_vec(), Some(lease)).await.unwrap();
        store.put("/a/2", b"y".to_vec(), None).await.unwrap();

        store.lease_revoke(lease).await.unwrap();

        assert_eq!(store.get("/a/1").await.unwrap(), None);
        assert_eq!(store.count_prefix("/a/").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_renewal() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(10).await.unwrap();
        store.put("/a/1", b"x".to_vec(), Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.count_prefix("/a/").await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.count_prefix("/a/").await.unwrap(), 0);
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_extends_deadline() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(10).await.unwrap();
        store.put("/a/1", b"x".to_vec(), Some(lease)).await.unwrap();
        let mut renewer = store.lease_keep_alive(lease).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(renewer.renew().await.unwrap(), Some(10));
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(store.count_prefix("/a/").await.unwrap(), 1);

        store.lease_revoke(lease).await.unwrap();
        assert_eq!(renewer.renew().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watch_sees_prefix_changes_only() {
        let store = MemoryStore::new();
        let mut rx = store.watch_prefix("/a/").await.unwrap();

        store.put("/b/1", b"ignored".to_vec(), None).await.unwrap();
        store.put("/a/1", b"x".to_vec(), None).await.unwrap();
        store.delete("/a/1").await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(WatchEvent {
                kind: WatchEventKind::Put,
                key: "/a/1".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(WatchEvent {
                kind: WatchEventKind::Delete,
                key: "/a/1".to_string()
            })
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_guarded_delete_checks_value() {
        let store = MemoryStore::new();
        store.put("/k", b"old".to_vec(), None).await.unwrap();
        store.put("/k", b"new".to_vec(), None).await.unwrap();

        assert!(!store.delete_if_value("/k", b"old").await.unwrap());
        assert_eq!(store.get("/k").await.unwrap(), Some(b"new".to_vec()));

        assert!(store.delete_if_value("/k", b"new").await.unwrap());
        assert!(!store.delete_if_value("/k", b"new").await.unwrap());
        assert_eq!(store.get("/k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_watches_ends_streams() {
        let store = MemoryStore::new();
        let mut rx = store.watch_prefix("/a/").await.unwrap();

        store.close_watches();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.lease_grant(10).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.health().await.is_err());

        store.set_unavailable(false);
        assert!(store.health().await.is_ok());
    }
}
