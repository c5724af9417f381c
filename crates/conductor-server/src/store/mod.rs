//! Key-Value Store Abstraction
//!
//! The coordination subsystem only needs a handful of etcd primitives:
//! leases with TTL and cascading delete, an atomic create-if-absent write,
//! prefix reads, and prefix watches. They are expressed as the object-safe
//! [`KvStore`] trait so the registry, claimer and coordinator receive their
//! store explicitly.
//!
//! Implementations:
//! - [`EtcdStore`]: production backend over `etcd-client`
//! - [`MemoryStore`]: in-process store with the same lease semantics, for tests

mod etcd;
#[cfg(test)]
pub(crate) mod faulty;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("lease {0} not found")]
    LeaseNotFound(i64),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
}

/// Receiving side of a prefix watch.
///
/// `recv()` returning `None` means the stream closed and must be re-established;
/// a pending `recv()` simply means no changes yet.
pub type WatchReceiver = mpsc::UnboundedReceiver<WatchEvent>;

/// A key and its raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Renews one lease on demand.
#[async_trait]
pub trait LeaseRenewer: Send {
    /// Send one renewal and wait for its acknowledgement.
    ///
    /// Returns the refreshed TTL, or `None` once the renewal stream is closed
    /// (the lease is gone and cannot be renewed again).
    async fn renew(&mut self) -> Result<Option<i64>, StoreError>;
}

/// Lease-aware key-value store with atomic create and prefix watches.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Grant a lease that expires after `ttl` seconds without renewal.
    async fn lease_grant(&self, ttl: i64) -> Result<i64, StoreError>;

    /// Open a renewal handle for `lease_id`.
    async fn lease_keep_alive(&self, lease_id: i64) -> Result<Box<dyn LeaseRenewer>, StoreError>;

    /// Revoke a lease, deleting every key bound to it.
    async fn lease_revoke(&self, lease_id: i64) -> Result<(), StoreError>;

    /// Unconditional write, optionally bound to a lease.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<(), StoreError>;

    /// Write `key` bound to `lease` only if it does not exist yet.
    ///
    /// Returns `false` when the key already exists; nothing is written then.
    async fn create_if_absent(&self, key: &str, value: Vec<u8>, lease: i64)
        -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// All keys starting with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    async fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete `key` only while its value still equals `expected`.
    ///
    /// Returns `false` when the key is gone or was rewritten since it was read.
    async fn delete_if_value(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

    /// Subscribe to changes of every key starting with `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchReceiver, StoreError>;

    /// Cheap connectivity probe.
    async fn health(&self) -> Result<(), StoreError>;
}
