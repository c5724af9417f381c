//! Etcd Store
//!
//! `KvStore` over `etcd_client::Client`. The client is a cheap handle around
//! a shared gRPC channel, so every call works on its own clone.

use super::{KeyValue, KvStore, LeaseRenewer, StoreError, WatchEvent, WatchEventKind, WatchReceiver};
use crate::config::ShardingConfig;
use crate::observability::supervision::spawn_supervised;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Etcd-backed store
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect to etcd with exponential backoff
    pub async fn connect(config: &ShardingConfig) -> Result<Self> {
        let backoff = ExponentialBackoff {
            initial_interval: config.etcd_backoff_initial,
            max_interval: config.etcd_backoff_max,
            max_elapsed_time: Some(config.etcd_backoff_max_elapsed),
            multiplier: config.etcd_backoff_multiplier,
            ..Default::default()
        };
        let endpoints = config.etcd_endpoints.clone();

        let client = retry(backoff, || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => {
                    debug!(endpoints = ?endpoints, "Connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to connect to etcd after retries: {:?}", e))?;

        Ok(Self::new(client))
    }
}

struct EtcdLeaseRenewer {
    lease_id: i64,
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

#[async_trait]
impl LeaseRenewer for EtcdLeaseRenewer {
    async fn renew(&mut self) -> Result<Option<i64>, StoreError> {
        self.keeper.keep_alive().await?;

        match self.stream.message().await? {
            // etcd answers a renewal for an expired lease with TTL 0
            Some(resp) if resp.ttl() > 0 => Ok(Some(resp.ttl())),
            Some(_) => {
                debug!(lease_id = self.lease_id, "Lease already expired");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn lease_grant(&self, ttl: i64) -> Result<i64, StoreError> {
        let resp = self.client.clone().lease_grant(ttl, None).await?;
        Ok(resp.id())
    }

    async fn lease_keep_alive(&self, lease_id: i64) -> Result<Box<dyn LeaseRenewer>, StoreError> {
        let (keeper, stream) = self.client.clone().lease_keep_alive(lease_id).await?;
        Ok(Box::new(EtcdLeaseRenewer {
            lease_id,
            keeper,
            stream,
        }))
    }

    async fn lease_revoke(&self, lease_id: i64) -> Result<(), StoreError> {
        self.client.clone().lease_revoke(lease_id).await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<(), StoreError> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client.clone().put(key, value, options).await?;
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: i64,
    ) -> Result<bool, StoreError> {
        // create_revision is 0 only for keys that do not exist
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease)),
            )]);

        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let resp = self.client.clone().get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect())
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix().with_count_only()))
            .await?;
        Ok(resp.count().max(0) as usize)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    async fn delete_if_value(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let txn = Txn::new()
            .when(vec![Compare::value(key, CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::delete(key, None)]);

        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchReceiver, StoreError> {
        let (mut watcher, mut stream) = self
            .client
            .clone()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = prefix.to_string();

        // Pump etcd responses into the channel; returning drops `tx`, which is
        // how the subscriber learns the stream closed.
        spawn_supervised("etcd-watch", async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        trace!(prefix = %prefix, "Watch subscriber dropped");
                        if let Err(e) = watcher.cancel().await {
                            debug!(prefix = %prefix, error = %e, "Watch cancel failed");
                        }
                        return;
                    }
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                warn!(prefix = %prefix, "Watch stream canceled");
                                return;
                            }
                            for event in resp.events() {
                                let Some(kv) = event.kv() else { continue };
                                let kind = match event.event_type() {
                                    EventType::Put => WatchEventKind::Put,
                                    EventType::Delete => WatchEventKind::Delete,
                                };
                                let key = String::from_utf8_lossy(kv.key()).into_owned();
                                if tx.send(WatchEvent { kind, key }).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(prefix = %prefix, "Watch stream ended");
                            return;
                        }
                        Err(e) => {
                            warn!(prefix = %prefix, error = %e, "Watch stream failed");
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn health(&self) -> Result<(), StoreError> {
        let status = self.client.clone().status().await?;
        trace!(version = %status.version(), "etcd status");
        Ok(())
    }
}
