//! Membership Registry
//!
//! Publishes "this instance is alive" as a lease-bound record under
//! `{instance_prefix}/{lease_id}` and keeps the lease renewed. The record key
//! doubles as the instance's identity in shard records, so ownership is tied
//! to one specific lease.
//!
//! Death is detected by the store: once renewals stop, the lease expires and
//! the membership record (plus every shard record bound to the lease) is
//! deleted.

use super::ShardError;
use crate::config::ShardingConfig;
use crate::observability::{events, spawn_supervised};
use crate::shutdown::{self, ShutdownSignal, ShutdownTrigger};
use crate::store::{KvStore, LeaseRenewer, StoreError, WatchReceiver};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Lease and key this instance registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub lease_id: i64,
    pub instance_key: String,
}

/// Etcd-backed instance membership
pub struct MembershipRegistry {
    store: Arc<dyn KvStore>,
    prefix: String,
    identity: String,
    lease_ttl: i64,
    keepalive_interval: Duration,
    register_timeout: Duration,
    registration: RwLock<Option<Registration>>,
    keepalive_stop: Mutex<Option<ShutdownTrigger>>,
    /// Set once renewals can no longer keep the lease alive
    degraded: Arc<AtomicBool>,
}

impl MembershipRegistry {
    pub fn new(store: Arc<dyn KvStore>, config: &ShardingConfig) -> Self {
        Self {
            store,
            prefix: config.instance_prefix.trim_end_matches('/').to_string(),
            identity: config.advertise_addr.clone(),
            lease_ttl: config.lease_ttl,
            keepalive_interval: config.keepalive_interval,
            register_timeout: config.register_timeout,
            registration: RwLock::new(None),
            keepalive_stop: Mutex::new(None),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Membership key for a lease
    pub fn instance_key_for(&self, lease_id: i64) -> String {
        format!("{}/{}", self.prefix, lease_id)
    }

    fn members_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// Grant a lease, publish the membership record and start renewing.
    ///
    /// Renewal stops when `cancel` fires or on [`unregister`](Self::unregister).
    /// Calling this while already registered returns the existing registration.
    pub async fn register(&self, cancel: ShutdownSignal) -> Result<Registration, ShardError> {
        if let Some(existing) = self.registration() {
            debug!(instance_key = %existing.instance_key, "Already registered");
            return Ok(existing);
        }

        let (registration, renewer) =
            tokio::time::timeout(self.register_timeout, self.grant_and_publish())
                .await
                .map_err(|_| StoreError::Timeout("instance registration"))??;

        *self.registration.write() = Some(registration.clone());
        self.degraded.store(false, Ordering::Release);
        self.spawn_keepalive(registration.lease_id, renewer, cancel);

        events::instance_registered(&registration.instance_key, registration.lease_id, &self.identity);
        Ok(registration)
    }

    async fn grant_and_publish(&self) -> Result<(Registration, Box<dyn LeaseRenewer>), ShardError> {
        let lease_id = self.store.lease_grant(self.lease_ttl).await?;
        debug!(lease_id = lease_id, ttl = self.lease_ttl, "Lease granted");

        let instance_key = self.instance_key_for(lease_id);
        let published = async {
            self.store
                .put(&instance_key, self.identity.clone().into_bytes(), Some(lease_id))
                .await?;
            self.store.lease_keep_alive(lease_id).await
        }
        .await;

        match published {
            Ok(renewer) => Ok((
                Registration {
                    lease_id,
                    instance_key,
                },
                renewer,
            )),
            Err(e) => {
                // Do not leave an orphaned lease behind
                if let Err(revoke_err) = self.store.lease_revoke(lease_id).await {
                    warn!(lease_id = lease_id, error = %revoke_err, "Failed to revoke unused lease");
                }
                Err(e.into())
            }
        }
    }

    fn spawn_keepalive(&self, lease_id: i64, renewer: Box<dyn LeaseRenewer>, cancel: ShutdownSignal) {
        let (trigger, stop) = shutdown::channel();
        if let Some(previous) = self.keepalive_stop.lock().replace(trigger) {
            previous.trigger();
        }

        spawn_supervised(
            "lease-keepalive",
            keepalive_loop(KeepAlive {
                store: self.store.clone(),
                lease_id,
                renewer,
                interval: self.keepalive_interval,
                stop,
                cancel,
                degraded: self.degraded.clone(),
            }),
        );
    }

    /// Remove the membership record and revoke the lease.
    ///
    /// Revoking also drops any shard record still bound to the lease.
    /// Failures are logged; the lease TTL is the backstop.
    pub async fn unregister(&self) {
        if let Some(trigger) = self.keepalive_stop.lock().take() {
            trigger.trigger();
        }

        let Some(registration) = self.registration.write().take() else {
            return;
        };

        if let Err(e) = self.store.delete(&registration.instance_key).await {
            warn!(instance_key = %registration.instance_key, error = %e, "Failed to delete membership record");
        }

        match self.store.lease_revoke(registration.lease_id).await {
            Ok(()) => events::instance_unregistered(&registration.instance_key, registration.lease_id),
            Err(e) => warn!(lease_id = registration.lease_id, error = %e, "Failed to revoke lease"),
        }
    }

    /// Number of live membership records
    pub async fn instance_count(&self) -> Result<usize, ShardError> {
        Ok(self.store.count_prefix(&self.members_prefix()).await?)
    }

    /// Keys of all live membership records; the valid shard holders.
    pub async fn all_instances(&self) -> Result<HashSet<String>, ShardError> {
        let entries = self.store.get_prefix(&self.members_prefix()).await?;
        Ok(entries.into_iter().map(|kv| kv.key).collect())
    }

    /// Subscribe to membership changes
    pub async fn watch(&self) -> Result<WatchReceiver, ShardError> {
        Ok(self.store.watch_prefix(&self.members_prefix()).await?)
    }

    pub fn registration(&self) -> Option<Registration> {
        self.registration.read().clone()
    }

    pub fn instance_key(&self) -> Option<String> {
        self.registration
            .read()
            .as_ref()
            .map(|r| r.instance_key.clone())
    }

    pub fn lease_id(&self) -> Option<i64> {
        self.registration.read().as_ref().map(|r| r.lease_id)
    }

    /// True once the keepalive loop gave up on the lease
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}

struct KeepAlive {
    store: Arc<dyn KvStore>,
    lease_id: i64,
    renewer: Box<dyn LeaseRenewer>,
    interval: Duration,
    stop: ShutdownSignal,
    cancel: ShutdownSignal,
    degraded: Arc<AtomicBool>,
}

/// Renew the lease every `interval` until stopped or the lease is gone.
async fn keepalive_loop(mut ka: KeepAlive) {
    let mut ticker = tokio::time::interval(ka.interval);
    ticker.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = ka.stop.wait() => {
                debug!(lease_id = ka.lease_id, "Keep-alive stopped");
                return;
            }
            _ = ka.cancel.wait() => {
                debug!(lease_id = ka.lease_id, "Keep-alive cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        match ka.renewer.renew().await {
            Ok(Some(ttl)) => {
                trace!(lease_id = ka.lease_id, ttl = ttl, "Keep-alive OK");
            }
            Ok(None) => {
                error!(lease_id = ka.lease_id, "Keep-alive stream closed, instance will drop out of membership");
                ka.degraded.store(true, Ordering::Release);
                return;
            }
            Err(e) => {
                // The lease outlives a few failed renewals; reopen and try again next tick
                warn!(lease_id = ka.lease_id, error = %e, "Keep-alive failed");
                match ka.store.lease_keep_alive(ka.lease_id).await {
                    Ok(renewer) => ka.renewer = renewer,
                    Err(StoreError::LeaseNotFound(_)) => {
                        error!(lease_id = ka.lease_id, "Lease no longer exists");
                        ka.degraded.store(true, Ordering::Release);
                        return;
                    }
                    Err(e) => {
                        info!(lease_id = ka.lease_id, error = %e, "Keep-alive reconnect failed, will retry");
                    }
                }
            }
        }
    }
}
