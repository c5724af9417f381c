//! Shard Claimer
//!
//! Ownership transitions on individual shard records under
//! `{shard_prefix}/{shard_id}`. Claims are atomic create-if-absent writes
//! bound to the claimer's lease, so two instances racing for the same shard
//! id can never both win, and a dead holder's record disappears with its
//! lease.
//!
//! Every write this module performs is either conditional (claim) or scoped
//! to records the local instance holds (release, update).

use super::{MembershipRegistry, Registration, ShardError};
use crate::config::ShardingConfig;
use crate::observability::{events, metrics};
use crate::store::{KvStore, WatchReceiver};
use conductor_core::{Range, ShardRecord};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a single claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The record was created by this call.
    Acquired,
    /// The record already named this instance as holder.
    AlreadyHeld { stored: Range },
    /// Someone else holds the shard, or the record vanished mid-read.
    Taken { holder: Option<String> },
}

impl ClaimOutcome {
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Acquired | Self::AlreadyHeld { .. })
    }
}

pub struct ShardClaimer {
    store: Arc<dyn KvStore>,
    registry: Arc<MembershipRegistry>,
    prefix: String,
}

impl ShardClaimer {
    pub fn new(
        store: Arc<dyn KvStore>,
        registry: Arc<MembershipRegistry>,
        config: &ShardingConfig,
    ) -> Self {
        Self {
            store,
            registry,
            prefix: config.shard_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn shard_key(&self, shard_id: u32) -> String {
        format!("{}/{}", self.prefix, shard_id)
    }

    fn shards_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// Parse the shard id back out of a record key.
    fn shard_id_from_key(&self, key: &str) -> Result<u32, ShardError> {
        key.strip_prefix(&self.shards_prefix())
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| ShardError::InvalidKey(key.to_string()))
    }

    fn registration(&self) -> Result<Registration, ShardError> {
        self.registry.registration().ok_or(ShardError::NotRegistered)
    }

    /// Claim `range` for this instance.
    ///
    /// `Ok(false)` means another holder owns the shard; store failures are
    /// returned as errors.
    pub async fn claim(&self, range: &Range) -> Result<bool, ShardError> {
        Ok(self.try_claim(range).await?.is_held())
    }

    /// Claim `range`, reporting how the attempt resolved.
    pub async fn try_claim(&self, range: &Range) -> Result<ClaimOutcome, ShardError> {
        let registration = self.registration()?;
        let key = self.shard_key(range.shard_id);
        let value = serde_json::to_vec(&ShardRecord::new(
            registration.instance_key.clone(),
            *range,
        ))?;

        if self
            .store
            .create_if_absent(&key, value, registration.lease_id)
            .await?
        {
            debug!(shard_id = range.shard_id, "Shard record created");
            return Ok(ClaimOutcome::Acquired);
        }

        let outcome = match self.record(range.shard_id).await? {
            Some(record) if record.is_held_by(&registration.instance_key) => {
                ClaimOutcome::AlreadyHeld {
                    stored: record.range,
                }
            }
            Some(record) => ClaimOutcome::Taken {
                holder: Some(record.holder),
            },
            None => ClaimOutcome::Taken { holder: None },
        };
        debug!(shard_id = range.shard_id, outcome = ?outcome, "Shard record exists");
        Ok(outcome)
    }

    /// Delete the record for `range` if, and only if, this instance holds it.
    ///
    /// Returns whether the record is free of this instance afterwards: `false`
    /// means it is still ours because the delete failed. That failure is
    /// logged, not returned.
    pub async fn release(&self, range: &Range) -> Result<bool, ShardError> {
        let Some(instance_key) = self.registry.instance_key() else {
            return Ok(true);
        };

        let key = self.shard_key(range.shard_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(true);
        };
        let record: ShardRecord = serde_json::from_slice(&raw)?;

        if !record.is_held_by(&instance_key) {
            debug!(
                shard_id = range.shard_id,
                holder = %record.holder,
                "Not releasing shard held by another instance"
            );
            return Ok(true);
        }

        match self.store.delete_if_value(&key, &raw).await {
            Ok(deleted) => {
                if deleted {
                    events::shard_released(range);
                }
                Ok(true)
            }
            Err(e) => {
                warn!(shard_id = range.shard_id, error = %e, "Failed to release shard");
                Ok(false)
            }
        }
    }

    /// Overwrite the record for `range` with this instance as holder.
    ///
    /// Does not check current ownership; only call right after a claim of the
    /// same shard id succeeded.
    pub(crate) async fn update(&self, range: &Range) -> Result<(), ShardError> {
        let registration = self.registration()?;
        let value = serde_json::to_vec(&ShardRecord::new(registration.instance_key, *range))?;

        self.store
            .put(
                &self.shard_key(range.shard_id),
                value,
                Some(registration.lease_id),
            )
            .await?;
        Ok(())
    }

    /// Delete records whose holder is no longer a live member, and records
    /// whose shard id no longer exists for `instance_count` instances.
    ///
    /// Individual delete failures are logged and skipped. Returns how many
    /// records were removed.
    pub async fn cleanup_stale(&self, instance_count: usize) -> Result<usize, ShardError> {
        let entries = self.store.get_prefix(&self.shards_prefix()).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let live = self.registry.all_instances().await?;

        let mut removed = 0;
        for entry in entries {
            let shard_id = match self.shard_id_from_key(&entry.key) {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "Skipping unrecognised key in shard namespace");
                    continue;
                }
            };

            let (holder, reason) = match serde_json::from_slice::<ShardRecord>(&entry.value) {
                Err(_) => (String::new(), "undecodable"),
                Ok(record) if !live.contains(&record.holder) => (record.holder, "holder_gone"),
                Ok(record) if shard_id as usize >= instance_count => {
                    (record.holder, "out_of_range")
                }
                Ok(_) => continue,
            };

            // The record may have been re-claimed since the snapshot
            match self.store.delete_if_value(&entry.key, &entry.value).await {
                Ok(true) => {
                    events::stale_shard_removed(&entry.key, &holder, reason);
                    removed += 1;
                }
                Ok(false) => {
                    debug!(key = %entry.key, "Shard record changed since listing, kept");
                }
                Err(e) => {
                    warn!(key = %entry.key, reason = reason, error = %e, "Failed to remove stale shard")
                }
            }
        }

        if removed > 0 {
            metrics::record_stale_removed(removed);
        }
        Ok(removed)
    }

    /// Number of live shard records
    pub async fn shard_count(&self) -> Result<usize, ShardError> {
        Ok(self.store.count_prefix(&self.shards_prefix()).await?)
    }

    /// Subscribe to shard record changes
    pub async fn watch(&self) -> Result<WatchReceiver, ShardError> {
        Ok(self.store.watch_prefix(&self.shards_prefix()).await?)
    }

    pub async fn record(&self, shard_id: u32) -> Result<Option<ShardRecord>, ShardError> {
        match self.store.get(&self.shard_key(shard_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// All decodable shard records, in key order.
    pub async fn records(&self) -> Result<Vec<ShardRecord>, ShardError> {
        let entries = self.store.get_prefix(&self.shards_prefix()).await?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_slice(&entry.value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "Undecodable shard record");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::{self, ShutdownTrigger};
    use crate::store::faulty::FaultyStore;
    use crate::store::MemoryStore;

    struct Member {
        registry: Arc<MembershipRegistry>,
        claimer: ShardClaimer,
        _trigger: ShutdownTrigger,
    }

    async fn member(store: &MemoryStore, addr: &str) -> Member {
        member_on(Arc::new(store.clone()), addr).await
    }

    async fn member_on(store: Arc<dyn KvStore>, addr: &str) -> Member {
        let config = ShardingConfig {
            advertise_addr: addr.to_string(),
            ..ShardingConfig::default()
        };
        let registry = Arc::new(MembershipRegistry::new(store.clone(), &config));
        let (trigger, signal) = shutdown::channel();
        registry.register(signal).await.unwrap();

        Member {
            claimer: ShardClaimer::new(store, registry.clone(), &config),
            registry,
            _trigger: trigger,
        }
    }

    fn key_of(member: &Member) -> String {
        member.registry.instance_key().unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = MemoryStore::new();
        let a = member(&store, "a:1").await;
        let b = member(&store, "b:1").await;
        let range = Range::new(0, 0, 512);

        let (won_a, won_b) = tokio::join!(a.claimer.claim(&range), b.claimer.claim(&range));

        assert!(won_a.unwrap() ^ won_b.unwrap());
        assert_eq!(a.claimer.shard_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_binds_record_to_lease() {
        let store = MemoryStore::new();
        let a = member(&store, "a:1").await;
        let range = Range::new(2, 512, 768);

        assert_eq!(a.claimer.try_claim(&range).await.unwrap(), ClaimOutcome::Acquired);

        let record = a.claimer.record(2).await.unwrap().unwrap();
        assert_eq!(record, ShardRecord::new(key_of(&a), range));
        assert_eq!(
            store.lease_of("/conductor/shards/2"),
            a.registry.lease_id()
        );
    }

    #[tokio::test]
    async fn test_reclaim_by_holder_is_idempotent() {
        let store = MemoryStore::new();
        let a = member(&store, "a:1").await;
        let b = member(&store, "b:1").await;
        let range = Range::new(0, 0, 256);

        assert!(a.claimer.claim(&range).await.unwrap());
        assert!(a.claimer.claim(&range).await.unwrap());
        assert_eq!(
            b.claimer.try_claim(&range).await.unwrap(),
            ClaimOutcome::Taken {
                holder: Some(key_of(&a))
            }
        );
    }

    #[tokio::test]
    async fn test_reclaim_reports_stored_bounds() {
        let store = MemoryStore::new();
        let a = member(&store, "a:1").await;
        assert!(a.claimer.claim(&Range::new(1, 256, 512)).await.unwrap());

        let outcome = a.claimer.try_claim(&Range::new(1, 342, 683)).await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::AlreadyHeld {
                stored: Range::new(1, 256, 512)
            }
        );

        a.claimer.update(&Range::new(1, 342, 683)).await.unwrap();
        let record = a.claimer.record(1).await.unwrap().unwrap();
        assert_eq!(record.range, Range::new(1, 342, 683));
    }

    #[tokio::test]
    async fn test_claim_requires_registration() {
        let store = MemoryStore::new();
        let config = ShardingConfig::default();
        let store: Arc<dyn KvStore> = Arc::new(store);
        let registry = Arc::new(MembershipRegistry::new(store.clone(), &config));
        let claimer = ShardClaimer::new(store, registry, &config);

        let result = claimer.claim(&Range::new(0, 0, 1024)).await;
        assert!(matches!(result, Err(ShardError::NotRegistered)));
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let store = MemoryStore::new();
        let a = member(&store, "a:1").await;
        let b = member(&store, "b:1").await;
        let range = Range::new(0, 0, 512);
        assert!(a.claimer.claim(&range).await.unwrap());

        assert!(b.claimer.release(&range).await.unwrap());
        assert!(a.claimer.record(0).await.unwrap().is_some());

        assert!(a.claimer.release(&range).await.unwrap());
        assert!(a.claimer.record(0).await.unwrap().is_none());

        // Absent record
        assert!(a.claimer.release(&range).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_release_reports_record_still_held() {
        let faulty = Arc::new(FaultyStore::new(MemoryStore::new()));
        let a = member_on(faulty.clone(), "a:1").await;
        let range = Range::new(0, 0, 1024);
        assert!(a.claimer.claim(&range).await.unwrap());

        faulty.fail_deletes(true);
        assert!(!a.claimer.release(&range).await.unwrap());
        assert!(a.claimer.record(0).await.unwrap().is_some());

        faulty.fail_deletes(false);
        assert!(a.claimer.release(&range).await.unwrap());
        assert!(a.claimer.record(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_dead_holders_only() {
        let store = MemoryStore::new();
        let a = member(&store, "a:1").await;
        let b = member(&store, "b:1").await;
        assert!(a.claimer.claim(&Range::new(0, 0, 512)).await.unwrap());

        // A record whose holder is not a live member, with no lease to expire it
        let orphan = ShardRecord::new("/conductor/instances/999", Range::new(1, 512, 1024));
        store
            .put(
                "/conductor/shards/1",
                serde_json::to_vec(&orphan).unwrap(),
                None,
            )
            .await
            .unwrap();

        let removed = b.claimer.cleanup_stale(2).await.unwrap();

        assert_eq!(removed, 1);
        assert!(a.claimer.record(0).await.unwrap().is_some());
        assert!(a.claimer.record(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_record_reclaimed_after_listing() {
        let faulty = Arc::new(FaultyStore::new(MemoryStore::new()));
        let a = member_on(faulty.clone(), "a:1").await;
        let b = member_on(faulty.clone(), "b:1").await;

        let orphan = ShardRecord::new("/conductor/instances/999", Range::new(1, 512, 1024));
        faulty
            .inner
            .put(
                "/conductor/shards/1",
                serde_json::to_vec(&orphan).unwrap(),
                None,
            )
            .await
            .unwrap();

        // A takes over shard 1 between B's listing and B's delete
        let fresh = ShardRecord::new(key_of(&a), Range::new(1, 512, 1024));
        faulty.write_after_next_list("/conductor/shards/1", serde_json::to_vec(&fresh).unwrap());

        assert_eq!(b.claimer.cleanup_stale(2).await.unwrap(), 0);
        assert_eq!(b.claimer.record(1).await.unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn test_cleanup_removes_out_of_range_ids() {
        let store = MemoryStore::new();
        let a = member(&store, "a:1").await;
        let b = member(&store, "b:1").await;
        assert!(a.claimer.claim(&Range::new(0, 0, 512)).await.unwrap());
        assert!(b.claimer.claim(&Range::new(3, 768, 1024)).await.unwrap());

        let removed = a.claimer.cleanup_stale(2).await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(a.claimer.shard_count().await.unwrap(), 1);
        assert!(b.claimer.record(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_undecodable_records() {
        let store = MemoryStore::new();
        let a = member(&store, "a:1").await;
        store
            .put("/conductor/shards/0", b"not json".to_vec(), None)
            .await
            .unwrap();

        assert_eq!(a.claimer.cleanup_stale(1).await.unwrap(), 1);
        assert!(a.claimer.claim(&Range::new(0, 0, 1024)).await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_sees_claims() {
        let store = MemoryStore::new();
        let a = member(&store, "a:1").await;
        let mut rx = a.claimer.watch().await.unwrap();

        assert!(a.claimer.claim(&Range::new(0, 0, 1024)).await.unwrap());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, "/conductor/shards/0");
    }

    #[test]
    fn test_shard_key_round_trip() {
        let config = ShardingConfig {
            shard_prefix: "/conductor/shards/".to_string(),
            ..ShardingConfig::default()
        };
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(MembershipRegistry::new(store.clone(), &config));
        let claimer = ShardClaimer::new(store, registry, &config);

        assert_eq!(claimer.shard_key(7), "/conductor/shards/7");
        assert_eq!(claimer.shard_id_from_key("/conductor/shards/7").unwrap(), 7);
        assert!(matches!(
            claimer.shard_id_from_key("/conductor/shards/x"),
            Err(ShardError::InvalidKey(_))
        ));
    }
}
