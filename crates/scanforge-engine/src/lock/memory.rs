//! In-memory slot-lease manager for testing.
//!
//! This module provides [`InMemoryLockManager`], an implementation of the
//! [`SlotLockManager`] trait suitable for tests and single-process
//! deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: Leases are not visible across process
//!   boundaries; production deployments need a store-backed implementation

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use scanforge_core::ScanJobId;

use super::{AcquireOutcome, OrphanedLease, RenewalResult, SlotLease, SlotLockManager};
use crate::error::{Error, Result};

#[derive(Debug)]
struct InstanceSlots {
    cap: u32,
    leases: HashMap<u32, SlotLease>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Instances keyed by name; `BTreeMap` gives the lexicographic order
    /// the round-robin tie-break relies on.
    instances: BTreeMap<String, InstanceSlots>,
    /// Rotating round-robin cursor over the instance order.
    cursor: usize,
    /// Expired leases reclaimed in passing by `acquire`, surfaced by the
    /// next `expire` call so their jobs still get rescued.
    pending_orphans: Vec<OrphanedLease>,
}

/// In-memory slot-lease manager.
///
/// ## Example
///
/// ```rust
/// use scanforge_engine::lock::memory::InMemoryLockManager;
///
/// let locks = InMemoryLockManager::new([("primary".to_string(), 2)]);
/// // Acquire slots in tests...
/// ```
#[derive(Debug)]
pub struct InMemoryLockManager {
    inner: Mutex<Inner>,
}

/// Converts a lock poison error to a lock error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::lock("lock manager mutex poisoned")
}

impl InMemoryLockManager {
    /// Creates a manager over the given `(instance_name, concurrency_cap)`
    /// pairs.
    #[must_use]
    pub fn new(instances: impl IntoIterator<Item = (String, u32)>) -> Self {
        let instances = instances
            .into_iter()
            .map(|(name, cap)| {
                (
                    name,
                    InstanceSlots {
                        cap,
                        leases: HashMap::new(),
                    },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                instances,
                cursor: 0,
                pending_orphans: Vec::new(),
            }),
        }
    }

    /// Finds a claimable slot on an instance: either unleased, or holding a
    /// lease that already expired (reclaimed, recorded as an orphan).
    fn claim_slot(
        slots: &mut InstanceSlots,
        pending_orphans: &mut Vec<OrphanedLease>,
        now: DateTime<Utc>,
    ) -> Option<u32> {
        for slot in 0..slots.cap {
            match slots.leases.get(&slot) {
                None => return Some(slot),
                Some(existing) if existing.is_expired_at(now) => {
                    pending_orphans.push(OrphanedLease {
                        instance_name: existing.instance_name.clone(),
                        holder: existing.holder,
                        slot,
                        expired_at: existing.expires_at,
                    });
                    slots.leases.remove(&slot);
                    return Some(slot);
                }
                Some(_) => {}
            }
        }
        None
    }
}

#[async_trait]
impl SlotLockManager for InMemoryLockManager {
    async fn acquire(&self, holder: ScanJobId, ttl: Duration) -> Result<AcquireOutcome> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let names: Vec<String> = inner.instances.keys().cloned().collect();
        if names.is_empty() {
            return Ok(AcquireOutcome::NoSlotAvailable);
        }
        let now = Utc::now();
        let start = inner.cursor % names.len();

        for offset in 0..names.len() {
            let index = (start + offset) % names.len();
            let name = &names[index];
            let Inner {
                instances,
                pending_orphans,
                ..
            } = &mut *inner;
            let slots = instances
                .get_mut(name)
                .ok_or_else(|| Error::lock(format!("unknown instance '{name}'")))?;
            let Some(slot) = Self::claim_slot(slots, pending_orphans, now) else {
                continue;
            };

            let lease = SlotLease {
                instance_name: name.clone(),
                token: Uuid::new_v4(),
                slot,
                holder,
                acquired_at: now,
                expires_at: now
                    + chrono::Duration::from_std(ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            };
            slots.leases.insert(slot, lease.clone());
            // Rotate past the chosen instance so the next acquisition
            // starts at its successor.
            inner.cursor = index + 1;
            return Ok(AcquireOutcome::Acquired(lease));
        }
        Ok(AcquireOutcome::NoSlotAvailable)
    }

    async fn heartbeat(&self, lease: &SlotLease, ttl: Duration) -> Result<RenewalResult> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let Some(slots) = inner.instances.get_mut(&lease.instance_name) else {
            return Ok(RenewalResult::Lost);
        };
        let Some(stored) = slots.leases.get_mut(&lease.slot) else {
            return Ok(RenewalResult::Lost);
        };
        if stored.token != lease.token {
            return Ok(RenewalResult::InvalidToken);
        }
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300));
        stored.expires_at = expires_at;
        Ok(RenewalResult::Renewed { expires_at })
    }

    async fn release(&self, lease: &SlotLease) -> Result<bool> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let Some(slots) = inner.instances.get_mut(&lease.instance_name) else {
            return Ok(false);
        };
        match slots.leases.get(&lease.slot) {
            Some(stored) if stored.token == lease.token => {
                slots.leases.remove(&lease.slot);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire(&self, now: DateTime<Utc>) -> Result<Vec<OrphanedLease>> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let mut orphans = std::mem::take(&mut inner.pending_orphans);
        for slots in inner.instances.values_mut() {
            let expired: Vec<u32> = slots
                .leases
                .iter()
                .filter(|(_, lease)| lease.is_expired_at(now))
                .map(|(slot, _)| *slot)
                .collect();
            for slot in expired {
                if let Some(lease) = slots.leases.remove(&slot) {
                    orphans.push(OrphanedLease {
                        instance_name: lease.instance_name,
                        holder: lease.holder,
                        slot,
                        expired_at: lease.expires_at,
                    });
                }
            }
        }
        Ok(orphans)
    }

    async fn active_leases(&self, instance_name: &str) -> Result<usize> {
        let inner = self.inner.lock().map_err(poison_err)?;
        let now = Utc::now();
        Ok(inner
            .instances
            .get(instance_name)
            .map_or(0, |slots| {
                slots
                    .leases
                    .values()
                    .filter(|lease| !lease.is_expired_at(now))
                    .count()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    fn manager(caps: &[(&str, u32)]) -> InMemoryLockManager {
        InMemoryLockManager::new(caps.iter().map(|(n, c)| ((*n).to_string(), *c)))
    }

    async fn must_acquire(locks: &InMemoryLockManager) -> SlotLease {
        match locks.acquire(ScanJobId::generate(), TTL).await.unwrap() {
            AcquireOutcome::Acquired(lease) => lease,
            AcquireOutcome::NoSlotAvailable => panic!("expected a free slot"),
        }
    }

    #[tokio::test]
    async fn cap_bounds_concurrent_leases() {
        let locks = manager(&[("primary", 2)]);
        must_acquire(&locks).await;
        must_acquire(&locks).await;
        assert_eq!(
            locks.acquire(ScanJobId::generate(), TTL).await.unwrap(),
            AcquireOutcome::NoSlotAvailable
        );
        assert_eq!(locks.active_leases("primary").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn round_robin_alternates_between_instances() {
        let locks = manager(&[("p", 2), ("s", 2)]);
        let first = must_acquire(&locks).await;
        let second = must_acquire(&locks).await;
        assert_ne!(first.instance_name, second.instance_name);

        let third = must_acquire(&locks).await;
        let fourth = must_acquire(&locks).await;
        assert_ne!(third.instance_name, fourth.instance_name);
    }

    #[tokio::test]
    async fn full_instance_is_skipped() {
        let locks = manager(&[("p", 1), ("s", 2)]);
        let leases: Vec<SlotLease> = vec![
            must_acquire(&locks).await,
            must_acquire(&locks).await,
            must_acquire(&locks).await,
        ];
        let on_s = leases.iter().filter(|l| l.instance_name == "s").count();
        assert_eq!(on_s, 2);
        assert_eq!(
            locks.acquire(ScanJobId::generate(), TTL).await.unwrap(),
            AcquireOutcome::NoSlotAvailable
        );
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let locks = manager(&[("primary", 1)]);
        let lease = must_acquire(&locks).await;

        let mut stale = lease.clone();
        stale.token = Uuid::new_v4();
        assert!(!locks.release(&stale).await.unwrap());
        assert!(locks.release(&lease).await.unwrap());
        // Second release is a no-op.
        assert!(!locks.release(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_extends_only_with_matching_token() {
        let locks = manager(&[("primary", 1)]);
        let lease = must_acquire(&locks).await;

        let renewed = locks.heartbeat(&lease, TTL).await.unwrap();
        assert!(renewed.is_renewed());

        let mut stale = lease.clone();
        stale.token = Uuid::new_v4();
        assert_eq!(
            locks.heartbeat(&stale, TTL).await.unwrap(),
            RenewalResult::InvalidToken
        );

        locks.release(&lease).await.unwrap();
        assert_eq!(
            locks.heartbeat(&lease, TTL).await.unwrap(),
            RenewalResult::Lost
        );
    }

    #[tokio::test]
    async fn expire_reaps_and_reports_orphans() {
        let locks = manager(&[("primary", 1)]);
        let lease = must_acquire(&locks).await;

        let future = Utc::now() + chrono::Duration::seconds(600);
        let orphans = locks.expire(future).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].holder, lease.holder);
        assert_eq!(locks.active_leases("primary").await.unwrap(), 0);

        // The slot is claimable again.
        must_acquire(&locks).await;
    }

    #[tokio::test]
    async fn acquire_reclaims_expired_slot_and_keeps_orphan_visible() {
        let locks = manager(&[("primary", 1)]);
        let first = must_acquire(&locks).await;

        // Simulate expiry by zeroing the TTL.
        {
            let mut inner = locks.inner.lock().unwrap();
            let slots = inner.instances.get_mut("primary").unwrap();
            slots.leases.get_mut(&0).unwrap().expires_at =
                Utc::now() - chrono::Duration::seconds(1);
        }

        // A new holder can claim the slot immediately.
        let second = must_acquire(&locks).await;
        assert_ne!(first.token, second.token);

        // The reclaimed lease still surfaces as an orphan for the reconciler.
        let orphans = locks.expire(Utc::now()).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].holder, first.holder);
    }
}
