//! Per-instance slot leasing for analysis servers.
//!
//! The [`SlotLockManager`] trait provides distributed mutual exclusion over
//! the concurrency slots of each analysis instance, separate from storage
//! concerns. This separation enables:
//!
//! - **Testing**: Use [`memory::InMemoryLockManager`] for unit tests
//! - **Production**: Use a document-store collection with conditional writes
//! - **Flexibility**: Switch implementations without changing the dispatcher
//!
//! ## Design Principles
//!
//! - **Leases, not locks**: Holders get time-bounded leases, not indefinite
//!   locks, so a dead worker frees its slot within one TTL
//! - **Heartbeat renewal**: Workers must renew at most every `ttl / 3` or
//!   lose the slot
//! - **Round-robin selection**: A rotating cursor over instance names spreads
//!   work evenly; ties break lexicographically
//!
//! ## Safety
//!
//! At any instant the number of unexpired leases per instance never exceeds
//! its concurrency cap. Acquisition is a single conditional write; on
//! contention callers observe [`AcquireOutcome::NoSlotAvailable`] and must
//! not spin-wait.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use scanforge_core::ScanJobId;

use crate::error::Result;
use crate::job::Lease;

/// A lease on one concurrency slot of one analysis instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLease {
    /// Instance whose slot is held.
    pub instance_name: String,
    /// Token that must match for heartbeat and release.
    pub token: Uuid,
    /// Slot index in `0..concurrency_cap`.
    pub slot: u32,
    /// Job holding the slot.
    pub holder: ScanJobId,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl SlotLease {
    /// Converts into the lease mirror persisted on the scan job.
    #[must_use]
    pub fn to_job_lease(&self) -> Lease {
        Lease {
            instance_name: self.instance_name.clone(),
            token: self.token,
            slot: self.slot,
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
            analysis_id: None,
        }
    }

    /// Returns true if the lease has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of a slot acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A slot was claimed.
    Acquired(SlotLease),
    /// Every eligible instance is at its cap; the caller re-queues with
    /// backoff instead of waiting.
    NoSlotAvailable,
}

impl AcquireOutcome {
    /// Returns the lease if a slot was claimed.
    #[must_use]
    pub fn lease(&self) -> Option<&SlotLease> {
        match self {
            Self::Acquired(lease) => Some(lease),
            Self::NoSlotAvailable => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    /// The lease was extended.
    Renewed {
        /// The new expiry.
        expires_at: DateTime<Utc>,
    },
    /// The lease expired and was reaped, or the slot was reassigned.
    Lost,
    /// The provided token does not match the stored lease.
    InvalidToken,
}

impl RenewalResult {
    /// Returns true if the lease was extended.
    #[must_use]
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// A lease the reaper found expired; the reconciler rescues its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedLease {
    /// Instance whose slot was freed.
    pub instance_name: String,
    /// Job that held the slot.
    pub holder: ScanJobId,
    /// Slot index that was freed.
    pub slot: u32,
    /// Expiry that triggered the reap.
    pub expired_at: DateTime<Utc>,
}

/// Distributed slot-lease manager for analysis instances.
///
/// ## Failure semantics
///
/// All operations are idempotent. A lost release (worker killed mid-release)
/// is corrected by [`SlotLockManager::expire`] at most one TTL later.
/// Workers MUST heartbeat at most every `ttl / 3` while scanning.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from
/// dispatcher tasks.
#[async_trait]
pub trait SlotLockManager: Send + Sync {
    /// Attempts to claim one slot on any eligible instance.
    ///
    /// Eligible instances have at least one free slot; among them the
    /// selection is round-robin over a rotating cursor keyed by instance
    /// name, with lexicographic tie-breaks.
    async fn acquire(&self, holder: ScanJobId, ttl: Duration) -> Result<AcquireOutcome>;

    /// Extends an existing lease by `ttl` from now.
    ///
    /// Extends only when the token matches the stored lease.
    async fn heartbeat(&self, lease: &SlotLease, ttl: Duration) -> Result<RenewalResult>;

    /// Releases a slot.
    ///
    /// Removes the lease only when the token matches; otherwise it is a
    /// no-op (the lease was already reaped) and returns false.
    async fn release(&self, lease: &SlotLease) -> Result<bool>;

    /// Reaps every lease whose expiry is at or before `now`.
    ///
    /// Frees the slots and returns the orphaned leases, including those
    /// reclaimed in passing by [`SlotLockManager::acquire`].
    async fn expire(&self, now: DateTime<Utc>) -> Result<Vec<OrphanedLease>>;

    /// Number of unexpired leases currently held on an instance.
    async fn active_leases(&self, instance_name: &str) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_fixture() -> SlotLease {
        let now = Utc::now();
        SlotLease {
            instance_name: "primary".into(),
            token: Uuid::new_v4(),
            slot: 0,
            holder: ScanJobId::generate(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(300),
        }
    }

    #[test]
    fn acquire_outcome_lease_accessor() {
        let lease = lease_fixture();
        assert!(AcquireOutcome::Acquired(lease.clone()).lease().is_some());
        assert!(AcquireOutcome::NoSlotAvailable.lease().is_none());
    }

    #[test]
    fn renewal_result_is_renewed() {
        assert!(
            RenewalResult::Renewed {
                expires_at: Utc::now()
            }
            .is_renewed()
        );
        assert!(!RenewalResult::Lost.is_renewed());
        assert!(!RenewalResult::InvalidToken.is_renewed());
    }

    #[test]
    fn job_lease_mirror_copies_slot_fields() {
        let lease = lease_fixture();
        let mirror = lease.to_job_lease();
        assert_eq!(mirror.instance_name, lease.instance_name);
        assert_eq!(mirror.token, lease.token);
        assert_eq!(mirror.slot, lease.slot);
        assert!(mirror.analysis_id.is_none());
    }
}
