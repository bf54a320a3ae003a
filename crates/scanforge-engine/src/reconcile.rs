//! Periodic reconciliation of stuck state.
//!
//! The reconciler bounds recovery from any worker death or broker loss to
//! `lease_ttl + reconciler_interval`. Each sweep:
//!
//! 1. Reaps expired slot leases
//! 2. Rescues RUNNING jobs whose lease expired or vanished (FAILED_TEMP,
//!    reason `lease-expired`, then re-queue or escalate)
//! 3. Re-enqueues QUEUED jobs untouched past the stale threshold (guards
//!    against broker loss; the queue deduplicates live messages)
//! 4. Backfills FailedCommit records a crash skipped
//! 5. Re-correlates orphan webhook events against in-flight jobs within
//!    the lease window and prunes the completion hub

use std::sync::Arc;

use chrono::Utc;

use crate::dispatch::fail_job;
use crate::error::Result;
use crate::job::{JobState, ScanFailure};
use crate::lock::SlotLockManager;
use crate::metrics::{labels, names};
use crate::queue::{EnqueueOptions, JobEnvelope, WorkQueue};
use crate::record::{FailedCommit, FailedCommitDisposition, WebhookStatus};
use crate::retry::BackoffPolicy;
use crate::store::Store;
use crate::webhook::{AnalysisOutcome, CompletionHub};
use scanforge_core::config::Settings;

/// Jobs examined per category per sweep.
const SWEEP_LIMIT: usize = 200;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Slot leases reaped.
    pub expired_leases: usize,
    /// RUNNING jobs rescued into FAILED_TEMP.
    pub rescued_running: usize,
    /// Stale QUEUED jobs re-enqueued.
    pub requeued_stale: usize,
    /// FailedCommit records backfilled.
    pub backfilled_failed: usize,
    /// Orphan webhook events correlated late.
    pub recorrelated_orphans: usize,
}

/// Periodic sweeper for orphaned and stale jobs.
pub struct Reconciler<S, Q, L> {
    store: Arc<S>,
    queue: Arc<Q>,
    locks: Arc<L>,
    completions: Arc<CompletionHub>,
    backoff: BackoffPolicy,
    settings: Arc<Settings>,
}

impl<S, Q, L> std::fmt::Debug for Reconciler<S, Q, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish()
    }
}

impl<S, Q, L> Reconciler<S, Q, L>
where
    S: Store,
    Q: WorkQueue,
    L: SlotLockManager,
{
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        queue: Arc<Q>,
        locks: Arc<L>,
        completions: Arc<CompletionHub>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            completions,
            backoff: BackoffPolicy::from_settings(&settings.retry),
            settings,
        }
    }

    /// Runs sweeps at the configured cadence until the task is aborted.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.settings.lease.reconciler_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(report) => {
                    if report != SweepReport::default() {
                        tracing::info!(?report, "reconcile sweep rescued work");
                    }
                }
                Err(err) => tracing::error!(error = %err, "reconcile sweep failed"),
            }
        }
    }

    /// Runs one sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let started = std::time::Instant::now();
        let now = Utc::now();
        let mut report = SweepReport::default();

        let orphans = self.locks.expire(now).await?;
        report.expired_leases = orphans.len();

        report.rescued_running = self.rescue_running(now).await?;
        report.requeued_stale = self.requeue_stale(now).await?;
        report.backfilled_failed = self.backfill_failed_commits().await?;
        report.recorrelated_orphans = self.recorrelate_orphans(now).await?;

        let lease_window = chrono::Duration::from_std(self.settings.lease.lease_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        self.completions.prune_older_than(now - lease_window);

        metrics::histogram!(names::RECONCILE_SWEEP_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Rescues RUNNING jobs whose lease expired or is absent.
    async fn rescue_running(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let running = self
            .store
            .jobs_in_state(JobState::Running, None, SWEEP_LIMIT)
            .await?;
        let mut rescued = 0;
        for job in running {
            let expired = job
                .lease
                .as_ref()
                .is_none_or(|lease| lease.is_expired_at(now));
            if !expired {
                continue;
            }
            let failure = ScanFailure::transient("lease-expired")
                .with_detail("no heartbeat before the lease expired");
            fail_job(
                self.store.as_ref(),
                self.queue.as_ref(),
                &job,
                &failure,
                &self.backoff,
            )
            .await?;
            metrics::counter!(
                names::RECONCILE_RESCUES_TOTAL,
                labels::REASON => "lease_expired",
            )
            .increment(1);
            rescued += 1;
        }
        Ok(rescued)
    }

    /// Re-enqueues QUEUED jobs untouched past the stale threshold.
    async fn requeue_stale(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let threshold = chrono::Duration::from_std(self.settings.lease.stale_queue_threshold())
            .unwrap_or_else(|_| chrono::Duration::seconds(1800));
        let stale = self
            .store
            .jobs_in_state(JobState::Queued, Some(now - threshold), SWEEP_LIMIT)
            .await?;
        let mut requeued = 0;
        for job in stale {
            let result = self
                .queue
                .enqueue(
                    JobEnvelope::new(job.id, job.project_id, job.priority, job.attempts),
                    EnqueueOptions::new(),
                )
                .await?;
            if result.is_enqueued() {
                metrics::counter!(
                    names::RECONCILE_RESCUES_TOTAL,
                    labels::REASON => "stale_queued",
                )
                .increment(1);
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Backfills FailedCommit records for FAILED_PERMANENT jobs lacking
    /// one (idempotent by job id).
    async fn backfill_failed_commits(&self) -> Result<usize> {
        let failed = self
            .store
            .jobs_in_state(JobState::FailedPermanent, None, SWEEP_LIMIT)
            .await?;
        let mut backfilled = 0;
        for job in failed {
            if self.store.get_failed_commit(&job.id).await?.is_some() {
                continue;
            }
            self.store
                .upsert_failed_commit(&FailedCommit {
                    scan_job_id: job.id,
                    project_id: job.project_id,
                    repo_slug: job.repo_slug.clone(),
                    commit_sha: job.commit_sha.clone(),
                    error: job
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "unknown failure".to_string()),
                    log_path: job.log_path.clone(),
                    disposition: FailedCommitDisposition::Pending,
                    retry_config_override: None,
                    recorded_at: Utc::now(),
                })
                .await?;
            metrics::counter!(
                names::RECONCILE_RESCUES_TOTAL,
                labels::REASON => "backfill",
            )
            .increment(1);
            backfilled += 1;
        }
        Ok(backfilled)
    }

    /// Re-checks orphan webhook events against in-flight jobs.
    ///
    /// A webhook can land before the dispatcher persisted the submission
    /// id; within the lease window a later sweep closes that gap.
    async fn recorrelate_orphans(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let window = chrono::Duration::from_std(self.settings.lease.lease_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let orphans = self.store.orphan_webhook_events(now - window).await?;
        let mut recorrelated = 0;
        for event in orphans {
            let Some(job) = self
                .store
                .find_running_by_analysis_id(&event.analysis_id)
                .await?
            else {
                continue;
            };
            self.store.correlate_webhook_event(&event.id, &job.id).await?;
            let outcome = match event.status {
                WebhookStatus::Success => AnalysisOutcome::Passed,
                WebhookStatus::Failed | WebhookStatus::Other => AnalysisOutcome::Failed,
            };
            self.completions.publish(&event.analysis_id, outcome);
            metrics::counter!(
                names::RECONCILE_RESCUES_TOTAL,
                labels::REASON => "orphan_webhook",
            )
            .increment(1);
            recorrelated += 1;
        }
        Ok(recorrelated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Lease, ScanJob};
    use crate::lock::memory::InMemoryLockManager;
    use crate::lock::{AcquireOutcome, SlotLockManager};
    use crate::queue::memory::InMemoryWorkQueue;
    use crate::record::WebhookEvent;
    use crate::store::memory::InMemoryStore;
    use scanforge_core::{ProjectId, WebhookEventId};
    use uuid::Uuid;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings {
            debug: true,
            ..Settings::default()
        })
    }

    fn reconciler(
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryWorkQueue>,
        locks: Arc<InMemoryLockManager>,
    ) -> Reconciler<InMemoryStore, InMemoryWorkQueue, InMemoryLockManager> {
        Reconciler::new(store, queue, locks, Arc::new(CompletionHub::new()), settings())
    }

    fn expired_lease() -> Lease {
        let past = Utc::now() - chrono::Duration::seconds(10);
        Lease {
            instance_name: "primary".into(),
            token: Uuid::new_v4(),
            slot: 0,
            acquired_at: past - chrono::Duration::seconds(300),
            expires_at: past,
            analysis_id: None,
        }
    }

    #[tokio::test]
    async fn expired_running_job_is_rescued_and_requeued() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let locks = Arc::new(InMemoryLockManager::new([("primary".to_string(), 1)]));

        let mut job = ScanJob::new(ProjectId::generate(), "acme/lib", "c1");
        job.state = JobState::Running;
        job.lease = Some(expired_lease());
        store.insert_job(&job).await.unwrap();

        let report = reconciler(store.clone(), queue.clone(), locks)
            .sweep()
            .await
            .unwrap();
        assert_eq!(report.rescued_running, 1);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.unwrap().contains("lease-expired"));
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn healthy_running_job_is_left_alone() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let locks = Arc::new(InMemoryLockManager::new([("primary".to_string(), 1)]));

        let mut job = ScanJob::new(ProjectId::generate(), "acme/lib", "c1");
        job.state = JobState::Running;
        let mut lease = expired_lease();
        lease.expires_at = Utc::now() + chrono::Duration::seconds(300);
        job.lease = Some(lease);
        store.insert_job(&job).await.unwrap();

        let report = reconciler(store.clone(), queue, locks).sweep().await.unwrap();
        assert_eq!(report.rescued_running, 0);
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Running);
    }

    #[tokio::test]
    async fn stale_queued_job_is_reenqueued_once() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let locks = Arc::new(InMemoryLockManager::new([("primary".to_string(), 1)]));

        let mut job = ScanJob::new(ProjectId::generate(), "acme/lib", "c1");
        job.state = JobState::Queued;
        job.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.insert_job(&job).await.unwrap();

        let sweeper = reconciler(store.clone(), queue.clone(), locks);
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.requeued_stale, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);

        // While the message stays live, another sweep deduplicates.
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.requeued_stale, 0);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_failed_commit_is_backfilled() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let locks = Arc::new(InMemoryLockManager::new([("primary".to_string(), 1)]));

        let mut job = ScanJob::new(ProjectId::generate(), "acme/lib", "c1");
        job.state = JobState::FailedPermanent;
        job.last_error = Some("commit-missing: gone".into());
        store.insert_job(&job).await.unwrap();

        let report = reconciler(store.clone(), queue, locks).sweep().await.unwrap();
        assert_eq!(report.backfilled_failed, 1);

        let failed = store.get_failed_commit(&job.id).await.unwrap().unwrap();
        assert!(failed.error.contains("commit-missing"));

        // Idempotent: nothing backfilled twice.
        let store2 = store.clone();
        let report = reconciler(
            store2,
            Arc::new(InMemoryWorkQueue::new()),
            Arc::new(InMemoryLockManager::new([("primary".to_string(), 1)])),
        )
        .sweep()
        .await
        .unwrap();
        assert_eq!(report.backfilled_failed, 0);
    }

    #[tokio::test]
    async fn orphan_webhook_recorrelates_when_submission_lands_late() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let locks = Arc::new(InMemoryLockManager::new([("primary".to_string(), 1)]));

        // The webhook arrived before any job carried its analysis id.
        let event = WebhookEvent {
            id: WebhookEventId::generate(),
            analysis_id: "AX-early".into(),
            component_key: "acme_c1".into(),
            status: WebhookStatus::Success,
            scan_job_id: None,
            payload: "{}".into(),
            received_at: Utc::now(),
        };
        store.insert_webhook_event(&event).await.unwrap();

        // Later the dispatcher binds the submission id.
        let mut job = ScanJob::new(ProjectId::generate(), "acme/lib", "c1");
        let outcome = locks
            .acquire(job.id, std::time::Duration::from_secs(300))
            .await
            .unwrap();
        let AcquireOutcome::Acquired(slot) = outcome else {
            panic!("slot available")
        };
        let mut lease = slot.to_job_lease();
        lease.analysis_id = Some("AX-early".into());
        job.state = JobState::Running;
        job.lease = Some(lease);
        store.insert_job(&job).await.unwrap();

        let hub = Arc::new(CompletionHub::new());
        let sweeper = Reconciler::new(
            store.clone(),
            queue,
            locks,
            hub.clone(),
            settings(),
        );
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.recorrelated_orphans, 1);
        assert_eq!(hub.peek("AX-early"), Some(AnalysisOutcome::Passed));

        let orphans = store
            .orphan_webhook_events(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(orphans.is_empty());
    }
}
