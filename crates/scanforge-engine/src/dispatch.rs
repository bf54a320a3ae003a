//! The dispatcher worker loop.
//!
//! One loop per worker: receive a work pointer, load the authoritative
//! job, claim an instance slot, transition QUEUED → RUNNING, check out the
//! commit, run the scanner, and wait for the webhook-driven completion.
//! The queue message is acknowledged only once the job is terminal or a
//! controlled re-enqueue happened.
//!
//! ## Ownership of state
//!
//! The dispatcher is the single writer for its job while the lease is
//! held: webhook intake publishes outcomes on the [`CompletionHub`] and
//! the waiting dispatcher translates them into transitions. A dispatcher
//! that dies mid-scan leaves the rescue to the reconciler, bounded by the
//! lease TTL.

use std::sync::Arc;

use crate::error::Result;
use crate::job::{JobState, Priority, ScanFailure, ScanJob, TransitionReason};
use crate::lock::{AcquireOutcome, RenewalResult, SlotLease, SlotLockManager};
use crate::metrics::{labels, names};
use crate::metrics_fetch::MetricsFetcher;
use crate::queue::{Delivery, EnqueueOptions, JobEnvelope, WorkQueue};
use crate::record::{FailedCommit, FailedCommitDisposition};
use crate::repo_cache::{RepoCache, normalize_repo_url};
use crate::retry::BackoffPolicy;
use crate::scanner::Scanner;
use crate::store::{JobPatch, ProjectProgress, Store};
use crate::webhook::{AnalysisOutcome, CompletionHub};
use scanforge_core::config::Settings;

/// What processing one delivery amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The job reached SUCCEEDED.
    Finalized,
    /// The job no longer exists; the message was dropped.
    SkippedMissing,
    /// The job was already terminal or running elsewhere.
    SkippedTerminal,
    /// Every instance is at its cap; the message reappears after backoff.
    NoSlotAvailable,
    /// A concurrent writer took the job first.
    LostRace,
    /// A transient failure; the job is QUEUED again with backoff.
    RetryScheduled,
    /// The job reached FAILED_PERMANENT.
    FailedPermanently,
}

/// How a failure was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureDisposition {
    /// Re-queued with exponential backoff.
    RetryScheduled,
    /// Escalated to FAILED_PERMANENT with a FailedCommit record.
    FailedPermanently,
    /// A concurrent writer already moved the job.
    LostRace,
}

/// Maps a failure reason string to the transition reason persisted on the
/// job.
fn transition_reason_for(failure: &ScanFailure) -> TransitionReason {
    match failure.reason.as_str() {
        "lease-expired" => TransitionReason::LeaseExpired,
        "analysis-failed" => TransitionReason::AnalysisFailed,
        "scan-timeout" => TransitionReason::ScanTimedOut,
        "webhook-timeout" => TransitionReason::WebhookTimedOut,
        "commit-missing" | "checkout-io" | "repo-unreachable" | "repo-lock-contended" => {
            TransitionReason::CheckoutFailed
        }
        reason if reason.starts_with("metrics-") => TransitionReason::MetricsFailed,
        _ => TransitionReason::ScannerFailed,
    }
}

/// Settles a failure on a RUNNING job: increments attempts, writes
/// FAILED_TEMP, then either re-queues with backoff or escalates to
/// FAILED_PERMANENT with its FailedCommit record and DLQ entry.
///
/// Shared by the dispatcher and the reconciler; the lease slot itself is
/// released (or reaped) by the caller.
pub(crate) async fn fail_job<S: Store, Q: WorkQueue>(
    store: &S,
    queue: &Q,
    job: &ScanJob,
    failure: &ScanFailure,
    policy: &BackoffPolicy,
) -> Result<FailureDisposition> {
    let attempts = job.attempts + 1;
    let error = failure.to_error_string();

    let cas = store
        .cas_job_state(
            &job.id,
            JobState::Running,
            job.attempts,
            JobState::FailedTemp,
            transition_reason_for(failure),
            JobPatch::new()
                .with_attempts(attempts)
                .with_error(error.clone())
                .clear_lease(),
        )
        .await?;
    if !cas.is_success() {
        return Ok(FailureDisposition::LostRace);
    }
    metrics::counter!(
        names::JOBS_TOTAL,
        labels::FROM_STATE => JobState::Running.as_label(),
        labels::TO_STATE => JobState::FailedTemp.as_label(),
    )
    .increment(1);

    let escalate = !failure.is_transient() || attempts > job.max_retries;
    if escalate {
        let cas = store
            .cas_job_state(
                &job.id,
                JobState::FailedTemp,
                attempts,
                JobState::FailedPermanent,
                TransitionReason::RetriesExhausted,
                JobPatch::new(),
            )
            .await?;
        if !cas.is_success() {
            return Ok(FailureDisposition::LostRace);
        }
        let refreshed = store.get_job(&job.id).await?;
        let log_path = refreshed.and_then(|j| j.log_path).or(job.log_path.clone());
        store
            .upsert_failed_commit(&FailedCommit {
                scan_job_id: job.id,
                project_id: job.project_id,
                repo_slug: job.repo_slug.clone(),
                commit_sha: job.commit_sha.clone(),
                error,
                log_path,
                disposition: FailedCommitDisposition::Pending,
                retry_config_override: None,
                recorded_at: chrono::Utc::now(),
            })
            .await?;
        queue.send_to_dlq(job.id).await?;
        store
            .apply_project_progress(&job.project_id, ProjectProgress::FailedPermanent)
            .await?;
        tracing::error!(
            job_id = %job.id,
            attempts,
            reason = %failure.reason,
            "scan job failed permanently"
        );
        return Ok(FailureDisposition::FailedPermanently);
    }

    let delay = policy.delay(attempts);
    let cas = store
        .cas_job_state(
            &job.id,
            JobState::FailedTemp,
            attempts,
            JobState::Queued,
            TransitionReason::RetryScheduled,
            JobPatch::new().with_priority(Priority::Retry),
        )
        .await?;
    if !cas.is_success() {
        return Ok(FailureDisposition::LostRace);
    }
    queue
        .enqueue(
            JobEnvelope::new(job.id, job.project_id, Priority::Retry, attempts),
            EnqueueOptions::new().with_delay(delay),
        )
        .await?;
    tracing::warn!(
        job_id = %job.id,
        attempts,
        max_retries = job.max_retries,
        delay_ms = delay.as_millis() as u64,
        reason = %failure.reason,
        "scan job re-queued after temporary failure"
    );
    Ok(FailureDisposition::RetryScheduled)
}

/// Consumes the work queue and drives scans to a terminal state.
pub struct Dispatcher<S, Q, L> {
    store: Arc<S>,
    queue: Arc<Q>,
    locks: Arc<L>,
    repo_cache: RepoCache,
    scanner: Scanner,
    fetcher: MetricsFetcher<S, L>,
    completions: Arc<CompletionHub>,
    backoff: BackoffPolicy,
    settings: Arc<Settings>,
    worker_id: String,
}

impl<S, Q, L> std::fmt::Debug for Dispatcher<S, Q, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl<S, Q, L> Dispatcher<S, Q, L>
where
    S: Store + 'static,
    Q: WorkQueue,
    L: SlotLockManager + 'static,
{
    /// Creates a dispatcher for one worker.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        queue: Arc<Q>,
        locks: Arc<L>,
        completions: Arc<CompletionHub>,
        settings: Arc<Settings>,
        worker_id: impl Into<String>,
    ) -> Self {
        let worker_id = worker_id.into();
        Self {
            repo_cache: RepoCache::new(&settings.paths.workdir, &worker_id)
                .with_fork_remote_base(&settings.fork_remote_base),
            scanner: Scanner::new(&settings.paths.log_dir, settings.lease.scan_timeout()),
            fetcher: MetricsFetcher::new(Arc::clone(&store), Arc::clone(&locks), Arc::clone(&settings)),
            store,
            queue,
            locks,
            completions,
            backoff: BackoffPolicy::from_settings(&settings.retry),
            settings,
            worker_id,
        }
    }

    /// Runs the receive loop until the task is aborted.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(worker_id = %self.worker_id, "dispatcher started");
        loop {
            let delivery = self.queue.receive().await?;
            if let Err(err) = self.process_delivery(delivery).await {
                tracing::error!(error = %err, "delivery processing failed");
            }
        }
    }

    /// Processes one delivery to a terminal state or a controlled
    /// re-enqueue, then settles the receipt.
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<DispatchOutcome> {
        let job_id = delivery.envelope.job_id;
        let Some(mut job) = self.store.get_job(&job_id).await? else {
            self.queue.ack(&delivery.receipt).await?;
            return Ok(DispatchOutcome::SkippedMissing);
        };
        if !matches!(job.state, JobState::Queued | JobState::Pending) {
            self.queue.ack(&delivery.receipt).await?;
            return Ok(DispatchOutcome::SkippedTerminal);
        }

        let acquire = self
            .locks
            .acquire(job.id, self.settings.lease.lease_ttl())
            .await?;
        let slot_lease = match acquire {
            AcquireOutcome::Acquired(lease) => lease,
            AcquireOutcome::NoSlotAvailable => {
                metrics::counter!(
                    names::LEASE_ACQUISITIONS_TOTAL,
                    labels::RESULT => "no_slot",
                )
                .increment(1);
                self.queue
                    .nack(&delivery.receipt, self.backoff.delay(1))
                    .await?;
                return Ok(DispatchOutcome::NoSlotAvailable);
            }
        };
        metrics::counter!(
            names::LEASE_ACQUISITIONS_TOTAL,
            labels::INSTANCE => slot_lease.instance_name.clone(),
            labels::RESULT => "acquired",
        )
        .increment(1);

        // A job the ingestor persisted but never enqueued still walks the
        // graph: PENDING → QUEUED first.
        if job.state == JobState::Pending {
            let cas = self
                .store
                .cas_job_state(
                    &job.id,
                    JobState::Pending,
                    job.attempts,
                    JobState::Queued,
                    TransitionReason::Enqueued,
                    JobPatch::new(),
                )
                .await?;
            if !cas.is_success() {
                let _ = self.locks.release(&slot_lease).await;
                self.queue.ack(&delivery.receipt).await?;
                return Ok(DispatchOutcome::LostRace);
            }
            job.state = JobState::Queued;
        }

        let cas = self
            .store
            .cas_job_state(
                &job.id,
                JobState::Queued,
                job.attempts,
                JobState::Running,
                TransitionReason::LeaseAcquired,
                JobPatch::new()
                    .with_lease(slot_lease.to_job_lease())
                    .with_instance(slot_lease.instance_name.clone()),
            )
            .await?;
        if !cas.is_success() {
            let _ = self.locks.release(&slot_lease).await;
            self.queue.ack(&delivery.receipt).await?;
            return Ok(DispatchOutcome::LostRace);
        }
        job.state = JobState::Running;
        job.instance_name = Some(slot_lease.instance_name.clone());

        // The heartbeat runs inside this task: killing the worker stops
        // renewals, so the lease expires and the reconciler takes over.
        let outcome = {
            let scan = self.execute_scan(&job, &slot_lease);
            tokio::pin!(scan);
            tokio::select! {
                outcome = &mut scan => outcome?,
                () = self.heartbeat_loop(&slot_lease) => DispatchOutcome::LostRace,
            }
        };
        self.queue.ack(&delivery.receipt).await?;
        Ok(outcome)
    }

    /// Heartbeats the slot lease and the job's lease mirror at a third of
    /// the TTL; returns when the lease is lost.
    async fn heartbeat_loop(&self, lease: &SlotLease) {
        let ttl = self.settings.lease.lease_ttl();
        let mut ticker = tokio::time::interval(self.settings.lease.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.locks.heartbeat(lease, ttl).await {
                Ok(RenewalResult::Renewed { expires_at }) => {
                    metrics::counter!(
                        names::LEASE_HEARTBEATS_TOTAL,
                        labels::RESULT => "renewed",
                    )
                    .increment(1);
                    let _ = self
                        .store
                        .touch_job_lease(&lease.holder, lease.token, expires_at)
                        .await;
                }
                Ok(_) | Err(_) => {
                    metrics::counter!(
                        names::LEASE_HEARTBEATS_TOTAL,
                        labels::RESULT => "lost",
                    )
                    .increment(1);
                    return;
                }
            }
        }
    }

    /// Drives one RUNNING job through checkout, scan, and completion.
    async fn execute_scan(
        &self,
        job: &ScanJob,
        slot_lease: &SlotLease,
    ) -> Result<DispatchOutcome> {
        let Some(project) = self.store.get_project(&job.project_id).await? else {
            let failure = ScanFailure::permanent("project-missing")
                .with_detail(format!("project {} not found", job.project_id));
            return self.settle_failure(job, slot_lease, &failure).await;
        };
        let component_key = job.component_key(project.project_key());
        let Some(instance) = self.settings.instance(&slot_lease.instance_name) else {
            let failure = ScanFailure::permanent("config-malformed")
                .with_detail(format!("instance '{}' not configured", slot_lease.instance_name));
            return self.settle_failure(job, slot_lease, &failure).await;
        };

        // A prior attempt may have submitted before its worker died; the
        // component already exists then and a re-scan would be wasted.
        if self
            .fetcher
            .client()
            .component_exists(instance, &component_key)
            .await
        {
            tracing::info!(component_key, "component already analyzed; skipping scan");
            let analysis_id = job
                .analysis_id()
                .map_or_else(|| component_key.clone(), str::to_string);
            return match self
                .fetcher
                .finalize(job, &project, slot_lease, &analysis_id)
                .await
            {
                Ok(()) => Ok(DispatchOutcome::Finalized),
                Err(failure) => self.settle_failure(job, slot_lease, &failure).await,
            };
        }

        let repo_url = normalize_repo_url(project.repo_url.as_deref(), &job.repo_slug);
        let checkout = match self
            .repo_cache
            .checkout(&repo_url, &job.repo_slug, &job.commit_sha)
            .await
        {
            Ok(checkout) => checkout,
            Err(failure) => return self.settle_failure(job, slot_lease, &failure).await,
        };

        let config = job
            .config_override
            .as_deref()
            .or(project.config_override.as_deref());
        let started = std::time::Instant::now();
        let scan = self
            .scanner
            .run(instance, checkout.path(), &component_key, config)
            .await;
        if let Err(failure) = self.repo_cache.release(checkout).await {
            tracing::warn!(reason = %failure.reason, "working copy cleanup failed");
        }

        let submission = match scan {
            Ok(submission) => {
                metrics::histogram!(
                    names::SCAN_DURATION_SECONDS,
                    labels::INSTANCE => slot_lease.instance_name.clone(),
                    labels::OUTCOME => "submitted",
                )
                .record(started.elapsed().as_secs_f64());
                submission
            }
            Err(failure) => {
                metrics::histogram!(
                    names::SCAN_DURATION_SECONDS,
                    labels::INSTANCE => slot_lease.instance_name.clone(),
                    labels::OUTCOME => "failed",
                )
                .record(started.elapsed().as_secs_f64());
                return self.settle_failure(job, slot_lease, &failure).await;
            }
        };

        let recorded = self
            .store
            .record_submission(
                &job.id,
                slot_lease.token,
                &submission.analysis_id,
                &submission.log_path,
            )
            .await?;
        if !recorded {
            // The reconciler reaped the lease mid-scan; the retry owns the
            // job now.
            let _ = self.locks.release(slot_lease).await;
            return Ok(DispatchOutcome::LostRace);
        }

        let mut job = job.clone();
        job.log_path = Some(submission.log_path.clone());

        let wait = tokio::time::timeout(
            self.settings.lease.webhook_wait_timeout(),
            self.completions.wait(&submission.analysis_id),
        )
        .await;
        match wait {
            Ok(AnalysisOutcome::Passed) => {
                match self
                    .fetcher
                    .finalize(&job, &project, slot_lease, &submission.analysis_id)
                    .await
                {
                    Ok(()) => Ok(DispatchOutcome::Finalized),
                    Err(failure) => self.settle_failure(&job, slot_lease, &failure).await,
                }
            }
            Ok(AnalysisOutcome::Failed) => {
                let failure = ScanFailure::transient("analysis-failed")
                    .with_detail("analysis server reported a failed analysis");
                self.settle_failure(&job, slot_lease, &failure).await
            }
            Err(_) => {
                let failure = ScanFailure::transient("webhook-timeout").with_detail(format!(
                    "no completion webhook within {}s",
                    self.settings.lease.wait_for_webhook_timeout_seconds
                ));
                self.settle_failure(&job, slot_lease, &failure).await
            }
        }
    }

    /// Applies the failure flow and releases the slot.
    async fn settle_failure(
        &self,
        job: &ScanJob,
        slot_lease: &SlotLease,
        failure: &ScanFailure,
    ) -> Result<DispatchOutcome> {
        let disposition = fail_job(
            self.store.as_ref(),
            self.queue.as_ref(),
            job,
            failure,
            &self.backoff,
        )
        .await?;
        let _ = self.locks.release(slot_lease).await;
        Ok(match disposition {
            FailureDisposition::RetryScheduled => DispatchOutcome::RetryScheduled,
            FailureDisposition::FailedPermanently => DispatchOutcome::FailedPermanently,
            FailureDisposition::LostRace => DispatchOutcome::LostRace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::memory::InMemoryLockManager;
    use crate::queue::memory::InMemoryWorkQueue;
    use crate::store::memory::InMemoryStore;
    use scanforge_core::ProjectId;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(
            std::time::Duration::from_millis(10),
            std::time::Duration::from_millis(100),
            0.0,
        )
    }

    async fn running_job(store: &InMemoryStore, max_retries: u32, attempts: u32) -> ScanJob {
        let mut job = ScanJob::new(ProjectId::generate(), "acme/lib", "c1")
            .with_max_retries(max_retries);
        job.state = JobState::Running;
        job.attempts = attempts;
        store.insert_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_retry_priority() {
        let store = InMemoryStore::new();
        let queue = InMemoryWorkQueue::new();
        let job = running_job(&store, 3, 0).await;

        let disposition = fail_job(
            &store,
            &queue,
            &job,
            &ScanFailure::transient("scanner-failed"),
            &policy(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, FailureDisposition::RetryScheduled);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.priority, Priority::Retry);
        assert!(stored.last_error.unwrap().contains("scanner-failed"));
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_writes_failed_commit_and_dlq() {
        let store = InMemoryStore::new();
        let queue = InMemoryWorkQueue::new();
        let mut project = crate::project::Project::new("acme", "/tmp/a.csv");
        project.stats.commit_count = 1;
        project.status = crate::project::ProjectStatus::Collecting;
        store.insert_project(&project).await.unwrap();

        let mut job = ScanJob::new(project.id, "acme/lib", "c1").with_max_retries(3);
        job.state = JobState::Running;
        store.insert_job(&job).await.unwrap();

        let disposition = fail_job(
            &store,
            &queue,
            &job,
            &ScanFailure::permanent("commit-missing").with_detail("c1 not in origin"),
            &policy(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, FailureDisposition::FailedPermanently);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::FailedPermanent);
        assert_eq!(stored.attempts, 1);

        let failed = store
            .get_failed_commit(&job.id)
            .await
            .unwrap()
            .expect("failed commit recorded");
        assert!(failed.error.contains("commit-missing"));
        assert_eq!(failed.disposition, FailedCommitDisposition::Pending);
        assert_eq!(queue.dlq_entries().unwrap(), vec![job.id]);

        let stored_project = store.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(stored_project.failed_commits, 1);
        assert_eq!(
            stored_project.status,
            crate::project::ProjectStatus::Partial
        );
    }

    #[tokio::test]
    async fn exhausted_budget_escalates_transient_failure() {
        let store = InMemoryStore::new();
        let queue = InMemoryWorkQueue::new();
        let mut project = crate::project::Project::new("acme", "/tmp/a.csv");
        project.stats.commit_count = 1;
        project.status = crate::project::ProjectStatus::Collecting;
        store.insert_project(&project).await.unwrap();

        let mut job = ScanJob::new(project.id, "acme/lib", "c1").with_max_retries(2);
        job.state = JobState::Running;
        job.attempts = 2;
        store.insert_job(&job).await.unwrap();

        // attempts becomes 3 > max_retries(2): escalate.
        let disposition = fail_job(
            &store,
            &queue,
            &job,
            &ScanFailure::transient("scanner-failed"),
            &policy(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, FailureDisposition::FailedPermanently);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
        assert!(stored.attempts <= stored.max_retries + 1);
    }

    #[tokio::test]
    async fn duplicate_failure_settles_as_lost_race() {
        let store = InMemoryStore::new();
        let queue = InMemoryWorkQueue::new();
        let job = running_job(&store, 3, 0).await;

        fail_job(
            &store,
            &queue,
            &job,
            &ScanFailure::transient("scanner-failed"),
            &policy(),
        )
        .await
        .unwrap();
        // The same stale view of the job fails again (duplicate delivery).
        let disposition = fail_job(
            &store,
            &queue,
            &job,
            &ScanFailure::transient("scanner-failed"),
            &policy(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, FailureDisposition::LostRace);
    }

    #[test]
    fn transition_reasons_map_by_failure_class() {
        assert_eq!(
            transition_reason_for(&ScanFailure::transient("lease-expired")),
            TransitionReason::LeaseExpired
        );
        assert_eq!(
            transition_reason_for(&ScanFailure::permanent("commit-missing")),
            TransitionReason::CheckoutFailed
        );
        assert_eq!(
            transition_reason_for(&ScanFailure::transient("metrics-5xx")),
            TransitionReason::MetricsFailed
        );
        assert_eq!(
            transition_reason_for(&ScanFailure::transient("something-else")),
            TransitionReason::ScannerFailed
        );
    }
}
