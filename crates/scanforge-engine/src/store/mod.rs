//! Pluggable storage for orchestration state.
//!
//! The [`Store`] trait defines the persistence layer for projects, scan
//! jobs, scan results, failed commits, and webhook events. Instance leases
//! are handled separately by [`crate::lock::SlotLockManager`].
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Job state transitions use compare-and-swap over
//!   `(id, state, attempts)` to prevent races under duplicate delivery
//! - **Job state is the source of truth**: The queue carries only work
//!   pointers; wiping the broker loses no state
//! - **Testability**: In-memory implementation for tests, a document store
//!   for production

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use scanforge_core::{ProjectId, ScanJobId};

use crate::error::Result;
use crate::job::{JobState, Lease, Priority, ScanJob, TransitionReason};
use crate::project::{Project, ProjectStatus};
use crate::record::{FailedCommit, FailedCommitDisposition, ScanResult, WebhookEvent};
use uuid::Uuid;

/// Result of a compare-and-swap job transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The transition was applied.
    Success,
    /// The job does not exist.
    NotFound,
    /// State or attempts didn't match the expectation; the caller must
    /// re-read before deciding anything.
    Conflict {
        /// The state actually found.
        actual_state: JobState,
        /// The attempts actually found.
        actual_attempts: u32,
    },
}

impl CasResult {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Outcome of inserting a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The job was inserted.
    Inserted,
    /// A job for the same `(project, commit)` already exists; nothing
    /// was written.
    Duplicate,
}

/// Fields applied together with a successful CAS transition.
///
/// `Option<Option<T>>` fields distinguish "leave unchanged" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// New attempts counter.
    pub attempts: Option<u32>,
    /// Set or clear the lease.
    pub lease: Option<Option<Lease>>,
    /// Set or clear the last error.
    pub last_error: Option<Option<String>>,
    /// Set the scanner log pointer.
    pub log_path: Option<PathBuf>,
    /// Record the instance that ran the job.
    pub instance_name: Option<String>,
    /// Set or clear the per-job configuration override.
    pub config_override: Option<Option<String>>,
    /// Change the priority class.
    pub priority: Option<Priority>,
}

impl JobPatch {
    /// An empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempts counter.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the lease.
    #[must_use]
    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(Some(lease));
        self
    }

    /// Clears the lease.
    #[must_use]
    pub fn clear_lease(mut self) -> Self {
        self.lease = Some(None);
        self
    }

    /// Sets the last error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    /// Clears the last error.
    #[must_use]
    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    /// Sets the scanner log pointer.
    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Records the instance that ran the job.
    #[must_use]
    pub fn with_instance(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    /// Sets the per-job configuration override.
    #[must_use]
    pub fn with_config_override(mut self, config: impl Into<String>) -> Self {
        self.config_override = Some(Some(config.into()));
        self
    }

    /// Changes the priority class.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Terminal progress applied to a project's aggregate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectProgress {
    /// One job reached SUCCEEDED.
    Succeeded,
    /// One job reached FAILED_PERMANENT.
    FailedPermanent,
    /// An operator retried a FAILED_PERMANENT job; the aggregate reopens.
    RetriedPermanent,
}

/// A window into a paginated read model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Entries to skip.
    pub offset: usize,
    /// Maximum entries to return.
    pub limit: usize,
}

impl Page {
    /// Creates a page.
    #[must_use]
    pub const fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// The first `limit` entries.
    #[must_use]
    pub const fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Storage abstraction for orchestration state.
///
/// Implementations must provide:
/// - Durability appropriate for the deployment
/// - CAS semantics for job state transitions
/// - The unique index on `(project_id, commit_sha)` and on
///   `scan_results(scan_job_id)`
///
/// ## CAS Semantics
///
/// [`Store::cas_job_state`] is the core primitive for distributed
/// correctness: it predicates the write on `(id, state, attempts)` so a
/// duplicate message delivery or a racing reconciler observes a
/// [`CasResult::Conflict`] instead of double-transitioning the job.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from
/// multiple dispatcher tasks.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Project operations ---

    /// Inserts a new project.
    async fn insert_project(&self, project: &Project) -> Result<()>;

    /// Gets a project by ID. Returns `None` if it does not exist.
    async fn get_project(&self, project_id: &ProjectId) -> Result<Option<Project>>;

    /// Saves a project (full replacement).
    async fn update_project(&self, project: &Project) -> Result<()>;

    /// Lists projects ordered by creation time, newest first.
    async fn list_projects(&self, page: Page) -> Result<Vec<Project>>;

    /// Applies terminal progress to a project's counters and recomputes
    /// the aggregate status in the same write.
    ///
    /// Returns the new status when the recomputation changed it.
    async fn apply_project_progress(
        &self,
        project_id: &ProjectId,
        progress: ProjectProgress,
    ) -> Result<Option<ProjectStatus>>;

    // --- Scan job operations ---

    /// Inserts a scan job, enforcing uniqueness on `(project_id, commit_sha)`.
    async fn insert_job(&self, job: &ScanJob) -> Result<InsertOutcome>;

    /// Gets a scan job by ID. Returns `None` if it does not exist.
    async fn get_job(&self, job_id: &ScanJobId) -> Result<Option<ScanJob>>;

    /// Atomically transitions a job if `(state, attempts)` match.
    ///
    /// The patch is applied only when the CAS succeeds; `updated_at` and
    /// `last_transition_reason` are always refreshed on success. The store
    /// rejects transitions the state graph forbids with
    /// [`crate::error::Error::InvalidStateTransition`].
    async fn cas_job_state(
        &self,
        job_id: &ScanJobId,
        expected_state: JobState,
        expected_attempts: u32,
        target_state: JobState,
        reason: TransitionReason,
        patch: JobPatch,
    ) -> Result<CasResult>;

    /// Extends the lease mirror on a RUNNING job.
    ///
    /// Conditional on the lease token; returns false when the job is not
    /// RUNNING anymore or the token does not match.
    async fn touch_job_lease(
        &self,
        job_id: &ScanJobId,
        token: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Binds the scanner's submission identifier to a RUNNING job's lease
    /// (so the completion webhook can correlate) and records the scanner
    /// log pointer.
    ///
    /// Conditional on the lease token; returns false when the job is not
    /// RUNNING anymore or the token does not match.
    async fn record_submission(
        &self,
        job_id: &ScanJobId,
        token: Uuid,
        analysis_id: &str,
        log_path: &std::path::Path,
    ) -> Result<bool>;

    /// Lists a project's jobs ordered by creation, oldest first.
    async fn jobs_by_project(&self, project_id: &ProjectId, page: Page) -> Result<Vec<ScanJob>>;

    /// Lists jobs in a state, optionally only those untouched since
    /// `updated_before`, ordered by `updated_at` ascending.
    async fn jobs_in_state(
        &self,
        state: JobState,
        updated_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ScanJob>>;

    /// Finds the RUNNING job whose lease carries `analysis_id`.
    async fn find_running_by_analysis_id(&self, analysis_id: &str) -> Result<Option<ScanJob>>;

    // --- Scan result operations ---

    /// Upserts a result keyed by `scan_job_id` (idempotent).
    async fn upsert_result(&self, result: &ScanResult) -> Result<()>;

    /// Gets the result for a job, if any.
    async fn get_result_for_job(&self, job_id: &ScanJobId) -> Result<Option<ScanResult>>;

    /// Lists a project's results ordered by fetch time, oldest first.
    async fn results_by_project(&self, project_id: &ProjectId, page: Page)
    -> Result<Vec<ScanResult>>;

    // --- Failed commit operations ---

    /// Upserts a failed-commit record keyed by `scan_job_id` (idempotent).
    async fn upsert_failed_commit(&self, failed: &FailedCommit) -> Result<()>;

    /// Gets the failed-commit record for a job, if any.
    async fn get_failed_commit(&self, job_id: &ScanJobId) -> Result<Option<FailedCommit>>;

    /// Updates a failed commit's triage disposition; optionally records the
    /// configuration override the operator supplied.
    ///
    /// Returns false when no record exists for the job.
    async fn set_failed_commit_disposition(
        &self,
        job_id: &ScanJobId,
        disposition: FailedCommitDisposition,
        retry_config_override: Option<String>,
    ) -> Result<bool>;

    /// Lists failed commits, optionally filtered by disposition, newest
    /// first.
    async fn list_failed_commits(
        &self,
        disposition: Option<FailedCommitDisposition>,
        page: Page,
    ) -> Result<Vec<FailedCommit>>;

    // --- Webhook event operations ---

    /// Persists a webhook event (always, orphans included).
    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<()>;

    /// Marks an event as correlated to a job.
    async fn correlate_webhook_event(
        &self,
        event_id: &scanforge_core::WebhookEventId,
        job_id: &ScanJobId,
    ) -> Result<()>;

    /// Lists orphan events received after `since`, oldest first.
    async fn orphan_webhook_events(&self, since: DateTime<Utc>) -> Result<Vec<WebhookEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_is_success() {
        assert!(CasResult::Success.is_success());
        assert!(!CasResult::NotFound.is_success());
        assert!(
            !CasResult::Conflict {
                actual_state: JobState::Running,
                actual_attempts: 1,
            }
            .is_success()
        );
    }

    #[test]
    fn page_defaults() {
        let page = Page::default();
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, 100);
        assert_eq!(Page::first(10), Page::new(0, 10));
    }

    #[test]
    fn patch_builder_sets_and_clears() {
        let patch = JobPatch::new()
            .with_attempts(2)
            .clear_lease()
            .with_error("boom");
        assert_eq!(patch.attempts, Some(2));
        assert_eq!(patch.lease, Some(None));
        assert_eq!(patch.last_error, Some(Some("boom".to_string())));
        assert!(patch.log_path.is_none());
    }
}
