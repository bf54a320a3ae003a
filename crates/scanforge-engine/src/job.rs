//! Scan job state and lifecycle management.
//!
//! This module provides:
//! - `JobState`: The state machine for scan job execution
//! - `ScanJob`: The durable unit of work for one commit
//! - `TransitionReason`: Explicit reasons for all state transitions
//! - `Lease`: The slot lease bound to a RUNNING job
//! - `ScanFailure`: Classified failure outcomes

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scanforge_core::{ProjectId, ScanJobId};

/// Reason for a scan job state transition.
///
/// Every state transition must have an explicit reason for:
/// - Auditing and debugging
/// - Metrics and alerting
/// - Recovery decisions in the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    // --- Happy path ---
    /// Ingestor enqueued the job.
    Enqueued,
    /// Dispatcher acquired an instance lease and started the scanner.
    LeaseAcquired,
    /// Webhook reported success and metrics were persisted.
    MetricsStored,

    // --- Failure path ---
    /// Scanner subprocess failed with a retryable class.
    ScannerFailed,
    /// Analysis server reported a failed analysis.
    AnalysisFailed,
    /// Scanner exceeded its timeout.
    ScanTimedOut,
    /// No webhook arrived before the wait deadline.
    WebhookTimedOut,
    /// Lease expired without a completion.
    LeaseExpired,
    /// Checkout or repository access failed.
    CheckoutFailed,
    /// Metrics fetch failed non-retryably.
    MetricsFailed,

    // --- Recovery path ---
    /// Job re-queued for a bounded retry.
    RetryScheduled,
    /// Retry budget exhausted or failure class is permanent.
    RetriesExhausted,
    /// Reconciler re-queued a stale QUEUED job.
    StaleRequeued,
    /// Operator explicitly retried a permanently failed job.
    OperatorRetry,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enqueued => write!(f, "enqueued"),
            Self::LeaseAcquired => write!(f, "lease_acquired"),
            Self::MetricsStored => write!(f, "metrics_stored"),
            Self::ScannerFailed => write!(f, "scanner_failed"),
            Self::AnalysisFailed => write!(f, "analysis_failed"),
            Self::ScanTimedOut => write!(f, "scan_timed_out"),
            Self::WebhookTimedOut => write!(f, "webhook_timed_out"),
            Self::LeaseExpired => write!(f, "lease_expired"),
            Self::CheckoutFailed => write!(f, "checkout_failed"),
            Self::MetricsFailed => write!(f, "metrics_failed"),
            Self::RetryScheduled => write!(f, "retry_scheduled"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::StaleRequeued => write!(f, "stale_requeued"),
            Self::OperatorRetry => write!(f, "operator_retry"),
        }
    }
}

/// Scan job state machine.
///
/// States follow a directed graph:
/// ```text
/// ┌─────────┐  enqueued  ┌────────┐  lease acquired  ┌─────────┐
/// │ PENDING │───────────►│ QUEUED │─────────────────►│ RUNNING │
/// └─────────┘            └────────┘                  └─────────┘
///                             ▲                        │      │
///                             │ retry                  │      │ webhook + metrics
///                             │                        ▼      ▼
///                        ┌────────────┐          ┌───────────┐┌───────────┐
///                        │ FAILED_TEMP│◄─────────│  (fail)   ││ SUCCEEDED │
///                        └────────────┘          └───────────┘└───────────┘
///                             │ retries exhausted / permanent class
///                             ▼
///                     ┌──────────────────┐  operator retry
///                     │ FAILED_PERMANENT │──────────────────► QUEUED
///                     └──────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created by the ingestor, not yet enqueued.
    Pending,
    /// On the work queue, waiting for a dispatcher.
    Queued,
    /// A dispatcher holds a lease and the scanner is in flight.
    Running,
    /// Metrics persisted; terminal for normal flow.
    Succeeded,
    /// Retryable failure; will re-queue while attempts remain.
    FailedTemp,
    /// Out of retries or non-retryable class; terminal for normal flow.
    FailedPermanent,
}

impl JobState {
    /// Returns true if this is a terminal state for normal flow.
    ///
    /// `FAILED_PERMANENT` can still leave via an explicit operator retry.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedPermanent)
    }

    /// Returns true if the job is actively moving through the pipeline.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued | Self::Running | Self::FailedTemp)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Queued),
            Self::Queued => matches!(target, Self::Running),
            Self::Running => matches!(target, Self::Succeeded | Self::FailedTemp),
            Self::FailedTemp => matches!(target, Self::Queued | Self::FailedPermanent),
            // Operator retry is the single exit from FAILED_PERMANENT.
            Self::FailedPermanent => matches!(target, Self::Queued),
            Self::Succeeded => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedTemp => "failed_temp",
            Self::FailedPermanent => "failed_permanent",
        }
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::FailedTemp => write!(f, "FAILED_TEMP"),
            Self::FailedPermanent => write!(f, "FAILED_PERMANENT"),
        }
    }
}

/// Priority class of a queued job.
///
/// Each class maps to its own broker queue; dispatchers drain `High`
/// before `Retry` before `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Fresh work from ingestion.
    Normal,
    /// Re-queued after a temporary failure.
    Retry,
    /// Operator-initiated work.
    High,
}

impl Priority {
    /// Returns a label suitable for queue names and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Retry => "retry",
            Self::High => "high",
        }
    }

    /// All priority classes, highest first (drain order).
    #[must_use]
    pub const fn drain_order() -> [Self; 3] {
        [Self::High, Self::Retry, Self::Normal]
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A lease on one concurrency slot of one analysis instance.
///
/// Written onto the job atomically with the QUEUED → RUNNING transition.
/// The `analysis_id` is bound after the scanner reports its submission so
/// the completion webhook can correlate back to this job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Instance holding the slot.
    pub instance_name: String,
    /// Token that must match for heartbeat and release.
    pub token: Uuid,
    /// Slot index in `0..concurrency_cap`.
    pub slot: u32,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires unless heartbeated.
    pub expires_at: DateTime<Utc>,
    /// Submission identifier returned by the analysis server, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<String>,
}

impl Lease {
    /// Returns true if the lease has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Classification of a scan failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable while the attempt budget lasts.
    Transient,
    /// Never retried automatically.
    Permanent,
}

/// A classified failure outcome.
///
/// Components return these instead of raising across boundaries; only the
/// component that owns the job's state translates them into transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFailure {
    /// Whether the failure may be retried.
    pub kind: FailureKind,
    /// Stable machine-readable reason, e.g. `commit-missing`.
    pub reason: String,
    /// Free-form detail for the operator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ScanFailure {
    /// Creates a transient (retryable) failure.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            reason: reason.into(),
            detail: None,
        }
    }

    /// Creates a permanent (non-retryable) failure.
    #[must_use]
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            reason: reason.into(),
            detail: None,
        }
    }

    /// Attaches operator-facing detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Returns true if the failure may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, FailureKind::Transient)
    }

    /// Renders the failure as the `last_error` string persisted on the job.
    #[must_use]
    pub fn to_error_string(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{}: {detail}", self.reason),
            None => self.reason.clone(),
        }
    }
}

impl std::fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_error_string())
    }
}

/// The durable unit of work: one commit of one repository to analyze.
///
/// Exactly one scan job exists per `(project, commit)` pair; the store
/// enforces the uniqueness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    /// Unique job identifier.
    pub id: ScanJobId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Repository slug, e.g. `acme/lib`.
    pub repo_slug: String,
    /// Commit to check out and analyze.
    pub commit_sha: String,
    /// Branch recorded at ingest (may be empty).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Current state.
    pub state: JobState,
    /// Attempts consumed (increments on every failure).
    pub attempts: u32,
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Priority class for queueing.
    pub priority: Priority,
    /// Slot lease while RUNNING.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    /// Instance that last ran this job, kept for triage after release.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    /// Last classified error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Per-commit scanner log, once a scan ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Per-job analysis configuration override (wins over the project's).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_override: Option<String>,
    /// Reason for the most recent transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_reason: Option<TransitionReason>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp; the reconciler keys staleness off this.
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    /// Creates a new PENDING scan job.
    #[must_use]
    pub fn new(
        project_id: ProjectId,
        repo_slug: impl Into<String>,
        commit_sha: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ScanJobId::generate(),
            project_id,
            repo_slug: repo_slug.into(),
            commit_sha: commit_sha.into(),
            branch: None,
            state: JobState::Pending,
            attempts: 0,
            max_retries: 5,
            priority: Priority::Normal,
            lease: None,
            instance_name: None,
            last_error: None,
            log_path: None,
            config_override: None,
            last_transition_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the branch recorded at ingest.
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        if !branch.is_empty() {
            self.branch = Some(branch);
        }
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the priority class.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns true if the job is in a terminal state for normal flow.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if another retry fits within the budget.
    ///
    /// Attempts count failures; the invariant is `attempts <= max_retries + 1`.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// The component key addressing this job's analysis on the server.
    #[must_use]
    pub fn component_key(&self, project_key: &str) -> String {
        format!("{project_key}_{}", self.commit_sha)
    }

    /// Returns the analysis id bound to the current lease, if any.
    #[must_use]
    pub fn analysis_id(&self) -> Option<&str> {
        self.lease.as_ref().and_then(|l| l.analysis_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_valid() {
        assert!(JobState::Pending.can_transition_to(JobState::Queued));
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
    }

    #[test]
    fn failure_transitions_are_valid() {
        assert!(JobState::Running.can_transition_to(JobState::FailedTemp));
        assert!(JobState::FailedTemp.can_transition_to(JobState::Queued));
        assert!(JobState::FailedTemp.can_transition_to(JobState::FailedPermanent));
    }

    #[test]
    fn operator_retry_is_the_only_exit_from_permanent() {
        assert!(JobState::FailedPermanent.can_transition_to(JobState::Queued));
        assert!(!JobState::FailedPermanent.can_transition_to(JobState::Running));
        assert!(!JobState::FailedPermanent.can_transition_to(JobState::Succeeded));
    }

    #[test]
    fn succeeded_is_terminal() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(!JobState::Succeeded.can_transition_to(JobState::Queued));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Running));
    }

    #[test]
    fn invalid_shortcuts_are_rejected() {
        assert!(!JobState::Pending.can_transition_to(JobState::Running));
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Running.can_transition_to(JobState::FailedPermanent));
    }

    #[test]
    fn retry_budget_respects_max_retries() {
        let mut job = ScanJob::new(ProjectId::generate(), "acme/lib", "c1").with_max_retries(2);
        assert!(job.can_retry());
        job.attempts = 2;
        assert!(job.can_retry());
        job.attempts = 3;
        assert!(!job.can_retry());
    }

    #[test]
    fn component_key_joins_project_key_and_commit() {
        let job = ScanJob::new(ProjectId::generate(), "acme/lib", "deadbeef");
        assert_eq!(job.component_key("acme"), "acme_deadbeef");
    }

    #[test]
    fn empty_branch_is_dropped() {
        let job = ScanJob::new(ProjectId::generate(), "acme/lib", "c1").with_branch("");
        assert!(job.branch.is_none());
        let job = ScanJob::new(ProjectId::generate(), "acme/lib", "c1").with_branch("main");
        assert_eq!(job.branch.as_deref(), Some("main"));
    }

    #[test]
    fn lease_expiry_check() {
        let now = Utc::now();
        let lease = Lease {
            instance_name: "primary".into(),
            token: Uuid::new_v4(),
            slot: 0,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(30),
            analysis_id: None,
        };
        assert!(!lease.is_expired_at(now));
        assert!(lease.is_expired_at(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn failure_rendering_includes_detail() {
        let failure = ScanFailure::permanent("commit-missing").with_detail("abc not in origin");
        assert_eq!(failure.to_error_string(), "commit-missing: abc not in origin");
        assert!(!failure.is_transient());
    }

    #[test]
    fn priority_drain_order_is_high_first() {
        assert_eq!(
            Priority::drain_order(),
            [Priority::High, Priority::Retry, Priority::Normal]
        );
    }

    #[test]
    fn job_state_serializes_screaming_snake() {
        let json = serde_json::to_string(&JobState::FailedTemp).expect("serialize");
        assert_eq!(json, "\"FAILED_TEMP\"");
    }
}
