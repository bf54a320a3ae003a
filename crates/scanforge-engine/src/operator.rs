//! Operator actions on permanently failed jobs.
//!
//! A FAILED_PERMANENT job leaves the normal flow; the single way back is
//! an explicit operator retry, optionally with a fresh per-job
//! configuration override. The retry resets the attempt budget, moves the
//! job back onto the high-priority queue, and reopens the project's
//! aggregate.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::job::{JobState, Priority, TransitionReason};
use crate::queue::{EnqueueOptions, JobEnvelope, WorkQueue};
use crate::record::FailedCommitDisposition;
use crate::store::{JobPatch, ProjectProgress, Store};
use scanforge_core::ScanJobId;

/// Outcome of an operator retry request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The job is back on the queue with a reset budget.
    Requeued,
    /// The job is not FAILED_PERMANENT; nothing changed.
    NotRetryable,
}

/// Re-queues a permanently failed job.
///
/// The attempts counter resets to 0, the optional configuration override
/// replaces the job's, the FailedCommit disposition moves to QUEUED, and
/// the project aggregate reopens.
///
/// # Errors
///
/// Returns [`Error::JobNotFound`] when the job does not exist; store and
/// queue failures propagate.
pub async fn retry_failed_job<S: Store, Q: WorkQueue>(
    store: &Arc<S>,
    queue: &Arc<Q>,
    job_id: &ScanJobId,
    config_override: Option<String>,
) -> Result<RetryOutcome> {
    let job = store
        .get_job(job_id)
        .await?
        .ok_or(Error::JobNotFound { job_id: *job_id })?;
    if job.state != JobState::FailedPermanent {
        return Ok(RetryOutcome::NotRetryable);
    }

    let mut patch = JobPatch::new()
        .with_attempts(0)
        .with_priority(Priority::High)
        .clear_error();
    if let Some(config) = config_override.clone() {
        patch = patch.with_config_override(config);
    }

    let cas = store
        .cas_job_state(
            &job.id,
            JobState::FailedPermanent,
            job.attempts,
            JobState::Queued,
            TransitionReason::OperatorRetry,
            patch,
        )
        .await?;
    if !cas.is_success() {
        return Ok(RetryOutcome::NotRetryable);
    }

    store
        .set_failed_commit_disposition(
            &job.id,
            FailedCommitDisposition::Queued,
            config_override,
        )
        .await?;
    store
        .apply_project_progress(&job.project_id, ProjectProgress::RetriedPermanent)
        .await?;
    queue
        .enqueue(
            JobEnvelope::new(job.id, job.project_id, Priority::High, 0),
            EnqueueOptions::new(),
        )
        .await?;

    tracing::info!(job_id = %job.id, "operator retry queued");
    Ok(RetryOutcome::Requeued)
}
