//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a simple in-memory implementation
//! of the [`Store`] trait suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use scanforge_core::{ProjectId, ScanJobId, WebhookEventId};

use super::{CasResult, InsertOutcome, JobPatch, Page, ProjectProgress, Store};
use crate::error::{Error, Result};
use crate::job::{JobState, ScanJob, TransitionReason};
use crate::project::{Project, ProjectStatus};
use crate::record::{FailedCommit, FailedCommitDisposition, ScanResult, WebhookEvent};

#[derive(Debug, Default)]
struct Inner {
    projects: HashMap<ProjectId, Project>,
    jobs: HashMap<ScanJobId, ScanJob>,
    /// Unique index on `(project_id, commit_sha)`.
    jobs_by_commit: HashMap<(ProjectId, String), ScanJobId>,
    /// Unique index on `scan_job_id`.
    results: HashMap<ScanJobId, ScanResult>,
    failed: HashMap<ScanJobId, FailedCommit>,
    webhook_events: Vec<WebhookEvent>,
}

/// In-memory store for testing.
///
/// Provides a thread-safe implementation of the [`Store`] trait using
/// `RwLock` for synchronization.
///
/// ## Example
///
/// ```rust
/// use scanforge_engine::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

impl InMemoryStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of jobs currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn job_count(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.jobs.len())
    }
}

fn apply_patch(job: &mut ScanJob, patch: JobPatch) {
    if let Some(attempts) = patch.attempts {
        job.attempts = attempts;
    }
    if let Some(lease) = patch.lease {
        job.lease = lease;
    }
    if let Some(last_error) = patch.last_error {
        job.last_error = last_error;
    }
    if let Some(log_path) = patch.log_path {
        job.log_path = Some(log_path);
    }
    if let Some(instance_name) = patch.instance_name {
        job.instance_name = Some(instance_name);
    }
    if let Some(config_override) = patch.config_override {
        job.config_override = config_override;
    }
    if let Some(priority) = patch.priority {
        job.priority = priority;
    }
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items.into_iter().skip(page.offset).take(page.limit).collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_project(&self, project: &Project) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, project_id: &ProjectId) -> Result<Option<Project>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.projects.get(project_id).cloned())
    }

    async fn update_project(&self, project: &Project) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !inner.projects.contains_key(&project.id) {
            return Err(Error::ProjectNotFound {
                project_id: project.id,
            });
        }
        inner.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn list_projects(&self, page: Page) -> Result<Vec<Project>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut projects: Vec<Project> = inner.projects.values().cloned().collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(projects, page))
    }

    async fn apply_project_progress(
        &self,
        project_id: &ProjectId,
        progress: ProjectProgress,
    ) -> Result<Option<ProjectStatus>> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let project = inner
            .projects
            .get_mut(project_id)
            .ok_or(Error::ProjectNotFound {
                project_id: *project_id,
            })?;
        match progress {
            ProjectProgress::Succeeded => project.processed_commits += 1,
            ProjectProgress::FailedPermanent => project.failed_commits += 1,
            ProjectProgress::RetriedPermanent => {
                project.failed_commits = project.failed_commits.saturating_sub(1);
                if matches!(project.status, ProjectStatus::Done | ProjectStatus::Partial) {
                    project.status = ProjectStatus::Collecting;
                }
            }
        }
        project.updated_at = Utc::now();
        Ok(project.recompute_status())
    }

    async fn insert_job(&self, job: &ScanJob) -> Result<InsertOutcome> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let key = (job.project_id, job.commit_sha.clone());
        if inner.jobs_by_commit.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.jobs_by_commit.insert(key, job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_job(&self, job_id: &ScanJobId) -> Result<Option<ScanJob>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn cas_job_state(
        &self,
        job_id: &ScanJobId,
        expected_state: JobState,
        expected_attempts: u32,
        target_state: JobState,
        reason: TransitionReason,
        patch: JobPatch,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(CasResult::NotFound);
        };
        if job.state != expected_state || job.attempts != expected_attempts {
            return Ok(CasResult::Conflict {
                actual_state: job.state,
                actual_attempts: job.attempts,
            });
        }
        if !job.state.can_transition_to(target_state) {
            return Err(Error::InvalidStateTransition {
                from: job.state.to_string(),
                to: target_state.to_string(),
                reason: format!("not allowed by the job state graph ({reason})"),
            });
        }
        job.state = target_state;
        apply_patch(job, patch);
        job.last_transition_reason = Some(reason);
        job.updated_at = Utc::now();
        Ok(CasResult::Success)
    }

    async fn touch_job_lease(
        &self,
        job_id: &ScanJobId,
        token: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.state != JobState::Running {
            return Ok(false);
        }
        match job.lease.as_mut() {
            Some(lease) if lease.token == token => {
                lease.expires_at = expires_at;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_submission(
        &self,
        job_id: &ScanJobId,
        token: Uuid,
        analysis_id: &str,
        log_path: &std::path::Path,
    ) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.state != JobState::Running {
            return Ok(false);
        }
        match job.lease.as_mut() {
            Some(lease) if lease.token == token => {
                lease.analysis_id = Some(analysis_id.to_string());
                job.log_path = Some(log_path.to_path_buf());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn jobs_by_project(&self, project_id: &ProjectId, page: Page) -> Result<Vec<ScanJob>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut jobs: Vec<ScanJob> = inner
            .jobs
            .values()
            .filter(|j| j.project_id == *project_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(paginate(jobs, page))
    }

    async fn jobs_in_state(
        &self,
        state: JobState,
        updated_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ScanJob>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut jobs: Vec<ScanJob> = inner
            .jobs
            .values()
            .filter(|j| j.state == state)
            .filter(|j| updated_before.is_none_or(|cutoff| j.updated_at < cutoff))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn find_running_by_analysis_id(&self, analysis_id: &str) -> Result<Option<ScanJob>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .jobs
            .values()
            .find(|j| {
                j.state == JobState::Running && j.analysis_id() == Some(analysis_id)
            })
            .cloned())
    }

    async fn upsert_result(&self, result: &ScanResult) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.results.insert(result.scan_job_id, result.clone());
        Ok(())
    }

    async fn get_result_for_job(&self, job_id: &ScanJobId) -> Result<Option<ScanResult>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.results.get(job_id).cloned())
    }

    async fn results_by_project(
        &self,
        project_id: &ProjectId,
        page: Page,
    ) -> Result<Vec<ScanResult>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut results: Vec<ScanResult> = inner
            .results
            .values()
            .filter(|r| r.project_id == *project_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.fetched_at.cmp(&b.fetched_at));
        Ok(paginate(results, page))
    }

    async fn upsert_failed_commit(&self, failed: &FailedCommit) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.failed.insert(failed.scan_job_id, failed.clone());
        Ok(())
    }

    async fn get_failed_commit(&self, job_id: &ScanJobId) -> Result<Option<FailedCommit>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.failed.get(job_id).cloned())
    }

    async fn set_failed_commit_disposition(
        &self,
        job_id: &ScanJobId,
        disposition: FailedCommitDisposition,
        retry_config_override: Option<String>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(failed) = inner.failed.get_mut(job_id) else {
            return Ok(false);
        };
        failed.disposition = disposition;
        if retry_config_override.is_some() {
            failed.retry_config_override = retry_config_override;
        }
        Ok(true)
    }

    async fn list_failed_commits(
        &self,
        disposition: Option<FailedCommitDisposition>,
        page: Page,
    ) -> Result<Vec<FailedCommit>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut failed: Vec<FailedCommit> = inner
            .failed
            .values()
            .filter(|f| disposition.is_none_or(|d| f.disposition == d))
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(paginate(failed, page))
    }

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.webhook_events.push(event.clone());
        Ok(())
    }

    async fn correlate_webhook_event(
        &self,
        event_id: &WebhookEventId,
        job_id: &ScanJobId,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if let Some(event) = inner.webhook_events.iter_mut().find(|e| e.id == *event_id) {
            event.scan_job_id = Some(*job_id);
        }
        Ok(())
    }

    async fn orphan_webhook_events(&self, since: DateTime<Utc>) -> Result<Vec<WebhookEvent>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .webhook_events
            .iter()
            .filter(|e| e.is_orphan() && e.received_at >= since)
            .cloned()
            .collect())
    }
}
