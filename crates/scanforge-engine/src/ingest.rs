//! Project CSV ingestion.
//!
//! Parses an uploaded commit CSV, creates one PENDING scan job per unique
//! `(project, commit)` pair, derives the project statistics, and enqueues
//! the jobs in chunks.
//!
//! Required columns (header names verified before any row is read):
//! `gh_project_name`, `git_trigger_commit`, `git_branch` (the branch may
//! be empty). Additional columns are preserved but unused.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::job::{JobState, Priority, ScanJob, TransitionReason};
use crate::metrics::names;
use crate::project::{ProjectStats, ProjectStatus};
use crate::queue::{EnqueueOptions, JobEnvelope, WorkQueue};
use crate::store::{InsertOutcome, JobPatch, Store};
use scanforge_core::config::Settings;
use scanforge_core::ProjectId;

/// Required CSV columns.
const REQUIRED_COLUMNS: [&str; 3] = ["gh_project_name", "git_trigger_commit", "git_branch"];

/// One parsed commit row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRow {
    /// Repository slug the commit belongs to.
    pub repo_slug: String,
    /// Commit to analyze.
    pub commit_sha: String,
    /// Branch recorded in the CSV (may be empty).
    pub branch: String,
}

/// What one ingest run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Scan jobs created.
    pub created: u64,
    /// Rows whose `(project, commit)` already had a job.
    pub duplicates: u64,
    /// Jobs handed to the queue.
    pub enqueued: u64,
    /// Statistics derived from the CSV.
    pub stats: ProjectStats,
}

/// Parses and enqueues project CSVs.
pub struct Ingestor<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    settings: Arc<Settings>,
}

impl<S, Q> std::fmt::Debug for Ingestor<S, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor").finish()
    }
}

/// Decodes the CSV bytes: UTF-8 first, then the configured fallback.
///
/// Only the latin-1 family is supported as a fallback; anything else, or
/// bytes invalid under the fallback, is a permanent ingest error.
fn decode_csv(raw: &[u8], fallback_encoding: &str) -> Result<String> {
    match String::from_utf8(raw.to_vec()) {
        Ok(text) => Ok(text),
        Err(_) => match fallback_encoding.to_ascii_lowercase().as_str() {
            "latin-1" | "latin1" | "iso-8859-1" => {
                Ok(raw.iter().map(|&b| char::from(b)).collect())
            }
            other => Err(Error::Csv {
                message: format!(
                    "file is not valid UTF-8 and fallback encoding '{other}' is unsupported"
                ),
            }),
        },
    }
}

/// Parses the CSV text into commit rows, verifying the header.
pub fn parse_rows(text: &str) -> Result<Vec<CommitRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let mut indices = [0usize; 3];
    for (i, required) in REQUIRED_COLUMNS.iter().enumerate() {
        indices[i] = headers
            .iter()
            .position(|h| h == *required)
            .ok_or_else(|| Error::Csv {
                message: format!("required column '{required}' missing from header"),
            })?;
    }
    let [slug_idx, commit_idx, branch_idx] = indices;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let slug = record.get(slug_idx).unwrap_or("").trim();
        let commit = record.get(commit_idx).unwrap_or("").trim();
        if slug.is_empty() || commit.is_empty() {
            continue;
        }
        rows.push(CommitRow {
            repo_slug: slug.to_string(),
            commit_sha: commit.to_string(),
            branch: record.get(branch_idx).unwrap_or("").trim().to_string(),
        });
    }
    Ok(rows)
}

impl<S: Store, Q: WorkQueue> Ingestor<S, Q> {
    /// Creates an ingestor over the store and queue.
    #[must_use]
    pub fn new(store: Arc<S>, queue: Arc<Q>, settings: Arc<Settings>) -> Self {
        Self {
            store,
            queue,
            settings,
        }
    }

    /// Ingests the CSV of a previously created project: creates scan jobs,
    /// updates the project statistics, and enqueues the jobs in chunks.
    ///
    /// Re-ingesting the same CSV is idempotent: existing `(project,
    /// commit)` pairs are counted as duplicates and skipped.
    pub async fn ingest(&self, project_id: &ProjectId) -> Result<IngestSummary> {
        let mut project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or(Error::ProjectNotFound {
                project_id: *project_id,
            })?;

        let raw = tokio::fs::read(&project.csv_path).await.map_err(|e| {
            Error::storage_with_source(
                format!("failed to read {}", project.csv_path.display()),
                e,
            )
        })?;
        let text = decode_csv(&raw, &self.settings.ingest.csv_encoding)?;
        let rows = parse_rows(&text)?;

        let mut summary = IngestSummary::default();
        let mut seen_commits: BTreeSet<String> = BTreeSet::new();
        let mut branches: BTreeSet<String> = BTreeSet::new();
        let mut jobs = Vec::new();

        for row in &rows {
            summary.stats.build_count += 1;
            if !row.branch.is_empty() {
                branches.insert(row.branch.clone());
            }
            if !seen_commits.insert(row.commit_sha.clone()) {
                continue;
            }
            let job = ScanJob::new(*project_id, row.repo_slug.clone(), row.commit_sha.clone())
                .with_branch(row.branch.clone())
                .with_max_retries(self.settings.retry.max_retries);
            jobs.push(job);
        }
        summary.stats.commit_count = seen_commits.len() as u64;
        summary.stats.branch_count = branches.len() as u64;

        let mut created_jobs = Vec::new();
        for job in jobs {
            match self.store.insert_job(&job).await? {
                InsertOutcome::Inserted => {
                    summary.created += 1;
                    created_jobs.push(job);
                }
                InsertOutcome::Duplicate => summary.duplicates += 1,
            }
        }

        project.stats = summary.stats;
        project.status = ProjectStatus::Collecting;
        project.updated_at = chrono::Utc::now();
        self.store.update_project(&project).await?;

        for chunk in created_jobs.chunks(self.settings.ingest.chunk_size.max(1)) {
            for job in chunk {
                let cas = self
                    .store
                    .cas_job_state(
                        &job.id,
                        JobState::Pending,
                        0,
                        JobState::Queued,
                        TransitionReason::Enqueued,
                        JobPatch::new(),
                    )
                    .await?;
                if !cas.is_success() {
                    continue;
                }
                self.queue
                    .enqueue(
                        JobEnvelope::new(job.id, *project_id, Priority::Normal, 0),
                        EnqueueOptions::new(),
                    )
                    .await?;
                summary.enqueued += 1;
            }
        }

        metrics::counter!(names::INGESTED_COMMITS_TOTAL).increment(summary.created);
        tracing::info!(
            project_id = %project_id,
            created = summary.created,
            duplicates = summary.duplicates,
            enqueued = summary.enqueued,
            "project ingested"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;
    use crate::queue::memory::InMemoryWorkQueue;
    use crate::store::memory::InMemoryStore;
    use crate::store::Page;
    use tempfile::TempDir;

    const CSV: &str = "gh_project_name,git_trigger_commit,git_branch,tr_build_id\n\
                       acme/lib,c1,main,1\n\
                       acme/lib,c2,main,2\n\
                       acme/lib,c1,main,3\n\
                       acme/other,c3,,4\n";

    fn settings() -> Arc<Settings> {
        Arc::new(Settings {
            debug: true,
            ..Settings::default()
        })
    }

    async fn project_with_csv(store: &InMemoryStore, tmp: &TempDir, csv: &str) -> Project {
        let path = tmp.path().join("upload.csv");
        tokio::fs::write(&path, csv).await.unwrap();
        let project = Project::new("acme", &path);
        store.insert_project(&project).await.unwrap();
        project
    }

    #[tokio::test]
    async fn ingest_creates_one_job_per_unique_commit() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let project = project_with_csv(&store, &tmp, CSV).await;

        let summary = Ingestor::new(store.clone(), queue.clone(), settings())
            .ingest(&project.id)
            .await
            .expect("ingest succeeds");

        assert_eq!(summary.created, 3);
        assert_eq!(summary.enqueued, 3);
        assert_eq!(summary.stats.build_count, 4);
        assert_eq!(summary.stats.commit_count, 3);
        assert_eq!(summary.stats.branch_count, 1);
        assert_eq!(queue.depth().await.unwrap(), 3);

        let jobs = store
            .jobs_by_project(&project.id, Page::default())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.state == JobState::Queued));

        let stored = store.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProjectStatus::Collecting);
    }

    #[tokio::test]
    async fn reingesting_the_same_csv_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let project = project_with_csv(&store, &tmp, CSV).await;
        let ingestor = Ingestor::new(store.clone(), queue.clone(), settings());

        ingestor.ingest(&project.id).await.unwrap();
        let second = ingestor.ingest(&project.id).await.unwrap();

        assert_eq!(second.created, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(store.job_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn missing_required_column_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let project = project_with_csv(
            &store,
            &tmp,
            "gh_project_name,git_branch\nacme/lib,main\n",
        )
        .await;

        let err = Ingestor::new(store, queue, settings())
            .ingest(&project.id)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("git_trigger_commit"));
    }

    #[tokio::test]
    async fn latin1_fallback_decodes_non_utf8_bytes() {
        let text = decode_csv(b"gh_project_name\nacme/caf\xe9\n", "latin-1").unwrap();
        assert!(text.contains("café"));

        let err = decode_csv(b"\xff\xfe", "utf-8").unwrap_err();
        assert!(err.to_string().contains("fallback"));
    }

    #[test]
    fn rows_with_blank_slug_or_commit_are_skipped() {
        let rows = parse_rows(
            "gh_project_name,git_trigger_commit,git_branch\n,c1,main\nacme/lib,,main\nacme/lib,c2,dev\n",
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].commit_sha, "c2");
        assert_eq!(rows[0].branch, "dev");
    }
}
