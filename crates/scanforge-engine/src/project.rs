//! Project tracking.
//!
//! A project represents one uploaded commit CSV, capturing:
//!
//! - **Source**: Where the CSV artifact lives
//! - **Statistics**: Commit, build, and branch counts derived at ingest
//! - **Progress**: How many jobs reached a terminal state
//! - **Status**: CREATED → COLLECTING → DONE | PARTIAL

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use scanforge_core::ProjectId;

/// Aggregate status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    /// CSV accepted, ingestion not yet run.
    Created,

    /// Scan jobs created; analyses in flight.
    Collecting,

    /// Every commit succeeded.
    Done,

    /// All commits terminal, at least one permanently failed.
    Partial,
}

impl ProjectStatus {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Collecting => "collecting",
            Self::Done => "done",
            Self::Partial => "partial",
        }
    }
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Created
    }
}

/// Statistics derived from the CSV at ingest time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStats {
    /// Total rows (builds) in the CSV.
    pub build_count: u64,
    /// Distinct commits, which is also the number of scan jobs.
    pub commit_count: u64,
    /// Distinct non-empty branch names.
    pub branch_count: u64,
}

/// One uploaded commit CSV and its analysis progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Unique identifier.
    pub id: ProjectId,

    /// Display name, used as the analysis project key prefix.
    pub name: String,

    /// Location of the source CSV artifact.
    pub csv_path: PathBuf,

    /// Clone URL override; without it each job's repository slug derives
    /// its GitHub remote.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,

    /// Project-level analysis configuration override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_override: Option<String>,

    /// Statistics derived at ingest.
    pub stats: ProjectStats,

    /// Jobs that reached SUCCEEDED.
    pub processed_commits: u64,

    /// Jobs that reached FAILED_PERMANENT.
    pub failed_commits: u64,

    /// Aggregate status.
    pub status: ProjectStatus,

    /// When the project was created.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Creates a new project in CREATED state.
    #[must_use]
    pub fn new(name: impl Into<String>, csv_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::generate(),
            name: name.into(),
            csv_path: csv_path.into(),
            repo_url: None,
            config_override: None,
            stats: ProjectStats::default(),
            processed_commits: 0,
            failed_commits: 0,
            status: ProjectStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the project-level configuration override.
    #[must_use]
    pub fn with_config_override(mut self, config: impl Into<String>) -> Self {
        self.config_override = Some(config.into());
        self
    }

    /// Sets the clone URL override.
    #[must_use]
    pub fn with_repo_url(mut self, url: impl Into<String>) -> Self {
        self.repo_url = Some(url.into());
        self
    }

    /// The key under which this project's analyses are addressed on the
    /// server; commits append `_{sha}` to it.
    #[must_use]
    pub fn project_key(&self) -> &str {
        &self.name
    }

    /// Recomputes the aggregate status from terminal counters.
    ///
    /// Returns the new status when it changed, `None` otherwise. Flips to
    /// DONE when every commit succeeded and PARTIAL when all commits are
    /// terminal but some failed permanently.
    pub fn recompute_status(&mut self) -> Option<ProjectStatus> {
        if self.stats.commit_count == 0 || self.status != ProjectStatus::Collecting {
            return None;
        }
        let terminal = self.processed_commits + self.failed_commits;
        if terminal < self.stats.commit_count {
            return None;
        }
        let next = if self.failed_commits == 0 {
            ProjectStatus::Done
        } else {
            ProjectStatus::Partial
        };
        self.status = next;
        self.updated_at = Utc::now();
        Some(next)
    }
}
