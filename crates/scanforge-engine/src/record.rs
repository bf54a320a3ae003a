//! Persisted records surrounding a scan job.
//!
//! - `ScanResult`: metrics harvested for one successful scan
//! - `FailedCommit`: durable operator-facing record of a permanent failure
//! - `WebhookEvent`: every accepted completion notification, orphans included

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scanforge_core::{ProjectId, ScanJobId, ScanResultId, WebhookEventId};

/// A single measured value, numeric when the server reports a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Numeric measurement, e.g. `ncloc` or `coverage`.
    Number(f64),
    /// Textual measurement, e.g. `alert_status`.
    Text(String),
}

impl MetricValue {
    /// Parses a raw measure value, preferring the numeric form.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        raw.parse::<f64>()
            .map_or_else(|_| Self::Text(raw.to_string()), Self::Number)
    }

    /// Renders the value for tabular export.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Self::Text(s) => s.clone(),
        }
    }
}

/// Metrics harvested for one successful scan.
///
/// Exactly one result exists per succeeded job; the store upserts by
/// `scan_job_id` so duplicate webhook deliveries stay idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    /// Unique identifier.
    pub id: ScanResultId,
    /// Job this result belongs to (unique).
    pub scan_job_id: ScanJobId,
    /// Owning project, denormalized for export queries.
    pub project_id: ProjectId,
    /// Component key the server reported.
    pub component_key: String,
    /// Analysis identifier echoed by the completion webhook.
    pub analysis_id: String,
    /// Metric name → measured value.
    pub metrics: BTreeMap<String, MetricValue>,
    /// When the metrics were fetched.
    pub fetched_at: DateTime<Utc>,
}

impl ScanResult {
    /// Creates a new result for a job.
    #[must_use]
    pub fn new(
        scan_job_id: ScanJobId,
        project_id: ProjectId,
        component_key: impl Into<String>,
        analysis_id: impl Into<String>,
        metrics: BTreeMap<String, MetricValue>,
    ) -> Self {
        Self {
            id: ScanResultId::generate(),
            scan_job_id,
            project_id,
            component_key: component_key.into(),
            analysis_id: analysis_id.into(),
            metrics,
            fetched_at: Utc::now(),
        }
    }
}

/// Disposition of a failed commit in the operator triage flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailedCommitDisposition {
    /// Awaiting operator attention.
    Pending,
    /// Operator retried; the job is back on the queue.
    Queued,
    /// The retry succeeded.
    Resolved,
}

impl Default for FailedCommitDisposition {
    fn default() -> Self {
        Self::Pending
    }
}

/// Durable record of a permanently failed job, suitable for triage.
///
/// Written in the same logical transaction as the FAILED_PERMANENT
/// transition; the reconciler backfills any record a crash skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedCommit {
    /// Job that failed (unique).
    pub scan_job_id: ScanJobId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Repository slug, copied for standalone triage.
    pub repo_slug: String,
    /// Commit that failed.
    pub commit_sha: String,
    /// The classified last error.
    pub error: String,
    /// Pointer to the scanner log, when a scan ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Triage disposition.
    pub disposition: FailedCommitDisposition,
    /// Configuration override supplied at operator retry time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_config_override: Option<String>,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Completion status carried by a webhook payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    /// Analysis completed and passed.
    Success,
    /// Analysis completed and failed.
    Failed,
    /// Anything else the server may send.
    Other,
}

impl WebhookStatus {
    /// Normalizes the raw status string from the payload.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "SUCCESS" | "OK" => Self::Success,
            "FAILED" | "ERROR" => Self::Failed,
            _ => Self::Other,
        }
    }
}

/// A persisted completion notification.
///
/// Every verified webhook is stored before correlation, so notifications
/// that match no in-flight job (orphans) remain observable and can be
/// re-correlated by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    /// Unique identifier.
    pub id: WebhookEventId,
    /// Analysis identifier from the payload.
    pub analysis_id: String,
    /// Component key from the payload.
    pub component_key: String,
    /// Normalized completion status.
    pub status: WebhookStatus,
    /// Job the event correlated to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_job_id: Option<ScanJobId>,
    /// Raw JSON payload for debugging.
    pub payload: String,
    /// When the event was received.
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Returns true if the event never matched an in-flight job.
    #[must_use]
    pub const fn is_orphan(&self) -> bool {
        self.scan_job_id.is_none()
    }
}
