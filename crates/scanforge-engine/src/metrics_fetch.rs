//! Metric harvest from the analysis server's read API.
//!
//! After the completion webhook correlates, the measures for the analyzed
//! component are pulled in chunks of at most the configured number of
//! keys, merged, and persisted as the job's [`ScanResult`]; the job then
//! transitions to SUCCEEDED and its lease is released.
//!
//! ## Retry classes
//!
//! - 5xx and transport timeouts retry with backoff up to the configured
//!   maximum, then surface as transient
//! - 404 (component not yet indexed) retries until a deadline
//! - any other 4xx is permanent

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use scanforge_core::config::{InstanceSettings, MetricsSettings, Settings};

use crate::job::{JobState, ScanFailure, ScanJob, TransitionReason};
use crate::lock::{SlotLease, SlotLockManager};
use crate::metrics::{labels, names};
use crate::project::Project;
use crate::record::{FailedCommitDisposition, MetricValue, ScanResult};
use crate::store::{CasResult, JobPatch, ProjectProgress, Store};

/// Base backoff between fetch retries.
const FETCH_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Maximum backoff between fetch retries.
const FETCH_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct MeasuresResponse {
    #[serde(default)]
    component: Option<MeasuresComponent>,
}

#[derive(Debug, Deserialize)]
struct MeasuresComponent {
    #[serde(default)]
    measures: Vec<Measure>,
}

#[derive(Debug, Deserialize)]
struct Measure {
    metric: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectSearchResponse {
    #[serde(default)]
    components: Vec<ProjectSearchComponent>,
}

#[derive(Debug, Deserialize)]
struct ProjectSearchComponent {
    key: String,
}

/// HTTP client for the analysis server's read API.
#[derive(Debug, Clone)]
pub struct MetricsClient {
    http: reqwest::Client,
    settings: MetricsSettings,
}

impl MetricsClient {
    /// Creates a client with the configured per-request timeout.
    #[must_use]
    pub fn new(settings: MetricsSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout())
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "failed to configure http client; using defaults");
                reqwest::Client::new()
            });
        Self { http, settings }
    }

    /// Returns true if the component already exists on the instance.
    ///
    /// Lookup failures count as absent so a scan proceeds rather than
    /// being skipped on flaky reads.
    pub async fn component_exists(
        &self,
        instance: &InstanceSettings,
        component_key: &str,
    ) -> bool {
        let Ok(token) = instance.resolved_token() else {
            return false;
        };
        let url = format!(
            "{}/api/projects/search",
            instance.host.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .basic_auth(token, Some(""))
            .query(&[("projects", component_key)])
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => resp
                .json::<ProjectSearchResponse>()
                .await
                .map(|body| body.components.iter().any(|c| c.key == component_key))
                .unwrap_or(false),
            Ok(resp) => {
                tracing::warn!(
                    component_key,
                    status = %resp.status(),
                    "component lookup failed"
                );
                false
            }
            Err(err) => {
                tracing::warn!(component_key, error = %err, "component lookup failed");
                false
            }
        }
    }

    /// Fetches the configured metric keys for a component, chunked to the
    /// server-side limit and merged into one map.
    pub async fn fetch_measures(
        &self,
        instance: &InstanceSettings,
        component_key: &str,
    ) -> Result<BTreeMap<String, MetricValue>, ScanFailure> {
        let token = instance
            .resolved_token()
            .map_err(|e| ScanFailure::permanent("config-malformed").with_detail(e.to_string()))?;
        let mut merged = BTreeMap::new();
        for chunk in self.settings.keys.chunks(self.settings.chunk_size.max(1)) {
            let measures = self
                .fetch_chunk(instance, token, component_key, chunk)
                .await?;
            merged.extend(measures);
        }
        Ok(merged)
    }

    async fn fetch_chunk(
        &self,
        instance: &InstanceSettings,
        token: &str,
        component_key: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, MetricValue>, ScanFailure> {
        let url = format!(
            "{}/api/measures/component",
            instance.host.trim_end_matches('/')
        );
        let metric_keys = keys.join(",");
        let deadline = tokio::time::Instant::now() + self.settings.not_found_deadline();
        let mut backoff = FETCH_BACKOFF_BASE;
        let mut server_errors = 0_u32;

        loop {
            let response = self
                .http
                .get(&url)
                .basic_auth(token, Some(""))
                .query(&[
                    ("component", component_key),
                    ("metricKeys", metric_keys.as_str()),
                ])
                .send()
                .await;

            let retryable = match response {
                Ok(resp) if resp.status().is_success() => {
                    let body: MeasuresResponse = resp.json().await.map_err(|e| {
                        ScanFailure::transient("metrics-parse").with_detail(e.to_string())
                    })?;
                    let measures = body
                        .component
                        .map(|c| c.measures)
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|m| {
                            m.value
                                .map(|value| (m.metric, MetricValue::parse(&value)))
                        })
                        .collect();
                    return Ok(measures);
                }
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                    // Component not yet indexed; retryable until the deadline.
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ScanFailure::transient("metrics-not-indexed").with_detail(
                            format!("component {component_key} not indexed before deadline"),
                        ));
                    }
                    true
                }
                Ok(resp) if resp.status().is_server_error() => {
                    server_errors += 1;
                    if server_errors > self.settings.retry_max {
                        return Err(ScanFailure::transient("metrics-5xx")
                            .with_detail(format!("status {}", resp.status())));
                    }
                    true
                }
                Ok(resp) => {
                    return Err(ScanFailure::permanent("metrics-4xx")
                        .with_detail(format!("status {}", resp.status())));
                }
                Err(err) => {
                    server_errors += 1;
                    if server_errors > self.settings.retry_max {
                        return Err(ScanFailure::transient("metrics-unreachable")
                            .with_detail(err.to_string()));
                    }
                    true
                }
            };

            if retryable {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(FETCH_BACKOFF_MAX);
            }
        }
    }
}

/// Finalizes successful scans: harvest, persist, transition, release.
pub struct MetricsFetcher<S, L> {
    store: Arc<S>,
    locks: Arc<L>,
    client: MetricsClient,
    settings: Arc<Settings>,
}

impl<S, L> std::fmt::Debug for MetricsFetcher<S, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsFetcher")
            .field("client", &self.client)
            .finish()
    }
}

impl<S: Store, L: SlotLockManager> MetricsFetcher<S, L> {
    /// Creates a fetcher over the store and lock manager.
    #[must_use]
    pub fn new(store: Arc<S>, locks: Arc<L>, settings: Arc<Settings>) -> Self {
        Self {
            store,
            locks,
            client: MetricsClient::new(settings.metrics.clone()),
            settings,
        }
    }

    /// The underlying read-API client.
    #[must_use]
    pub const fn client(&self) -> &MetricsClient {
        &self.client
    }

    /// Harvests measures for a job whose analysis passed, persists the
    /// result, transitions RUNNING → SUCCEEDED, and releases the lease.
    ///
    /// Idempotent under duplicate completion: the result upsert is keyed
    /// by job id and the transition is state-conditional.
    pub async fn finalize(
        &self,
        job: &ScanJob,
        project: &Project,
        lease: &SlotLease,
        analysis_id: &str,
    ) -> Result<(), ScanFailure> {
        let instance = self
            .settings
            .instance(&lease.instance_name)
            .ok_or_else(|| {
                ScanFailure::permanent("config-malformed")
                    .with_detail(format!("instance '{}' not configured", lease.instance_name))
            })?;
        let component_key = job.component_key(project.project_key());
        let measures = self
            .client
            .fetch_measures(instance, &component_key)
            .await
            .inspect_err(|_| {
                metrics::counter!(names::METRICS_FETCHES_TOTAL, labels::RESULT => "failure")
                    .increment(1);
            })?;

        let result = ScanResult::new(
            job.id,
            job.project_id,
            component_key,
            analysis_id,
            measures,
        );
        self.store
            .upsert_result(&result)
            .await
            .map_err(|e| ScanFailure::transient("store-write").with_detail(e.to_string()))?;

        let cas = self
            .store
            .cas_job_state(
                &job.id,
                JobState::Running,
                job.attempts,
                JobState::Succeeded,
                TransitionReason::MetricsStored,
                JobPatch::new().clear_lease().clear_error(),
            )
            .await
            .map_err(|e| ScanFailure::transient("store-write").with_detail(e.to_string()))?;

        match cas {
            CasResult::Success => {}
            // A duplicate completion already finalized the job; nothing
            // left to do and the lease is already gone.
            CasResult::Conflict {
                actual_state: JobState::Succeeded,
                ..
            } => return Ok(()),
            other => {
                return Err(ScanFailure::transient("store-conflict")
                    .with_detail(format!("finalize lost the race: {other:?}")));
            }
        }

        let _ = self.locks.release(lease).await;
        self.store
            .apply_project_progress(&job.project_id, ProjectProgress::Succeeded)
            .await
            .map_err(|e| ScanFailure::transient("store-write").with_detail(e.to_string()))?;

        // An operator-retried job resolves its triage record on success.
        let _ = self
            .store
            .set_failed_commit_disposition(&job.id, FailedCommitDisposition::Resolved, None)
            .await;

        metrics::counter!(names::METRICS_FETCHES_TOTAL, labels::RESULT => "success").increment(1);
        tracing::info!(job_id = %job.id, "scan result stored and job finalized");
        Ok(())
    }
}
