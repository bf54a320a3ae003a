//! Observability metrics for the scan pipeline.
//!
//! This module provides Prometheus-compatible metric names for monitoring
//! the orchestration engine. Metrics are designed to support:
//!
//! - **Alerting**: SLO-based alerts on scan latency and failure rates
//! - **Dashboards**: Real-time visibility into dispatcher and queue health
//! - **Debugging**: Correlating metrics with traces for root cause analysis
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `scanforge_jobs_total` | Counter | `from_state`, `to_state` | Job state transitions |
//! | `scanforge_scan_duration_seconds` | Histogram | `instance`, `outcome` | Scanner wall time |
//! | `scanforge_queue_depth` | Gauge | `queue` | Visible messages per priority |
//! | `scanforge_lease_acquisitions_total` | Counter | `instance`, `result` | Slot acquisition outcomes |
//! | `scanforge_webhooks_total` | Counter | `result` | Webhook intake outcomes |
//! | `scanforge_reconcile_rescues_total` | Counter | `reason` | Jobs rescued per sweep |
//! | `scanforge_metrics_fetches_total` | Counter | `result` | Measures fetch outcomes |
//!
//! ## Integration
//!
//! Metrics are exposed via the `metrics` crate facade. The API binary
//! installs a `metrics_exporter_prometheus` recorder.

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Job state transitions.
    pub const JOBS_TOTAL: &str = "scanforge_jobs_total";
    /// Histogram: Scanner subprocess wall time in seconds.
    pub const SCAN_DURATION_SECONDS: &str = "scanforge_scan_duration_seconds";
    /// Gauge: Visible messages per priority queue.
    pub const QUEUE_DEPTH: &str = "scanforge_queue_depth";
    /// Counter: Slot acquisition outcomes.
    pub const LEASE_ACQUISITIONS_TOTAL: &str = "scanforge_lease_acquisitions_total";
    /// Counter: Lease heartbeat outcomes.
    pub const LEASE_HEARTBEATS_TOTAL: &str = "scanforge_lease_heartbeats_total";
    /// Counter: Webhook intake outcomes.
    pub const WEBHOOKS_TOTAL: &str = "scanforge_webhooks_total";
    /// Counter: Jobs rescued by the reconciler.
    pub const RECONCILE_RESCUES_TOTAL: &str = "scanforge_reconcile_rescues_total";
    /// Histogram: Reconciler sweep duration in seconds.
    pub const RECONCILE_SWEEP_SECONDS: &str = "scanforge_reconcile_sweep_seconds";
    /// Counter: Measures fetch outcomes.
    pub const METRICS_FETCHES_TOTAL: &str = "scanforge_metrics_fetches_total";
    /// Counter: Commits ingested from project CSVs.
    pub const INGESTED_COMMITS_TOTAL: &str = "scanforge_ingested_commits_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous job state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target job state (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Analysis instance name.
    pub const INSTANCE: &str = "instance";
    /// Priority queue name.
    pub const QUEUE: &str = "queue";
    /// Operation result (success, failure, orphan, no_slot, ...).
    pub const RESULT: &str = "result";
    /// Scan outcome (succeeded, failed, timeout, skipped).
    pub const OUTCOME: &str = "outcome";
    /// Rescue reason (lease_expired, stale_queued, backfill).
    pub const REASON: &str = "reason";
}
