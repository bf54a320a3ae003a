//! Configuration loader for the scanforge services.
//!
//! Settings are deserialized from a JSON document named by the
//! `SCANFORGE_CONFIG` environment variable (default `scanforge.json`).
//! Secrets may be supplied through the environment instead of the file:
//! `SCANFORGE_WEBHOOK_SECRET` overrides the webhook secret and
//! `SCANFORGE_TOKEN_<NAME>` overrides the token of the instance `<NAME>`
//! (uppercased, `-` mapped to `_`).
//!
//! Validation happens at load time: a service with no instances, a zero
//! concurrency cap, or a missing webhook secret refuses to start rather
//! than failing mid-pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "SCANFORGE_CONFIG";

/// Default configuration file name.
pub const DEFAULT_CONFIG_PATH: &str = "scanforge.json";

/// One analysis server available to the pipeline.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSettings {
    /// Unique instance name, used for lease bookkeeping and round-robin order.
    pub name: String,
    /// Base URL of the analysis server.
    pub host: String,
    /// Access token; may instead come from `SCANFORGE_TOKEN_<NAME>`.
    #[serde(default)]
    pub token: Option<String>,
    /// Maximum concurrent analyses this instance accepts.
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: u32,
    /// Path to the scanner CLI used for this instance.
    #[serde(default = "default_scanner_path")]
    pub scanner_path: PathBuf,
}

impl std::fmt::Debug for InstanceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSettings")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("concurrency_cap", &self.concurrency_cap)
            .field("scanner_path", &self.scanner_path)
            .finish()
    }
}

impl InstanceSettings {
    /// Returns the configured token.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no token is configured for the
    /// instance, either inline or through the environment.
    pub fn resolved_token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::config(format!("token missing for instance '{}'", self.name))
            })
    }
}

/// Lease and scheduling timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseSettings {
    /// Lease TTL in seconds; workers heartbeat at most every `ttl / 3`.
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,
    /// Reconciler sweep cadence in seconds.
    #[serde(default = "default_reconciler_interval_seconds")]
    pub reconciler_interval_seconds: u64,
    /// How long a dispatcher waits for the completion webhook.
    #[serde(default = "default_webhook_wait_seconds")]
    pub wait_for_webhook_timeout_seconds: u64,
    /// Upper bound on the scanner subprocess runtime.
    #[serde(default = "default_scan_timeout_seconds")]
    pub scan_timeout_seconds: u64,
    /// QUEUED jobs untouched for longer than this are re-enqueued.
    #[serde(default = "default_stale_queue_seconds")]
    pub stale_queue_threshold_seconds: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: default_lease_ttl_seconds(),
            reconciler_interval_seconds: default_reconciler_interval_seconds(),
            wait_for_webhook_timeout_seconds: default_webhook_wait_seconds(),
            scan_timeout_seconds: default_scan_timeout_seconds(),
            stale_queue_threshold_seconds: default_stale_queue_seconds(),
        }
    }
}

impl LeaseSettings {
    /// Lease TTL as a [`Duration`].
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    /// Heartbeat cadence: a third of the lease TTL.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds / 3)
    }

    /// Reconciler cadence as a [`Duration`].
    #[must_use]
    pub const fn reconciler_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler_interval_seconds)
    }

    /// Webhook wait bound as a [`Duration`].
    #[must_use]
    pub const fn webhook_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_for_webhook_timeout_seconds)
    }

    /// Scanner subprocess bound as a [`Duration`].
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_seconds)
    }

    /// Stale-queue threshold as a [`Duration`].
    #[must_use]
    pub const fn stale_queue_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_queue_threshold_seconds)
    }
}

/// Retry policy for temporarily failed scan jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    /// Maximum retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Exponential backoff base in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Exponential backoff cap in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,
    /// Fraction of the delay added or removed as jitter (0.0..=1.0).
    #[serde(default = "default_jitter_ratio")]
    pub retry_jitter_ratio: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_base_ms: default_backoff_base_ms(),
            retry_backoff_cap_ms: default_backoff_cap_ms(),
            retry_jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Metric harvest settings for the analysis server read API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSettings {
    /// Metric keys to fetch for every successful scan.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Maximum metric keys per measures request (server-side limit).
    #[serde(default = "default_metrics_chunk_size")]
    pub chunk_size: usize,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_metrics_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Maximum retries for retryable responses.
    #[serde(default = "default_metrics_retry_max")]
    pub retry_max: u32,
    /// How long 404 (component not yet indexed) stays retryable, in seconds.
    #[serde(default = "default_metrics_not_found_deadline")]
    pub not_found_deadline_seconds: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            chunk_size: default_metrics_chunk_size(),
            http_timeout_ms: default_metrics_timeout_ms(),
            retry_max: default_metrics_retry_max(),
            not_found_deadline_seconds: default_metrics_not_found_deadline(),
        }
    }
}

impl MetricsSettings {
    /// Per-request timeout as a [`Duration`].
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// 404 retry deadline as a [`Duration`].
    #[must_use]
    pub const fn not_found_deadline(&self) -> Duration {
        Duration::from_secs(self.not_found_deadline_seconds)
    }
}

/// CSV ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSettings {
    /// Fallback encoding when the CSV is not valid UTF-8.
    #[serde(default = "default_csv_encoding")]
    pub csv_encoding: String,
    /// Number of scan jobs enqueued per batch.
    #[serde(default = "default_ingestion_chunk_size")]
    pub chunk_size: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            csv_encoding: default_csv_encoding(),
            chunk_size: default_ingestion_chunk_size(),
        }
    }
}

/// Webhook intake settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookSettings {
    /// Shared secret for signature verification.
    #[serde(default)]
    pub secret: String,
    /// Header names that may carry the hex HMAC-SHA256 signature.
    #[serde(default = "default_signature_headers")]
    pub signature_headers: Vec<String>,
    /// Header name that may carry the shared secret directly.
    #[serde(default = "default_secret_header")]
    pub secret_header: String,
}

impl std::fmt::Debug for WebhookSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSettings")
            .field("secret", &"[REDACTED]")
            .field("signature_headers", &self.signature_headers)
            .field("secret_header", &self.secret_header)
            .finish()
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            signature_headers: default_signature_headers(),
            secret_header: default_secret_header(),
        }
    }
}

/// Filesystem locations used by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsSettings {
    /// Root directory for repository clones and worktrees.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Directory for per-commit scanner logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Directory for tabular metric exports.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    /// Byte budget for cached bare clones; unset disables eviction.
    #[serde(default)]
    pub repo_cache_max_bytes: Option<u64>,
}

impl Default for PathsSettings {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            log_dir: default_log_dir(),
            export_dir: default_export_dir(),
            repo_cache_max_bytes: None,
        }
    }
}

/// Root settings tree for scanforge services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Available analysis servers.
    #[serde(default)]
    pub instances: Vec<InstanceSettings>,
    /// Lease and scheduling timeouts.
    #[serde(default)]
    pub lease: LeaseSettings,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Metric harvest settings.
    #[serde(default)]
    pub metrics: MetricsSettings,
    /// Ingestion settings.
    #[serde(default)]
    pub ingest: IngestSettings,
    /// Webhook intake settings.
    #[serde(default)]
    pub webhook: WebhookSettings,
    /// Filesystem locations.
    #[serde(default)]
    pub paths: PathsSettings,
    /// Base URL the fork fallback derives remotes from; mirrors can point
    /// this elsewhere.
    #[serde(default = "default_fork_remote_base")]
    pub fork_remote_base: String,
    /// Development mode: relaxes secret validation and pretty-prints logs.
    #[serde(default)]
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            lease: LeaseSettings::default(),
            retry: RetrySettings::default(),
            metrics: MetricsSettings::default(),
            ingest: IngestSettings::default(),
            webhook: WebhookSettings::default(),
            paths: PathsSettings::default(),
            fork_remote_base: default_fork_remote_base(),
            debug: false,
        }
    }
}

impl Settings {
    /// Loads settings from the path named by [`CONFIG_ENV`], applying
    /// environment overrides for secrets.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the file cannot be read or parsed,
    /// or when validation fails.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
        Self::from_path(&path)
    }

    /// Loads settings from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the file cannot be read or parsed,
    /// or when validation fails.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config_with_source(format!("failed to read {}", path.display()), e)
        })?;
        Self::from_json(&raw)
    }

    /// Parses settings from a JSON document and validates them.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the document does not parse or
    /// validation fails.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut settings: Self = serde_json::from_str(raw)
            .map_err(|e| Error::config_with_source("failed to parse configuration", e))?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Applies `SCANFORGE_WEBHOOK_SECRET` and `SCANFORGE_TOKEN_<NAME>`
    /// overrides from the environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("SCANFORGE_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                self.webhook.secret = secret;
            }
        }
        for instance in &mut self.instances {
            let var = format!(
                "SCANFORGE_TOKEN_{}",
                instance.name.to_uppercase().replace('-', "_")
            );
            if let Ok(token) = std::env::var(&var) {
                if !token.is_empty() {
                    instance.token = Some(token);
                }
            }
        }
    }

    /// Validates invariants that must hold before the pipeline starts.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(Error::config("at least one analysis instance is required"));
        }
        for instance in &self.instances {
            if instance.name.is_empty() {
                return Err(Error::config("instance name must not be empty"));
            }
            if instance.concurrency_cap == 0 {
                return Err(Error::config(format!(
                    "instance '{}' has a zero concurrency cap",
                    instance.name
                )));
            }
        }
        let mut names: Vec<&str> = self.instances.iter().map(|i| i.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.instances.len() {
            return Err(Error::config("instance names must be unique"));
        }
        if self.lease.lease_ttl_seconds < 3 {
            return Err(Error::config("lease_ttl_seconds must be at least 3"));
        }
        if !self.debug && self.webhook.secret.is_empty() {
            return Err(Error::config(
                "webhook secret is required when debug is disabled",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.retry_jitter_ratio) {
            return Err(Error::config("retry_jitter_ratio must be within 0.0..=1.0"));
        }
        if self.metrics.chunk_size == 0 {
            return Err(Error::config("metrics chunk_size must be positive"));
        }
        Ok(())
    }

    /// Looks up an instance by name.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<&InstanceSettings> {
        self.instances.iter().find(|i| i.name == name)
    }
}

fn default_concurrency_cap() -> u32 {
    1
}

fn default_scanner_path() -> PathBuf {
    PathBuf::from("sonar-scanner")
}

fn default_lease_ttl_seconds() -> u64 {
    300
}

fn default_reconciler_interval_seconds() -> u64 {
    600
}

fn default_webhook_wait_seconds() -> u64 {
    1800
}

fn default_scan_timeout_seconds() -> u64 {
    3600
}

fn default_stale_queue_seconds() -> u64 {
    1800
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    60_000
}

fn default_backoff_cap_ms() -> u64 {
    600_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_metrics_chunk_size() -> usize {
    25
}

fn default_metrics_timeout_ms() -> u64 {
    30_000
}

fn default_metrics_retry_max() -> u32 {
    3
}

fn default_metrics_not_found_deadline() -> u64 {
    300
}

fn default_csv_encoding() -> String {
    "utf-8".to_string()
}

fn default_ingestion_chunk_size() -> usize {
    2000
}

fn default_signature_headers() -> Vec<String> {
    vec![
        "x-sonar-webhook-hmac-sha256".to_string(),
        "x-hub-signature-sha256".to_string(),
    ]
}

fn default_secret_header() -> String {
    "x-sonar-secret".to_string()
}

fn default_fork_remote_base() -> String {
    "https://github.com".to_string()
}

fn default_workdir() -> PathBuf {
    std::env::temp_dir().join("scanforge-work")
}

fn default_log_dir() -> PathBuf {
    std::env::temp_dir().join("scanforge-logs")
}

fn default_export_dir() -> PathBuf {
    std::env::temp_dir().join("scanforge-exports")
}
