//! Completion webhook verification and correlation.
//!
//! The analysis server pushes a signed notification when an analysis
//! finishes. Intake proceeds in a fixed order:
//!
//! 1. Verify the signature; protocol violations never touch state
//! 2. Persist the event (orphans included) before any further work
//! 3. Correlate by `analysis_id` to the RUNNING job whose lease carries it
//! 4. Publish the outcome on the [`CompletionHub`] so the waiting
//!    dispatcher finalizes the job
//!
//! Orphaned notifications are stored and acknowledged with OK so the
//! server does not retry forever; the reconciler re-checks them against
//! in-flight jobs within the lease window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Notify;

use scanforge_core::config::WebhookSettings;
use scanforge_core::{ScanJobId, WebhookEventId};

use crate::error::Error;
use crate::metrics::{labels, names};
use crate::record::{WebhookEvent, WebhookStatus};
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of an analysis, published to the waiting dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    /// The analysis passed.
    Passed,
    /// The analysis server reported a failure.
    Failed,
}

/// Errors the intake reports to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The signature did not verify; reject with 4xx, change nothing.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// The body was not a recognizable payload; reject with 4xx.
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// Persistence failed; the server should retry.
    #[error("webhook processing failed: {0}")]
    Internal(#[from] Error),
}

/// How an accepted webhook was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Correlated to a RUNNING job; the completion hub was signalled.
    Correlated {
        /// The job the notification matched.
        job_id: ScanJobId,
        /// The published outcome.
        outcome: AnalysisOutcome,
    },
    /// No in-flight job matched; the event was stored for observability.
    Orphaned,
}

/// Verifies webhook authentication.
///
/// Accepts either a hex-encoded HMAC-SHA256 of the body in one of the
/// configured signature headers, or the shared secret itself in the
/// dedicated secret header.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl SignatureVerifier {
    /// Creates a verifier for the configured shared secret.
    #[must_use]
    pub fn new(settings: &WebhookSettings) -> Self {
        Self {
            secret: settings.secret.clone(),
        }
    }

    /// Verifies a request.
    ///
    /// `signatures` holds the hex HMAC values of every configured
    /// signature header that was present (all are tried); `shared_secret`
    /// is the value of the secret header. The secret header wins when both
    /// forms are present, matching the server's precedence.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::InvalidSignature`] when neither form
    /// verifies.
    pub fn verify(
        &self,
        body: &[u8],
        signatures: &[&str],
        shared_secret: Option<&str>,
    ) -> Result<(), WebhookError> {
        if let Some(provided) = shared_secret {
            if constant_time_eq(provided.as_bytes(), self.secret.as_bytes()) {
                return Ok(());
            }
            return Err(WebhookError::InvalidSignature);
        }
        for signature in signatures {
            let Ok(decoded) = hex::decode(signature.trim()) else {
                continue;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
                continue;
            };
            mac.update(body);
            if mac.verify_slice(&decoded).is_ok() {
                return Ok(());
            }
        }
        Err(WebhookError::InvalidSignature)
    }

    /// Computes the hex signature for a body; used by tests and by the
    /// outbound simulator.
    #[must_use]
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("hmac accepts any key size");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Constant-time byte comparison via HMAC tags, avoiding a timing oracle
/// on the shared-secret header.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut mac_a = HmacSha256::new_from_slice(b"scanforge-ct").expect("fixed key");
    mac_a.update(a);
    let mut mac_b = HmacSha256::new_from_slice(b"scanforge-ct").expect("fixed key");
    mac_b.update(b);
    mac_a.finalize().into_bytes() == mac_b.finalize().into_bytes()
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    #[serde(default)]
    analysis: Option<RawAnalysis>,
    #[serde(default, rename = "analysisId")]
    analysis_id: Option<String>,
    #[serde(default)]
    project: Option<RawProject>,
    #[serde(default, rename = "qualityGate")]
    quality_gate: Option<RawQualityGate>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQualityGate {
    status: Option<String>,
}

/// The parsed essentials of a completion payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedWebhook {
    /// Submission identifier to correlate on.
    pub analysis_id: String,
    /// Component key the analysis belongs to.
    pub component_key: String,
    /// Normalized status.
    pub status: WebhookStatus,
}

/// Parses the webhook JSON body.
///
/// # Errors
///
/// Returns [`WebhookError::MalformedPayload`] when the body is not JSON or
/// lacks the component key or analysis id.
pub fn parse_payload(body: &[u8]) -> Result<ParsedWebhook, WebhookError> {
    let raw: RawPayload = serde_json::from_slice(body)
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
    let component_key = raw
        .project
        .and_then(|p| p.key)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| WebhookError::MalformedPayload("project key missing".into()))?;
    let analysis_id = raw
        .analysis
        .and_then(|a| a.key)
        .or(raw.analysis_id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WebhookError::MalformedPayload("analysis id missing".into()))?;
    let status_raw = raw
        .quality_gate
        .and_then(|qg| qg.status)
        .or(raw.status)
        .unwrap_or_default();
    Ok(ParsedWebhook {
        analysis_id,
        component_key,
        status: WebhookStatus::from_raw(&status_raw),
    })
}

#[derive(Debug)]
struct PublishedOutcome {
    outcome: AnalysisOutcome,
    published_at: DateTime<Utc>,
}

/// Bridges asynchronous completions to the dispatchers waiting on them.
///
/// Outcomes are retained until pruned so a webhook that lands before the
/// dispatcher subscribes (the submission-id race) still completes the
/// wait; [`CompletionHub::prune_older_than`] bounds the retention to the
/// correlation window.
#[derive(Debug, Default)]
pub struct CompletionHub {
    outcomes: Mutex<HashMap<String, PublishedOutcome>>,
    notify: Notify,
}

impl CompletionHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the outcome for an analysis id, waking every waiter.
    pub fn publish(&self, analysis_id: &str, outcome: AnalysisOutcome) {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        outcomes.insert(
            analysis_id.to_string(),
            PublishedOutcome {
                outcome,
                published_at: Utc::now(),
            },
        );
        drop(outcomes);
        self.notify.notify_waiters();
    }

    /// Returns the published outcome for an analysis id, if any.
    #[must_use]
    pub fn peek(&self, analysis_id: &str) -> Option<AnalysisOutcome> {
        let outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        outcomes.get(analysis_id).map(|p| p.outcome)
    }

    /// Waits until an outcome for `analysis_id` is published.
    ///
    /// Callers bound the wait with `tokio::time::timeout`.
    pub async fn wait(&self, analysis_id: &str) -> AnalysisOutcome {
        loop {
            let notified = self.notify.notified();
            if let Some(outcome) = self.peek(analysis_id) {
                return outcome;
            }
            notified.await;
        }
    }

    /// Drops outcomes published before `cutoff`.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        outcomes.retain(|_, published| published.published_at >= cutoff);
    }
}

/// Accepts, verifies, persists, and correlates completion webhooks.
pub struct WebhookIntake<S> {
    store: Arc<S>,
    verifier: SignatureVerifier,
    completions: Arc<CompletionHub>,
}

impl<S> std::fmt::Debug for WebhookIntake<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookIntake")
            .field("verifier", &self.verifier)
            .finish()
    }
}

impl<S: Store> WebhookIntake<S> {
    /// Creates an intake over the store and completion hub.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        settings: &WebhookSettings,
        completions: Arc<CompletionHub>,
    ) -> Self {
        Self {
            store,
            verifier: SignatureVerifier::new(settings),
            completions,
        }
    }

    /// The completion hub dispatchers subscribe to.
    #[must_use]
    pub fn completions(&self) -> Arc<CompletionHub> {
        Arc::clone(&self.completions)
    }

    /// Processes one webhook request.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::InvalidSignature`] / [`WebhookError::MalformedPayload`]
    ///   are protocol violations the HTTP layer maps to 4xx
    /// - [`WebhookError::Internal`] maps to 5xx so the server retries
    pub async fn handle(
        &self,
        body: &[u8],
        signatures: &[&str],
        shared_secret: Option<&str>,
    ) -> Result<WebhookDisposition, WebhookError> {
        self.verifier.verify(body, signatures, shared_secret)?;
        let parsed = parse_payload(body)?;

        let event = WebhookEvent {
            id: WebhookEventId::generate(),
            analysis_id: parsed.analysis_id.clone(),
            component_key: parsed.component_key.clone(),
            status: parsed.status,
            scan_job_id: None,
            payload: String::from_utf8_lossy(body).into_owned(),
            received_at: Utc::now(),
        };
        self.store.insert_webhook_event(&event).await?;

        let disposition = self.correlate(&event.id, &parsed).await?;
        let result_label = match &disposition {
            WebhookDisposition::Correlated { .. } => "correlated",
            WebhookDisposition::Orphaned => "orphan",
        };
        metrics::counter!(names::WEBHOOKS_TOTAL, labels::RESULT => result_label).increment(1);
        Ok(disposition)
    }

    async fn correlate(
        &self,
        event_id: &WebhookEventId,
        parsed: &ParsedWebhook,
    ) -> Result<WebhookDisposition, WebhookError> {
        let Some(job) = self
            .store
            .find_running_by_analysis_id(&parsed.analysis_id)
            .await?
        else {
            tracing::info!(
                analysis_id = %parsed.analysis_id,
                component_key = %parsed.component_key,
                "webhook matched no in-flight job; stored as orphan"
            );
            return Ok(WebhookDisposition::Orphaned);
        };

        self.store.correlate_webhook_event(event_id, &job.id).await?;
        let outcome = match parsed.status {
            WebhookStatus::Success => AnalysisOutcome::Passed,
            WebhookStatus::Failed | WebhookStatus::Other => AnalysisOutcome::Failed,
        };
        // Publishing is idempotent: a duplicate payload re-inserts the same
        // outcome and the job's state-conditional write still fires once.
        self.completions.publish(&parsed.analysis_id, outcome);
        tracing::info!(
            analysis_id = %parsed.analysis_id,
            job_id = %job.id,
            outcome = ?outcome,
            "webhook correlated"
        );
        Ok(WebhookDisposition::Correlated {
            job_id: job.id,
            outcome,
        })
    }
}
