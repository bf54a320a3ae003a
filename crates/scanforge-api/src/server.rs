//! API server implementation.
//!
//! Provides the webhook intake endpoint plus health and readiness probes.
//! The broader upload/read-model API is served elsewhere; this surface is
//! what the analysis servers call back into.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use scanforge_core::Settings;
use scanforge_engine::store::Store;
use scanforge_engine::webhook::{CompletionHub, WebhookIntake};

use crate::routes;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
}

/// Shared application state for all request handlers.
pub struct AppState<S> {
    settings: Arc<Settings>,
    intake: Arc<WebhookIntake<S>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            settings: Arc::clone(&self.settings),
            intake: Arc::clone(&self.intake),
        }
    }
}

impl<S> std::fmt::Debug for AppState<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("settings", &self.settings)
            .finish()
    }
}

impl<S: Store + 'static> AppState<S> {
    /// Creates application state over a store and the shared completion
    /// hub.
    #[must_use]
    pub fn new(store: Arc<S>, settings: Arc<Settings>, completions: Arc<CompletionHub>) -> Self {
        let intake = Arc::new(WebhookIntake::new(store, &settings.webhook, completions));
        Self { settings, intake }
    }

    /// The loaded settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The webhook intake.
    #[must_use]
    pub fn intake(&self) -> &WebhookIntake<S> {
        &self.intake
    }
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn readyz() -> Json<ReadyResponse> {
    Json(ReadyResponse { ready: true })
}

/// Builds the API router.
#[must_use]
pub fn router<S: Store + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/webhooks/analysis", post(routes::webhook::handle::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until shutdown.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve<S: Store + 'static>(
    state: AppState<S>,
    addr: SocketAddr,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "webhook intake listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use scanforge_core::config::WebhookSettings;
    use scanforge_engine::job::{JobState, Lease, ScanJob};
    use scanforge_engine::store::memory::InMemoryStore;
    use scanforge_engine::webhook::SignatureVerifier;
    use tower::ServiceExt;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings {
            webhook: WebhookSettings {
                secret: "s3cret".into(),
                ..WebhookSettings::default()
            },
            debug: true,
            ..Settings::default()
        })
    }

    fn app(store: Arc<InMemoryStore>) -> Router {
        let state = AppState::new(store, settings(), Arc::new(CompletionHub::new()));
        router(state)
    }

    fn webhook_body(analysis_id: &str) -> Vec<u8> {
        format!(
            r#"{{"analysis":{{"key":"{analysis_id}"}},"project":{{"key":"acme_c1"}},"qualityGate":{{"status":"OK"}}}}"#
        )
        .into_bytes()
    }

    async fn running_job(store: &InMemoryStore, analysis_id: &str) {
        let mut job = ScanJob::new(scanforge_core::ProjectId::generate(), "acme/lib", "c1");
        let now = chrono::Utc::now();
        job.state = JobState::Running;
        job.lease = Some(Lease {
            instance_name: "primary".into(),
            token: uuid::Uuid::new_v4(),
            slot: 0,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(300),
            analysis_id: Some(analysis_id.to_string()),
        });
        store.insert_job(&job).await.unwrap();
    }

    #[tokio::test]
    async fn health_and_ready_respond_ok() {
        let app = app(Arc::new(InMemoryStore::new()));
        for path in ["/healthz", "/readyz"] {
            let response = app
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
        }
    }

    #[tokio::test]
    async fn signed_webhook_is_accepted() {
        let store = Arc::new(InMemoryStore::new());
        running_job(&store, "AX-1").await;
        let app = app(store);

        let body = webhook_body("AX-1");
        let signature = SignatureVerifier::new(&settings().webhook).sign(&body);
        let response = app
            .oneshot(
                Request::post("/api/webhooks/analysis")
                    .header("x-sonar-webhook-hmac-sha256", signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn orphan_webhook_still_gets_2xx() {
        let app = app(Arc::new(InMemoryStore::new()));
        let body = webhook_body("AX-unknown");
        let signature = SignatureVerifier::new(&settings().webhook).sign(&body);
        let response = app
            .oneshot(
                Request::post("/api/webhooks/analysis")
                    .header("x-sonar-webhook-hmac-sha256", signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_with_401() {
        let app = app(Arc::new(InMemoryStore::new()));
        let response = app
            .oneshot(
                Request::post("/api/webhooks/analysis")
                    .header("x-sonar-webhook-hmac-sha256", "deadbeef")
                    .body(Body::from(webhook_body("AX-1")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected_with_401() {
        let app = app(Arc::new(InMemoryStore::new()));
        let response = app
            .oneshot(
                Request::post("/api/webhooks/analysis")
                    .body(Body::from(webhook_body("AX-1")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn shared_secret_header_is_accepted() {
        let store = Arc::new(InMemoryStore::new());
        running_job(&store, "AX-2").await;
        let app = app(store);

        let response = app
            .oneshot(
                Request::post("/api/webhooks/analysis")
                    .header("x-sonar-secret", "s3cret")
                    .body(Body::from(webhook_body("AX-2")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_with_400() {
        let app = app(Arc::new(InMemoryStore::new()));
        let body = br#"{"analysisId":"AX-1"}"#.to_vec();
        let signature = SignatureVerifier::new(&settings().webhook).sign(&body);
        let response = app
            .oneshot(
                Request::post("/api/webhooks/analysis")
                    .header("x-sonar-webhook-hmac-sha256", signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
