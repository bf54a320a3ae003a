//! Completion webhook endpoint.
//!
//! `POST /api/webhooks/analysis` accepts the analysis server's signed
//! completion notification. The engine's intake verifies, persists, and
//! correlates; orphans still get a 2xx so the server stops retrying.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Serialize;

use scanforge_engine::store::Store;
use scanforge_engine::webhook::WebhookDisposition;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Response body for accepted webhooks.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct WebhookResponse {
    /// Always true for accepted requests.
    pub received: bool,
    /// Whether the notification matched an in-flight job.
    pub correlated: bool,
}

/// Values of every configured signature header present on the request;
/// all of them are tried.
fn signature_headers<'a>(headers: &'a HeaderMap, names: &[String]) -> Vec<&'a str> {
    names
        .iter()
        .filter_map(|name| headers.get(name.as_str()))
        .filter_map(|value| value.to_str().ok())
        .collect()
}

/// Handles the completion webhook.
pub async fn handle<S: Store + 'static>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let webhook_settings = &state.settings().webhook;
    let signatures = signature_headers(&headers, &webhook_settings.signature_headers);
    let shared_secret = headers
        .get(webhook_settings.secret_header.as_str())
        .and_then(|value| value.to_str().ok());

    let disposition = state
        .intake()
        .handle(&body, &signatures, shared_secret)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(WebhookResponse {
        received: true,
        correlated: matches!(disposition, WebhookDisposition::Correlated { .. }),
    }))
}
