//! Public HTTP surface: platform webhooks and hook triggers. Requests are
//! validated, normalized and queued; all processing happens in the worker.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::cache::{message_key, store_message};
use crate::error::EngineError;
use crate::models::db::Platform;
use crate::models::payloads::IncomingJob;
use crate::AppState;

/// Maps engine errors onto webhook status codes.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::MalformedPayload(_) | EngineError::Serialization(_) => StatusCode::BAD_REQUEST,
            EngineError::Signature => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Webhook request failed");
        } else {
            debug!(status = status.as_u16(), error = %self.0, "Webhook request rejected");
        }
        // Unknown and disabled targets get the same body.
        let message = match status {
            StatusCode::NOT_FOUND => "not found".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
            _ => self.0.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult = std::result::Result<Json<Value>, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/telegram/{id}/", post(telegram_webhook))
        .route("/kik/{id}/", post(kik_webhook))
        .route("/messenger/{id}/", post(messenger_webhook))
        .route("/hooks/{key}/", post(hook_trigger))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn telegram_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    receive(&state, Platform::Telegram, &id, &headers, &body).await
}

async fn kik_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    receive(&state, Platform::Kik, &id, &headers, &body).await
}

async fn messenger_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    receive(&state, Platform::Messenger, &id, &headers, &body).await
}

async fn receive(
    state: &AppState,
    platform: Platform,
    binding_id: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> ApiResult {
    let binding = state
        .storage
        .get_binding(platform, binding_id)
        .await?
        .filter(|b| b.enabled)
        .ok_or_else(|| EngineError::not_found(format!("{platform} binding {binding_id}")))?;
    let adapter = state.adapters.adapter(&binding);

    if let Some(header) = adapter.signature_header() {
        let signature = headers.get(header).and_then(|v| v.to_str().ok());
        adapter.verify_signature(signature, body)?;
    }

    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| EngineError::MalformedPayload(format!("invalid JSON: {e}")))?;
    let messages = adapter.parse_inbound(&payload)?;

    for message in &messages {
        let key = message_key(platform, &binding.id, &message.id);
        store_message(state.cache.as_ref(), &key, message, state.config.cache_ttl_secs).await?;
        state
            .queue
            .enqueue(&IncomingJob::NewMessage {
                binding_id: binding.id.clone(),
                platform,
                message_key: key,
            })
            .await?;
    }

    if messages.is_empty() {
        debug!(platform = %platform, binding_id = binding_id, "No text messages in webhook payload");
    } else {
        info!(
            platform = %platform,
            binding_id = binding_id,
            count = messages.len(),
            "Queued inbound messages"
        );
    }
    Ok(Json(json!({ "queued": messages.len() })))
}

async fn hook_trigger(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> ApiResult {
    let hook = state
        .storage
        .hook_by_key(&key)
        .await?
        .filter(|h| h.enabled)
        .ok_or_else(|| EngineError::not_found("hook"))?;

    let data: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| EngineError::MalformedPayload(format!("invalid JSON: {e}")))?
    };
    if !data.is_object() {
        warn!(hook = hook.name, "Hook payload is not a JSON object");
        return Err(EngineError::MalformedPayload("hook payload must be a JSON object".into()).into());
    }

    state
        .queue
        .enqueue(&IncomingJob::HookTriggered {
            hook_id: hook.id.clone(),
            data,
        })
        .await?;
    info!(hook = hook.name, "Hook triggered");
    Ok(Json(json!({ "queued": 1 })))
}
