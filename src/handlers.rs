use crate::app::AppState;
use crate::auth::{self, IdentityClaim};
use crate::catalog;
use crate::error::{AppError, AppResult, GatewayError};
use crate::messages::ChatMessage;
use crate::providers;
use crate::quota::{DenyReason, QuotaDecision};
use crate::relay::{self, Frame};
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models() -> Json<serde_json::Value> {
    Json(json!({
        "data": catalog::MODELS,
        "default_model": catalog::DEFAULT_MODEL,
    }))
}

/// Usage against the caller's quota. Identity comes from the same headers the
/// chat endpoint reads.
pub async fn usage(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let identity = require_identity(&state, &headers).await?;
    let usage = state.quota.usage(&identity).await?;
    Ok(Json(usage).into_response())
}

pub(crate) async fn require_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> AppResult<crate::auth::Identity> {
    let claim = IdentityClaim::from_headers(headers);
    state.auth.resolve_identity(&claim).await.ok_or_else(|| {
        AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing session or identity token",
        )
    })
}

/// Largest chat body read after the credential and quota gates pass.
pub const MAX_CHAT_BODY_BYTES: usize = 4 * 1024 * 1024;

/// The body is taken unread so oversized payloads still meet the auth and
/// quota gates first.
pub async fn chat(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    match open_chat(&state, &headers, body).await {
        Ok(rx) => {
            record_outcome("streaming");
            let stream = tokio_stream::wrappers::ReceiverStream::new(rx)
                .map(|frame| Ok::<_, std::convert::Infallible>(frame.to_event()));
            Sse::new(stream).into_response()
        }
        Err(err) => {
            record_outcome(outcome_label(&err));
            match &err {
                GatewayError::Internal(_) => tracing::error!("chat request failed: {err}"),
                _ => tracing::debug!(code = err.code(), "chat request rejected: {err}"),
            }
            AppError::from(err).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatRequestBody {
    messages: Option<Vec<ChatMessage>>,
    model: Option<String>,
}

/// Every gate up to the open stream. Each returns before the next runs, so a
/// denied quota never reaches provider construction.
async fn open_chat(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<mpsc::Receiver<Frame>, GatewayError> {
    let api_key = auth::provider_credential(headers)?;

    let claim = IdentityClaim::from_headers(headers);
    let decision = state
        .quota
        .check(&claim)
        .await
        .map_err(|err| GatewayError::internal(err.to_string()))?;
    match decision {
        QuotaDecision::Allowed(_) => {}
        QuotaDecision::Denied(DenyReason::NoIdentity) => {
            tracing::debug!("chat request carries no identity");
            return Err(GatewayError::QuotaExceeded);
        }
        QuotaDecision::Denied(DenyReason::LimitReached(_)) => {
            return Err(GatewayError::QuotaExceeded);
        }
    }

    let body = axum::body::to_bytes(body, MAX_CHAT_BODY_BYTES)
        .await
        .map_err(|err| {
            tracing::debug!("chat body not read: {err}");
            GatewayError::Validation(format!(
                "Request body could not be read or exceeds {MAX_CHAT_BODY_BYTES} bytes"
            ))
        })?;
    let (messages, model) = parse_body(&body)?;
    let route = providers::route(&model)?;
    let client = route
        .provider
        .client(&state.runtime.providers, state.http.clone(), &api_key)?;

    tracing::info!(
        provider = route.provider.as_str(),
        model = %route.composite,
        history = messages.len(),
        "opening generation"
    );
    Ok(relay::spawn_relay(
        client,
        route,
        messages,
        state.runtime.gateway.clone(),
    ))
}

fn parse_body(body: &[u8]) -> Result<(Vec<ChatMessage>, String), GatewayError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| GatewayError::InvalidBody)?;
    let parsed: ChatRequestBody = serde_json::from_value(value).map_err(|err| {
        GatewayError::Validation(format!("Invalid request body: {err}"))
    })?;
    let (Some(messages), Some(model)) = (parsed.messages, parsed.model) else {
        return Err(GatewayError::Validation(
            "Missing required fields in body (messages, model)".to_string(),
        ));
    };
    if model.trim().is_empty() {
        return Err(GatewayError::Validation(
            "Missing required fields in body (messages, model)".to_string(),
        ));
    }
    if messages.is_empty() {
        return Err(GatewayError::Validation(
            "messages must contain at least one entry".to_string(),
        ));
    }
    Ok((messages, model))
}

fn outcome_label(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Auth(_) => "unauthorized",
        GatewayError::QuotaExceeded => "quota_exceeded",
        GatewayError::Validation(_) | GatewayError::InvalidBody => "invalid_body",
        GatewayError::UnsupportedProvider(_) => "unsupported_provider",
        GatewayError::Internal(_) => "internal_error",
    }
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("chatgate_chat_requests_total", "outcome" => outcome).increment(1);
}
