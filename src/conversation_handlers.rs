use crate::app::AppState;
use crate::auth::Identity;
use crate::error::{AppError, AppResult, GatewayError};
use crate::handlers::require_identity;
use crate::messages::{Conversation, Message, Role, new_id};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct CreateConversationBody {
    #[serde(default)]
    id: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CreateMessageBody {
    #[serde(default)]
    id: Option<String>,
    role: Role,
    content: String,
    #[serde(default)]
    model: Option<String>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let identity = require_identity(&state, &headers).await?;
    let conversations = state
        .store
        .list_conversations(&identity.owner_filter())
        .await?;
    Ok(Json(json!({ "data": conversations })).into_response())
}

pub async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let identity = require_identity(&state, &headers).await?;
    let req: CreateConversationBody = parse_json(&body)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(GatewayError::Validation("name must not be empty".to_string()).into());
    }
    let conversation = Conversation {
        id: non_blank_id(req.id),
        name: name.to_string(),
        created_at: chrono::Utc::now(),
        user_id: identity.user_id().map(str::to_string),
        session_id: identity.session_id().map(str::to_string),
    };
    state.store.create_conversation(&conversation).await?;

    // A retried create is a no-op; hand back whatever is stored under the id.
    let stored = state.store.get_conversation(&conversation.id).await?;
    match stored {
        Some(existing) if identity.owner_filter().matches(&existing) => {
            Ok((StatusCode::CREATED, Json(existing)).into_response())
        }
        _ => Err(AppError::new(
            StatusCode::CONFLICT,
            "conversation_conflict",
            "Conversation id is already in use",
        )),
    }
}

pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> AppResult<Response> {
    let identity = require_identity(&state, &headers).await?;
    let conversation = visible_conversation(&state, &identity, &conversation_id).await?;
    let messages = state.store.list_messages(&conversation.id).await?;
    Ok(Json(json!({ "data": messages })).into_response())
}

pub async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    body: Bytes,
) -> AppResult<Response> {
    let identity = require_identity(&state, &headers).await?;
    let conversation = visible_conversation(&state, &identity, &conversation_id).await?;
    let req: CreateMessageBody = parse_json(&body)?;
    let message = Message {
        id: non_blank_id(req.id),
        conversation_id: conversation.id,
        role: req.role,
        content: req.content,
        model: req.model.unwrap_or_default(),
        created_at: chrono::Utc::now(),
    };
    state.store.insert_message(&message).await?;

    // Same rule as conversations: an id already taken elsewhere is a conflict.
    match state.store.get_message(&message.id).await? {
        Some(stored) if stored.conversation_id == message.conversation_id => {
            Ok((StatusCode::CREATED, Json(stored)).into_response())
        }
        _ => Err(AppError::new(
            StatusCode::CONFLICT,
            "message_conflict",
            "Message id is already in use",
        )),
    }
}

async fn visible_conversation(
    state: &AppState,
    identity: &Identity,
    conversation_id: &str,
) -> AppResult<Conversation> {
    match state.store.get_conversation(conversation_id).await? {
        Some(conversation) if identity.owner_filter().matches(&conversation) => Ok(conversation),
        _ => Err(AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "Conversation not found",
        )),
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> AppResult<T> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| AppError::from(GatewayError::InvalidBody))?;
    serde_json::from_value(value)
        .map_err(|err| GatewayError::Validation(format!("Invalid request body: {err}")).into())
}

fn non_blank_id(id: Option<String>) -> String {
    id.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(new_id)
}
