//! Message hand-off from the persistence collaborator.

use axum::{extract::State, Json};
use serde::Deserialize;

use crate::connection_manager::UserIdentity;
use crate::error::{AppError, Result};
use crate::routing::{OutboundMessage, RouteReport};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMessageRequest {
    pub sender_id: UserIdentity,
    pub chat_id: String,
    /// When absent, recipients are the chat's participants from the directory
    #[serde(default)]
    pub recipient_ids: Option<Vec<UserIdentity>>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// POST /api/v1/messages - route a newly persisted message to live recipients
#[tracing::instrument(
    name = "api.route_message",
    skip(state, request),
    fields(sender_id = %request.sender_id, chat_id = %request.chat_id)
)]
pub async fn route_message(
    State(state): State<AppState>,
    Json(request): Json<RouteMessageRequest>,
) -> Result<Json<RouteReport>> {
    if request.sender_id.trim().is_empty() {
        return Err(AppError::Validation("senderId must not be empty".to_string()));
    }
    if request.chat_id.trim().is_empty() {
        return Err(AppError::Validation("chatId must not be empty".to_string()));
    }

    let report = match request.recipient_ids {
        Some(recipients) => {
            let message = OutboundMessage::new(
                request.sender_id,
                request.chat_id,
                recipients,
                request.payload,
            );
            state.router.route(message).await
        }
        None => {
            state
                .router
                .route_chat_message(&request.sender_id, &request.chat_id, request.payload)
                .await?
        }
    };

    Ok(Json(report))
}
