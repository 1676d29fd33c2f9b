use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::connection_manager::UserIdentity;
use crate::error::{AppError, Result};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct UpsertChatRequest {
    pub participants: Vec<UserIdentity>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertChatResponse {
    pub chat_id: String,
    pub participant_count: usize,
}

/// PUT /api/v1/chats/{chat_id} - record a chat's participants
pub async fn upsert_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(request): Json<UpsertChatRequest>,
) -> Result<Json<UpsertChatResponse>> {
    let participants: Vec<UserIdentity> = request
        .participants
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    if participants.is_empty() {
        return Err(AppError::Validation(
            "participants must contain at least one user".to_string(),
        ));
    }

    let participant_count = state.chat_directory.upsert(chat_id.clone(), participants);

    Ok(Json(UpsertChatResponse {
        chat_id,
        participant_count,
    }))
}

/// DELETE /api/v1/chats/{chat_id} - forget a chat
pub async fn delete_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode> {
    if state.chat_directory.remove(&chat_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Chat not found: {}", chat_id)))
    }
}
