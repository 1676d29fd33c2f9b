use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::connection_manager::UserIdentity;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub online: Vec<UserIdentity>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceResponse {
    pub user_id: UserIdentity,
    pub online: bool,
    pub connection_count: usize,
}

/// GET /api/v1/presence - current presence snapshot
pub async fn online_users(State(state): State<AppState>) -> Json<OnlineUsersResponse> {
    let online = state.registry.snapshot().into_vec();
    Json(OnlineUsersResponse {
        count: online.len(),
        online,
    })
}

/// GET /api/v1/presence/{user_id}
pub async fn user_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<UserPresenceResponse> {
    let info = state.registry.user_info(&user_id);
    Json(UserPresenceResponse {
        online: info.connection_count > 0,
        user_id: info.user_id,
        connection_count: info.connection_count,
    })
}
