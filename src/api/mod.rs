mod chats;
mod health;
mod messages;
mod metrics;
mod presence;
mod routes;

pub use chats::{delete_chat, upsert_chat, UpsertChatRequest, UpsertChatResponse};
pub use health::{health, stats, HealthResponse, StatsResponse};
pub use messages::{route_message, RouteMessageRequest};
pub use metrics::prometheus_metrics;
pub use presence::{online_users, user_presence, OnlineUsersResponse, UserPresenceResponse};
pub use routes::api_routes;
