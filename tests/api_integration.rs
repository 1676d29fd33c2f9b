//! HTTP API integration tests
//!
//! Exercise the full router with `oneshot` requests; no socket is bound.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use presence_fanout_service::config::{
    ApiConfig, JwtConfig, LoggingConfig, PresenceConfig, ServerConfig, Settings, ShutdownSettings,
    WebSocketConfig,
};
use presence_fanout_service::connection_manager::ConnectionHandle;
use presence_fanout_service::server::{create_app, AppState};
use presence_fanout_service::websocket::{OutboundFrame, ServerMessage};

const API_KEY: &str = "collaborator-key";

fn test_settings(api_key: Option<&str>) -> Settings {
    Settings {
        server: ServerConfig::default(),
        jwt: JwtConfig {
            secret: "test-secret-key-for-integration-tests".to_string(),
            issuer: None,
            audience: None,
            required: false,
        },
        api: ApiConfig {
            key: api_key.map(str::to_string),
        },
        websocket: WebSocketConfig::default(),
        presence: PresenceConfig::default(),
        shutdown: ShutdownSettings::default(),
        logging: LoggingConfig::default(),
    }
}

fn setup(api_key: Option<&str>) -> (Router, AppState) {
    let state = AppState::new(test_settings(api_key));
    (create_app(state.clone()), state)
}

fn connect(state: &AppState, user_id: &str) -> mpsc::Receiver<OutboundFrame> {
    let (tx, rx) = mpsc::channel(16);
    state.registry.register(
        user_id.to_string(),
        Arc::new(ConnectionHandle::new(Uuid::new_v4(), user_id.to_string(), tx)),
    );
    rx
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

mod operational_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_connections() {
        let (app, state) = setup(None);
        let _rx = connect(&state, "alice");

        let (status, body) = send(&app, get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"]["total"], 1);
        assert_eq!(body["connections"]["unique_users"], 1);
    }

    #[tokio::test]
    async fn test_stats_and_metrics_are_public() {
        let (app, _state) = setup(Some(API_KEY));

        let (status, body) = send(&app, get("/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["routing"]["messages_routed"], 0);

        let response = app.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

mod presence_api_tests {
    use super::*;

    #[tokio::test]
    async fn test_presence_lists_online_users_sorted() {
        let (app, state) = setup(None);
        let _c = connect(&state, "carol");
        let _a = connect(&state, "alice");
        let _a2 = connect(&state, "alice");

        let (status, body) = send(&app, get("/api/v1/presence")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["online"], json!(["alice", "carol"]));
        assert_eq!(body["count"], 2);
    }

    #[tokio::test]
    async fn test_user_presence() {
        let (app, state) = setup(None);
        let _a = connect(&state, "alice");
        let _a2 = connect(&state, "alice");

        let (_, body) = send(&app, get("/api/v1/presence/alice")).await;
        assert_eq!(body["online"], true);
        assert_eq!(body["connectionCount"], 2);

        let (_, body) = send(&app, get("/api/v1/presence/bob")).await;
        assert_eq!(body["online"], false);
        assert_eq!(body["connectionCount"], 0);
    }
}

mod message_api_tests {
    use super::*;

    #[tokio::test]
    async fn test_route_with_explicit_recipients() {
        let (app, state) = setup(None);
        let mut bob = connect(&state, "bob");

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/v1/messages",
                json!({
                    "senderId": "alice",
                    "chatId": "c1",
                    "recipientIds": ["bob", "carol"],
                    "payload": {"content": "hello"}
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 1);
        assert_eq!(body["offlineRecipients"], 1);

        let frame = bob.try_recv().expect("bob should receive the message");
        let message: ServerMessage = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert!(matches!(message, ServerMessage::MessageReceived(ref d) if d.chat_id == "c1"));
    }

    #[tokio::test]
    async fn test_route_through_chat_directory() {
        let (app, state) = setup(None);
        let mut bob = connect(&state, "bob");

        let (status, body) = send(
            &app,
            json_request("PUT", "/api/v1/chats/c1", json!({"participants": ["alice", "bob"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["participantCount"], 2);

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/v1/messages",
                json!({"senderId": "alice", "chatId": "c1", "payload": "hi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 1);
        assert!(bob.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_route_rejections() {
        let (app, state) = setup(None);
        state.chat_directory.upsert("c1", ["alice".to_string(), "bob".to_string()]);

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/v1/messages",
                json!({"senderId": "mallory", "chatId": "c1", "payload": "hi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/api/v1/messages",
                json!({"senderId": "alice", "chatId": "missing", "payload": "hi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/v1/messages",
                json!({"senderId": " ", "chatId": "c1", "payload": "hi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_chat_upsert_and_delete() {
        let (app, state) = setup(None);

        let (status, _) = send(
            &app,
            json_request("PUT", "/api/v1/chats/c1", json!({"participants": ["", "  "]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.chat_directory.is_empty());

        send(
            &app,
            json_request("PUT", "/api/v1/chats/c1", json!({"participants": ["alice"]})),
        )
        .await;
        assert_eq!(state.chat_directory.len(), 1);

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/chats/c1")
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = send(&app, delete()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, delete()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

mod api_key_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_or_wrong_key_rejected() {
        let (app, _state) = setup(Some(API_KEY));

        let response = app.clone().oneshot(get("/api/v1/presence")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/v1/presence")
            .header("X-API-Key", "wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_key_accepted() {
        let (app, _state) = setup(Some(API_KEY));

        let request = Request::builder()
            .uri("/api/v1/presence")
            .header("X-API-Key", API_KEY)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
