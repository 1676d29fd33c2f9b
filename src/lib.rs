// Shared components
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;

// Core presence and routing
pub mod connection_manager;
pub mod lifecycle;
pub mod presence;
pub mod routing;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
