use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::auth::JwtValidator;
use crate::config::Settings;
use crate::connection_manager::ConnectionRegistry;
use crate::presence::PresenceHub;
use crate::routing::{InMemoryChatDirectory, MessageRouter};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwt_validator: Arc<JwtValidator>,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: PresenceHub,
    pub router: Arc<MessageRouter>,
    pub chat_directory: Arc<InMemoryChatDirectory>,
    /// Fires once when the service starts shutting down
    pub shutdown: broadcast::Sender<()>,
    pub started_at: Instant,
}

impl AppState {
    /// Build the shared state and start the presence coordinator.
    /// Must be called from within a Tokio runtime.
    pub fn new(settings: Settings) -> Self {
        let jwt_validator = Arc::new(JwtValidator::new(&settings.jwt));
        let registry = Arc::new(ConnectionRegistry::new());
        let (presence, _coordinator) =
            PresenceHub::spawn(registry.clone(), settings.presence.command_buffer);
        let chat_directory = Arc::new(InMemoryChatDirectory::new());
        let router = Arc::new(MessageRouter::new(registry.clone(), chat_directory.clone()));
        let (shutdown, _) = broadcast::channel(1);

        Self {
            settings: Arc::new(settings),
            jwt_validator,
            registry,
            presence,
            router,
            chat_directory,
            shutdown,
            started_at: Instant::now(),
        }
    }
}
