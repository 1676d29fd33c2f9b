mod settings;

pub use settings::{
    ApiConfig, JwtConfig, LogFormat, LoggingConfig, PresenceConfig, ServerConfig, Settings,
    ShutdownSettings, WebSocketConfig,
};
