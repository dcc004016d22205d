//! Error types for the channel relay.

use axum::http::StatusCode;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid cron expression for schedule {name}: {reason}")]
    InvalidSchedule { name: String, reason: String },

    #[error("Invalid channel pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Binding (platform transport) errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to edit message {handle} on channel {name}: {reason}")]
    EditFailed {
        name: String,
        handle: String,
        reason: String,
    },

    #[error("Message {handle} not found on channel {name}")]
    MessageNotFound { name: String, handle: String },

    #[error("Upload failed on channel {name}: {reason}")]
    UploadFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// HTTP status a gateway handler should answer with when inbound
    /// normalization fails with this error.
    pub fn inbound_status(&self) -> StatusCode {
        match self {
            Self::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
            Self::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Gateway (shared listener) errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Route {0} is already registered")]
    DuplicateRoute(String),

    #[error("Route path must start with '/': {0}")]
    InvalidPath(String),

    #[error("Request rejected ({status}): {reason}")]
    Rejected { status: StatusCode, reason: String },

    #[error("Handler failed: {0}")]
    Handler(String),
}

impl GatewayError {
    /// Status code the listener answers with for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Rejected { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ChannelError> for GatewayError {
    fn from(err: ChannelError) -> Self {
        Self::Rejected {
            status: err.inbound_status(),
            reason: err.to_string(),
        }
    }
}

/// Run coordination errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Conversation {channel_id} already has an active run")]
    AlreadyRunning { channel_id: String },

    #[error("Conversation {channel_id} has no active run")]
    NotRunning { channel_id: String },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
