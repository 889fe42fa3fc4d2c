//! Error types for the mesh DM bot.

/// Top-level error type for the bot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("AI error: {0}")]
    Ai(#[from] AiError),

    #[error("Weather error: {0}")]
    Weather(#[from] WeatherError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Envelope decode failures.
///
/// These are expected on a shared mesh feed (telemetry, position packets,
/// foreign encodings) and are dropped after a debug-level log — a filter
/// outcome, not an error condition.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Payload is not a JSON envelope: {0}")]
    NotJson(String),

    #[error("Not a text-application packet (port: {port})")]
    NotText { port: String },

    #[error("Envelope missing field: {0}")]
    MissingField(&'static str),

    #[error("Envelope field {field} is malformed: {value}")]
    MalformedField { field: &'static str, value: String },

    #[error("Topic carries no gateway node id: {0}")]
    NoGateway(String),

    #[error("Text payload is empty")]
    EmptyText,
}

/// Mesh transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("MQTT connection failed: {0}")]
    ConnectFailed(String),

    #[error("Downlink publish failed: {0}")]
    PublishFailed(String),

    #[error("Ingest queue closed")]
    QueueClosed,
}

/// AI collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("AI backend is not configured")]
    Disabled,

    #[error("AI request failed: {0}")]
    RequestFailed(String),

    #[error("AI returned an empty response")]
    EmptyResponse,
}

/// Weather collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("Could not resolve location: {0}")]
    UnknownLocation(String),

    #[error("Forecast fetch failed: {0}")]
    FetchFailed(String),
}

/// Email bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Email bridge is not configured")]
    Disabled,

    #[error("Failed to build email: {0}")]
    BuildFailed(String),

    #[error("SMTP send failed: {0}")]
    SendFailed(String),

    #[error("Inbox fetch failed: {0}")]
    FetchFailed(String),

    #[error("No email with id {0}")]
    NotFound(String),
}

/// Result type alias for the bot.
pub type Result<T> = std::result::Result<T, Error>;
