//! Core bot configuration.

use std::time::Duration;

/// Parse an environment variable, falling back to a default.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Tunables for the routing core.
///
/// Subsystem-specific configuration (MQTT, mail, AI) lives next to the
/// subsystem; these values parameterize the core paths every message takes.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Maximum bytes per downlink chunk (mesh frames are small).
    pub chunk_max_bytes: usize,
    /// Delay between successive chunks of one reply.
    pub chunk_delay: Duration,
    /// Idle time after which a session is considered dead.
    pub session_ttl: Duration,
    /// Interval of the background session sweep.
    pub sweep_interval: Duration,
    /// Interval of the inbound email reply poll.
    pub mail_poll_interval: Duration,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            chunk_max_bytes: 180,
            chunk_delay: Duration::from_millis(1200),
            session_ttl: Duration::from_secs(3600), // 1 hour
            sweep_interval: Duration::from_secs(300), // 5 minutes
            mail_poll_interval: Duration::from_secs(30),
        }
    }
}

impl BotConfig {
    /// Build config from environment variables, with defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_max_bytes: env_parse("MESH_CHUNK_BYTES", defaults.chunk_max_bytes),
            chunk_delay: Duration::from_millis(env_parse(
                "MESH_CHUNK_DELAY_MS",
                defaults.chunk_delay.as_millis() as u64,
            )),
            session_ttl: Duration::from_secs(env_parse(
                "MESH_SESSION_TTL_SECS",
                defaults.session_ttl.as_secs(),
            )),
            sweep_interval: Duration::from_secs(env_parse(
                "MESH_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )),
            mail_poll_interval: Duration::from_secs(env_parse(
                "MAIL_POLL_INTERVAL_SECS",
                defaults.mail_poll_interval.as_secs(),
            )),
        }
    }
}
