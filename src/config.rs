//! Server configuration from environment variables

use std::time::Duration;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server listens on.
    pub port: u16,
    /// How long a session with zero viewers survives before the sweeper
    /// tears it down.
    pub idle_timeout: Duration,
    /// Interval between sweeper passes.
    pub sweep_interval: Duration,
    /// Upper bound on automated turns driven after one supervisor message.
    pub max_round_turns: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("COLLOQUY_PORT", 8400),
            idle_timeout: Duration::from_secs(env_parse("COLLOQUY_IDLE_TIMEOUT_SECS", 300)),
            sweep_interval: Duration::from_secs(env_parse("COLLOQUY_SWEEP_INTERVAL_SECS", 30)),
            max_round_turns: env_parse("COLLOQUY_MAX_ROUND_TURNS", 8),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8400,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            max_round_turns: 8,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
