//! Configuration loading from environment.
//!
//! Reads sensitive configuration from environment variables with sane
//! defaults for everything that is not a credential.

use std::env;

use crate::error::{QuestlineError, Result};

/// Default path for the embedded database file.
pub const DEFAULT_DATABASE_PATH: &str = "questline.db";
/// Default port for the health check endpoint.
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
/// Default cadence of the orphan voice-session sweep, in seconds.
pub const DEFAULT_ORPHAN_SWEEP_SECS: u64 = 300;
/// Default cadence of the database keep-alive ping, in seconds.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 120;

/// Main configuration for the questline bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Discord bot token.
    pub discord_token: String,
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Port for the health check HTTP server.
    pub health_port: u16,
    /// Seconds between orphan voice-session sweeps.
    pub orphan_sweep_secs: u64,
    /// Seconds between database keep-alive pings.
    pub keepalive_secs: u64,
}

impl BotConfig {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `DISCORD_TOKEN`: Discord bot token
    ///
    /// Optional environment variables:
    /// - `DATABASE_PATH`: SQLite file path (default: questline.db)
    /// - `HEALTH_PORT`: health endpoint port (default: 8080)
    /// - `ORPHAN_SWEEP_SECS`: orphan sweep cadence (default: 300)
    /// - `KEEPALIVE_SECS`: keep-alive ping cadence (default: 120)
    pub fn from_env() -> Result<Self> {
        let discord_token = env::var("DISCORD_TOKEN")
            .map_err(|_| QuestlineError::Config("DISCORD_TOKEN not set".to_string()))?;

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());

        let health_port = parse_env_or("HEALTH_PORT", DEFAULT_HEALTH_PORT);
        let orphan_sweep_secs = parse_env_or("ORPHAN_SWEEP_SECS", DEFAULT_ORPHAN_SWEEP_SECS);
        let keepalive_secs = parse_env_or("KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS);

        Ok(Self {
            discord_token,
            database_path,
            health_port,
            orphan_sweep_secs,
            keepalive_secs,
        })
    }
}

/// Parse an environment variable, falling back to a default on absence or
/// malformed input.
fn parse_env_or<T: std::str::FromStr>(var_name: &str, default: T) -> T {
    env::var(var_name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
