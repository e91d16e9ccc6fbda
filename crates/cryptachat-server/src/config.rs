//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `SECRET_KEY`: HMAC key for signing session tokens. Required.
//! - `PORT`: HTTP listen port. Default: `5000`
//! - `CRYPTACHAT_BIND_ADDR`: Listen address. Default: `0.0.0.0`
//! - `CRYPTACHAT_DB_PATH`: SQLite database file. Default: in-memory
//! - `CRYPTACHAT_TOKEN_TTL_HOURS`: Session token lifetime, positive. Default: `24`
//! - `CRYPTACHAT_OUTBOUND_QUEUE`: Per-connection push queue size. Default: `256`
//! - `CRYPTACHAT_JOB_QUEUE`: Hub job queue size. Default: `1024`
//! - `CRYPTACHAT_PONG_WAIT_SECS`: Idle limit for a push connection, 1 to 86400. Default: `60`
//! - `CRYPTACHAT_WRITE_TIMEOUT_SECS`: Per-write limit, 1 to 86400. Default: `10`
//! - `CRYPTACHAT_MAX_FRAME_BYTES`: Largest accepted inbound frame. Default: `4096`
//! - `CRYPTACHAT_RATE_LIMITS`: `on` or `off`. Default: `on`
//!
//! A `.env` file is loaded first when present, see `main.rs`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use cryptachat_relay::{ConnectionConfig, HubConfig};
use thiserror::Error;
use tracing::info;

/// Upper bound for the connection timers, in seconds.
const MAX_TIMER_SECS: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Per-route request quotas, per hour.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub register_per_hour: u32,
    pub login_per_hour: u32,
    pub request_chat_per_hour: u32,
    pub accept_chat_per_hour: u32,
    pub send_message_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            register_per_hour: 10,
            login_per_hour: 20,
            request_chat_per_hour: 30,
            accept_chat_per_hour: 30,
            send_message_per_hour: 100,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Database file; `None` keeps everything in memory.
    pub db_path: Option<String>,
    pub secret_key: String,
    pub token_ttl: TimeDelta,
    pub hub: HubConfig,
    pub connection: ConnectionConfig,
    pub rate_limits: RateLimitConfig,
}

impl ServerConfig {
    /// Configuration with defaults and the given signing key.
    pub fn with_secret(secret_key: impl Into<String>) -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5000,
            db_path: None,
            secret_key: secret_key.into(),
            token_ttl: TimeDelta::hours(24),
            hub: HubConfig::default(),
            connection: ConnectionConfig::default(),
            rate_limits: RateLimitConfig::default(),
        }
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secret_key = lookup("SECRET_KEY")
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::Missing("SECRET_KEY"))?;
        let mut config = Self::with_secret(secret_key);

        config.bind_addr = parse_or(&lookup, "CRYPTACHAT_BIND_ADDR", config.bind_addr)?;
        config.port = parse_or(&lookup, "PORT", config.port)?;
        config.db_path = lookup("CRYPTACHAT_DB_PATH").filter(|path| !path.is_empty());

        let ttl_hours: i64 = parse_or(&lookup, "CRYPTACHAT_TOKEN_TTL_HOURS", 24)?;
        config.token_ttl = TimeDelta::try_hours(ttl_hours)
            .filter(|ttl| *ttl > TimeDelta::zero())
            .ok_or_else(|| ConfigError::Invalid {
                name: "CRYPTACHAT_TOKEN_TTL_HOURS",
                value: ttl_hours.to_string(),
            })?;

        config.hub.job_queue_capacity =
            parse_or(&lookup, "CRYPTACHAT_JOB_QUEUE", config.hub.job_queue_capacity)?;

        let connection = &mut config.connection;
        connection.outbound_capacity =
            parse_or(&lookup, "CRYPTACHAT_OUTBOUND_QUEUE", connection.outbound_capacity)?;
        connection.pong_wait = parse_timer(&lookup, "CRYPTACHAT_PONG_WAIT_SECS", 60)?;
        connection.ping_period = connection.pong_wait - connection.pong_wait / 10;
        connection.write_timeout = parse_timer(&lookup, "CRYPTACHAT_WRITE_TIMEOUT_SECS", 10)?;
        connection.max_frame_bytes =
            parse_or(&lookup, "CRYPTACHAT_MAX_FRAME_BYTES", connection.max_frame_bytes)?;

        if let Some(value) = lookup("CRYPTACHAT_RATE_LIMITS") {
            config.rate_limits.enabled = match value.to_lowercase().as_str() {
                "on" | "true" | "1" => true,
                "off" | "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "CRYPTACHAT_RATE_LIMITS",
                        value,
                    })
                }
            };
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Log the effective configuration, without secrets.
    pub fn log_config(&self) {
        info!(
            listen = %self.listen_addr(),
            database = self.db_path.as_deref().unwrap_or(":memory:"),
            token_ttl_hours = self.token_ttl.num_hours(),
            outbound_queue = self.connection.outbound_capacity,
            job_queue = self.hub.job_queue_capacity,
            pong_wait_secs = self.connection.pong_wait.as_secs(),
            rate_limits = self.rate_limits.enabled,
            "Server configuration loaded"
        );
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) if !value.is_empty() => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        _ => Ok(default),
    }
}

/// Parse a timer in whole seconds, rejecting zero and anything over a day.
fn parse_timer(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default_secs: u64,
) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_or(lookup, name, default_secs)?;
    if secs == 0 || secs > MAX_TIMER_SECS {
        return Err(ConfigError::Invalid {
            name,
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
