//! Environment-driven configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use session_cache::CacheConfig;
use thiserror::Error;
use tracing::info;

use crate::dispatcher::DispatcherConfig;

/// Configuration parse failure; the process exits with code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Runtime configuration, read once at startup and threaded through as an
/// explicit dependency.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_url: String,
    pub cache_url: String,
    pub jwt_secret: String,
    pub jwt_alg: String,
    pub request_subject: String,
    pub raw_memory_subject: String,
    pub hot_msg_limit: usize,
    pub hot_ttl: Duration,
    pub idle_chunk_timeout: Duration,
    pub total_ticket_timeout: Duration,
    pub drain_timeout: Duration,
    pub stream_path: String,
    pub http_port: u16,
    pub metrics_port: u16,
    pub keepalive: Duration,
    pub http_deadline: Duration,
    pub startup_strict: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bus_url: var_or("BUS_URL", "nats://localhost:4222"),
            cache_url: var_or("CACHE_URL", "redis://localhost:6379"),
            jwt_secret: var_or("JWT_SECRET", "dev-secret-change-me"),
            jwt_alg: var_or("JWT_ALG", "HS256"),
            request_subject: var_or("REQUEST_SUBJECT", "chat.request"),
            raw_memory_subject: var_or("RAW_MEMORY_SUBJECT", "memory.raw"),
            hot_msg_limit: parse_or("HOT_MSG_LIMIT", 200)?,
            hot_ttl: Duration::from_secs(parse_or("HOT_TTL_MIN", 60u64)? * 60),
            idle_chunk_timeout: secs("IDLE_CHUNK_TIMEOUT", 120)?,
            total_ticket_timeout: secs("TOTAL_TICKET_TIMEOUT", 600)?,
            drain_timeout: secs("DRAIN_TIMEOUT", 10)?,
            stream_path: var_or("STREAM_PATH", "/v1/stream"),
            http_port: parse_or("HTTP_PORT", 8080)?,
            metrics_port: parse_or("METRICS_PORT", 9090)?,
            keepalive: secs("KEEPALIVE_SECS", 30)?,
            http_deadline: secs("HTTP_DEADLINE_SECS", 30)?,
            startup_strict: flag("STARTUP_STRICT"),
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            request_subject: self.request_subject.clone(),
            raw_memory_subject: self.raw_memory_subject.clone(),
            idle_chunk_timeout: self.idle_chunk_timeout,
            total_ticket_timeout: self.total_ticket_timeout,
            drain_timeout: self.drain_timeout,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            hot_msg_limit: self.hot_msg_limit,
            hot_ttl: self.hot_ttl,
        }
    }

    /// Log the effective configuration, secrets excluded.
    pub fn log(&self) {
        info!("configuration:");
        info!("  BUS_URL: {}", self.bus_url);
        info!("  CACHE_URL: {}", self.cache_url);
        info!("  REQUEST_SUBJECT: {}", self.request_subject);
        info!("  RAW_MEMORY_SUBJECT: {}", self.raw_memory_subject);
        info!("  STREAM_PATH: {}", self.stream_path);
        info!("  HTTP_PORT: {}", self.http_port);
        info!("  METRICS_PORT: {}", self.metrics_port);
        info!("  HOT_MSG_LIMIT: {}", self.hot_msg_limit);
        info!("  STARTUP_STRICT: {}", self.startup_strict);
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_or(key, default)?))
}

fn flag(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}
