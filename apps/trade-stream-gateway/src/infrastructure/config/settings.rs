//! Gateway Configuration Settings
//!
//! Configuration types loaded from environment variables. Unparseable
//! optional values fall back to their defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::infrastructure::retry::{BackoffConfig, BackoffError, BackoffKind};
use crate::infrastructure::rpc::DEFAULT_RPC_TIMEOUT;
use crate::infrastructure::upstream::{DEFAULT_EVENT_CAPACITY, UpstreamConfig};

/// Default gateway endpoint for the CLI.
pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:8080/ws";

/// Upstream feed settings.
#[derive(Clone)]
pub struct UpstreamSettings {
    /// Feed WebSocket URL.
    pub url: String,
    /// Optional auth token.
    pub token: Option<String>,
}

impl std::fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Downstream WebSocket port.
    pub gateway_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            gateway_port: 8080,
            health_port: 8082,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upstream feed settings.
    pub upstream: UpstreamSettings,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Server ports.
    pub server: ServerSettings,
    /// Capacity of event broadcast channels.
    pub event_capacity: usize,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `UPSTREAM_URL` is missing or empty, or if the
    /// backoff parameters are inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(vars: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = vars("UPSTREAM_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("UPSTREAM_URL".to_string()))?;
        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("UPSTREAM_URL".to_string()));
        }

        let token = vars("UPSTREAM_TOKEN").filter(|t| !t.is_empty());

        let defaults = ServerSettings::default();
        let server = ServerSettings {
            gateway_port: parse_or(&vars, "GATEWAY_PORT", defaults.gateway_port),
            health_port: parse_or(&vars, "GATEWAY_HEALTH_PORT", defaults.health_port),
        };

        let backoff = backoff_from(&vars);
        backoff.validate()?;

        Ok(Self {
            upstream: UpstreamSettings { url, token },
            backoff,
            server,
            event_capacity: parse_or(&vars, "GATEWAY_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY),
        })
    }

    /// Connector settings derived from this configuration.
    #[must_use]
    pub fn upstream_config(&self) -> UpstreamConfig {
        let mut config = UpstreamConfig::new(self.upstream.url.clone());
        config.token.clone_from(&self.upstream.token);
        config.event_capacity = self.event_capacity;
        config
    }
}

/// CLI client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway WebSocket URL.
    pub gateway_url: String,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Per-call timeout.
    pub rpc_timeout: Duration,
}

impl ClientConfig {
    /// Create configuration from environment variables. Never fails.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(vars: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            gateway_url: vars("GATEWAY_URL")
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            backoff: backoff_from(&vars),
            rpc_timeout: parse_millis_or(&vars, "RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Backoff variables do not form a valid schedule.
    #[error("invalid backoff settings: {0}")]
    InvalidBackoff(#[from] BackoffError),
}

fn backoff_from(vars: &impl Fn(&str) -> Option<String>) -> BackoffConfig {
    let defaults = BackoffConfig::default();
    BackoffConfig {
        kind: vars("BACKOFF_STRATEGY")
            .map(|s| BackoffKind::from_str_case_insensitive(&s))
            .unwrap_or_default(),
        initial_delay: parse_millis_or(vars, "BACKOFF_INITIAL_DELAY_MS", defaults.initial_delay),
        max_delay: parse_millis_or(vars, "BACKOFF_MAX_DELAY_MS", defaults.max_delay),
        multiplier: parse_or(vars, "BACKOFF_MULTIPLIER", defaults.multiplier),
        increment: parse_millis_or(vars, "BACKOFF_INCREMENT_MS", defaults.increment),
    }
}

fn parse_or<T: FromStr>(vars: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    vars(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_millis_or(
    vars: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    vars(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
