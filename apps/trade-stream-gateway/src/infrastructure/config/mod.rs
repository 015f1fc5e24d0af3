//! Configuration Module
//!
//! Environment-driven configuration for the gateway and the CLI client.

mod settings;

pub use settings::{ClientConfig, ConfigError, GatewayConfig, ServerSettings, UpstreamSettings};
