//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the trade data service and the port interfaces
//! that decouple it from the upstream transport.

/// Port interfaces for external systems.
pub mod ports;

/// Application services (trade data orchestration).
pub mod services;
