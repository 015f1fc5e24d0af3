//! Domain Layer - Core trade types and subscription bookkeeping.
//!
//! This layer holds the canonical trade model and the reference-count
//! multiplexer. Nothing here performs I/O; types carry serialization
//! support only.

/// Trade event types, instruments and connection state.
pub mod streaming;

/// Reference-counted subscription multiplexing.
pub mod subscription;
