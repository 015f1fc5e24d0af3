//! Retry and Backoff
//!
//! Backoff schedules and a cancellable retry loop used to (re)establish
//! WebSocket transports.

pub mod backoff;
pub mod executor;

pub use backoff::{
    BackoffConfig, BackoffError, BackoffKind, BackoffStrategy, ExponentialBackoff, LinearBackoff,
};
pub use executor::{RetryError, RetryExecutor};
