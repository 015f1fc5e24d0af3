//! Backoff Strategies
//!
//! Pure delay schedules for consecutive retry attempts. Both variants are
//! capped at a maximum delay and return the initial delay for attempt 0.
//! [`BackoffConfig::build`] rejects parameters that would make either
//! property depend on the cap.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Computes the delay to wait before a retry attempt.
pub trait BackoffStrategy: Send + Sync + Debug {
    /// Delay for the given attempt number (0-based).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Which schedule to build from a [`BackoffConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    /// `initial * multiplier^attempt`.
    #[default]
    Exponential,
    /// `initial + increment * attempt`.
    Linear,
}

impl BackoffKind {
    /// Parse from a config string, defaulting to exponential.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "linear" => Self::Linear,
            _ => Self::Exponential,
        }
    }

    /// Config name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
        }
    }
}

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Schedule variant.
    pub kind: BackoffKind,
    /// Delay for attempt 0.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
    /// Step for linear backoff.
    pub increment: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            increment: Duration::from_secs(1),
        }
    }
}

/// Rejected backoff parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    /// The first delay would already be capped.
    #[error("initial delay {initial:?} exceeds max delay {max:?}")]
    InitialExceedsMax {
        /// Configured initial delay.
        initial: Duration,
        /// Configured max delay.
        max: Duration,
    },
    /// Exponential delays would shrink, or the factor is not a number.
    #[error("backoff multiplier must be a finite number >= 1, got {0}")]
    InvalidMultiplier(f64),
}

impl BackoffConfig {
    /// Check the parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if `initial_delay > max_delay`, or if the multiplier
    /// is below 1 or not finite. The multiplier is checked for exponential
    /// schedules only.
    pub fn validate(&self) -> Result<(), BackoffError> {
        if self.initial_delay > self.max_delay {
            return Err(BackoffError::InitialExceedsMax {
                initial: self.initial_delay,
                max: self.max_delay,
            });
        }
        let multiplier_ok = self.multiplier.is_finite() && self.multiplier >= 1.0;
        if self.kind == BackoffKind::Exponential && !multiplier_ok {
            return Err(BackoffError::InvalidMultiplier(self.multiplier));
        }
        Ok(())
    }

    /// Build the configured strategy.
    ///
    /// # Errors
    ///
    /// Returns the [`validate`](Self::validate) error for invalid parameters.
    pub fn build(&self) -> Result<Arc<dyn BackoffStrategy>, BackoffError> {
        self.validate()?;
        Ok(match self.kind {
            BackoffKind::Exponential => Arc::new(ExponentialBackoff::new(
                self.initial_delay,
                self.max_delay,
                self.multiplier,
            )),
            BackoffKind::Linear => Arc::new(LinearBackoff::new(
                self.initial_delay,
                self.max_delay,
                self.increment,
            )),
        })
    }
}

/// `min(initial * multiplier^attempt, max)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Create an exponential schedule.
    #[must_use]
    pub const fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let (initial_nanos, max_nanos) = (
            self.initial_delay.as_nanos() as f64,
            self.max_delay.as_nanos() as f64,
        );
        let scaled = (initial_nanos * self.multiplier.powi(exponent)).round();

        // NaN or infinite growth saturates at the cap
        if !scaled.is_finite() || scaled >= max_nanos {
            return self.max_delay;
        }
        if scaled <= 0.0 {
            return Duration::ZERO;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nanos = scaled as u64;
        Duration::from_nanos(nanos)
    }
}

/// `min(initial + increment * attempt, max)`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    increment: Duration,
}

impl LinearBackoff {
    /// Create a linear schedule.
    #[must_use]
    pub const fn new(initial_delay: Duration, max_delay: Duration, increment: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            increment,
        }
    }
}

impl BackoffStrategy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.increment
            .checked_mul(attempt)
            .and_then(|step| self.initial_delay.checked_add(step))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
