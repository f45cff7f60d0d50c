//! Circuit breaker for order-submission failures.
//!
//! Counts consecutive entry/exit order failures. Any success resets the
//! counter; reaching the threshold trips the breaker, which halts the strategy
//! until an explicit restart calls [`CircuitBreaker::reset`].
//!
//! # Example
//!
//! ```
//! use updown_lifecycle::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default().with_max_consecutive_failures(2));
//! assert!(breaker.can_trade().is_ok());
//!
//! breaker.record_failure("rejected");
//! assert!(breaker.record_failure("rejected"));
//! assert!(breaker.can_trade().is_err());
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    /// Default: 5
    pub max_consecutive_failures: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
        }
    }
}

impl CircuitBreakerConfig {
    /// Builder method to set max consecutive failures.
    #[must_use]
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures.max(1);
        self
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
struct CircuitBreakerState {
    consecutive_failures: u32,
    successful_orders: u32,
    failed_orders: u32,
    trip: Option<CircuitBreakerError>,
    last_error: Option<String>,
}

/// Errors returned when trading is not allowed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Too many consecutive failures.
    #[error("Circuit breaker tripped after {failures} consecutive failures (max {max_failures})")]
    Tripped {
        /// Failure count when tripped.
        failures: u32,
        /// Configured threshold.
        max_failures: u32,
    },

    /// Tripped by an operator or an emergency path.
    #[error("Circuit breaker manually tripped")]
    ManuallyTripped,
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Thread-safe failure counter using `parking_lot::RwLock`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitBreakerState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("consecutive_failures", &state.consecutive_failures)
            .field("trip", &state.trip)
            .finish()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitBreakerState::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Checks if orders may be submitted.
    ///
    /// # Errors
    ///
    /// - `CircuitBreakerError::Tripped` - Failure threshold reached
    /// - `CircuitBreakerError::ManuallyTripped` - Tripped via [`Self::trip`]
    pub fn can_trade(&self) -> Result<(), CircuitBreakerError> {
        match &self.state.read().trip {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Records a successful order. Resets the consecutive counter but does not
    /// un-trip a tripped breaker.
    pub fn record_success(&self) {
        let mut state = self.state.write();
        state.consecutive_failures = 0;
        state.successful_orders = state.successful_orders.saturating_add(1);
    }

    /// Records an order failure.
    ///
    /// Returns `true` if this failure tripped the breaker.
    pub fn record_failure(&self, reason: impl Into<String>) -> bool {
        let mut state = self.state.write();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.failed_orders = state.failed_orders.saturating_add(1);
        state.last_error = Some(reason.into());

        if state.trip.is_none() && state.consecutive_failures >= self.config.max_consecutive_failures {
            state.trip = Some(CircuitBreakerError::Tripped {
                failures: state.consecutive_failures,
                max_failures: self.config.max_consecutive_failures,
            });
            return true;
        }
        false
    }

    /// Clears all state. Called on restart.
    pub fn reset(&self) {
        *self.state.write() = CircuitBreakerState::default();
    }

    pub fn trip(&self) {
        let mut state = self.state.write();
        if state.trip.is_none() {
            state.trip = Some(CircuitBreakerError::ManuallyTripped);
        }
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.state.read().trip.is_some()
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state.read().consecutive_failures
    }

    #[must_use]
    pub fn failed_orders(&self) -> u32 {
        self.state.read().failed_orders
    }

    #[must_use]
    pub fn successful_orders(&self) -> u32 {
        self.state.read().successful_orders
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Configuration Tests ====================

    #[test]
    fn test_config_default_values() {
        assert_eq!(CircuitBreakerConfig::default().max_consecutive_failures, 5);
    }

    #[test]
    fn test_config_threshold_is_at_least_one() {
        let config = CircuitBreakerConfig::default().with_max_consecutive_failures(0);
        assert_eq!(config.max_consecutive_failures, 1);
    }

    // ==================== Failure Counting Tests ====================

    #[test]
    fn test_trips_on_fifth_failure() {
        let breaker = CircuitBreaker::default();

        for _ in 0..4 {
            assert!(!breaker.record_failure("rejected"));
            assert!(breaker.can_trade().is_ok());
        }
        assert!(breaker.record_failure("rejected"));
        assert_eq!(
            breaker.can_trade(),
            Err(CircuitBreakerError::Tripped {
                failures: 5,
                max_failures: 5,
            })
        );
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.record_failure("timeout");
        }
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.failed_orders(), 4);

        for _ in 0..4 {
            assert!(!breaker.record_failure("timeout"));
        }
        assert!(breaker.can_trade().is_ok());
    }

    #[test]
    fn test_success_does_not_untrip() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default().with_max_consecutive_failures(1),
        );
        assert!(breaker.record_failure("rejected"));
        breaker.record_success();

        assert!(breaker.is_tripped());
        assert_eq!(
            breaker.can_trade(),
            Err(CircuitBreakerError::Tripped {
                failures: 1,
                max_failures: 1,
            })
        );
    }

    #[test]
    fn test_trip_reports_only_once() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default().with_max_consecutive_failures(2),
        );
        breaker.record_failure("a");
        assert!(breaker.record_failure("b"));
        assert!(!breaker.record_failure("c"));
        assert_eq!(breaker.last_error().as_deref(), Some("c"));
    }

    // ==================== Reset Tests ====================

    #[test]
    fn test_reset_clears_trip() {
        let breaker = CircuitBreaker::default();
        breaker.trip();
        assert_eq!(breaker.can_trade(), Err(CircuitBreakerError::ManuallyTripped));

        breaker.reset();
        assert!(breaker.can_trade().is_ok());
        assert_eq!(breaker.failed_orders(), 0);
        assert!(breaker.last_error().is_none());
    }
}
