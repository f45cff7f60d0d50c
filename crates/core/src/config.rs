use crate::types::Direction;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Price units per unit of probability. Strategy thresholds are expressed in
/// price units (0-100), gateway quotes in probability (0-1).
pub const PRICE_UNITS: Decimal = dec!(100);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub strategy: StrategyConfig,
    pub lifecycle: LifecycleConfig,
    pub redemption: RedemptionConfig,
    pub paper: PaperConfig,
}

// =============================================================================
// Strategy
// =============================================================================

/// User-defined thresholds for entering and exiting positions.
///
/// Prices are in price units (0-100). Distances are in the underlying asset's
/// price units (e.g. USD for BTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Whether the strategy may open new positions.
    pub enabled: bool,
    /// Outcome price at which an entry is triggered.
    pub entry_price: Decimal,
    /// Bid at which all positions are closed with maker sells.
    pub profit_target_price: Decimal,
    /// Bid at which all positions are closed with taker sells.
    pub stop_loss_price: Decimal,
    /// Collateral committed per entry.
    pub trade_size: Decimal,
    /// Minimum |current - price to beat| required before entering.
    pub price_difference: Option<Decimal>,
    /// Cancel resting entries when the distance to the price to beat drops below this.
    pub flip_guard_pending_distance: Option<Decimal>,
    /// Emergency-close open positions when the distance drops below this.
    pub flip_guard_filled_distance: Option<Decimal>,
    /// Entries are only allowed once the market has less than this many seconds left.
    pub entry_time_remaining_max_secs: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            entry_price: dec!(96),
            profit_target_price: dec!(99),
            stop_loss_price: dec!(91),
            trade_size: dec!(2),
            price_difference: None,
            flip_guard_pending_distance: Some(dec!(10)),
            flip_guard_filled_distance: Some(dec!(5)),
            entry_time_remaining_max_secs: 180,
        }
    }
}

impl StrategyConfig {
    /// Converts a price-unit value (0-100) into a probability price (0-1).
    #[must_use]
    pub fn to_probability(units: Decimal) -> Decimal {
        units / PRICE_UNITS
    }

    /// Probability price an outcome must reach to trigger an entry.
    #[must_use]
    pub fn entry_threshold(&self) -> Decimal {
        Self::to_probability(self.entry_price)
    }

    /// Limit price for the maker entry order: one price unit below the trigger.
    #[must_use]
    pub fn entry_limit_price(&self) -> Decimal {
        Self::to_probability(self.entry_price - Decimal::ONE)
    }

    #[must_use]
    pub fn profit_target(&self) -> Decimal {
        Self::to_probability(self.profit_target_price)
    }

    #[must_use]
    pub fn stop_loss(&self) -> Decimal {
        Self::to_probability(self.stop_loss_price)
    }

    /// Checks that thresholds are within range and mutually consistent.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entry_price <= Decimal::ONE || self.entry_price > PRICE_UNITS {
            return Err(ConfigError::InvalidPrice {
                field: "entry_price",
                value: self.entry_price,
            });
        }
        if self.profit_target_price <= Decimal::ZERO || self.profit_target_price > PRICE_UNITS {
            return Err(ConfigError::InvalidPrice {
                field: "profit_target_price",
                value: self.profit_target_price,
            });
        }
        if self.stop_loss_price < Decimal::ZERO || self.stop_loss_price >= PRICE_UNITS {
            return Err(ConfigError::InvalidPrice {
                field: "stop_loss_price",
                value: self.stop_loss_price,
            });
        }
        if self.stop_loss_price >= self.profit_target_price {
            return Err(ConfigError::InvertedThresholds {
                stop_loss: self.stop_loss_price,
                profit_target: self.profit_target_price,
            });
        }
        if self.trade_size <= Decimal::ZERO {
            return Err(ConfigError::InvalidTradeSize(self.trade_size));
        }

        let distances = [
            ("price_difference", self.price_difference),
            ("flip_guard_pending_distance", self.flip_guard_pending_distance),
            ("flip_guard_filled_distance", self.flip_guard_filled_distance),
        ];
        for (field, value) in distances {
            if let Some(value) = value {
                if value < Decimal::ZERO {
                    return Err(ConfigError::NegativeDistance { field, value });
                }
            }
        }

        Ok(())
    }
}

/// Invalid strategy configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} out of range: {value}")]
    InvalidPrice { field: &'static str, value: Decimal },

    #[error("stop loss {stop_loss} must be below profit target {profit_target}")]
    InvertedThresholds {
        stop_loss: Decimal,
        profit_target: Decimal,
    },

    #[error("trade size must be positive, got {0}")]
    InvalidTradeSize(Decimal),

    #[error("{field} must not be negative, got {value}")]
    NegativeDistance { field: &'static str, value: Decimal },
}

// =============================================================================
// Lifecycle tunables
// =============================================================================

/// Engine constants that are not user strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Consecutive order failures before the circuit breaker halts trading.
    pub max_consecutive_failures: u32,
    /// In-flight flags older than this are force-cleared.
    pub exit_in_flight_timeout_secs: u64,
    /// Tolerance (price units) when comparing a bid against the profit target.
    pub price_epsilon: Decimal,
    /// Maximum share of the known balance that may be exposed.
    pub max_exposure_fraction: Decimal,
    /// Side chosen when both outcomes qualify for entry on the same tick.
    pub entry_tie_break: Direction,
    /// Delay before the stop-loss retry pass.
    pub stop_loss_retry_delay_ms: u64,
    /// Price used for the last-resort emergency sell pass.
    pub min_tick: Decimal,
    pub tick_interval_ms: u64,
    pub tick_error_backoff_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            exit_in_flight_timeout_secs: 30,
            price_epsilon: dec!(0.01),
            max_exposure_fraction: dec!(0.5),
            entry_tie_break: Direction::Up,
            stop_loss_retry_delay_ms: 500,
            min_tick: dec!(0.01),
            tick_interval_ms: 1_000,
            tick_error_backoff_ms: 2_000,
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn in_flight_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_in_flight_timeout_secs)
    }

    #[must_use]
    pub fn stop_loss_retry_delay(&self) -> Duration {
        Duration::from_millis(self.stop_loss_retry_delay_ms)
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub fn tick_error_backoff(&self) -> Duration {
        Duration::from_millis(self.tick_error_backoff_ms)
    }

    /// Profit-target tolerance as a probability price.
    #[must_use]
    pub fn price_epsilon_probability(&self) -> Decimal {
        StrategyConfig::to_probability(self.price_epsilon)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedemptionConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for RedemptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl RedemptionConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Settings for the in-process paper gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    /// Starting collateral balance.
    pub initial_balance: Decimal,
    /// Probability that a taker order fills when it crosses the quote.
    pub fill_rate: f64,
    /// Artificial delay applied to order submission and cancellation.
    pub simulate_latency_ms: u64,
    /// Taker fee rate reported for every token.
    pub fee_rate_bps: u32,
    /// Seed for reproducible fill decisions.
    pub random_seed: Option<u64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(100),
            fill_rate: 1.0,
            simulate_latency_ms: 0,
            fee_rate_bps: 0,
            random_seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_defaults_are_valid() {
        assert!(StrategyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_price_conversions() {
        let config = StrategyConfig::default();
        assert_eq!(config.entry_threshold(), dec!(0.96));
        assert_eq!(config.entry_limit_price(), dec!(0.95));
        assert_eq!(config.profit_target(), dec!(0.99));
        assert_eq!(config.stop_loss(), dec!(0.91));
    }

    #[test]
    fn test_validate_rejects_entry_price_at_floor() {
        let config = StrategyConfig {
            entry_price: dec!(1),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPrice {
                field: "entry_price",
                value: dec!(1),
            })
        );
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = StrategyConfig {
            stop_loss_price: dec!(99),
            profit_target_price: dec!(95),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvertedThresholds { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_non_positive_trade_size() {
        let config = StrategyConfig {
            trade_size: Decimal::ZERO,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTradeSize(Decimal::ZERO))
        );
    }

    #[test]
    fn test_validate_rejects_negative_distance() {
        let config = StrategyConfig {
            flip_guard_filled_distance: Some(dec!(-1)),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NegativeDistance {
                field: "flip_guard_filled_distance",
                ..
            })
        ));
    }

    #[test]
    fn test_lifecycle_defaults() {
        let config = LifecycleConfig::default();
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(config.in_flight_timeout(), Duration::from_secs(30));
        assert_eq!(config.price_epsilon_probability(), dec!(0.0001));
        assert_eq!(config.entry_tie_break, Direction::Up);
    }

    #[test]
    fn test_app_config_deserializes_partial_json() {
        let json = r#"{"strategy": {"enabled": true, "entry_price": "95"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert!(config.strategy.enabled);
        assert_eq!(config.strategy.entry_price, dec!(95));
        assert_eq!(config.strategy.stop_loss_price, dec!(91));
        assert_eq!(config.redemption.interval_secs, 60);
    }
}
