// 7.0 config.rs: exchange-wide params in one place. governance updates these through
// Engine::update_params, which runs validate() first.
// 7.1 presets per environment, json loading for node config files.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeParams {
    // max resting orders per (market, subaccount, side), vanilla + reduce-only + conditional
    pub max_derivative_order_side_count: u32,
    // post-only mode is active while block height < this
    pub post_only_mode_height_threshold: u64,
    // share of a positive liquidation payout that goes to the liquidator
    pub liquidator_reward_share_rate: Decimal,
    // taker fee multiplier for atomic market orders
    pub atomic_market_order_fee_multiplier: Decimal,
    // share of trading fees paid to the order's fee recipient
    pub relayer_fee_share_rate: Decimal,
    pub default_hourly_funding_rate_cap: Decimal,
    pub default_hourly_interest_rate: Decimal,
    pub funding_interval_secs: i64,
    // bound on the parallel conditional trigger scan
    pub trigger_scan_workers: usize,
    pub max_events: usize,
}

impl Default for ExchangeParams {
    fn default() -> Self {
        Self {
            max_derivative_order_side_count: 20,
            post_only_mode_height_threshold: 0,
            liquidator_reward_share_rate: dec!(0.5),
            atomic_market_order_fee_multiplier: dec!(2.5),
            relayer_fee_share_rate: dec!(0.4),
            default_hourly_funding_rate_cap: dec!(0.000625),
            default_hourly_interest_rate: dec!(0.000004166666666667),
            funding_interval_secs: 3600,
            trigger_scan_workers: 4,
            max_events: 100_000,
        }
    }
}

impl ExchangeParams {
    pub fn testnet() -> Self {
        Self {
            max_derivative_order_side_count: 50,
            liquidator_reward_share_rate: dec!(0.5),
            relayer_fee_share_rate: dec!(0),
            ..Self::default()
        }
    }

    pub fn mainnet() -> Self {
        Self {
            max_derivative_order_side_count: 20,
            atomic_market_order_fee_multiplier: dec!(2),
            trigger_scan_workers: 8,
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let params: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn is_post_only_mode(&self, height: u64) -> bool {
        height < self.post_only_mode_height_threshold
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_derivative_order_side_count == 0 {
            return Err(ConfigError::InvalidParam {
                reason: "order side count must be positive".to_string(),
            });
        }

        if self.liquidator_reward_share_rate < Decimal::ZERO
            || self.liquidator_reward_share_rate > Decimal::ONE
        {
            return Err(ConfigError::InvalidParam {
                reason: "liquidator reward share rate must be within [0, 1]".to_string(),
            });
        }

        if self.relayer_fee_share_rate < Decimal::ZERO || self.relayer_fee_share_rate > Decimal::ONE {
            return Err(ConfigError::InvalidParam {
                reason: "relayer fee share rate must be within [0, 1]".to_string(),
            });
        }

        if self.atomic_market_order_fee_multiplier < Decimal::ONE {
            return Err(ConfigError::InvalidParam {
                reason: "atomic fee multiplier must be at least 1".to_string(),
            });
        }

        if self.default_hourly_funding_rate_cap <= Decimal::ZERO {
            return Err(ConfigError::InvalidParam {
                reason: "funding rate cap must be positive".to_string(),
            });
        }

        if self.funding_interval_secs <= 0 {
            return Err(ConfigError::InvalidParam {
                reason: "funding interval must be positive".to_string(),
            });
        }

        if self.trigger_scan_workers == 0 {
            return Err(ConfigError::InvalidParam {
                reason: "trigger scan needs at least one worker".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid exchange param: {reason}")]
    InvalidParam { reason: String },

    #[error("malformed params json: {0}")]
    Parse(String),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn params(&self) -> ExchangeParams {
        match self {
            Environment::Development => ExchangeParams::default(),
            Environment::Testnet => ExchangeParams::testnet(),
            Environment::Mainnet => ExchangeParams::mainnet(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        assert!(Environment::Development.params().validate().is_ok());
        assert!(Environment::Testnet.params().validate().is_ok());
        assert!(Environment::Mainnet.params().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_share_rate() {
        let params = ExchangeParams {
            liquidator_reward_share_rate: dec!(1.5),
            ..ExchangeParams::default()
        };
        assert!(matches!(params.validate(), Err(ConfigError::InvalidParam { .. })));
    }

    #[test]
    fn post_only_mode_is_height_bounded() {
        let params = ExchangeParams {
            post_only_mode_height_threshold: 100,
            ..ExchangeParams::default()
        };
        assert!(params.is_post_only_mode(99));
        assert!(!params.is_post_only_mode(100));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let params = ExchangeParams::from_json(r#"{"max_derivative_order_side_count": 7}"#).unwrap();
        assert_eq!(params.max_derivative_order_side_count, 7);
        assert_eq!(params.funding_interval_secs, 3600);
    }

    #[test]
    fn json_round_trip() {
        let params = ExchangeParams::mainnet();
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(ExchangeParams::from_json(&json).unwrap(), params);
    }
}
