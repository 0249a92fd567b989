//! Market records.
//!
//! A market is an immutable identity (ticker, quote denom, oracle, kind) plus
//! mutable risk parameters and a lifecycle status. The id is a sha256 digest of
//! the identity, so relaunching the same market always yields the same id.

use crate::types::{Address, MarketId, Price, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Active → {Paused, Expired} → Demolished. Demolished is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    Active,
    Paused,
    Expired,
    Demolished,
}

impl Default for MarketStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl MarketStatus {
    /// Markets are stored in the enabled bucket only while Active.
    pub fn is_enabled(&self) -> bool {
        matches!(self, MarketStatus::Active)
    }

    pub fn can_transition_to(&self, next: MarketStatus) -> bool {
        use MarketStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Active, Paused) | (Active, Expired) | (Active, Demolished) => true,
            (Paused, Active) | (Paused, Demolished) => true,
            (Expired, Demolished) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OracleType {
    PriceFeed,
    Provider,
    Pyth,
    Band,
}

impl OracleType {
    fn tag(&self) -> &'static [u8] {
        match self {
            OracleType::PriceFeed => b"pricefeed",
            OracleType::Provider => b"provider",
            OracleType::Pyth => b"pyth",
            OracleType::Band => b"band",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleRef {
    pub base: String,
    pub quote: String,
    pub oracle_type: OracleType,
}

impl OracleRef {
    pub fn new(base: &str, quote: &str, oracle_type: OracleType) -> Self {
        Self {
            base: base.to_string(),
            quote: quote.to_string(),
            oracle_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpetualInfo {
    pub hourly_funding_rate_cap: Decimal,
    pub hourly_interest_rate: Decimal,
    pub funding_interval_secs: i64,
    pub next_funding_timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiryFuturesInfo {
    pub expiration_timestamp: Timestamp,
    // moves to the block time once the twap window opens
    pub twap_start_timestamp: Timestamp,
    pub twap_start_price_cumulative: Decimal,
    pub settlement_price: Option<Decimal>,
}

pub const EXPIRY_TWAP_WINDOW_SECS: i64 = 30 * 60;

impl ExpiryFuturesInfo {
    pub fn new(expiration_timestamp: Timestamp) -> Self {
        Self {
            expiration_timestamp,
            twap_start_timestamp: expiration_timestamp.plus_secs(-EXPIRY_TWAP_WINDOW_SECS),
            twap_start_price_cumulative: Decimal::ZERO,
            settlement_price: None,
        }
    }

    pub fn is_premature(&self, now: Timestamp) -> bool {
        now < self.twap_start_timestamp
    }

    pub fn is_starting_maturation(&self, now: Timestamp) -> bool {
        now >= self.twap_start_timestamp && self.twap_start_price_cumulative.is_zero()
    }

    pub fn is_matured(&self, now: Timestamp) -> bool {
        now >= self.expiration_timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryOptionsInfo {
    pub expiration_timestamp: Timestamp,
    pub settlement_timestamp: Timestamp,
    // set by the admin; None at settlement time means refund
    pub settlement_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketKind {
    Perpetual(PerpetualInfo),
    ExpiryFuture(ExpiryFuturesInfo),
    BinaryOption(BinaryOptionsInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketType {
    Perpetual,
    ExpiryFuture,
    BinaryOption,
}

impl MarketKind {
    pub fn market_type(&self) -> MarketType {
        match self {
            MarketKind::Perpetual(_) => MarketType::Perpetual,
            MarketKind::ExpiryFuture(_) => MarketType::ExpiryFuture,
            MarketKind::BinaryOption(_) => MarketType::BinaryOption,
        }
    }
}

/// Governance-mutable risk parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParams {
    pub initial_margin_ratio: Decimal,
    pub maintenance_margin_ratio: Decimal,
    // floor on margin after a decrease, as a fraction of notional at mark
    pub reduce_margin_ratio: Decimal,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub min_price_tick_size: Decimal,
    pub min_quantity_tick_size: Decimal,
    pub min_notional: Decimal,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            initial_margin_ratio: dec!(0.05),
            maintenance_margin_ratio: dec!(0.02),
            reduce_margin_ratio: dec!(0.08),
            maker_fee_rate: dec!(-0.0001),
            taker_fee_rate: dec!(0.001),
            min_price_tick_size: dec!(0.01),
            min_quantity_tick_size: dec!(0.001),
            min_notional: Decimal::ZERO,
        }
    }
}

impl RiskParams {
    pub fn binary_options() -> Self {
        Self {
            initial_margin_ratio: Decimal::ONE,
            maintenance_margin_ratio: Decimal::ZERO,
            reduce_margin_ratio: Decimal::ONE,
            maker_fee_rate: Decimal::ZERO,
            taker_fee_rate: dec!(0.001),
            min_price_tick_size: dec!(0.01),
            min_quantity_tick_size: Decimal::ONE,
            min_notional: Decimal::ZERO,
        }
    }

    pub fn validate(&self, relayer_fee_share_rate: Decimal) -> Result<(), MarketError> {
        if self.initial_margin_ratio <= self.maintenance_margin_ratio {
            return Err(MarketError::InvalidMarginRatio {
                initial: self.initial_margin_ratio,
                maintenance: self.maintenance_margin_ratio,
            });
        }
        if self.maintenance_margin_ratio < Decimal::ZERO || self.initial_margin_ratio > Decimal::ONE {
            return Err(MarketError::InvalidMarginRatio {
                initial: self.initial_margin_ratio,
                maintenance: self.maintenance_margin_ratio,
            });
        }
        if self.reduce_margin_ratio < self.initial_margin_ratio {
            return Err(MarketError::InvalidReduceMarginRatio(self.reduce_margin_ratio));
        }
        if self.taker_fee_rate < Decimal::ZERO || self.taker_fee_rate >= Decimal::ONE {
            return Err(MarketError::InvalidFeeRate(self.taker_fee_rate));
        }
        // maker rebates are paid out of the taker fee left after the relayer share
        let max_rebate = self.taker_fee_rate * (Decimal::ONE - relayer_fee_share_rate);
        if self.maker_fee_rate >= Decimal::ONE || -self.maker_fee_rate > max_rebate {
            return Err(MarketError::InvalidFeeRate(self.maker_fee_rate));
        }
        if self.maker_fee_rate > self.taker_fee_rate {
            return Err(MarketError::InvalidFeeRate(self.maker_fee_rate));
        }
        if self.min_price_tick_size <= Decimal::ZERO || self.min_quantity_tick_size <= Decimal::ZERO {
            return Err(MarketError::InvalidTickSize);
        }
        if self.min_notional < Decimal::ZERO {
            return Err(MarketError::BelowMinNotional {
                notional: self.min_notional,
                minimum: Decimal::ZERO,
            });
        }
        Ok(())
    }

    /// `validate` plus the per-kind bound: only binary options may hold full collateral.
    pub fn validate_for(&self, market_type: MarketType, relayer_fee_share_rate: Decimal) -> Result<(), MarketError> {
        self.validate(relayer_fee_share_rate)?;
        if market_type != MarketType::BinaryOption && self.initial_margin_ratio >= Decimal::ONE {
            return Err(MarketError::InvalidMarginRatio {
                initial: self.initial_margin_ratio,
                maintenance: self.maintenance_margin_ratio,
            });
        }
        Ok(())
    }
}

/// Partial update from a governance proposal; None keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketParamUpdate {
    pub initial_margin_ratio: Option<Decimal>,
    pub maintenance_margin_ratio: Option<Decimal>,
    pub reduce_margin_ratio: Option<Decimal>,
    pub maker_fee_rate: Option<Decimal>,
    pub taker_fee_rate: Option<Decimal>,
    pub min_price_tick_size: Option<Decimal>,
    pub min_quantity_tick_size: Option<Decimal>,
    pub min_notional: Option<Decimal>,
    pub hourly_funding_rate_cap: Option<Decimal>,
    pub hourly_interest_rate: Option<Decimal>,
    pub status: Option<MarketStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeMarket {
    pub market_id: MarketId,
    pub ticker: String,
    pub quote_denom: String,
    pub oracle: OracleRef,
    pub kind: MarketKind,
    pub params: RiskParams,
    pub status: MarketStatus,
    pub admin: Option<Address>,
}

impl DerivativeMarket {
    pub fn derive_id(ticker: &str, quote_denom: &str, oracle: &OracleRef, kind: &MarketKind) -> MarketId {
        let (tag, extra): (&[u8], Vec<u8>) = match kind {
            MarketKind::Perpetual(_) => (b"perpetual", Vec::new()),
            MarketKind::ExpiryFuture(info) => (
                b"expiry",
                info.expiration_timestamp.as_secs().to_be_bytes().to_vec(),
            ),
            MarketKind::BinaryOption(info) => (
                b"binary",
                info.expiration_timestamp.as_secs().to_be_bytes().to_vec(),
            ),
        };
        MarketId::derive(&[
            tag,
            ticker.as_bytes(),
            quote_denom.as_bytes(),
            oracle.base.as_bytes(),
            oracle.quote.as_bytes(),
            oracle.oracle_type.tag(),
            &extra,
        ])
    }

    pub fn new(
        ticker: &str,
        quote_denom: &str,
        oracle: OracleRef,
        kind: MarketKind,
        params: RiskParams,
    ) -> Self {
        let market_id = Self::derive_id(ticker, quote_denom, &oracle, &kind);
        Self {
            market_id,
            ticker: ticker.to_string(),
            quote_denom: quote_denom.to_string(),
            oracle,
            kind,
            params,
            status: MarketStatus::Active,
            admin: None,
        }
    }

    pub fn market_type(&self) -> MarketType {
        self.kind.market_type()
    }

    pub fn is_active(&self) -> bool {
        self.status == MarketStatus::Active
    }

    pub fn is_perpetual(&self) -> bool {
        matches!(self.kind, MarketKind::Perpetual(_))
    }

    pub fn is_binary_option(&self) -> bool {
        matches!(self.kind, MarketKind::BinaryOption(_))
    }

    pub fn is_time_expiry(&self) -> bool {
        matches!(self.kind, MarketKind::ExpiryFuture(_))
    }

    pub fn perpetual_info(&self) -> Option<&PerpetualInfo> {
        match &self.kind {
            MarketKind::Perpetual(info) => Some(info),
            _ => None,
        }
    }

    pub fn expiry_info(&self) -> Option<&ExpiryFuturesInfo> {
        match &self.kind {
            MarketKind::ExpiryFuture(info) => Some(info),
            _ => None,
        }
    }

    pub fn binary_info(&self) -> Option<&BinaryOptionsInfo> {
        match &self.kind {
            MarketKind::BinaryOption(info) => Some(info),
            _ => None,
        }
    }

    /// Maker rate for resting orders, taker rate otherwise; atomic orders pay a multiple.
    pub fn fee_rate(&self, is_maker: bool, is_atomic: bool, atomic_multiplier: Decimal) -> Decimal {
        if is_maker {
            self.params.maker_fee_rate
        } else if is_atomic {
            self.params.taker_fee_rate * atomic_multiplier
        } else {
            self.params.taker_fee_rate
        }
    }

    pub fn validate_price(&self, price: Price) -> Result<(), MarketError> {
        let tick = self.params.min_price_tick_size;
        if !(price.value() % tick).is_zero() {
            return Err(MarketError::PriceNotOnTick { price: price.value(), tick });
        }
        if self.is_binary_option() && price.value() >= Decimal::ONE {
            return Err(MarketError::BinaryOptionPriceOutOfBounds(price.value()));
        }
        Ok(())
    }

    pub fn validate_quantity(&self, quantity: Decimal) -> Result<(), MarketError> {
        let tick = self.params.min_quantity_tick_size;
        if quantity <= Decimal::ZERO || !(quantity % tick).is_zero() {
            return Err(MarketError::QuantityNotOnTick { quantity, tick });
        }
        Ok(())
    }

    pub fn validate_notional(&self, price: Price, quantity: Decimal) -> Result<(), MarketError> {
        let notional = price.value() * quantity;
        if notional < self.params.min_notional {
            return Err(MarketError::BelowMinNotional {
                notional,
                minimum: self.params.min_notional,
            });
        }
        Ok(())
    }

    /// Applies a governance update. Nothing changes unless the result validates.
    pub fn apply_update(
        &mut self,
        update: &MarketParamUpdate,
        relayer_fee_share_rate: Decimal,
    ) -> Result<(), MarketError> {
        let mut params = self.params.clone();
        if let Some(v) = update.initial_margin_ratio {
            params.initial_margin_ratio = v;
        }
        if let Some(v) = update.maintenance_margin_ratio {
            params.maintenance_margin_ratio = v;
        }
        if let Some(v) = update.reduce_margin_ratio {
            params.reduce_margin_ratio = v;
        }
        if let Some(v) = update.maker_fee_rate {
            params.maker_fee_rate = v;
        }
        if let Some(v) = update.taker_fee_rate {
            params.taker_fee_rate = v;
        }
        if let Some(v) = update.min_price_tick_size {
            params.min_price_tick_size = v;
        }
        if let Some(v) = update.min_quantity_tick_size {
            params.min_quantity_tick_size = v;
        }
        if let Some(v) = update.min_notional {
            params.min_notional = v;
        }
        params.validate_for(self.kind.market_type(), relayer_fee_share_rate)?;

        let mut kind = self.kind.clone();
        if let MarketKind::Perpetual(info) = &mut kind {
            if let Some(cap) = update.hourly_funding_rate_cap {
                if cap <= Decimal::ZERO {
                    return Err(MarketError::InvalidFundingParams);
                }
                info.hourly_funding_rate_cap = cap;
            }
            if let Some(rate) = update.hourly_interest_rate {
                info.hourly_interest_rate = rate;
            }
        } else if update.hourly_funding_rate_cap.is_some() || update.hourly_interest_rate.is_some() {
            return Err(MarketError::InvalidFundingParams);
        }

        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(MarketError::InvalidStatusTransition {
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
        }
        self.params = params;
        self.kind = kind;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarketError {
    #[error("initial margin ratio {initial} must exceed maintenance margin ratio {maintenance}")]
    InvalidMarginRatio { initial: Decimal, maintenance: Decimal },

    #[error("reduce margin ratio {0} below initial margin ratio")]
    InvalidReduceMarginRatio(Decimal),

    #[error("invalid fee rate {0}")]
    InvalidFeeRate(Decimal),

    #[error("tick sizes must be positive")]
    InvalidTickSize,

    #[error("funding params only apply to perpetual markets and must be positive")]
    InvalidFundingParams,

    #[error("price {price} is not a multiple of tick {tick}")]
    PriceNotOnTick { price: Decimal, tick: Decimal },

    #[error("quantity {quantity} is not a positive multiple of tick {tick}")]
    QuantityNotOnTick { quantity: Decimal, tick: Decimal },

    #[error("notional {notional} below minimum {minimum}")]
    BelowMinNotional { notional: Decimal, minimum: Decimal },

    #[error("binary option price {0} must be within (0, 1)")]
    BinaryOptionPriceOutOfBounds(Decimal),

    #[error("market status cannot go from {from:?} to {to:?}")]
    InvalidStatusTransition { from: MarketStatus, to: MarketStatus },

    #[error("market expiry must be in the future")]
    InvalidExpiry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn perp() -> DerivativeMarket {
        DerivativeMarket::new(
            "INJ/USDT PERP",
            "usdt",
            OracleRef::new("INJ", "USDT", OracleType::PriceFeed),
            MarketKind::Perpetual(PerpetualInfo {
                hourly_funding_rate_cap: dec!(0.000625),
                hourly_interest_rate: dec!(0),
                funding_interval_secs: 3600,
                next_funding_timestamp: Timestamp::from_secs(3600),
            }),
            RiskParams::default(),
        )
    }

    #[test]
    fn market_id_is_deterministic() {
        assert_eq!(perp().market_id, perp().market_id);

        let other = DerivativeMarket::new(
            "INJ/USDT PERP",
            "usdc",
            OracleRef::new("INJ", "USDT", OracleType::PriceFeed),
            perp().kind,
            RiskParams::default(),
        );
        assert_ne!(other.market_id, perp().market_id);
    }

    #[test]
    fn status_transitions() {
        assert!(MarketStatus::Active.can_transition_to(MarketStatus::Paused));
        assert!(MarketStatus::Expired.can_transition_to(MarketStatus::Demolished));
        assert!(!MarketStatus::Demolished.can_transition_to(MarketStatus::Active));
        assert!(!MarketStatus::Expired.can_transition_to(MarketStatus::Active));
    }

    #[test]
    fn update_rejects_inverted_margin_ratios() {
        let mut market = perp();
        let update = MarketParamUpdate {
            maintenance_margin_ratio: Some(dec!(0.06)),
            ..Default::default()
        };
        let err = market.apply_update(&update, dec!(0.4)).unwrap_err();
        assert!(matches!(err, MarketError::InvalidMarginRatio { .. }));
        // unchanged on failure
        assert_eq!(market.params.maintenance_margin_ratio, dec!(0.02));
    }

    #[test]
    fn update_applies_valid_fields() {
        let mut market = perp();
        let update = MarketParamUpdate {
            taker_fee_rate: Some(dec!(0.002)),
            hourly_interest_rate: Some(dec!(0.00001)),
            ..Default::default()
        };
        market.apply_update(&update, dec!(0.4)).unwrap();
        assert_eq!(market.params.taker_fee_rate, dec!(0.002));
        assert_eq!(market.perpetual_info().unwrap().hourly_interest_rate, dec!(0.00001));
    }

    #[test]
    fn maker_rebate_bounded_by_taker_share() {
        let params = RiskParams {
            maker_fee_rate: dec!(-0.0007),
            taker_fee_rate: dec!(0.001),
            ..RiskParams::default()
        };
        // 0.001 * (1 - 0.4) = 0.0006 < 0.0007
        assert!(params.validate(dec!(0.4)).is_err());
        assert!(params.validate(dec!(0.2)).is_ok());
    }

    #[test]
    fn full_collateral_only_for_binary_options() {
        let params = RiskParams {
            initial_margin_ratio: dec!(1),
            maintenance_margin_ratio: dec!(0.5),
            reduce_margin_ratio: dec!(1),
            ..RiskParams::default()
        };
        assert!(params.validate(dec!(0.4)).is_ok());
        assert!(matches!(
            params.validate_for(MarketType::Perpetual, dec!(0.4)),
            Err(MarketError::InvalidMarginRatio { .. })
        ));
        assert!(params.validate_for(MarketType::ExpiryFuture, dec!(0.4)).is_err());
        assert!(RiskParams::binary_options()
            .validate_for(MarketType::BinaryOption, dec!(0.4))
            .is_ok());

        let mut market = perp();
        let update = MarketParamUpdate {
            initial_margin_ratio: Some(dec!(1)),
            reduce_margin_ratio: Some(dec!(1)),
            ..Default::default()
        };
        assert!(market.apply_update(&update, dec!(0.4)).is_err());
    }

    #[test]
    fn tick_validation() {
        let market = perp();
        assert!(market.validate_price(Price::new_unchecked(dec!(10.01))).is_ok());
        assert!(market.validate_price(Price::new_unchecked(dec!(10.015))).is_err());
        assert!(market.validate_quantity(dec!(0.002)).is_ok());
        assert!(market.validate_quantity(dec!(0.0025)).is_err());
    }

    #[test]
    fn fee_rate_selection() {
        let market = perp();
        assert_eq!(market.fee_rate(true, false, dec!(2)), dec!(-0.0001));
        assert_eq!(market.fee_rate(false, false, dec!(2)), dec!(0.001));
        assert_eq!(market.fee_rate(false, true, dec!(2)), dec!(0.002));
    }

    #[test]
    fn expiry_maturation_windows() {
        let info = ExpiryFuturesInfo::new(Timestamp::from_secs(10_000));
        assert!(info.is_premature(Timestamp::from_secs(8_000)));
        assert!(info.is_starting_maturation(Timestamp::from_secs(8_300)));
        assert!(info.is_matured(Timestamp::from_secs(10_000)));
    }
}
