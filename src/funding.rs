// 5.0: perpetual funding. trades accumulate a time-weighted premium of traded price over
// mark; once per interval the premium becomes a capped rate and is added to the market's
// cumulative funding. positions settle against the cumulative value lazily (position.rs 4.1).
//
// 5.1 premium accumulation, 5.2 hourly rate, 5.3 interval timestamps.

use crate::types::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerpetualMarketFunding {
    pub cumulative_funding: Decimal,
    // Σ Δt × (vwap - mark) / mark since the last funding
    pub cumulative_price: Decimal,
    pub last_timestamp: Timestamp,
}

impl PerpetualMarketFunding {
    pub fn new(now: Timestamp) -> Self {
        Self {
            cumulative_funding: Decimal::ZERO,
            cumulative_price: Decimal::ZERO,
            last_timestamp: now,
        }
    }

    // 5.1
    pub fn accumulate_premium(&mut self, vwap: Decimal, mark_price: Decimal, now: Timestamp) {
        if mark_price.is_zero() {
            return;
        }
        let elapsed = Decimal::from(now.as_secs() - self.last_timestamp.as_secs());
        let unit_delta = (vwap - mark_price) / mark_price;
        self.cumulative_price += elapsed * unit_delta;
        self.last_timestamp = now;
    }

    /// Average premium over the interval that ends at `funding_timestamp`.
    pub fn twap(&self, funding_interval_secs: i64, funding_timestamp: Timestamp) -> Decimal {
        // seconds between the interval start and the last accumulated trade
        let time_interval = self.last_timestamp.as_secs() + funding_interval_secs - funding_timestamp.as_secs();
        if time_interval == 0 {
            return Decimal::ZERO;
        }
        self.cumulative_price / (Decimal::from(time_interval) * Decimal::from(24))
    }

    // 5.2: returns the funding payment per unit (rate × mark)
    pub fn apply_hourly_funding(
        &mut self,
        hourly_interest_rate: Decimal,
        hourly_funding_rate_cap: Decimal,
        funding_interval_secs: i64,
        funding_timestamp: Timestamp,
        mark_price: Decimal,
    ) -> FundingUpdate {
        let twap = self.twap(funding_interval_secs, funding_timestamp);
        let rate = cap_funding_rate(twap + hourly_interest_rate, hourly_funding_rate_cap);
        let payment = rate * mark_price;

        self.cumulative_funding += payment;
        self.cumulative_price = Decimal::ZERO;
        self.last_timestamp = funding_timestamp;

        FundingUpdate {
            funding_rate: rate,
            payment_per_unit: payment,
            cumulative_funding: self.cumulative_funding,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FundingUpdate {
    pub funding_rate: Decimal,
    pub payment_per_unit: Decimal,
    pub cumulative_funding: Decimal,
}

pub fn cap_funding_rate(rate: Decimal, cap: Decimal) -> Decimal {
    rate.max(-cap).min(cap)
}

// 5.3: floor(now / interval) * interval + interval
pub fn next_interval_timestamp(now: Timestamp, interval_secs: i64) -> Timestamp {
    Timestamp::from_secs((now.as_secs() / interval_secs) * interval_secs + interval_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rate_is_capped_both_ways() {
        assert_eq!(cap_funding_rate(dec!(0.01), dec!(0.000625)), dec!(0.000625));
        assert_eq!(cap_funding_rate(dec!(-0.01), dec!(0.000625)), dec!(-0.000625));
        assert_eq!(cap_funding_rate(dec!(0.0001), dec!(0.000625)), dec!(0.0001));
    }

    #[test]
    fn next_interval_rounds_up() {
        assert_eq!(next_interval_timestamp(Timestamp::from_secs(0), 3600), Timestamp::from_secs(3600));
        assert_eq!(next_interval_timestamp(Timestamp::from_secs(3599), 3600), Timestamp::from_secs(3600));
        assert_eq!(next_interval_timestamp(Timestamp::from_secs(3600), 3600), Timestamp::from_secs(7200));
    }

    #[test]
    fn no_trades_means_interest_only() {
        let mut funding = PerpetualMarketFunding::new(Timestamp::from_secs(0));
        let update = funding.apply_hourly_funding(
            dec!(0.00001),
            dec!(0.000625),
            3600,
            Timestamp::from_secs(3600),
            dec!(100),
        );
        assert_eq!(update.funding_rate, dec!(0.00001));
        assert_eq!(update.cumulative_funding, dec!(0.001));
        assert_eq!(funding.last_timestamp, Timestamp::from_secs(3600));
    }

    #[test]
    fn premium_accumulates_time_weighted() {
        let mut funding = PerpetualMarketFunding::new(Timestamp::from_secs(0));
        // traded 1% over mark for the whole hour
        funding.accumulate_premium(dec!(101), dec!(100), Timestamp::from_secs(3600));
        assert_eq!(funding.cumulative_price, dec!(36));

        // 36 / (3600 * 24)
        let twap = funding.twap(3600, Timestamp::from_secs(3600));
        assert_eq!(twap, dec!(36) / dec!(86400));

        let update = funding.apply_hourly_funding(Decimal::ZERO, dec!(0.000625), 3600, Timestamp::from_secs(3600), dec!(100));
        assert_eq!(update.funding_rate, twap);
        assert!(funding.cumulative_price.is_zero());
    }
}
