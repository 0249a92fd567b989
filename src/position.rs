// 4.0: position model. pure functions over one (market, subaccount) position.
// 4.1 funding + margin ratio, 4.2 bankruptcy/liquidation price, 4.3 delta application,
// 4.4 settlement closes and haircuts.
//
// nothing here touches the ledger. callers validate first; a negative quantity
// coming out of these functions is a bug upstream and panics.

use crate::market::MarketType;
use crate::types::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub margin: Decimal,
    // perpetuals only, zero elsewhere
    pub cumulative_funding_entry: Decimal,
}

/// One execution folded into a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDelta {
    pub side: Side,
    pub execution_quantity: Decimal,
    pub execution_margin: Decimal,
    pub execution_price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionPayout {
    pub payout: Decimal,
    pub pnl_notional: Decimal,
    pub is_profitable: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeltaOutcome {
    // margin + pnl released by the closing part
    pub payout: Decimal,
    // share of the execution margin that went to closing, returned to the trader
    pub close_execution_margin: Decimal,
    // execution margin now locked in the position
    pub collateralization_margin: Decimal,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettleOutcome {
    pub payout: Decimal,
    pub closing_fee: Decimal,
    pub delta: PositionDelta,
    pub pnl: Decimal,
}

impl Position {
    pub fn new(side: Side, cumulative_funding: Decimal) -> Self {
        Self {
            side,
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            margin: Decimal::ZERO,
            cumulative_funding_entry: cumulative_funding,
        }
    }

    pub fn is_long(&self) -> bool {
        self.side == Side::Long
    }

    pub fn is_empty(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Side an order must be on to reduce this position.
    pub fn closing_side(&self) -> Side {
        self.side.opposite()
    }

    fn assert_valid(&self) {
        assert!(
            self.quantity >= Decimal::ZERO,
            "position quantity went negative: {}",
            self.quantity
        );
    }

    // 4.1: longs pay when cumulative funding rises, shorts receive
    pub fn apply_funding(&mut self, cumulative_funding: Option<Decimal>) {
        let Some(cumulative) = cumulative_funding else {
            return;
        };
        let payment = self.unrealized_funding(cumulative);
        self.margin += payment;
        self.cumulative_funding_entry = cumulative;
    }

    /// Margin change funding would apply right now (negative = owed).
    pub fn unrealized_funding(&self, cumulative_funding: Decimal) -> Decimal {
        let payment = self.quantity * (cumulative_funding - self.cumulative_funding_entry);
        if self.is_long() {
            -payment
        } else {
            payment
        }
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        match self.side {
            Side::Long => self.quantity * (price - self.entry_price),
            Side::Short => self.quantity * (self.entry_price - price),
        }
    }

    /// (margin + unrealized pnl - closing fee) / notional at `price`.
    pub fn margin_ratio(&self, price: Decimal, closing_fee_rate: Decimal) -> Decimal {
        let notional = price * self.quantity;
        if notional.is_zero() {
            return Decimal::MAX;
        }
        let closing_fee = notional * closing_fee_rate;
        (self.margin + self.unrealized_pnl(price) - closing_fee) / notional
    }

    // 4.2: price at which equity (margin + pnl) is exactly zero
    pub fn bankruptcy_price(&self, added_margin: Decimal) -> Decimal {
        let unit_margin = (self.margin + added_margin) / self.quantity;
        match self.side {
            Side::Long => self.entry_price - unit_margin,
            Side::Short => self.entry_price + unit_margin,
        }
    }

    /// Price at which margin_ratio(price, fee) == mmr.
    ///   long:  (entry - margin/qty) / (1 - mmr - fee)
    ///   short: (entry + margin/qty) / (1 + mmr + fee)
    pub fn liquidation_price(&self, maintenance_margin_ratio: Decimal, closing_fee_rate: Decimal) -> Decimal {
        let unit_margin = self.margin / self.quantity;
        match self.side {
            Side::Long => {
                let denominator = Decimal::ONE - maintenance_margin_ratio - closing_fee_rate;
                if denominator <= Decimal::ZERO {
                    // every price is below maintenance
                    return Decimal::MAX;
                }
                ((self.entry_price - unit_margin) / denominator).max(Decimal::ZERO)
            }
            Side::Short => {
                (self.entry_price + unit_margin)
                    / (Decimal::ONE + maintenance_margin_ratio + closing_fee_rate)
            }
        }
    }

    pub fn is_liquidatable(
        &self,
        mark_price: Decimal,
        maintenance_margin_ratio: Decimal,
        closing_fee_rate: Decimal,
    ) -> bool {
        let liquidation_price = self.liquidation_price(maintenance_margin_ratio, closing_fee_rate);
        match self.side {
            Side::Long => mark_price <= liquidation_price,
            Side::Short => mark_price >= liquidation_price,
        }
    }

    /// Worst price a liquidation order may fill at: bankruptcy price, or mark
    /// when the position is already under water at mark.
    pub fn liquidation_worst_price(&self, mark_price: Decimal) -> Decimal {
        let bankruptcy = self.bankruptcy_price(Decimal::ZERO);
        let negative_equity = match self.side {
            Side::Long => mark_price < bankruptcy,
            Side::Short => mark_price > bankruptcy,
        };
        if negative_equity {
            mark_price
        } else {
            bankruptcy
        }
    }

    /// Closing order must be on the opposite side and must not close past the
    /// fee-adjusted bankruptcy price.
    pub fn check_valid_position_to_reduce(
        &self,
        market_type: MarketType,
        reduce_price: Decimal,
        order_side: Side,
        trade_fee_rate: Decimal,
        order_margin: Decimal,
    ) -> Result<(), PositionError> {
        if order_side == self.side {
            return Err(PositionError::InvalidReduceOnlyPositionDirection);
        }
        if market_type == MarketType::BinaryOption {
            return Ok(());
        }

        let bankruptcy = self.bankruptcy_price(order_margin);
        match self.side {
            Side::Long => {
                let threshold = bankruptcy / (Decimal::ONE - trade_fee_rate);
                if reduce_price < threshold {
                    return Err(PositionError::PriceSurpassesBankruptcyPrice {
                        price: reduce_price,
                        bankruptcy: threshold,
                    });
                }
            }
            Side::Short => {
                let threshold = bankruptcy / (Decimal::ONE + trade_fee_rate);
                if reduce_price > threshold {
                    return Err(PositionError::PriceSurpassesBankruptcyPrice {
                        price: reduce_price,
                        bankruptcy: threshold,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn payout_if_fully_closing(&self, closing_price: Decimal, closing_fee_rate: Decimal) -> PositionPayout {
        let is_profitable = match self.side {
            Side::Long => self.entry_price < closing_price,
            Side::Short => self.entry_price > closing_price,
        };
        let pnl_notional = self.unrealized_pnl(closing_price);
        let closing_fee = closing_price * self.quantity * closing_fee_rate;
        PositionPayout {
            payout: pnl_notional + self.margin - closing_fee,
            pnl_notional,
            is_profitable,
        }
    }

    // 4.3: same direction nets into a bigger position, opposite direction closes
    // up to the held quantity and flips with whatever is left.
    pub fn apply_position_delta(
        &mut self,
        delta: &PositionDelta,
        trading_fee_for_reduce_only: Decimal,
    ) -> DeltaOutcome {
        if delta.execution_quantity.is_zero() {
            return DeltaOutcome::default();
        }
        if self.quantity.is_zero() {
            self.side = delta.side;
        }

        if self.side == delta.side {
            let new_quantity = self.quantity + delta.execution_quantity;
            self.entry_price = (self.quantity * self.entry_price
                + delta.execution_quantity * delta.execution_price)
                / new_quantity;
            self.quantity = new_quantity;
            self.margin += delta.execution_margin;
            self.assert_valid();
            return DeltaOutcome {
                collateralization_margin: delta.execution_margin,
                ..DeltaOutcome::default()
            };
        }

        let closing_quantity = self.quantity.min(delta.execution_quantity);
        let close_execution_margin =
            delta.execution_margin * closing_quantity / delta.execution_quantity;

        let mut pnl = match self.side {
            Side::Long => closing_quantity * (delta.execution_price - self.entry_price),
            Side::Short => closing_quantity * (self.entry_price - delta.execution_price),
        };
        if delta.execution_margin.is_zero() {
            // reduce-only fills pay their fee out of the realized pnl
            pnl -= trading_fee_for_reduce_only;
        }

        let position_closing_margin = self.margin * closing_quantity / self.quantity;
        let payout = pnl + position_closing_margin;

        self.margin -= position_closing_margin;
        self.quantity -= closing_quantity;

        let mut collateralization_margin = Decimal::ZERO;
        let remaining_quantity = delta.execution_quantity - closing_quantity;
        if self.quantity.is_zero() && remaining_quantity > Decimal::ZERO {
            let remaining_margin = delta.execution_margin - close_execution_margin;
            self.side = delta.side;
            self.quantity = remaining_quantity;
            self.entry_price = delta.execution_price;
            self.margin = remaining_margin;
            collateralization_margin = remaining_margin;
        }
        self.assert_valid();

        DeltaOutcome {
            payout,
            close_execution_margin,
            collateralization_margin,
            pnl,
        }
    }

    // 4.4: settlement closes
    pub fn close_with_settle_price(&mut self, settlement_price: Decimal, closing_fee_rate: Decimal) -> SettleOutcome {
        let delta = PositionDelta {
            side: self.closing_side(),
            execution_quantity: self.quantity,
            execution_margin: Decimal::ZERO,
            execution_price: settlement_price,
        };
        if self.quantity.is_zero() {
            return SettleOutcome {
                payout: Decimal::ZERO,
                closing_fee: Decimal::ZERO,
                delta,
                pnl: Decimal::ZERO,
            };
        }
        let closing_fee = settlement_price * self.quantity * closing_fee_rate;
        let outcome = self.apply_position_delta(&delta, closing_fee);
        SettleOutcome {
            payout: outcome.payout,
            closing_fee,
            delta,
            pnl: outcome.pnl,
        }
    }

    /// Binary option refund: the margin comes back, no pnl, no fee.
    pub fn close_by_refunding(&mut self) -> SettleOutcome {
        let delta = PositionDelta {
            side: self.closing_side(),
            execution_quantity: self.quantity,
            execution_margin: Decimal::ZERO,
            execution_price: self.entry_price,
        };
        let payout = self.margin;
        self.quantity = Decimal::ZERO;
        self.margin = Decimal::ZERO;
        SettleOutcome {
            payout,
            closing_fee: Decimal::ZERO,
            delta,
            pnl: Decimal::ZERO,
        }
    }

    pub fn close_without_payout(&mut self) {
        self.quantity = Decimal::ZERO;
        self.margin = Decimal::ZERO;
        self.entry_price = Decimal::ZERO;
        self.cumulative_funding_entry = Decimal::ZERO;
    }

    /// Shrinks profit by deficit/total_profits by moving the entry price toward
    /// the settlement price: (settle - entry') = (settle - entry) * (1 - rate).
    pub fn apply_profit_haircut(&mut self, deficit: Decimal, total_profits: Decimal, settlement_price: Decimal) {
        if total_profits.is_zero() {
            return;
        }
        let rate = deficit / total_profits;
        self.entry_price += rate * (settlement_price - self.entry_price);
        if self.margin < Decimal::ZERO {
            self.margin *= Decimal::ONE - rate;
        }
    }

    /// Profit haircut plus the same share of margin, so the whole payout shrinks.
    pub fn apply_total_payout_haircut(&mut self, deficit: Decimal, total_payouts: Decimal, settlement_price: Decimal) {
        if total_payouts.is_zero() {
            return;
        }
        self.apply_profit_haircut(deficit, total_payouts, settlement_price);
        let removed = self.margin * (deficit / total_payouts);
        self.margin -= removed;
    }

    pub fn apply_margin_haircut(&mut self, rate: Decimal) {
        self.margin *= Decimal::ONE - rate;
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionError {
    #[error("reduce-only order must be on the opposite side of the position")]
    InvalidReduceOnlyPositionDirection,

    #[error("closing price {price} surpasses bankruptcy price {bankruptcy}")]
    PriceSurpassesBankruptcyPrice { price: Decimal, bankruptcy: Decimal },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long(quantity: Decimal, entry: Decimal, margin: Decimal) -> Position {
        Position {
            side: Side::Long,
            quantity,
            entry_price: entry,
            margin,
            cumulative_funding_entry: Decimal::ZERO,
        }
    }

    fn short(quantity: Decimal, entry: Decimal, margin: Decimal) -> Position {
        Position {
            side: Side::Short,
            ..long(quantity, entry, margin)
        }
    }

    #[test]
    fn long_liquidation_price_closed_form() {
        // entry 100, qty 1, margin 10, mmr 5% => (100 - 10) / 0.95
        let pos = long(dec!(1), dec!(100), dec!(10));
        let liq = pos.liquidation_price(dec!(0.05), Decimal::ZERO);
        assert_eq!(liq.round_dp(4), dec!(94.7368));

        // margin ratio at the liquidation price is the maintenance ratio
        assert_eq!(pos.margin_ratio(liq, Decimal::ZERO).round_dp(10), dec!(0.05));
        assert!(pos.is_liquidatable(dec!(94.7), dec!(0.05), Decimal::ZERO));
        assert!(!pos.is_liquidatable(dec!(94.8), dec!(0.05), Decimal::ZERO));
    }

    #[test]
    fn short_liquidation_price_closed_form() {
        let pos = short(dec!(2), dec!(100), dec!(20));
        let liq = pos.liquidation_price(dec!(0.05), Decimal::ZERO);
        // (100 + 10) / 1.05
        assert_eq!(liq.round_dp(4), dec!(104.7619));
        assert!(pos.is_liquidatable(dec!(105), dec!(0.05), Decimal::ZERO));
        assert!(!pos.is_liquidatable(dec!(104), dec!(0.05), Decimal::ZERO));
    }

    #[test]
    fn closing_fee_moves_liquidation_price_toward_entry() {
        let pos = long(dec!(1), dec!(100), dec!(10));
        let without_fee = pos.liquidation_price(dec!(0.05), Decimal::ZERO);
        let with_fee = pos.liquidation_price(dec!(0.05), dec!(0.001));
        assert!(with_fee > without_fee);
    }

    #[test]
    fn funding_charges_longs_and_pays_shorts() {
        let mut l = long(dec!(2), dec!(100), dec!(10));
        let mut s = short(dec!(2), dec!(100), dec!(10));
        l.apply_funding(Some(dec!(0.5)));
        s.apply_funding(Some(dec!(0.5)));

        assert_eq!(l.margin, dec!(9));
        assert_eq!(s.margin, dec!(11));
        assert_eq!(l.cumulative_funding_entry, dec!(0.5));

        // second application with the same cumulative value is a no-op
        l.apply_funding(Some(dec!(0.5)));
        assert_eq!(l.margin, dec!(9));
        l.apply_funding(None);
        assert_eq!(l.margin, dec!(9));
    }

    #[test]
    fn same_direction_delta_averages_entry() {
        let mut pos = long(dec!(1), dec!(100), dec!(10));
        let outcome = pos.apply_position_delta(
            &PositionDelta {
                side: Side::Long,
                execution_quantity: dec!(1),
                execution_margin: dec!(12),
                execution_price: dec!(120),
            },
            Decimal::ZERO,
        );
        assert_eq!(pos.quantity, dec!(2));
        assert_eq!(pos.entry_price, dec!(110));
        assert_eq!(pos.margin, dec!(22));
        assert_eq!(outcome.collateralization_margin, dec!(12));
        assert_eq!(outcome.payout, Decimal::ZERO);
    }

    #[test]
    fn partial_close_releases_margin_and_pnl() {
        let mut pos = long(dec!(4), dec!(100), dec!(40));
        let outcome = pos.apply_position_delta(
            &PositionDelta {
                side: Side::Short,
                execution_quantity: dec!(1),
                execution_margin: dec!(11),
                execution_price: dec!(110),
            },
            Decimal::ZERO,
        );
        assert_eq!(outcome.pnl, dec!(10));
        assert_eq!(outcome.payout, dec!(20)); // pnl 10 + 1/4 of margin
        assert_eq!(outcome.close_execution_margin, dec!(11));
        assert_eq!(outcome.collateralization_margin, Decimal::ZERO);
        assert_eq!(pos.quantity, dec!(3));
        assert_eq!(pos.margin, dec!(30));
        assert_eq!(pos.entry_price, dec!(100));
    }

    #[test]
    fn netting_flips_position() {
        let mut pos = long(dec!(1), dec!(100), dec!(10));
        let outcome = pos.apply_position_delta(
            &PositionDelta {
                side: Side::Short,
                execution_quantity: dec!(3),
                execution_margin: dec!(30),
                execution_price: dec!(90),
            },
            Decimal::ZERO,
        );
        assert_eq!(outcome.pnl, dec!(-10));
        assert_eq!(outcome.payout, Decimal::ZERO);
        assert_eq!(outcome.close_execution_margin, dec!(10));
        assert_eq!(outcome.collateralization_margin, dec!(20));
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.quantity, dec!(2));
        assert_eq!(pos.entry_price, dec!(90));
        assert_eq!(pos.margin, dec!(20));
    }

    #[test]
    fn reduce_only_fill_pays_fee_from_pnl() {
        let mut pos = short(dec!(2), dec!(100), dec!(20));
        let outcome = pos.apply_position_delta(
            &PositionDelta {
                side: Side::Long,
                execution_quantity: dec!(2),
                execution_margin: Decimal::ZERO,
                execution_price: dec!(90),
            },
            dec!(0.18),
        );
        assert_eq!(outcome.pnl, dec!(19.82));
        assert_eq!(outcome.payout, dec!(39.82));
        assert!(pos.is_empty());
    }

    #[test]
    fn reduce_check_rejects_same_side_and_bankrupt_prices() {
        let pos = long(dec!(1), dec!(100), dec!(10));
        assert_eq!(
            pos.check_valid_position_to_reduce(MarketType::Perpetual, dec!(100), Side::Long, dec!(0.001), Decimal::ZERO),
            Err(PositionError::InvalidReduceOnlyPositionDirection)
        );
        // bankruptcy 90, fee adjusted ~90.09
        assert!(pos
            .check_valid_position_to_reduce(MarketType::Perpetual, dec!(90.05), Side::Short, dec!(0.001), Decimal::ZERO)
            .is_err());
        assert!(pos
            .check_valid_position_to_reduce(MarketType::Perpetual, dec!(91), Side::Short, dec!(0.001), Decimal::ZERO)
            .is_ok());
        // binary options skip the price check
        assert!(pos
            .check_valid_position_to_reduce(MarketType::BinaryOption, dec!(1), Side::Short, dec!(0.001), Decimal::ZERO)
            .is_ok());
    }

    #[test]
    fn liquidation_worst_price_uses_mark_when_under_water() {
        let pos = long(dec!(1), dec!(100), dec!(10));
        assert_eq!(pos.liquidation_worst_price(dec!(95)), dec!(90));
        assert_eq!(pos.liquidation_worst_price(dec!(85)), dec!(85));
    }

    #[test]
    fn profit_haircut_reduces_profit_pro_rata() {
        // profits 50 and 150, deficit 20 => 10% off each profit
        let mut a = long(dec!(1), dec!(100), dec!(10));
        let mut b = long(dec!(3), dec!(100), dec!(30));
        let settle = dec!(150);

        a.apply_profit_haircut(dec!(20), dec!(200), settle);
        b.apply_profit_haircut(dec!(20), dec!(200), settle);

        assert_eq!(a.unrealized_pnl(settle), dec!(45));
        assert_eq!(b.unrealized_pnl(settle), dec!(135));
    }

    #[test]
    fn settle_close_charges_fee() {
        let mut pos = long(dec!(2), dec!(100), dec!(20));
        let out = pos.close_with_settle_price(dec!(110), dec!(0.001));
        assert_eq!(out.closing_fee, dec!(0.22));
        assert_eq!(out.payout, dec!(20) + dec!(20) - dec!(0.22));
        assert!(pos.is_empty());
    }

    #[test]
    fn refund_returns_margin() {
        let mut pos = long(dec!(5), dec!(0.4), dec!(2));
        let out = pos.close_by_refunding();
        assert_eq!(out.payout, dec!(2));
        assert!(pos.is_empty());
    }

    #[test]
    #[should_panic(expected = "position quantity went negative")]
    fn negative_quantity_panics() {
        let mut pos = long(dec!(-1), dec!(100), dec!(10));
        pos.apply_position_delta(
            &PositionDelta {
                side: Side::Long,
                execution_quantity: dec!(0.5),
                execution_margin: dec!(1),
                execution_price: dec!(100),
            },
            Decimal::ZERO,
        );
    }
}
