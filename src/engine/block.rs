// 8.13 engine/block.rs: the per-block schedule.
//
// begin_block  scheduled settlements, expiry futures, binary options, hourly funding
// end_block    conditional triggers, market orders, transient limit orders,
//              reduce-only conditional cleanup, transient store reset

use super::core::Engine;
use super::execution::Taker;
use super::orderbook::Book;
use crate::events::ExecutionType;
use crate::market::DerivativeMarket;
use crate::store::keys::{no_margin_locked_parts, NO_MARGIN_LOCKED};
use crate::store::TypedStore;
use crate::types::{BlockInfo, Side, Timestamp};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use tracing::{debug, info};

impl Engine {
    pub fn begin_block(&mut self, height: u64, time: Timestamp) {
        self.block = BlockInfo { height, time };
        debug!(height, %time, "begin block");

        let settled = self.process_markets_scheduled_to_settle().len()
            + self.process_mature_expiry_future_markets().len()
            + self.process_binary_options_markets().len();
        let funded = self.process_hourly_fundings();
        if settled > 0 || funded > 0 {
            info!(height, settled, funded, "block started");
        }
    }

    pub fn end_block(&mut self) {
        let triggered = self.trigger_conditional_orders();

        for market in self.active_markets() {
            self.match_market_orders(&market);
            self.match_transient_limit_orders(&market);
        }
        self.invalidate_flagged_conditional_orders();
        self.ledger.clear_transient();
        debug!(height = self.block.height, triggered, "end block");
    }

    /// Market orders of this block, buys first. Unused holds go back to available.
    fn match_market_orders(&mut self, market: &DerivativeMarket) {
        let market_id = market.market_id;
        let mark = self.mark_price_opt(market);
        let fee_rate = market.fee_rate(false, false, self.params.atomic_market_order_fee_multiplier);

        for side in [Side::Long, Side::Short] {
            for order in self.market_orders(&market_id, side) {
                // an insolvent execution pauses the market and refunds what is left
                if !self.is_market_active(&market_id) {
                    return;
                }
                self.delete_market_order(&market_id, &order);
                let taker = Taker::from_market_order(&order, fee_rate);
                let outcome = self.execute_taker(market, &taker, mark, ExecutionType::Market);
                let refund = (order.margin_hold - outcome.taker_hold_released).max(Decimal::ZERO);
                self.increment_available(&order.subaccount_id(), &market.quote_denom, refund);
            }
        }
    }

    /// Limit orders placed this block take liquidity first, then rest.
    fn match_transient_limit_orders(&mut self, market: &DerivativeMarket) {
        let market_id = market.market_id;
        let mark = self.mark_price_opt(market);
        let fee_rate = market.fee_rate(false, false, self.params.atomic_market_order_fee_multiplier);

        for side in [Side::Long, Side::Short] {
            for order in self.book_orders(Book::Transient, &market_id, side) {
                if !self.is_market_active(&market_id) {
                    return;
                }
                let taker = Taker::from_limit_order(&order, fee_rate, Book::Transient);
                self.execute_taker(market, &taker, mark, ExecutionType::LimitFill);

                if let Some(rest) = self.get_limit_order(
                    Book::Transient,
                    &market_id,
                    side,
                    &order.subaccount_id(),
                    &order.order_hash,
                ) {
                    self.delete_limit_order(Book::Transient, &market_id, &rest);
                    self.set_limit_order(Book::Resting, &market_id, &rest);
                }
            }
        }
    }

    fn invalidate_flagged_conditional_orders(&mut self) {
        let flagged: BTreeSet<_> = self
            .ledger
            .transient()
            .values::<Side>(&[NO_MARGIN_LOCKED], None, None, false)
            .into_iter()
            .filter_map(|(key, _)| no_margin_locked_parts(&key))
            .collect();
        for (market_id, subaccount_id) in flagged {
            if let Some(market) = self.get_market(&market_id) {
                self.invalidate_conditional_orders_if_no_margin_locked(&market, &subaccount_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::fixtures::{Fixture, QUOTE};
    use crate::order::OrderType;
    use crate::types::{Side, Timestamp};
    use rust_decimal_macros::dec;

    #[test]
    fn crossing_limit_orders_match_at_end_block() {
        let mut fx = Fixture::perpetual();
        let buyer = fx.trader(1, dec!(1000));
        let seller = fx.trader(2, dec!(1000));
        let ask = fx.order(seller, OrderType::SellPostOnly, dec!(100), dec!(1), dec!(10));
        fx.engine.create_limit_order(ask).unwrap();
        let bid = fx.order(buyer, OrderType::Buy, dec!(100), dec!(2), dec!(20));
        fx.engine.create_limit_order(bid).unwrap();
        assert!(fx.engine.position(&fx.market, &buyer).is_none());

        fx.engine.end_block();
        let position = fx.engine.position(&fx.market, &buyer).unwrap();
        assert_eq!(position.quantity, dec!(1));
        assert_eq!(position.entry_price, dec!(100));
        // the unfilled half rests on the book
        let bids = fx.engine.limit_orders(&fx.market, Side::Long);
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].fillable, dec!(1));
        assert_eq!(fx.engine.deposit_balance(&buyer, QUOTE).available_balance, dec!(980));
    }

    #[test]
    fn unfilled_market_order_is_refunded() {
        let mut fx = Fixture::perpetual();
        let buyer = fx.trader(1, dec!(1000));
        let seller = fx.trader(2, dec!(1000));
        let ask = fx.order(seller, OrderType::SellPostOnly, dec!(100), dec!(1), dec!(10));
        fx.engine.create_limit_order(ask).unwrap();
        let bid = fx.order(buyer, OrderType::Buy, dec!(100), dec!(3), dec!(30));
        fx.engine.create_market_order(bid).unwrap();
        assert_eq!(fx.engine.deposit_balance(&buyer, QUOTE).available_balance, dec!(970));

        fx.engine.end_block();
        assert_eq!(fx.engine.position(&fx.market, &buyer).unwrap().quantity, dec!(1));
        assert_eq!(fx.engine.deposit_balance(&buyer, QUOTE).available_balance, dec!(990));

        // a new block accepts a new market order from the same subaccount
        fx.engine.begin_block(2, Timestamp::from_secs(10));
        let ask = fx.order(seller, OrderType::SellPostOnly, dec!(100), dec!(1), dec!(10));
        fx.engine.create_limit_order(ask).unwrap();
        let bid = fx.order(buyer, OrderType::Buy, dec!(100), dec!(1), dec!(10));
        assert!(fx.engine.create_market_order(bid).is_ok());
    }
}
