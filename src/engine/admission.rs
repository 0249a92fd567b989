// 8.8 engine/admission.rs: order validation, placement, cancellation and batches.
//
// every order goes through ensure_valid_derivative_order, which checks in a fixed
// order and charges the margin hold last. placement runs in a cached layer, so a
// failed check leaves no nonce bump, hold or metadata change behind.

use super::core::Engine;
use super::execution::Taker;
use super::orderbook::{Book, OrderRef};
use super::results::{BatchUpdateResult, ExchangeError, MarketOrderResult};
use crate::events::{CancelReason, EventPayload, ExecutionType, OrderFailEvent};
use crate::market::{DerivativeMarket, MarketType};
use crate::order::{ConditionalOrder, DerivativeLimitOrder, DerivativeMarketOrder, DerivativeOrder};
use crate::types::{Address, MarketId, OrderHash, SubaccountId};
use rust_decimal::Decimal;
use tracing::{debug, info};

/// What admission decided about an order.
#[derive(Debug, Clone, Copy)]
pub(super) struct Admission {
    pub order_hash: OrderHash,
    pub margin_hold: Decimal,
    pub fee_rate: Decimal,
    pub mark_price: Option<Decimal>,
}

impl Engine {
    /// Runs every admission check against `order` and charges its margin hold.
    /// A reduce-only order may come back with a smaller quantity.
    pub(super) fn ensure_valid_derivative_order(
        &mut self,
        market: &DerivativeMarket,
        order: &mut DerivativeOrder,
        is_market_order: bool,
        is_maker: bool,
    ) -> Result<Admission, ExchangeError> {
        let market_id = market.market_id;
        let subaccount_id = order.subaccount_id();
        let side = order.side();
        let is_conditional = order.is_conditional();
        let is_binary_option = market.market_type() == MarketType::BinaryOption;

        let nonce = self.increment_subaccount_nonce(&subaccount_id);
        let order_hash = order.compute_order_hash(nonce);
        if let Some(cid) = order.cid() {
            if self.get_order_by_cid(&subaccount_id, cid).is_some() {
                return Err(ExchangeError::ClientOrderIdAlreadyExists(cid.to_string()));
            }
        }

        let post_only_mode = self.is_post_only_mode();
        if is_market_order && post_only_mode {
            return Err(ExchangeError::PostOnlyMode(self.params.post_only_mode_height_threshold));
        }
        let is_post_only = !is_market_order && (order.order_type.is_post_only() || post_only_mode);
        let crosses = self.order_crosses_top_of_book(&market_id, side, order.price());
        if is_post_only && crosses {
            return Err(ExchangeError::ExceedsTopOfBookPrice);
        }
        if is_market_order && !is_conditional && !crosses {
            return Err(ExchangeError::SlippageExceedsWorstPrice);
        }

        // atomic orders are held to the queued market order but never mark one themselves
        if is_market_order && !is_conditional && self.has_market_order_this_block(&market_id, &subaccount_id) {
            return Err(ExchangeError::MarketOrderAlreadyExists);
        }

        let mark_price = if is_binary_option && !is_conditional {
            self.mark_price_opt(market)
        } else {
            Some(self.mark_price(market)?)
        };

        market.validate_price(order.order_info.price)?;
        market.validate_quantity(order.quantity())?;
        market.validate_notional(order.order_info.price, order.quantity())?;
        if let Some(trigger) = order.trigger_price {
            market.validate_price(trigger)?;
        }
        if is_binary_option {
            order.check_binary_option_bounds()?;
        }
        order.check_valid_conditional_price(mark_price)?;

        if !is_market_order || is_conditional {
            let metadata = self.orderbook_metadata(&market_id, &subaccount_id, side);
            if metadata.order_side_count() >= self.params.max_derivative_order_side_count {
                return Err(ExchangeError::ExceedsOrderSideCount(self.params.max_derivative_order_side_count));
            }
        }

        if is_market_order && is_conditional {
            let trigger_higher = order.trigger_price.map(|p| p.value()) > mark_price;
            if self.has_conditional_market_order_in_direction(&market_id, &subaccount_id, trigger_higher) {
                return Err(ExchangeError::ConditionalMarketOrderAlreadyExists);
            }
        }

        let fee_rate = market.fee_rate(
            is_maker,
            order.order_type.is_atomic(),
            self.params.atomic_market_order_fee_multiplier,
        );

        let position = self.position_with_funding(market, &subaccount_id);
        if is_conditional {
            match &position {
                Some(p) if order.is_reduce_only() && p.side == side => {
                    return Err(ExchangeError::InvalidReduceOnlyPositionDirection);
                }
                None if order.is_reduce_only() => {
                    let has_vanilla = [side, side.opposite()]
                        .iter()
                        .any(|s| self.orderbook_metadata(&market_id, &subaccount_id, *s).has_vanilla_orders());
                    if !has_vanilla {
                        return Err(ExchangeError::NoMarginLocked);
                    }
                }
                _ => {}
            }
        } else {
            match &position {
                Some(p) if p.side != side => {
                    p.check_valid_position_to_reduce(market.market_type(), order.price(), side, fee_rate, order.margin)?;
                }
                Some(_) if order.is_reduce_only() => return Err(ExchangeError::InvalidReduceOnlyPositionDirection),
                None if order.is_reduce_only() => {
                    return Err(ExchangeError::PositionNotFound {
                        market_id,
                        subaccount_id,
                    })
                }
                _ => {}
            }
        }

        let margin_hold = if order.is_reduce_only() {
            Decimal::ZERO
        } else {
            let reference_price = if is_conditional {
                order.trigger_price.map(|p| p.value())
            } else {
                mark_price
            };
            let hold = order.check_margin_and_get_margin_hold(
                market.params.initial_margin_ratio,
                reference_price,
                fee_rate,
                market.market_type(),
            )?;
            self.charge_account(&subaccount_id, &market.quote_denom, hold)?;
            hold
        };

        if !is_conditional {
            if let Some(position) = position.filter(|p| p.side != side) {
                self.resolve_reduce_only_conflicts(market, order, &position)?;
            }
        }

        Ok(Admission {
            order_hash,
            margin_hold,
            fee_rate,
            mark_price,
        })
    }

    /// Shrinks a reduce-only order to what the position can still absorb, then
    /// cancels reduce-only orders the new order pushes past the position size.
    fn resolve_reduce_only_conflicts(
        &mut self,
        market: &DerivativeMarket,
        order: &mut DerivativeOrder,
        position: &crate::position::Position,
    ) -> Result<(), ExchangeError> {
        let market_id = market.market_id;
        let subaccount_id = order.subaccount_id();
        let side = order.side();

        let metadata = self.orderbook_metadata(&market_id, &subaccount_id, side);
        let committed = metadata.aggregate_reduce_only_quantity + metadata.aggregate_vanilla_quantity;
        if order.quantity() + committed <= position.quantity {
            return Ok(());
        }

        if order.is_reduce_only() {
            let ahead = self.committed_quantity_at_or_better(&market_id, &subaccount_id, side, order.price());
            let reducible = position.quantity - ahead;
            if reducible <= Decimal::ZERO {
                return Err(ExchangeError::InsufficientPositionQuantity);
            }
            if order.quantity() > reducible {
                debug!(market = %market_id, from = %order.quantity(), to = %reducible, "reduce-only order resized");
                order.order_info.quantity = reducible;
            }
        }

        self.trim_reduce_only_orders(market, &subaccount_id, position, Some((order.price(), order.quantity())));
        Ok(())
    }

    fn store_conditional_order(
        &mut self,
        market: &DerivativeMarket,
        order: DerivativeOrder,
        admission: Admission,
        is_market: bool,
    ) -> OrderHash {
        let trigger = order.trigger_price.map(|p| p.value()).unwrap_or(Decimal::ZERO);
        let trigger_higher = admission.mark_price.map_or(false, |mark| trigger > mark);
        let is_reduce_only = order.is_reduce_only();
        let conditional = ConditionalOrder {
            order,
            order_hash: admission.order_hash,
            is_market,
            trigger_higher,
            margin_hold: admission.margin_hold,
        };
        let subaccount_id = conditional.order.subaccount_id();
        self.set_conditional_order(&market.market_id, &conditional);
        self.update_orderbook_metadata(&market.market_id, &subaccount_id, conditional.order.side(), |m| {
            m.add_conditional_order(is_reduce_only)
        });
        self.set_cid(
            conditional.order.cid(),
            OrderRef {
                market_id: market.market_id,
                subaccount_id,
                order_hash: admission.order_hash,
            },
        );
        debug!(market = %market.market_id, order = %admission.order_hash, trigger = %trigger, "conditional order stored");
        self.emit_event(EventPayload::NewConditionalOrder(conditional));
        admission.order_hash
    }

    // 8.8.1: placement

    pub fn create_limit_order(&mut self, order: DerivativeOrder) -> Result<OrderHash, ExchangeError> {
        self.cached(|e| e.place_limit_order(order, false))
    }

    /// `rest_immediately` skips the transient book (liquidator orders).
    pub(super) fn place_limit_order(
        &mut self,
        mut order: DerivativeOrder,
        rest_immediately: bool,
    ) -> Result<OrderHash, ExchangeError> {
        let market = self.active_market(&order.market_id)?;
        let is_post_only = order.order_type.is_post_only() || self.is_post_only_mode();
        let admission = self.ensure_valid_derivative_order(&market, &mut order, false, is_post_only || rest_immediately)?;
        if order.is_conditional() {
            return Ok(self.store_conditional_order(&market, order, admission, false));
        }

        let hold_fee_rate = if order.is_reduce_only() {
            Decimal::ZERO
        } else {
            admission.fee_rate
        };
        let limit = DerivativeLimitOrder::from_order(&order, admission.order_hash, hold_fee_rate);
        let book = if is_post_only || rest_immediately {
            Book::Resting
        } else {
            Book::Transient
        };
        let subaccount_id = limit.subaccount_id();
        self.set_limit_order(book, &market.market_id, &limit);
        self.update_orderbook_metadata(&market.market_id, &subaccount_id, limit.side(), |m| m.add_limit_order(&limit));
        self.set_cid(
            limit.cid(),
            OrderRef {
                market_id: market.market_id,
                subaccount_id,
                order_hash: limit.order_hash,
            },
        );
        debug!(
            market = %market.market_id,
            order = %limit.order_hash,
            side = ?limit.side(),
            price = %limit.price(),
            quantity = %limit.quantity(),
            ?book,
            "limit order placed"
        );
        self.emit_event(EventPayload::NewLimitOrder(limit));
        Ok(admission.order_hash)
    }

    /// Market orders wait for end of block; atomic ones execute right away.
    pub fn create_market_order(&mut self, order: DerivativeOrder) -> Result<OrderHash, ExchangeError> {
        if order.order_type.is_atomic() {
            return self.create_atomic_market_order(order).map(|r| r.order_hash);
        }
        self.cached(|e| {
            let mut order = order;
            let market = e.active_market(&order.market_id)?;
            let admission = e.ensure_valid_derivative_order(&market, &mut order, true, false)?;
            if order.is_conditional() {
                return Ok(e.store_conditional_order(&market, order, admission, true));
            }
            let market_order = DerivativeMarketOrder::from_order(&order, admission.order_hash, admission.margin_hold);
            e.set_market_order(&market.market_id, &market_order);
            debug!(market = %market.market_id, order = %admission.order_hash, "market order queued");
            e.emit_event(EventPayload::NewMarketOrder(market_order));
            Ok(admission.order_hash)
        })
    }

    /// Executes against the resting book now, refunding whatever hold the fills
    /// did not use.
    pub fn create_atomic_market_order(&mut self, order: DerivativeOrder) -> Result<MarketOrderResult, ExchangeError> {
        self.cached(|e| {
            let mut order = order;
            let market = e.active_market(&order.market_id)?;
            if order.is_conditional() {
                return Err(ExchangeError::InvalidTriggerPrice);
            }
            let admission = e.ensure_valid_derivative_order(&market, &mut order, true, false)?;
            let market_order = DerivativeMarketOrder::from_order(&order, admission.order_hash, admission.margin_hold);
            let taker = Taker::from_market_order(&market_order, admission.fee_rate);
            let outcome = e.execute_taker(&market, &taker, admission.mark_price, ExecutionType::Market);

            let refund = (admission.margin_hold - outcome.taker_hold_released).max(Decimal::ZERO);
            e.increment_available(&market_order.subaccount_id(), &market.quote_denom, refund);
            info!(
                market = %market.market_id,
                order = %admission.order_hash,
                filled = %outcome.filled_quantity,
                "atomic market order executed"
            );
            Ok(MarketOrderResult {
                order_hash: admission.order_hash,
                filled_quantity: outcome.filled_quantity,
                average_price: outcome.average_price(),
                fee: outcome.taker_fee,
                payout: outcome.taker_payout,
            })
        })
    }

    // 8.8.2: cancellation

    /// Cancels a resting, transient or conditional order. Works in paused markets too.
    pub fn cancel_order(
        &mut self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        order_hash: &OrderHash,
    ) -> Result<(), ExchangeError> {
        let market = self
            .get_market(market_id)
            .ok_or(ExchangeError::MarketNotFound(*market_id))?;
        if let Some((book, order)) = self.find_limit_order(market_id, subaccount_id, order_hash) {
            self.cancel_limit_order(book, &market, &order, CancelReason::UserRequested);
            return Ok(());
        }
        if let Some(order) = self.get_conditional_order(market_id, subaccount_id, order_hash) {
            self.cancel_conditional_order(&market, &order, CancelReason::UserRequested);
            return Ok(());
        }
        Err(ExchangeError::OrderDoesntExist(*order_hash))
    }

    pub fn cancel_order_by_cid(&mut self, subaccount_id: &SubaccountId, cid: &str) -> Result<(), ExchangeError> {
        let order = self
            .get_order_by_cid(subaccount_id, cid)
            .ok_or(ExchangeError::OrderDoesntExist(OrderHash::ZERO))?;
        self.cancel_order(&order.market_id, subaccount_id, &order.order_hash)
    }

    // 8.8.3: batches. items fail independently; failures are reported in one
    // OrderFail event per account.

    pub fn batch_create_orders(&mut self, orders: Vec<DerivativeOrder>) -> Vec<Result<OrderHash, ExchangeError>> {
        let mut failures = FailureLog::default();
        let results = orders
            .into_iter()
            .map(|order| {
                let account = order.subaccount_id().owner();
                let cid = order.cid().map(str::to_string);
                let result = self.create_limit_order(order);
                if let Err(err) = &result {
                    failures.record(account, None, cid, err);
                }
                result
            })
            .collect();
        self.emit_failures(failures);
        results
    }

    pub fn batch_cancel_orders(&mut self, orders: Vec<OrderRef>) -> Vec<Result<(), ExchangeError>> {
        let mut failures = FailureLog::default();
        let results = orders
            .into_iter()
            .map(|o| {
                let result = self.cancel_order(&o.market_id, &o.subaccount_id, &o.order_hash);
                if let Err(err) = &result {
                    failures.record(o.subaccount_id.owner(), Some(o.order_hash), None, err);
                }
                result
            })
            .collect();
        self.emit_failures(failures);
        results
    }

    /// Cancel-all in the listed markets, then individual cancels, then creates.
    /// Everything must belong to `subaccount_id`.
    pub fn batch_update_orders(
        &mut self,
        subaccount_id: &SubaccountId,
        cancel_all_market_ids: &[MarketId],
        cancels: Vec<OrderRef>,
        creates: Vec<DerivativeOrder>,
    ) -> BatchUpdateResult {
        let mut result = BatchUpdateResult::default();
        let mut failures = FailureLog::default();
        let account = subaccount_id.owner();

        for market_id in cancel_all_market_ids {
            let Some(market) = self.get_market(market_id) else {
                continue;
            };
            self.cancel_subaccount_limit_orders(&market, subaccount_id, |_| true, CancelReason::BatchUpdate);
            self.cancel_subaccount_conditional_orders(&market, subaccount_id, |_| true, CancelReason::BatchUpdate);
            result.markets_cancelled.push(*market_id);
        }

        for cancel in cancels {
            if cancel_all_market_ids.contains(&cancel.market_id) {
                continue;
            }
            let outcome = if cancel.subaccount_id != *subaccount_id {
                Err(ExchangeError::Unauthorized)
            } else {
                self.cancel_order(&cancel.market_id, &cancel.subaccount_id, &cancel.order_hash)
            };
            if let Err(err) = &outcome {
                failures.record(account, Some(cancel.order_hash), None, err);
            }
            result.cancel_results.push(outcome);
        }

        for order in creates {
            let cid = order.cid().map(str::to_string);
            let outcome = if order.subaccount_id() != *subaccount_id {
                Err(ExchangeError::Unauthorized)
            } else if order.order_type.is_atomic() {
                self.create_atomic_market_order(order).map(|r| r.order_hash)
            } else {
                self.create_limit_order(order)
            };
            if let Err(err) = &outcome {
                failures.record(account, None, cid, err);
            }
            result.created.push(outcome);
        }

        self.emit_failures(failures);
        result
    }

    fn emit_failures(&mut self, failures: FailureLog) {
        for event in failures.events {
            info!(account = %event.account, failed = event.codes.len(), "batch items failed");
            self.emit_event(EventPayload::OrderFail(event));
        }
    }
}

#[derive(Default)]
struct FailureLog {
    events: Vec<OrderFailEvent>,
}

impl FailureLog {
    fn record(&mut self, account: Address, hash: Option<OrderHash>, cid: Option<String>, err: &ExchangeError) {
        let index = match self.events.iter().position(|e| e.account == account) {
            Some(i) => i,
            None => {
                self.events.push(OrderFailEvent {
                    account,
                    hashes: Vec::new(),
                    cids: Vec::new(),
                    codes: Vec::new(),
                });
                self.events.len() - 1
            }
        };
        let event = &mut self.events[index];
        if let Some(hash) = hash {
            event.hashes.push(hash);
        }
        if let Some(cid) = cid {
            event.cids.push(cid);
        }
        event.codes.push(err.code().0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeParams;
    use crate::engine::fixtures::{zero_fee_params, Fixture, QUOTE};
    use crate::market::RiskParams;
    use crate::order::OrderType;
    use crate::types::{Price, Side, Timestamp};
    use rust_decimal_macros::dec;

    fn taker_fee_fixture() -> Fixture {
        let risk = RiskParams {
            taker_fee_rate: dec!(0.001),
            ..zero_fee_params()
        };
        Fixture::perpetual_with(ExchangeParams::default(), risk)
    }

    #[test]
    fn cancel_refunds_the_whole_hold() {
        let mut fx = taker_fee_fixture();
        let sub = fx.trader(1, dec!(1000));
        let order = fx.order(sub, OrderType::Buy, dec!(100), dec!(10), dec!(100));
        let hash = fx.engine.create_limit_order(order).unwrap();
        // margin plus the taker fee on the notional
        assert_eq!(fx.engine.deposit_balance(&sub, QUOTE).available_balance, dec!(899));

        fx.engine.cancel_order(&fx.market, &sub, &hash).unwrap();
        let deposit = fx.engine.deposit_balance(&sub, QUOTE);
        assert_eq!(deposit.available_balance, dec!(1000));
        assert_eq!(deposit.total_balance, dec!(1000));
        assert!(matches!(
            fx.engine.cancel_order(&fx.market, &sub, &hash),
            Err(ExchangeError::OrderDoesntExist(_))
        ));
    }

    #[test]
    fn crossing_post_only_order_is_rejected() {
        let mut fx = Fixture::perpetual();
        let maker = fx.trader(1, dec!(1000));
        let taker = fx.trader(2, dec!(1000));
        let ask = fx.order(maker, OrderType::SellPostOnly, dec!(100), dec!(1), dec!(10));
        fx.engine.create_limit_order(ask).unwrap();

        let bid = fx.order(taker, OrderType::BuyPostOnly, dec!(100), dec!(1), dec!(10));
        let err = fx.engine.create_limit_order(bid).unwrap_err();
        assert!(matches!(err, ExchangeError::ExceedsTopOfBookPrice));
        assert_eq!(fx.engine.deposit_balance(&taker, QUOTE).available_balance, dec!(1000));
        assert!(fx.engine.subaccount_orders(&fx.market, &taker).is_empty());
    }

    #[test]
    fn client_order_ids_are_unique_per_subaccount() {
        let mut fx = Fixture::perpetual();
        let sub = fx.trader(1, dec!(1000));
        let mut order = fx.order(sub, OrderType::BuyPostOnly, dec!(90), dec!(1), dec!(9));
        order.order_info.cid = Some("bid-1".to_string());
        fx.engine.create_limit_order(order.clone()).unwrap();

        let err = fx.engine.create_limit_order(order).unwrap_err();
        assert!(matches!(err, ExchangeError::ClientOrderIdAlreadyExists(_)));

        fx.engine.cancel_order_by_cid(&sub, "bid-1").unwrap();
        assert!(fx.engine.get_order_by_cid(&sub, "bid-1").is_none());
        assert_eq!(fx.engine.deposit_balance(&sub, QUOTE).available_balance, dec!(1000));
    }

    #[test]
    fn batch_reports_each_failure_once() {
        let mut fx = Fixture::perpetual();
        let sub = fx.trader(1, dec!(1000));
        let orders = vec![
            fx.order(sub, OrderType::BuyPostOnly, dec!(90), dec!(1), dec!(9)),
            fx.order(sub, OrderType::BuyPostOnly, dec!(91), dec!(1), dec!(1)),
            fx.order(sub, OrderType::BuyPostOnly, dec!(92), dec!(1), dec!(9.2)),
        ];
        let results = fx.engine.batch_create_orders(orders);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ExchangeError::InsufficientOrderMargin(_))));
        assert!(results[2].is_ok());
        assert_ne!(results[0].as_ref().unwrap(), results[2].as_ref().unwrap());

        let failures: Vec<_> = fx
            .engine
            .events()
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::OrderFail(fail) => Some(fail.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].account, sub.owner());
        assert_eq!(failures[0].codes, vec![19]);
    }

    #[test]
    fn reduce_only_needs_a_position() {
        let mut fx = Fixture::perpetual();
        let sub = fx.trader(1, dec!(1000));
        let order = fx.order(sub, OrderType::SellPostOnly, dec!(110), dec!(1), dec!(0));
        let err = fx.engine.create_limit_order(order).unwrap_err();
        assert!(matches!(err, ExchangeError::PositionNotFound { .. }));
    }

    #[test]
    fn one_market_order_per_block() {
        let mut fx = Fixture::perpetual();
        let maker = fx.trader(1, dec!(1000));
        let taker = fx.trader(2, dec!(1000));
        let ask = fx.order(maker, OrderType::SellPostOnly, dec!(100), dec!(5), dec!(50));
        fx.engine.create_limit_order(ask).unwrap();

        let bid = fx.order(taker, OrderType::Buy, dec!(100), dec!(1), dec!(10));
        fx.engine.create_market_order(bid.clone()).unwrap();
        let err = fx.engine.create_market_order(bid.clone()).unwrap_err();
        assert!(matches!(err, ExchangeError::MarketOrderAlreadyExists));

        // a queued market order blocks atomic ones too
        let atomic = DerivativeOrder {
            order_type: OrderType::BuyAtomic,
            ..bid
        };
        let err = fx.engine.create_atomic_market_order(atomic).unwrap_err();
        assert!(matches!(err, ExchangeError::MarketOrderAlreadyExists));

        // but atomic orders never mark the block themselves
        let other = fx.trader(3, dec!(1000));
        for _ in 0..2 {
            let atomic = fx.order(other, OrderType::BuyAtomic, dec!(100), dec!(1), dec!(10));
            let result = fx.engine.create_atomic_market_order(atomic).unwrap();
            assert_eq!(result.filled_quantity, dec!(1));
            assert_eq!(result.average_price, Some(dec!(100)));
        }
    }

    #[test]
    fn post_only_mode_keeps_orders_off_the_other_side() {
        let params = ExchangeParams {
            post_only_mode_height_threshold: 10,
            ..ExchangeParams::default()
        };
        let mut fx = Fixture::perpetual_with(params, zero_fee_params());
        let maker = fx.trader(1, dec!(1000));
        let taker = fx.trader(2, dec!(1000));
        let ask = fx.order(maker, OrderType::SellPostOnly, dec!(100), dec!(1), dec!(10));
        fx.engine.create_limit_order(ask).unwrap();

        let buy = fx.order(taker, OrderType::Buy, dec!(100), dec!(1), dec!(10));
        assert_eq!(
            fx.engine.create_market_order(buy.clone()),
            Err(ExchangeError::PostOnlyMode(10))
        );
        assert_eq!(fx.engine.create_limit_order(buy), Err(ExchangeError::ExceedsTopOfBookPrice));

        // conditional orders get the same top-of-book check
        let mut stop = fx.order(taker, OrderType::StopBuy, dec!(120), dec!(1), dec!(60));
        stop.trigger_price = Price::new(dec!(110));
        assert_eq!(
            fx.engine.create_limit_order(stop.clone()),
            Err(ExchangeError::ExceedsTopOfBookPrice)
        );
        assert_eq!(fx.engine.deposit_balance(&taker, QUOTE).available_balance, dec!(1000));

        // a plain limit order that does not cross rests right away
        let bid = fx.order(taker, OrderType::Buy, dec!(99), dec!(1), dec!(10));
        fx.engine.create_limit_order(bid).unwrap();
        assert_eq!(fx.engine.limit_orders(&fx.market, Side::Long).len(), 1);

        fx.engine.end_block();
        fx.engine.begin_block(10, Timestamp::from_secs(1));
        assert!(!fx.engine.is_post_only_mode());
        fx.engine.create_limit_order(stop).unwrap();
        assert_eq!(fx.engine.conditional_orders(&fx.market).len(), 1);
    }

    #[test]
    fn market_order_must_reach_the_book() {
        let mut fx = Fixture::perpetual();
        let maker = fx.trader(1, dec!(1000));
        let taker = fx.trader(2, dec!(1000));
        let ask = fx.order(maker, OrderType::SellPostOnly, dec!(100), dec!(1), dec!(10));
        fx.engine.create_limit_order(ask).unwrap();

        let bid = fx.order(taker, OrderType::Buy, dec!(99), dec!(1), dec!(10));
        let err = fx.engine.create_market_order(bid).unwrap_err();
        assert_eq!(err, ExchangeError::SlippageExceedsWorstPrice);
        assert_eq!(err.code().0, 5);
        assert_eq!(fx.engine.deposit_balance(&taker, QUOTE).available_balance, dec!(1000));
    }

    #[test]
    fn small_orders_are_below_min_notional() {
        let risk = RiskParams {
            min_notional: dec!(50),
            ..zero_fee_params()
        };
        let mut fx = Fixture::perpetual_with(ExchangeParams::default(), risk);
        let sub = fx.trader(1, dec!(1000));

        let small = fx.order(sub, OrderType::BuyPostOnly, dec!(90), dec!(0.5), dec!(5));
        assert_eq!(
            fx.engine.create_limit_order(small),
            Err(ExchangeError::BelowMinNotional {
                notional: dec!(45),
                minimum: dec!(50),
            })
        );
        let enough = fx.order(sub, OrderType::BuyPostOnly, dec!(90), dec!(1), dec!(9));
        fx.engine.create_limit_order(enough).unwrap();
    }

    #[test]
    fn order_side_count_is_capped() {
        let params = ExchangeParams {
            max_derivative_order_side_count: 2,
            ..ExchangeParams::default()
        };
        let mut fx = Fixture::perpetual_with(params, zero_fee_params());
        let sub = fx.trader(1, dec!(1000));
        for price in [dec!(90), dec!(91)] {
            let bid = fx.order(sub, OrderType::BuyPostOnly, price, dec!(1), dec!(10));
            fx.engine.create_limit_order(bid).unwrap();
        }

        let bid = fx.order(sub, OrderType::BuyPostOnly, dec!(92), dec!(1), dec!(10));
        assert_eq!(fx.engine.create_limit_order(bid), Err(ExchangeError::ExceedsOrderSideCount(2)));
        // the other side has its own count
        let ask = fx.order(sub, OrderType::SellPostOnly, dec!(110), dec!(1), dec!(11));
        fx.engine.create_limit_order(ask).unwrap();
    }

    #[test]
    fn one_conditional_market_order_per_direction() {
        let mut fx = Fixture::perpetual();
        let sub = fx.trader(1, dec!(1000));
        let mut stop_buy = fx.order(sub, OrderType::StopBuy, dec!(120), dec!(1), dec!(60));
        stop_buy.trigger_price = Price::new(dec!(110));
        fx.engine.create_market_order(stop_buy.clone()).unwrap();

        let err = fx.engine.create_market_order(stop_buy).unwrap_err();
        assert_eq!(err, ExchangeError::ConditionalMarketOrderAlreadyExists);

        // triggering below the mark is the other direction
        let mut stop_sell = fx.order(sub, OrderType::StopSell, dec!(80), dec!(1), dec!(20));
        stop_sell.trigger_price = Price::new(dec!(90));
        fx.engine.create_market_order(stop_sell).unwrap();
        assert_eq!(fx.engine.conditional_orders(&fx.market).len(), 2);
    }

    #[test]
    fn reduce_only_conditional_needs_margin_locked() {
        let mut fx = Fixture::perpetual();
        let sub = fx.trader(1, dec!(1000));
        let mut stop = fx.order(sub, OrderType::StopSell, dec!(89), dec!(1), dec!(0));
        stop.trigger_price = Price::new(dec!(90));
        assert_eq!(fx.engine.create_limit_order(stop.clone()), Err(ExchangeError::NoMarginLocked));
        assert!(fx.engine.conditional_orders(&fx.market).is_empty());

        // any vanilla order locks margin
        let bid = fx.order(sub, OrderType::BuyPostOnly, dec!(90), dec!(1), dec!(9));
        fx.engine.create_limit_order(bid).unwrap();
        fx.engine.create_limit_order(stop).unwrap();
        assert_eq!(fx.engine.conditional_orders(&fx.market).len(), 1);
    }
}
