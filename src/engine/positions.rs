// 8.6 engine/positions.rs: stored positions, margin transfers, reduce-only upkeep.
//
// a subaccount's reduce-only orders never commit more than its position can close.
// after every fill, and before a new order on the closing side lands, the
// closing-side orders are walked from the worst-priced reduce-only order inward
// and reduce-only orders are cancelled until the overrun is gone.

use super::core::Engine;
use super::results::ExchangeError;
use crate::events::{CancelReason, EventPayload, MarginChangedEvent, PositionUpdatedEvent};
use crate::market::DerivativeMarket;
use crate::position::Position;
use crate::store::keys::{position_key, positions_prefix, subaccount_from_position_key};
use crate::store::{KvStore, TypedStore};
use crate::types::{MarketId, Price, Side, SubaccountId};
use rust_decimal::Decimal;
use tracing::debug;

impl Engine {
    pub fn position(&self, market_id: &MarketId, subaccount_id: &SubaccountId) -> Option<Position> {
        self.ledger.store().get_value(&position_key(market_id, subaccount_id))
    }

    /// All open positions in a market, in subaccount order.
    pub fn positions(&self, market_id: &MarketId) -> Vec<(SubaccountId, Position)> {
        self.ledger
            .store()
            .values::<Position>(&positions_prefix(market_id), None, None, false)
            .into_iter()
            .filter_map(|(key, position)| subaccount_from_position_key(&key).map(|sub| (sub, position)))
            .collect()
    }

    pub(super) fn set_position(&mut self, market_id: &MarketId, subaccount_id: &SubaccountId, position: &Position) {
        let key = position_key(market_id, subaccount_id);
        let stored = if position.is_empty() {
            self.ledger.store_mut().delete(&key);
            None
        } else {
            self.ledger.store_mut().set_value(&key, position);
            Some(position.clone())
        };
        self.emit_event(EventPayload::PositionUpdated(PositionUpdatedEvent {
            market_id: *market_id,
            subaccount_id: *subaccount_id,
            position: stored,
        }));
    }

    /// Stored position with funding brought up to date (not written back).
    pub(super) fn position_with_funding(
        &self,
        market: &DerivativeMarket,
        subaccount_id: &SubaccountId,
    ) -> Option<Position> {
        let mut position = self.position(&market.market_id, subaccount_id)?;
        position.apply_funding(self.cumulative_funding(market));
        Some(position)
    }

    /// Liquidation price of a stored position, after funding.
    pub fn liquidation_price(&self, market_id: &MarketId, subaccount_id: &SubaccountId) -> Result<Decimal, ExchangeError> {
        let market = self
            .get_market(market_id)
            .ok_or(ExchangeError::MarketNotFound(*market_id))?;
        let position = self
            .position_with_funding(&market, subaccount_id)
            .ok_or(ExchangeError::PositionNotFound {
                market_id: *market_id,
                subaccount_id: *subaccount_id,
            })?;
        Ok(position.liquidation_price(market.params.maintenance_margin_ratio, Decimal::ZERO))
    }

    // 8.6.1: margin transfers

    /// Moves deposit funds from `source` into the margin of `destination`'s position.
    pub fn increase_position_margin(
        &mut self,
        source: &SubaccountId,
        destination: &SubaccountId,
        market_id: &MarketId,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount(amount));
        }
        let market = self.active_market(market_id)?;
        let mut position = self
            .position_with_funding(&market, destination)
            .ok_or(ExchangeError::PositionNotFound {
                market_id: *market_id,
                subaccount_id: *destination,
            })?;

        self.cached(|e| {
            e.charge_account(source, &market.quote_denom, amount)?;
            // the hold becomes position margin
            e.apply_deposit_delta(source, &market.quote_denom, Decimal::ZERO, -amount);
            e.apply_market_balance_delta(market_id, amount);
            position.margin += amount;
            e.set_position(market_id, destination, &position);
            e.emit_event(EventPayload::MarginChanged(MarginChangedEvent {
                market_id: *market_id,
                subaccount_id: *destination,
                delta: amount,
                new_margin: position.margin,
            }));
            Ok(())
        })
    }

    /// Pulls margin out of a position back into the deposit. What is left must
    /// cover the reduce margin ratio on the entry notional, and again at mark so
    /// the liquidation price stays on the far side of it.
    pub fn decrease_position_margin(
        &mut self,
        subaccount_id: &SubaccountId,
        market_id: &MarketId,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount(amount));
        }
        let market = self.active_market(market_id)?;
        let mut position = self
            .position_with_funding(&market, subaccount_id)
            .ok_or(ExchangeError::PositionNotFound {
                market_id: *market_id,
                subaccount_id: *subaccount_id,
            })?;
        if amount > position.margin {
            return Err(ExchangeError::InsufficientPositionMargin {
                ratio: Decimal::ZERO,
                required: market.params.initial_margin_ratio,
            });
        }

        let mark = self.mark_price(&market)?;
        position.margin -= amount;
        let required = market.params.initial_margin_ratio.max(market.params.reduce_margin_ratio);
        let entry_notional = position.entry_price * position.quantity;
        if position.margin < required * entry_notional {
            return Err(ExchangeError::InsufficientPositionMargin {
                ratio: position.margin / entry_notional,
                required,
            });
        }
        let ratio = position.margin_ratio(mark, Decimal::ZERO);
        if ratio < required || position.is_liquidatable(mark, market.params.maintenance_margin_ratio, Decimal::ZERO) {
            return Err(ExchangeError::InsufficientPositionMargin { ratio, required });
        }
        if self.market_balance(market_id) < amount {
            return Err(ExchangeError::InsufficientMarketBalance(amount));
        }

        self.cached(|e| {
            e.apply_market_balance_delta(market_id, -amount);
            e.apply_deposit_delta(subaccount_id, &market.quote_denom, amount, amount);
            e.set_position(market_id, subaccount_id, &position);
            e.emit_event(EventPayload::MarginChanged(MarginChangedEvent {
                market_id: *market_id,
                subaccount_id: *subaccount_id,
                delta: -amount,
                new_margin: position.margin,
            }));
            Ok(())
        })
    }

    // 8.6.2: reduce-only upkeep

    /// Quantity an order on `order_side` could still close.
    pub(super) fn reducible_quantity(&self, market_id: &MarketId, subaccount_id: &SubaccountId, order_side: Side) -> Decimal {
        match self.position(market_id, subaccount_id) {
            Some(position) if position.side != order_side => position.quantity,
            _ => Decimal::ZERO,
        }
    }

    /// Cancels reduce-only orders that would close more than `position` holds.
    /// `incoming` is an order about to land on the closing side, as (price, quantity).
    pub(super) fn trim_reduce_only_orders(
        &mut self,
        market: &DerivativeMarket,
        subaccount_id: &SubaccountId,
        position: &Position,
        incoming: Option<(Decimal, Decimal)>,
    ) {
        let side = position.closing_side();
        let mut orders = self.subaccount_side_orders(&market.market_id, subaccount_id, side);

        // everything up to the worst reduce-only order, plus vanillas sharing its price
        let Some(worst) = orders.iter().rposition(|(_, o)| o.is_reduce_only()) else {
            return;
        };
        let worst_price = orders[worst].1.price();
        let end = worst + orders[worst..].iter().take_while(|(_, o)| o.price() == worst_price).count();
        orders.truncate(end);

        if let Some((price, _)) = incoming {
            // resting orders at the same price keep time priority over the newcomer
            let newcomer = Price::new_unchecked(price);
            let ahead_of_worst = price != worst_price && newcomer.is_better_or_equal(Price::new_unchecked(worst_price), side);
            if !ahead_of_worst {
                return;
            }
        }

        let total: Decimal = orders.iter().map(|(_, o)| o.fillable).sum();
        let flipping = total - position.quantity + incoming.map_or(Decimal::ZERO, |(_, quantity)| quantity);
        if flipping <= Decimal::ZERO {
            return;
        }

        // worst price first, reduce-only ahead of vanilla at the same price
        orders.sort_by(|(_, a), (_, b)| {
            let by_price = match side {
                Side::Long => a.price().cmp(&b.price()),
                Side::Short => b.price().cmp(&a.price()),
            };
            by_price.then_with(|| b.is_reduce_only().cmp(&a.is_reduce_only()))
        });

        let mut checked = Decimal::ZERO;
        let mut overrun = Vec::new();
        for (book, order) in orders {
            if let Some((price, _)) = incoming {
                if !Price::new_unchecked(price).is_better_or_equal(order.order_info.price, side) {
                    break;
                }
            }
            checked += order.fillable;
            if order.is_reduce_only() {
                overrun.push((book, order));
            }
            if checked >= flipping {
                break;
            }
        }

        for (book, order) in overrun {
            debug!(market = %market.market_id, order = %order.order_hash, "reduce-only order overruns position");
            self.cancel_limit_order(book, market, &order, CancelReason::ReduceOnlyConflict);
        }
    }

    /// Closing-side quantity already committed at prices equal to or better than `price`.
    pub(super) fn committed_quantity_at_or_better(
        &self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        side: Side,
        price: Decimal,
    ) -> Decimal {
        self.subaccount_side_orders(market_id, subaccount_id, side)
            .iter()
            .filter(|(_, o)| o.order_info.price.is_better_or_equal(Price::new_unchecked(price), side))
            .map(|(_, o)| o.fillable)
            .sum()
    }

    /// Runs after a fill moved a subaccount's position from `before` to `after`.
    pub(super) fn maintain_reduce_only_orders(
        &mut self,
        market: &DerivativeMarket,
        subaccount_id: &SubaccountId,
        before: Option<&Position>,
        after: &Position,
    ) {
        let Some(before) = before.filter(|p| !p.is_empty()) else {
            return;
        };
        let closing_side = before.closing_side();
        if after.is_empty() || after.side != before.side {
            self.cancel_subaccount_limit_orders(
                market,
                subaccount_id,
                |o| o.is_reduce_only() && o.side() == closing_side,
                CancelReason::PositionClosed,
            );
            self.flag_no_margin_locked(&market.market_id, subaccount_id, closing_side);
        } else if after.quantity < before.quantity {
            self.trim_reduce_only_orders(market, subaccount_id, after, None);
        }
    }

    /// Reduce-only conditional orders need a position or vanilla orders to
    /// become meaningful; without either they are cancelled.
    pub(super) fn invalidate_conditional_orders_if_no_margin_locked(
        &mut self,
        market: &DerivativeMarket,
        subaccount_id: &SubaccountId,
    ) {
        let market_id = market.market_id;
        if self.position(&market_id, subaccount_id).is_some() {
            return;
        }
        let has_vanilla = [Side::Long, Side::Short]
            .iter()
            .any(|side| self.orderbook_metadata(&market_id, subaccount_id, *side).has_vanilla_orders());
        if has_vanilla {
            return;
        }
        self.cancel_subaccount_conditional_orders(
            market,
            subaccount_id,
            |o| o.order.is_reduce_only(),
            CancelReason::NoMarginLocked,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeParams;
    use crate::engine::fixtures::{Fixture, QUOTE};
    use crate::order::OrderType;
    use crate::oracle::StaticOracle;
    use crate::types::{Address, OrderHash};
    use rust_decimal_macros::dec;

    /// Long `quantity` @ 100 for a fresh trader, opened against a resting ask.
    fn long_position(fx: &mut Fixture, quantity: Decimal, margin: Decimal) -> SubaccountId {
        let holder = fx.trader(1, dec!(1000));
        let maker = fx.trader(2, dec!(1000));
        let ask = fx.order(maker, OrderType::SellPostOnly, dec!(100), quantity, quantity * dec!(10));
        fx.engine.create_limit_order(ask).unwrap();
        let buy = fx.order(holder, OrderType::BuyAtomic, dec!(100), quantity, margin);
        fx.engine.create_atomic_market_order(buy).unwrap();
        holder
    }

    fn sell(fx: &mut Fixture, sub: SubaccountId, price: Decimal, quantity: Decimal, margin: Decimal) -> OrderHash {
        let order = fx.order(sub, OrderType::SellPostOnly, price, quantity, margin);
        fx.engine.create_limit_order(order).unwrap()
    }

    /// (price, fillable, reduce-only) of the resting asks, best first.
    fn asks(fx: &Fixture) -> Vec<(Decimal, Decimal, bool)> {
        fx.engine
            .limit_orders(&fx.market, Side::Short)
            .iter()
            .map(|o| (o.price(), o.fillable, o.is_reduce_only()))
            .collect()
    }

    fn cancelled(fx: &Fixture, reason: CancelReason) -> Vec<OrderHash> {
        fx.engine
            .events()
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::OrderCanceled(c) if c.reason == reason => Some(c.order_hash),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn closed_positions_are_removed() {
        let mut engine = Engine::with_oracle(ExchangeParams::default(), StaticOracle::default()).unwrap();
        let market = MarketId([1; 32]);
        let sub = SubaccountId::new(Address([2; 20]), 1);

        let mut position = Position::new(Side::Long, dec!(0));
        position.quantity = dec!(2);
        position.entry_price = dec!(100);
        position.margin = dec!(40);
        engine.set_position(&market, &sub, &position);
        assert_eq!(engine.positions(&market), vec![(sub, position.clone())]);
        assert_eq!(engine.reducible_quantity(&market, &sub, Side::Short), dec!(2));
        assert_eq!(engine.reducible_quantity(&market, &sub, Side::Long), dec!(0));

        position.quantity = dec!(0);
        engine.set_position(&market, &sub, &position);
        assert!(engine.position(&market, &sub).is_none());
        assert!(engine.positions(&market).is_empty());
    }

    #[test]
    fn new_order_cancels_worst_reduce_only_first() {
        let mut fx = Fixture::perpetual();
        let holder = long_position(&mut fx, dec!(8), dec!(80));
        sell(&mut fx, holder, dec!(105), dec!(3), dec!(0));
        let at_110 = sell(&mut fx, holder, dec!(110), dec!(4), dec!(0));
        let at_115 = sell(&mut fx, holder, dec!(115), dec!(1), dec!(0));
        assert_eq!(asks(&fx).len(), 3);

        // 3 more ahead of them would let the reduce-only orders close 3 past the position
        sell(&mut fx, holder, dec!(101), dec!(3), dec!(31));
        assert_eq!(
            asks(&fx),
            vec![(dec!(101), dec!(3), false), (dec!(105), dec!(3), true)]
        );
        assert_eq!(cancelled(&fx, CancelReason::ReduceOnlyConflict), vec![at_115, at_110]);
    }

    #[test]
    fn orders_behind_every_reduce_only_cancel_nothing() {
        let mut fx = Fixture::perpetual();
        let holder = long_position(&mut fx, dec!(8), dec!(80));
        sell(&mut fx, holder, dec!(105), dec!(8), dec!(0));

        sell(&mut fx, holder, dec!(120), dec!(3), dec!(36));
        assert_eq!(
            asks(&fx),
            vec![(dec!(105), dec!(8), true), (dec!(120), dec!(3), false)]
        );
        assert!(cancelled(&fx, CancelReason::ReduceOnlyConflict).is_empty());
    }

    #[test]
    fn reduce_only_order_is_resized_to_what_is_left() {
        let mut fx = Fixture::perpetual();
        let holder = long_position(&mut fx, dec!(8), dec!(80));
        sell(&mut fx, holder, dec!(105), dec!(3), dec!(0));
        sell(&mut fx, holder, dec!(110), dec!(4), dec!(0));

        sell(&mut fx, holder, dec!(120), dec!(5), dec!(0));
        assert_eq!(
            asks(&fx),
            vec![
                (dec!(105), dec!(3), true),
                (dec!(110), dec!(4), true),
                (dec!(120), dec!(1), true),
            ]
        );

        let order = fx.order(holder, OrderType::SellPostOnly, dec!(125), dec!(1), dec!(0));
        let err = fx.engine.create_limit_order(order).unwrap_err();
        assert_eq!(err, ExchangeError::InsufficientPositionQuantity);
        assert_eq!(err.code().0, 17);
        assert_eq!(asks(&fx).len(), 3);
    }

    #[test]
    fn shrinking_position_trims_reduce_only_orders() {
        let mut fx = Fixture::perpetual();
        let holder = long_position(&mut fx, dec!(8), dec!(80));
        let at_105 = sell(&mut fx, holder, dec!(105), dec!(3), dec!(0));
        let at_110 = sell(&mut fx, holder, dec!(110), dec!(4), dec!(0));
        let at_115 = sell(&mut fx, holder, dec!(115), dec!(1), dec!(0));
        let market = fx.engine.get_market(&fx.market).unwrap();

        let before = fx.engine.position(&fx.market, &holder).unwrap();
        let mut after = before.clone();
        after.quantity = dec!(5);
        fx.engine.maintain_reduce_only_orders(&market, &holder, Some(&before), &after);
        assert_eq!(asks(&fx), vec![(dec!(105), dec!(3), true)]);
        assert_eq!(cancelled(&fx, CancelReason::ReduceOnlyConflict), vec![at_115, at_110]);

        after.quantity = Decimal::ZERO;
        let before = Position {
            quantity: dec!(5),
            ..before
        };
        fx.engine.maintain_reduce_only_orders(&market, &holder, Some(&before), &after);
        assert!(asks(&fx).is_empty());
        assert_eq!(cancelled(&fx, CancelReason::PositionClosed), vec![at_105]);
    }

    #[test]
    fn margin_comes_back_while_requirements_hold() {
        let mut fx = Fixture::perpetual();
        let holder = long_position(&mut fx, dec!(1), dec!(20));
        let market = fx.market;
        assert_eq!(fx.engine.deposit_balance(&holder, QUOTE).available_balance, dec!(980));

        fx.engine.decrease_position_margin(&holder, &market, dec!(5)).unwrap();
        assert_eq!(fx.engine.position(&market, &holder).unwrap().margin, dec!(15));
        assert_eq!(fx.engine.deposit_balance(&holder, QUOTE).available_balance, dec!(985));
        assert_eq!(
            fx.engine.decrease_position_margin(&holder, &market, dec!(0)),
            Err(ExchangeError::InvalidAmount(dec!(0)))
        );
    }

    #[test]
    fn margin_decrease_keeps_the_entry_floor() {
        let mut fx = Fixture::perpetual();
        let holder = long_position(&mut fx, dec!(1), dec!(20));
        let market = fx.market;

        // the unrealized profit does not count towards the floor
        fx.set_mark(dec!(120));
        let err = fx.engine.decrease_position_margin(&holder, &market, dec!(15)).unwrap_err();
        assert_eq!(
            err,
            ExchangeError::InsufficientPositionMargin {
                ratio: dec!(0.05),
                required: dec!(0.1),
            }
        );
        assert_eq!(fx.engine.position(&market, &holder).unwrap().margin, dec!(20));
        assert_eq!(fx.engine.deposit_balance(&holder, QUOTE).available_balance, dec!(980));
    }

    #[test]
    fn margin_decrease_keeps_the_requirement_at_mark() {
        let mut fx = Fixture::perpetual();
        let holder = long_position(&mut fx, dec!(1), dec!(20));
        let market = fx.market;

        // 15 covers 10% of entry, but at 92 the equity is 7 against 9.2 required
        fx.set_mark(dec!(92));
        let err = fx.engine.decrease_position_margin(&holder, &market, dec!(5)).unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientPositionMargin { required, .. } if required == dec!(0.1)));
        assert_eq!(fx.engine.position(&market, &holder).unwrap().margin, dec!(20));

        fx.engine.decrease_position_margin(&holder, &market, dec!(2)).unwrap();
        assert_eq!(fx.engine.position(&market, &holder).unwrap().margin, dec!(18));
    }
}
