// 8.7 engine/execution.rs: matching a taker against the resting book.
//
// makers fill at their own price, best first. each fill is applied to both
// positions, deposits and the market balance; the whole execution runs in a cached
// layer and is thrown away if the market could not pay what it owes.
//
// deposit deltas per leg:
//   vanilla      total += payout - collateral - fee, available += hold released + the same
//   reduce-only  total and available += payout (fee already taken from pnl)
// market balance per leg: collateral - payout, minus the fee for reduce-only legs

use super::core::Engine;
use super::orderbook::Book;
use super::results::ExecutionOutcome;
use crate::events::{EventPayload, ExecutionType, FundingUpdateEvent, TradeBatchEvent, TradeLog};
use crate::market::DerivativeMarket;
use crate::order::{DerivativeLimitOrder, DerivativeMarketOrder};
use crate::position::{Position, PositionDelta};
use crate::types::{Address, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// The aggressive side of an execution.
#[derive(Debug, Clone)]
pub(super) struct Taker {
    pub subaccount_id: SubaccountId,
    pub order_hash: OrderHash,
    pub cid: Option<String>,
    pub side: Side,
    pub worst_price: Decimal,
    pub quantity: Decimal,
    pub margin: Decimal,
    pub hold_fee_rate: Decimal,
    pub fee_rate: Decimal,
    pub fee_recipient: Address,
    // set when the taker is a stored limit order whose fillable must track fills
    pub book: Option<Book>,
    // liquidated positions leave their losses for the liquidation to cover
    pub is_liquidation: bool,
}

impl Taker {
    pub fn from_market_order(order: &DerivativeMarketOrder, fee_rate: Decimal) -> Self {
        let notional = order.price() * order.quantity();
        let hold_fee_rate = if order.is_reduce_only() || notional.is_zero() {
            Decimal::ZERO
        } else {
            (order.margin_hold - order.margin) / notional
        };
        Self {
            subaccount_id: order.subaccount_id(),
            order_hash: order.order_hash,
            cid: order.order_info.cid.clone(),
            side: order.side(),
            worst_price: order.price(),
            quantity: order.quantity(),
            margin: order.margin,
            hold_fee_rate,
            fee_rate,
            fee_recipient: order.order_info.fee_recipient,
            book: None,
            is_liquidation: false,
        }
    }

    pub fn from_limit_order(order: &DerivativeLimitOrder, fee_rate: Decimal, book: Book) -> Self {
        Self {
            subaccount_id: order.subaccount_id(),
            order_hash: order.order_hash,
            cid: order.cid().map(str::to_string),
            side: order.side(),
            worst_price: order.price(),
            quantity: order.quantity(),
            margin: order.margin,
            hold_fee_rate: order.hold_fee_rate,
            fee_rate,
            fee_recipient: order.order_info.fee_recipient,
            book: Some(book),
            is_liquidation: false,
        }
    }

    pub fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }

    fn margin_for(&self, quantity: Decimal) -> Decimal {
        if self.quantity.is_zero() {
            return Decimal::ZERO;
        }
        self.margin * quantity / self.quantity
    }

    fn hold_for(&self, quantity: Decimal) -> Decimal {
        self.margin_for(quantity) + quantity * self.worst_price * self.hold_fee_rate.max(Decimal::ZERO)
    }

    fn crosses(&self, maker_price: Decimal) -> bool {
        match self.side {
            Side::Long => maker_price <= self.worst_price,
            Side::Short => maker_price >= self.worst_price,
        }
    }
}

/// One side of a single fill.
struct FillLeg {
    subaccount_id: SubaccountId,
    order_hash: OrderHash,
    cid: Option<String>,
    side: Side,
    quantity: Decimal,
    price: Decimal,
    margin: Decimal,
    hold_release: Decimal,
    fee_rate: Decimal,
    fee_recipient: Address,
    is_maker: bool,
    defer_losses: bool,
}

impl Engine {
    /// Fills `taker` against the resting book. Returns a zeroed, insolvent outcome
    /// when the market could not cover the execution; the market is then paused.
    pub(super) fn execute_taker(
        &mut self,
        market: &DerivativeMarket,
        taker: &Taker,
        mark_price: Option<Decimal>,
        execution_type: ExecutionType,
    ) -> ExecutionOutcome {
        let market_id = market.market_id;
        self.begin_cached();

        let mut remaining = match taker.book {
            Some(book) => match self.get_limit_order(book, &market_id, taker.side, &taker.subaccount_id, &taker.order_hash) {
                Some(order) => order.fillable,
                None => Decimal::ZERO,
            },
            None => taker.quantity,
        };

        let mut outcome = ExecutionOutcome {
            is_market_solvent: true,
            ..ExecutionOutcome::default()
        };
        let mut balance_delta = Decimal::ZERO;
        let mut maker_trades = Vec::new();
        let mut taker_trades = Vec::new();

        for candidate in self.book_orders(Book::Resting, &market_id, taker.side.opposite()) {
            if remaining <= Decimal::ZERO || !taker.crosses(candidate.price()) {
                break;
            }
            // earlier fills may have cancelled or shrunk this maker
            let Some(maker) = self.get_limit_order(
                Book::Resting,
                &market_id,
                candidate.side(),
                &candidate.subaccount_id(),
                &candidate.order_hash,
            ) else {
                continue;
            };

            let mut quantity = remaining.min(maker.fillable);
            if taker.is_reduce_only() {
                quantity = quantity.min(self.reducible_quantity(&market_id, &taker.subaccount_id, taker.side));
                if quantity.is_zero() {
                    break;
                }
            }
            if maker.is_reduce_only() {
                let reducible = self.reducible_quantity(&market_id, &maker.subaccount_id(), maker.side());
                if reducible.is_zero() {
                    self.cancel_limit_order(Book::Resting, market, &maker, crate::events::CancelReason::PositionClosed);
                    continue;
                }
                quantity = quantity.min(reducible);
            }

            let price = maker.price();
            self.record_limit_fill(Book::Resting, market, &maker, quantity);
            if let Some(book) = taker.book {
                if let Some(order) =
                    self.get_limit_order(book, &market_id, taker.side, &taker.subaccount_id, &taker.order_hash)
                {
                    self.record_limit_fill(book, market, &order, quantity);
                }
            }

            let (maker_log, maker_delta) = self.apply_fill(
                market,
                FillLeg {
                    subaccount_id: maker.subaccount_id(),
                    order_hash: maker.order_hash,
                    cid: maker.cid().map(str::to_string),
                    side: maker.side(),
                    quantity,
                    price,
                    margin: maker.margin_for(quantity),
                    hold_release: maker.hold_for(quantity),
                    fee_rate: market.params.maker_fee_rate,
                    fee_recipient: maker.order_info.fee_recipient,
                    is_maker: true,
                    defer_losses: false,
                },
            );
            let taker_hold = taker.hold_for(quantity);
            let (taker_log, taker_delta) = self.apply_fill(
                market,
                FillLeg {
                    subaccount_id: taker.subaccount_id,
                    order_hash: taker.order_hash,
                    cid: taker.cid.clone(),
                    side: taker.side,
                    quantity,
                    price,
                    margin: taker.margin_for(quantity),
                    hold_release: taker_hold,
                    fee_rate: taker.fee_rate,
                    fee_recipient: taker.fee_recipient,
                    is_maker: false,
                    defer_losses: taker.is_liquidation,
                },
            );

            balance_delta += maker_delta + taker_delta;
            outcome.filled_quantity += quantity;
            outcome.notional += quantity * price;
            outcome.taker_fee += taker_log.fee;
            outcome.taker_payout += taker_log.payout;
            outcome.taker_hold_released += taker_hold;
            maker_trades.push(maker_log);
            taker_trades.push(taker_log);

            remaining -= quantity;
            if let Some(book) = taker.book {
                // reduce-only upkeep may have cancelled the taker itself
                remaining = self
                    .get_limit_order(book, &market_id, taker.side, &taker.subaccount_id, &taker.order_hash)
                    .map(|o| o.fillable)
                    .unwrap_or(Decimal::ZERO);
            }
        }

        if outcome.filled_quantity.is_zero() {
            self.commit_cached();
            return outcome;
        }

        if self.available_market_funds(&market_id) + balance_delta < Decimal::ZERO {
            self.discard_cached();
            warn!(market = %market_id, %balance_delta, "execution would leave market insolvent");
            self.handle_insolvent_market(market);
            return ExecutionOutcome::default();
        }
        self.apply_market_balance_delta(&market_id, balance_delta);

        let is_liquidation = taker.is_liquidation;
        self.emit_event(EventPayload::TradeBatch(TradeBatchEvent {
            market_id,
            side: taker.side,
            execution_type,
            is_liquidation,
            trades: taker_trades,
        }));
        self.emit_event(EventPayload::TradeBatch(TradeBatchEvent {
            market_id,
            side: taker.side.opposite(),
            execution_type: ExecutionType::LimitMatchRestingOrder,
            is_liquidation,
            trades: maker_trades,
        }));

        if let (true, Some(mark), Some(vwap)) = (market.is_perpetual(), mark_price, outcome.average_price()) {
            self.accumulate_funding_premium(market, vwap, mark);
        }

        debug!(
            market = %market_id,
            taker = %taker.order_hash,
            filled = %outcome.filled_quantity,
            "taker executed"
        );
        self.commit_cached();
        outcome
    }

    /// Takes `quantity` off a stored limit order, removing it once fully filled.
    pub(super) fn record_limit_fill(
        &mut self,
        book: Book,
        market: &DerivativeMarket,
        order: &DerivativeLimitOrder,
        quantity: Decimal,
    ) {
        let market_id = market.market_id;
        let subaccount_id = order.subaccount_id();
        let mut updated = order.clone();
        updated.fillable -= quantity;

        self.update_orderbook_metadata(&market_id, &subaccount_id, order.side(), |m| {
            m.apply_partial_fill(order, quantity);
            if updated.fillable.is_zero() {
                m.remove_limit_order(&updated);
            }
        });
        if updated.fillable.is_zero() {
            self.delete_limit_order(book, &market_id, &updated);
            self.delete_cid(&subaccount_id, updated.cid());
        } else {
            self.set_limit_order(book, &market_id, &updated);
        }
    }

    /// Applies one leg to its position, deposit and fee recipients. Returns the
    /// trade log and the leg's market balance delta.
    fn apply_fill(&mut self, market: &DerivativeMarket, leg: FillLeg) -> (TradeLog, Decimal) {
        let market_id = market.market_id;
        let denom = market.quote_denom.clone();
        let funding = self.cumulative_funding(market);

        let before = self.position(&market_id, &leg.subaccount_id);
        let mut position = match &before {
            Some(existing) => {
                let mut p = existing.clone();
                p.apply_funding(funding);
                p
            }
            None => Position::new(leg.side, funding.unwrap_or(Decimal::ZERO)),
        };

        let is_reduce_only = leg.margin.is_zero();
        let fee = leg.quantity * leg.price * leg.fee_rate;
        let outcome = position.apply_position_delta(
            &PositionDelta {
                side: leg.side,
                execution_quantity: leg.quantity,
                execution_margin: leg.margin,
                execution_price: leg.price,
            },
            if is_reduce_only { fee } else { Decimal::ZERO },
        );

        let (available_delta, total_delta) = if is_reduce_only {
            (outcome.payout, outcome.payout)
        } else {
            let total = outcome.payout - outcome.collateralization_margin - fee;
            (leg.hold_release + total, total)
        };

        let market_payout = if leg.defer_losses {
            outcome.payout.max(Decimal::ZERO)
        } else {
            outcome.payout
        };
        let mut market_delta = outcome.collateralization_margin - market_payout;
        if is_reduce_only {
            market_delta -= fee;
        }

        self.set_position(&market_id, &leg.subaccount_id, &position);
        self.apply_deposit_delta(&leg.subaccount_id, &denom, available_delta, total_delta);
        self.distribute_fee(market, &leg.fee_recipient, fee);
        self.maintain_reduce_only_orders(market, &leg.subaccount_id, before.as_ref(), &position);

        let log = TradeLog {
            subaccount_id: leg.subaccount_id,
            order_hash: leg.order_hash,
            cid: leg.cid,
            side: leg.side,
            quantity: leg.quantity,
            price: leg.price,
            margin: leg.margin,
            payout: outcome.payout,
            fee,
            is_maker: leg.is_maker,
        };
        (log, market_delta)
    }

    fn accumulate_funding_premium(&mut self, market: &DerivativeMarket, vwap: Decimal, mark: Decimal) {
        let now = self.now();
        let Some(mut funding) = self.perpetual_funding(&market.market_id) else {
            return;
        };
        funding.accumulate_premium(vwap, mark, now);
        self.set_perpetual_funding(&market.market_id, &funding);
        self.emit_event(EventPayload::FundingUpdate(FundingUpdateEvent {
            market_id: market.market_id,
            cumulative_funding: funding.cumulative_funding,
            cumulative_price: funding.cumulative_price,
            is_hourly_funding: false,
            funding_rate: None,
            mark_price: Some(mark),
        }));
    }
}
