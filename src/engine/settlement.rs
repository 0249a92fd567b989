// 8.11 engine/settlement.rs: closing every position in a market at one price.
//
// 8.11.1 socialized loss. the market balance must cover every positive payout.
// what it cannot cover is drawn from the insurance fund; what the fund cannot
// cover is taken from profits first, then from whole payouts. a surplus goes
// the other way, into the insurance fund.
//
// 8.11.2 close-all, 8.11.3 scheduling, 8.11.4 expiry futures, 8.11.5 binary options.

use super::core::Engine;
use super::deposits::AUCTION_SUBACCOUNT;
use super::results::{ExchangeError, SettlementResult};
use crate::events::{
    AllPositionsHaircutEvent, CancelReason, EventPayload, ExecutionType, MarketBeyondBankruptcyEvent,
    MarketScheduledEvent, MarketSettledEvent, TradeBatchEvent, TradeLog,
};
use crate::market::{DerivativeMarket, MarketKind, MarketStatus};
use crate::position::Position;
use crate::store::keys::{
    market_scoped, timestamp_index_end, timestamp_index_prefix, BINARY_OPTIONS_EXPIRY, BINARY_OPTIONS_SETTLEMENT,
    EXPIRY_FUTURES_BY_TIMESTAMP, SCHEDULED_SETTLEMENT,
};
use crate::store::{KvStore, TypedStore};
use crate::types::{Address, MarketId, OrderHash, SettlementPrice, Side, SubaccountId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// A pending forced settlement. No price means "use the mark price at settlement time".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledSettlement {
    pub market_id: MarketId,
    pub settlement_price: Option<SettlementPrice>,
}

// 8.11.1
#[derive(Debug, Default)]
struct SocializedLoss {
    positions: Vec<(SubaccountId, Position)>,
    deficit: Decimal,
    surplus: Decimal,
    total_profits: Decimal,
    total_positive_payouts: Decimal,
    // binary option refunds only
    total_liabilities: Decimal,
}

fn clamp_binary_price(price: Decimal) -> Decimal {
    price.max(Decimal::ZERO).min(Decimal::ONE)
}

impl Engine {
    fn socialized_loss(
        &self,
        market: &DerivativeMarket,
        closing_fee_rate: Decimal,
        price: SettlementPrice,
    ) -> SocializedLoss {
        let funding = self.cumulative_funding(market);
        let positions: Vec<(SubaccountId, Position)> = self
            .positions(&market.market_id)
            .into_iter()
            .map(|(sub, mut position)| {
                position.apply_funding(funding);
                (sub, position)
            })
            .collect();
        let balance = self.market_balance(&market.market_id);

        let settle_price = match price {
            SettlementPrice::Price(p) => p,
            SettlementPrice::Refund => {
                // each contract is backed by exactly one unit split between its two sides
                let liabilities: Decimal = positions.iter().map(|(_, p)| p.margin).sum();
                let assets: Decimal = positions.iter().map(|(_, p)| p.quantity).sum::<Decimal>() / Decimal::TWO;
                let mut deficit = (liabilities - assets).max(Decimal::ZERO);
                let mut surplus = (assets - liabilities).max(Decimal::ZERO);
                deficit = deficit.max(surplus + liabilities - balance);
                if deficit > Decimal::ZERO {
                    surplus = Decimal::ZERO;
                }
                return SocializedLoss {
                    positions,
                    deficit,
                    surplus,
                    total_profits: assets,
                    total_positive_payouts: liabilities,
                    total_liabilities: liabilities,
                };
            }
        };

        let mut loss = SocializedLoss::default();
        let mut deficits = Decimal::ZERO;
        for (_, position) in &positions {
            let payout = position.payout_if_fully_closing(settle_price, closing_fee_rate);
            if payout.is_profitable {
                loss.total_profits += payout.pnl_notional;
                if position.margin < Decimal::ZERO {
                    loss.total_profits += position.margin;
                }
            }
            if payout.payout < Decimal::ZERO {
                deficits += payout.payout.abs();
            } else {
                loss.total_positive_payouts += payout.payout;
            }
        }
        loss.deficit = deficits.max(loss.total_positive_payouts - balance);
        if loss.deficit <= Decimal::ZERO {
            loss.surplus = balance - loss.total_positive_payouts;
            loss.deficit = Decimal::ZERO;
        }
        loss.positions = positions;
        loss
    }

    /// Spreads `remaining` over the profitable side. Returns the haircut rate applied.
    fn haircut_positions(
        &mut self,
        market: &DerivativeMarket,
        loss: &mut SocializedLoss,
        price: SettlementPrice,
        remaining: Decimal,
    ) -> Decimal {
        let market_id = market.market_id;
        let settle_price = match price {
            SettlementPrice::Price(p) => p,
            SettlementPrice::Refund => {
                let rate = if loss.total_liabilities.is_zero() {
                    Decimal::ONE
                } else {
                    (remaining / loss.total_liabilities).min(Decimal::ONE)
                };
                for (_, position) in loss.positions.iter_mut() {
                    position.apply_margin_haircut(rate);
                }
                warn!(market = %market_id, %rate, "refund margins haircut");
                self.emit_event(EventPayload::AllPositionsHaircut(AllPositionsHaircutEvent {
                    market_id,
                    settlement_price: None,
                    missing_funds_rate: rate,
                }));
                return rate;
            }
        };

        let mut rate = Decimal::ZERO;
        let profits = loss.total_profits;
        if profits > Decimal::ZERO {
            let taken = remaining.min(profits);
            for (_, position) in loss.positions.iter_mut() {
                if position.payout_if_fully_closing(settle_price, Decimal::ZERO).is_profitable {
                    position.apply_profit_haircut(taken, profits, settle_price);
                }
            }
            rate = taken / profits;
        }

        if remaining <= profits {
            warn!(market = %market_id, %rate, "profits haircut");
            self.emit_event(EventPayload::AllPositionsHaircut(AllPositionsHaircutEvent {
                market_id,
                settlement_price: Some(settle_price),
                missing_funds_rate: rate,
            }));
            return rate;
        }

        // profits are gone, the rest comes out of whole payouts
        let remaining_deficit = remaining - profits.max(Decimal::ZERO);
        let remaining_payouts = loss.total_positive_payouts - profits.max(Decimal::ZERO);
        if remaining_payouts < remaining_deficit {
            for (_, position) in loss.positions.iter_mut() {
                if position.payout_if_fully_closing(settle_price, Decimal::ZERO).payout > Decimal::ZERO {
                    position.close_without_payout();
                }
            }
            let missing_funds = remaining_deficit - remaining_payouts;
            error!(market = %market_id, %missing_funds, "market beyond bankruptcy");
            self.emit_event(EventPayload::MarketBeyondBankruptcy(MarketBeyondBankruptcyEvent {
                market_id,
                settlement_price: Some(settle_price),
                missing_funds,
            }));
            return Decimal::ONE;
        }

        for (_, position) in loss.positions.iter_mut() {
            if position.payout_if_fully_closing(settle_price, Decimal::ZERO).payout > Decimal::ZERO {
                position.apply_total_payout_haircut(remaining_deficit, remaining_payouts, settle_price);
            }
        }
        rate = remaining_deficit / remaining_payouts;
        warn!(market = %market_id, %rate, "all payouts haircut");
        self.emit_event(EventPayload::AllPositionsHaircut(AllPositionsHaircutEvent {
            market_id,
            settlement_price: Some(settle_price),
            missing_funds_rate: rate,
        }));
        rate
    }

    /// Cancels the market's orders and closes every position at `price`.
    /// The caller owns the status change that follows.
    pub(super) fn settle_market(
        &mut self,
        market: &DerivativeMarket,
        closing_fee_rate: Decimal,
        price: SettlementPrice,
        is_market_liquidation: bool,
    ) -> SettlementResult {
        let market_id = market.market_id;
        self.cancel_all_orders_in_market(market, false, CancelReason::MarketSettlement);

        let mut loss = self.socialized_loss(market, closing_fee_rate, price);
        let mut insurance_draw = Decimal::ZERO;
        let mut haircut_rate = Decimal::ZERO;

        if loss.surplus > Decimal::ZERO {
            self.move_to_insurance_fund(market, loss.surplus.trunc());
        } else if loss.deficit > Decimal::ZERO {
            let fund_before = self.insurance.balance(&self.ledger, &market_id);
            let remaining = self.pay_deficit_from_insurance_fund(&market_id, loss.deficit);
            insurance_draw = fund_before - self.insurance.balance(&self.ledger, &market_id);
            if remaining > Decimal::ZERO {
                haircut_rate = self.haircut_positions(market, &mut loss, price, remaining);
            }
        }

        let (positions_closed, total_payout) =
            self.close_all_positions(market, loss.positions, closing_fee_rate, price, is_market_liquidation);
        info!(
            market = %market_id,
            price = %price,
            positions = positions_closed,
            %total_payout,
            %insurance_draw,
            %haircut_rate,
            "market settled"
        );
        SettlementResult {
            market_id,
            positions_closed,
            total_payout,
            insurance_draw,
            haircut_rate,
        }
    }

    // 8.11.2
    fn close_all_positions(
        &mut self,
        market: &DerivativeMarket,
        positions: Vec<(SubaccountId, Position)>,
        closing_fee_rate: Decimal,
        price: SettlementPrice,
        is_market_liquidation: bool,
    ) -> (usize, Decimal) {
        let market_id = market.market_id;
        let mut balance = self.market_balance(&market_id);
        let mut deposit_deltas: BTreeMap<SubaccountId, Decimal> = BTreeMap::new();
        let mut buys = Vec::new();
        let mut sells = Vec::new();
        let mut fees = Decimal::ZERO;
        let mut total_payout = Decimal::ZERO;
        let closed = positions.len();

        for (subaccount_id, mut position) in positions {
            let quantity = position.quantity;
            let side = position.closing_side();
            let outcome = match price {
                SettlementPrice::Price(p) => position.close_with_settle_price(p, closing_fee_rate),
                SettlementPrice::Refund => position.close_by_refunding(),
            };
            // a position in deficit was already socialized; it pays nothing back
            let paid = outcome.payout.max(Decimal::ZERO);
            if outcome.payout >= Decimal::ZERO {
                fees += outcome.closing_fee;
            }
            balance -= paid;
            total_payout += paid;
            *deposit_deltas.entry(subaccount_id).or_default() += paid;

            if !quantity.is_zero() {
                let trade = TradeLog {
                    subaccount_id,
                    order_hash: OrderHash::ZERO,
                    cid: None,
                    side,
                    quantity,
                    price: outcome.delta.execution_price,
                    margin: Decimal::ZERO,
                    payout: paid,
                    fee: outcome.closing_fee,
                    is_maker: false,
                };
                match side {
                    Side::Long => buys.push(trade),
                    Side::Short => sells.push(trade),
                }
            }
            position.close_without_payout();
            self.set_position(&market_id, &subaccount_id, &position);
        }

        let fee_paid = fees.min(balance.max(Decimal::ZERO));
        balance -= fee_paid;
        if balance < Decimal::ZERO {
            warn!(market = %market_id, %balance, "settlement left market balance negative");
            balance = Decimal::ZERO;
        }
        self.set_market_balance(&market_id, balance);
        self.apply_deposit_delta(&AUCTION_SUBACCOUNT, &market.quote_denom, fee_paid, fee_paid);
        for (subaccount_id, amount) in deposit_deltas {
            self.apply_deposit_delta(&subaccount_id, &market.quote_denom, amount, amount);
        }

        let execution_type = if is_market_liquidation {
            ExecutionType::MarketLiquidation
        } else {
            ExecutionType::MarketSettlement
        };
        for (side, trades) in [(Side::Long, buys), (Side::Short, sells)] {
            if trades.is_empty() {
                continue;
            }
            self.emit_event(EventPayload::TradeBatch(TradeBatchEvent {
                market_id,
                side,
                execution_type,
                is_liquidation: is_market_liquidation,
                trades,
            }));
        }
        (closed, total_payout)
    }

    fn finish_settlement(
        &mut self,
        market: &mut DerivativeMarket,
        status: MarketStatus,
        price: SettlementPrice,
        result: &SettlementResult,
    ) {
        if let Err(err) = self.set_market_status(market, status) {
            error!(market = %market.market_id, error = %err, "settled market kept its status");
        }
        self.emit_event(EventPayload::MarketSettled(MarketSettledEvent {
            market_id: market.market_id,
            settlement_price: price.price(),
            status: market.status,
            total_payout: result.total_payout,
            insurance_draw: result.insurance_draw,
        }));
    }

    // 8.11.3: scheduling

    pub fn scheduled_settlement(&self, market_id: &MarketId) -> Option<ScheduledSettlement> {
        self.ledger
            .store()
            .get_value(&market_scoped(SCHEDULED_SETTLEMENT, market_id))
    }

    fn store_scheduled_settlement(&mut self, market_id: &MarketId, price: Option<SettlementPrice>) {
        let scheduled = ScheduledSettlement {
            market_id: *market_id,
            settlement_price: price,
        };
        self.ledger
            .store_mut()
            .set_value(&market_scoped(SCHEDULED_SETTLEMENT, market_id), &scheduled);
        info!(market = %market_id, price = ?price, "market scheduled for settlement");
        self.emit_event(EventPayload::MarketScheduledForSettlement(MarketScheduledEvent {
            market_id: *market_id,
            settlement_price: price.and_then(|p| p.price()),
        }));
    }

    /// Forced settlement at the next block. `None` (or zero) settles at the mark price then.
    pub fn schedule_market_settlement(
        &mut self,
        market_id: &MarketId,
        settlement_price: Option<Decimal>,
    ) -> Result<(), ExchangeError> {
        let market = self
            .get_market(market_id)
            .ok_or(ExchangeError::MarketNotFound(*market_id))?;
        if !matches!(market.status, MarketStatus::Active | MarketStatus::Paused) {
            return Err(ExchangeError::InvalidMarketStatus(market.status));
        }
        let price = match settlement_price {
            Some(p) if p < Decimal::ZERO => {
                return Err(ExchangeError::InvalidSettlement(format!("settlement price {p} is negative")));
            }
            Some(p) if p.is_zero() => None,
            Some(p) if market.is_binary_option() => Some(SettlementPrice::Price(clamp_binary_price(p))),
            Some(p) => Some(SettlementPrice::Price(p)),
            None => None,
        };
        if self.scheduled_settlement(market_id).is_some() {
            return Err(ExchangeError::MarketAlreadyScheduledToSettle(*market_id));
        }
        self.store_scheduled_settlement(market_id, price);
        Ok(())
    }

    /// Stops trading now and settles at the next block, at the current mark price.
    pub fn pause_market_and_schedule_for_settlement(
        &mut self,
        market_id: &MarketId,
        cancel_market_orders: bool,
    ) -> Result<(), ExchangeError> {
        let mut market = self
            .get_market(market_id)
            .ok_or(ExchangeError::MarketNotFound(*market_id))?;
        if self.scheduled_settlement(market_id).is_some() {
            return Err(ExchangeError::MarketAlreadyScheduledToSettle(*market_id));
        }
        let price = match (self.mark_price(&market), market.is_binary_option()) {
            (Ok(p), true) => SettlementPrice::Price(clamp_binary_price(p)),
            (Ok(p), false) => SettlementPrice::Price(p),
            (Err(_), true) => SettlementPrice::Refund,
            (Err(err), false) => {
                return Err(ExchangeError::InvalidSettlement(format!("no settlement price: {err}")));
            }
        };

        self.cancel_all_orders_in_market(&market, cancel_market_orders, CancelReason::MarketSettlement);
        self.store_scheduled_settlement(market_id, Some(price));
        if market.is_active() {
            self.demolish_or_pause_market(&mut market);
        }
        Ok(())
    }

    /// Settles every scheduled market with no closing fee.
    pub fn process_markets_scheduled_to_settle(&mut self) -> Vec<SettlementResult> {
        let scheduled = self
            .ledger
            .store()
            .values::<ScheduledSettlement>(&[SCHEDULED_SETTLEMENT], None, None, false);
        let mut results = Vec::new();

        for (key, schedule) in scheduled {
            let Some(mut market) = self.get_market(&schedule.market_id) else {
                self.ledger.store_mut().delete(&key);
                continue;
            };
            let price = match schedule.settlement_price {
                Some(price) => price,
                None => match self.mark_price(&market) {
                    Ok(p) if market.is_binary_option() => SettlementPrice::Price(clamp_binary_price(p)),
                    Ok(p) => SettlementPrice::Price(p),
                    Err(err) => {
                        warn!(market = %market.market_id, error = %err, "no settlement price, pausing");
                        if market.is_active() {
                            self.demolish_or_pause_market(&mut market);
                        }
                        continue;
                    }
                },
            };

            let result = self.settle_market(&market, Decimal::ZERO, price, !market.is_binary_option());
            self.ledger.store_mut().delete(&key);
            if let Some(info) = market.expiry_info() {
                for index in Self::expiry_index_keys(&market.market_id, info) {
                    self.ledger.store_mut().delete(&index);
                }
            }
            let status = if market.is_binary_option() {
                MarketStatus::Demolished
            } else if market.status == MarketStatus::Active {
                MarketStatus::Paused
            } else {
                market.status
            };
            self.finish_settlement(&mut market, status, price, &result);
            results.push(result);
        }
        results
    }

    // 8.11.4: expiry futures. the index holds two keys per market: twap start and expiry.

    pub fn process_mature_expiry_future_markets(&mut self) -> Vec<SettlementResult> {
        let now = self.now();
        let end = timestamp_index_end(now);
        let due = self.ledger.store().values::<MarketId>(
            &timestamp_index_prefix(EXPIRY_FUTURES_BY_TIMESTAMP),
            None,
            Some(&end),
            false,
        );
        let mut results = Vec::new();

        for (key, market_id) in due {
            let market = match self.get_market(&market_id) {
                Some(market) if market.is_active() => market,
                _ => {
                    self.ledger.store_mut().delete(&key);
                    continue;
                }
            };
            let Some(info) = market.expiry_info().cloned() else {
                self.ledger.store_mut().delete(&key);
                continue;
            };

            if info.is_premature(now) {
                continue;
            }
            if !info.is_matured(now) {
                if info.is_starting_maturation(now) {
                    self.start_expiry_twap(market, now);
                }
                self.ledger.store_mut().delete(&key);
                continue;
            }
            if let Some(result) = self.settle_expiry_future(market) {
                results.push(result);
            }
        }
        results
    }

    fn start_expiry_twap(&mut self, mut market: DerivativeMarket, now: Timestamp) {
        let cumulative = match self.oracle.cumulative_price(&market.oracle, now) {
            Ok(c) => c,
            Err(err) => {
                warn!(market = %market.market_id, error = %err, "cannot start settlement twap");
                return;
            }
        };
        if let MarketKind::ExpiryFuture(info) = &mut market.kind {
            info.twap_start_price_cumulative = cumulative;
            info.twap_start_timestamp = now;
        }
        info!(market = %market.market_id, %cumulative, "settlement twap started");
        self.set_market(&market);
    }

    fn settle_expiry_future(&mut self, mut market: DerivativeMarket) -> Option<SettlementResult> {
        let now = self.now();
        let info = market.expiry_info()?.clone();
        let window = now.as_secs() - info.twap_start_timestamp.as_secs();

        let twap = if window <= 0 || info.twap_start_price_cumulative.is_zero() {
            self.mark_price(&market).ok()
        } else {
            self.oracle
                .cumulative_price(&market.oracle, now)
                .ok()
                .map(|c| (c - info.twap_start_price_cumulative) / Decimal::from(window))
        };
        let index_keys = Self::expiry_index_keys(&market.market_id, &info);
        for key in &index_keys {
            self.ledger.store_mut().delete(key);
        }

        let Some(twap) = twap.filter(|p| *p > Decimal::ZERO) else {
            warn!(market = %market.market_id, "no settlement twap, pausing");
            self.demolish_or_pause_market(&mut market);
            return None;
        };

        let price = SettlementPrice::Price(twap);
        let result = self.settle_market(&market, market.params.taker_fee_rate, price, false);
        if let MarketKind::ExpiryFuture(info) = &mut market.kind {
            info.settlement_price = Some(twap);
        }
        self.finish_settlement(&mut market, MarketStatus::Expired, price, &result);
        Some(result)
    }

    // 8.11.5: binary options. expiry stops trading, settlement pays out.

    pub fn process_binary_options_markets(&mut self) -> Vec<SettlementResult> {
        let now = self.now();
        let end = timestamp_index_end(now);

        let expiring = self.ledger.store().values::<MarketId>(
            &timestamp_index_prefix(BINARY_OPTIONS_EXPIRY),
            None,
            Some(&end),
            false,
        );
        for (key, market_id) in expiring {
            self.ledger.store_mut().delete(&key);
            let Some(mut market) = self.get_market(&market_id) else {
                continue;
            };
            if !market.is_active() {
                continue;
            }
            self.cancel_all_orders_in_market(&market, true, CancelReason::MarketExpired);
            if let Err(err) = self.set_market_status(&mut market, MarketStatus::Expired) {
                error!(market = %market_id, error = %err, "binary option could not expire");
            }
        }

        let settling = self.ledger.store().values::<MarketId>(
            &timestamp_index_prefix(BINARY_OPTIONS_SETTLEMENT),
            None,
            Some(&end),
            false,
        );
        let mut results = Vec::new();
        for (key, market_id) in settling {
            self.ledger.store_mut().delete(&key);
            let Some(mut market) = self.get_market(&market_id) else {
                continue;
            };
            if market.status == MarketStatus::Demolished {
                continue;
            }
            let price = match market.binary_info().and_then(|i| i.settlement_price) {
                Some(p) => SettlementPrice::Price(clamp_binary_price(p)),
                None => SettlementPrice::Refund,
            };
            let result = self.settle_market(&market, Decimal::ZERO, price, false);
            self.finish_settlement(&mut market, MarketStatus::Demolished, price, &result);
            results.push(result);
        }
        results
    }

    /// Admin-only. `None` settles by refunding margins.
    pub fn set_binary_options_settlement_price(
        &mut self,
        sender: &Address,
        market_id: &MarketId,
        settlement_price: Option<Decimal>,
    ) -> Result<(), ExchangeError> {
        let mut market = self
            .get_market(market_id)
            .ok_or(ExchangeError::MarketNotFound(*market_id))?;
        if !market.is_binary_option() || market.admin != Some(*sender) {
            return Err(ExchangeError::Unauthorized);
        }
        if !matches!(market.status, MarketStatus::Active | MarketStatus::Expired) {
            return Err(ExchangeError::InvalidMarketStatus(market.status));
        }
        if let Some(p) = settlement_price {
            if p < Decimal::ZERO || p > Decimal::ONE {
                return Err(ExchangeError::InvalidSettlement(format!("{p} outside [0, 1]")));
            }
        }
        if let MarketKind::BinaryOption(info) = &mut market.kind {
            info.settlement_price = settlement_price;
        }
        self.set_market(&market);
        info!(market = %market_id, price = ?settlement_price, "binary option settlement price set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::{order, zero_fee_params, Fixture, QUOTE};
    use crate::insurance::LedgerInsuranceFund;
    use crate::market::{OracleRef, OracleType};
    use crate::order::OrderType;
    use rust_decimal_macros::dec;

    // C short 4 against A long 1 and B long 3, all at 100
    fn three_traders(fx: &mut Fixture) -> (SubaccountId, SubaccountId, SubaccountId) {
        let a = fx.trader(1, dec!(1000));
        let b = fx.trader(2, dec!(1000));
        let c = fx.trader(3, dec!(1000));
        let ask = fx.order(c, OrderType::SellPostOnly, dec!(100), dec!(4), dec!(40));
        fx.engine.create_limit_order(ask).unwrap();
        let buy_a = fx.order(a, OrderType::BuyAtomic, dec!(100), dec!(1), dec!(10));
        fx.engine.create_market_order(buy_a).unwrap();
        let buy_b = fx.order(b, OrderType::BuyAtomic, dec!(100), dec!(3), dec!(30));
        fx.engine.create_market_order(buy_b).unwrap();
        (a, b, c)
    }

    #[test]
    fn residual_deficit_haircuts_profits() {
        let mut fx = Fixture::perpetual();
        let (a, b, c) = three_traders(&mut fx);
        assert_eq!(fx.engine.market_balance(&fx.market), dec!(80));
        LedgerInsuranceFund.create_fund(fx.engine.ledger_mut(), &fx.market, dec!(140));

        fx.engine.schedule_market_settlement(&fx.market, Some(dec!(150))).unwrap();
        let results = fx.engine.process_markets_scheduled_to_settle();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        // A and B profit 50 and 150; C's 160 deficit exceeds the fund by 20
        assert_eq!(result.insurance_draw, dec!(140));
        assert_eq!(result.haircut_rate, dec!(0.1));
        assert_eq!(result.total_payout, dec!(220));

        assert_eq!(fx.engine.deposit_balance(&a, QUOTE).total_balance, dec!(1045));
        assert_eq!(fx.engine.deposit_balance(&b, QUOTE).total_balance, dec!(1135));
        assert_eq!(fx.engine.deposit_balance(&c, QUOTE).total_balance, dec!(960));
        assert!(fx.engine.positions(&fx.market).is_empty());
        assert_eq!(fx.engine.market_balance(&fx.market), dec!(0));
        assert_eq!(fx.engine.get_market(&fx.market).unwrap().status, MarketStatus::Paused);
        assert!(fx.engine.scheduled_settlement(&fx.market).is_none());
    }

    #[test]
    fn solvent_market_pays_every_position() {
        let mut fx = Fixture::perpetual();
        let (a, _, c) = three_traders(&mut fx);
        LedgerInsuranceFund.create_fund(fx.engine.ledger_mut(), &fx.market, dec!(0));

        fx.engine.schedule_market_settlement(&fx.market, Some(dec!(105))).unwrap();
        let result = fx.engine.process_markets_scheduled_to_settle().remove(0);
        assert_eq!(result.insurance_draw, dec!(0));
        assert_eq!(result.haircut_rate, dec!(0));
        assert_eq!(fx.engine.deposit_balance(&a, QUOTE).total_balance, dec!(1005));
        assert_eq!(fx.engine.deposit_balance(&c, QUOTE).total_balance, dec!(980));
        assert_eq!(fx.engine.market_balance(&fx.market), dec!(0));
    }

    #[test]
    fn scheduling_twice_is_rejected() {
        let mut fx = Fixture::perpetual();
        fx.engine.schedule_market_settlement(&fx.market, None).unwrap();
        let err = fx.engine.schedule_market_settlement(&fx.market, None).unwrap_err();
        assert!(matches!(err, ExchangeError::MarketAlreadyScheduledToSettle(_)));
        let err = fx.engine.schedule_market_settlement(&fx.market, Some(dec!(-1))).unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidSettlement(_)));
    }

    #[test]
    fn pausing_cancels_orders_and_refunds_holds() {
        let mut fx = Fixture::perpetual();
        let sub = fx.trader(1, dec!(1000));
        let bid = fx.order(sub, OrderType::BuyPostOnly, dec!(90), dec!(1), dec!(9));
        fx.engine.create_limit_order(bid).unwrap();
        fx.engine.pause_market_and_schedule_for_settlement(&fx.market, true).unwrap();

        assert!(fx.engine.subaccount_orders(&fx.market, &sub).is_empty());
        assert_eq!(fx.engine.deposit_balance(&sub, QUOTE).available_balance, dec!(1000));
        assert_eq!(fx.engine.get_market(&fx.market).unwrap().status, MarketStatus::Paused);
        let scheduled = fx.engine.scheduled_settlement(&fx.market).unwrap();
        assert_eq!(scheduled.settlement_price, Some(SettlementPrice::Price(dec!(100))));
    }

    #[test]
    fn expiry_future_settles_at_twap() {
        let mut fx = Fixture::perpetual();
        let feed = OracleRef::new("ETH", QUOTE, OracleType::PriceFeed);
        fx.oracle.set_price(&feed, dec!(100), Timestamp::from_secs(0));
        let market = fx
            .engine
            .launch_expiry_futures_market("ETH/USDT 3600", QUOTE, feed.clone(), Timestamp::from_secs(3600), zero_fee_params())
            .unwrap();
        let long = fx.trader(1, dec!(1000));
        let short = fx.trader(2, dec!(1000));
        let ask = order(market, short, OrderType::SellPostOnly, dec!(100), dec!(1), dec!(10));
        fx.engine.create_limit_order(ask).unwrap();
        let bid = order(market, long, OrderType::BuyAtomic, dec!(100), dec!(1), dec!(10));
        fx.engine.create_market_order(bid).unwrap();

        fx.engine.begin_block(2, Timestamp::from_secs(1800));
        let info = fx.engine.get_market(&market).unwrap().expiry_info().cloned().unwrap();
        assert_eq!(info.twap_start_price_cumulative, dec!(180000));
        fx.oracle.set_price(&feed, dec!(110), Timestamp::from_secs(1800));

        fx.engine.begin_block(3, Timestamp::from_secs(3600));
        let settled = fx.engine.get_market(&market).unwrap();
        assert_eq!(settled.status, MarketStatus::Expired);
        assert_eq!(settled.expiry_info().unwrap().settlement_price, Some(dec!(110)));
        assert_eq!(fx.engine.deposit_balance(&long, QUOTE).total_balance, dec!(1010));
        assert_eq!(fx.engine.deposit_balance(&short, QUOTE).total_balance, dec!(990));
    }

    #[test]
    fn binary_option_without_price_refunds_margins() {
        let mut fx = Fixture::perpetual();
        let admin = Address([9; 20]);
        let feed = OracleRef::new("ELECTION", "provider", OracleType::Provider);
        let market = fx
            .engine
            .launch_binary_options_market(
                "WIN",
                QUOTE,
                feed,
                Timestamp::from_secs(100),
                Timestamp::from_secs(200),
                admin,
                crate::market::RiskParams::binary_options(),
            )
            .unwrap();
        assert!(matches!(
            fx.engine.set_binary_options_settlement_price(&Address([8; 20]), &market, Some(dec!(1))),
            Err(ExchangeError::Unauthorized)
        ));
        assert!(fx
            .engine
            .set_binary_options_settlement_price(&admin, &market, Some(dec!(2)))
            .is_err());

        fx.engine.begin_block(2, Timestamp::from_secs(100));
        assert_eq!(fx.engine.get_market(&market).unwrap().status, MarketStatus::Expired);
        fx.engine.begin_block(3, Timestamp::from_secs(200));
        assert_eq!(fx.engine.get_market(&market).unwrap().status, MarketStatus::Demolished);
    }
}
