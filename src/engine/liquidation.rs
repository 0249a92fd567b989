// 8.10 engine/liquidation.rs: closing positions that fell through maintenance margin.
//
// one attempt = one cached execution. the holder's orders are cancelled, a
// reduce-only market order closes the whole position against the book, and the
// result is split:
//   loss    holder's deposit first, then the insurance fund, then forced settlement
//   profit  liquidator reward share, the rest to the insurance fund
// forced settlement is scheduled after the liquidation itself has committed.

use super::core::Engine;
use super::execution::Taker;
use super::results::{ExchangeError, LiquidationResult};
use crate::events::{CancelReason, EventPayload, ExecutionType, LiquidationEvent};
use crate::market::DerivativeMarket;
use crate::order::{DerivativeOrder, OrderInfo, OrderType};
use crate::types::{MarketId, OrderHash, Price, Side, SubaccountId};
use rust_decimal::Decimal;
use tracing::{info, warn};

impl Engine {
    /// Liquidates `subaccount_id`'s position. `liquidator_order`, if given, is
    /// placed on the book first so the liquidation can fill against it.
    pub fn liquidate_position(
        &mut self,
        liquidator: &SubaccountId,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        liquidator_order: Option<DerivativeOrder>,
    ) -> Result<LiquidationResult, ExchangeError> {
        let (result, should_settle) =
            self.cached(|e| e.run_liquidation(liquidator, market_id, subaccount_id, liquidator_order, false))?;
        if should_settle {
            self.force_settlement_after_liquidation(market_id);
        }
        Ok(result)
    }

    /// Liquidation without a liquidator order that must end with the market
    /// scheduled for settlement: the position's loss has to exceed what its
    /// deposit and the insurance fund can cover.
    pub fn emergency_settle_market(
        &mut self,
        sender: &SubaccountId,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
    ) -> Result<LiquidationResult, ExchangeError> {
        let (result, _) = self.cached(|e| e.run_liquidation(sender, market_id, subaccount_id, None, true))?;
        self.force_settlement_after_liquidation(market_id);
        Ok(result)
    }

    fn force_settlement_after_liquidation(&mut self, market_id: &MarketId) {
        let Some(market) = self.get_market(market_id) else {
            return;
        };
        if !market.is_active() {
            return;
        }
        warn!(market = %market_id, "liquidation deficit exceeds insurance, scheduling settlement");
        self.handle_insolvent_market(&market);
    }

    /// Returns the result and whether the market must be force-settled.
    fn run_liquidation(
        &mut self,
        liquidator: &SubaccountId,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        liquidator_order: Option<DerivativeOrder>,
        is_emergency: bool,
    ) -> Result<(LiquidationResult, bool), ExchangeError> {
        let market = self.active_market(market_id)?;
        let mark = self.mark_price(&market)?;
        let mmr = market.params.maintenance_margin_ratio;
        let position = self
            .position_with_funding(&market, subaccount_id)
            .ok_or(ExchangeError::PositionNotFound {
                market_id: *market_id,
                subaccount_id: *subaccount_id,
            })?;
        let liquidation_price = position.liquidation_price(mmr, Decimal::ZERO);
        if !position.is_liquidatable(mark, mmr, Decimal::ZERO) {
            return Err(ExchangeError::PositionNotLiquidable {
                liquidation_price,
                mark_price: mark,
            });
        }
        let denom = market.quote_denom.clone();

        self.cancel_subaccount_limit_orders(&market, subaccount_id, |_| true, CancelReason::Liquidation);
        self.cancel_subaccount_market_orders(&market, subaccount_id, CancelReason::Liquidation);
        self.cancel_subaccount_conditional_orders(&market, subaccount_id, |_| true, CancelReason::Liquidation);

        let mut worst_price = position.liquidation_worst_price(mark);
        let mut placed_hash = None;
        if let Some(order) = liquidator_order {
            if order.subaccount_id() != *liquidator {
                return Err(ExchangeError::Unauthorized);
            }
            let price = order.price();
            placed_hash = Some(self.place_limit_order(order, true)?);
            worst_price = price;
        }

        let spendable_before = self.spendable_funds(subaccount_id, &denom);
        let nonce = self.increment_subaccount_nonce(subaccount_id);
        let closing_side = position.closing_side();
        let taker = Taker {
            subaccount_id: *subaccount_id,
            order_hash: liquidation_order_hash(market_id, subaccount_id, closing_side, worst_price, position.quantity, nonce),
            cid: None,
            side: closing_side,
            worst_price,
            quantity: position.quantity,
            margin: Decimal::ZERO,
            hold_fee_rate: Decimal::ZERO,
            fee_rate: market.params.taker_fee_rate,
            fee_recipient: liquidator.owner(),
            book: None,
            is_liquidation: true,
        };
        let outcome = self.execute_taker(&market, &taker, Some(mark), ExecutionType::MarketLiquidation);
        if !outcome.is_market_solvent {
            warn!(market = %market_id, subaccount = %subaccount_id, "liquidation found the market insolvent");
            let result = LiquidationResult {
                market_id: *market_id,
                subaccount_id: *subaccount_id,
                quantity: Decimal::ZERO,
                payout: Decimal::ZERO,
                liquidator_reward: Decimal::ZERO,
                insurance_draw: Decimal::ZERO,
                market_paused: true,
            };
            return Ok((result, false));
        }

        let open_position = self.position_with_funding(&market, subaccount_id);
        if open_position.is_some() && !is_emergency {
            return Err(ExchangeError::NoLiquidity);
        }
        if let Some(hash) = placed_hash {
            if let Some((book, order)) = self.find_limit_order(market_id, liquidator, &hash) {
                self.cancel_limit_order(book, &market, &order, CancelReason::Liquidation);
            }
        }

        let spendable_after = self.spendable_funds(subaccount_id, &denom);
        let payout = if spendable_before < Decimal::ZERO {
            spendable_after
        } else {
            spendable_after - spendable_before
        };

        // losses: the fill left them on the holder's deposit, not in the market
        let uncollected = (-outcome.taker_payout).max(Decimal::ZERO);
        let available = self.deposit_balance(subaccount_id, &denom).available_balance;
        let shortfall = (-available).max(Decimal::ZERO).min(uncollected);
        if shortfall > Decimal::ZERO {
            self.apply_deposit_delta(subaccount_id, &denom, shortfall, shortfall);
        }
        if uncollected > Decimal::ZERO {
            self.apply_market_balance_delta(market_id, uncollected - shortfall);
        }

        if is_emergency {
            // whatever stayed open is valued at mark
            let open_loss = open_position
                .as_ref()
                .map(|p| (-p.payout_if_fully_closing(mark, Decimal::ZERO).payout).max(Decimal::ZERO))
                .unwrap_or(Decimal::ZERO);
            if shortfall + open_loss <= self.insurance.balance(&self.ledger, market_id) {
                return Err(ExchangeError::InvalidEmergencySettle);
            }
        }

        let fund_before = self.insurance.balance(&self.ledger, market_id);
        let remaining = self.pay_deficit_from_insurance_fund(market_id, shortfall);
        let insurance_draw = fund_before - self.insurance.balance(&self.ledger, market_id);
        let should_settle = remaining > Decimal::ZERO || is_emergency;

        let mut liquidator_reward = Decimal::ZERO;
        if outcome.taker_payout > Decimal::ZERO {
            liquidator_reward = self.split_liquidation_surplus(&market, subaccount_id, liquidator, outcome.taker_payout);
        }

        info!(
            market = %market_id,
            subaccount = %subaccount_id,
            quantity = %outcome.filled_quantity,
            %payout,
            %shortfall,
            should_settle,
            "position liquidated"
        );
        self.emit_event(EventPayload::Liquidation(LiquidationEvent {
            market_id: *market_id,
            subaccount_id: *subaccount_id,
            liquidator: *liquidator,
            quantity: outcome.filled_quantity,
            liquidation_price,
            mark_price: mark,
            payout,
            liquidator_reward,
            deficit: shortfall,
        }));

        let result = LiquidationResult {
            market_id: *market_id,
            subaccount_id: *subaccount_id,
            quantity: outcome.filled_quantity,
            payout,
            liquidator_reward,
            insurance_draw,
            market_paused: should_settle,
        };
        Ok((result, should_settle))
    }

    /// Moves a liquidated position's surplus off the holder: the liquidator's
    /// share to the liquidator, the rest to the insurance fund.
    fn split_liquidation_surplus(
        &mut self,
        market: &DerivativeMarket,
        holder: &SubaccountId,
        liquidator: &SubaccountId,
        surplus: Decimal,
    ) -> Decimal {
        let denom = market.quote_denom.as_str();
        self.apply_deposit_delta(holder, denom, -surplus, -surplus);
        let reward = surplus * self.params.liquidator_reward_share_rate;
        if reward > Decimal::ZERO {
            self.apply_deposit_delta(liquidator, denom, reward, reward);
        }
        let remainder = surplus - reward;
        if remainder > Decimal::ZERO {
            self.apply_market_balance_delta(&market.market_id, remainder);
            self.move_to_insurance_fund(market, remainder);
        }
        reward
    }
}

fn liquidation_order_hash(
    market_id: &MarketId,
    subaccount_id: &SubaccountId,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    nonce: u32,
) -> OrderHash {
    DerivativeOrder {
        market_id: *market_id,
        order_info: OrderInfo {
            subaccount_id: *subaccount_id,
            fee_recipient: subaccount_id.owner(),
            price: Price::new_unchecked(price),
            quantity,
            cid: None,
        },
        order_type: match side {
            Side::Long => OrderType::Buy,
            Side::Short => OrderType::Sell,
        },
        margin: Decimal::ZERO,
        trigger_price: None,
    }
    .compute_order_hash(nonce)
}
