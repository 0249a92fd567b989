// 8.4 engine/deposits.rs: subaccount deposits, per-market balances and insurance draws.
//
// every amount a market owes its traders is backed by its market balance plus its
// insurance fund. an execution that would push that sum below zero never lands.

use super::core::Engine;
use super::results::ExchangeError;
use crate::custody::{Deposit, EXCHANGE_MODULE};
use crate::events::{DepositUpdateEvent, EventPayload, InsuranceDrawEvent};
use crate::market::{DerivativeMarket, MarketStatus};
use crate::store::keys::{deposit_key, market_scoped, MARKET_BALANCE, SCHEDULED_SETTLEMENT};
use crate::store::{KvStore, TypedStore};
use crate::types::{Address, MarketId, SubaccountId};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

/// Receives the protocol share of trading fees and settlement closing fees.
pub const AUCTION_SUBACCOUNT: SubaccountId = SubaccountId([0xa0; 32]);

impl Engine {
    pub fn deposit_balance(&self, subaccount_id: &SubaccountId, denom: &str) -> Deposit {
        self.ledger
            .store()
            .get_value(&deposit_key(subaccount_id, denom))
            .unwrap_or_default()
    }

    fn set_deposit(&mut self, subaccount_id: &SubaccountId, denom: &str, deposit: &Deposit) {
        let key = deposit_key(subaccount_id, denom);
        if deposit.is_empty() {
            self.ledger.store_mut().delete(&key);
        } else {
            self.ledger.store_mut().set_value(&key, deposit);
        }
    }

    pub(super) fn apply_deposit_delta(
        &mut self,
        subaccount_id: &SubaccountId,
        denom: &str,
        available_delta: Decimal,
        total_delta: Decimal,
    ) {
        if available_delta.is_zero() && total_delta.is_zero() {
            return;
        }
        let mut deposit = self.deposit_balance(subaccount_id, denom);
        deposit.available_balance += available_delta;
        deposit.total_balance += total_delta;
        self.set_deposit(subaccount_id, denom, &deposit);
        self.emit_event(EventPayload::DepositUpdate(DepositUpdateEvent {
            subaccount_id: *subaccount_id,
            denom: denom.to_string(),
            available_balance: deposit.available_balance,
            total_balance: deposit.total_balance,
        }));
    }

    /// Releases a hold back to the available balance.
    pub(super) fn increment_available(&mut self, subaccount_id: &SubaccountId, denom: &str, amount: Decimal) {
        self.apply_deposit_delta(subaccount_id, denom, amount, Decimal::ZERO);
    }

    /// Moves `amount` from available into held. Default subaccounts top up the
    /// shortfall straight from the owner's wallet.
    pub(super) fn charge_account(
        &mut self,
        subaccount_id: &SubaccountId,
        denom: &str,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        if amount.is_zero() {
            return Ok(());
        }
        let available = self.deposit_balance(subaccount_id, denom).available_balance;
        if available >= amount {
            self.apply_deposit_delta(subaccount_id, denom, -amount, Decimal::ZERO);
            return Ok(());
        }
        if !subaccount_id.is_default() {
            return Err(ExchangeError::InsufficientDeposit {
                available,
                required: amount,
            });
        }

        let shortfall = amount - available.max(Decimal::ZERO);
        let owner = subaccount_id.owner();
        self.bank
            .send_to_module(&mut self.ledger, &owner, EXCHANGE_MODULE, denom, shortfall)
            .map_err(|_| ExchangeError::InsufficientDeposit {
                available,
                required: amount,
            })?;
        self.apply_deposit_delta(subaccount_id, denom, shortfall - amount, shortfall);
        Ok(())
    }

    /// Wallet -> subaccount. Only the subaccount owner may fund it.
    pub fn deposit(
        &mut self,
        sender: &Address,
        subaccount_id: &SubaccountId,
        denom: &str,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount(amount));
        }
        if subaccount_id.owner() != *sender {
            return Err(ExchangeError::Unauthorized);
        }
        self.bank
            .send_to_module(&mut self.ledger, sender, EXCHANGE_MODULE, denom, amount)?;
        self.apply_deposit_delta(subaccount_id, denom, amount, amount);
        debug!(subaccount = %subaccount_id, denom, %amount, "deposit");
        Ok(())
    }

    /// Subaccount -> owner's wallet, out of the available balance only.
    pub fn withdraw(&mut self, subaccount_id: &SubaccountId, denom: &str, amount: Decimal) -> Result<(), ExchangeError> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount(amount));
        }
        let available = self.deposit_balance(subaccount_id, denom).available_balance;
        if available < amount {
            return Err(ExchangeError::InsufficientDeposit {
                available,
                required: amount,
            });
        }
        let owner = subaccount_id.owner();
        self.bank
            .send_from_module(&mut self.ledger, EXCHANGE_MODULE, &owner, denom, amount)?;
        self.apply_deposit_delta(subaccount_id, denom, -amount, -amount);
        debug!(subaccount = %subaccount_id, denom, %amount, "withdraw");
        Ok(())
    }

    /// Available balance plus, for default subaccounts, the owner's wallet.
    pub fn spendable_funds(&self, subaccount_id: &SubaccountId, denom: &str) -> Decimal {
        let available = self.deposit_balance(subaccount_id, denom).available_balance;
        if subaccount_id.is_default() {
            available + self.bank.balance(&self.ledger, &subaccount_id.owner(), denom)
        } else {
            available
        }
    }

    // 8.4.1: market balances

    pub fn market_balance(&self, market_id: &MarketId) -> Decimal {
        self.ledger
            .store()
            .get_value(&market_scoped(MARKET_BALANCE, market_id))
            .unwrap_or(Decimal::ZERO)
    }

    pub(super) fn set_market_balance(&mut self, market_id: &MarketId, balance: Decimal) {
        let key = market_scoped(MARKET_BALANCE, market_id);
        if balance.is_zero() {
            self.ledger.store_mut().delete(&key);
        } else {
            self.ledger.store_mut().set_value(&key, &balance);
        }
    }

    pub(super) fn apply_market_balance_delta(&mut self, market_id: &MarketId, delta: Decimal) {
        if delta.is_zero() {
            return;
        }
        let balance = self.market_balance(market_id) + delta;
        self.set_market_balance(market_id, balance);
    }

    /// Market balance plus whatever its insurance fund could cover.
    pub fn available_market_funds(&self, market_id: &MarketId) -> Decimal {
        self.market_balance(market_id) + self.insurance.balance(&self.ledger, market_id)
    }

    /// Applies `delta` when the market can afford it. Otherwise the market is
    /// paused and scheduled for settlement, and false comes back.
    pub(super) fn ensure_market_solvency(&mut self, market: &DerivativeMarket, delta: Decimal) -> bool {
        if self.available_market_funds(&market.market_id) + delta >= Decimal::ZERO {
            self.apply_market_balance_delta(&market.market_id, delta);
            return true;
        }
        warn!(market = %market.market_id, %delta, "market balance would go negative");
        self.handle_insolvent_market(market);
        false
    }

    pub(super) fn handle_insolvent_market(&mut self, market: &DerivativeMarket) {
        if let Err(err) = self.pause_market_and_schedule_for_settlement(&market.market_id, true) {
            error!(market = %market.market_id, error = %err, "insolvent market could not be scheduled");
            self.freeze_insolvent_market(market);
        }
    }

    /// Last resort when no settlement price exists: drain orders and insurance
    /// into the market and stop it.
    fn freeze_insolvent_market(&mut self, market: &DerivativeMarket) {
        self.cancel_all_orders_in_market(market, true, crate::events::CancelReason::MarketSettlement);
        let fund = self.insurance.balance(&self.ledger, &market.market_id);
        if fund > Decimal::ZERO && self.insurance.withdraw(&mut self.ledger, &market.market_id, fund).is_ok() {
            self.apply_market_balance_delta(&market.market_id, fund);
        }
        let mut current = self.get_market(&market.market_id).unwrap_or_else(|| market.clone());
        if current.status == MarketStatus::Active {
            self.demolish_or_pause_market(&mut current);
        }
        self.ledger
            .store_mut()
            .delete(&market_scoped(SCHEDULED_SETTLEMENT, &market.market_id));
    }

    /// Covers `deficit` from the insurance fund into the market balance.
    /// Returns whatever the fund could not cover.
    pub(super) fn pay_deficit_from_insurance_fund(&mut self, market_id: &MarketId, deficit: Decimal) -> Decimal {
        if deficit <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let fund = self.insurance.balance(&self.ledger, market_id);
        let withdrawal = deficit.ceil().min(fund);
        if withdrawal > Decimal::ZERO {
            if let Err(err) = self.insurance.withdraw(&mut self.ledger, market_id, withdrawal) {
                warn!(market = %market_id, error = %err, "insurance withdrawal failed");
                return deficit;
            }
            self.apply_market_balance_delta(market_id, withdrawal);
        }
        info!(market = %market_id, requested = %deficit, drawn = %withdrawal, "insurance draw");
        self.emit_event(EventPayload::InsuranceDraw(InsuranceDrawEvent {
            market_id: *market_id,
            requested: deficit,
            drawn: withdrawal,
        }));
        (deficit - withdrawal).max(Decimal::ZERO)
    }

    /// Surplus goes to the insurance fund; markets without a fund send it to auction.
    pub(super) fn move_to_insurance_fund(&mut self, market: &DerivativeMarket, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        self.apply_market_balance_delta(&market.market_id, -amount);
        if self.insurance.has_fund(&self.ledger, &market.market_id)
            && self
                .insurance
                .deposit(&mut self.ledger, &market.market_id, amount)
                .is_ok()
        {
            return;
        }
        self.apply_deposit_delta(&AUCTION_SUBACCOUNT, &market.quote_denom, amount, amount);
    }

    /// Positive fees split between the relayer and auction; rebates come out of auction.
    pub(super) fn distribute_fee(&mut self, market: &DerivativeMarket, fee_recipient: &Address, fee: Decimal) {
        if fee.is_zero() {
            return;
        }
        let denom = market.quote_denom.as_str();
        if fee < Decimal::ZERO {
            self.apply_deposit_delta(&AUCTION_SUBACCOUNT, denom, fee, fee);
            return;
        }
        let relayer_share = fee * self.params.relayer_fee_share_rate;
        if relayer_share > Decimal::ZERO {
            let recipient = SubaccountId::new(*fee_recipient, 0);
            self.apply_deposit_delta(&recipient, denom, relayer_share, relayer_share);
        }
        let auction_share = fee - relayer_share;
        self.apply_deposit_delta(&AUCTION_SUBACCOUNT, denom, auction_share, auction_share);
    }
}
