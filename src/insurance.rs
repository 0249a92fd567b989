// 9.1 insurance.rs: per-market insurance funds. balances live in the ledger so a
// discarded liquidation also undoes its insurance draw.

use crate::store::keys::{market_scoped, INSURANCE_FUNDS};
use crate::store::{KvStore, Ledger, TypedStore};
use crate::types::MarketId;
use rust_decimal::Decimal;
use tracing::debug;

pub trait InsuranceFund {
    fn has_fund(&self, ledger: &Ledger, market_id: &MarketId) -> bool;

    /// Zero when the market has no fund.
    fn balance(&self, ledger: &Ledger, market_id: &MarketId) -> Decimal;

    fn deposit(&self, ledger: &mut Ledger, market_id: &MarketId, amount: Decimal) -> Result<(), InsuranceError>;

    /// Fails without side effects if the fund holds less than `amount`.
    fn withdraw(&self, ledger: &mut Ledger, market_id: &MarketId, amount: Decimal) -> Result<(), InsuranceError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InsuranceError {
    #[error("no insurance fund for market {0}")]
    FundNotFound(MarketId),

    #[error("insurance fund for {market_id} holds {available}, requested {requested}")]
    InsufficientInsuranceFund {
        market_id: MarketId,
        requested: Decimal,
        available: Decimal,
    },

    #[error("insurance amounts must be positive, got {0}")]
    InvalidAmount(Decimal),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerInsuranceFund;

impl LedgerInsuranceFund {
    /// Opens (or tops up) the fund for `market_id`.
    pub fn create_fund(&self, ledger: &mut Ledger, market_id: &MarketId, initial: Decimal) {
        let key = market_scoped(INSURANCE_FUNDS, market_id);
        let current: Decimal = ledger.store().get_value(&key).unwrap_or(Decimal::ZERO);
        ledger.store_mut().set_value(&key, &(current + initial));
    }
}

impl InsuranceFund for LedgerInsuranceFund {
    fn has_fund(&self, ledger: &Ledger, market_id: &MarketId) -> bool {
        ledger.store().has(&market_scoped(INSURANCE_FUNDS, market_id))
    }

    fn balance(&self, ledger: &Ledger, market_id: &MarketId) -> Decimal {
        ledger
            .store()
            .get_value(&market_scoped(INSURANCE_FUNDS, market_id))
            .unwrap_or(Decimal::ZERO)
    }

    fn deposit(&self, ledger: &mut Ledger, market_id: &MarketId, amount: Decimal) -> Result<(), InsuranceError> {
        if amount <= Decimal::ZERO {
            return Err(InsuranceError::InvalidAmount(amount));
        }
        if !self.has_fund(ledger, market_id) {
            return Err(InsuranceError::FundNotFound(*market_id));
        }
        let balance = self.balance(ledger, market_id) + amount;
        ledger
            .store_mut()
            .set_value(&market_scoped(INSURANCE_FUNDS, market_id), &balance);
        debug!(market = %market_id, %amount, %balance, "insurance fund deposit");
        Ok(())
    }

    fn withdraw(&self, ledger: &mut Ledger, market_id: &MarketId, amount: Decimal) -> Result<(), InsuranceError> {
        if amount <= Decimal::ZERO {
            return Err(InsuranceError::InvalidAmount(amount));
        }
        if !self.has_fund(ledger, market_id) {
            return Err(InsuranceError::FundNotFound(*market_id));
        }
        let available = self.balance(ledger, market_id);
        if available < amount {
            return Err(InsuranceError::InsufficientInsuranceFund {
                market_id: *market_id,
                requested: amount,
                available,
            });
        }
        let balance = available - amount;
        ledger
            .store_mut()
            .set_value(&market_scoped(INSURANCE_FUNDS, market_id), &balance);
        debug!(market = %market_id, %amount, %balance, "insurance fund withdrawal");
        Ok(())
    }
}
