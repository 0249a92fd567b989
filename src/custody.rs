// 9.2 custody.rs: token custody outside the exchange. wallet balances per (address, denom)
// and module accounts. the exchange module account backs every subaccount deposit.
//
// balances live in the ledger, same as insurance funds, so cached executions roll them back.

use crate::store::keys::{bank_key, module_key};
use crate::store::{Ledger, TypedStore};
use crate::types::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const EXCHANGE_MODULE: &str = "exchange";

/// A subaccount's balance in one denom. `available` excludes margin holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub available_balance: Decimal,
    pub total_balance: Decimal,
}

impl Deposit {
    pub fn new(amount: Decimal) -> Self {
        Self {
            available_balance: amount,
            total_balance: amount,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.available_balance.is_zero() && self.total_balance.is_zero()
    }

    pub fn held(&self) -> Decimal {
        self.total_balance - self.available_balance
    }
}

pub trait Bank {
    fn balance(&self, ledger: &Ledger, address: &Address, denom: &str) -> Decimal;

    fn module_balance(&self, ledger: &Ledger, module: &str, denom: &str) -> Decimal;

    fn send_from_module(
        &self,
        ledger: &mut Ledger,
        module: &str,
        to: &Address,
        denom: &str,
        amount: Decimal,
    ) -> Result<(), BankError>;

    fn send_to_module(
        &self,
        ledger: &mut Ledger,
        from: &Address,
        module: &str,
        denom: &str,
        amount: Decimal,
    ) -> Result<(), BankError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BankError {
    #[error("insufficient {denom}: have {available}, need {requested}")]
    InsufficientFunds {
        denom: String,
        available: Decimal,
        requested: Decimal,
    },

    #[error("transfer amount must be positive, got {0}")]
    InvalidAmount(Decimal),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerBank;

impl LedgerBank {
    /// Credits a wallet out of thin air. Genesis / test funding only.
    pub fn mint(&self, ledger: &mut Ledger, to: &Address, denom: &str, amount: Decimal) {
        let key = bank_key(to, denom);
        let current: Decimal = ledger.store().get_value(&key).unwrap_or(Decimal::ZERO);
        ledger.store_mut().set_value(&key, &(current + amount));
    }

    fn move_funds(
        ledger: &mut Ledger,
        from_key: &[u8],
        to_key: &[u8],
        denom: &str,
        amount: Decimal,
    ) -> Result<(), BankError> {
        if amount <= Decimal::ZERO {
            return Err(BankError::InvalidAmount(amount));
        }
        let from: Decimal = ledger.store().get_value(from_key).unwrap_or(Decimal::ZERO);
        if from < amount {
            return Err(BankError::InsufficientFunds {
                denom: denom.to_string(),
                available: from,
                requested: amount,
            });
        }
        let to: Decimal = ledger.store().get_value(to_key).unwrap_or(Decimal::ZERO);
        ledger.store_mut().set_value(from_key, &(from - amount));
        ledger.store_mut().set_value(to_key, &(to + amount));
        Ok(())
    }
}

impl Bank for LedgerBank {
    fn balance(&self, ledger: &Ledger, address: &Address, denom: &str) -> Decimal {
        ledger
            .store()
            .get_value(&bank_key(address, denom))
            .unwrap_or(Decimal::ZERO)
    }

    fn module_balance(&self, ledger: &Ledger, module: &str, denom: &str) -> Decimal {
        ledger
            .store()
            .get_value(&module_key(module, denom))
            .unwrap_or(Decimal::ZERO)
    }

    fn send_from_module(
        &self,
        ledger: &mut Ledger,
        module: &str,
        to: &Address,
        denom: &str,
        amount: Decimal,
    ) -> Result<(), BankError> {
        Self::move_funds(ledger, &module_key(module, denom), &bank_key(to, denom), denom, amount)
    }

    fn send_to_module(
        &self,
        ledger: &mut Ledger,
        from: &Address,
        module: &str,
        denom: &str,
        amount: Decimal,
    ) -> Result<(), BankError> {
        Self::move_funds(ledger, &bank_key(from, denom), &module_key(module, denom), denom, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_trip_through_module() {
        let mut ledger = Ledger::new();
        let bank = LedgerBank;
        let alice = Address([1u8; 20]);
        bank.mint(&mut ledger, &alice, "usdt", dec!(100));

        bank.send_to_module(&mut ledger, &alice, EXCHANGE_MODULE, "usdt", dec!(30)).unwrap();
        assert_eq!(bank.balance(&ledger, &alice, "usdt"), dec!(70));
        assert_eq!(bank.module_balance(&ledger, EXCHANGE_MODULE, "usdt"), dec!(30));

        bank.send_from_module(&mut ledger, EXCHANGE_MODULE, &alice, "usdt", dec!(10)).unwrap();
        assert_eq!(bank.balance(&ledger, &alice, "usdt"), dec!(80));
    }

    #[test]
    fn overdraft_fails_cleanly() {
        let mut ledger = Ledger::new();
        let bank = LedgerBank;
        let bob = Address([2u8; 20]);
        bank.mint(&mut ledger, &bob, "usdt", dec!(5));

        let err = bank
            .send_to_module(&mut ledger, &bob, EXCHANGE_MODULE, "usdt", dec!(6))
            .unwrap_err();
        assert!(matches!(err, BankError::InsufficientFunds { .. }));
        assert_eq!(bank.balance(&ledger, &bob, "usdt"), dec!(5));
    }

    #[test]
    fn deposit_held_amount() {
        let deposit = Deposit {
            available_balance: dec!(60),
            total_balance: dec!(100),
        };
        assert_eq!(deposit.held(), dec!(40));
        assert!(Deposit::default().is_empty());
    }
}
