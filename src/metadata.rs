// 6.0 metadata.rs: per (market, subaccount, side) order counters. admission reads these
// instead of scanning the book; every insert / fill / cancel updates them with the order.

use crate::order::DerivativeLimitOrder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubaccountOrderbookMetadata {
    pub vanilla_limit_order_count: u32,
    pub reduce_only_limit_order_count: u32,
    // fillable quantity across the counted limit orders
    pub aggregate_reduce_only_quantity: Decimal,
    pub aggregate_vanilla_quantity: Decimal,
    pub vanilla_conditional_order_count: u32,
    pub reduce_only_conditional_order_count: u32,
}

impl SubaccountOrderbookMetadata {
    /// Everything the side-count limit applies to.
    pub fn order_side_count(&self) -> u32 {
        self.vanilla_limit_order_count
            + self.reduce_only_limit_order_count
            + self.vanilla_conditional_order_count
            + self.reduce_only_conditional_order_count
    }

    pub fn has_vanilla_orders(&self) -> bool {
        self.vanilla_limit_order_count > 0 || self.vanilla_conditional_order_count > 0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn add_limit_order(&mut self, order: &DerivativeLimitOrder) {
        if order.is_reduce_only() {
            self.reduce_only_limit_order_count += 1;
            self.aggregate_reduce_only_quantity += order.fillable;
        } else {
            self.vanilla_limit_order_count += 1;
            self.aggregate_vanilla_quantity += order.fillable;
        }
    }

    pub fn remove_limit_order(&mut self, order: &DerivativeLimitOrder) {
        if order.is_reduce_only() {
            self.reduce_only_limit_order_count = dec_count(self.reduce_only_limit_order_count, "reduce-only limit");
            self.aggregate_reduce_only_quantity -= order.fillable;
        } else {
            self.vanilla_limit_order_count = dec_count(self.vanilla_limit_order_count, "vanilla limit");
            self.aggregate_vanilla_quantity -= order.fillable;
        }
        self.assert_valid();
    }

    /// `filled` came off the order's fillable quantity; the order stays on the book.
    pub fn apply_partial_fill(&mut self, order: &DerivativeLimitOrder, filled: Decimal) {
        if order.is_reduce_only() {
            self.aggregate_reduce_only_quantity -= filled;
        } else {
            self.aggregate_vanilla_quantity -= filled;
        }
        self.assert_valid();
    }

    pub fn add_conditional_order(&mut self, is_reduce_only: bool) {
        if is_reduce_only {
            self.reduce_only_conditional_order_count += 1;
        } else {
            self.vanilla_conditional_order_count += 1;
        }
    }

    pub fn remove_conditional_order(&mut self, is_reduce_only: bool) {
        if is_reduce_only {
            self.reduce_only_conditional_order_count =
                dec_count(self.reduce_only_conditional_order_count, "reduce-only conditional");
        } else {
            self.vanilla_conditional_order_count =
                dec_count(self.vanilla_conditional_order_count, "vanilla conditional");
        }
    }

    fn assert_valid(&self) {
        assert!(
            self.aggregate_reduce_only_quantity >= Decimal::ZERO && self.aggregate_vanilla_quantity >= Decimal::ZERO,
            "orderbook metadata went negative: {self:?}"
        );
    }
}

fn dec_count(count: u32, what: &str) -> u32 {
    count
        .checked_sub(1)
        .unwrap_or_else(|| panic!("{what} order count underflow"))
}
