//! Derivative orders.
//!
//! An incoming [`DerivativeOrder`] becomes a resting [`DerivativeLimitOrder`], a
//! block-scoped [`DerivativeMarketOrder`], or a [`ConditionalOrder`] waiting on
//! its trigger. Orders with zero margin are reduce-only.

use crate::market::MarketType;
use crate::store::keys::padded_price;
use crate::types::{Address, MarketId, OrderHash, Price, Side, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Buy,
    Sell,
    StopBuy,
    StopSell,
    TakeBuy,
    TakeSell,
    BuyPostOnly,
    SellPostOnly,
    BuyAtomic,
    SellAtomic,
}

impl OrderType {
    pub fn is_buy(&self) -> bool {
        matches!(
            self,
            OrderType::Buy | OrderType::StopBuy | OrderType::TakeBuy | OrderType::BuyPostOnly | OrderType::BuyAtomic
        )
    }

    pub fn side(&self) -> Side {
        Side::from_is_buy(self.is_buy())
    }

    pub fn is_post_only(&self) -> bool {
        matches!(self, OrderType::BuyPostOnly | OrderType::SellPostOnly)
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, OrderType::BuyAtomic | OrderType::SellAtomic)
    }

    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderType::StopBuy | OrderType::StopSell | OrderType::TakeBuy | OrderType::TakeSell
        )
    }

    /// Plain order type a triggered conditional order turns into.
    pub fn untriggered(&self) -> OrderType {
        if self.is_buy() {
            OrderType::Buy
        } else {
            OrderType::Sell
        }
    }

    fn tag(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub subaccount_id: SubaccountId,
    // receives the relayer share of trading fees
    pub fee_recipient: Address,
    pub price: Price,
    pub quantity: Decimal,
    pub cid: Option<String>,
}

/// Order as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeOrder {
    pub market_id: MarketId,
    pub order_info: OrderInfo,
    pub order_type: OrderType,
    pub margin: Decimal,
    pub trigger_price: Option<Price>,
}

impl DerivativeOrder {
    pub fn subaccount_id(&self) -> SubaccountId {
        self.order_info.subaccount_id
    }

    pub fn side(&self) -> Side {
        self.order_type.side()
    }

    pub fn is_buy(&self) -> bool {
        self.order_type.is_buy()
    }

    pub fn price(&self) -> Decimal {
        self.order_info.price.value()
    }

    pub fn quantity(&self) -> Decimal {
        self.order_info.quantity
    }

    pub fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }

    pub fn is_vanilla(&self) -> bool {
        !self.is_reduce_only()
    }

    pub fn is_conditional(&self) -> bool {
        self.order_type.is_conditional()
    }

    pub fn cid(&self) -> Option<&str> {
        self.order_info.cid.as_deref().filter(|c| !c.is_empty())
    }

    pub fn compute_order_hash(&self, nonce: u32) -> OrderHash {
        let mut hasher = Sha256::new();
        hasher.update(self.order_info.subaccount_id.as_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(self.market_id.as_bytes());
        hasher.update([self.order_type.tag()]);
        hasher.update(padded_price(self.price()).as_bytes());
        hasher.update(padded_price(self.quantity()).as_bytes());
        if let Some(trigger) = self.trigger_price {
            hasher.update(padded_price(trigger.value()).as_bytes());
        }
        OrderHash(hasher.finalize().into())
    }

    /// Stop orders trigger on adverse moves, take orders on favorable ones.
    pub fn check_valid_conditional_price(&self, mark_price: Option<Decimal>) -> Result<(), OrderError> {
        if !self.is_conditional() {
            return Ok(());
        }
        let (Some(trigger), Some(mark)) = (self.trigger_price, mark_price) else {
            return Err(OrderError::InvalidTriggerPrice);
        };
        let trigger = trigger.value();
        let ok = match self.order_type {
            OrderType::StopBuy => trigger > mark,
            OrderType::TakeBuy => trigger < mark,
            OrderType::StopSell => trigger < mark,
            OrderType::TakeSell => trigger > mark,
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(OrderError::InvalidTriggerPrice)
        }
    }

    pub fn check_binary_option_bounds(&self) -> Result<(), OrderError> {
        let price = self.price();
        if price <= Decimal::ZERO || price >= Decimal::ONE {
            return Err(OrderError::InvalidBinaryOptionPrice(price));
        }
        Ok(())
    }

    /// Margin plus the worst-case fee on the full notional. Rejects orders whose
    /// margin is under the initial requirement at both the order price and mark.
    pub fn check_margin_and_get_margin_hold(
        &self,
        initial_margin_ratio: Decimal,
        mark_price: Option<Decimal>,
        fee_rate: Decimal,
        market_type: MarketType,
    ) -> Result<Decimal, OrderError> {
        let price = self.price();
        let quantity = self.quantity();
        let notional = price * quantity;
        let fee_hold = notional * fee_rate.max(Decimal::ZERO);
        let hold = self.margin + fee_hold;

        if market_type == MarketType::BinaryOption {
            let required = match self.side() {
                Side::Long => notional,
                Side::Short => (Decimal::ONE - price) * quantity,
            };
            if self.margin != required {
                return Err(OrderError::InsufficientOrderMargin {
                    margin: self.margin,
                    required,
                });
            }
            return Ok(hold);
        }

        let required = initial_margin_ratio * notional;
        if self.margin < required {
            return Err(OrderError::InsufficientOrderMargin {
                margin: self.margin,
                required,
            });
        }

        // the same margin must also cover the initial requirement at mark
        let Some(mark) = mark_price else {
            return Ok(hold);
        };
        let ok = match self.side() {
            Side::Long => {
                // mark >= (margin - price*qty) / ((imr - 1) * qty)
                let denominator = (initial_margin_ratio - Decimal::ONE) * quantity;
                if denominator.is_zero() {
                    // fully collateralized: the mark drops out
                    self.margin >= notional
                } else {
                    mark >= (self.margin - notional) / denominator
                }
            }
            Side::Short => {
                // mark <= (margin + price*qty) / ((1 + imr) * qty)
                let threshold = (self.margin + notional) / ((Decimal::ONE + initial_margin_ratio) * quantity);
                mark <= threshold
            }
        };
        if !ok {
            return Err(OrderError::MarkPriceBeyondMarginThreshold { mark });
        }
        Ok(hold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeLimitOrder {
    pub order_info: OrderInfo,
    pub order_type: OrderType,
    pub margin: Decimal,
    pub fillable: Decimal,
    pub trigger_price: Option<Price>,
    pub order_hash: OrderHash,
    // fee rate the hold was computed with; refunds use the same rate
    pub hold_fee_rate: Decimal,
}

impl DerivativeLimitOrder {
    pub fn from_order(order: &DerivativeOrder, order_hash: OrderHash, hold_fee_rate: Decimal) -> Self {
        Self {
            order_info: order.order_info.clone(),
            order_type: order.order_type,
            margin: order.margin,
            fillable: order.quantity(),
            trigger_price: order.trigger_price,
            order_hash,
            hold_fee_rate,
        }
    }

    pub fn subaccount_id(&self) -> SubaccountId {
        self.order_info.subaccount_id
    }

    pub fn side(&self) -> Side {
        self.order_type.side()
    }

    pub fn price(&self) -> Decimal {
        self.order_info.price.value()
    }

    pub fn quantity(&self) -> Decimal {
        self.order_info.quantity
    }

    pub fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }

    pub fn is_vanilla(&self) -> bool {
        !self.is_reduce_only()
    }

    pub fn cid(&self) -> Option<&str> {
        self.order_info.cid.as_deref().filter(|c| !c.is_empty())
    }

    /// Margin carried by `quantity` of this order.
    pub fn margin_for(&self, quantity: Decimal) -> Decimal {
        if self.quantity().is_zero() {
            return Decimal::ZERO;
        }
        self.margin * quantity / self.quantity()
    }

    /// Hold released when `quantity` leaves the book unfilled.
    pub fn hold_for(&self, quantity: Decimal) -> Decimal {
        self.margin_for(quantity) + quantity * self.price() * self.hold_fee_rate.max(Decimal::ZERO)
    }

    pub fn cancel_refund(&self) -> Decimal {
        self.hold_for(self.fillable)
    }
}

/// Block-scoped market order. Unfilled holds are refunded at end of block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeMarketOrder {
    pub order_info: OrderInfo,
    pub order_type: OrderType,
    pub margin: Decimal,
    pub margin_hold: Decimal,
    pub trigger_price: Option<Price>,
    pub order_hash: OrderHash,
}

impl DerivativeMarketOrder {
    pub fn from_order(order: &DerivativeOrder, order_hash: OrderHash, margin_hold: Decimal) -> Self {
        Self {
            order_info: order.order_info.clone(),
            order_type: order.order_type,
            margin: order.margin,
            margin_hold,
            trigger_price: order.trigger_price,
            order_hash,
        }
    }

    pub fn subaccount_id(&self) -> SubaccountId {
        self.order_info.subaccount_id
    }

    pub fn side(&self) -> Side {
        self.order_type.side()
    }

    // worst acceptable fill price
    pub fn price(&self) -> Decimal {
        self.order_info.price.value()
    }

    pub fn quantity(&self) -> Decimal {
        self.order_info.quantity
    }

    pub fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }
}

/// An order parked until mark price crosses its trigger. The direction is fixed
/// when the order is stored and never re-evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalOrder {
    pub order: DerivativeOrder,
    pub order_hash: OrderHash,
    pub is_market: bool,
    pub trigger_higher: bool,
    pub margin_hold: Decimal,
}

impl ConditionalOrder {
    pub fn trigger_price(&self) -> Decimal {
        self.order.trigger_price.map(|p| p.value()).unwrap_or(Decimal::ZERO)
    }

    pub fn is_triggered(&self, mark_price: Decimal) -> bool {
        if self.trigger_higher {
            mark_price >= self.trigger_price()
        } else {
            mark_price <= self.trigger_price()
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderError {
    #[error("trigger price is on the wrong side of mark price")]
    InvalidTriggerPrice,

    #[error("order margin {margin} below required {required}")]
    InsufficientOrderMargin { margin: Decimal, required: Decimal },

    #[error("mark price {mark} leaves the order under its initial margin requirement")]
    MarkPriceBeyondMarginThreshold { mark: Decimal },

    #[error("binary option price {0} outside (0, 1)")]
    InvalidBinaryOptionPrice(Decimal),
}
