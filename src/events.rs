// 11.0: every state change produces an event. off-chain indexers rebuild books, positions
// and balances from these. the EventPayload enum lists all event types.
// events emitted inside a discarded cached execution are dropped with it.

use crate::market::MarketStatus;
use crate::order::{ConditionalOrder, DerivativeLimitOrder, DerivativeMarketOrder};
use crate::position::Position;
use crate::types::{MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub height: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, height: u64, payload: EventPayload) -> Self {
        Self { id, height, payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Order events
    NewLimitOrder(DerivativeLimitOrder),
    NewMarketOrder(DerivativeMarketOrder),
    NewConditionalOrder(ConditionalOrder),
    OrderCanceled(OrderCanceledEvent),
    OrderFail(OrderFailEvent),
    ConditionalOrderTriggered(ConditionalTriggeredEvent),
    ConditionalOrderTriggerFailed(ConditionalTriggerFailedEvent),

    // Trade events
    TradeBatch(TradeBatchEvent),

    // Position events
    PositionUpdated(PositionUpdatedEvent),
    MarginChanged(MarginChangedEvent),

    // Risk events
    Liquidation(LiquidationEvent),
    InsuranceDraw(InsuranceDrawEvent),
    MarketBeyondBankruptcy(MarketBeyondBankruptcyEvent),
    AllPositionsHaircut(AllPositionsHaircutEvent),

    // Market events
    MarketLaunched(MarketLaunchedEvent),
    MarketUpdated(MarketUpdatedEvent),
    MarketScheduledForSettlement(MarketScheduledEvent),
    MarketSettled(MarketSettledEvent),
    FundingUpdate(FundingUpdateEvent),

    // Balance events
    DepositUpdate(DepositUpdateEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    UserRequested,
    ReduceOnlyConflict,
    PositionClosed,
    NoMarginLocked,
    Liquidation,
    MarketSettlement,
    MarketExpired,
    Triggered,
    BatchUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCanceledEvent {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub order_hash: OrderHash,
    pub cid: Option<String>,
    pub refund: Decimal,
    pub is_conditional: bool,
    pub reason: CancelReason,
}

/// One entry per failed item in a batch, with the stable error code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFailEvent {
    pub account: crate::types::Address,
    pub hashes: Vec<OrderHash>,
    pub cids: Vec<String>,
    pub codes: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalTriggeredEvent {
    pub market_id: MarketId,
    pub is_limit_trigger: bool,
    pub conditional_order_hash: OrderHash,
    pub placed_order_hash: OrderHash,
    pub mark_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalTriggerFailedEvent {
    pub market_id: MarketId,
    pub order_hash: OrderHash,
    pub mark_price: Decimal,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionType {
    Market,
    LimitFill,
    LimitMatchRestingOrder,
    MarketLiquidation,
    MarketSettlement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLog {
    pub subaccount_id: SubaccountId,
    pub order_hash: OrderHash,
    pub cid: Option<String>,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub margin: Decimal,
    pub payout: Decimal,
    pub fee: Decimal,
    pub is_maker: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeBatchEvent {
    pub market_id: MarketId,
    pub side: Side,
    pub execution_type: ExecutionType,
    pub is_liquidation: bool,
    pub trades: Vec<TradeLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdatedEvent {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    // None once the position is closed
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginChangedEvent {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub delta: Decimal,
    pub new_margin: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub liquidator: SubaccountId,
    pub quantity: Decimal,
    pub liquidation_price: Decimal,
    pub mark_price: Decimal,
    pub payout: Decimal,
    pub liquidator_reward: Decimal,
    pub deficit: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceDrawEvent {
    pub market_id: MarketId,
    pub requested: Decimal,
    pub drawn: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketBeyondBankruptcyEvent {
    pub market_id: MarketId,
    pub settlement_price: Option<Decimal>,
    pub missing_funds: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllPositionsHaircutEvent {
    pub market_id: MarketId,
    pub settlement_price: Option<Decimal>,
    pub missing_funds_rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketLaunchedEvent {
    pub market_id: MarketId,
    pub ticker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketUpdatedEvent {
    pub market_id: MarketId,
    pub status: MarketStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketScheduledEvent {
    pub market_id: MarketId,
    pub settlement_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSettledEvent {
    pub market_id: MarketId,
    pub settlement_price: Option<Decimal>,
    pub status: MarketStatus,
    pub total_payout: Decimal,
    pub insurance_draw: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingUpdateEvent {
    pub market_id: MarketId,
    pub cumulative_funding: Decimal,
    pub cumulative_price: Decimal,
    pub is_hourly_funding: bool,
    pub funding_rate: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositUpdateEvent {
    pub subaccount_id: SubaccountId,
    pub denom: String,
    pub available_balance: Decimal,
    pub total_balance: Decimal,
}
