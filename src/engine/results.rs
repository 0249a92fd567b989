// 8.0.2: result types and errors for engine operations.
// every ExchangeError kind has a stable numeric code; failure events carry the code.

use crate::config::ConfigError;
use crate::custody::BankError;
use crate::insurance::InsuranceError;
use crate::market::{MarketError, MarketStatus};
use crate::oracle::OracleError;
use crate::order::OrderError;
use crate::position::PositionError;
use crate::types::{MarketId, OrderHash, SubaccountId};
use rust_decimal::Decimal;

/// Outcome of an atomic market order.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrderResult {
    pub order_hash: OrderHash,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub fee: Decimal,
    pub payout: Decimal,
}

/// One execution of a taker against the resting book.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub filled_quantity: Decimal,
    pub notional: Decimal,
    pub taker_fee: Decimal,
    pub taker_payout: Decimal,
    // margin plus fee hold released from the taker's hold by the fills
    pub taker_hold_released: Decimal,
    pub is_market_solvent: bool,
}

impl ExecutionOutcome {
    pub fn average_price(&self) -> Option<Decimal> {
        if self.filled_quantity.is_zero() {
            None
        } else {
            Some(self.notional / self.filled_quantity)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationResult {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub quantity: Decimal,
    pub payout: Decimal,
    pub liquidator_reward: Decimal,
    pub insurance_draw: Decimal,
    // true when the deficit could not be covered and the market was paused
    pub market_paused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementResult {
    pub market_id: MarketId,
    pub positions_closed: usize,
    pub total_payout: Decimal,
    pub insurance_draw: Decimal,
    pub haircut_rate: Decimal,
}

/// Per-item outcome of a batch update.
#[derive(Debug, Clone, Default)]
pub struct BatchUpdateResult {
    pub cancel_results: Vec<Result<(), ExchangeError>>,
    pub created: Vec<Result<OrderHash, ExchangeError>>,
    pub markets_cancelled: Vec<MarketId>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExchangeError {
    #[error("order {0} doesn't exist")]
    OrderDoesntExist(OrderHash),

    #[error("insufficient deposit: available {available}, required {required}")]
    InsufficientDeposit { available: Decimal, required: Decimal },

    #[error("post-only mode is active until height {0}")]
    PostOnlyMode(u64),

    #[error("post-only order crosses the top of book")]
    ExceedsTopOfBookPrice,

    #[error("market order worst price does not cross the book")]
    SlippageExceedsWorstPrice,

    #[error("subaccount already placed a market order in this block")]
    MarketOrderAlreadyExists,

    #[error("active derivative market {0} not found")]
    MarketNotFound(MarketId),

    #[error("market {0} already exists")]
    MarketAlreadyExists(MarketId),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("notional {notional} below minimum {minimum}")]
    BelowMinNotional { notional: Decimal, minimum: Decimal },

    #[error("maximum orders per side reached ({0})")]
    ExceedsOrderSideCount(u32),

    #[error("conditional market order already exists in this trigger direction")]
    ConditionalMarketOrderAlreadyExists,

    #[error("a position or open vanilla orders are required before posting conditional reduce-only orders")]
    NoMarginLocked,

    #[error("position not found for subaccount {subaccount_id} in market {market_id}")]
    PositionNotFound {
        market_id: MarketId,
        subaccount_id: SubaccountId,
    },

    #[error("reduce-only order must be opposite to the position")]
    InvalidReduceOnlyPositionDirection,

    #[error("position quantity is already fully committed to closing orders")]
    InsufficientPositionQuantity,

    #[error("order price {price} surpasses bankruptcy price {bankruptcy}")]
    PriceSurpassesBankruptcyPrice { price: Decimal, bankruptcy: Decimal },

    #[error("insufficient order margin: {0}")]
    InsufficientOrderMargin(String),

    #[error("client order id {0} already exists")]
    ClientOrderIdAlreadyExists(String),

    #[error("invalid trigger price")]
    InvalidTriggerPrice,

    #[error("position is not liquidable: liquidation price {liquidation_price}, mark price {mark_price}")]
    PositionNotLiquidable {
        liquidation_price: Decimal,
        mark_price: Decimal,
    },

    #[error("emergency settlement requires a position beyond bankruptcy")]
    InvalidEmergencySettle,

    #[error("not enough liquidity to close the position")]
    NoLiquidity,

    #[error("invalid oracle: {0}")]
    InvalidOracle(String),

    #[error("stale oracle price: {0}")]
    StaleOraclePrice(String),

    #[error("insufficient insurance fund: {0}")]
    InsufficientInsuranceFund(String),

    #[error("market balance cannot cover {0}")]
    InsufficientMarketBalance(Decimal),

    #[error("invalid market status {0:?}")]
    InvalidMarketStatus(MarketStatus),

    #[error("market {0} is already scheduled to settle")]
    MarketAlreadyScheduledToSettle(MarketId),

    #[error("invalid settlement: {0}")]
    InvalidSettlement(String),

    #[error("invalid margin ratio: {0}")]
    InvalidMarginRatio(String),

    #[error("position margin would drop below requirement: ratio {ratio}, required {required}")]
    InsufficientPositionMargin { ratio: Decimal, required: Decimal },

    #[error("invalid market params: {0}")]
    InvalidMarketParams(String),

    #[error("invalid amount {0}")]
    InvalidAmount(Decimal),

    #[error("sender is not the market admin")]
    Unauthorized,

    #[error("exchange params: {0}")]
    Config(#[from] ConfigError),
}

/// Stable codes, never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ErrorCode(pub u32);

impl ExchangeError {
    pub fn code(&self) -> ErrorCode {
        let code = match self {
            ExchangeError::OrderDoesntExist(_) => 1,
            ExchangeError::InsufficientDeposit { .. } => 2,
            ExchangeError::PostOnlyMode(_) => 3,
            ExchangeError::ExceedsTopOfBookPrice => 4,
            ExchangeError::SlippageExceedsWorstPrice => 5,
            ExchangeError::MarketOrderAlreadyExists => 6,
            ExchangeError::MarketNotFound(_) => 7,
            ExchangeError::MarketAlreadyExists(_) => 8,
            ExchangeError::InvalidPrice(_) => 9,
            ExchangeError::InvalidQuantity(_) => 10,
            ExchangeError::BelowMinNotional { .. } => 11,
            ExchangeError::ExceedsOrderSideCount(_) => 12,
            ExchangeError::ConditionalMarketOrderAlreadyExists => 13,
            ExchangeError::NoMarginLocked => 14,
            ExchangeError::PositionNotFound { .. } => 15,
            ExchangeError::InvalidReduceOnlyPositionDirection => 16,
            ExchangeError::InsufficientPositionQuantity => 17,
            ExchangeError::PriceSurpassesBankruptcyPrice { .. } => 18,
            ExchangeError::InsufficientOrderMargin(_) => 19,
            ExchangeError::ClientOrderIdAlreadyExists(_) => 20,
            ExchangeError::InvalidTriggerPrice => 21,
            ExchangeError::PositionNotLiquidable { .. } => 22,
            ExchangeError::InvalidEmergencySettle => 23,
            ExchangeError::NoLiquidity => 24,
            ExchangeError::InvalidOracle(_) => 25,
            ExchangeError::StaleOraclePrice(_) => 26,
            ExchangeError::InsufficientInsuranceFund(_) => 27,
            ExchangeError::InsufficientMarketBalance(_) => 28,
            ExchangeError::InvalidMarketStatus(_) => 29,
            ExchangeError::MarketAlreadyScheduledToSettle(_) => 30,
            ExchangeError::InvalidSettlement(_) => 31,
            ExchangeError::InvalidMarginRatio(_) => 32,
            ExchangeError::InsufficientPositionMargin { .. } => 33,
            ExchangeError::InvalidMarketParams(_) => 34,
            ExchangeError::InvalidAmount(_) => 35,
            ExchangeError::Unauthorized => 36,
            ExchangeError::Config(_) => 37,
        };
        ErrorCode(code)
    }
}

impl From<MarketError> for ExchangeError {
    fn from(err: MarketError) -> Self {
        match err {
            MarketError::InvalidMarginRatio { .. } | MarketError::InvalidReduceMarginRatio(_) => {
                ExchangeError::InvalidMarginRatio(err.to_string())
            }
            MarketError::PriceNotOnTick { .. } | MarketError::BinaryOptionPriceOutOfBounds(_) => {
                ExchangeError::InvalidPrice(err.to_string())
            }
            MarketError::QuantityNotOnTick { .. } => ExchangeError::InvalidQuantity(err.to_string()),
            MarketError::BelowMinNotional { notional, minimum } => {
                ExchangeError::BelowMinNotional { notional, minimum }
            }
            MarketError::InvalidStatusTransition { to, .. } => ExchangeError::InvalidMarketStatus(to),
            MarketError::InvalidFeeRate(_)
            | MarketError::InvalidTickSize
            | MarketError::InvalidFundingParams
            | MarketError::InvalidExpiry => ExchangeError::InvalidMarketParams(err.to_string()),
        }
    }
}

impl From<OracleError> for ExchangeError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::InvalidOracle { .. } => ExchangeError::InvalidOracle(err.to_string()),
            OracleError::StaleOraclePrice { .. } => ExchangeError::StaleOraclePrice(err.to_string()),
        }
    }
}

impl From<OrderError> for ExchangeError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::InvalidTriggerPrice => ExchangeError::InvalidTriggerPrice,
            OrderError::InvalidBinaryOptionPrice(_) => ExchangeError::InvalidPrice(err.to_string()),
            OrderError::InsufficientOrderMargin { .. } | OrderError::MarkPriceBeyondMarginThreshold { .. } => {
                ExchangeError::InsufficientOrderMargin(err.to_string())
            }
        }
    }
}

impl From<PositionError> for ExchangeError {
    fn from(err: PositionError) -> Self {
        match err {
            PositionError::InvalidReduceOnlyPositionDirection => ExchangeError::InvalidReduceOnlyPositionDirection,
            PositionError::PriceSurpassesBankruptcyPrice { price, bankruptcy } => {
                ExchangeError::PriceSurpassesBankruptcyPrice { price, bankruptcy }
            }
        }
    }
}

impl From<InsuranceError> for ExchangeError {
    fn from(err: InsuranceError) -> Self {
        match err {
            InsuranceError::InvalidAmount(amount) => ExchangeError::InvalidAmount(amount),
            _ => ExchangeError::InsufficientInsuranceFund(err.to_string()),
        }
    }
}

impl From<BankError> for ExchangeError {
    fn from(err: BankError) -> Self {
        match err {
            BankError::InsufficientFunds {
                available,
                requested,
                ..
            } => ExchangeError::InsufficientDeposit {
                available,
                required: requested,
            },
            BankError::InvalidAmount(amount) => ExchangeError::InvalidAmount(amount),
        }
    }
}
