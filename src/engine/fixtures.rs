// shared setup for engine unit tests

use super::core::Engine;
use crate::config::ExchangeParams;
use crate::custody::LedgerBank;
use crate::market::{OracleRef, OracleType, RiskParams};
use crate::oracle::StaticOracle;
use crate::order::{DerivativeOrder, OrderInfo, OrderType};
use crate::types::{Address, MarketId, Price, SubaccountId, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const QUOTE: &str = "USDT";

pub struct Fixture {
    pub engine: Engine,
    pub oracle: StaticOracle,
    pub feed: OracleRef,
    pub market: MarketId,
}

impl Fixture {
    /// Perpetual at mark 100 with zero fees and a 10% initial margin.
    pub fn perpetual() -> Self {
        Self::perpetual_with(ExchangeParams::default(), zero_fee_params())
    }

    pub fn perpetual_with(params: ExchangeParams, risk: RiskParams) -> Self {
        let oracle = StaticOracle::default();
        let feed = OracleRef::new("BTC", QUOTE, OracleType::PriceFeed);
        oracle.set_price(&feed, dec!(100), Timestamp::from_secs(0));
        let mut engine = Engine::with_oracle(params, oracle.clone()).unwrap();
        let market = engine
            .launch_perpetual_market("BTC/USDT PERP", QUOTE, feed.clone(), risk)
            .unwrap();
        Self {
            engine,
            oracle,
            feed,
            market,
        }
    }

    pub fn set_mark(&self, price: Decimal) {
        self.oracle.set_price(&self.feed, price, self.engine.now());
    }

    /// Subaccount 1 of a fresh trader, funded with `amount`.
    pub fn trader(&mut self, id: u8, amount: Decimal) -> SubaccountId {
        let owner = Address([id; 20]);
        let sub = SubaccountId::new(owner, 1);
        LedgerBank.mint(self.engine.ledger_mut(), &owner, QUOTE, amount);
        self.engine.deposit(&owner, &sub, QUOTE, amount).unwrap();
        sub
    }

    pub fn order(&self, sub: SubaccountId, order_type: OrderType, price: Decimal, quantity: Decimal, margin: Decimal) -> DerivativeOrder {
        order(self.market, sub, order_type, price, quantity, margin)
    }
}

pub fn zero_fee_params() -> RiskParams {
    RiskParams {
        initial_margin_ratio: dec!(0.1),
        maintenance_margin_ratio: dec!(0.05),
        reduce_margin_ratio: dec!(0.1),
        maker_fee_rate: Decimal::ZERO,
        taker_fee_rate: Decimal::ZERO,
        ..RiskParams::default()
    }
}

pub fn order(
    market_id: MarketId,
    sub: SubaccountId,
    order_type: OrderType,
    price: Decimal,
    quantity: Decimal,
    margin: Decimal,
) -> DerivativeOrder {
    DerivativeOrder {
        market_id,
        order_info: OrderInfo {
            subaccount_id: sub,
            fee_recipient: Address([0xfe; 20]),
            price: Price::new_unchecked(price),
            quantity,
            cid: None,
        },
        order_type,
        margin,
        trigger_price: None,
    }
}
