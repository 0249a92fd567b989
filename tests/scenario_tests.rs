//! End-to-end scenarios through the public engine API.
//!
//! Each test builds a fresh engine with one BTC/USDT perpetual at mark 100.

use derivs_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const QUOTE: &str = "USDT";

struct Exchange {
    engine: Engine,
    oracle: StaticOracle,
    feed: OracleRef,
    market: MarketId,
}

impl Exchange {
    fn new(taker_fee_rate: Decimal) -> Self {
        let oracle = StaticOracle::default();
        let feed = OracleRef::new("BTC", QUOTE, OracleType::PriceFeed);
        oracle.set_price(&feed, dec!(100), Timestamp::from_secs(0));
        let mut engine = Engine::with_oracle(ExchangeParams::default(), oracle.clone()).unwrap();
        let risk = RiskParams {
            initial_margin_ratio: dec!(0.1),
            maintenance_margin_ratio: dec!(0.05),
            reduce_margin_ratio: dec!(0.1),
            maker_fee_rate: Decimal::ZERO,
            taker_fee_rate,
            ..RiskParams::default()
        };
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

    fn trader(&mut self, id: u8, amount: Decimal) -> SubaccountId {
        let owner = Address([id; 20]);
        let sub = SubaccountId::new(owner, 1);
        LedgerBank.mint(self.engine.ledger_mut(), &owner, QUOTE, amount);
        self.engine.deposit(&owner, &sub, QUOTE, amount).unwrap();
        sub
    }

    fn order(&self, sub: SubaccountId, order_type: OrderType, price: Decimal, quantity: Decimal, margin: Decimal) -> DerivativeOrder {
        DerivativeOrder {
            market_id: self.market,
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

    fn set_mark(&self, price: Decimal) {
        self.oracle.set_price(&self.feed, price, self.engine.now());
    }

    fn total(&self, sub: &SubaccountId) -> Decimal {
        self.engine.deposit_balance(sub, QUOTE).total_balance
    }
}

#[test]
fn limit_order_hold_is_refunded_on_cancel() {
    let mut ex = Exchange::new(dec!(0.001));
    let sub = ex.trader(1, dec!(1000));

    let bid = ex.order(sub, OrderType::Buy, dec!(100), dec!(10), dec!(100));
    let hash = ex.engine.create_limit_order(bid).unwrap();
    // 10 x 100 x 0.1 margin plus the taker fee on 1000 notional
    let held = ex.engine.deposit_balance(&sub, QUOTE);
    assert_eq!(held.available_balance, dec!(899));
    assert_eq!(held.total_balance, dec!(1000));

    ex.engine.cancel_order(&ex.market, &sub, &hash).unwrap();
    let refunded = ex.engine.deposit_balance(&sub, QUOTE);
    assert_eq!(refunded.available_balance, dec!(1000));
    assert_eq!(refunded.total_balance, dec!(1000));
    assert!(ex.engine.subaccount_orders(&ex.market, &sub).is_empty());
}

#[test]
fn long_becomes_liquidatable_below_maintenance() {
    let mut ex = Exchange::new(Decimal::ZERO);
    let market = ex.market;
    LedgerInsuranceFund.create_fund(ex.engine.ledger_mut(), &market, dec!(100));
    let holder = ex.trader(1, dec!(10));
    let maker = ex.trader(2, dec!(1000));
    let liquidator = ex.trader(3, dec!(1000));

    let ask = ex.order(maker, OrderType::SellPostOnly, dec!(100), dec!(1), dec!(10));
    ex.engine.create_limit_order(ask).unwrap();
    let buy = ex.order(holder, OrderType::BuyAtomic, dec!(100), dec!(1), dec!(10));
    ex.engine.create_market_order(buy).unwrap();

    // (10 - (100 - P)) / P = 0.05  =>  P = 90 / 0.95
    let liquidation_price = ex.engine.liquidation_price(&market, &holder).unwrap();
    assert_eq!(liquidation_price, dec!(90) / dec!(0.95));

    let bid = ex.order(liquidator, OrderType::BuyPostOnly, dec!(94.73), dec!(1), dec!(94.73));
    ex.engine.create_limit_order(bid).unwrap();

    ex.set_mark(dec!(94.74));
    let err = ex.engine.liquidate_position(&liquidator, &market, &holder, None).unwrap_err();
    assert!(matches!(err, ExchangeError::PositionNotLiquidable { .. }));
    assert!(ex.engine.position(&market, &holder).is_some());

    ex.set_mark(dec!(94.73));
    let result = ex.engine.liquidate_position(&liquidator, &market, &holder, None).unwrap();
    assert_eq!(result.quantity, dec!(1));
    assert!(!result.market_paused);
    assert!(ex.engine.position(&market, &holder).is_none());
    let taken = ex.engine.position(&market, &liquidator).unwrap();
    assert_eq!(taken.side, Side::Long);
    assert_eq!(taken.entry_price, dec!(94.73));
}

#[test]
fn residual_deficit_is_socialized_over_profits() {
    let mut ex = Exchange::new(Decimal::ZERO);
    let market = ex.market;
    let a = ex.trader(1, dec!(1000));
    let b = ex.trader(2, dec!(1000));
    let c = ex.trader(3, dec!(1000));

    let ask = ex.order(c, OrderType::SellPostOnly, dec!(100), dec!(4), dec!(40));
    ex.engine.create_limit_order(ask).unwrap();
    let buy_a = ex.order(a, OrderType::BuyAtomic, dec!(100), dec!(1), dec!(10));
    ex.engine.create_market_order(buy_a).unwrap();
    let buy_b = ex.order(b, OrderType::BuyAtomic, dec!(100), dec!(3), dec!(30));
    ex.engine.create_market_order(buy_b).unwrap();
    LedgerInsuranceFund.create_fund(ex.engine.ledger_mut(), &market, dec!(140));

    // at 150 the longs profit 50 and 150, the short owes 160 past its margin
    ex.engine.schedule_market_settlement(&market, Some(dec!(150))).unwrap();
    ex.engine.begin_block(2, Timestamp::from_secs(1));

    let haircuts: Vec<Decimal> = ex
        .engine
        .events()
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::AllPositionsHaircut(h) => Some(h.missing_funds_rate),
            _ => None,
        })
        .collect();
    assert_eq!(haircuts, vec![dec!(0.1)]);

    // each profit loses 10%
    assert_eq!(ex.total(&a), dec!(1045));
    assert_eq!(ex.total(&b), dec!(1135));
    assert_eq!(ex.total(&c), dec!(960));
    assert_eq!(LedgerInsuranceFund.balance(ex.engine.ledger(), &market), dec!(0));
    assert!(ex.engine.positions(&market).is_empty());
    assert_eq!(ex.engine.get_market(&market).unwrap().status, MarketStatus::Paused);
}

#[test]
fn batch_fails_only_the_underfunded_order() {
    let mut ex = Exchange::new(Decimal::ZERO);
    let sub = ex.trader(1, dec!(1000));
    let orders = vec![
        ex.order(sub, OrderType::BuyPostOnly, dec!(90), dec!(1), dec!(9)),
        ex.order(sub, OrderType::BuyPostOnly, dec!(91), dec!(1), dec!(1)),
        ex.order(sub, OrderType::BuyPostOnly, dec!(92), dec!(1), dec!(9.2)),
    ];

    let results = ex.engine.batch_create_orders(orders);
    assert_eq!(results.len(), 3);
    let first = results[0].as_ref().unwrap();
    let third = results[2].as_ref().unwrap();
    assert_ne!(first, third);
    let code = results[1].as_ref().unwrap_err().code().0;

    let failures: Vec<&OrderFailEvent> = ex
        .engine
        .events()
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::OrderFail(fail) => Some(fail),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].codes, vec![code]);
    assert_eq!(ex.engine.subaccount_orders(&ex.market, &sub).len(), 2);
}

#[test]
fn stop_order_enters_the_book_once_triggered() {
    let mut ex = Exchange::new(Decimal::ZERO);
    let maker = ex.trader(1, dec!(1000));
    let trader = ex.trader(2, dec!(1000));

    let ask = ex.order(maker, OrderType::SellPostOnly, dec!(115), dec!(1), dec!(12));
    ex.engine.create_limit_order(ask).unwrap();
    let mut stop = ex.order(trader, OrderType::StopBuy, dec!(120), dec!(1), dec!(60));
    stop.trigger_price = Price::new(dec!(110));
    ex.engine.create_limit_order(stop).unwrap();
    assert_eq!(ex.engine.conditional_orders(&ex.market).len(), 1);

    // below the trigger nothing happens
    ex.engine.end_block();
    ex.engine.begin_block(2, Timestamp::from_secs(1));
    assert_eq!(ex.engine.conditional_orders(&ex.market).len(), 1);

    ex.set_mark(dec!(112));
    ex.engine.end_block();
    assert!(ex.engine.conditional_orders(&ex.market).is_empty());
    let position = ex.engine.position(&ex.market, &trader).unwrap();
    assert_eq!(position.side, Side::Long);
    assert_eq!(position.entry_price, dec!(115));
}
