//! Derivatives exchange core simulation.
//!
//! Walks one engine through admission, end-of-block matching, conditional
//! triggers, funding, liquidation and forced settlement. Set `RUST_LOG=debug`
//! to see every state transition the engine logs.

use derivs_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing_subscriber::EnvFilter;

type SimResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

const QUOTE: &str = "USDT";

struct Sim {
    engine: Engine,
    oracle: StaticOracle,
    feed: OracleRef,
    market: MarketId,
    height: u64,
    time: i64,
}

impl Sim {
    fn new() -> SimResult<Self> {
        let oracle = StaticOracle::default();
        let feed = OracleRef::new("BTC", QUOTE, OracleType::PriceFeed);
        oracle.set_price(&feed, dec!(100), Timestamp::from_secs(0));

        let mut engine = Engine::with_oracle(ExchangeParams::default(), oracle.clone())?;
        let risk = RiskParams {
            initial_margin_ratio: dec!(0.1),
            maintenance_margin_ratio: dec!(0.05),
            reduce_margin_ratio: dec!(0.1),
            ..RiskParams::default()
        };
        let market = engine.launch_perpetual_market("BTC/USDT PERP", QUOTE, feed.clone(), risk)?;
        LedgerInsuranceFund.create_fund(engine.ledger_mut(), &market, dec!(50));

        Ok(Self {
            engine,
            oracle,
            feed,
            market,
            height: 1,
            time: 0,
        })
    }

    fn trader(&mut self, id: u8, amount: Decimal) -> SimResult<SubaccountId> {
        let owner = Address([id; 20]);
        let sub = SubaccountId::new(owner, 1);
        LedgerBank.mint(self.engine.ledger_mut(), &owner, QUOTE, amount);
        self.engine.deposit(&owner, &sub, QUOTE, amount)?;
        Ok(sub)
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

    fn next_block(&mut self, seconds: i64) {
        self.engine.end_block();
        self.height += 1;
        self.time += seconds;
        self.engine.begin_block(self.height, Timestamp::from_secs(self.time));
    }

    fn print_position(&self, label: &str, sub: &SubaccountId) {
        match self.engine.position(&self.market, sub) {
            Some(p) => println!(
                "  {label}: {:?} {} @ {} margin {}",
                p.side, p.quantity, p.entry_price, p.margin
            ),
            None => println!("  {label}: flat"),
        }
    }

    fn print_deposit(&self, label: &str, sub: &SubaccountId) {
        let d = self.engine.deposit_balance(sub, QUOTE);
        println!("  {label}: available {} total {}", d.available_balance, d.total_balance);
    }
}

fn main() -> SimResult {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Derivatives Exchange Core Simulation\n");
    scenario_1_admission_and_matching()?;
    scenario_2_conditional_trigger()?;
    scenario_3_funding()?;
    scenario_4_liquidation()?;
    scenario_5_forced_settlement()?;
    println!("\nAll simulations completed.");
    Ok(())
}

/// Post-only maker, regular limit taker, match at end of block.
fn scenario_1_admission_and_matching() -> SimResult {
    println!("Scenario 1: Admission and End-of-Block Matching\n");
    let mut sim = Sim::new()?;
    let maker = sim.trader(1, dec!(1000))?;
    let taker = sim.trader(2, dec!(1000))?;

    let ask = sim.order(maker, OrderType::SellPostOnly, dec!(100), dec!(2), dec!(20));
    sim.engine.create_limit_order(ask)?;
    let bid = sim.order(taker, OrderType::Buy, dec!(100), dec!(1), dec!(10));
    sim.engine.create_limit_order(bid)?;
    sim.print_deposit("taker after hold", &taker);

    let crossing = sim.order(taker, OrderType::BuyPostOnly, dec!(100), dec!(1), dec!(10));
    if let Err(err) = sim.engine.create_limit_order(crossing) {
        println!("  crossing post-only rejected: {err} (code {})", err.code().0);
    }

    sim.next_block(1);
    sim.print_position("maker", &maker);
    sim.print_position("taker", &taker);
    sim.print_deposit("auction", &AUCTION_SUBACCOUNT);
    println!();
    Ok(())
}

/// Stop order promoted once the mark crosses its trigger.
fn scenario_2_conditional_trigger() -> SimResult {
    println!("Scenario 2: Conditional Order Trigger\n");
    let mut sim = Sim::new()?;
    let maker = sim.trader(1, dec!(1000))?;
    let trader = sim.trader(2, dec!(1000))?;

    let ask = sim.order(maker, OrderType::SellPostOnly, dec!(115), dec!(1), dec!(12));
    sim.engine.create_limit_order(ask)?;
    let mut stop = sim.order(trader, OrderType::StopBuy, dec!(120), dec!(1), dec!(60));
    stop.trigger_price = Price::new(dec!(110));
    sim.engine.create_limit_order(stop)?;
    println!("  conditional orders: {}", sim.engine.conditional_orders(&sim.market).len());

    sim.set_mark(dec!(112));
    sim.next_block(1);
    sim.print_position("trader", &trader);
    println!("  conditional orders: {}\n", sim.engine.conditional_orders(&sim.market).len());
    Ok(())
}

/// One funding interval with no traded premium: longs pay the interest rate.
fn scenario_3_funding() -> SimResult {
    println!("Scenario 3: Hourly Funding\n");
    let mut sim = Sim::new()?;
    let short = sim.trader(1, dec!(1000))?;
    let long = sim.trader(2, dec!(1000))?;

    let ask = sim.order(short, OrderType::SellPostOnly, dec!(100), dec!(5), dec!(50));
    sim.engine.create_limit_order(ask)?;
    let bid = sim.order(long, OrderType::BuyAtomic, dec!(100), dec!(5), dec!(50));
    sim.engine.create_market_order(bid)?;

    sim.next_block(3600);
    if let Some(funding) = sim.engine.perpetual_funding(&sim.market) {
        println!("  cumulative funding: {}", funding.cumulative_funding);
    }
    sim.engine.increase_position_margin(&long, &long, &sim.market, dec!(1))?;
    sim.print_position("long after touch", &long);
    println!();
    Ok(())
}

/// Mark falls through maintenance; a liquidator closes the position at its bid.
fn scenario_4_liquidation() -> SimResult {
    println!("Scenario 4: Liquidation\n");
    let mut sim = Sim::new()?;
    let maker = sim.trader(1, dec!(1000))?;
    let holder = sim.trader(2, dec!(20))?;
    let liquidator = sim.trader(3, dec!(1000))?;

    let ask = sim.order(maker, OrderType::SellPostOnly, dec!(100), dec!(1), dec!(100));
    sim.engine.create_limit_order(ask)?;
    let bid = sim.order(holder, OrderType::BuyAtomic, dec!(100), dec!(1), dec!(10));
    sim.engine.create_market_order(bid)?;
    println!(
        "  liquidation price: {}",
        sim.engine.liquidation_price(&sim.market, &holder)?
    );

    sim.set_mark(dec!(94));
    let offer = sim.order(liquidator, OrderType::Buy, dec!(94), dec!(1), dec!(9.4));
    let result = sim.engine.liquidate_position(&liquidator, &sim.market, &holder, Some(offer))?;
    println!(
        "  liquidated {} payout {} reward {} insurance draw {}",
        result.quantity, result.payout, result.liquidator_reward, result.insurance_draw
    );
    sim.print_position("holder", &holder);
    sim.print_position("liquidator", &liquidator);
    println!();
    Ok(())
}

/// Governance schedules settlement; insurance and haircuts cover the loser's deficit.
fn scenario_5_forced_settlement() -> SimResult {
    println!("Scenario 5: Forced Settlement\n");
    let mut sim = Sim::new()?;
    let short = sim.trader(1, dec!(1000))?;
    let long_a = sim.trader(2, dec!(1000))?;
    let long_b = sim.trader(3, dec!(1000))?;

    let ask = sim.order(short, OrderType::SellPostOnly, dec!(100), dec!(4), dec!(40));
    sim.engine.create_limit_order(ask)?;
    for (sub, quantity) in [(long_a, dec!(1)), (long_b, dec!(3))] {
        let bid = sim.order(sub, OrderType::BuyAtomic, dec!(100), quantity, quantity * dec!(10));
        sim.engine.create_market_order(bid)?;
    }

    sim.engine.schedule_market_settlement(&sim.market, Some(dec!(150)))?;
    sim.next_block(1);
    for event in sim.engine.recent_events(64) {
        match &event.payload {
            EventPayload::AllPositionsHaircut(e) => println!("  haircut rate {}", e.missing_funds_rate),
            EventPayload::MarketSettled(e) => println!("  settled: paid {} drew {}", e.total_payout, e.insurance_draw),
            _ => {}
        }
    }
    sim.print_deposit("short", &short);
    sim.print_deposit("long a", &long_a);
    sim.print_deposit("long b", &long_b);
    if let Some(market) = sim.engine.get_market(&sim.market) {
        println!("  market status: {:?}", market.status);
    }
    Ok(())
}
