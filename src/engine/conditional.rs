// 8.9 engine/conditional.rs: conditional order triggers.
//
// the scan is read-only and fans out over worker threads, one chunk of markets
// each. promotion mutates state and runs sequentially in market order, so the
// result does not depend on how the scan was split.

use super::core::Engine;
use super::markets::fetch_mark_price;
use crate::events::{CancelReason, ConditionalTriggerFailedEvent, ConditionalTriggeredEvent, EventPayload};
use crate::market::DerivativeMarket;
use crate::oracle::Oracle;
use crate::order::{ConditionalOrder, DerivativeOrder};
use crate::store::keys::{conditional_bucket_prefix, padded_price};
use crate::store::{prefix_end, Ledger, TypedStore};
use crate::types::Timestamp;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

/// Triggered orders of one market, in promotion order.
#[derive(Debug)]
struct TriggeredOrders {
    market: DerivativeMarket,
    mark_price: Decimal,
    orders: Vec<ConditionalOrder>,
}

/// Collects the triggered conditional orders of `market`: market orders before
/// limit orders, trigger-higher buckets before trigger-lower ones.
fn scan_market(ledger: &Ledger, oracle: &dyn Oracle, market: &DerivativeMarket, now: Timestamp) -> Option<TriggeredOrders> {
    let mark_price = match fetch_mark_price(oracle, market, now) {
        Ok(price) => price,
        Err(err) => {
            debug!(market = %market.market_id, error = %err, "skipping trigger scan");
            return None;
        }
    };
    let store = ledger.store();
    let mark_key = padded_price(mark_price);
    let mut orders = Vec::new();

    for is_market in [true, false] {
        // trigger <= mark
        let prefix = conditional_bucket_prefix(&market.market_id, true, is_market);
        let end = prefix_end(mark_key.as_bytes());
        orders.extend(store.values::<ConditionalOrder>(&prefix, None, end.as_deref(), false));
    }
    for is_market in [true, false] {
        // trigger >= mark
        let prefix = conditional_bucket_prefix(&market.market_id, false, is_market);
        orders.extend(store.values::<ConditionalOrder>(&prefix, Some(mark_key.as_bytes()), None, true));
    }

    let orders: Vec<ConditionalOrder> = orders
        .into_iter()
        .map(|(_, order)| order)
        .filter(|order| order.is_triggered(mark_price))
        .collect();
    if orders.is_empty() {
        return None;
    }
    Some(TriggeredOrders {
        market: market.clone(),
        mark_price,
        orders,
    })
}

impl Engine {
    /// Finds every conditional order whose trigger the mark price has crossed and
    /// places it as a regular order. Returns how many were promoted.
    pub fn trigger_conditional_orders(&mut self) -> usize {
        let markets = self.active_markets();
        if markets.is_empty() {
            return 0;
        }
        let now = self.now();
        let workers = self.params.trigger_scan_workers.max(1);
        let chunk_size = markets.len().div_ceil(workers);

        let ledger = &self.ledger;
        let oracle: &dyn Oracle = self.oracle.as_ref();
        let triggered: Vec<TriggeredOrders> = std::thread::scope(|scope| {
            let handles: Vec<_> = markets
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .filter_map(|market| scan_market(ledger, oracle, market, now))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });

        let mut promoted = 0;
        for batch in triggered {
            for order in batch.orders {
                if self.promote_conditional_order(&batch.market, order, batch.mark_price) {
                    promoted += 1;
                }
            }
        }
        if promoted > 0 {
            info!(promoted, "conditional orders triggered");
        }
        promoted
    }

    /// Releases the conditional hold and re-admits the order as a plain limit or
    /// market order at the current mark.
    fn promote_conditional_order(&mut self, market: &DerivativeMarket, order: ConditionalOrder, mark_price: Decimal) -> bool {
        let subaccount_id = order.order.subaccount_id();
        // an earlier promotion in this pass may have cancelled it
        if self
            .get_conditional_order(&market.market_id, &subaccount_id, &order.order_hash)
            .is_none()
        {
            return false;
        }
        self.cancel_conditional_order(market, &order, CancelReason::Triggered);

        let placed = DerivativeOrder {
            order_type: order.order.order_type.untriggered(),
            trigger_price: None,
            ..order.order.clone()
        };
        let result = if order.is_market {
            self.create_market_order(placed)
        } else {
            self.create_limit_order(placed)
        };

        match result {
            Ok(placed_order_hash) => {
                debug!(
                    market = %market.market_id,
                    order = %order.order_hash,
                    placed = %placed_order_hash,
                    mark = %mark_price,
                    "conditional order triggered"
                );
                self.emit_event(EventPayload::ConditionalOrderTriggered(ConditionalTriggeredEvent {
                    market_id: market.market_id,
                    is_limit_trigger: !order.is_market,
                    conditional_order_hash: order.order_hash,
                    placed_order_hash,
                    mark_price,
                }));
                true
            }
            Err(err) => {
                warn!(market = %market.market_id, order = %order.order_hash, error = %err, "triggered order rejected");
                self.emit_event(EventPayload::ConditionalOrderTriggerFailed(ConditionalTriggerFailedEvent {
                    market_id: market.market_id,
                    order_hash: order.order_hash,
                    mark_price,
                    error: err.to_string(),
                }));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeParams;
    use crate::engine::fixtures::{zero_fee_params, Fixture};
    use crate::order::OrderType;
    use crate::types::Price;
    use rust_decimal_macros::dec;

    fn stop_buy(fx: &Fixture, sub: crate::types::SubaccountId, market: crate::types::MarketId, trigger: Decimal) -> DerivativeOrder {
        let mut order = fx.order(sub, OrderType::StopBuy, dec!(120), dec!(1), dec!(60));
        order.market_id = market;
        order.trigger_price = Price::new(trigger);
        order
    }

    #[test]
    fn crossed_trigger_becomes_limit_order() {
        let mut fx = Fixture::perpetual();
        let sub = fx.trader(1, dec!(1000));
        let market = fx.market;

        let hash = fx.engine.create_limit_order(stop_buy(&fx, sub, market, dec!(110))).unwrap();
        assert_eq!(fx.engine.conditional_orders(&market).len(), 1);
        assert_eq!(fx.engine.trigger_conditional_orders(), 0);

        fx.set_mark(dec!(111));
        assert_eq!(fx.engine.trigger_conditional_orders(), 1);
        assert!(fx.engine.conditional_orders(&market).is_empty());

        let placed = fx.engine.subaccount_orders(&market, &sub);
        assert_eq!(placed.len(), 1);
        assert_ne!(placed[0].order_hash, hash);
        assert!(placed[0].trigger_price.is_none());
        // the hold moved from the conditional order to the placed one
        assert_eq!(fx.engine.deposit_balance(&sub, "USDT").available_balance, dec!(940));
    }

    #[test]
    fn scan_is_independent_of_worker_count() {
        for workers in [1, 4] {
            let params = ExchangeParams {
                trigger_scan_workers: workers,
                ..ExchangeParams::default()
            };
            let mut fx = Fixture::perpetual_with(params, zero_fee_params());
            let sub = fx.trader(1, dec!(10000));
            let mut markets = vec![fx.market];
            for ticker in ["ETH/USDT PERP", "SOL/USDT PERP"] {
                let market = fx
                    .engine
                    .launch_perpetual_market(ticker, "USDT", fx.feed.clone(), zero_fee_params())
                    .unwrap();
                markets.push(market);
            }
            for market in &markets {
                let order = stop_buy(&fx, sub, *market, dec!(110));
                fx.engine.create_limit_order(order).unwrap();
            }
            fx.set_mark(dec!(115));
            assert_eq!(fx.engine.trigger_conditional_orders(), 3);
            for market in &markets {
                assert_eq!(fx.engine.subaccount_orders(market, &sub).len(), 1);
            }
        }
    }
}
