// 8.5 engine/orderbook.rs: order storage and cancellation.
//
// the resting book lives in the persistent store, orders placed this block in the
// transient one under the same key layout. every write keeps the subaccount index,
// orderbook metadata and client order id map in step with the order itself.

use super::core::Engine;
use crate::events::{CancelReason, EventPayload, OrderCanceledEvent};
use crate::market::DerivativeMarket;
use crate::metadata::SubaccountOrderbookMetadata;
use crate::order::{ConditionalOrder, DerivativeLimitOrder, DerivativeMarketOrder};
use crate::store::keys::{
    cid_key, conditional_bucket_prefix, conditional_index_key, conditional_index_prefix, conditional_order_key,
    limit_order_index_key, limit_order_index_prefix, limit_order_key, limit_order_side_prefix,
    market_order_indicator_key, market_order_key, market_order_side_prefix, metadata_key, no_margin_locked_key,
    nonce_key,
};
use crate::store::{CacheStore, KvStore, MemStore, TypedStore};
use crate::types::{MarketId, OrderHash, Price, Side, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Book {
    Resting,
    // orders placed this block, matched at end of block
    Transient,
}

/// Locates one order. The client order id map stores these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub order_hash: OrderHash,
}

/// Sorts best price first; equal prices keep hash order.
pub(super) fn sort_best_first(orders: &mut [(Book, DerivativeLimitOrder)], side: Side) {
    orders.sort_by(|(_, a), (_, b)| {
        let by_price = match side {
            Side::Long => b.price().cmp(&a.price()),
            Side::Short => a.price().cmp(&b.price()),
        };
        by_price.then_with(|| a.order_hash.cmp(&b.order_hash))
    });
}

impl Engine {
    fn book(&self, book: Book) -> &CacheStore<MemStore> {
        match book {
            Book::Resting => self.ledger.store(),
            Book::Transient => self.ledger.transient(),
        }
    }

    fn book_mut(&mut self, book: Book) -> &mut CacheStore<MemStore> {
        match book {
            Book::Resting => self.ledger.store_mut(),
            Book::Transient => self.ledger.transient_mut(),
        }
    }

    // 8.5.1: limit orders

    pub(super) fn set_limit_order(&mut self, book: Book, market_id: &MarketId, order: &DerivativeLimitOrder) {
        let key = limit_order_key(market_id, order.side(), order.price(), &order.order_hash);
        let index = limit_order_index_key(market_id, order.side(), &order.subaccount_id(), &order.order_hash);
        let store = self.book_mut(book);
        store.set_value(&key, order);
        store.set(&index, key);
    }

    pub(super) fn delete_limit_order(&mut self, book: Book, market_id: &MarketId, order: &DerivativeLimitOrder) {
        let key = limit_order_key(market_id, order.side(), order.price(), &order.order_hash);
        let index = limit_order_index_key(market_id, order.side(), &order.subaccount_id(), &order.order_hash);
        let store = self.book_mut(book);
        store.delete(&key);
        store.delete(&index);
    }

    pub(super) fn get_limit_order(
        &self,
        book: Book,
        market_id: &MarketId,
        side: Side,
        subaccount_id: &SubaccountId,
        order_hash: &OrderHash,
    ) -> Option<DerivativeLimitOrder> {
        let store = self.book(book);
        let key = store.get(&limit_order_index_key(market_id, side, subaccount_id, order_hash))?;
        store.get_value(&key)
    }

    pub(super) fn find_limit_order(
        &self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        order_hash: &OrderHash,
    ) -> Option<(Book, DerivativeLimitOrder)> {
        for book in [Book::Resting, Book::Transient] {
            for side in [Side::Long, Side::Short] {
                if let Some(order) = self.get_limit_order(book, market_id, side, subaccount_id, order_hash) {
                    return Some((book, order));
                }
            }
        }
        None
    }

    /// One side of a book, best price first.
    pub(super) fn book_orders(&self, book: Book, market_id: &MarketId, side: Side) -> Vec<DerivativeLimitOrder> {
        // buys sort descending, so walk the price index backwards
        let reverse = side == Side::Long;
        let mut orders: Vec<(Book, DerivativeLimitOrder)> = self
            .book(book)
            .values(&limit_order_side_prefix(market_id, side), None, None, reverse)
            .into_iter()
            .map(|(_, o)| (book, o))
            .collect();
        sort_best_first(&mut orders, side);
        orders.into_iter().map(|(_, o)| o).collect()
    }

    /// Resting orders on one side, best price first.
    pub fn limit_orders(&self, market_id: &MarketId, side: Side) -> Vec<DerivativeLimitOrder> {
        self.book_orders(Book::Resting, market_id, side)
    }

    pub fn best_price(&self, market_id: &MarketId, side: Side) -> Option<Decimal> {
        self.limit_orders(market_id, side).first().map(DerivativeLimitOrder::price)
    }

    /// A subaccount's orders on one side across both books, best price first.
    pub(super) fn subaccount_side_orders(
        &self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        side: Side,
    ) -> Vec<(Book, DerivativeLimitOrder)> {
        let prefix = limit_order_index_prefix(market_id, side, subaccount_id);
        let mut orders = Vec::new();
        for book in [Book::Resting, Book::Transient] {
            let store = self.book(book);
            for (_, primary) in store.iterate_prefix(&prefix, false) {
                if let Some(order) = store.get_value::<DerivativeLimitOrder>(&primary) {
                    orders.push((book, order));
                }
            }
        }
        sort_best_first(&mut orders, side);
        orders
    }

    /// Every open limit order of a subaccount in one market.
    pub fn subaccount_orders(&self, market_id: &MarketId, subaccount_id: &SubaccountId) -> Vec<DerivativeLimitOrder> {
        [Side::Long, Side::Short]
            .into_iter()
            .flat_map(|side| self.subaccount_side_orders(market_id, subaccount_id, side))
            .map(|(_, o)| o)
            .collect()
    }

    /// Whether a market order at `price` would match the resting book.
    pub(super) fn order_crosses_top_of_book(&self, market_id: &MarketId, side: Side, price: Decimal) -> bool {
        match self.best_price(market_id, side.opposite()) {
            None => false,
            Some(best) => Price::new_unchecked(price).is_better_or_equal(Price::new_unchecked(best), side),
        }
    }

    // 8.5.2: per-subaccount bookkeeping

    pub fn orderbook_metadata(
        &self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        side: Side,
    ) -> SubaccountOrderbookMetadata {
        self.ledger
            .store()
            .get_value(&metadata_key(market_id, subaccount_id, side))
            .unwrap_or_default()
    }

    pub(super) fn set_orderbook_metadata(
        &mut self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        side: Side,
        metadata: &SubaccountOrderbookMetadata,
    ) {
        let key = metadata_key(market_id, subaccount_id, side);
        if metadata.is_empty() {
            self.ledger.store_mut().delete(&key);
        } else {
            self.ledger.store_mut().set_value(&key, metadata);
        }
    }

    pub(super) fn update_orderbook_metadata(
        &mut self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        side: Side,
        f: impl FnOnce(&mut SubaccountOrderbookMetadata),
    ) {
        let mut metadata = self.orderbook_metadata(market_id, subaccount_id, side);
        f(&mut metadata);
        self.set_orderbook_metadata(market_id, subaccount_id, side, &metadata);
    }

    /// Bumps and returns the nonce the next order hash is derived from.
    pub(super) fn increment_subaccount_nonce(&mut self, subaccount_id: &SubaccountId) -> u32 {
        let key = nonce_key(subaccount_id);
        let nonce: u32 = self.ledger.store().get_value(&key).unwrap_or(0) + 1;
        self.ledger.store_mut().set_value(&key, &nonce);
        nonce
    }

    pub fn get_order_by_cid(&self, subaccount_id: &SubaccountId, cid: &str) -> Option<OrderRef> {
        self.ledger.store().get_value(&cid_key(subaccount_id, cid))
    }

    pub(super) fn set_cid(&mut self, cid: Option<&str>, order: OrderRef) {
        if let Some(cid) = cid {
            self.ledger
                .store_mut()
                .set_value(&cid_key(&order.subaccount_id, cid), &order);
        }
    }

    pub(super) fn delete_cid(&mut self, subaccount_id: &SubaccountId, cid: Option<&str>) {
        if let Some(cid) = cid {
            self.ledger.store_mut().delete(&cid_key(subaccount_id, cid));
        }
    }

    pub(super) fn flag_no_margin_locked(&mut self, market_id: &MarketId, subaccount_id: &SubaccountId, side: Side) {
        self.ledger
            .transient_mut()
            .set_value(&no_margin_locked_key(market_id, subaccount_id, side), &side);
    }

    // 8.5.3: market orders, transient only

    pub(super) fn set_market_order(&mut self, market_id: &MarketId, order: &DerivativeMarketOrder) {
        let key = market_order_key(market_id, order.side(), order.price(), &order.order_hash);
        let store = self.ledger.transient_mut();
        store.set_value(&key, order);
        store.set_value(&market_order_indicator_key(market_id, &order.subaccount_id()), &order.order_hash);
    }

    pub(super) fn delete_market_order(&mut self, market_id: &MarketId, order: &DerivativeMarketOrder) {
        let key = market_order_key(market_id, order.side(), order.price(), &order.order_hash);
        self.ledger.transient_mut().delete(&key);
    }

    /// Market orders on one side in price priority.
    pub(super) fn market_orders(&self, market_id: &MarketId, side: Side) -> Vec<DerivativeMarketOrder> {
        self.ledger
            .transient()
            .values(&market_order_side_prefix(market_id, side), None, None, side == Side::Long)
            .into_iter()
            .map(|(_, o)| o)
            .collect()
    }

    pub(super) fn has_market_order_this_block(&self, market_id: &MarketId, subaccount_id: &SubaccountId) -> bool {
        self.ledger
            .transient()
            .has(&market_order_indicator_key(market_id, subaccount_id))
    }

    // 8.5.4: conditional orders

    pub(super) fn set_conditional_order(&mut self, market_id: &MarketId, order: &ConditionalOrder) {
        let key = conditional_order_key(
            market_id,
            order.trigger_higher,
            order.is_market,
            order.trigger_price(),
            &order.order_hash,
        );
        let index = conditional_index_key(market_id, &order.order.subaccount_id(), &order.order_hash);
        let store = self.ledger.store_mut();
        store.set_value(&key, order);
        store.set(&index, key);
    }

    pub(super) fn delete_conditional_order(&mut self, market_id: &MarketId, order: &ConditionalOrder) {
        let key = conditional_order_key(
            market_id,
            order.trigger_higher,
            order.is_market,
            order.trigger_price(),
            &order.order_hash,
        );
        let index = conditional_index_key(market_id, &order.order.subaccount_id(), &order.order_hash);
        let store = self.ledger.store_mut();
        store.delete(&key);
        store.delete(&index);
    }

    pub(super) fn get_conditional_order(
        &self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        order_hash: &OrderHash,
    ) -> Option<ConditionalOrder> {
        let store = self.ledger.store();
        let key = store.get(&conditional_index_key(market_id, subaccount_id, order_hash))?;
        store.get_value(&key)
    }

    pub fn subaccount_conditional_orders(
        &self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
    ) -> Vec<ConditionalOrder> {
        let store = self.ledger.store();
        store
            .iterate_prefix(&conditional_index_prefix(market_id, subaccount_id), false)
            .into_iter()
            .filter_map(|(_, primary)| store.get_value(&primary))
            .collect()
    }

    pub fn conditional_orders(&self, market_id: &MarketId) -> Vec<ConditionalOrder> {
        let store = self.ledger.store();
        let mut orders = Vec::new();
        for is_higher in [true, false] {
            for is_market in [true, false] {
                orders.extend(
                    store
                        .values::<ConditionalOrder>(
                            &conditional_bucket_prefix(market_id, is_higher, is_market),
                            None,
                            None,
                            false,
                        )
                        .into_iter()
                        .map(|(_, o)| o),
                );
            }
        }
        orders
    }

    pub(super) fn has_conditional_market_order_in_direction(
        &self,
        market_id: &MarketId,
        subaccount_id: &SubaccountId,
        trigger_higher: bool,
    ) -> bool {
        self.subaccount_conditional_orders(market_id, subaccount_id)
            .iter()
            .any(|o| o.is_market && o.trigger_higher == trigger_higher)
    }

    // 8.5.5: cancellation. each cancel refunds the remaining hold.

    pub(super) fn cancel_limit_order(
        &mut self,
        book: Book,
        market: &DerivativeMarket,
        order: &DerivativeLimitOrder,
        reason: CancelReason,
    ) {
        let market_id = market.market_id;
        let subaccount_id = order.subaccount_id();
        let refund = order.cancel_refund();

        self.delete_limit_order(book, &market_id, order);
        self.update_orderbook_metadata(&market_id, &subaccount_id, order.side(), |m| m.remove_limit_order(order));
        self.delete_cid(&subaccount_id, order.cid());
        self.increment_available(&subaccount_id, &market.quote_denom, refund);
        if order.is_vanilla() {
            self.flag_no_margin_locked(&market_id, &subaccount_id, order.side());
        }

        debug!(market = %market_id, order = %order.order_hash, ?reason, %refund, "limit order cancelled");
        self.emit_event(EventPayload::OrderCanceled(OrderCanceledEvent {
            market_id,
            subaccount_id,
            order_hash: order.order_hash,
            cid: order.cid().map(str::to_string),
            refund,
            is_conditional: false,
            reason,
        }));
    }

    pub(super) fn cancel_conditional_order(
        &mut self,
        market: &DerivativeMarket,
        order: &ConditionalOrder,
        reason: CancelReason,
    ) {
        let market_id = market.market_id;
        let subaccount_id = order.order.subaccount_id();
        let is_reduce_only = order.order.is_reduce_only();

        self.delete_conditional_order(&market_id, order);
        self.update_orderbook_metadata(&market_id, &subaccount_id, order.order.side(), |m| {
            m.remove_conditional_order(is_reduce_only)
        });
        self.delete_cid(&subaccount_id, order.order.cid());
        self.increment_available(&subaccount_id, &market.quote_denom, order.margin_hold);
        if !is_reduce_only && reason != CancelReason::Triggered {
            self.flag_no_margin_locked(&market_id, &subaccount_id, order.order.side());
        }

        debug!(market = %market_id, order = %order.order_hash, ?reason, "conditional order cancelled");
        self.emit_event(EventPayload::OrderCanceled(OrderCanceledEvent {
            market_id,
            subaccount_id,
            order_hash: order.order_hash,
            cid: order.order.cid().map(str::to_string),
            refund: order.margin_hold,
            is_conditional: true,
            reason,
        }));
    }

    pub(super) fn cancel_market_order(
        &mut self,
        market: &DerivativeMarket,
        order: &DerivativeMarketOrder,
        reason: CancelReason,
    ) {
        let subaccount_id = order.subaccount_id();
        self.delete_market_order(&market.market_id, order);
        self.increment_available(&subaccount_id, &market.quote_denom, order.margin_hold);
        self.emit_event(EventPayload::OrderCanceled(OrderCanceledEvent {
            market_id: market.market_id,
            subaccount_id,
            order_hash: order.order_hash,
            cid: order.order_info.cid.clone(),
            refund: order.margin_hold,
            is_conditional: false,
            reason,
        }));
    }

    /// Cancels a subaccount's limit orders in one market (both books, both sides)
    /// matching `filter`.
    pub(super) fn cancel_subaccount_limit_orders(
        &mut self,
        market: &DerivativeMarket,
        subaccount_id: &SubaccountId,
        filter: impl Fn(&DerivativeLimitOrder) -> bool,
        reason: CancelReason,
    ) {
        for side in [Side::Long, Side::Short] {
            for (book, order) in self.subaccount_side_orders(&market.market_id, subaccount_id, side) {
                if filter(&order) {
                    self.cancel_limit_order(book, market, &order, reason);
                }
            }
        }
    }

    pub(super) fn cancel_subaccount_conditional_orders(
        &mut self,
        market: &DerivativeMarket,
        subaccount_id: &SubaccountId,
        filter: impl Fn(&ConditionalOrder) -> bool,
        reason: CancelReason,
    ) {
        for order in self.subaccount_conditional_orders(&market.market_id, subaccount_id) {
            if filter(&order) {
                self.cancel_conditional_order(market, &order, reason);
            }
        }
    }

    pub(super) fn cancel_subaccount_market_orders(
        &mut self,
        market: &DerivativeMarket,
        subaccount_id: &SubaccountId,
        reason: CancelReason,
    ) {
        for side in [Side::Long, Side::Short] {
            for order in self.market_orders(&market.market_id, side) {
                if order.subaccount_id() == *subaccount_id {
                    self.cancel_market_order(market, &order, reason);
                }
            }
        }
    }

    /// Clears a market: resting and transient limit orders, conditional orders,
    /// and optionally this block's market orders.
    pub(super) fn cancel_all_orders_in_market(
        &mut self,
        market: &DerivativeMarket,
        include_market_orders: bool,
        reason: CancelReason,
    ) {
        let market_id = market.market_id;
        for book in [Book::Resting, Book::Transient] {
            for side in [Side::Long, Side::Short] {
                for order in self.book_orders(book, &market_id, side) {
                    self.cancel_limit_order(book, market, &order, reason);
                }
            }
        }
        for order in self.conditional_orders(&market_id) {
            self.cancel_conditional_order(market, &order, reason);
        }
        if include_market_orders {
            for side in [Side::Long, Side::Short] {
                for order in self.market_orders(&market_id, side) {
                    self.cancel_market_order(market, &order, reason);
                }
            }
        }
    }
}
