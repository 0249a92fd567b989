// 8.3 engine/markets.rs: market launch, lookup, status changes and mark prices.
// markets live under (enabled flag, id); a status change across the flag re-keys the record.

use super::core::Engine;
use super::results::ExchangeError;
use crate::events::{EventPayload, MarketLaunchedEvent, MarketUpdatedEvent};
use crate::funding::{next_interval_timestamp, PerpetualMarketFunding};
use crate::market::{
    BinaryOptionsInfo, DerivativeMarket, ExpiryFuturesInfo, MarketError, MarketKind, MarketParamUpdate, MarketStatus,
    OracleRef, OracleType, PerpetualInfo, RiskParams, EXPIRY_TWAP_WINDOW_SECS,
};
use crate::oracle::{Oracle, OracleError};
use crate::store::keys::{
    market_key, market_prefix, market_scoped, timestamp_index_key, BINARY_OPTIONS_EXPIRY, BINARY_OPTIONS_SETTLEMENT,
    EXPIRY_FUTURES_BY_TIMESTAMP, PERPETUAL_FUNDING,
};
use crate::store::{KvStore, TypedStore};
use crate::types::{Address, MarketId, Timestamp};
use rust_decimal::Decimal;
use tracing::info;

/// Mark price for `market`. Binary options read their provider feed, which may sit at 0.
pub(super) fn fetch_mark_price(
    oracle: &dyn Oracle,
    market: &DerivativeMarket,
    now: Timestamp,
) -> Result<Decimal, OracleError> {
    match market.oracle.oracle_type {
        OracleType::Provider => oracle.provider_price(&market.oracle.quote, &market.oracle.base, now),
        _ => oracle.price(&market.oracle, now),
    }
}

impl Engine {
    pub fn launch_perpetual_market(
        &mut self,
        ticker: &str,
        quote_denom: &str,
        oracle: OracleRef,
        params: RiskParams,
    ) -> Result<MarketId, ExchangeError> {
        let interval = self.params.funding_interval_secs;
        let info = PerpetualInfo {
            hourly_funding_rate_cap: self.params.default_hourly_funding_rate_cap,
            hourly_interest_rate: self.params.default_hourly_interest_rate,
            funding_interval_secs: interval,
            next_funding_timestamp: next_interval_timestamp(self.now(), interval),
        };
        let market = DerivativeMarket::new(ticker, quote_denom, oracle, MarketKind::Perpetual(info), params);
        self.launch_market(market)
    }

    pub fn launch_expiry_futures_market(
        &mut self,
        ticker: &str,
        quote_denom: &str,
        oracle: OracleRef,
        expiry: Timestamp,
        params: RiskParams,
    ) -> Result<MarketId, ExchangeError> {
        let kind = MarketKind::ExpiryFuture(ExpiryFuturesInfo::new(expiry));
        let market = DerivativeMarket::new(ticker, quote_denom, oracle, kind, params);
        self.launch_market(market)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn launch_binary_options_market(
        &mut self,
        ticker: &str,
        quote_denom: &str,
        oracle: OracleRef,
        expiration: Timestamp,
        settlement: Timestamp,
        admin: Address,
        params: RiskParams,
    ) -> Result<MarketId, ExchangeError> {
        let kind = MarketKind::BinaryOption(BinaryOptionsInfo {
            expiration_timestamp: expiration,
            settlement_timestamp: settlement,
            settlement_price: None,
        });
        let mut market = DerivativeMarket::new(ticker, quote_denom, oracle, kind, params);
        market.admin = Some(admin);
        self.launch_market(market)
    }

    /// Validates and stores a new market, plus its funding record or expiry indexes.
    pub fn launch_market(&mut self, market: DerivativeMarket) -> Result<MarketId, ExchangeError> {
        market
            .params
            .validate_for(market.market_type(), self.params.relayer_fee_share_rate)?;
        let market_id = market.market_id;
        if self.get_market(&market_id).is_some() {
            return Err(ExchangeError::MarketAlreadyExists(market_id));
        }

        let now = self.now();
        match &market.kind {
            MarketKind::Perpetual(_) | MarketKind::ExpiryFuture(_) => {
                fetch_mark_price(self.oracle.as_ref(), &market, now)?;
            }
            MarketKind::BinaryOption(_) => {}
        }

        match &market.kind {
            MarketKind::Perpetual(_) => {
                self.set_perpetual_funding(&market_id, &PerpetualMarketFunding::new(now));
            }
            MarketKind::ExpiryFuture(info) => {
                if info.expiration_timestamp <= now {
                    return Err(MarketError::InvalidExpiry.into());
                }
                for key in Self::expiry_index_keys(&market_id, info) {
                    self.ledger.store_mut().set_value(&key, &market_id);
                }
            }
            MarketKind::BinaryOption(info) => {
                if info.expiration_timestamp <= now || info.settlement_timestamp < info.expiration_timestamp {
                    return Err(MarketError::InvalidExpiry.into());
                }
                let store = self.ledger.store_mut();
                store.set_value(
                    &timestamp_index_key(BINARY_OPTIONS_EXPIRY, info.expiration_timestamp, &market_id),
                    &market_id,
                );
                store.set_value(
                    &timestamp_index_key(BINARY_OPTIONS_SETTLEMENT, info.settlement_timestamp, &market_id),
                    &market_id,
                );
            }
        }

        self.set_market(&market);
        info!(market = %market_id, ticker = %market.ticker, kind = ?market.market_type(), "market launched");
        self.emit_event(EventPayload::MarketLaunched(MarketLaunchedEvent {
            market_id,
            ticker: market.ticker.clone(),
        }));
        Ok(market_id)
    }

    pub fn get_market(&self, market_id: &MarketId) -> Option<DerivativeMarket> {
        let store = self.ledger.store();
        store
            .get_value(&market_key(true, market_id))
            .or_else(|| store.get_value(&market_key(false, market_id)))
    }

    pub(super) fn active_market(&self, market_id: &MarketId) -> Result<DerivativeMarket, ExchangeError> {
        self.get_market(market_id)
            .filter(DerivativeMarket::is_active)
            .ok_or(ExchangeError::MarketNotFound(*market_id))
    }

    pub(super) fn is_market_active(&self, market_id: &MarketId) -> bool {
        self.ledger.store().has(&market_key(true, market_id))
    }

    /// Active markets first, then the rest, each in id order.
    pub fn markets(&self) -> Vec<DerivativeMarket> {
        let store = self.ledger.store();
        let mut markets: Vec<DerivativeMarket> = store
            .values(&market_prefix(true), None, None, false)
            .into_iter()
            .map(|(_, m)| m)
            .collect();
        markets.extend(
            store
                .values::<DerivativeMarket>(&market_prefix(false), None, None, false)
                .into_iter()
                .map(|(_, m)| m),
        );
        markets
    }

    pub(super) fn active_markets(&self) -> Vec<DerivativeMarket> {
        self.ledger
            .store()
            .values(&market_prefix(true), None, None, false)
            .into_iter()
            .map(|(_, m)| m)
            .collect()
    }

    pub(super) fn set_market(&mut self, market: &DerivativeMarket) {
        let enabled = market.status.is_enabled();
        let store = self.ledger.store_mut();
        store.delete(&market_key(!enabled, &market.market_id));
        store.set_value(&market_key(enabled, &market.market_id), market);
    }

    pub(super) fn set_market_status(
        &mut self,
        market: &mut DerivativeMarket,
        status: MarketStatus,
    ) -> Result<(), ExchangeError> {
        if !market.status.can_transition_to(status) {
            return Err(MarketError::InvalidStatusTransition {
                from: market.status,
                to: status,
            }
            .into());
        }
        if market.status == status {
            return Ok(());
        }
        info!(market = %market.market_id, from = ?market.status, to = ?status, "market status changed");
        market.status = status;
        self.set_market(market);
        self.emit_event(EventPayload::MarketUpdated(MarketUpdatedEvent {
            market_id: market.market_id,
            status,
        }));
        Ok(())
    }

    /// Binary options are demolished outright; everything else waits paused.
    pub(super) fn demolish_or_pause_market(&mut self, market: &mut DerivativeMarket) {
        let status = if market.is_binary_option() {
            MarketStatus::Demolished
        } else {
            MarketStatus::Paused
        };
        if let Err(err) = self.set_market_status(market, status) {
            tracing::error!(market = %market.market_id, error = %err, "market could not be paused");
        }
    }

    /// Governance parameter update.
    pub fn update_market(&mut self, market_id: &MarketId, update: &MarketParamUpdate) -> Result<(), ExchangeError> {
        let mut market = self
            .get_market(market_id)
            .ok_or(ExchangeError::MarketNotFound(*market_id))?;
        if market.status == MarketStatus::Demolished {
            return Err(ExchangeError::InvalidMarketStatus(market.status));
        }
        market.apply_update(update, self.params.relayer_fee_share_rate)?;
        self.set_market(&market);
        info!(market = %market_id, status = ?market.status, "market params updated");
        self.emit_event(EventPayload::MarketUpdated(MarketUpdatedEvent {
            market_id: *market_id,
            status: market.status,
        }));
        Ok(())
    }

    pub fn mark_price(&self, market: &DerivativeMarket) -> Result<Decimal, ExchangeError> {
        Ok(fetch_mark_price(self.oracle.as_ref(), market, self.now())?)
    }

    pub(super) fn mark_price_opt(&self, market: &DerivativeMarket) -> Option<Decimal> {
        self.mark_price(market).ok()
    }

    pub fn perpetual_funding(&self, market_id: &MarketId) -> Option<PerpetualMarketFunding> {
        self.ledger
            .store()
            .get_value(&market_scoped(PERPETUAL_FUNDING, market_id))
    }

    pub(super) fn set_perpetual_funding(&mut self, market_id: &MarketId, funding: &PerpetualMarketFunding) {
        self.ledger
            .store_mut()
            .set_value(&market_scoped(PERPETUAL_FUNDING, market_id), funding);
    }

    /// Cumulative funding positions settle against; None outside perpetuals.
    pub(super) fn cumulative_funding(&self, market: &DerivativeMarket) -> Option<Decimal> {
        if !market.is_perpetual() {
            return None;
        }
        self.perpetual_funding(&market.market_id)
            .map(|f| f.cumulative_funding)
    }

    pub(super) fn expiry_index_keys(market_id: &MarketId, info: &ExpiryFuturesInfo) -> [Vec<u8>; 2] {
        [
            timestamp_index_key(
                EXPIRY_FUTURES_BY_TIMESTAMP,
                info.expiration_timestamp.plus_secs(-EXPIRY_TWAP_WINDOW_SECS),
                market_id,
            ),
            timestamp_index_key(EXPIRY_FUTURES_BY_TIMESTAMP, info.expiration_timestamp, market_id),
        ]
    }
}
