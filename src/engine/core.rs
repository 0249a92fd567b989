// 8.0 engine/core.rs: the exchange engine. all state lives in the ledger; the engine
// owns the ledger plus its collaborators (oracle, insurance, bank) and the event log.

use super::results::ExchangeError;
use crate::config::ExchangeParams;
use crate::custody::{Bank, LedgerBank};
use crate::events::{Event, EventId, EventPayload};
use crate::insurance::{InsuranceFund, LedgerInsuranceFund};
use crate::oracle::Oracle;
use crate::store::Ledger;
use crate::types::{BlockInfo, Timestamp};
use tracing::{debug, info};

/** 8.1: main engine struct */
pub struct Engine {
    pub(super) params: ExchangeParams,
    pub(super) ledger: Ledger,
    pub(super) oracle: Box<dyn Oracle>,
    pub(super) insurance: Box<dyn InsuranceFund>,
    pub(super) bank: Box<dyn Bank>,
    pub(super) events: Vec<Event>,
    pub(super) next_event_id: u64,
    pub(super) block: BlockInfo,
    // (event log length, next event id) at each open cached execution
    pub(super) event_marks: Vec<(usize, u64)>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("params", &self.params)
            .field("block", &self.block)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        params: ExchangeParams,
        oracle: Box<dyn Oracle>,
        insurance: Box<dyn InsuranceFund>,
        bank: Box<dyn Bank>,
    ) -> Result<Self, ExchangeError> {
        params.validate()?;
        Ok(Self {
            params,
            ledger: Ledger::new(),
            oracle,
            insurance,
            bank,
            events: Vec::new(),
            next_event_id: 1,
            block: BlockInfo {
                height: 1,
                time: Timestamp::from_secs(0),
            },
            event_marks: Vec::new(),
        })
    }

    /// Engine over the ledger-backed bank and insurance funds.
    pub fn with_oracle(params: ExchangeParams, oracle: impl Oracle + 'static) -> Result<Self, ExchangeError> {
        Self::new(
            params,
            Box::new(oracle),
            Box::new(LedgerInsuranceFund),
            Box::new(LedgerBank),
        )
    }

    pub fn params(&self) -> &ExchangeParams {
        &self.params
    }

    /// Governance update; nothing changes unless the new params validate.
    pub fn update_params(&mut self, params: ExchangeParams) -> Result<(), ExchangeError> {
        params.validate()?;
        info!(
            side_count = params.max_derivative_order_side_count,
            post_only_until = params.post_only_mode_height_threshold,
            "exchange params updated"
        );
        self.params = params;
        Ok(())
    }

    pub fn block(&self) -> BlockInfo {
        self.block
    }

    pub fn now(&self) -> Timestamp {
        self.block.time
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Direct ledger access for genesis funding (wallets, insurance funds).
    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn recent_events(&self, count: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(count);
        &self.events[start..]
    }

    pub fn is_post_only_mode(&self) -> bool {
        self.params.is_post_only_mode(self.block.height)
    }

    pub(super) fn emit_event(&mut self, payload: EventPayload) {
        let event = Event::new(EventId(self.next_event_id), self.block.height, payload);
        self.next_event_id += 1;
        self.events.push(event);

        // trimming inside a cached execution would shift the rollback marks
        if self.event_marks.is_empty() && self.events.len() > self.params.max_events {
            let drain_count = self.events.len() - self.params.max_events;
            self.events.drain(0..drain_count);
        }
    }

    // 8.2: cached execution. state writes and events either land together or not at all.
    pub(super) fn begin_cached(&mut self) {
        self.ledger.snapshot();
        self.event_marks.push((self.events.len(), self.next_event_id));
    }

    pub(super) fn commit_cached(&mut self) {
        self.ledger.commit();
        self.event_marks.pop();
    }

    pub(super) fn discard_cached(&mut self) {
        self.ledger.discard();
        if let Some((len, next_id)) = self.event_marks.pop() {
            self.events.truncate(len);
            self.next_event_id = next_id;
        }
    }

    pub(super) fn cached<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ExchangeError>,
    ) -> Result<T, ExchangeError> {
        self.begin_cached();
        match f(self) {
            Ok(value) => {
                self.commit_cached();
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "cached execution discarded");
                self.discard_cached();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MarketUpdatedEvent;
    use crate::market::MarketStatus;
    use crate::oracle::StaticOracle;
    use crate::store::{KvStore, TypedStore};
    use crate::types::MarketId;

    fn engine(max_events: usize) -> Engine {
        let params = ExchangeParams {
            max_events,
            ..ExchangeParams::default()
        };
        Engine::with_oracle(params, StaticOracle::default()).unwrap()
    }

    fn updated() -> EventPayload {
        EventPayload::MarketUpdated(MarketUpdatedEvent {
            market_id: MarketId::ZERO,
            status: MarketStatus::Active,
        })
    }

    #[test]
    fn event_log_is_bounded() {
        let mut engine = engine(3);
        for _ in 0..5 {
            engine.emit_event(updated());
        }
        assert_eq!(engine.events().len(), 3);
        assert_eq!(engine.events()[0].id, EventId(3));
    }

    #[test]
    fn discarded_execution_drops_writes_and_events() {
        let mut engine = engine(100);
        let result: Result<(), ExchangeError> = engine.cached(|e| {
            e.ledger.store_mut().set_value(b"k", &1u32);
            e.emit_event(updated());
            Err(ExchangeError::NoLiquidity)
        });
        assert!(result.is_err());
        assert!(engine.events().is_empty());
        assert!(!engine.ledger().store().has(b"k"));

        engine.emit_event(updated());
        assert_eq!(engine.events()[0].id, EventId(1));
    }

    #[test]
    fn committed_execution_keeps_everything() {
        let mut engine = engine(100);
        engine
            .cached(|e| {
                e.ledger.store_mut().set_value(b"k", &1u32);
                e.emit_event(updated());
                Ok(())
            })
            .unwrap();
        assert_eq!(engine.events().len(), 1);
        assert!(engine.ledger().store().has(b"k"));
    }

    #[test]
    fn rejects_invalid_params() {
        let mut engine = engine(10);
        let bad = ExchangeParams {
            trigger_scan_workers: 0,
            ..ExchangeParams::default()
        };
        assert!(matches!(engine.update_params(bad), Err(ExchangeError::Config(_))));
    }
}
