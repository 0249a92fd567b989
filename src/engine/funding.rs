// 8.12 engine/funding.rs: hourly funding for perpetual markets.
// positions are not touched here; they pick up the new cumulative funding on their next read.

use super::core::Engine;
use crate::events::{EventPayload, FundingUpdateEvent};
use crate::market::MarketKind;
use tracing::{info, warn};

impl Engine {
    /// Applies one funding interval to every perpetual whose funding time has come.
    pub fn process_hourly_fundings(&mut self) -> usize {
        let now = self.now();
        let mut applied = 0;

        for mut market in self.active_markets() {
            let Some(info) = market.perpetual_info().cloned() else {
                continue;
            };
            if now < info.next_funding_timestamp {
                continue;
            }
            let Some(mut funding) = self.perpetual_funding(&market.market_id) else {
                continue;
            };
            let next = info.next_funding_timestamp.plus_secs(info.funding_interval_secs);
            if let MarketKind::Perpetual(info) = &mut market.kind {
                info.next_funding_timestamp = next;
            }
            self.set_market(&market);

            let mark = match self.mark_price(&market) {
                Ok(mark) => mark,
                Err(err) => {
                    warn!(market = %market.market_id, error = %err, "funding skipped, no mark price");
                    continue;
                }
            };
            let update = funding.apply_hourly_funding(
                info.hourly_interest_rate,
                info.hourly_funding_rate_cap,
                info.funding_interval_secs,
                info.next_funding_timestamp,
                mark,
            );
            self.set_perpetual_funding(&market.market_id, &funding);

            info!(
                market = %market.market_id,
                rate = %update.funding_rate,
                cumulative = %update.cumulative_funding,
                "hourly funding applied"
            );
            self.emit_event(EventPayload::FundingUpdate(FundingUpdateEvent {
                market_id: market.market_id,
                cumulative_funding: funding.cumulative_funding,
                cumulative_price: funding.cumulative_price,
                is_hourly_funding: true,
                funding_rate: Some(update.funding_rate),
                mark_price: Some(mark),
            }));
            applied += 1;
        }
        applied
    }
}
