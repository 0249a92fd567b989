// 8.0: exchange engine. admits orders, matches them, keeps positions margined,
// liquidates and settles. deterministic: same inputs, same ledger, same events.
//
//   8.0  core.rs        Engine struct, event log, cached execution
//   8.2  results.rs     ExchangeError and operation results
//   8.3  markets.rs     launch, lookup, status, mark price
//   8.4  deposits.rs    deposits, market balances, insurance draws, fees
//   8.5  orderbook.rs   resting/transient books, market and conditional orders, cancels
//   8.6  positions.rs   positions, margin changes, reduce-only upkeep
//   8.7  execution.rs   taker vs book matching
//   8.8  admission.rs   order validation, placement, batches
//   8.9  conditional.rs trigger scan and promotion
//   8.10 liquidation.rs liquidation and emergency settlement
//   8.11 settlement.rs  socialized loss, scheduled/expiry/binary settlement
//   8.12 funding.rs     hourly funding
//   8.13 block.rs       begin_block / end_block

mod admission;
mod block;
mod conditional;
mod core;
mod deposits;
mod execution;
mod funding;
mod liquidation;
mod markets;
mod orderbook;
mod positions;
mod results;
mod settlement;

#[cfg(test)]
mod fixtures;

pub use core::Engine;
pub use deposits::AUCTION_SUBACCOUNT;
pub use orderbook::{Book, OrderRef};
pub use results::*;
pub use settlement::ScheduledSettlement;
