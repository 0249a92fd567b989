// derivs-core: derivatives exchange core. perpetuals, expiry futures and binary options
// on a replicated ledger. every node runs the same inputs through the same code and
// must land on the same state, so nothing here reads clocks, randomness or the network.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: ids, addresses, sides, prices, block time
//   2.x  store/: ordered kv ledger, cached layers, key schema
//   3.x  order.rs: orders, hashes, margin holds
//   4.x  position.rs: funding, bankruptcy/liquidation price, payouts, haircuts
//   5.x  funding.rs: perpetual premium accumulation and hourly rate
//   6.x  metadata.rs: per-side order counters
//   7.x  config.rs: exchange params, presets, json loading
//   8.x  engine/: admission, matching, liquidation, settlement, block schedule
//   9.0  oracle.rs: mark prices and cumulative prices
//   9.1  insurance.rs: per-market insurance funds
//   9.2  custody.rs: wallet balances, deposits
//   11.x events.rs: state transition events for indexers
//   12.x market.rs: market identity, risk params, lifecycle

pub mod config;
pub mod custody;
pub mod engine;
pub mod events;
pub mod funding;
pub mod insurance;
pub mod market;
pub mod metadata;
pub mod oracle;
pub mod order;
pub mod position;
pub mod store;
pub mod types;

// re exports for convenience
pub use config::*;
pub use custody::*;
pub use engine::*;
pub use events::*;
pub use funding::*;
pub use insurance::*;
pub use market::*;
pub use metadata::*;
pub use oracle::*;
pub use order::*;
pub use position::*;
pub use store::{CacheStore, KvStore, Ledger, MemStore, TypedStore};
pub use types::*;
