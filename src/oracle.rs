// 9.0 oracle.rs: where mark prices come from. the engine only sees the Oracle trait;
// StaticOracle is the in-memory table the sim binary and tests drive by hand.
//
// each record keeps a running time-weighted cumulative price so expiry
// futures can take a TWAP over their settlement window.

use crate::market::{OracleRef, OracleType};
use crate::types::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Price source. Shared read-only with the parallel trigger scan, hence Sync.
pub trait Oracle: Send + Sync {
    fn price(&self, oracle: &OracleRef, now: Timestamp) -> Result<Decimal, OracleError>;

    /// Σ price × seconds since the record was created, evaluated at `now`.
    fn cumulative_price(&self, oracle: &OracleRef, now: Timestamp) -> Result<Decimal, OracleError>;

    fn provider_price(&self, provider: &str, symbol: &str, now: Timestamp) -> Result<Decimal, OracleError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    #[error("no price for {base}/{quote}")]
    InvalidOracle { base: String, quote: String },

    #[error("price for {base}/{quote} is stale: last update {updated_at}, now {now}")]
    StaleOraclePrice {
        base: String,
        quote: String,
        updated_at: Timestamp,
        now: Timestamp,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRecord {
    pub price: Decimal,
    pub updated_at: Timestamp,
    pub cumulative: Decimal,
}

impl PriceRecord {
    fn cumulative_at(&self, now: Timestamp) -> Decimal {
        let elapsed = (now.as_secs() - self.updated_at.as_secs()).max(0);
        self.cumulative + self.price * Decimal::from(elapsed)
    }
}

type RecordKey = (OracleType, String, String);

#[derive(Debug, Default)]
struct PriceTable {
    records: HashMap<RecordKey, PriceRecord>,
}

/// Cloneable handle; every clone sees the same prices.
#[derive(Debug, Clone)]
pub struct StaticOracle {
    table: Arc<RwLock<PriceTable>>,
    // None disables staleness checks
    max_age_secs: Option<i64>,
}

impl Default for StaticOracle {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StaticOracle {
    pub fn new(max_age_secs: Option<i64>) -> Self {
        Self {
            table: Arc::new(RwLock::new(PriceTable::default())),
            max_age_secs,
        }
    }

    pub fn set_price(&self, oracle: &OracleRef, price: Decimal, at: Timestamp) {
        self.set(key_of(oracle), price, at);
    }

    pub fn set_provider_price(&self, provider: &str, symbol: &str, price: Decimal, at: Timestamp) {
        self.set(
            (OracleType::Provider, symbol.to_string(), provider.to_string()),
            price,
            at,
        );
    }

    pub fn remove(&self, oracle: &OracleRef) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.records.remove(&key_of(oracle));
    }

    fn set(&self, key: RecordKey, price: Decimal, at: Timestamp) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let cumulative = table
            .records
            .get(&key)
            .map(|r| r.cumulative_at(at))
            .unwrap_or(Decimal::ZERO);
        table.records.insert(
            key,
            PriceRecord {
                price,
                updated_at: at,
                cumulative,
            },
        );
    }

    fn record(&self, key: &RecordKey, now: Timestamp) -> Result<PriceRecord, OracleError> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let record = table.records.get(key).cloned().ok_or_else(|| OracleError::InvalidOracle {
            base: key.1.clone(),
            quote: key.2.clone(),
        })?;

        if let Some(max_age) = self.max_age_secs {
            if now.as_secs() - record.updated_at.as_secs() > max_age {
                return Err(OracleError::StaleOraclePrice {
                    base: key.1.clone(),
                    quote: key.2.clone(),
                    updated_at: record.updated_at,
                    now,
                });
            }
        }
        Ok(record)
    }
}

fn key_of(oracle: &OracleRef) -> RecordKey {
    (oracle.oracle_type, oracle.base.clone(), oracle.quote.clone())
}

impl Oracle for StaticOracle {
    fn price(&self, oracle: &OracleRef, now: Timestamp) -> Result<Decimal, OracleError> {
        let record = self.record(&key_of(oracle), now)?;
        if record.price <= Decimal::ZERO {
            return Err(OracleError::InvalidOracle {
                base: oracle.base.clone(),
                quote: oracle.quote.clone(),
            });
        }
        Ok(record.price)
    }

    fn cumulative_price(&self, oracle: &OracleRef, now: Timestamp) -> Result<Decimal, OracleError> {
        Ok(self.record(&key_of(oracle), now)?.cumulative_at(now))
    }

    fn provider_price(&self, provider: &str, symbol: &str, now: Timestamp) -> Result<Decimal, OracleError> {
        let key = (OracleType::Provider, symbol.to_string(), provider.to_string());
        Ok(self.record(&key, now)?.price)
    }
}
