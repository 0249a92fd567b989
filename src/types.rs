// 1.0: all the primitives live here. nothing in the engine works without these types.
// 32-byte ids, sides, prices, block time. each is a newtype so the compiler catches type mixups.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

macro_rules! hash_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; 32] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let raw = hex::decode(s.trim_start_matches("0x")).ok()?;
                Self::from_slice(&raw)
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }
    };
}

hash_id!(
    /// sha256 over the market's immutable identity.
    MarketId
);
hash_id!(
    /// 20-byte owner address followed by a 12-byte big-endian nonce.
    SubaccountId
);
hash_id!(
    /// sha256 over (subaccount, nonce, market, price, quantity, trigger).
    OrderHash
);

impl MarketId {
    pub fn derive(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u32).to_be_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl SubaccountId {
    pub fn new(owner: Address, nonce: u32) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..20].copy_from_slice(&owner.0);
        bytes[28..].copy_from_slice(&nonce.to_be_bytes());
        Self(bytes)
    }

    pub fn owner(&self) -> Address {
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&self.0[..20]);
        Address(addr)
    }

    // nonce 0 is the owner's default subaccount, which may draw on bank balances
    pub fn is_default(&self) -> bool {
        self.0[20..].iter().all(|b| *b == 0)
    }
}

// Long = buy side. Short = sell side. orders and positions share the same enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn from_is_buy(is_buy: bool) -> Self {
        if is_buy {
            Side::Long
        } else {
            Side::Short
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Long)
    }

    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => dec!(1),
            Side::Short => dec!(-1),
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub(crate) fn key_byte(&self) -> u8 {
        match self {
            Side::Long => 1,
            Side::Short => 0,
        }
    }
}

// 1.1: price in quote currency per unit of base. must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    #[must_use]
    pub fn new(value: Decimal) -> Option<Self> {
        if value > Decimal::ZERO {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn new_unchecked(value: Decimal) -> Self {
        debug_assert!(value > Decimal::ZERO);
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// true if `self` ranks at or ahead of `other` in the `side` book
    /// (higher bids, lower asks).
    pub fn is_better_or_equal(&self, other: Price, side: Side) -> bool {
        match side {
            Side::Long => self.0 >= other.0,
            Side::Short => self.0 <= other.0,
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Binary options settle at a price in [0, 1] or refund all margins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementPrice {
    Price(Decimal),
    Refund,
}

impl SettlementPrice {
    pub fn price(&self) -> Option<Decimal> {
        match self {
            SettlementPrice::Price(p) => Some(*p),
            SettlementPrice::Refund => None,
        }
    }
}

impl fmt::Display for SettlementPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementPrice::Price(p) => write!(f, "{p}"),
            SettlementPrice::Refund => f.write_str("refund"),
        }
    }
}

// 1.2: block time in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.0, 0).single()
    }

    pub fn plus_secs(&self, secs: i64) -> Self {
        Self(self.0 + secs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%SZ")),
            None => write!(f, "{}s", self.0),
        }
    }
}

/// Height and time of the block being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    pub time: Timestamp,
}
