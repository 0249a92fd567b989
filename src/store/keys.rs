// 2.5 store/keys.rs: ledger key schema. every key is prefix byte + fixed-width parts,
// so lexicographic byte order is also price / time order.

use crate::types::{Address, MarketId, OrderHash, Side, SubaccountId, Timestamp};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

pub const PRICE_DECIMALS: u32 = 18;

// persistent
pub const MARKETS: u8 = 0x11;
pub const EXPIRY_FUTURES_BY_TIMESTAMP: u8 = 0x13;
pub const BINARY_OPTIONS_EXPIRY: u8 = 0x14;
pub const BINARY_OPTIONS_SETTLEMENT: u8 = 0x15;
pub const SCHEDULED_SETTLEMENT: u8 = 0x16;
pub const PERPETUAL_FUNDING: u8 = 0x17;
pub const MARKET_BALANCE: u8 = 0x19;

pub const LIMIT_ORDERS: u8 = 0x21;
pub const LIMIT_ORDER_INDEX: u8 = 0x22;
pub const CONDITIONAL_ORDERS: u8 = 0x23;
pub const CONDITIONAL_ORDER_INDEX: u8 = 0x24;

pub const POSITIONS: u8 = 0x31;
pub const ORDERBOOK_METADATA: u8 = 0x32;
pub const SUBACCOUNT_NONCE: u8 = 0x33;
pub const CLIENT_ORDER_ID: u8 = 0x34;

pub const DEPOSITS: u8 = 0x41;
pub const BANK_BALANCES: u8 = 0x42;
pub const MODULE_BALANCES: u8 = 0x43;
pub const INSURANCE_FUNDS: u8 = 0x51;

// transient. limit orders reuse LIMIT_ORDERS / LIMIT_ORDER_INDEX in the transient store.
pub const MARKET_ORDERS: u8 = 0x61;
pub const MARKET_ORDER_INDICATOR: u8 = 0x62;
pub const NO_MARGIN_LOCKED: u8 = 0x63;

/// Fixed-width decimal string: 20 integer digits, '.', 18 fractional digits.
pub fn padded_price(price: Decimal) -> String {
    let scaled = price.abs().round_dp(PRICE_DECIMALS);
    let integer = scaled.trunc().to_u128().unwrap_or(0);
    let fraction = (scaled.fract() * Decimal::from(10u64.pow(PRICE_DECIMALS)))
        .trunc()
        .to_u128()
        .unwrap_or(0);
    format!("{integer:020}.{fraction:018}")
}

fn timestamp_bytes(ts: Timestamp) -> [u8; 8] {
    (ts.as_secs().max(0) as u64).to_be_bytes()
}

pub fn market_key(enabled: bool, market_id: &MarketId) -> Vec<u8> {
    [&[MARKETS, enabled as u8][..], market_id.as_bytes()].concat()
}

pub fn market_prefix(enabled: bool) -> Vec<u8> {
    vec![MARKETS, enabled as u8]
}

pub fn market_scoped(prefix: u8, market_id: &MarketId) -> Vec<u8> {
    [&[prefix][..], market_id.as_bytes()].concat()
}

pub fn timestamp_index_prefix(prefix: u8) -> Vec<u8> {
    vec![prefix]
}

pub fn timestamp_index_key(prefix: u8, ts: Timestamp, market_id: &MarketId) -> Vec<u8> {
    [&[prefix][..], &timestamp_bytes(ts)[..], market_id.as_bytes()].concat()
}

/// Upper bound (exclusive) on the timestamp index for everything at or before `ts`.
pub fn timestamp_index_end(ts: Timestamp) -> Vec<u8> {
    ((ts.as_secs().max(0) as u64) + 1).to_be_bytes().to_vec()
}

pub fn limit_order_side_prefix(market_id: &MarketId, side: Side) -> Vec<u8> {
    [&[LIMIT_ORDERS][..], market_id.as_bytes(), &[side.key_byte()][..]].concat()
}

pub fn limit_order_key(
    market_id: &MarketId,
    side: Side,
    price: Decimal,
    hash: &OrderHash,
) -> Vec<u8> {
    [
        limit_order_side_prefix(market_id, side).as_slice(),
        padded_price(price).as_bytes(),
        hash.as_bytes(),
    ]
    .concat()
}

pub fn limit_order_index_prefix(
    market_id: &MarketId,
    side: Side,
    subaccount_id: &SubaccountId,
) -> Vec<u8> {
    [
        &[LIMIT_ORDER_INDEX][..],
        market_id.as_bytes(),
        &[side.key_byte()][..],
        subaccount_id.as_bytes(),
    ]
    .concat()
}

pub fn limit_order_index_key(
    market_id: &MarketId,
    side: Side,
    subaccount_id: &SubaccountId,
    hash: &OrderHash,
) -> Vec<u8> {
    [
        limit_order_index_prefix(market_id, side, subaccount_id).as_slice(),
        hash.as_bytes(),
    ]
    .concat()
}

pub fn market_order_side_prefix(market_id: &MarketId, side: Side) -> Vec<u8> {
    [&[MARKET_ORDERS][..], market_id.as_bytes(), &[side.key_byte()][..]].concat()
}

pub fn market_order_key(
    market_id: &MarketId,
    side: Side,
    price: Decimal,
    hash: &OrderHash,
) -> Vec<u8> {
    [
        market_order_side_prefix(market_id, side).as_slice(),
        padded_price(price).as_bytes(),
        hash.as_bytes(),
    ]
    .concat()
}

pub fn market_order_indicator_key(market_id: &MarketId, subaccount_id: &SubaccountId) -> Vec<u8> {
    [
        &[MARKET_ORDER_INDICATOR][..],
        market_id.as_bytes(),
        subaccount_id.as_bytes(),
    ]
    .concat()
}

pub fn conditional_bucket_prefix(market_id: &MarketId, is_higher: bool, is_market: bool) -> Vec<u8> {
    [
        &[CONDITIONAL_ORDERS][..],
        market_id.as_bytes(),
        &[is_higher as u8, is_market as u8][..],
    ]
    .concat()
}

pub fn conditional_order_key(
    market_id: &MarketId,
    is_higher: bool,
    is_market: bool,
    trigger_price: Decimal,
    hash: &OrderHash,
) -> Vec<u8> {
    [
        conditional_bucket_prefix(market_id, is_higher, is_market).as_slice(),
        padded_price(trigger_price).as_bytes(),
        hash.as_bytes(),
    ]
    .concat()
}

pub fn conditional_index_prefix(market_id: &MarketId, subaccount_id: &SubaccountId) -> Vec<u8> {
    [
        &[CONDITIONAL_ORDER_INDEX][..],
        market_id.as_bytes(),
        subaccount_id.as_bytes(),
    ]
    .concat()
}

pub fn conditional_index_key(
    market_id: &MarketId,
    subaccount_id: &SubaccountId,
    hash: &OrderHash,
) -> Vec<u8> {
    [
        conditional_index_prefix(market_id, subaccount_id).as_slice(),
        hash.as_bytes(),
    ]
    .concat()
}

pub fn position_key(market_id: &MarketId, subaccount_id: &SubaccountId) -> Vec<u8> {
    [&[POSITIONS][..], market_id.as_bytes(), subaccount_id.as_bytes()].concat()
}

pub fn positions_prefix(market_id: &MarketId) -> Vec<u8> {
    market_scoped(POSITIONS, market_id)
}

/// Subaccount from a key built by `position_key`.
pub fn subaccount_from_position_key(key: &[u8]) -> Option<SubaccountId> {
    key.get(33..65).and_then(SubaccountId::from_slice)
}

pub fn metadata_key(market_id: &MarketId, subaccount_id: &SubaccountId, side: Side) -> Vec<u8> {
    [
        &[ORDERBOOK_METADATA][..],
        market_id.as_bytes(),
        subaccount_id.as_bytes(),
        &[side.key_byte()][..],
    ]
    .concat()
}

pub fn no_margin_locked_key(market_id: &MarketId, subaccount_id: &SubaccountId, side: Side) -> Vec<u8> {
    [
        &[NO_MARGIN_LOCKED][..],
        market_id.as_bytes(),
        subaccount_id.as_bytes(),
        &[side.key_byte()][..],
    ]
    .concat()
}

pub fn no_margin_locked_parts(key: &[u8]) -> Option<(MarketId, SubaccountId)> {
    let market_id = key.get(1..33).and_then(MarketId::from_slice)?;
    let subaccount_id = key.get(33..65).and_then(SubaccountId::from_slice)?;
    Some((market_id, subaccount_id))
}

pub fn nonce_key(subaccount_id: &SubaccountId) -> Vec<u8> {
    [&[SUBACCOUNT_NONCE][..], subaccount_id.as_bytes()].concat()
}

pub fn cid_key(subaccount_id: &SubaccountId, cid: &str) -> Vec<u8> {
    [&[CLIENT_ORDER_ID][..], subaccount_id.as_bytes(), cid.as_bytes()].concat()
}

pub fn deposit_key(subaccount_id: &SubaccountId, denom: &str) -> Vec<u8> {
    [&[DEPOSITS][..], subaccount_id.as_bytes(), denom.as_bytes()].concat()
}

pub fn deposit_prefix(subaccount_id: &SubaccountId) -> Vec<u8> {
    [&[DEPOSITS][..], subaccount_id.as_bytes()].concat()
}

pub fn bank_key(address: &Address, denom: &str) -> Vec<u8> {
    [&[BANK_BALANCES][..], &address.0[..], denom.as_bytes()].concat()
}

pub fn module_key(module: &str, denom: &str) -> Vec<u8> {
    // module names never contain '/', denoms may
    [&[MODULE_BALANCES][..], module.as_bytes(), b"/", denom.as_bytes()].concat()
}
