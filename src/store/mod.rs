// 2.0 store/: ordered key-value ledger. byte-lexicographic iteration, copy-on-write
// overlays for cached execution, and a second block-scoped instance for transient state.
//
// 2.1 KvStore trait + MemStore backend
// 2.2 CacheStore: stacked overlays, snapshot / commit / discard
// 2.3 Ledger: persistent + transient pair
// 2.4 TypedStore: serde_json values on top of raw bytes

pub mod keys;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Bound;

pub type Entry = (Vec<u8>, Vec<u8>);

/// Ordered byte store. Iteration returns full keys.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&mut self, key: &[u8], value: Vec<u8>);
    fn delete(&mut self, key: &[u8]);

    /// Entries under `prefix` whose remaining key lies in `[start, end)`.
    fn iterate(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Vec<Entry>;

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    fn iterate_prefix(&self, prefix: &[u8], reverse: bool) -> Vec<Entry> {
        self.iterate(prefix, None, None, reverse)
    }
}

/// Smallest key strictly greater than every key starting with `prefix`.
/// None when the prefix is all 0xff (no upper bound).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

fn range_bounds(
    prefix: &[u8],
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let lower = match start {
        Some(s) => Bound::Included([prefix, s].concat()),
        None => Bound::Included(prefix.to_vec()),
    };
    let upper = match end {
        Some(e) => Bound::Excluded([prefix, e].concat()),
        None => match prefix_end(prefix) {
            Some(pe) => Bound::Excluded(pe),
            None => Bound::Unbounded,
        },
    };
    (lower, upper)
}

// 2.1: BTreeMap backend
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.data.insert(key.to_vec(), value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.data.remove(key);
    }

    fn iterate(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Vec<Entry> {
        let range = self.data.range(range_bounds(prefix, start, end));
        if reverse {
            range.rev().map(|(k, v)| (k.clone(), v.clone())).collect()
        } else {
            range.map(|(k, v)| (k.clone(), v.clone())).collect()
        }
    }
}

// 2.2: overlay layers. a None value is a tombstone.
type Layer = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

#[derive(Debug, Clone, Default)]
pub struct CacheStore<S> {
    parent: S,
    layers: Vec<Layer>,
}

impl<S: KvStore> CacheStore<S> {
    pub fn new(parent: S) -> Self {
        Self {
            parent,
            layers: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Opens a new overlay. Writes land in it until commit or discard.
    pub fn snapshot(&mut self) {
        self.layers.push(Layer::new());
    }

    /// Folds the top overlay into the one below it (or the backing store).
    pub fn commit(&mut self) {
        let Some(top) = self.layers.pop() else {
            panic!("commit without an open snapshot");
        };
        match self.layers.last_mut() {
            Some(below) => below.extend(top),
            None => {
                for (key, value) in top {
                    match value {
                        Some(v) => self.parent.set(&key, v),
                        None => self.parent.delete(&key),
                    }
                }
            }
        }
    }

    pub fn discard(&mut self) {
        if self.layers.pop().is_none() {
            panic!("discard without an open snapshot");
        }
    }

    pub fn parent(&self) -> &S {
        &self.parent
    }
}

impl CacheStore<MemStore> {
    pub fn clear(&mut self) {
        assert!(self.layers.is_empty(), "clearing a store with open snapshots");
        self.parent.clear();
    }
}

impl<S: KvStore> KvStore for CacheStore<S> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        for layer in self.layers.iter().rev() {
            if let Some(value) = layer.get(key) {
                return value.clone();
            }
        }
        self.parent.get(key)
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        match self.layers.last_mut() {
            Some(layer) => {
                layer.insert(key.to_vec(), Some(value));
            }
            None => self.parent.set(key, value),
        }
    }

    fn delete(&mut self, key: &[u8]) {
        match self.layers.last_mut() {
            Some(layer) => {
                layer.insert(key.to_vec(), None);
            }
            None => self.parent.delete(key),
        }
    }

    fn iterate(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Vec<Entry> {
        if self.layers.is_empty() {
            return self.parent.iterate(prefix, start, end, reverse);
        }

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .parent
            .iterate(prefix, start, end, false)
            .into_iter()
            .collect();

        for layer in &self.layers {
            for (key, value) in layer.range(range_bounds(prefix, start, end)) {
                match value {
                    Some(v) => {
                        merged.insert(key.clone(), v.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }

        if reverse {
            merged.into_iter().rev().collect()
        } else {
            merged.into_iter().collect()
        }
    }
}

// 2.3: the ledger handed to every component. one persistent store, one cleared per block.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    persistent: CacheStore<MemStore>,
    transient: CacheStore<MemStore>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &CacheStore<MemStore> {
        &self.persistent
    }

    pub fn store_mut(&mut self) -> &mut CacheStore<MemStore> {
        &mut self.persistent
    }

    pub fn transient(&self) -> &CacheStore<MemStore> {
        &self.transient
    }

    pub fn transient_mut(&mut self) -> &mut CacheStore<MemStore> {
        &mut self.transient
    }

    pub fn snapshot(&mut self) {
        self.persistent.snapshot();
        self.transient.snapshot();
    }

    pub fn commit(&mut self) {
        self.persistent.commit();
        self.transient.commit();
    }

    pub fn discard(&mut self) {
        self.persistent.discard();
        self.transient.discard();
    }

    pub fn in_snapshot(&self) -> bool {
        self.persistent.depth() > 0
    }

    pub fn clear_transient(&mut self) {
        self.transient.clear();
    }
}

// 2.4: json codec. a value that fails to decode means the ledger is corrupt.
pub trait TypedStore: KvStore {
    fn get_value<T: DeserializeOwned>(&self, key: &[u8]) -> Option<T> {
        self.get(key).map(|bz| decode(key, &bz))
    }

    fn set_value<T: Serialize>(&mut self, key: &[u8], value: &T) {
        self.set(key, encode(value));
    }

    fn values<T: DeserializeOwned>(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Vec<(Vec<u8>, T)> {
        self.iterate(prefix, start, end, reverse)
            .into_iter()
            .map(|(k, v)| {
                let value = decode(&k, &v);
                (k, value)
            })
            .collect()
    }
}

impl<S: KvStore + ?Sized> TypedStore for S {}

pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|e| panic!("ledger value failed to encode: {e}"))
}

pub fn decode<T: DeserializeOwned>(key: &[u8], bz: &[u8]) -> T {
    serde_json::from_slice(bz)
        .unwrap_or_else(|e| panic!("corrupt ledger value under {}: {e}", hex::encode(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(entries: &[Entry]) -> Vec<Vec<u8>> {
        entries.iter().map(|(k, _)| k.clone()).collect()
    }

    #[test]
    fn prefix_iteration_respects_bounds() {
        let mut store = MemStore::new();
        store.set(&[1, 1], vec![1]);
        store.set(&[1, 2], vec![2]);
        store.set(&[1, 3], vec![3]);
        store.set(&[2, 0], vec![4]);

        let all = store.iterate_prefix(&[1], false);
        assert_eq!(keys(&all), vec![vec![1, 1], vec![1, 2], vec![1, 3]]);

        let rev = store.iterate(&[1], Some(&[2]), None, true);
        assert_eq!(keys(&rev), vec![vec![1, 3], vec![1, 2]]);

        let bounded = store.iterate(&[1], None, Some(&[3]), false);
        assert_eq!(keys(&bounded), vec![vec![1, 1], vec![1, 2]]);
    }

    #[test]
    fn prefix_end_handles_overflow() {
        assert_eq!(prefix_end(&[1, 2]), Some(vec![1, 3]));
        assert_eq!(prefix_end(&[1, 0xff]), Some(vec![2]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }

    #[test]
    fn discarded_snapshot_leaves_no_trace() {
        let mut store = CacheStore::new(MemStore::new());
        store.set(b"a", vec![1]);

        store.snapshot();
        store.set(b"a", vec![2]);
        store.set(b"b", vec![3]);
        assert_eq!(store.get(b"a"), Some(vec![2]));
        store.discard();

        assert_eq!(store.get(b"a"), Some(vec![1]));
        assert_eq!(store.get(b"b"), None);
    }

    #[test]
    fn nested_commit_folds_into_parent() {
        let mut store = CacheStore::new(MemStore::new());
        store.set(b"a", vec![1]);
        store.set(b"c", vec![9]);

        store.snapshot();
        store.delete(b"c");
        store.snapshot();
        store.set(b"b", vec![2]);
        store.commit();
        assert_eq!(store.depth(), 1);
        // backing store untouched until the outer commit
        assert_eq!(store.parent().get(b"c"), Some(vec![9]));
        store.commit();

        assert_eq!(store.parent().get(b"b"), Some(vec![2]));
        assert_eq!(store.parent().get(b"c"), None);
    }

    #[test]
    fn overlay_iteration_merges_tombstones() {
        let mut store = CacheStore::new(MemStore::new());
        store.set(&[5, 1], vec![1]);
        store.set(&[5, 2], vec![2]);

        store.snapshot();
        store.delete(&[5, 1]);
        store.set(&[5, 3], vec![3]);

        let entries = store.iterate_prefix(&[5], true);
        assert_eq!(keys(&entries), vec![vec![5, 3], vec![5, 2]]);
    }

    #[test]
    fn typed_values_round_trip() {
        let mut store = MemStore::new();
        store.set_value(b"k", &vec![1u32, 2, 3]);
        let back: Option<Vec<u32>> = store.get_value(b"k");
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[test]
    fn ledger_clears_only_transient() {
        let mut ledger = Ledger::new();
        ledger.store_mut().set(b"p", vec![1]);
        ledger.transient_mut().set(b"t", vec![1]);
        ledger.clear_transient();

        assert!(ledger.store().has(b"p"));
        assert!(!ledger.transient().has(b"t"));
    }
}
