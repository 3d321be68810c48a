//! Generic incremental hashtable (`hmap`).
//!
//! Rendered as an idiomatic generic `HMap<K, V>` rather than an unsafe
//! byte-layout bucket structure, favoring safe, typed Rust — but the
//! *algorithm* (8-slot buckets, a one-byte tophash per slot for fast
//! mismatch rejection, incremental grow/evacuation spread across subsequent
//! operations instead of a single stop-the-world rehash) stays the same.

pub mod iter;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::hash::{BuildHasher, Hash, Hasher};

use crate::config::MAP_EVACUATION_SAFETY_CAP;

/// Slots per bucket.
pub const BUCKET_SIZE: usize = 8;

/// Tophash values below this are reserved to flag evacuation state; this
/// rendering uses a `Vec` per bucket instead (an occupied slot is simply
/// present), so the only thing that survives here is the reservation
/// itself.
const MIN_TOP_HASH: u8 = 4;

fn tophash(hash: u64) -> u8 {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "only the top byte of the hash is used for the filter"
    )]
    let top = (hash >> 56) as u8;
    if top < MIN_TOP_HASH { top + MIN_TOP_HASH } else { top }
}

struct Slot<K, V> {
    tophash: u8,
    hash: u64,
    key: K,
    value: V,
}

/// One bucket: up to [`BUCKET_SIZE`] slots, chained to an overflow bucket
/// when full.
struct Bucket<K, V> {
    slots: Vec<Slot<K, V>>,
    overflow: Option<Box<Bucket<K, V>>>,
}

impl<K, V> Bucket<K, V> {
    fn new() -> Self {
        Self {
            slots: Vec::with_capacity(BUCKET_SIZE),
            overflow: None,
        }
    }
}

/// Fowler-Noll-Howay-ish default hasher seed state, reseeded per-map to
/// avoid hash-flooding attacks being reproducible across processes.
#[derive(Clone, Copy)]
pub struct MapSeed(u64);

/// Simple 64-bit FNV-1a hasher parameterized by a per-map seed.
pub struct SeededHasher {
    state: u64,
}

impl Hasher for SeededHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state ^= u64::from(b);
            self.state = self.state.wrapping_mul(0x100_0000_01b3);
        }
    }
}

impl BuildHasher for MapSeed {
    type Hasher = SeededHasher;

    fn build_hasher(&self) -> SeededHasher {
        SeededHasher {
            state: self.0 ^ 0xcbf2_9ce4_8422_2325,
        }
    }
}

/// Incremental-grow hashtable keyed by `K`, valued by `V`.
pub struct HMap<K, V> {
    buckets: Vec<Bucket<K, V>>,
    old_buckets: Vec<Bucket<K, V>>,
    /// Index of the next old bucket due for incremental evacuation.
    nevacuate: usize,
    /// `true` while growing to double size, `false` during a same-size
    /// regrow (overflow-chain compaction without changing bucket count).
    growing_to_double: bool,
    count: usize,
    /// Number of overflow buckets currently allocated, tracked so
    /// [`HMap::should_regrow_same_size`] can trigger a same-size regrow when
    /// chains get long relative to the bucket count, without a full walk of
    /// every bucket on each insert.
    overflow_count: usize,
    seed: MapSeed,
}

impl<K: Hash + Eq, V> HMap<K, V> {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            buckets: (0..1).map(|_| Bucket::new()).collect(),
            old_buckets: Vec::new(),
            nevacuate: 0,
            growing_to_double: false,
            count: 0,
            overflow_count: 0,
            seed: MapSeed(seed),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn hash_of(&self, key: &K) -> u64 {
        let mut hasher = self.seed.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn bucket_index(hash: u64, nbuckets: usize) -> usize {
        debug_assert!(nbuckets.is_power_of_two());
        (hash as usize) & (nbuckets - 1)
    }

    fn growing(&self) -> bool {
        !self.old_buckets.is_empty()
    }

    /// Drive up to two incremental evacuation steps: every mutating
    /// operation makes bounded progress on an in-progress grow so no single
    /// call pays for the whole rehash.
    fn evacuate_some(&mut self) {
        // Two buckets per call bounds the amortized cost of a grow, capped
        // defensively so a pathological configuration can't spin here
        // forever.
        let mut steps = 0;
        while self.growing() && steps < 2 && steps < MAP_EVACUATION_SAFETY_CAP {
            self.evacuate_one(self.nevacuate);
            self.nevacuate += 1;
            if self.nevacuate >= self.old_buckets.len() {
                self.old_buckets.clear();
                self.nevacuate = 0;
                tracing::debug!(buckets = self.buckets.len(), "hmap: grow complete");
            }
            steps += 1;
        }
    }

    fn evacuate_one(&mut self, old_idx: usize) {
        if old_idx >= self.old_buckets.len() {
            return;
        }
        let mut old_bucket = core::mem::replace(&mut self.old_buckets[old_idx], Bucket::new());

        let new_count = self.buckets.len();
        loop {
            for slot in old_bucket.slots.drain(..) {
                let dest = if self.growing_to_double {
                    Self::bucket_index(slot.hash, new_count)
                } else {
                    old_idx % new_count
                };
                Self::insert_into(&mut self.buckets, &mut self.overflow_count, dest, slot);
            }
            match old_bucket.overflow.take() {
                Some(next) => old_bucket = *next,
                None => break,
            }
        }
    }

    fn insert_into(
        buckets: &mut [Bucket<K, V>],
        overflow_count: &mut usize,
        idx: usize,
        slot: Slot<K, V>,
    ) {
        let mut bucket = &mut buckets[idx];
        loop {
            if bucket.slots.len() < BUCKET_SIZE {
                bucket.slots.push(slot);
                return;
            }
            if bucket.overflow.is_none() {
                bucket.overflow = Some(Box::new(Bucket::new()));
                *overflow_count += 1;
            }
            bucket = bucket.overflow.as_mut().unwrap();
        }
    }

    fn should_grow(&self) -> bool {
        // Max load factor of 6.5/8 == 0.8125.
        self.count * 16 > self.buckets.len() * BUCKET_SIZE * 13
    }

    /// Too many overflow buckets relative to the primary bucket count means
    /// chains have gotten long even though the load factor looks fine
    /// (typically from a pattern of inserts and deletes); a same-size
    /// regrow compacts them back down.
    fn should_regrow_same_size(&self) -> bool {
        self.overflow_count >= self.buckets.len()
    }

    fn start_grow(&mut self, double: bool) {
        debug_assert!(self.old_buckets.is_empty());
        let new_len = if double {
            (self.buckets.len() * 2).max(1)
        } else {
            self.buckets.len().max(1)
        };
        tracing::debug!(
            old_buckets = self.buckets.len(),
            new_buckets = new_len,
            double,
            "hmap: grow started"
        );
        let new_buckets = (0..new_len).map(|_| Bucket::new()).collect();
        self.old_buckets = core::mem::replace(&mut self.buckets, new_buckets);
        self.nevacuate = 0;
        self.growing_to_double = double;
        self.overflow_count = 0;
    }

    fn find_in_bucket<'a>(
        bucket: &'a Bucket<K, V>,
        hash: u64,
        top: u8,
        key: &K,
    ) -> Option<&'a Slot<K, V>> {
        let mut cur = Some(bucket);
        while let Some(b) = cur {
            for slot in &b.slots {
                if slot.tophash == top && slot.hash == hash && &slot.key == key {
                    return Some(slot);
                }
            }
            cur = b.overflow.as_deref();
        }
        None
    }

    fn find_in_bucket_mut<'a>(
        bucket: &'a mut Bucket<K, V>,
        hash: u64,
        top: u8,
        key: &K,
    ) -> Option<&'a mut Slot<K, V>> {
        let mut cur = Some(bucket);
        while let Some(b) = cur {
            if let Some(i) = b
                .slots
                .iter()
                .position(|s| s.tophash == top && s.hash == hash && &s.key == key)
            {
                return Some(&mut b.slots[i]);
            }
            cur = b.overflow.as_deref_mut();
        }
        None
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        let hash = self.hash_of(key);
        let top = tophash(hash);
        if self.growing() {
            let old_idx = Self::bucket_index(hash, self.old_buckets.len());
            if let Some(slot) = Self::find_in_bucket(&self.old_buckets[old_idx], hash, top, key) {
                return Some(&slot.value);
            }
        }
        let idx = Self::bucket_index(hash, self.buckets.len());
        Self::find_in_bucket(&self.buckets[idx], hash, top, key).map(|s| &s.value)
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert `key -> value`, returning the previous value if any.
    ///
    /// While a grow is in progress, a key can still be sitting in an
    /// un-evacuated `old_buckets` slot; checked the same way [`HMap::get`]
    /// does before falling through to the current bucket array, so an
    /// insert of such a key updates it in place instead of creating a
    /// second, stale-plus-fresh copy.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.evacuate_some();

        let hash = self.hash_of(&key);
        let top = tophash(hash);

        if self.growing() {
            let old_idx = Self::bucket_index(hash, self.old_buckets.len());
            if let Some(slot) =
                Self::find_in_bucket_mut(&mut self.old_buckets[old_idx], hash, top, &key)
            {
                return Some(core::mem::replace(&mut slot.value, value));
            }
        }

        if !self.growing() {
            if self.should_grow() {
                self.start_grow(true);
                self.evacuate_some();
            } else if self.should_regrow_same_size() {
                self.start_grow(false);
                self.evacuate_some();
            }
        }

        let idx = Self::bucket_index(hash, self.buckets.len());

        if let Some(slot) = Self::find_in_bucket_mut(&mut self.buckets[idx], hash, top, &key) {
            return Some(core::mem::replace(&mut slot.value, value));
        }

        Self::insert_into(
            &mut self.buckets,
            &mut self.overflow_count,
            idx,
            Slot {
                tophash: top,
                hash,
                key,
                value,
            },
        );
        self.count += 1;
        None
    }

    fn remove_from_bucket(
        bucket: &mut Bucket<K, V>,
        hash: u64,
        top: u8,
        key: &K,
        count: &mut usize,
    ) -> Option<V> {
        let mut cur = bucket;
        loop {
            if let Some(i) = cur
                .slots
                .iter()
                .position(|s| s.tophash == top && s.hash == hash && &s.key == key)
            {
                let removed = cur.slots.swap_remove(i);
                *count -= 1;
                return Some(removed.value);
            }
            match cur.overflow.as_deref_mut() {
                Some(next) => cur = next,
                None => return None,
            }
        }
    }

    /// Remove `key`, returning its value if present.
    ///
    /// Checks `old_buckets` first while a grow is in progress, for the same
    /// reason [`HMap::insert`] does: an un-evacuated key must not appear
    /// present to [`HMap::get`] after a `remove` call returns.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.evacuate_some();

        let hash = self.hash_of(key);
        let top = tophash(hash);

        if self.growing() {
            let old_idx = Self::bucket_index(hash, self.old_buckets.len());
            if let Some(v) =
                Self::remove_from_bucket(&mut self.old_buckets[old_idx], hash, top, key, &mut self.count)
            {
                return Some(v);
            }
        }

        let idx = Self::bucket_index(hash, self.buckets.len());
        Self::remove_from_bucket(&mut self.buckets[idx], hash, top, key, &mut self.count)
    }

    /// Remove every entry, dropping any in-progress grow and resetting to a
    /// single empty bucket.
    pub fn clear(&mut self) {
        self.buckets = alloc::vec![Bucket::new()];
        self.old_buckets.clear();
        self.nevacuate = 0;
        self.count = 0;
        self.overflow_count = 0;
    }
}

impl<K: Hash + Eq + Clone, V: Clone> HMap<K, V> {
    /// Collect every live entry across both the current and (if a grow is
    /// in progress) the old bucket arrays. Used by [`iter::iter`] to build a
    /// randomized-order snapshot.
    #[must_use]
    pub fn snapshot_entries(&self) -> Vec<(K, V)> {
        fn walk<K: Clone, V: Clone>(buckets: &[Bucket<K, V>], out: &mut Vec<(K, V)>) {
            for bucket in buckets {
                let mut cur = Some(bucket);
                while let Some(b) = cur {
                    out.extend(b.slots.iter().map(|s| (s.key.clone(), s.value.clone())));
                    cur = b.overflow.as_deref();
                }
            }
        }

        let mut out = Vec::with_capacity(self.count);
        walk(&self.buckets, &mut out);
        if self.growing() {
            // An old bucket already evacuated is empty (its slots were
            // drained into `self.buckets`), so entries are never double
            // counted between the two arrays.
            walk(&self.old_buckets, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get() {
        let mut m: HMap<u32, &'static str> = HMap::new(1);
        assert_eq!(m.insert(1, "one"), None);
        assert_eq!(m.get(&1), Some(&"one"));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn insert_overwrites_existing() {
        let mut m: HMap<u32, u32> = HMap::new(1);
        m.insert(1, 10);
        assert_eq!(m.insert(1, 20), Some(10));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn remove_deletes_entry() {
        let mut m: HMap<u32, u32> = HMap::new(1);
        m.insert(1, 10);
        assert_eq!(m.remove(&1), Some(10));
        assert_eq!(m.get(&1), None);
        assert_eq!(m.len(), 0);
    }

    #[test]
    fn grows_and_stays_consistent_under_many_inserts() {
        let mut m: HMap<u32, u32> = HMap::new(0x5EED);
        for i in 0..2000u32 {
            m.insert(i, i * 2);
        }
        assert_eq!(m.len(), 2000);
        for i in 0..2000u32 {
            assert_eq!(m.get(&i), Some(&(i * 2)));
        }
    }

    #[test]
    fn clear_empties_map() {
        let mut m: HMap<u32, u32> = HMap::new(1);
        for i in 0..50u32 {
            m.insert(i, i);
        }
        m.clear();
        assert_eq!(m.len(), 0);
        assert_eq!(m.get(&5), None);
    }

    #[test]
    fn insert_and_remove_of_unevacuated_key_during_grow() {
        let mut m: HMap<u32, u32> = HMap::new(7);
        for i in 0..200u32 {
            m.insert(i, i);
        }
        // Start a fresh grow by hand so every old bucket begins unevacuated
        // (`nevacuate == 0`), rather than relying on whatever partial
        // progress an ordinary insert-triggered grow happens to have made.
        m.start_grow(true);
        assert!(m.growing());
        assert_eq!(m.nevacuate, 0);

        // `evacuate_some` advances at most two old buckets per call, so a
        // key whose old bucket index is 2 or higher is still stuck in
        // `old_buckets` after the one evacuation step `insert`/`remove`
        // below will each trigger internally.
        let mut target_key = None;
        'outer: for idx in 2..m.old_buckets.len() {
            let mut cur = Some(&m.old_buckets[idx]);
            while let Some(b) = cur {
                if let Some(slot) = b.slots.first() {
                    target_key = Some(slot.key);
                    break 'outer;
                }
                cur = b.overflow.as_deref();
            }
        }
        let key = target_key.expect("some key lands in an unevacuated old bucket");

        let before = m.len();
        assert_eq!(m.insert(key, 999), Some(key), "update of a pre-existing key must not duplicate it");
        assert_eq!(m.get(&key), Some(&999));
        assert_eq!(m.len(), before, "insert of an existing key must not grow the count");

        assert_eq!(m.remove(&key), Some(999));
        assert_eq!(m.get(&key), None);
        assert_eq!(m.len(), before - 1);
    }

    #[test]
    fn interleaved_insert_and_remove_during_grow() {
        let mut m: HMap<u32, u32> = HMap::new(9);
        for i in 0..500u32 {
            m.insert(i, i);
            if i % 3 == 0 {
                m.remove(&i);
            }
        }
        for i in 0..500u32 {
            if i % 3 == 0 {
                assert_eq!(m.get(&i), None);
            } else {
                assert_eq!(m.get(&i), Some(&i));
            }
        }
    }
}
