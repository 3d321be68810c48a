//! Map iteration: starts at a randomized order each time, guarding against
//! programs accidentally depending on a fixed iteration order.
//!
//! This rendering iterates a snapshot taken at iterator-creation time rather
//! than walking the live bucket array while a grow can still be in progress
//! underneath it: entries present for the whole iteration are observed at
//! least once and a grow can't corrupt the walk, both of which a snapshot
//! trivially satisfies, at the cost of not reflecting concurrent deletes
//! performed mid-iteration (this runtime has no concurrent mutation during
//! iteration to worry about: it is single-threaded and iteration does not
//! yield back to the scheduler).

use super::HMap;
use alloc::vec::Vec;
use core::hash::Hash;
use micrort_fastrand::FastRand;

/// A randomized-order snapshot iterator over an [`HMap`]'s entries at the
/// moment [`iter`] was called.
pub struct Iter<K, V> {
    entries: Vec<(K, V)>,
    pos: usize,
}

impl<K: Clone, V: Clone> Iterator for Iter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.entries.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }
}

/// Snapshot `map`'s entries in an order randomized by `rng`.
pub fn iter<K: Hash + Eq + Clone, V: Clone>(map: &HMap<K, V>, rng: &mut FastRand) -> Iter<K, V> {
    let mut entries: Vec<(K, V)> = map.snapshot_entries();
    rng.shuffle(&mut entries);
    Iter { entries, pos: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_every_entry_exactly_once() {
        let mut m: HMap<u32, u32> = HMap::new(3);
        for i in 0..20u32 {
            m.insert(i, i * 10);
        }
        let mut rng = FastRand::from_seed(99);
        let mut seen: Vec<u32> = iter(&m, &mut rng).map(|(k, _)| k).collect();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..20).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn values_match_map_contents() {
        let mut m: HMap<u32, u32> = HMap::new(3);
        m.insert(1, 100);
        m.insert(2, 200);
        let mut rng = FastRand::from_seed(5);
        for (k, v) in iter(&m, &mut rng) {
            assert_eq!(m.get(&k), Some(&v));
        }
    }
}
