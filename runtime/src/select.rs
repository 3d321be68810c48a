//! `select` over multiple channel cases.
//!
//! Fairness comes from polling cases in a randomized order each call
//! (`libs/micrort-fastrand`'s xorshift PRNG drives the permutation), rather
//! than always favoring the first ready case textually. Case bodies are
//! type-erased behind [`SelectCase`] since a single `select` statement's
//! cases are typically over channels of different element types; cases are
//! tried in a fixed order purely to make the poll deterministic once
//! permuted, since this runtime has no concurrent lock to order.

use alloc::boxed::Box;
use micrort_fastrand::FastRand;

/// One case of a `select` statement: a non-blocking attempt, and (if the
/// first pass finds nothing ready) a way to park on this case specifically.
pub trait SelectCase {
    /// Attempt the case's operation without blocking. Returns `true` if it
    /// completed.
    fn try_once(&mut self) -> bool;

    /// Park the calling task as a waiter on this case. Called once per case
    /// only after every case's `try_once` failed in the same poll round.
    fn park(&mut self);

    /// Undo a `park` on every case except the one that actually fired, once
    /// a parked case is woken — only one of several parked branches may
    /// ultimately succeed.
    fn unpark(&mut self);
}

/// Result of one [`poll_once`] call.
pub enum PollOutcome {
    /// Case at this index completed immediately.
    Fired(usize),
    /// Nothing was ready; every case is now parked and the caller should
    /// suspend the current task.
    Parked,
}

/// Run one polling pass over `cases` in a randomized order, so no case is
/// structurally favored. Returns as soon as one case fires; if none do,
/// parks every case (so the scheduler can later wake exactly one) and
/// returns [`PollOutcome::Parked`].
///
/// An empty `cases` slice (`select {}`) always returns
/// [`PollOutcome::Parked`] with nothing to park on, which the caller should
/// treat as blocking forever.
pub fn poll_once(cases: &mut [Box<dyn SelectCase>], rng: &mut FastRand) -> PollOutcome {
    let n = cases.len();
    if n == 0 {
        return PollOutcome::Parked;
    }

    let mut order: alloc::vec::Vec<usize> = (0..n).collect();
    rng.shuffle(&mut order);

    for &idx in &order {
        if cases[idx].try_once() {
            tracing::trace!(case = idx, "select: fired");
            return PollOutcome::Fired(idx);
        }
    }

    for case in cases.iter_mut() {
        case.park();
    }
    tracing::trace!(cases = n, "select: nothing ready, parked all cases");
    PollOutcome::Parked
}

/// Called once a parked `select` is woken because one of its cases
/// completed: unparks every other case so they stop holding a queue slot on
/// channels that didn't end up being used.
pub fn resolve_parked(cases: &mut [Box<dyn SelectCase>], fired: usize) {
    for (idx, case) in cases.iter_mut().enumerate() {
        if idx != fired {
            case.unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct CountingCase<'a> {
        fires_after: u32,
        attempts: u32,
        parked: &'a Cell<bool>,
    }

    impl SelectCase for CountingCase<'_> {
        fn try_once(&mut self) -> bool {
            self.attempts += 1;
            self.attempts > self.fires_after
        }

        fn park(&mut self) {
            self.parked.set(true);
        }

        fn unpark(&mut self) {
            self.parked.set(false);
        }
    }

    #[test]
    fn fires_the_only_ready_case() {
        let parked_a = Cell::new(false);
        let parked_b = Cell::new(false);
        let mut cases: alloc::vec::Vec<Box<dyn SelectCase>> = alloc::vec![
            Box::new(CountingCase {
                fires_after: 100,
                attempts: 0,
                parked: &parked_a
            }),
            Box::new(CountingCase {
                fires_after: 0,
                attempts: 0,
                parked: &parked_b
            }),
        ];
        let mut rng = FastRand::from_seed(7);
        match poll_once(&mut cases, &mut rng) {
            PollOutcome::Fired(idx) => assert_eq!(idx, 1),
            PollOutcome::Parked => panic!("expected a ready case"),
        }
    }

    #[test]
    fn parks_every_case_when_none_ready() {
        let parked_a = Cell::new(false);
        let parked_b = Cell::new(false);
        let mut cases: alloc::vec::Vec<Box<dyn SelectCase>> = alloc::vec![
            Box::new(CountingCase {
                fires_after: 100,
                attempts: 0,
                parked: &parked_a
            }),
            Box::new(CountingCase {
                fires_after: 100,
                attempts: 0,
                parked: &parked_b
            }),
        ];
        let mut rng = FastRand::from_seed(1);
        assert!(matches!(poll_once(&mut cases, &mut rng), PollOutcome::Parked));
        assert!(parked_a.get());
        assert!(parked_b.get());
    }

    #[test]
    fn empty_select_always_parks() {
        let mut cases: alloc::vec::Vec<Box<dyn SelectCase>> = alloc::vec::Vec::new();
        let mut rng = FastRand::from_seed(42);
        assert!(matches!(poll_once(&mut cases, &mut rng), PollOutcome::Parked));
    }
}
