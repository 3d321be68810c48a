//! Pooled wait-queue node: one entry per task parked on a channel or select
//! statement.

use crate::task::TaskId;
use alloc::vec::Vec;

/// One queued waiter on an `hchan`'s send or receive wait queue, or one
/// branch of a parked `select`.
pub struct Sudog {
    pub g: TaskId,
    /// Address of the waiting task's value slot: the source for a blocked
    /// send, the destination for a blocked receive.
    pub elem: usize,
    /// Address of the channel this sudog is queued on, `0` for select
    /// branches not yet bound to a specific channel at park time.
    pub chan: usize,
    pub next: Option<usize>,
    pub prev: Option<usize>,
    /// Set when this sudog is one of several branches of a single `select`
    /// call: only the first one to succeed wins, and the others must be
    /// dequeued from their respective channels.
    pub is_select: bool,
    /// Set by the waker once the transfer completed, so the waiting side
    /// knows whether it got a real value or woke up because its channel
    /// closed.
    pub success: bool,
    /// Monotonic ticket used to break ties when multiple sudogs on the same
    /// queue could proceed in the same scheduling step, preserving FIFO
    /// order among non-select waiters.
    pub ticket: u64,
    /// Address of a `Cell<bool>` living in the parked task's own (still
    /// pinned, since this is a stackful coroutine) stack frame, or `0` if
    /// unused. The waker writes the transfer outcome through this pointer at
    /// the same moment it sets [`Sudog::success`], so the parked side can
    /// learn the outcome directly on resume without needing the `Sudog`
    /// value back (it has already been consumed into the wait queue's
    /// `woken` list by then).
    pub ok_slot: usize,
}

impl Sudog {
    fn reset(&mut self, g: TaskId, elem: usize, chan: usize, ticket: u64) {
        self.g = g;
        self.elem = elem;
        self.chan = chan;
        self.next = None;
        self.prev = None;
        self.is_select = false;
        self.success = false;
        self.ticket = ticket;
        self.ok_slot = 0;
    }
}

/// Pooled allocator for [`Sudog`] values, capped at
/// [`crate::config::SUDOG_POOL_CAP`].
pub struct SudogPool {
    free: Vec<Sudog>,
    cap: usize,
    next_ticket: u64,
    outstanding: usize,
}

impl SudogPool {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            free: Vec::new(),
            cap,
            next_ticket: 0,
            outstanding: 0,
        }
    }

    /// Acquire a sudog for `g` waiting on `chan` over `elem`.
    ///
    /// # Errors
    /// Returns `None` if the pool is exhausted and the configured cap has
    /// already been handed out; callers turn this into
    /// [`crate::error::Fatal::SudogPoolExhausted`].
    pub fn acquire(&mut self, g: TaskId, elem: usize, chan: usize) -> Option<Sudog> {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        if let Some(mut sudog) = self.free.pop() {
            sudog.reset(g, elem, chan, ticket);
            self.outstanding += 1;
            return Some(sudog);
        }
        if self.outstanding >= self.cap {
            return None;
        }
        self.outstanding += 1;
        Some(Sudog {
            g,
            elem,
            chan,
            next: None,
            prev: None,
            is_select: false,
            success: false,
            ticket,
            ok_slot: 0,
        })
    }

    pub fn release(&mut self, sudog: Sudog) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < self.cap {
            self.free.push(sudog);
        }
    }

    #[must_use]
    pub fn pooled_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_reuses_node() {
        let mut pool = SudogPool::new(4);
        let sudog = pool.acquire(1, 0x1000, 0x2000).unwrap();
        assert_eq!(sudog.g, 1);
        pool.release(sudog);
        assert_eq!(pool.pooled_count(), 1);
        let sudog2 = pool.acquire(2, 0x3000, 0x4000).unwrap();
        assert_eq!(sudog2.g, 2);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn tickets_increase_monotonically() {
        let mut pool = SudogPool::new(4);
        let a = pool.acquire(1, 0, 0).unwrap();
        let b = pool.acquire(2, 0, 0).unwrap();
        assert!(b.ticket > a.ticket);
    }
}
