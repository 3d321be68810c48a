//! Typed channel (`hchan`): blocking rendezvous for an unbuffered channel, a
//! ring buffer for a buffered one, and a FIFO wait queue on each side.
//!
//! Built on a wait-cell pattern — a queue of parked waiters serviced in
//! order by whichever side next makes progress — generalized from a
//! one-shot single value to a ring buffer plus unbounded resend.

use crate::config::{MAX_CHAN_CAP, MAX_CHAN_ELEM_SIZE};
use crate::sudog::Sudog;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cell::Cell;

/// Mirror a just-decided `waiter.success` through its `ok_slot`, if the
/// parked side registered one, so it can read the outcome back on resume
/// without needing the `Sudog` value itself (already consumed into a
/// `woken` list by the time the parked task runs again). `None` until
/// written; a select case's `try_once` uses that to tell "not yet my turn"
/// apart from "resolved, unsuccessfully".
fn signal_ok(waiter: &Sudog) {
    if waiter.ok_slot != 0 {
        // Safety: `ok_slot`, when nonzero, was set by the parked side to the
        // address of a `Cell<Option<bool>>` in its own stack frame (or, for a
        // select case, a boxed case struct's field), which stays valid for as
        // long as the task remains parked.
        unsafe { (*(waiter.ok_slot as *const Cell<Option<bool>>)).set(Some(waiter.success)) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanError {
    SendOnClosed,
    CloseOfClosed,
    CapTooLarge,
    ElemTooLarge,
}

/// Outcome of a non-blocking channel operation, used by `select`'s
/// fast-path poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryResult {
    /// The operation completed immediately.
    Done,
    /// The operation would have to block.
    WouldBlock,
    /// A receive from a closed, empty channel: completed with the zero
    /// value and `ok = false`.
    ClosedEmpty,
}

/// Outcome of [`HChan::try_send`]: mirrors [`TryResult`] but hands the
/// value back to the caller on every path that didn't consume it, so a
/// blocked send can be parked with its value intact.
pub enum SendOutcome<T> {
    Done,
    WouldBlock(T),
    SendOnClosed(T),
}

/// A typed channel's runtime state. Generic over the element type so the
/// buffer is a plain `VecDeque<T>` instead of an untyped byte ring plus a
/// separate element-size field.
pub struct HChan<T> {
    buf: VecDeque<T>,
    cap: usize,
    closed: bool,
    /// Waiters parked trying to send, FIFO.
    send_waiters: VecDeque<Sudog>,
    /// Waiters parked trying to receive, FIFO.
    recv_waiters: VecDeque<Sudog>,
    /// Sudogs that a `try_send`/`try_recv` handoff just marked ready; the
    /// scheduler drains this via [`HChan::take_woken`] and calls `goready`
    /// on each.
    woken: Vec<Sudog>,
}

impl<T> HChan<T> {
    /// # Errors
    /// Returns [`ChanError::CapTooLarge`] if `cap` exceeds
    /// [`MAX_CHAN_CAP`], or [`ChanError::ElemTooLarge`] if
    /// `size_of::<T>()` exceeds [`MAX_CHAN_ELEM_SIZE`].
    pub fn new(cap: usize) -> Result<Self, ChanError> {
        if cap > MAX_CHAN_CAP {
            return Err(ChanError::CapTooLarge);
        }
        if core::mem::size_of::<T>() > MAX_CHAN_ELEM_SIZE {
            return Err(ChanError::ElemTooLarge);
        }
        Ok(Self {
            buf: VecDeque::with_capacity(cap.min(64)),
            cap,
            closed: false,
            send_waiters: VecDeque::new(),
            recv_waiters: VecDeque::new(),
            woken: Vec::new(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn wake(&mut self, sudog: Sudog) {
        self.woken.push(sudog);
    }

    /// Drain every sudog marked ready by a handoff since the last call.
    pub fn take_woken(&mut self) -> Vec<Sudog> {
        core::mem::take(&mut self.woken)
    }

    /// Attempt an immediate (non-blocking) send, matching a parked receiver
    /// directly when one is waiting (the unbuffered rendezvous path), or
    /// filling the ring buffer when there's room.
    pub fn try_send(&mut self, value: T) -> SendOutcome<T> {
        if self.closed {
            return SendOutcome::SendOnClosed(value);
        }
        if let Some(mut waiter) = self.recv_waiters.pop_front() {
            // Safety: `waiter.elem` was registered by a parked receiver as
            // the address of its own stack-local value slot, still valid
            // because the receiver stays parked (and its stack pinned)
            // until woken.
            unsafe { core::ptr::write(waiter.elem as *mut T, value) };
            waiter.success = true;
            signal_ok(&waiter);
            self.wake(waiter);
            tracing::trace!("chansend: direct handoff to parked receiver");
            return SendOutcome::Done;
        }
        if self.buf.len() < self.cap {
            self.buf.push_back(value);
            tracing::trace!(buffered = self.buf.len(), "chansend: buffered");
            return SendOutcome::Done;
        }
        SendOutcome::WouldBlock(value)
    }

    /// Attempt an immediate (non-blocking) receive.
    ///
    /// Returns `(TryResult, Option<T>)`: a value is present unless the
    /// result is [`TryResult::WouldBlock`].
    pub fn try_recv(&mut self) -> (TryResult, Option<T>) {
        if let Some(value) = self.buf.pop_front() {
            // A buffered slot just freed up; hand it to the longest-waiting
            // blocked sender, if any, keeping buffer occupancy at `cap`
            // until no sender is waiting.
            if let Some(mut waiter) = self.send_waiters.pop_front() {
                // Safety: as in `try_send`, the waiter's stack is pinned
                // while parked.
                let sent = unsafe { core::ptr::read(waiter.elem as *const T) };
                self.buf.push_back(sent);
                waiter.success = true;
                signal_ok(&waiter);
                self.wake(waiter);
            }
            tracing::trace!("chanrecv: from buffer");
            return (TryResult::Done, Some(value));
        }
        if let Some(mut waiter) = self.send_waiters.pop_front() {
            // Safety: as above.
            let sent = unsafe { core::ptr::read(waiter.elem as *const T) };
            waiter.success = true;
            signal_ok(&waiter);
            self.wake(waiter);
            tracing::trace!("chanrecv: direct handoff from parked sender");
            return (TryResult::Done, Some(sent));
        }
        if self.closed {
            return (TryResult::ClosedEmpty, None);
        }
        (TryResult::WouldBlock, None)
    }

    /// Park `sudog` on the send-wait queue. The caller is responsible for
    /// actually suspending the calling task after this returns.
    pub fn park_sender(&mut self, sudog: Sudog) {
        self.send_waiters.push_back(sudog);
    }

    /// Park `sudog` on the recv-wait queue.
    pub fn park_receiver(&mut self, sudog: Sudog) {
        self.recv_waiters.push_back(sudog);
    }

    /// Remove and return the send waiter parked with value slot `elem_addr`,
    /// if it's still queued. Used by `select` to withdraw a case that lost
    /// to a sibling case once one of them fires.
    pub fn cancel_send_waiter(&mut self, elem_addr: usize) -> Option<Sudog> {
        let pos = self.send_waiters.iter().position(|w| w.elem == elem_addr)?;
        self.send_waiters.remove(pos)
    }

    /// Remove and return the recv waiter parked with value slot `elem_addr`,
    /// if it's still queued.
    pub fn cancel_recv_waiter(&mut self, elem_addr: usize) -> Option<Sudog> {
        let pos = self.recv_waiters.iter().position(|w| w.elem == elem_addr)?;
        self.recv_waiters.remove(pos)
    }

    /// Close the channel, waking every parked waiter with a failed transfer:
    /// pending receives observe the zero value with `ok=false`, pending
    /// sends panic in the caller.
    ///
    /// # Errors
    /// [`ChanError::CloseOfClosed`] if already closed.
    pub fn close(&mut self) -> Result<Vec<Sudog>, ChanError> {
        if self.closed {
            return Err(ChanError::CloseOfClosed);
        }
        self.closed = true;
        let mut woken = Vec::new();
        while let Some(mut w) = self.recv_waiters.pop_front() {
            w.success = false;
            signal_ok(&w);
            woken.push(w);
        }
        while let Some(mut w) = self.send_waiters.pop_front() {
            w.success = false;
            signal_ok(&w);
            woken.push(w);
        }
        Ok(woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_send_then_recv() {
        let mut ch: HChan<u32> = HChan::new(2).unwrap();
        assert!(matches!(ch.try_send(1), SendOutcome::Done));
        assert!(matches!(ch.try_send(2), SendOutcome::Done));
        assert!(matches!(ch.try_send(3), SendOutcome::WouldBlock(3)));
        let (r, v) = ch.try_recv();
        assert_eq!(r, TryResult::Done);
        assert_eq!(v, Some(1));
    }

    #[test]
    fn recv_on_empty_unbuffered_would_block() {
        let mut ch: HChan<u32> = HChan::new(0).unwrap();
        let (r, v) = ch.try_recv();
        assert_eq!(r, TryResult::WouldBlock);
        assert!(v.is_none());
    }

    #[test]
    fn send_on_closed_errors() {
        let mut ch: HChan<u32> = HChan::new(1).unwrap();
        ch.close().unwrap();
        assert!(matches!(ch.try_send(5), SendOutcome::SendOnClosed(5)));
    }

    #[test]
    fn recv_on_closed_empty_gets_closed_empty() {
        let mut ch: HChan<u32> = HChan::new(1).unwrap();
        ch.close().unwrap();
        let (r, v) = ch.try_recv();
        assert_eq!(r, TryResult::ClosedEmpty);
        assert!(v.is_none());
    }

    #[test]
    fn double_close_errors() {
        let mut ch: HChan<u32> = HChan::new(1).unwrap();
        ch.close().unwrap();
        assert_eq!(ch.close().unwrap_err(), ChanError::CloseOfClosed);
    }

    #[test]
    fn cap_over_limit_rejected() {
        let res: Result<HChan<u8>, ChanError> = HChan::new(MAX_CHAN_CAP + 1);
        assert_eq!(res.err(), Some(ChanError::CapTooLarge));
    }
}
