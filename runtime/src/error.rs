//! Host collaborator seam and the two error tiers.
//!
//! The board-support seam is a trait the runtime depends on and a platform
//! crate implements (e.g. `uart-16550`, `trap`); [`Host`] plays that role
//! here. Production targets implement [`Host`] against the real board
//! support package, which stays outside this crate's scope.

use alloc::format;
use core::fmt;

/// Interface toward the host kernel as an external collaborator: IRQ
/// control, a microsecond clock, the large-object escape hatch, cache
/// control, and the final abort call.
pub trait Host {
    /// Disable interrupts, returning whatever state is needed to restore them.
    fn irq_disable(&self) -> bool;
    /// Restore interrupts to the state returned by a prior `irq_disable`.
    fn irq_restore(&self, was_enabled: bool);
    /// Whether the caller is currently executing in IRQ/interrupt context.
    fn in_irq(&self) -> bool;
    /// Monotonic microseconds since boot.
    fn now_micros(&self) -> u64;
    /// Allocate memory for a large object outside the managed semi-spaces.
    ///
    /// # Errors
    /// Returns `None` on host allocation failure.
    fn alloc_large(&self, size: usize, align: usize) -> Option<*mut u8>;
    /// Release memory previously returned by [`Host::alloc_large`].
    ///
    /// # Safety
    /// `ptr`/`size`/`align` must match a prior `alloc_large` call exactly.
    unsafe fn free_large(&self, ptr: *mut u8, size: usize, align: usize);
    /// Invalidate `len` bytes of CPU data cache starting at `ptr`.
    fn cache_invalidate(&self, ptr: *mut u8, len: usize);
    /// Bulk-copy `len` bytes from `src` to `dst`, using store-queue DMA when
    /// the host supports it and the transfer is large/aligned enough;
    /// otherwise behaves like `memcpy`.
    ///
    /// # Safety
    /// `src`/`dst` must be valid for `len` bytes and must not overlap.
    unsafe fn store_queue_copy(&self, dst: *mut u8, src: *const u8, len: usize);
    /// Write a line of diagnostic output (stderr, UART, whatever the board
    /// provides) before [`Host::abort`] is called.
    fn diagnostic(&self, line: &str);
    /// Terminate the process/board. Never returns.
    fn abort(&self) -> !;
}

/// Causes of a fatal error: internal invariant violations that cannot be
/// recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    ToSpaceOverflow,
    OutOfMemory,
    ConcurrentMapWrite,
    NilMapAssignment,
    RecursiveChannelLock,
    PanicChainTooDeep,
    DeferOverflow,
    EvacuationLoopExceeded,
    SudogPoolExhausted,
    PanicInIrqContext,
    Deadlock,
    RecoverWithoutCheckpoint,
    UnhashableType,
    Unaddressable,
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Fatal::ToSpaceOverflow => "runtime: to-space overflow during garbage collection",
            Fatal::OutOfMemory => "runtime: out of memory",
            Fatal::ConcurrentMapWrite => "fatal error: concurrent map read and map write",
            Fatal::NilMapAssignment => "assignment to entry in nil map",
            Fatal::RecursiveChannelLock => "fatal error: recursive channel lock",
            Fatal::PanicChainTooDeep => "fatal error: panic chain too deep",
            Fatal::DeferOverflow => "fatal error: defer stack overflow",
            Fatal::EvacuationLoopExceeded => "fatal error: map evacuation safety cap exceeded",
            Fatal::SudogPoolExhausted => "fatal error: sudog pool exhausted",
            Fatal::PanicInIrqContext => "fatal error: panic in IRQ context",
            Fatal::Deadlock => "fatal error: all tasks are asleep - deadlock!",
            Fatal::RecoverWithoutCheckpoint => "fatal error: recover without checkpoint",
            Fatal::UnhashableType => "runtime error: hash of unhashable type",
            Fatal::Unaddressable => "runtime: pointer outside RAM window",
        };
        f.write_str(msg)
    }
}

/// Report a fatal error and terminate through `host`. Never returns.
///
/// Disables interrupts, logs a header plus the cause, and calls
/// [`Host::abort`].
pub fn fatal(host: &dyn Host, cause: Fatal) -> ! {
    let was_enabled = host.irq_disable();
    let _ = was_enabled; // interrupts intentionally stay disabled until abort
    tracing::error!(%cause, "fatal runtime error");
    host.diagnostic("fatal error:");
    host.diagnostic(&alloc::format!("{cause}"));
    host.abort()
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_host {
    use super::Host;
    use core::cell::Cell;
    use std::time::Instant;

    /// A [`Host`] implementation backed by the standard library, used by
    /// unit and integration tests.
    pub struct StdHost {
        start: Instant,
        irq: Cell<bool>,
    }

    impl StdHost {
        pub fn new() -> Self {
            Self {
                start: Instant::now(),
                irq: Cell::new(true),
            }
        }
    }

    impl Default for StdHost {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Host for StdHost {
        fn irq_disable(&self) -> bool {
            self.irq.replace(false)
        }

        fn irq_restore(&self, was_enabled: bool) {
            self.irq.set(was_enabled);
        }

        fn in_irq(&self) -> bool {
            false
        }

        fn now_micros(&self) -> u64 {
            #[expect(
                clippy::cast_possible_truncation,
                reason = "test host only runs for seconds, never years"
            )]
            {
                self.start.elapsed().as_micros() as u64
            }
        }

        fn alloc_large(&self, size: usize, align: usize) -> Option<*mut u8> {
            let layout = std::alloc::Layout::from_size_align(size, align).ok()?;
            // Safety: layout has nonzero size (callers never request 0).
            let ptr = unsafe { std::alloc::alloc(layout) };
            if ptr.is_null() { None } else { Some(ptr) }
        }

        unsafe fn free_large(&self, ptr: *mut u8, size: usize, align: usize) {
            let layout = std::alloc::Layout::from_size_align(size, align)
                .expect("layout matches a prior alloc_large call");
            // Safety: caller contract guarantees `ptr`/`size`/`align` match.
            unsafe { std::alloc::dealloc(ptr, layout) }
        }

        fn cache_invalidate(&self, _ptr: *mut u8, _len: usize) {
            // no-op on the test host: there is no write-back cache to model.
        }

        unsafe fn store_queue_copy(&self, dst: *mut u8, src: *const u8, len: usize) {
            // Safety: delegated to caller contract.
            unsafe { core::ptr::copy_nonoverlapping(src, dst, len) }
        }

        fn diagnostic(&self, line: &str) {
            eprintln!("{line}");
        }

        fn abort(&self) -> ! {
            panic!("micrort: fatal error reported by runtime (see diagnostic log above)");
        }
    }
}
