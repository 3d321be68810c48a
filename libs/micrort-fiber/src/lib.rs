//! Stackful context switching primitives.
//!
//! This crate is the `getcontext` / `setcontext` / `swapcontext` /
//! `makecontext` quartet a cooperative scheduler needs to save and resume a
//! task's callee-saved registers, stack pointer, and program counter. It is
//! heavily based on the stack-switching technique in `corosensei` (the basis
//! of the sibling `fiber` crate this one is derived from), simplified because
//! this runtime never unwinds across a context switch: panics are recovered
//! through an explicit checkpoint chain (see the `runtime` crate's
//! `defer_panic` module), not DWARF unwinding, so none of the CFI bookkeeping
//! `corosensei` needs is required here.
//!
//! Only the callee-saved registers, the stack pointer, and a handful of FPU
//! control/status bits are preserved — the System V / RISC-V calling
//! conventions guarantee every other register is caller-saved and therefore
//! already accounted for on the stack by the compiler at the call site that
//! invoked [`swapcontext`].

#![cfg_attr(not(test), no_std)]
#![feature(naked_functions)]

mod arch;

pub use arch::Context;

/// Save the current execution state into `ctx`.
///
/// Returns `0` on the initial (direct) call. If another context is later
/// resumed into `ctx` via [`setcontext`] or the longjmp-style resume used by
/// checkpoints, this function's call site observes a second "return" whose
/// value is whatever the resumer passed.
///
/// # Safety
///
/// `ctx` must be valid for writes of `size_of::<Context>()` bytes.
#[inline(always)]
pub unsafe fn getcontext(ctx: *mut Context) -> i32 {
    // Safety: delegated to caller.
    unsafe { arch::save_context(ctx) }
}

/// Resume a previously saved context, never returning to the caller.
///
/// `retval` becomes the "return value" observed at the matching
/// [`getcontext`] call site.
///
/// # Safety
///
/// `ctx` must have been initialized by [`getcontext`], [`swapcontext`], or
/// [`makecontext`], and its stack must still be valid and not in use by
/// anyone else.
#[inline(always)]
pub unsafe fn setcontext(ctx: *const Context, retval: i32) -> ! {
    // Safety: delegated to caller.
    unsafe { arch::restore_context(ctx, retval) }
}

/// Atomically save the caller's state into `old` and resume `new`.
///
/// Used for scheduler <-> task transfers, where there is no meaningful
/// "return value" (the next resume of `old` simply falls through to the
/// instruction after the `swapcontext` call).
///
/// # Safety
///
/// Same requirements as [`getcontext`] (for `old`) and [`setcontext`] (for
/// `new`).
#[inline(always)]
pub unsafe fn swapcontext(old: *mut Context, new: *const Context) {
    // Safety: delegated to caller.
    unsafe { arch::swap_context(old, new) }
}

/// Initialize `ctx` so that the first [`setcontext`]/[`swapcontext`] resuming
/// it begins executing `entry(arg)` on `stack`, running on the stack pointer
/// computed from `stack`'s top address.
///
/// If `entry` returns, the trampoline calls `on_return(arg)` instead of
/// falling off the end of the stack.
///
/// # Safety
///
/// `stack` must be a valid, writable region at least
/// [`arch::MIN_STACK_SIZE`] bytes long, aligned to [`arch::STACK_ALIGNMENT`],
/// and must outlive every future resume of `ctx`.
#[inline(always)]
pub unsafe fn makecontext(
    ctx: *mut Context,
    stack: &mut [u8],
    entry: extern "C" fn(usize) -> !,
    arg: usize,
) {
    // Safety: delegated to caller.
    unsafe { arch::make_context(ctx, stack, entry, arg) }
}

pub use arch::{MIN_STACK_SIZE, STACK_ALIGNMENT};

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn swap_runs_entry_and_returns() {
        thread_local! {
            static SEEN: Cell<usize> = const { Cell::new(0) };
        }

        extern "C" fn entry(arg: usize) -> ! {
            SEEN.with(|c| c.set(arg));
            // Switch back to whoever resumed us. `TASK_RETURN` is populated
            // by the test before the first swap.
            TASK_RETURN.with(|c| {
                let ctx = c.get();
                // Safety: set up by the test below before swapping in.
                unsafe { setcontext(ctx, 0) }
            })
        }

        thread_local! {
            static TASK_RETURN: Cell<*const Context> = const { Cell::new(core::ptr::null()) };
        }

        let mut stack = alloc_stack();
        let mut task_ctx = Context::new();
        // Safety: stack is freshly allocated and large enough.
        unsafe { makecontext(&mut task_ctx, &mut stack, entry, 0xABCD) };

        let mut main_ctx = Context::new();
        TASK_RETURN.with(|c| c.set(&main_ctx));
        // Safety: both contexts are valid, stack is alive for this scope.
        unsafe { swapcontext(&mut main_ctx, &task_ctx) };

        assert_eq!(SEEN.with(Cell::get), 0xABCD);
    }

    fn alloc_stack() -> alloc::vec::Vec<u8> {
        alloc::vec![0u8; 64 * 1024]
    }

    extern crate alloc;
}
