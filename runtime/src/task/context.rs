//! Per-task saved CPU context, built on [`micrort_fiber`]'s
//! `getcontext`/`setcontext`/`swapcontext`/`makecontext` primitives.

use micrort_fiber::Context;

/// Saved register state for one suspended task.
pub struct TaskContext {
    inner: Context,
}

impl TaskContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Context::default(),
        }
    }

    /// Prepare this context to start executing `entry(arg)` on `stack` when
    /// first resumed.
    pub fn init(&mut self, stack: &mut [u8], entry: extern "C" fn(usize) -> !, arg: usize) {
        // Safety: `stack` is exclusively owned by the caller for the
        // lifetime of this task and at least `MIN_STACK_SIZE` bytes.
        unsafe { micrort_fiber::makecontext(&mut self.inner, stack, entry, arg) }
    }

    /// Switch from `self` (the currently running task) to `target`,
    /// returning once `self` is resumed again.
    pub fn switch_to(&mut self, target: &TaskContext) {
        // Safety: both contexts are distinct, live `TaskContext`s owned by
        // the scheduler; `target` was previously produced by `init` or a
        // prior `switch_to`.
        unsafe {
            let target_ptr = core::ptr::from_ref(&target.inner);
            micrort_fiber::swapcontext(&mut self.inner, target_ptr);
        }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    std::thread_local! {
        static PING: Cell<u32> = const { Cell::new(0) };
    }

    extern "C" fn entry_bumps_ping(_arg: usize) -> ! {
        PING.with(|p| p.set(p.get() + 1));
        loop {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn init_prepares_a_runnable_context() {
        let mut stack = alloc::vec![0u8; micrort_fiber::MIN_STACK_SIZE * 4];
        let mut child = TaskContext::new();
        child.init(&mut stack, entry_bumps_ping, 0);
        // `init` alone must not run the entry point.
        assert_eq!(PING.with(Cell::get), 0);
    }
}
