//! Defer records, panic records, and checkpoint-based recovery.
//!
//! Built on a setjmp-equivalent checkpoint chain rather than DWARF
//! unwinding tables, using the same suspend/resume primitive the scheduler
//! uses for context switches, generalized here from a single resume point
//! to a chain of nested checkpoints since `defer` calls can recover nested
//! panics.

use crate::config::Config;
use crate::error::{Fatal, Host, fatal};
use crate::task::G;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use micrort_fiber::Context;

/// A value carried by a panic: either a formatted message or a boxed
/// interface value, kind-directed by its dynamic [`crate::types::Kind`].
#[derive(Debug, Clone)]
pub enum PanicValue {
    Message(String),
    RuntimeError(String),
    Boxed(crate::iface::Eface),
}

impl PanicValue {
    /// Render this value the way an uncaught panic's diagnostic line would,
    /// dispatching on the dynamic kind of a boxed value so e.g. a panic with
    /// an `error` value prints its message rather than `{address}`.
    #[must_use]
    pub fn format(&self) -> String {
        match self {
            PanicValue::Message(s) | PanicValue::RuntimeError(s) => s.clone(),
            PanicValue::Boxed(eface) => eface.format_for_panic(),
        }
    }
}

/// One `defer` record, pushed at `defer` time and executed in LIFO order by
/// [`run_defers`].
///
/// The stored closure takes both `&mut G` and `&mut DeferPanicState`: a
/// deferred call that wants to call [`recover`] needs both, the same two
/// pieces `recover` itself takes, since `recover` is only meaningful when
/// called directly from a deferred function.
pub struct DeferRecord {
    pub func: Box<dyn FnOnce(&mut G, &mut DeferPanicState)>,
    pub next: Option<Box<DeferRecord>>,
}

/// One active panic, chained so a panic raised from within a defer while
/// another panic is already unwinding is visible to `recover` as the
/// innermost one.
pub struct PanicRecord {
    pub value: PanicValue,
    pub recovered: bool,
    pub next: Option<Box<PanicRecord>>,
}

/// One saved resume point. `recover()` inside a deferred call longjmps back
/// here, unwinding the Rust call stack below the matching [`checkpoint`]
/// call without running any `Drop` impls in between — callers that need
/// guaranteed cleanup must do it via `defer`, not `Drop`, since this runtime
/// never relies on stack unwinding for cleanup.
pub struct Checkpoint {
    ctx: Context,
    depth: usize,
}

/// Per-task bookkeeping threaded through defer execution: the checkpoint
/// stack and recursive-panic counter.
pub struct DeferPanicState {
    checkpoints: Vec<Checkpoint>,
    recursive_panics: usize,
    max_defer_depth: usize,
    max_recursive_panics: usize,
}

impl DeferPanicState {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            checkpoints: Vec::new(),
            recursive_panics: 0,
            max_defer_depth: config.max_defer_depth,
            max_recursive_panics: config.max_recursive_panics,
        }
    }

    #[must_use]
    pub fn checkpoint_depth(&self) -> usize {
        self.checkpoints.len()
    }
}

/// Push a new defer record onto `task`'s chain. Panics (the Rust kind, used
/// only as an internal assertion) if the chain already exceeds
/// [`Config::max_defer_depth`]; that condition should have already been
/// turned into a [`Fatal::DeferOverflow`] by the caller before this is
/// reached.
pub fn deferproc(task: &mut G, func: Box<dyn FnOnce(&mut G, &mut DeferPanicState)>) {
    let record = Box::new(DeferRecord {
        func,
        next: task.defer_head.take().map(|p| {
            // Safety: `defer_head`, when `Some`, always points at a live,
            // exclusively-owned `DeferRecord` allocated by a prior
            // `deferproc` call on this same task.
            unsafe { Box::from_raw(p) }
        }),
    });
    task.defer_head = Some(Box::into_raw(record));
}

/// Check whether pushing one more defer record would exceed the configured
/// depth; callers call this before [`deferproc`] so the overflow can be
/// reported as a clean [`Fatal`] instead of overflowing a real stack.
#[must_use]
pub fn defer_depth(task: &G) -> usize {
    let mut depth = 0;
    let mut cur = task.defer_head;
    while let Some(ptr) = cur {
        depth += 1;
        // Safety: `ptr` is a live `DeferRecord` per the chain invariant
        // maintained by `deferproc`/`run_defers`.
        cur = unsafe { (*ptr).next.as_deref() }.map(core::ptr::from_ref).map(|p| p.cast_mut());
    }
    depth
}

/// Run every deferred call registered on `task`, most-recently-registered
/// first, stopping early (leaving the rest of the chain intact) if a
/// deferred call itself panics without being caught by a nested `recover`.
pub fn run_defers<H: Host>(host: &H, task: &mut G, state: &mut DeferPanicState) {
    let _ = host;
    while let Some(ptr) = task.defer_head.take() {
        // Safety: `ptr` came from `Box::into_raw` in `deferproc`.
        let record = unsafe { Box::from_raw(ptr) };
        task.defer_head = record.next.map(Box::into_raw);
        (record.func)(task, state);
    }
}

/// Raise a panic on `task`: push a new panic record and begin running the
/// remaining defer chain so nested `recover` calls get a chance to stop it.
///
/// # Errors
/// Escalates to [`fatal`] with [`Fatal::PanicChainTooDeep`] if raising this
/// panic would exceed [`Config::max_recursive_panics`], or with
/// [`Fatal::PanicInIrqContext`] if `host.in_irq()`.
pub fn gopanic<H: Host>(host: &H, task: &mut G, state: &mut DeferPanicState, value: PanicValue) -> ! {
    if host.in_irq() {
        fatal(host, Fatal::PanicInIrqContext);
    }
    if state.recursive_panics >= state.max_recursive_panics {
        fatal(host, Fatal::PanicChainTooDeep);
    }
    state.recursive_panics += 1;

    let record = Box::new(PanicRecord {
        value,
        recovered: false,
        next: task.panic_head.take().map(|p| {
            // Safety: chain invariant.
            unsafe { Box::from_raw(p) }
        }),
    });
    let raised_ptr = Box::into_raw(record);
    task.panic_head = Some(raised_ptr);

    run_defers(host, task, state);

    // `recover()` unlinks the record it catches, splicing its `next` into
    // `task.panic_head`. So if this panic was recovered, `raised_ptr` is no
    // longer the chain head (or the chain is now empty, if there was no
    // enclosing panic underneath it).
    if task.panic_head != Some(raised_ptr) {
        unwind_to_checkpoint(state);
    }

    // Nothing recovered it: report diagnostics and abort. Uncaught panics
    // are fatal on this runtime (there is no parent task to propagate to on
    // an embedded single-process target).
    // Safety: `raised_ptr` is still live here: `recover()` only frees a
    // panic record after first unlinking it from `task.panic_head`, and the
    // check above already ruled that out for this record.
    let msg = unsafe { (*raised_ptr).value.format() };
    host.diagnostic("panic:");
    host.diagnostic(&msg);
    fatal(host, Fatal::PanicChainTooDeep);
}

/// Attempt to recover the innermost unrecovered panic on `task`. Must only
/// be called directly from a deferred function; returns `None` if there is
/// nothing to recover. Unlinks the recovered record from the chain so it
/// does not linger at the head once `gopanic` returns control.
pub fn recover(task: &mut G, state: &mut DeferPanicState) -> Option<PanicValue> {
    let ptr = task.panic_head?;
    // Safety: chain invariant.
    let already = unsafe { (*ptr).recovered };
    if already {
        return None;
    }
    state.recursive_panics = state.recursive_panics.saturating_sub(1);
    // Safety: `ptr` came from `Box::into_raw` in `gopanic` (or a prior
    // `deferproc`'s `next` link) and is still exclusively owned by this
    // chain; taking it back here and splicing its `next` into
    // `task.panic_head` is what actually removes it, instead of leaving a
    // `recovered = true` record permanently at the head.
    let mut record = unsafe { Box::from_raw(ptr) };
    record.recovered = true;
    task.panic_head = record.next.take().map(Box::into_raw);
    Some(record.value)
}

/// Save a resume point; `state` tracks nesting so `unwind_to_checkpoint`
/// can jump back to the innermost one still on the chain.
///
/// # Safety
/// Must be paired with a later [`uncheckpoint`] on the same `state` before
/// the enclosing stack frame returns, unless control instead reaches
/// [`unwind_to_checkpoint`].
pub unsafe fn checkpoint(state: &mut DeferPanicState) -> i32 {
    let mut ctx = Context::new();
    // Safety: `ctx` is local and valid for the duration it is observed.
    let ret = unsafe { micrort_fiber::getcontext(&mut ctx) };
    if ret == 0 {
        let depth = state.checkpoints.len();
        state.checkpoints.push(Checkpoint { ctx, depth });
    }
    ret
}

/// Pop the innermost checkpoint without resuming it, called when a
/// protected region completes normally.
pub fn uncheckpoint(state: &mut DeferPanicState) {
    state.checkpoints.pop();
}

fn unwind_to_checkpoint(state: &mut DeferPanicState) -> ! {
    let Some(cp) = state.checkpoints.pop() else {
        // No checkpoint to unwind to: this is a programming error in the
        // runtime itself (recover() without a matching protected call).
        unreachable!("unwind_to_checkpoint called with no active checkpoint");
    };
    // Safety: `cp.ctx` was populated by a live `checkpoint()` call whose
    // stack frame is still on the call stack (checkpoints are always
    // nested, never resumed out of order).
    unsafe { micrort_fiber::setcontext(&cp.ctx, 1) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::test_host::StdHost;
    use core::cell::Cell;

    #[test]
    fn defer_runs_in_lifo_order() {
        let host = StdHost::new();
        let mut task = G::new(1);
        let mut state = DeferPanicState::new(&Config::default());

        let order: alloc::rc::Rc<core::cell::RefCell<Vec<u32>>> =
            alloc::rc::Rc::new(core::cell::RefCell::new(Vec::new()));

        for i in 0..3u32 {
            let order = order.clone();
            deferproc(&mut task, Box::new(move |_task, _state| order.borrow_mut().push(i)));
        }

        run_defers(&host, &mut task, &mut state);
        assert_eq!(*order.borrow(), alloc::vec![2, 1, 0]);
    }

    #[test]
    fn recover_stops_propagation() {
        let host = StdHost::new();
        let mut task = G::new(1);
        let mut state = DeferPanicState::new(&Config::default());

        let recovered_value: alloc::rc::Rc<Cell<bool>> = alloc::rc::Rc::new(Cell::new(false));
        let rv = recovered_value.clone();
        deferproc(
            &mut task,
            Box::new(move |task, state| {
                let got = recover(task, state);
                rv.set(got.is_some());
            }),
        );

        task.panic_head = Some(Box::into_raw(Box::new(PanicRecord {
            value: PanicValue::Message("boom".into()),
            recovered: false,
            next: None,
        })));

        run_defers(&host, &mut task, &mut state);

        assert!(recovered_value.get());
        // `recover` unlinks the record it catches; with no enclosing panic
        // underneath it, the chain is now empty.
        assert!(task.panic_head.is_none());
    }

    #[test]
    fn recover_of_nested_panic_restores_outer_head() {
        let host = StdHost::new();
        let mut task = G::new(1);
        let mut state = DeferPanicState::new(&Config::default());

        let outer = Box::into_raw(Box::new(PanicRecord {
            value: PanicValue::Message("outer".into()),
            recovered: false,
            next: None,
        }));
        task.panic_head = Some(Box::into_raw(Box::new(PanicRecord {
            value: PanicValue::Message("inner".into()),
            recovered: false,
            next: Some(
                // Safety: `outer` was just allocated above.
                unsafe { Box::from_raw(outer) },
            ),
        })));

        let got = recover(&mut task, &mut state);
        assert!(matches!(got, Some(PanicValue::Message(m)) if m == "inner"));

        let ptr = task.panic_head.expect("outer panic record still chained");
        // Safety: `ptr` is the spliced-in outer record.
        assert!(matches!(&unsafe { (*ptr).value.clone() }, PanicValue::Message(m) if m == "outer"));
    }
}
