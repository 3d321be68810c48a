//! Public entry points a compiled program calls into: allocation, slices,
//! channels, `select`, maps, interface conversion, task control, and
//! defer/panic/recover.
//!
//! [`Runtime`] bundles every subsystem (heap, scheduler, itab cache) behind
//! a single `&mut self` surface plus the one [`Host`] instance for the
//! process, the way a top-level kernel struct bundles its own subsystems
//! behind one set of methods a syscall-handler layer calls into.

use crate::chan::{ChanError, HChan, SendOutcome, TryResult};
use crate::config::Config;
use crate::defer_panic::{self, DeferPanicState, PanicValue};
use crate::error::{Fatal, Host, fatal};
use crate::heap::gc::ScanContext;
use crate::heap::{GcStats, Heap};
use crate::hmap::{self, HMap};
use crate::iface::{self, Eface, Iface, Itab, ItabCache};
use crate::sched::Scheduler;
use crate::select::{self, SelectCase};
use crate::task::{G, TaskId, WaitReason};
use crate::types::{InterfaceType, Type};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::hash::Hash;
use core::mem::MaybeUninit;

/// Diagnostic-only allocation tags stashed in [`crate::heap::ObjHeader`]'s
/// kind-tag field; the collector never interprets them, they just show up in
/// a heap dump.
const KIND_TAG_OBJECT: u8 = 0;
const KIND_TAG_SLICE: u8 = 1;

/// Everything one running program needs: the managed heap, the cooperative
/// scheduler, the itab cache, and per-task defer/panic bookkeeping, plus the
/// single [`Host`] this process is bound to.
pub struct Runtime<H: Host> {
    pub heap: Heap,
    pub scheduler: Scheduler,
    pub itab_cache: ItabCache,
    defer_states: BTreeMap<TaskId, DeferPanicState>,
    config: Config,
    host: H,
}

impl<H: Host> Runtime<H> {
    #[must_use]
    pub fn new(host: H, config: Config, rng_seed: u64) -> Self {
        Self {
            heap: Heap::new(config),
            scheduler: Scheduler::new(config, rng_seed),
            itab_cache: ItabCache::new(64),
            defer_states: BTreeMap::new(),
            config,
            host,
        }
    }

    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    // --- allocation -----------------------------------------------------

    /// Allocate and zero one instance of `ty`, triggering a collection first
    /// if the heap is over threshold.
    pub fn newobject(&mut self, ty: &'static Type) -> *mut u8 {
        self.mallocgc(ty.size, Some(ty), KIND_TAG_OBJECT)
    }

    /// Allocate `size` zeroed bytes, typed by `ty` if scanning should follow
    /// its pointer bitmap, or untyped (no-scan) if `ty` is `None`.
    pub fn mallocgc(&mut self, size: usize, ty: Option<&'static Type>, kind_tag: u8) -> *mut u8 {
        let ranges = self.scheduler.gc_scan_ranges();
        let ctx = ScanContext::new(self.scheduler.roots(), &ranges);
        self.heap.alloc(&self.host, ctx, size, ty, kind_tag)
    }

    /// Run a full collection now, regardless of the configured threshold.
    pub fn gc(&mut self) {
        let ranges = self.scheduler.gc_scan_ranges();
        let ctx = ScanContext::new(self.scheduler.roots(), &ranges);
        self.heap.collect(&self.host, ctx);
    }

    #[must_use]
    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    pub fn set_gc_percent(&mut self, percent: i32) -> i32 {
        self.heap.set_gc_percent(percent)
    }

    /// Register `slot` as a GC root outside any task stack.
    ///
    /// # Safety
    /// `slot` must stay valid, and hold only zero or a valid heap address,
    /// for as long as it stays registered.
    pub unsafe fn register_root(&mut self, slot: *mut usize) {
        // Safety: delegated to caller.
        unsafe { self.scheduler.roots_mut().add_root(slot) };
    }

    pub fn unregister_root(&mut self, slot: *mut usize) {
        self.scheduler.roots_mut().remove_root(slot);
    }

    // --- task / scheduler control ----------------------------------------

    pub fn newproc(&mut self, entry: extern "C" fn(usize) -> !, arg: usize) -> TaskId {
        let id = self.scheduler.spawn(entry, arg);
        self.defer_states.insert(id, DeferPanicState::new(&self.config));
        id
    }

    /// Terminate the calling task. Never returns.
    pub fn goexit(&mut self) -> ! {
        if let Some(id) = self.scheduler.current_id() {
            self.defer_states.remove(&id);
        }
        self.scheduler.task_exit()
    }

    pub fn gosched(&mut self) {
        self.scheduler.gosched();
    }

    pub fn block(&mut self, reason: WaitReason) {
        self.scheduler.gopark(reason);
    }

    pub fn sleep(&mut self, micros_from_now: u64) {
        self.scheduler.sleep(&self.host, micros_from_now);
    }

    #[must_use]
    pub fn num_tasks(&self) -> usize {
        self.scheduler.num_tasks()
    }

    /// Drive every spawned task to completion.
    pub fn run(&mut self) {
        self.scheduler.run(&self.host);
    }

    // --- slices -----------------------------------------------------------

    /// Allocate a slice's backing buffer in the managed heap via the
    /// no-collection-triggering allocation path: `makeslice` is frequently
    /// called from within code that already holds derived pointers the
    /// collector cannot see (e.g. while growing an in-progress append), so
    /// it must never itself provoke a collection.
    ///
    /// Limited to `Copy` elements: a slice whose elements carry their own
    /// heap pointers is represented as a slice of boxed elements instead,
    /// since precisely scanning a variable-length run of pointer-containing
    /// elements would need a dynamically sized type descriptor this runtime
    /// does not build.
    pub fn makeslice<T: Copy + 'static>(&mut self, len: usize, cap: usize) -> ManagedSlice<T> {
        debug_assert!(cap >= len, "makeslice: cap must be >= len");
        let bytes = cap.saturating_mul(core::mem::size_of::<T>());
        let ptr = self
            .heap
            .alloc_no_gc(&self.host, bytes, None, KIND_TAG_SLICE)
            .cast::<T>();
        ManagedSlice { ptr, len, cap }
    }

    /// Grow `old` to hold at least `min_cap` elements, copying its existing
    /// contents into the new backing buffer.
    pub fn growslice<T: Copy + 'static>(&mut self, old: &ManagedSlice<T>, min_cap: usize) -> ManagedSlice<T> {
        let new_cap = crate::strings::grow_capacity(old.cap, min_cap);
        let mut grown = self.makeslice::<T>(old.len, new_cap);
        grown.as_mut_slice()[..old.len].copy_from_slice(old.as_slice());
        grown
    }

    // --- channels -----------------------------------------------------

    fn drain_woken<T>(&mut self, chan: &mut HChan<T>) {
        for w in chan.take_woken() {
            self.scheduler.goready(w.g);
            self.scheduler.sudog_pool_mut().release(w);
        }
    }

    /// Send `value` on `chan`, blocking the calling task if no receiver or
    /// buffer slot is immediately available.
    ///
    /// # Panics
    /// Panics (via [`Runtime::gopanic`]) if `chan` is closed.
    pub fn chansend<T>(&mut self, chan: &mut HChan<T>, value: T) {
        match chan.try_send(value) {
            SendOutcome::Done => self.drain_woken(chan),
            SendOutcome::WouldBlock(value) => self.block_send(chan, value),
            SendOutcome::SendOnClosed(_value) => {
                self.gopanic(PanicValue::RuntimeError(String::from("send on closed channel")));
            }
        }
    }

    fn block_send<T>(&mut self, chan: &mut HChan<T>, value: T) {
        let id = self
            .scheduler
            .current_id()
            .expect("chansend called outside a running task");
        let ok: Cell<Option<bool>> = Cell::new(None);
        let mut slot = MaybeUninit::new(value);
        let elem_addr = core::ptr::addr_of_mut!(slot).cast::<u8>() as usize;
        let Some(mut sudog) = self.scheduler.sudog_pool_mut().acquire(id, elem_addr, 0) else {
            fatal(&self.host, Fatal::SudogPoolExhausted);
        };
        sudog.ok_slot = core::ptr::addr_of!(ok) as usize;
        chan.park_sender(sudog);
        self.scheduler.gopark(WaitReason::ChanSend);
        match ok.get() {
            Some(true) => {
                // The receiver read the value out of `slot` via a raw
                // pointer before waking us; `MaybeUninit` never auto-drops,
                // so there is nothing left to do.
            }
            Some(false) => {
                // Channel closed while parked: nobody ever read `slot`.
                // Safety: not consumed by any receiver, still initialized.
                unsafe { core::ptr::drop_in_place(slot.as_mut_ptr()) };
                self.gopanic(PanicValue::RuntimeError(String::from("send on closed channel")));
            }
            None => unreachable!("chansend resumed without its outcome set"),
        }
    }

    /// Receive a value from `chan`, blocking if none is available. The
    /// second element is `false` only when the channel is closed and empty,
    /// in which case the first is `T::default()`.
    ///
    /// # Panics
    /// Never in practice: `HChan::try_recv` cannot return a result this
    /// match doesn't account for.
    pub fn chanrecv<T: Default>(&mut self, chan: &mut HChan<T>) -> (T, bool) {
        match chan.try_recv() {
            (TryResult::Done, Some(value)) => {
                self.drain_woken(chan);
                (value, true)
            }
            (TryResult::ClosedEmpty, None) => (T::default(), false),
            (TryResult::WouldBlock, None) => self.block_recv(chan),
            _ => unreachable!("try_recv never pairs Done/ClosedEmpty status with the other's payload"),
        }
    }

    fn block_recv<T: Default>(&mut self, chan: &mut HChan<T>) -> (T, bool) {
        let id = self
            .scheduler
            .current_id()
            .expect("chanrecv called outside a running task");
        let ok: Cell<Option<bool>> = Cell::new(None);
        let mut slot: MaybeUninit<T> = MaybeUninit::uninit();
        let elem_addr = core::ptr::addr_of_mut!(slot).cast::<u8>() as usize;
        let Some(mut sudog) = self.scheduler.sudog_pool_mut().acquire(id, elem_addr, 0) else {
            fatal(&self.host, Fatal::SudogPoolExhausted);
        };
        sudog.ok_slot = core::ptr::addr_of!(ok) as usize;
        chan.park_receiver(sudog);
        self.scheduler.gopark(WaitReason::ChanRecv);
        match ok.get() {
            // Safety: a sender wrote a value through `elem_addr` before
            // waking us.
            Some(true) => (unsafe { slot.assume_init() }, true),
            Some(false) => (T::default(), false),
            None => unreachable!("chanrecv resumed without its outcome set"),
        }
    }

    /// Close `chan`, waking every parked waiter.
    ///
    /// # Panics
    /// Panics (via [`Runtime::gopanic`]) if `chan` is already closed.
    pub fn closechan<T>(&mut self, chan: &mut HChan<T>) {
        match chan.close() {
            Ok(woken) => {
                for w in woken {
                    self.scheduler.goready(w.g);
                    self.scheduler.sudog_pool_mut().release(w);
                }
            }
            Err(ChanError::CloseOfClosed) => {
                self.gopanic(PanicValue::RuntimeError(String::from("close of closed channel")));
            }
            Err(other) => unreachable!("HChan::close never fails with {other:?}"),
        }
    }

    /// Non-blocking send, for a `select` `default:` fast path. Returns
    /// whether it completed.
    ///
    /// # Panics
    /// Panics (via [`Runtime::gopanic`]) if `chan` is closed.
    pub fn selectnbsend<T>(&mut self, chan: &mut HChan<T>, value: T) -> bool {
        match chan.try_send(value) {
            SendOutcome::Done => {
                self.drain_woken(chan);
                true
            }
            SendOutcome::WouldBlock(_value) => false,
            SendOutcome::SendOnClosed(_value) => {
                self.gopanic(PanicValue::RuntimeError(String::from("send on closed channel")));
            }
        }
    }

    /// Non-blocking receive. `None` means nothing was ready; `Some((_, ok))`
    /// mirrors [`Runtime::chanrecv`]'s `ok`.
    ///
    /// # Panics
    /// Never in practice: `HChan::try_recv` cannot return a result this
    /// match doesn't account for.
    pub fn selectnbrecv<T: Default>(&mut self, chan: &mut HChan<T>) -> Option<(T, bool)> {
        match chan.try_recv() {
            (TryResult::Done, Some(value)) => {
                self.drain_woken(chan);
                Some((value, true))
            }
            (TryResult::ClosedEmpty, None) => Some((T::default(), false)),
            (TryResult::WouldBlock, None) => None,
            _ => unreachable!("try_recv never pairs Done/ClosedEmpty status with the other's payload"),
        }
    }

    // --- select -------------------------------------------------------

    /// Run a `select` over `cases`, blocking until exactly one fires, and
    /// return its index. An empty `cases` (`select {}`) blocks forever.
    pub fn selectgo(&mut self, mut cases: Vec<Box<dyn SelectCase>>) -> usize {
        match select::poll_once(&mut cases, self.scheduler.rng_mut()) {
            select::PollOutcome::Fired(idx) => idx,
            select::PollOutcome::Parked => loop {
                self.scheduler.gopark(WaitReason::Select);
                if let Some(idx) = cases.iter_mut().position(|c| c.try_once()) {
                    select::resolve_parked(&mut cases, idx);
                    return idx;
                }
                // Spurious wake with no case resolved: park again.
            },
        }
    }

    // --- interfaces -----------------------------------------------------

    /// Box `value` into an `Eface` for `ty`.
    pub fn convt2e(&mut self, ty: &'static Type, value: usize) -> Eface {
        iface::conv_t_to_e(&mut self.heap, &self.host, ty, value)
    }

    /// Resolve `eface` against `iface`, for a `v, ok := x.(Iface)` assertion.
    pub fn asserteface2i(&mut self, eface: Eface, iface: &'static InterfaceType) -> Option<Iface> {
        iface::assert_e_to_i(&mut self.itab_cache, eface, iface)
    }

    /// Resolve `(iface, concrete)` into an itab, for a call site a type
    /// checker has already proven satisfies `iface`.
    ///
    /// # Panics
    /// Panics if `concrete` does not actually implement `iface`: that would
    /// mean compiled code asserted a satisfied interface that isn't, an
    /// internal invariant violation rather than a data-dependent failure.
    pub fn requireitab(&mut self, iface: &'static InterfaceType, concrete: &'static Type) -> *const Itab {
        self.itab_cache
            .get_or_build(iface, concrete)
            .expect("requireitab called for a type that does not implement the interface")
    }

    // --- defer / panic / recover ---------------------------------------

    /// Push a deferred call onto the calling task's chain.
    ///
    /// # Panics
    /// Calls [`fatal`] with [`Fatal::DeferOverflow`] (never returns) if the
    /// chain is already at [`Config::max_defer_depth`].
    pub fn deferproc(&mut self, func: Box<dyn FnOnce(&mut G, &mut DeferPanicState)>) {
        let id = self.scheduler.current_id().expect("deferproc called outside a running task");
        let depth = {
            let task = self.scheduler.task(id).expect("current task id is always live");
            defer_panic::defer_depth(task)
        };
        if depth >= self.config.max_defer_depth {
            fatal(&self.host, Fatal::DeferOverflow);
        }
        let task = self.scheduler.task_mut(id).expect("current task id is always live");
        defer_panic::deferproc(task, func);
    }

    /// Run every deferred call registered on the calling task.
    ///
    /// # Panics
    /// If called outside a running task, or one whose defer/panic state was
    /// never set up via [`Runtime::newproc`] — both internal invariant
    /// violations rather than data-dependent failures.
    pub fn deferreturn(&mut self) {
        let id = self.scheduler.current_id().expect("deferreturn called outside a running task");
        let task = self.scheduler.task_mut(id).expect("current task id is always live");
        let state = self
            .defer_states
            .get_mut(&id)
            .expect("running task missing defer/panic state");
        defer_panic::run_defers(&self.host, task, state);
    }

    /// Raise a panic on the calling task. Never returns.
    ///
    /// # Panics
    /// Always, that is its purpose. Also panics (via `.expect`) if called
    /// outside a running task with defer/panic state set up.
    pub fn gopanic(&mut self, value: PanicValue) -> ! {
        let id = self.scheduler.current_id().expect("gopanic called outside a running task");
        let task = self.scheduler.task_mut(id).expect("current task id is always live");
        let state = self
            .defer_states
            .get_mut(&id)
            .expect("running task missing defer/panic state");
        defer_panic::gopanic(&self.host, task, state, value)
    }

    /// Recover the calling task's innermost unrecovered panic. Must only be
    /// called directly from a deferred function.
    ///
    /// # Panics
    /// If called outside a running task, or one whose defer/panic state was
    /// never set up via [`Runtime::newproc`].
    pub fn gorecover(&mut self) -> Option<PanicValue> {
        let id = self.scheduler.current_id().expect("gorecover called outside a running task");
        let task = self.scheduler.task_mut(id).expect("current task id is always live");
        let state = self
            .defer_states
            .get_mut(&id)
            .expect("running task missing defer/panic state");
        defer_panic::recover(task, state)
    }

    /// Run `body` as a protected call on behalf of task `id`: establishes a
    /// checkpoint so that if one of `body`'s deferred functions calls
    /// `gorecover` successfully, control returns here instead of continuing
    /// to unwind `body`'s own call stack.
    ///
    /// # Panics
    /// If `id` has no defer/panic state (it must have been returned by
    /// [`Runtime::newproc`]).
    pub fn protected_call(&mut self, id: TaskId, body: impl FnOnce(&mut Self)) {
        let ret = {
            let state = self
                .defer_states
                .get_mut(&id)
                .expect("running task missing defer/panic state");
            // Safety: paired with the `uncheckpoint` call below on every
            // path that doesn't instead longjmp back to this exact point.
            unsafe { defer_panic::checkpoint(state) }
        };
        if ret == 0 {
            body(self);
            let state = self
                .defer_states
                .get_mut(&id)
                .expect("running task missing defer/panic state");
            defer_panic::uncheckpoint(state);
        }
        // ret != 0: a recovered panic jumped back here; `unwind_to_checkpoint`
        // already popped the checkpoint before doing so.
    }
}

/// A growable, bounds-checked view over a managed-heap-backed buffer of
/// `Copy` elements: the runtime rendering of `makeslice`/`growslice`'s
/// pointer+len+cap triple.
#[repr(C)]
pub struct ManagedSlice<T> {
    ptr: *mut T,
    pub len: usize,
    pub cap: usize,
}

impl<T> ManagedSlice<T> {
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // Safety: `ptr` was allocated by `Runtime::makeslice` for at least
        // `cap` elements, and `len <= cap` is an invariant of every
        // constructor in this module.
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // Safety: as above, with exclusive access via `&mut self`.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

// Safety: a `ManagedSlice` is only ever touched by the single cooperative
// scheduler thread that allocated it.
unsafe impl<T> Send for ManagedSlice<T> {}

// --- select cases -------------------------------------------------------

/// A `select` receive case over `chan`.
pub struct RecvCase<T> {
    chan: *mut HChan<T>,
    sched: *mut Scheduler,
    task_id: TaskId,
    result: Rc<RefCell<Option<(T, bool)>>>,
    ok: Rc<Cell<Option<bool>>>,
    slot: MaybeUninit<T>,
    parked: bool,
}

impl<T: Default + 'static> RecvCase<T> {
    /// Build a boxed case plus the output handle the caller keeps to read
    /// the result back out after [`Runtime::selectgo`] returns.
    ///
    /// `chan` and `sched` must outlive the whole `selectgo` call; both are
    /// owned by the caller, which holds `&mut Runtime` across that call.
    pub fn new(
        chan: &mut HChan<T>,
        sched: &mut Scheduler,
        task_id: TaskId,
    ) -> (Box<dyn SelectCase>, Rc<RefCell<Option<(T, bool)>>>) {
        let result = Rc::new(RefCell::new(None));
        let case = Self {
            chan,
            sched,
            task_id,
            result: result.clone(),
            ok: Rc::new(Cell::new(None)),
            slot: MaybeUninit::uninit(),
            parked: false,
        };
        (Box::new(case), result)
    }
}

impl<T: Default> SelectCase for RecvCase<T> {
    fn try_once(&mut self) -> bool {
        if self.parked {
            return match self.ok.get() {
                // Safety: a sender wrote a value through `slot` before
                // waking us, signaled by `ok` carrying `Some(true)`.
                Some(true) => {
                    let value = unsafe { self.slot.assume_init_read() };
                    *self.result.borrow_mut() = Some((value, true));
                    self.parked = false;
                    true
                }
                Some(false) => {
                    *self.result.borrow_mut() = Some((T::default(), false));
                    self.parked = false;
                    true
                }
                None => false,
            };
        }
        // Safety: `chan`/`sched` outlive this whole `selectgo` call, owned
        // by the caller across it.
        let chan = unsafe { &mut *self.chan };
        match chan.try_recv() {
            (TryResult::Done, Some(value)) => {
                // Safety: as above.
                let sched = unsafe { &mut *self.sched };
                for w in chan.take_woken() {
                    sched.goready(w.g);
                    sched.sudog_pool_mut().release(w);
                }
                *self.result.borrow_mut() = Some((value, true));
                true
            }
            (TryResult::ClosedEmpty, None) => {
                *self.result.borrow_mut() = Some((T::default(), false));
                true
            }
            (TryResult::WouldBlock, None) => false,
            _ => unreachable!("try_recv never pairs Done/ClosedEmpty status with the other's payload"),
        }
    }

    fn park(&mut self) {
        // Safety: see `try_once`.
        let chan = unsafe { &mut *self.chan };
        // Safety: see `try_once`.
        let sched = unsafe { &mut *self.sched };
        let elem_addr = self.slot.as_mut_ptr() as usize;
        let chan_addr = self.chan as usize;
        let Some(mut sudog) = sched.sudog_pool_mut().acquire(self.task_id, elem_addr, chan_addr) else {
            // No pool slot to park with: this case simply never becomes
            // ready, the same outcome as a channel that stays empty.
            return;
        };
        sudog.is_select = true;
        sudog.ok_slot = Rc::as_ptr(&self.ok) as usize;
        chan.park_receiver(sudog);
        self.parked = true;
    }

    fn unpark(&mut self) {
        if !self.parked {
            return;
        }
        // Safety: see `try_once`.
        let chan = unsafe { &mut *self.chan };
        let elem_addr = self.slot.as_mut_ptr() as usize;
        if let Some(sudog) = chan.cancel_recv_waiter(elem_addr) {
            // Safety: see `try_once`.
            let sched = unsafe { &mut *self.sched };
            sched.sudog_pool_mut().release(sudog);
        }
        self.parked = false;
    }
}

/// A `select` send case over `chan`, carrying the value to send.
pub struct SendCase<T> {
    chan: *mut HChan<T>,
    sched: *mut Scheduler,
    task_id: TaskId,
    /// `Some(true)` once sent, `Some(false)` if the channel turned out to be
    /// closed (the caller must then panic, mirroring `chansend`'s behavior).
    result: Rc<RefCell<Option<bool>>>,
    ok: Rc<Cell<Option<bool>>>,
    slot: MaybeUninit<T>,
    parked: bool,
    consumed: bool,
}

impl<T: 'static> SendCase<T> {
    pub fn new(
        chan: &mut HChan<T>,
        sched: &mut Scheduler,
        task_id: TaskId,
        value: T,
    ) -> (Box<dyn SelectCase>, Rc<RefCell<Option<bool>>>) {
        let result = Rc::new(RefCell::new(None));
        let case = Self {
            chan,
            sched,
            task_id,
            result: result.clone(),
            ok: Rc::new(Cell::new(None)),
            slot: MaybeUninit::new(value),
            parked: false,
            consumed: false,
        };
        (Box::new(case), result)
    }
}

impl<T> SelectCase for SendCase<T> {
    fn try_once(&mut self) -> bool {
        if self.parked {
            return match self.ok.get() {
                Some(true) => {
                    self.consumed = true;
                    *self.result.borrow_mut() = Some(true);
                    self.parked = false;
                    true
                }
                Some(false) => {
                    *self.result.borrow_mut() = Some(false);
                    self.parked = false;
                    true
                }
                None => false,
            };
        }
        // Safety: `chan`/`sched` outlive this whole `selectgo` call; `slot`
        // still holds the value from construction, since this branch only
        // runs once, on the very first (unparked) poll.
        let chan = unsafe { &mut *self.chan };
        // Safety: as above.
        let value = unsafe { self.slot.as_ptr().read() };
        match chan.try_send(value) {
            SendOutcome::Done => {
                self.consumed = true;
                // Safety: see above.
                let sched = unsafe { &mut *self.sched };
                for w in chan.take_woken() {
                    sched.goready(w.g);
                    sched.sudog_pool_mut().release(w);
                }
                *self.result.borrow_mut() = Some(true);
                true
            }
            SendOutcome::WouldBlock(value) => {
                // Safety: writing the un-sent value back to its own slot.
                unsafe { self.slot.as_mut_ptr().write(value) };
                false
            }
            SendOutcome::SendOnClosed(_value) => {
                self.consumed = true;
                *self.result.borrow_mut() = Some(false);
                true
            }
        }
    }

    fn park(&mut self) {
        // Safety: see `try_once`.
        let chan = unsafe { &mut *self.chan };
        // Safety: see `try_once`.
        let sched = unsafe { &mut *self.sched };
        let elem_addr = self.slot.as_mut_ptr() as usize;
        let chan_addr = self.chan as usize;
        let Some(mut sudog) = sched.sudog_pool_mut().acquire(self.task_id, elem_addr, chan_addr) else {
            return;
        };
        sudog.is_select = true;
        sudog.ok_slot = Rc::as_ptr(&self.ok) as usize;
        chan.park_sender(sudog);
        self.parked = true;
    }

    fn unpark(&mut self) {
        if !self.parked {
            return;
        }
        // Safety: see `try_once`.
        let chan = unsafe { &mut *self.chan };
        let elem_addr = self.slot.as_mut_ptr() as usize;
        if let Some(sudog) = chan.cancel_send_waiter(elem_addr) {
            // Safety: see `try_once`.
            let sched = unsafe { &mut *self.sched };
            sched.sudog_pool_mut().release(sudog);
        }
        self.parked = false;
    }
}

impl<T> Drop for SendCase<T> {
    fn drop(&mut self) {
        if !self.consumed {
            // Safety: never consumed means `slot` still holds either the
            // original value (never sent) or a value written back to it
            // by a `WouldBlock` outcome (withdrawn once a sibling case won).
            unsafe { core::ptr::drop_in_place(self.slot.as_mut_ptr()) };
        }
    }
}

// --- maps -----------------------------------------------------------------
//
// `HMap` itself never needs heap-managed storage (it owns its buckets
// through the host allocator, the same way `HChan` owns its wait queues), so
// these wrappers are plain functions; only `makemap`'s seed draw needs the
// scheduler's shared PRNG.

impl<H: Host> Runtime<H> {
    pub fn makemap<K: Hash + Eq, V>(&mut self) -> HMap<K, V> {
        HMap::new(self.scheduler.rng_mut().fastrand64())
    }

    /// Build a randomized-order snapshot iterator over `map`'s entries.
    /// `Iterator::next` plays the role of `mapiternext`.
    pub fn mapiterinit<K: Hash + Eq + Clone, V: Clone>(&mut self, map: &HMap<K, V>) -> hmap::iter::Iter<K, V> {
        hmap::iter::iter(map, self.scheduler.rng_mut())
    }
}

#[must_use]
pub fn mapaccess1<K: Hash + Eq, V: Default + Clone>(map: &HMap<K, V>, key: &K) -> V {
    map.get(key).cloned().unwrap_or_default()
}

#[must_use]
pub fn mapaccess2<K: Hash + Eq, V: Default + Clone>(map: &HMap<K, V>, key: &K) -> (V, bool) {
    match map.get(key) {
        Some(v) => (v.clone(), true),
        None => (V::default(), false),
    }
}

/// Assign `key -> value` into `map`.
///
/// # Panics
/// Calls [`fatal`] with [`Fatal::NilMapAssignment`] (never returns) if `map`
/// is `None`.
pub fn mapassign<K: Hash + Eq, V>(host: &impl Host, map: Option<&mut HMap<K, V>>, key: K, value: V) {
    match map {
        Some(m) => {
            m.insert(key, value);
        }
        None => fatal(host, Fatal::NilMapAssignment),
    }
}

pub fn mapdelete<K: Hash + Eq, V>(map: Option<&mut HMap<K, V>>, key: &K) -> Option<V> {
    map.and_then(|m| m.remove(key))
}

#[must_use]
pub fn maplen<K, V>(map: Option<&HMap<K, V>>) -> usize {
    map.map_or(0, HMap::len)
}

pub fn mapclear<K: Hash + Eq, V>(map: Option<&mut HMap<K, V>>) {
    if let Some(m) = map {
        m.clear();
    }
}

// --- raw memory / hashing --------------------------------------------------

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    let mut h = seed ^ 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

/// Copy one `ty`-shaped value from `src` to `dst`.
///
/// # Safety
/// `dst`/`src` must each be valid for `ty.size` bytes and must not overlap.
pub unsafe fn typedmemmove(ty: &'static Type, dst: *mut u8, src: *const u8) {
    // Safety: delegated to caller.
    unsafe { core::ptr::copy_nonoverlapping(src, dst, ty.size) };
}

/// Zero `size` bytes starting at `ptr`.
///
/// # Safety
/// `ptr` must be valid for writes of `size` bytes.
pub unsafe fn memclr(ptr: *mut u8, size: usize) {
    // Safety: delegated to caller.
    unsafe { core::ptr::write_bytes(ptr, 0, size) };
}

/// Compare two `ty`-shaped values, using the type's `equal_fn` if it has one
/// (needed for e.g. string/interface fields whose bytes alone don't
/// determine equality) and falling back to a byte comparison otherwise.
///
/// # Safety
/// `a`/`b` must each be valid for reads of `ty.size` bytes.
pub unsafe fn memequal(ty: &'static Type, a: *const u8, b: *const u8) -> bool {
    if let Some(eq) = ty.equal_fn {
        return eq(a, b);
    }
    // Safety: delegated to caller.
    unsafe { core::slice::from_raw_parts(a, ty.size) == core::slice::from_raw_parts(b, ty.size) }
}

/// Hash a `ty`-shaped value, using its `hash_fn` if it has one, falling back
/// to an FNV-1a hash of its raw bytes.
///
/// # Safety
/// `ptr` must be valid for reads of `ty.size` bytes.
pub unsafe fn memhash(ty: &'static Type, ptr: *const u8, seed: u64) -> u64 {
    if let Some(h) = ty.hash_fn {
        return h(ptr, seed);
    }
    // Safety: delegated to caller.
    let bytes = unsafe { core::slice::from_raw_parts(ptr, ty.size) };
    fnv1a(bytes, seed)
}

#[must_use]
pub fn strhash(s: &str, seed: u64) -> u64 {
    fnv1a(s.as_bytes(), seed)
}

#[must_use]
pub fn f32hash(v: f32, seed: u64) -> u64 {
    fnv1a(&v.to_ne_bytes(), seed)
}

#[must_use]
pub fn f64hash(v: f64, seed: u64) -> u64 {
    fnv1a(&v.to_ne_bytes(), seed)
}

#[must_use]
pub fn interhash(iface: Iface, seed: u64) -> u64 {
    fnv1a(&iface.data.to_ne_bytes(), seed)
}

#[must_use]
pub fn nilinterhash(eface: Eface, seed: u64) -> u64 {
    fnv1a(&eface.data.to_ne_bytes(), seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::test_host::StdHost;
    use crate::types::{Kind, KindFlags};

    fn runtime() -> Runtime<StdHost> {
        Runtime::new(StdHost::new(), Config::default(), 7)
    }

    static LEAF_TYPE: Type = Type {
        size: 8,
        ptrdata: 0,
        align: 8,
        field_align: 8,
        kind: Kind::Struct,
        kind_flags: KindFlags::empty(),
        equal_fn: None,
        hash_fn: None,
        gcdata: &[],
        name: "Leaf",
        pkg_path: "",
        methods: &[],
    };

    #[test]
    fn newobject_returns_zeroed_storage() {
        let mut rt = runtime();
        let ptr = rt.newobject(&LEAF_TYPE);
        // Safety: just allocated for `LEAF_TYPE.size` bytes.
        let bytes = unsafe { core::slice::from_raw_parts(ptr, LEAF_TYPE.size) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn makeslice_then_growslice_preserves_contents() {
        let mut rt = runtime();
        let mut s = rt.makeslice::<u32>(3, 4);
        s.as_mut_slice().copy_from_slice(&[1, 2, 3]);
        let grown = rt.growslice(&s, 10);
        assert_eq!(grown.as_slice(), &[1, 2, 3]);
        assert!(grown.cap >= 10);
    }

    #[test]
    fn buffered_chansend_then_chanrecv_does_not_block() {
        let mut rt = runtime();
        let mut chan: HChan<u32> = HChan::new(1).unwrap();
        rt.chansend(&mut chan, 42);
        let (v, ok) = rt.chanrecv(&mut chan);
        assert_eq!(v, 42);
        assert!(ok);
    }

    #[test]
    fn chanrecv_on_closed_empty_channel_gets_zero_value() {
        let mut rt = runtime();
        let mut chan: HChan<u32> = HChan::new(1).unwrap();
        rt.closechan(&mut chan);
        let (v, ok) = rt.chanrecv(&mut chan);
        assert_eq!(v, 0);
        assert!(!ok);
    }

    #[test]
    fn map_roundtrip_through_abi_wrappers() {
        let mut rt = runtime();
        let mut map: HMap<u32, u32> = rt.makemap();
        mapassign(rt.host(), Some(&mut map), 1, 100);
        assert_eq!(mapaccess1(&map, &1), 100);
        assert_eq!(mapaccess2(&map, &2), (0, false));
        assert_eq!(maplen(Some(&map)), 1);
        assert_eq!(mapdelete(Some(&mut map), &1), Some(100));
        assert_eq!(maplen(Some(&map)), 0);
    }

    #[test]
    fn mapassign_on_nil_map_is_fatal() {
        let rt = runtime();
        let result = std::panic::catch_unwind(|| {
            let mut nil: Option<HMap<u32, u32>> = None;
            mapassign(rt.host(), nil.as_mut(), 1, 1);
        });
        assert!(result.is_err());
    }

    #[test]
    fn defer_then_panic_recovers_via_protected_call() {
        // Mirrors `sched::tests`' thread-local-pointer pattern: a spawned
        // task's entry function has no way to reach `&mut Runtime` other
        // than through a pointer the test stashes before calling `run()`.
        std::thread_local! {
            static RT_PTR: Cell<*mut Runtime<StdHost>> = const { Cell::new(core::ptr::null_mut()) };
            static RECOVERED: RefCell<Option<String>> = const { RefCell::new(None) };
        }

        extern "C" fn body(_arg: usize) -> ! {
            // Safety: set by the test immediately before `run()` is called.
            let rt = unsafe { &mut *RT_PTR.with(Cell::get) };
            let id = rt
                .scheduler
                .current_id()
                .expect("running inside a task the scheduler just dispatched");
            rt.protected_call(id, |rt| {
                rt.deferproc(Box::new(|task, state| {
                    if let Some(value) = defer_panic::recover(task, state) {
                        RECOVERED.with(|r| *r.borrow_mut() = Some(value.format()));
                    }
                }));
                rt.gopanic(PanicValue::Message(String::from("boom")));
            });
            rt.goexit()
        }

        let mut rt = runtime();
        RT_PTR.with(|c| c.set(&mut rt));
        rt.newproc(body, 0);
        rt.run();

        assert_eq!(RECOVERED.with(|r| r.borrow().clone()), Some(String::from("boom")));
    }
}
