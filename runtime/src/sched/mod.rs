//! Cooperative M:1 scheduler: a FIFO run queue feeding a single dispatch
//! loop, generalized from a future-polling executor to a stackful
//! context-switching one: instead of polling a `Future`, each tick resumes
//! a parked task's saved CPU context directly.

pub mod graveyard;
pub mod timer;

use crate::config::Config;
use crate::error::Host;
use crate::heap::gc::ScanContext;
use crate::heap::{Heap, root::RootRegistry};
use crate::sudog::SudogPool;
use crate::task::context::TaskContext;
use crate::task::stack::StackPool;
use crate::task::{TaskId, TaskStatus, WaitReason, G};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use graveyard::Graveyard;
use micrort_fastrand::FastRand;
use timer::{TimerAction, TimerHeap};

/// Maximum dead tasks reclaimed from the graveyard per scheduler tick.
const GRAVEYARD_RECLAIM_PER_TICK: usize = 8;

/// The whole cooperative runtime's task state: every task, the run queue,
/// timers, and the pools backing them.
pub struct Scheduler {
    tasks: Vec<Option<G>>,
    run_queue: VecDeque<TaskId>,
    current: Option<TaskId>,
    /// Context of the scheduler's own dispatch loop; every task's context
    /// switch ultimately resumes here.
    scheduler_ctx: TaskContext,
    stack_pool: StackPool,
    sudog_pool: SudogPool,
    timers: TimerHeap,
    graveyard: Graveyard,
    roots: RootRegistry,
    generation: u64,
    rng: FastRand,
    config: Config,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: Config, rng_seed: u64) -> Self {
        Self {
            tasks: Vec::new(),
            run_queue: VecDeque::new(),
            current: None,
            scheduler_ctx: TaskContext::new(),
            stack_pool: StackPool::new(&config),
            sudog_pool: SudogPool::new(config.sudog_pool_cap),
            timers: TimerHeap::new(),
            graveyard: Graveyard::new(config.dead_task_grace_generations),
            roots: RootRegistry::new(),
            generation: 0,
            rng: FastRand::from_seed(rng_seed),
            config,
        }
    }

    #[must_use]
    pub fn num_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_some()).count()
    }

    #[must_use]
    pub fn current_id(&self) -> Option<TaskId> {
        self.current
    }

    /// Look up a task by id, for callers (the ABI surface) that need to
    /// reach its defer/panic chain or other fields directly.
    #[must_use]
    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut G> {
        self.tasks.get_mut(id as usize).and_then(Option::as_mut)
    }

    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&G> {
        self.tasks.get(id as usize).and_then(Option::as_ref)
    }

    /// Create a new task running `entry(arg)`, scheduling it to run.
    pub fn spawn(&mut self, entry: extern "C" fn(usize) -> !, arg: usize) -> TaskId {
        let id = self.tasks.len() as TaskId;
        let stack = self
            .stack_pool
            .acquire(crate::config::DEFAULT_STACK_SIZE + self.config.stack_guard);
        let mut g = G::new(id);
        g.prepare(stack, entry, arg);
        self.tasks.push(Some(g));
        self.run_queue.push_back(id);
        id
    }

    /// Mark `id` runnable and enqueue it (called when a channel operation or
    /// timer completes a waiter's transfer).
    pub fn goready(&mut self, id: TaskId) {
        let g = self.task_mut(id).expect("goready called with a dead or unknown task id");
        if g.status != TaskStatus::Waiting && g.status != TaskStatus::Idle {
            return;
        }
        g.status = TaskStatus::Runnable;
        self.run_queue.push_back(id);
        tracing::trace!(task = id, "goready");
    }

    /// Park the currently running task with `reason`, switching control
    /// back to the dispatch loop. Returns once the task is resumed by a
    /// later `goready`.
    ///
    /// # Panics
    /// If called with no task currently running.
    pub fn gopark(&mut self, reason: WaitReason) {
        let id = self.current.expect("gopark called outside a running task");
        {
            let g = self.task_mut(id).expect("current task id is always live");
            g.status = TaskStatus::Waiting;
            g.wait_reason = reason;
        }
        tracing::trace!(task = id, ?reason, "gopark");
        // Safety: `scheduler_ctx` is owned by `self` for the duration of
        // `run()`, which is the only caller that ever resumes a task
        // context; no other borrow of `self` is alive across this switch.
        let sched_ctx: *const TaskContext = &self.scheduler_ctx;
        let g = self.task_mut(id).expect("current task id is always live");
        unsafe { g.context.switch_to(&*sched_ctx) };
    }

    /// Cooperative yield: re-enqueue the current task and let others run.
    pub fn gosched(&mut self) {
        let id = self.current.expect("gosched called outside a running task");
        {
            let g = self.task_mut(id).expect("current task id is always live");
            g.status = TaskStatus::Runnable;
        }
        self.run_queue.push_back(id);
        let sched_ctx: *const TaskContext = &self.scheduler_ctx;
        let g = self.task_mut(id).expect("current task id is always live");
        unsafe { g.context.switch_to(&*sched_ctx) };
    }

    /// Terminate the currently running task. Never returns: control passes
    /// back to the dispatch loop.
    pub fn task_exit(&mut self) -> ! {
        let id = self.current.expect("task_exit called outside a running task");
        let generation = self.generation;
        {
            let g = self.task_mut(id).expect("current task id is always live");
            g.status = TaskStatus::Dead;
            g.death_generation = Some(generation);
            if let Some(stack) = g.stack.take() {
                self.stack_pool.release(stack);
            }
        }
        self.graveyard.bury(id, generation);
        let sched_ctx: *const TaskContext = &self.scheduler_ctx;
        let g = self.task_mut(id).expect("current task id is always live");
        // Safety: same contract as `gopark`; this switch never returns to
        // the task, matching `task_exit`'s `-> !` signature.
        unsafe { g.context.switch_to(&*sched_ctx) }
        unreachable!("a dead task's context must never be resumed")
    }

    fn tick(&mut self, host: &impl Host) {
        self.generation += 1;
        let now = host.now_micros();
        for action in self.timers.expired(now) {
            match action {
                TimerAction::Wake(id) => self.goready(id),
                TimerAction::Callback { callback, arg, .. } => callback(arg),
            }
        }
        let reclaimed = self.graveyard.reclaim(self.generation, GRAVEYARD_RECLAIM_PER_TICK);
        for id in reclaimed {
            self.tasks[id as usize] = None;
        }
    }

    /// Arm a one-shot wake for the current task after `micros_from_now`
    /// microseconds, then park it.
    pub fn sleep(&mut self, host: &impl Host, micros_from_now: u64) {
        let id = self.current.expect("sleep called outside a running task");
        let deadline = host.now_micros() + micros_from_now;
        self.timers.add(deadline, TimerAction::Wake(id));
        self.gopark(WaitReason::Sleep);
    }

    /// Run every task to completion (or forever, if any task never exits).
    /// Returns once the run queue and timer heap are both empty. If the run
    /// queue and timers are both empty but a task is still parked waiting
    /// (on a channel or select, with no timer ever due to wake it), that
    /// task can never resume: reports `Fatal::Deadlock` instead of
    /// returning as if the program had finished cleanly.
    pub fn run(&mut self, host: &impl Host) {
        loop {
            self.tick(host);
            let Some(id) = self.run_queue.pop_front() else {
                if self.timers.is_empty() {
                    if self.tasks.iter().flatten().any(|g| g.status == TaskStatus::Waiting) {
                        crate::error::fatal(host, crate::error::Fatal::Deadlock);
                    }
                    return;
                }
                // Nothing runnable but a timer is still pending: let the
                // host idle until it fires. A bare-metal `Host` would WFI
                // here; the test host just spins the tick loop.
                continue;
            };
            if self.tasks[id as usize]
                .as_ref()
                .is_none_or(|g| g.status == TaskStatus::Dead)
            {
                continue;
            }
            self.current = Some(id);
            {
                let g = self.task_mut(id).expect("run_queue only holds live task ids");
                g.status = TaskStatus::Running;
            }
            let sched_ctx: *mut TaskContext = &mut self.scheduler_ctx;
            let g = self.task_mut(id).expect("run_queue only holds live task ids");
            // Safety: `scheduler_ctx` is exclusively owned by `self` and not
            // otherwise borrowed across this call.
            unsafe { (*sched_ctx).switch_to(&g.context) };
            self.current = None;
        }
    }

    /// Build a GC scan context covering every live task's stack and the
    /// global root registry.
    #[must_use]
    pub fn gc_scan_ranges(&self) -> Vec<(usize, usize)> {
        self.tasks
            .iter()
            .filter_map(Option::as_ref)
            .filter_map(G::stack_bounds)
            .collect()
    }

    #[must_use]
    pub fn roots(&self) -> &RootRegistry {
        &self.roots
    }

    #[must_use]
    pub fn roots_mut(&mut self) -> &mut RootRegistry {
        &mut self.roots
    }

    /// Run a collection using every live task's stack plus the root
    /// registry as GC roots.
    pub fn collect_garbage(&mut self, host: &impl Host, heap: &mut Heap) {
        let ranges = self.gc_scan_ranges();
        let ctx = ScanContext::new(&self.roots, &ranges);
        heap.collect(host, ctx);
    }

    #[must_use]
    pub fn sudog_pool_mut(&mut self) -> &mut SudogPool {
        &mut self.sudog_pool
    }

    #[must_use]
    pub fn rng_mut(&mut self) -> &mut FastRand {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::test_host::StdHost;
    use core::cell::Cell;

    std::thread_local! {
        static SCHED_PTR: Cell<*mut Scheduler> = const { Cell::new(core::ptr::null_mut()) };
    }

    extern "C" fn bump_and_exit(arg: usize) -> ! {
        // Safety: test-only access pattern; `SCHED_PTR` is set by the test
        // immediately before `run()` is called and cleared after.
        let sched = unsafe { &mut *SCHED_PTR.with(Cell::get) };
        let counter = arg as *const Cell<u32>;
        // Safety: `arg` is a valid `&Cell<u32>` for the duration of the test.
        unsafe { (*counter).set((*counter).get() + 1) };
        sched.task_exit()
    }

    #[test]
    fn spawned_tasks_run_to_completion() {
        let host = StdHost::new();
        let mut sched = Scheduler::new(Config::default(), 1);
        SCHED_PTR.with(|c| c.set(&mut sched));

        let counter = Cell::new(0u32);
        for _ in 0..3 {
            sched.spawn(bump_and_exit, core::ptr::addr_of!(counter) as usize);
        }
        sched.run(&host);

        assert_eq!(counter.get(), 3);
        assert_eq!(sched.num_tasks(), 3);
    }

    #[test]
    fn gosched_yields_and_resumes() {
        let host = StdHost::new();
        let mut sched = Scheduler::new(Config::default(), 2);
        SCHED_PTR.with(|c| c.set(&mut sched));

        extern "C" fn yields_once_then_exits(arg: usize) -> ! {
            let sched = unsafe { &mut *SCHED_PTR.with(Cell::get) };
            let counter = arg as *const Cell<u32>;
            sched.gosched();
            unsafe { (*counter).set((*counter).get() + 1) };
            sched.task_exit()
        }

        let counter = Cell::new(0u32);
        sched.spawn(yields_once_then_exits, core::ptr::addr_of!(counter) as usize);
        sched.run(&host);
        assert_eq!(counter.get(), 1);
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn parked_task_with_no_waker_is_a_fatal_deadlock() {
        let host = StdHost::new();
        let mut sched = Scheduler::new(Config::default(), 3);
        SCHED_PTR.with(|c| c.set(&mut sched));

        extern "C" fn parks_forever(_arg: usize) -> ! {
            let sched = unsafe { &mut *SCHED_PTR.with(Cell::get) };
            sched.gopark(WaitReason::ChanRecv);
            unreachable!("nothing ever wakes this task");
        }

        sched.spawn(parks_forever, 0);
        sched.run(&host);
    }
}
