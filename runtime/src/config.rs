//! Runtime configuration knobs.
//!
//! Kept as a plain `Config` value constructed once at boot and handed to
//! every subsystem, since there is exactly one thread of execution and
//! therefore no need for synchronized global state.

/// Default size of each semi-space, in bytes.
pub const DEFAULT_SEMISPACE_SIZE: usize = 2 * 1024 * 1024;
/// Default large-object threshold, in bytes.
pub const DEFAULT_LARGE_THRESHOLD: usize = 64 * 1024;
/// Default task stack size, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Default guard region reserved at the low end of a stack.
pub const DEFAULT_STACK_GUARD: usize = 256;
/// Default `gcPercent`: collect once used heap crosses this fraction of a
/// semi-space. `-1` disables automatic collection.
pub const DEFAULT_GC_PERCENT: i32 = 100;
/// Safety margin applied on top of `gcPercent`; see [`Config::gc_threshold`].
const GC_SAFETY_NUMERATOR: usize = 75;
const GC_SAFETY_DENOMINATOR: usize = 100;

/// Maximum nested `defer` records per task.
pub const MAX_DEFER_DEPTH: usize = 1000;
/// Maximum recursive (unrecovered) panics before a fatal error.
pub const MAX_RECURSIVE_PANICS: usize = 5;
/// Capacity of the pooled sudog free list.
pub const SUDOG_POOL_CAP: usize = 128;
/// Dead tasks are only reclaimed after this many scheduler generations.
pub const DEAD_TASK_GRACE_GENERATIONS: u64 = 2;
/// Safety cap on evacuation steps per map operation, guards against a
/// pathological incremental-grow loop.
pub const MAP_EVACUATION_SAFETY_CAP: usize = 1 << 16;
/// Bound on conservative stack scanning, in bytes.
pub const GC_STACK_SCAN_MAX: usize = 256 * 1024;
/// Maximum chunk of from-space cache invalidation drained per scheduler tick.
pub const GC_INVALIDATE_CHUNK: usize = 64 * 1024;

/// The three pooled stack size classes, smallest first. The top class
/// covers [`DEFAULT_STACK_SIZE`] plus [`DEFAULT_STACK_GUARD`], since every
/// default-sized task spawn requests exactly that many bytes and must still
/// get a real size-class hit, not a fallback to an unpooled exact allocation.
pub const STACK_SIZE_CLASSES: [usize; 3] =
    [8 * 1024, 32 * 1024, 64 * 1024 + DEFAULT_STACK_GUARD];
/// Per-class cap on how many freed stacks are kept in the pool before being
/// released back to the host allocator.
pub const STACK_POOL_CAP_PER_CLASS: usize = 16;

/// Maximum buffered channel capacity.
pub const MAX_CHAN_CAP: usize = 65536;
/// Maximum channel element size.
pub const MAX_CHAN_ELEM_SIZE: usize = 65536;

/// Process-wide runtime configuration.
///
/// Constructed once at boot (typically via [`Config::default`], optionally
/// adjusted) and then treated as immutable; the one knob that legitimately
/// changes at runtime is [`Config::gc_percent`], exposed mutably so a
/// caller can tune collection frequency on the fly.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub semispace_size: usize,
    pub large_object_threshold: usize,
    pub stack_guard: usize,
    pub gc_percent: i32,
    pub max_defer_depth: usize,
    pub max_recursive_panics: usize,
    pub sudog_pool_cap: usize,
    pub dead_task_grace_generations: u64,
    pub map_evacuation_safety_cap: usize,
    pub gc_stack_scan_max: usize,
}

impl Config {
    /// The byte threshold at which allocation should trigger a collection,
    /// or `None` if automatic collection is disabled (`gc_percent < 0`).
    #[must_use]
    pub fn gc_threshold(&self) -> Option<usize> {
        if self.gc_percent < 0 {
            return None;
        }
        #[expect(
            clippy::cast_sign_loss,
            reason = "gc_percent < 0 was just ruled out above"
        )]
        let percent = self.gc_percent as usize;
        // `gc_percent` scales the *safety-margined* threshold, not the raw
        // semi-space size: the default of 100% still collects at 75% usage,
        // leaving headroom before the space is actually full.
        let threshold = self
            .semispace_size
            .saturating_mul(percent)
            .saturating_mul(GC_SAFETY_NUMERATOR)
            / (100 * GC_SAFETY_DENOMINATOR);
        Some(threshold.min(self.semispace_size))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            semispace_size: DEFAULT_SEMISPACE_SIZE,
            large_object_threshold: DEFAULT_LARGE_THRESHOLD,
            stack_guard: DEFAULT_STACK_GUARD,
            gc_percent: DEFAULT_GC_PERCENT,
            max_defer_depth: MAX_DEFER_DEPTH,
            max_recursive_panics: MAX_RECURSIVE_PANICS,
            sudog_pool_cap: SUDOG_POOL_CAP,
            dead_task_grace_generations: DEAD_TASK_GRACE_GENERATIONS,
            map_evacuation_safety_cap: MAP_EVACUATION_SAFETY_CAP,
            gc_stack_scan_max: GC_STACK_SCAN_MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn default_threshold_is_75_percent() {
        let cfg = Config::default();
        assert_eq!(cfg.gc_threshold(), Some(cfg.semispace_size * 3 / 4));
    }

    #[test]
    fn negative_percent_disables_gc() {
        let cfg = Config {
            gc_percent: -1,
            ..Config::default()
        };
        assert_eq!(cfg.gc_threshold(), None);
    }
}
