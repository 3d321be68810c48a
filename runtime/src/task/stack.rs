//! Size-classed stack pool.
//!
//! A stack-abstraction trait plus a free-list pool, generalized from a
//! single fixed size to three size classes so short-lived tasks don't pay
//! for a full-size stack.

use crate::config::{Config, STACK_SIZE_CLASSES};
use alloc::vec::Vec;

/// Sentinel [`Stack::class`] value for a stack whose requested size exceeded
/// every pooled size class: allocated at its exact size and never pooled,
/// since there is no free list for an arbitrary one-off size.
const EXACT_ALLOC: usize = usize::MAX;

/// A heap-backed task stack. Freed stacks are returned to [`StackPool`]
/// instead of the host allocator, up to a per-class cap.
pub struct Stack {
    mem: Vec<u8>,
    class: usize,
}

impl Stack {
    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    #[must_use]
    pub fn bounds(&self) -> (usize, usize) {
        let lo = self.mem.as_ptr() as usize;
        (lo, lo + self.mem.len())
    }

    #[must_use]
    pub fn class(&self) -> usize {
        self.class
    }
}

/// Per-size-class free lists of released stacks.
pub struct StackPool {
    free: [Vec<Stack>; 3],
    caps: [usize; 3],
}

impl StackPool {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let _ = config;
        Self {
            free: [Vec::new(), Vec::new(), Vec::new()],
            caps: [
                crate::config::STACK_POOL_CAP_PER_CLASS,
                crate::config::STACK_POOL_CAP_PER_CLASS,
                crate::config::STACK_POOL_CAP_PER_CLASS,
            ],
        }
    }

    fn class_for(requested: usize) -> Option<usize> {
        STACK_SIZE_CLASSES.iter().position(|&sz| sz >= requested)
    }

    /// Acquire a stack of at least `requested` bytes, reusing a pooled one
    /// of the matching size class when available. A request larger than
    /// every pooled class is satisfied with an exact, unpooled allocation
    /// rather than silently handing back a smaller-than-requested stack.
    pub fn acquire(&mut self, requested: usize) -> Stack {
        let Some(class) = Self::class_for(requested) else {
            return Stack {
                mem: alloc::vec![0u8; requested],
                class: EXACT_ALLOC,
            };
        };
        if let Some(stack) = self.free[class].pop() {
            return stack;
        }
        Stack {
            mem: alloc::vec![0u8; STACK_SIZE_CLASSES[class]],
            class,
        }
    }

    /// Return a stack to the pool, or drop it if its class's free list is
    /// already at [`crate::config::STACK_POOL_CAP_PER_CLASS`], or if it was
    /// an exact, unpooled allocation to begin with.
    pub fn release(&mut self, stack: Stack) {
        let class = stack.class;
        if class == EXACT_ALLOC {
            return;
        }
        if self.free[class].len() < self.caps[class] {
            self.free[class].push(stack);
        }
    }

    #[must_use]
    pub fn pooled_count(&self, class: usize) -> usize {
        self.free[class].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_picks_smallest_sufficient_class() {
        let mut pool = StackPool::new(&Config::default());
        let stack = pool.acquire(4000);
        assert_eq!(stack.class(), 0);
        assert_eq!(stack.bounds().1 - stack.bounds().0, STACK_SIZE_CLASSES[0]);
    }

    #[test]
    fn request_past_every_class_gets_an_exact_unpooled_allocation() {
        let mut pool = StackPool::new(&Config::default());
        let requested = 1 << 20;
        let stack = pool.acquire(requested);
        assert_eq!(stack.class(), EXACT_ALLOC);
        assert_eq!(stack.bounds().1 - stack.bounds().0, requested);

        // Releasing it must not get pushed onto any size-class free list.
        pool.release(stack);
        assert_eq!(pool.pooled_count(0), 0);
        assert_eq!(pool.pooled_count(1), 0);
        assert_eq!(pool.pooled_count(2), 0);
    }

    #[test]
    fn default_spawn_size_hits_the_top_class_exactly() {
        let mut pool = StackPool::new(&Config::default());
        let requested = crate::config::DEFAULT_STACK_SIZE + crate::config::DEFAULT_STACK_GUARD;
        let stack = pool.acquire(requested);
        assert_eq!(stack.class(), STACK_SIZE_CLASSES.len() - 1);
        assert!(stack.bounds().1 - stack.bounds().0 >= requested);
    }

    #[test]
    fn released_stack_is_reused() {
        let mut pool = StackPool::new(&Config::default());
        let stack = pool.acquire(4000);
        let ptr_before = stack.bounds().0;
        pool.release(stack);
        assert_eq!(pool.pooled_count(0), 1);
        let stack2 = pool.acquire(4000);
        assert_eq!(stack2.bounds().0, ptr_before, "pooled stack should be reused, not reallocated");
    }

    #[test]
    fn pool_cap_is_enforced() {
        let mut pool = StackPool::new(&Config::default());
        for _ in 0..(crate::config::STACK_POOL_CAP_PER_CLASS + 4) {
            pool.release(pool_stack_of_class0());
        }
        assert_eq!(pool.pooled_count(0), crate::config::STACK_POOL_CAP_PER_CLASS);
    }

    fn pool_stack_of_class0() -> Stack {
        Stack {
            mem: alloc::vec![0u8; STACK_SIZE_CLASSES[0]],
            class: 0,
        }
    }
}
