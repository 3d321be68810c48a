//! Cheney copying collection.
//!
//! Root scanning distinguishes two sources: explicit roots (exact: the slot
//! is known to hold either zero or a valid heap pointer) and stack ranges
//! (conservative: every aligned word that happens to fall inside the
//! current from-space is treated as a possible pointer and relocated, the
//! standard over-approximation a copying collector without full stack maps
//! has to make).

use super::{Heap, ObjHeader, HEADER_SIZE};
use crate::error::Host;
use crate::heap::root::RootRegistry;

/// Everything the collector needs to find roots for one collection: the
/// global root registry plus the live tasks' stack extents (`lo..hi`,
/// growing downward from `hi`) and any additional conservative ranges (for
/// example a spilled-register save area for the currently running task).
pub struct ScanContext<'a> {
    pub roots: &'a RootRegistry,
    pub stack_ranges: &'a [(usize, usize)],
}

impl<'a> ScanContext<'a> {
    #[must_use]
    pub fn empty() -> Self {
        static EMPTY_REGISTRY: RootRegistry = RootRegistry::new();
        const EMPTY_RANGES: &[(usize, usize)] = &[];
        Self {
            roots: &EMPTY_REGISTRY,
            stack_ranges: EMPTY_RANGES,
        }
    }

    #[must_use]
    pub fn new(roots: &'a RootRegistry, stack_ranges: &'a [(usize, usize)]) -> Self {
        Self {
            roots,
            stack_ranges,
        }
    }
}

impl Heap {
    /// Run one full stop-the-world copying collection, relocating every
    /// object reachable from `ctx` into the currently inactive semi-space.
    pub fn collect<H: Host>(&mut self, host: &H, ctx: ScanContext<'_>) {
        let from_base = self.active_base();
        let from_limit = self.alloc_ptr.get();
        let to_idx = 1 - self.active;
        let to_base = self.spaces[to_idx].as_ptr() as usize;

        let mut free = to_base;
        let mut scan = to_base;
        let mut objects_copied: u64 = 0;

        // Forward (copy if not already copied) the object whose payload
        // starts at `payload_addr`, returning its new payload address.
        //
        // Safety: `payload_addr` must point at the payload of a live object
        // header within `[from_base, from_limit)`.
        unsafe fn forward(
            from_base: usize,
            from_limit: usize,
            free: &mut usize,
            objects_copied: &mut u64,
            payload_addr: usize,
        ) -> usize {
            let header_addr = payload_addr - HEADER_SIZE;
            // Safety: caller guarantees `header_addr` is a live header.
            let header = unsafe { core::ptr::read(header_addr as *const ObjHeader) };
            if header.is_forwarded() {
                return header.forward_addr();
            }
            let total = header.size();
            debug_assert!(header_addr + total <= from_limit, "object runs past from-space high water mark");

            let new_header_addr = *free;
            // Safety: `total` bytes starting at `header_addr` belong to this
            // object (header + payload); `new_header_addr` has at least
            // `total` bytes free in to-space (enforced by the semi-spaces
            // being equal size and collection never running out, checked by
            // the `to_space_overflow` guard in the caller).
            unsafe {
                core::ptr::copy_nonoverlapping(
                    header_addr as *const u8,
                    new_header_addr as *mut u8,
                    total,
                );
            }
            *free += total;
            *objects_copied += 1;

            let new_payload_addr = new_header_addr + HEADER_SIZE;
            let mut forwarded = header;
            forwarded.set_forwarded(new_payload_addr);
            // Safety: `header_addr` is still a valid, exclusively-owned
            // from-space location until the whole from-space is discarded.
            unsafe { core::ptr::write(header_addr as *mut ObjHeader, forwarded) };
            new_payload_addr
        }

        let in_from = |addr: usize| addr >= from_base && addr < from_limit;

        let mut relocate_slot = |slot: *mut usize| {
            // Safety: caller-provided roots/stack ranges point at readable
            // pointer-sized memory for the duration of collection.
            let value = unsafe { core::ptr::read(slot) };

            // A conservative stack word can be anything; reject it in three
            // stages before trusting it enough to read a header through it:
            // is it heap memory at all, is it in the space being evacuated,
            // and does a header read from here describe an object that
            // actually fits before the from-space high water mark. Any
            // failure means this word merely aliases a heap address without
            // pointing at a real object start, and is silently left alone
            // rather than treated as an error.
            if !self.in_ram_window(value) || !in_from(value) {
                return;
            }
            if value < from_base + HEADER_SIZE {
                return;
            }
            let header_addr = value - HEADER_SIZE;
            // Safety: `header_addr` was just checked to fall within
            // `[from_base, from_limit)`, which is heap-owned memory for the
            // duration of collection.
            let header = unsafe { core::ptr::read(header_addr as *const ObjHeader) };
            let total = header.size();
            if header_addr + total > from_limit {
                return;
            }

            // Safety: `value` is now known to point at a header whose
            // declared extent fits inside from-space.
            let new_value = unsafe {
                forward(from_base, from_limit, &mut free, &mut objects_copied, value)
            };
            // Safety: `slot` was just read from.
            unsafe { core::ptr::write(slot, new_value) };
        };

        for root in ctx.roots.iter() {
            relocate_slot(root.slot);
        }
        for &(lo, hi) in ctx.stack_ranges {
            let mut addr = lo & !(core::mem::size_of::<usize>() - 1);
            while addr + core::mem::size_of::<usize>() <= hi {
                relocate_slot(addr as *mut usize);
                addr += core::mem::size_of::<usize>();
            }
        }

        // Cheney's scan loop: walk the to-space from `to_base` to the
        // (growing) `free` pointer, relocating every outgoing pointer of
        // each already-copied object.
        while scan < free {
            // Safety: `scan` is within `[to_base, free)`, which holds only
            // objects copied by `forward` above.
            let header = unsafe { core::ptr::read(scan as *const ObjHeader) };
            let total = header.size();
            let payload = scan + HEADER_SIZE;

            if !header.is_noscan() && header.type_ptr() != 0 {
                // Safety: non-forwarded copied headers carry a valid static
                // type pointer when `type_ptr() != 0`.
                let ty = unsafe { &*(header.type_ptr() as *const crate::types::Type) };
                let word_size = core::mem::size_of::<usize>();
                let words = ty.ptrdata / word_size;
                for w in 0..words {
                    if ty.gc_bit(w) {
                        relocate_slot((payload + w * word_size) as *mut usize);
                    }
                }
            }

            if scan + total > to_base + self.space_size {
                crate::error::fatal(host, crate::error::Fatal::ToSpaceOverflow);
            }
            scan += total;
        }

        self.active = to_idx;
        self.alloc_ptr.set(free);
        self.limit = to_base + self.space_size;
        self.pending_invalidate = Some(super::PendingInvalidate {
            base: from_base,
            len: self.space_size,
            done: 0,
        });

        self.stats.num_collections += 1;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "byte counts fit in u64 on every supported target"
        )]
        {
            self.stats.bytes_copied += (free - to_base) as u64;
        }
        self.stats.last_pause_objects = objects_copied;

        tracing::debug!(
            objects_copied,
            bytes_copied = free - to_base,
            "gc: collection complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::test_host::StdHost;
    use crate::types::{Kind, KindFlags, Type};

    static PTR_GCDATA: [u8; 1] = [0b1];

    static PTR_TYPE: Type = Type {
        size: core::mem::size_of::<usize>(),
        ptrdata: core::mem::size_of::<usize>(),
        align: core::mem::size_of::<usize>() as u16,
        field_align: core::mem::size_of::<usize>() as u16,
        kind: Kind::Ptr,
        kind_flags: KindFlags::DIRECT_IFACE,
        equal_fn: None,
        hash_fn: None,
        gcdata: &PTR_GCDATA,
        name: "*T",
        pkg_path: "",
        methods: &[],
    };

    #[test]
    fn reachable_object_survives_collection() {
        let mut cfg = Config::default();
        cfg.semispace_size = 4096;
        let mut heap = Heap::new(cfg);
        let host = StdHost::new();

        let leaf = heap.alloc(&host, ScanContext::empty(), 8, None, 0) as usize;

        let mut roots = RootRegistry::new();
        let mut root_slot: usize = leaf;
        // Safety: `root_slot` outlives this scope.
        unsafe { roots.add_root(core::ptr::addr_of_mut!(root_slot)) };

        let ctx = ScanContext::new(&roots, &[]);
        heap.collect(&host, ctx);

        let new_leaf = root_slot;
        assert_ne!(new_leaf, leaf, "surviving object should have moved");
        assert!(heap.in_active_space(new_leaf));
    }

    #[test]
    fn pointer_chain_is_followed_and_updated() {
        let mut cfg = Config::default();
        cfg.semispace_size = 4096;
        let mut heap = Heap::new(cfg);
        let host = StdHost::new();

        let leaf = heap.alloc(&host, ScanContext::empty(), 8, None, 0) as usize;
        let parent = heap.alloc(&host, ScanContext::empty(), 8, Some(&PTR_TYPE), 0) as usize;
        // Safety: `parent` was just allocated with `ptrdata == size_of::<usize>()`.
        unsafe { core::ptr::write(parent as *mut usize, leaf) };

        let mut roots = RootRegistry::new();
        let mut root_slot: usize = parent;
        // Safety: `root_slot` outlives this scope.
        unsafe { roots.add_root(core::ptr::addr_of_mut!(root_slot)) };

        let ctx = ScanContext::new(&roots, &[]);
        heap.collect(&host, ctx);

        let new_parent = root_slot;
        // Safety: `new_parent` is the relocated, still-valid parent object.
        let updated_leaf_ptr = unsafe { core::ptr::read(new_parent as *const usize) };
        assert_ne!(updated_leaf_ptr, leaf, "child pointer should have been updated");
        assert!(heap.in_active_space(updated_leaf_ptr));
    }

    #[test]
    fn unreachable_object_is_dropped() {
        let mut cfg = Config::default();
        cfg.semispace_size = 4096;
        let mut heap = Heap::new(cfg);
        let host = StdHost::new();

        let _garbage = heap.alloc(&host, ScanContext::empty(), 8, None, 0);
        let used_before = heap.used();

        heap.collect(&host, ScanContext::empty());

        assert!(heap.used() < used_before);
    }
}
