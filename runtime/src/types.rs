//! Static per-type metadata.
//!
//! Every [`Type`] here is produced ahead-of-time and lives in read-only
//! memory: it never moves, and never appears inside the managed heap.
//! Specialized descriptors (array/slice/ptr/chan/struct/interface/map)
//! embed a base [`Type`], subclassing by putting the common header first.

use bitflags::bitflags;
use core::cmp::Ordering;

/// Closed enumeration of value shapes a [`Type`] can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    Array,
    Chan,
    Func,
    Interface,
    Map,
    Ptr,
    Slice,
    String,
    Struct,
    UnsafePointer,
}

bitflags! {
    /// Per-type flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KindFlags: u8 {
        /// The value itself (not a pointer to it) is stored in an
        /// interface's data slot: the type is pointer-sized and pointer-shaped.
        const DIRECT_IFACE = 0b0000_0001;
        /// Pointer layout is described by a compressed program. This runtime
        /// does not implement the program interpreter; such types fall back
        /// to conservative scanning over the `ptrdata` region.
        const GCPROG = 0b0000_0010;
    }
}

/// Function pointer used for type-directed equality: compares two values of
/// the same (erased) type for equality. `None` for non-comparable kinds
/// (slice, map, func) — using such a type as a map key or interface equality
/// target panics.
pub type EqualFn = fn(*const u8, *const u8) -> bool;

/// Function pointer used for type-directed hashing: hashes a value given a
/// per-map random seed.
pub type HashFn = fn(*const u8, u64) -> u64;

/// One `{name, pkgPath, methodType, funcType, funcPtr}` entry in a named
/// type's method list.
#[derive(Debug, Clone, Copy)]
pub struct Method {
    pub name: &'static str,
    pub pkg_path: &'static str,
    pub func_ptr: *const (),
}

// Safety note: method function pointers are into read-only code and are Sync
// for the same reason `&'static Type` is.
// Safety: `Method` holds only `'static` data and a code pointer, neither of
// which is thread-affine.
unsafe impl Sync for Method {}

/// Static per-type metadata.
#[derive(Debug)]
pub struct Type {
    pub size: usize,
    pub ptrdata: usize,
    pub align: u16,
    pub field_align: u16,
    pub kind: Kind,
    pub kind_flags: KindFlags,
    pub equal_fn: Option<EqualFn>,
    pub hash_fn: Option<HashFn>,
    /// 1 bit per pointer-sized word within the `ptrdata` prefix: `1` ⇒ the
    /// word is a managed pointer, `0` ⇒ scalar. Length is
    /// `ceil(ptrdata / size_of::<usize>() / 8)` bytes.
    pub gcdata: &'static [u8],
    pub name: &'static str,
    pub pkg_path: &'static str,
    pub methods: &'static [Method],
}

impl Type {
    /// Whether the GC can skip scanning instances of this type entirely.
    #[must_use]
    pub fn no_scan(&self) -> bool {
        self.ptrdata == 0
    }

    /// Test bit `word_index` of [`Type::gcdata`] (word_index counts
    /// pointer-sized words from the start of the value).
    #[must_use]
    pub fn gc_bit(&self, word_index: usize) -> bool {
        let byte = word_index / 8;
        let bit = word_index % 8;
        self.gcdata
            .get(byte)
            .is_some_and(|b| b & (1 << bit) != 0)
    }
}

/// Element type + length, for [`Kind::Array`].
#[derive(Debug)]
pub struct ArrayType {
    pub base: Type,
    pub elem: &'static Type,
    pub len: usize,
}

/// Element type, for [`Kind::Slice`].
#[derive(Debug)]
pub struct SliceType {
    pub base: Type,
    pub elem: &'static Type,
}

/// Target type, for [`Kind::Ptr`].
#[derive(Debug)]
pub struct PtrType {
    pub base: Type,
    pub target: &'static Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanDir {
    Recv,
    Send,
    Both,
}

/// Element type + direction, for [`Kind::Chan`].
#[derive(Debug)]
pub struct ChanType {
    pub base: Type,
    pub elem: &'static Type,
    pub dir: ChanDir,
}

/// One field of a [`StructType`].
#[derive(Debug)]
pub struct StructField {
    pub name: &'static str,
    pub pkg_path: &'static str,
    pub ty: &'static Type,
    pub tag: &'static str,
    pub offset: usize,
}

/// Flexible field array, for [`Kind::Struct`].
#[derive(Debug)]
pub struct StructType {
    pub base: Type,
    pub fields: &'static [StructField],
}

/// One method slot of an [`InterfaceType`], pre-sorted by name so itab
/// construction can walk both method lists in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct IfaceMethod {
    pub name: &'static str,
    pub pkg_path: &'static str,
}

/// Method list, for [`Kind::Interface`].
#[derive(Debug)]
pub struct InterfaceType {
    pub base: Type,
    /// Sorted by `name` then `pkg_path`.
    pub methods: &'static [IfaceMethod],
}

bitflags! {
    /// Map-specific flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        const INDIRECT_KEY = 0b0001;
        const INDIRECT_VALUE = 0b0010;
        const REFLEXIVE_KEY = 0b0100;
        const NEED_KEY_UPDATE = 0b1000;
        const HASH_MIGHT_PANIC = 0b1_0000;
    }
}

/// Key/value/bucket shape, for [`Kind::Map`]. The generic [`crate::hmap`]
/// implementation does not need this (it is generic over `K`/`V` directly),
/// but it is kept so the type-descriptor model stays complete for
/// reflection/interface-equality purposes on map-typed values.
#[derive(Debug)]
pub struct MapType {
    pub base: Type,
    pub key: &'static Type,
    pub value: &'static Type,
    pub flags: MapFlags,
}

/// Compare two interned name pointers: identity first (two names from the
/// same compilation unit are almost always the same static slice), byte
/// comparison second.
#[must_use]
pub fn name_eq(a: &'static str, b: &'static str) -> bool {
    core::ptr::eq(a.as_ptr(), b.as_ptr()) || a == b
}

/// Ordering used to keep [`InterfaceType::methods`] sorted.
#[must_use]
pub fn method_order(a: &IfaceMethod, b: &IfaceMethod) -> Ordering {
    a.name.cmp(b.name).then_with(|| a.pkg_path.cmp(b.pkg_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOL_GCDATA: [u8; 0] = [];

    static BOOL_TYPE: Type = Type {
        size: 1,
        ptrdata: 0,
        align: 1,
        field_align: 1,
        kind: Kind::Bool,
        kind_flags: KindFlags::DIRECT_IFACE,
        equal_fn: None,
        hash_fn: None,
        gcdata: &BOOL_GCDATA,
        name: "bool",
        pkg_path: "",
        methods: &[],
    };

    #[test]
    fn no_scan_when_ptrdata_zero() {
        assert!(BOOL_TYPE.no_scan());
    }

    #[test]
    fn gc_bit_reads_packed_bitmap() {
        static GCDATA: [u8; 1] = [0b0000_0101];
        let ty = Type {
            gcdata: &GCDATA,
            ptrdata: 3 * core::mem::size_of::<usize>(),
            ..unsafe_clone(&BOOL_TYPE)
        };
        assert!(ty.gc_bit(0));
        assert!(!ty.gc_bit(1));
        assert!(ty.gc_bit(2));
        assert!(!ty.gc_bit(3));
    }

    // Test-only helper: `Type` intentionally has no public `Clone` impl
    // (real descriptors are `'static` singletons), but tests want to
    // derive variations of a base descriptor.
    fn unsafe_clone(t: &Type) -> Type {
        Type {
            size: t.size,
            ptrdata: t.ptrdata,
            align: t.align,
            field_align: t.field_align,
            kind: t.kind,
            kind_flags: t.kind_flags,
            equal_fn: t.equal_fn,
            hash_fn: t.hash_fn,
            gcdata: t.gcdata,
            name: t.name,
            pkg_path: t.pkg_path,
            methods: t.methods,
        }
    }

    #[test]
    fn name_eq_matches_identical_and_equal_strings() {
        let a: &'static str = "foo";
        let b: &'static str = "foo";
        assert!(name_eq(a, b));
    }
}
