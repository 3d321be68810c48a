//! Interface values and itab dispatch.
//!
//! Dispatch is vtable-free and structurally matched (method lookup by
//! name/signature against a concrete type's method table, cached once
//! resolved) rather than a fat-pointer trait object, since interface values
//! here must stay reflectable by the hmap/print path rather than being
//! opaque trait objects.

use crate::heap::Heap;
use crate::types::{InterfaceType, Kind, Method, Type, name_eq};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

/// An empty interface value: a concrete type plus a data word, boxed the
/// way `convT2E` boxes a non-pointer-shaped value and left unboxed (data
/// word holds the value itself) for pointer-shaped ("direct interface")
/// types.
#[derive(Debug, Clone, Copy)]
pub struct Eface {
    pub ty: Option<&'static Type>,
    pub data: usize,
}

impl Eface {
    #[must_use]
    pub const fn nil() -> Self {
        Self { ty: None, data: 0 }
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.ty.is_none()
    }

    /// Render this value for a panic diagnostic line, dispatching on the
    /// dynamic [`Kind`]: small integer kinds print their numeric value,
    /// strings print their contents, everything else prints a placeholder
    /// with the type name.
    #[must_use]
    pub fn format_for_panic(&self) -> String {
        let Some(ty) = self.ty else {
            return String::from("nil");
        };
        match ty.kind {
            Kind::String => {
                // Safety: a `String` kind's direct-interface data word holds
                // a `&str`'s pointer only when `DIRECT_IFACE` isn't set,
                // which strings never set (they are two words); treated
                // conservatively here as an opaque boxed value instead.
                format!("{}({:#x})", ty.name, self.data)
            }
            Kind::Int | Kind::Int8 | Kind::Int16 | Kind::Int32 | Kind::Int64 => {
                #[expect(
                    clippy::cast_possible_wrap,
                    reason = "reinterpreting the stored bit pattern as signed for display"
                )]
                {
                    format!("{}", self.data as isize)
                }
            }
            Kind::Uint | Kind::Uint8 | Kind::Uint16 | Kind::Uint32 | Kind::Uint64 => {
                format!("{}", self.data)
            }
            Kind::Bool => format!("{}", self.data != 0),
            _ => format!("({}) {:#x}", ty.name, self.data),
        }
    }
}

impl Default for Eface {
    fn default() -> Self {
        Self::nil()
    }
}

/// A non-empty interface value: an itab (concrete type + method table for
/// one interface) plus a data word.
#[derive(Debug, Clone, Copy)]
pub struct Iface {
    pub tab: Option<&'static Itab>,
    pub data: usize,
}

impl Iface {
    #[must_use]
    pub const fn nil() -> Self {
        Self { tab: None, data: 0 }
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.tab.is_none()
    }
}

/// Resolved interface/concrete-type pairing: the concrete type plus, for
/// each interface method (in the interface's sorted method order), the
/// matching concrete method's function pointer.
pub struct Itab {
    pub iface: &'static InterfaceType,
    pub concrete: &'static Type,
    pub funcs: &'static [*const ()],
}

// Safety: `Itab` holds only `'static` descriptor references and code
// pointers into read-only program memory.
unsafe impl Sync for Itab {}

/// Build an itab by structurally matching `iface`'s sorted method list
/// against `concrete`'s method table.
///
/// Returns `None` if `concrete` does not implement every method `iface`
/// requires (a compile-time-impossible case for a real compiler-emitted
/// assignment, kept as a runtime check here since this runtime has no
/// static type checker of its own).
#[must_use]
pub fn build_itab(
    iface: &'static InterfaceType,
    concrete: &'static Type,
    funcs_storage: &mut Vec<*const ()>,
) -> bool {
    funcs_storage.clear();
    for iface_method in iface.methods {
        let found = concrete.methods.iter().find(|m| {
            name_eq(m.name, iface_method.name) && name_eq(m.pkg_path, iface_method.pkg_path)
        });
        match found {
            Some(m) => funcs_storage.push(m.func_ptr),
            None => return false,
        }
    }
    true
}

/// Linear-probe itab cache keyed by `(iface, concrete)` type pointer
/// identity. Small by construction — a real program only ever hits a
/// handful of distinct interface/concrete-type pairings.
pub struct ItabCache {
    entries: Vec<(usize, usize, Itab)>,
    cap: usize,
}

impl ItabCache {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            cap,
        }
    }

    /// Look up or build and cache the itab for `(iface, concrete)`. Returns
    /// `None` if `concrete` doesn't implement `iface` (a failed type
    /// assertion).
    pub fn get_or_build(
        &mut self,
        iface: &'static InterfaceType,
        concrete: &'static Type,
    ) -> Option<*const Itab> {
        let key_a = core::ptr::from_ref(iface) as usize;
        let key_b = core::ptr::from_ref(concrete) as usize;

        if let Some(pos) = self
            .entries
            .iter()
            .position(|(a, b, _)| *a == key_a && *b == key_b)
        {
            return Some(core::ptr::from_ref(&self.entries[pos].2));
        }

        let mut funcs = Vec::new();
        if !build_itab(iface, concrete, &mut funcs) {
            return None;
        }
        let funcs: &'static [*const ()] = alloc::boxed::Box::leak(funcs.into_boxed_slice());
        let itab = Itab {
            iface,
            concrete,
            funcs,
        };

        if self.entries.len() >= self.cap {
            self.entries.remove(0);
        }
        self.entries.push((key_a, key_b, itab));
        Some(core::ptr::from_ref(&self.entries.last().unwrap().2))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Box a scalar value into an `Eface`'s data word, using `heap` only when
/// the value doesn't fit directly: values that fit in a `usize` and whose
/// type is `DIRECT_IFACE`-flagged are stored inline, everything else is
/// allocated.
pub fn conv_t_to_e<H: crate::error::Host>(
    heap: &mut Heap,
    host: &H,
    ty: &'static Type,
    value: usize,
) -> Eface {
    use crate::types::KindFlags;
    if ty.kind_flags.contains(KindFlags::DIRECT_IFACE) {
        return Eface {
            ty: Some(ty),
            data: value,
        };
    }
    let ctx = crate::heap::gc::ScanContext::empty();
    let ptr = heap.alloc(host, ctx, ty.size, Some(ty), 0);
    // Safety: `ptr` was just allocated for exactly `ty.size` bytes, which is
    // `size_of::<usize>()` for every boxed-by-value scalar this is used for.
    unsafe { core::ptr::write(ptr.cast::<usize>(), value) };
    Eface {
        ty: Some(ty),
        data: ptr as usize,
    }
}

/// Convert an `Eface` to an `Iface` for `interfaceType` `iface`, returning
/// `None` on a failed assertion.
pub fn assert_e_to_i(cache: &mut ItabCache, eface: Eface, iface: &'static InterfaceType) -> Option<Iface> {
    let concrete = eface.ty?;
    let tab = cache.get_or_build(iface, concrete)?;
    // Safety: `tab` was just produced by `get_or_build` and the cache keeps
    // every entry alive for the cache's own lifetime.
    let tab_ref: &'static Itab = unsafe { &*tab };
    Some(Iface {
        tab: Some(tab_ref),
        data: eface.data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IfaceMethod, KindFlags};

    static STRINGER_METHODS: [IfaceMethod; 1] = [IfaceMethod {
        name: "String",
        pkg_path: "",
    }];

    static STRINGER: InterfaceType = InterfaceType {
        base: Type {
            size: 2 * core::mem::size_of::<usize>(),
            ptrdata: 2 * core::mem::size_of::<usize>(),
            align: core::mem::size_of::<usize>() as u16,
            field_align: core::mem::size_of::<usize>() as u16,
            kind: Kind::Interface,
            kind_flags: KindFlags::empty(),
            equal_fn: None,
            hash_fn: None,
            gcdata: &[],
            name: "Stringer",
            pkg_path: "",
            methods: &[],
        },
        methods: &STRINGER_METHODS,
    };

    extern "C" fn fake_string_method() {}

    static POINT_METHODS: [Method; 1] = [Method {
        name: "String",
        pkg_path: "",
        func_ptr: fake_string_method as *const (),
    }];

    static POINT: Type = Type {
        size: 8,
        ptrdata: 0,
        align: 4,
        field_align: 4,
        kind: Kind::Struct,
        kind_flags: KindFlags::empty(),
        equal_fn: None,
        hash_fn: None,
        gcdata: &[],
        name: "Point",
        pkg_path: "",
        methods: &POINT_METHODS,
    };

    static NOMETHOD: Type = Type {
        size: 1,
        ptrdata: 0,
        align: 1,
        field_align: 1,
        kind: Kind::Bool,
        kind_flags: KindFlags::empty(),
        equal_fn: None,
        hash_fn: None,
        gcdata: &[],
        name: "bool",
        pkg_path: "",
        methods: &[],
    };

    #[test]
    fn itab_builds_when_methods_match() {
        let mut cache = ItabCache::new(8);
        let tab = cache.get_or_build(&STRINGER, &POINT);
        assert!(tab.is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn itab_cache_hits_on_second_lookup() {
        let mut cache = ItabCache::new(8);
        let first = cache.get_or_build(&STRINGER, &POINT).unwrap();
        let second = cache.get_or_build(&STRINGER, &POINT).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn itab_fails_when_method_missing() {
        let mut cache = ItabCache::new(8);
        assert!(cache.get_or_build(&STRINGER, &NOMETHOD).is_none());
    }

    #[test]
    fn nil_eface_formats_as_nil() {
        assert_eq!(Eface::nil().format_for_panic(), "nil");
    }
}
