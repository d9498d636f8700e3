use crate::ir::def::{
    strip_inbounds_constant_offsets, underlying_object, Function, ValueId, ValueKind,
};
use crate::ir::layout::DataLayout;

/// A memory region touched by one load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemLoc {
    pub ptr: ValueId,
    pub size: u64,
}

impl MemLoc {
    pub fn of(func: &Function, layout: &DataLayout, mem: ValueId) -> Option<MemLoc> {
        let ptr = func.pointer_operand(mem)?;
        let ty = func.accessed_ty(mem)?;
        Some(MemLoc {
            ptr,
            size: layout.type_store_size(ty),
        })
    }
}

/// Allocations whose identity is known: nothing else can refer to their
/// storage unless derived from the same value.
fn is_identified_object(func: &Function, v: ValueId) -> bool {
    matches!(
        func.kind(v),
        ValueKind::Alloca { .. } | ValueKind::Global { .. }
    )
}

/// Proves two locations disjoint. Anything unprovable is may-alias.
pub fn no_alias(func: &Function, layout: &DataLayout, a: &MemLoc, b: &MemLoc) -> bool {
    if a.ptr == b.ptr {
        return false;
    }

    let (base_a, off_a) = strip_inbounds_constant_offsets(func, layout, a.ptr);
    let (base_b, off_b) = strip_inbounds_constant_offsets(func, layout, b.ptr);

    if base_a == base_b {
        // Same base: disjoint iff the constant ranges do not overlap.
        let end_a = off_a.wrapping_add(a.size as i64);
        let end_b = off_b.wrapping_add(b.size as i64);
        return end_a <= off_b || end_b <= off_a;
    }

    let obj_a = underlying_object(func, base_a);
    let obj_b = underlying_object(func, base_b);
    obj_a != obj_b && is_identified_object(func, obj_a) && is_identified_object(func, obj_b)
}
