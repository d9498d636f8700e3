use crate::ir::def::Type;
use rustc_hash::FxHashMap;

/// Size and alignment queries for the host target's data layout.
#[derive(Debug, Clone)]
pub struct DataLayout {
    default_ptr_bits: u32,
    ptr_bits: FxHashMap<u32, u32>,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self {
            default_ptr_bits: 64,
            ptr_bits: FxHashMap::default(),
        }
    }
}

impl DataLayout {
    pub fn with_pointer_size(mut self, addr_space: u32, bits: u32) -> Self {
        self.ptr_bits.insert(addr_space, bits);
        self
    }

    pub fn pointer_size_in_bits(&self, addr_space: u32) -> u32 {
        *self
            .ptr_bits
            .get(&addr_space)
            .unwrap_or(&self.default_ptr_bits)
    }

    pub fn type_size_in_bits(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void => 0,
            Type::Int(bits) | Type::Float(bits) => u64::from(*bits),
            Type::Ptr { addr_space, .. } => u64::from(self.pointer_size_in_bits(*addr_space)),
            Type::Vector { elem, lanes } => self.type_size_in_bits(elem) * u64::from(*lanes),
        }
    }

    /// Bytes a value of this type occupies in memory.
    pub fn type_store_size(&self, ty: &Type) -> u64 {
        (self.type_size_in_bits(ty) + 7) / 8
    }

    /// ABI-natural alignment: the store size rounded up to a power of two.
    pub fn abi_alignment(&self, ty: &Type) -> u32 {
        let bytes = self.type_store_size(ty).max(1);
        (bytes as u32).next_power_of_two()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_alignments() {
        let dl = DataLayout::default().with_pointer_size(3, 32);
        assert_eq!(dl.type_size_in_bits(&Type::int(32)), 32);
        assert_eq!(dl.type_store_size(&Type::int(24)), 3);
        assert_eq!(dl.abi_alignment(&Type::int(24)), 4);
        assert_eq!(dl.type_size_in_bits(&Type::ptr(Type::int(8), 3)), 32);
        assert_eq!(dl.type_size_in_bits(&Type::ptr(Type::int(8), 0)), 64);
        let v4i32 = Type::vector(Type::int(32), 4);
        assert_eq!(dl.type_store_size(&v4i32), 16);
        assert_eq!(dl.abi_alignment(&v4i32), 16);
    }
}
