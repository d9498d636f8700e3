use rustc_hash::FxHashMap;

/// Per-address-space hardware limits for wide memory instructions.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    default_vec_reg_bits: u32,
    vec_reg_bits: FxHashMap<u32, u32>,
}

impl Default for TargetInfo {
    fn default() -> Self {
        Self {
            default_vec_reg_bits: 128,
            vec_reg_bits: FxHashMap::default(),
        }
    }
}

impl TargetInfo {
    pub fn new(default_vec_reg_bits: u32) -> Self {
        Self {
            default_vec_reg_bits,
            vec_reg_bits: FxHashMap::default(),
        }
    }

    pub fn with_vec_reg_bits(mut self, addr_space: u32, bits: u32) -> Self {
        self.vec_reg_bits.insert(addr_space, bits);
        self
    }

    /// Widest load/store the hardware can issue in one instruction, in bits.
    pub fn vec_reg_bit_width(&self, addr_space: u32) -> u32 {
        *self
            .vec_reg_bits
            .get(&addr_space)
            .unwrap_or(&self.default_vec_reg_bits)
    }
}
