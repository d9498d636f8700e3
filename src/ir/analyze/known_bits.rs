use crate::ir::def::{BinOp, CastOp, Function, Type, ValueId, ValueKind};

const MAX_DEPTH: u32 = 6;

/// Per-bit knowledge about an integer value: a bit set in `zero` is provably
/// zero, a bit set in `one` provably one. The two masks never intersect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownBits {
    pub zero: u64,
    pub one: u64,
    pub bits: u32,
}

impl KnownBits {
    fn unknown(bits: u32) -> Self {
        Self { zero: 0, one: 0, bits }
    }

    fn mask(bits: u32) -> u64 {
        if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }

    fn clamp(mut self) -> Self {
        let m = Self::mask(self.bits);
        self.zero &= m;
        self.one &= m;
        self
    }
}

pub fn known_bits(func: &Function, v: ValueId) -> KnownBits {
    compute(func, v, 0)
}

fn int_width(ty: &Type) -> Option<u32> {
    match ty {
        Type::Int(bits) => Some((*bits).min(64)),
        _ => None,
    }
}

fn compute(func: &Function, v: ValueId, depth: u32) -> KnownBits {
    let Some(bits) = int_width(func.ty(v)) else {
        return KnownBits::unknown(64);
    };
    if depth >= MAX_DEPTH {
        return KnownBits::unknown(bits);
    }
    let mask = KnownBits::mask(bits);

    match func.kind(v) {
        ValueKind::ConstInt { value } => {
            let val = (*value as u64) & mask;
            KnownBits {
                zero: !val & mask,
                one: val,
                bits,
            }
        }
        ValueKind::Binary { op, lhs, rhs, .. } => {
            let l = compute(func, *lhs, depth + 1);
            let r = compute(func, *rhs, depth + 1);
            let kb = match op {
                BinOp::And => KnownBits {
                    zero: l.zero | r.zero,
                    one: l.one & r.one,
                    bits,
                },
                BinOp::Or => KnownBits {
                    zero: l.zero & r.zero,
                    one: l.one | r.one,
                    bits,
                },
                BinOp::Xor => KnownBits {
                    zero: (l.zero & r.zero) | (l.one & r.one),
                    one: (l.zero & r.one) | (l.one & r.zero),
                    bits,
                },
                BinOp::Shl => match func.const_int_value(*rhs) {
                    Some(sh) if (0..i64::from(bits)).contains(&sh) => {
                        let sh = sh as u32;
                        KnownBits {
                            zero: (l.zero << sh) | KnownBits::mask(sh),
                            one: l.one << sh,
                            bits,
                        }
                    }
                    _ => KnownBits::unknown(bits),
                },
                BinOp::LShr => match func.const_int_value(*rhs) {
                    Some(sh) if (0..i64::from(bits)).contains(&sh) => {
                        let sh = sh as u32;
                        let high = !(mask >> sh) & mask;
                        KnownBits {
                            zero: ((l.zero & mask) >> sh) | high,
                            one: (l.one & mask) >> sh,
                            bits,
                        }
                    }
                    _ => KnownBits::unknown(bits),
                },
                // A multiply by a power of two is a shift.
                BinOp::Mul => match func.const_int_value(*rhs) {
                    Some(c) if c > 0 && (c as u64).is_power_of_two() => {
                        let sh = (c as u64).trailing_zeros();
                        if sh < bits {
                            KnownBits {
                                zero: (l.zero << sh) | KnownBits::mask(sh),
                                one: l.one << sh,
                                bits,
                            }
                        } else {
                            KnownBits::unknown(bits)
                        }
                    }
                    _ => KnownBits::unknown(bits),
                },
                _ => KnownBits::unknown(bits),
            };
            kb.clamp()
        }
        ValueKind::Cast { op, arg } => {
            let inner_bits = int_width(func.ty(*arg));
            match (op, inner_bits) {
                (CastOp::ZExt, Some(ib)) => {
                    let inner = compute(func, *arg, depth + 1);
                    // Every extended bit is zero.
                    let ext = !KnownBits::mask(ib) & mask;
                    KnownBits {
                        zero: (inner.zero & KnownBits::mask(ib)) | ext,
                        one: inner.one & KnownBits::mask(ib),
                        bits,
                    }
                    .clamp()
                }
                (CastOp::Trunc, Some(_)) => {
                    let inner = compute(func, *arg, depth + 1);
                    KnownBits {
                        zero: inner.zero,
                        one: inner.one,
                        bits,
                    }
                    .clamp()
                }
                _ => KnownBits::unknown(bits),
            }
        }
        _ => KnownBits::unknown(bits),
    }
}
