use crate::ir::def::{gep_index_scales, BinOp, CastOp, Function, ValueId, ValueKind};
use crate::ir::layout::DataLayout;

const MAX_DEPTH: u32 = 16;

/// A symbolic address expression in canonical form: operand lists are
/// flattened, constants folded, and operands sorted, so structural equality
/// is plain `==`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Expr {
    Const(i64),
    Unknown(ValueId),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
}

pub fn constant(value: i64) -> Expr {
    Expr::Const(value)
}

pub fn add(a: Expr, b: Expr) -> Expr {
    normalize_add(vec![a, b])
}

pub fn mul(a: Expr, b: Expr) -> Expr {
    normalize_mul(vec![a, b])
}

/// Computes the symbolic expression for a value. Sign and zero extensions are
/// opaque: widening loses the arithmetic identities this engine tracks, so an
/// extension is its own unknown.
pub fn analyze(func: &Function, layout: &DataLayout, v: ValueId) -> Expr {
    analyze_rec(func, layout, v, 0)
}

fn analyze_rec(func: &Function, layout: &DataLayout, v: ValueId, depth: u32) -> Expr {
    if depth >= MAX_DEPTH {
        return Expr::Unknown(v);
    }
    match func.kind(v) {
        ValueKind::ConstInt { value } => Expr::Const(*value),
        ValueKind::Binary { op, lhs, rhs, .. } => {
            match op {
                BinOp::Add => add(
                    analyze_rec(func, layout, *lhs, depth + 1),
                    analyze_rec(func, layout, *rhs, depth + 1),
                ),
                BinOp::Sub => add(
                    analyze_rec(func, layout, *lhs, depth + 1),
                    mul(
                        Expr::Const(-1),
                        analyze_rec(func, layout, *rhs, depth + 1),
                    ),
                ),
                BinOp::Mul => mul(
                    analyze_rec(func, layout, *lhs, depth + 1),
                    analyze_rec(func, layout, *rhs, depth + 1),
                ),
                BinOp::Shl => match func.const_int_value(*rhs) {
                    Some(sh) if (0..63).contains(&sh) => mul(
                        Expr::Const(1i64 << sh),
                        analyze_rec(func, layout, *lhs, depth + 1),
                    ),
                    _ => Expr::Unknown(v),
                },
                _ => Expr::Unknown(v),
            }
        }
        ValueKind::Gep { base, indices, .. } => {
            let mut expr = analyze_rec(func, layout, *base, depth + 1);
            let Some(scales) = gep_index_scales(func, layout, *base, indices) else {
                return Expr::Unknown(v);
            };
            for (ix, scale) in scales {
                let term = mul(
                    Expr::Const(scale),
                    analyze_rec(func, layout, ix, depth + 1),
                );
                expr = add(expr, term);
            }
            expr
        }
        ValueKind::Cast {
            op: CastOp::BitCast,
            arg,
        } if func.ty(*arg).addr_space().is_some() => analyze_rec(func, layout, *arg, depth + 1),
        _ => Expr::Unknown(v),
    }
}

fn normalize_add(ops: Vec<Expr>) -> Expr {
    let mut konst: i64 = 0;
    let mut rest: Vec<Expr> = Vec::new();
    let mut work = ops;
    while let Some(e) = work.pop() {
        match e {
            Expr::Const(c) => konst = konst.wrapping_add(c),
            Expr::Add(inner) => work.extend(inner),
            other => rest.push(other),
        }
    }
    rest.sort();
    if rest.is_empty() {
        return Expr::Const(konst);
    }
    if konst == 0 && rest.len() == 1 {
        return rest.pop().unwrap();
    }
    let mut out = Vec::with_capacity(rest.len() + 1);
    if konst != 0 {
        out.push(Expr::Const(konst));
    }
    out.extend(rest);
    if out.len() == 1 {
        out.pop().unwrap()
    } else {
        Expr::Add(out)
    }
}

fn normalize_mul(ops: Vec<Expr>) -> Expr {
    let mut konst: i64 = 1;
    let mut rest: Vec<Expr> = Vec::new();
    let mut work = ops;
    while let Some(e) = work.pop() {
        match e {
            Expr::Const(c) => konst = konst.wrapping_mul(c),
            Expr::Mul(inner) => work.extend(inner),
            other => rest.push(other),
        }
    }
    if konst == 0 {
        return Expr::Const(0);
    }
    rest.sort();
    if rest.is_empty() {
        return Expr::Const(konst);
    }
    if konst == 1 && rest.len() == 1 {
        return rest.pop().unwrap();
    }
    // Distribute a constant factor over a sum so that `c * (x + d)` and
    // `c * x + c * d` normalize to the same expression.
    if rest.len() == 1 {
        if let Expr::Add(terms) = &rest[0] {
            let distributed = terms
                .iter()
                .map(|t| mul(Expr::Const(konst), t.clone()))
                .collect();
            return normalize_add(distributed);
        }
    }
    let mut out = Vec::with_capacity(rest.len() + 1);
    if konst != 1 {
        out.push(Expr::Const(konst));
    }
    out.extend(rest);
    if out.len() == 1 {
        out.pop().unwrap()
    } else {
        Expr::Mul(out)
    }
}
