use crate::ir::analyze::dom::{predecessors, Dominators};
use crate::ir::def::*;
use rustc_hash::FxHashSet;
use std::fmt;

#[derive(Debug)]
pub enum VerifyError {
    BadValue(ValueId),
    BadBlock(BlockId),
    BadOperand { value: ValueId, operand: ValueId },
    FloatingInstruction(ValueId),
    MisplacedValue(ValueId),
    DuplicatePlacement(ValueId),
    UseBeforeDef { user: ValueId, def: ValueId },
    InvalidPhiSource { phi: ValueId, block: BlockId },
    BadPointer { value: ValueId },
    BadAccessType { value: ValueId },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::BadValue(v) => write!(f, "Invalid ValueId: {}", v),
            VerifyError::BadBlock(b) => write!(f, "Invalid BlockId: {}", b),
            VerifyError::BadOperand { value, operand } => {
                write!(f, "Value {} has out-of-range operand {}", value, operand)
            }
            VerifyError::FloatingInstruction(v) => {
                write!(f, "Instruction {} is not placed in any block", v)
            }
            VerifyError::MisplacedValue(v) => {
                write!(f, "Non-instruction value {} is placed in a block", v)
            }
            VerifyError::DuplicatePlacement(v) => {
                write!(f, "Value {} appears in more than one instruction slot", v)
            }
            VerifyError::UseBeforeDef { user, def } => {
                write!(f, "Value {} is used by {} before its definition", def, user)
            }
            VerifyError::InvalidPhiSource { phi, block } => {
                write!(f, "Phi {} references invalid predecessor block {}", phi, block)
            }
            VerifyError::BadPointer { value } => {
                write!(f, "Memory op {} has a non-pointer address operand", value)
            }
            VerifyError::BadAccessType { value } => {
                write!(f, "Memory op {} accesses a type its pointer cannot hold", value)
            }
        }
    }
}

pub fn verify_ir(func: &Function) -> Result<(), VerifyError> {
    check_blk(func, func.entry)?;

    // 1. Arena sanity: ids, operand ranges, placement flags.
    for (vid, val) in func.values.iter().enumerate() {
        if val.id != vid {
            return Err(VerifyError::BadValue(vid));
        }
        let mut bad = None;
        val.kind.for_each_operand(|op| {
            if op >= func.values.len() && bad.is_none() {
                bad = Some(op);
            }
        });
        if let Some(operand) = bad {
            return Err(VerifyError::BadOperand {
                value: vid,
                operand,
            });
        }
        if let Some(bb) = val.block {
            check_blk(func, bb)?;
            if !val.kind.is_instruction() {
                return Err(VerifyError::MisplacedValue(vid));
            }
        }
    }

    // 2. Block lists: every listed instruction is placed exactly once and
    // agrees with its block field.
    let mut seen = FxHashSet::default();
    for (bid, blk) in func.blocks.iter().enumerate() {
        if blk.id != bid {
            return Err(VerifyError::BadBlock(bid));
        }
        for &ins in &blk.instrs {
            if ins >= func.values.len() {
                return Err(VerifyError::BadValue(ins));
            }
            if func.values[ins].block != Some(bid) {
                return Err(VerifyError::FloatingInstruction(ins));
            }
            if !seen.insert(ins) {
                return Err(VerifyError::DuplicatePlacement(ins));
            }
        }
        match &blk.term {
            Terminator::Goto(t) => check_blk(func, *t)?,
            Terminator::If {
                cond,
                then_bb,
                else_bb,
            } => {
                check_val(func, *cond)?;
                check_blk(func, *then_bb)?;
                check_blk(func, *else_bb)?;
            }
            Terminator::Return(Some(v)) => check_val(func, *v)?,
            Terminator::Return(None) | Terminator::Unreachable => {}
        }
    }
    for val in &func.values {
        if val.kind.is_instruction() && val.block.is_none() {
            return Err(VerifyError::FloatingInstruction(val.id));
        }
    }

    // 3. Memory-op typing.
    for val in &func.values {
        match &val.kind {
            ValueKind::Load { ptr, .. } => {
                let pty = &func.values[*ptr].ty;
                match pty.pointee() {
                    None => return Err(VerifyError::BadPointer { value: val.id }),
                    Some(pointee) if *pointee != val.ty => {
                        return Err(VerifyError::BadAccessType { value: val.id })
                    }
                    _ => {}
                }
            }
            ValueKind::Store { ptr, value, .. } => {
                let pty = &func.values[*ptr].ty;
                match pty.pointee() {
                    None => return Err(VerifyError::BadPointer { value: val.id }),
                    Some(pointee) if *pointee != func.values[*value].ty => {
                        return Err(VerifyError::BadAccessType { value: val.id })
                    }
                    _ => {}
                }
            }
            ValueKind::Gep { base, .. } => {
                if func.values[*base].ty.pointee().is_none() {
                    return Err(VerifyError::BadPointer { value: val.id });
                }
            }
            _ => {}
        }
    }

    // 4. Phi predecessors and SSA dominance of uses.
    let preds = predecessors(func);
    let dom = Dominators::compute(func);
    for val in &func.values {
        let Some(bb) = val.block else { continue };
        if let ValueKind::Phi { args } = &val.kind {
            let mut sources = FxHashSet::default();
            for (arg, src) in args {
                check_val(func, *arg)?;
                check_blk(func, *src)?;
                if !preds[bb].contains(src) || !sources.insert(*src) {
                    return Err(VerifyError::InvalidPhiSource {
                        phi: val.id,
                        block: *src,
                    });
                }
            }
            continue;
        }
        let mut violation = None;
        val.kind.for_each_operand(|op| {
            if violation.is_some() {
                return;
            }
            if func.values[op].kind.is_instruction()
                && !dom.value_dominates(func, op, val.id)
            {
                violation = Some(op);
            }
        });
        if let Some(def) = violation {
            return Err(VerifyError::UseBeforeDef { user: val.id, def });
        }
    }

    Ok(())
}

fn check_val(func: &Function, v: ValueId) -> Result<(), VerifyError> {
    if v >= func.values.len() {
        Err(VerifyError::BadValue(v))
    } else {
        Ok(())
    }
}

fn check_blk(func: &Function, b: BlockId) -> Result<(), VerifyError> {
    if b >= func.blocks.len() {
        Err(VerifyError::BadBlock(b))
    } else {
        Ok(())
    }
}
