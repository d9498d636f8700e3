use crate::ir::def::{BlockId, Function, Terminator, ValueId};
use rustc_hash::FxHashSet;

pub fn successors(func: &Function, bb: BlockId) -> Vec<BlockId> {
    match &func.blocks[bb].term {
        Terminator::Goto(t) => vec![*t],
        Terminator::If {
            then_bb, else_bb, ..
        } => {
            if then_bb == else_bb {
                vec![*then_bb]
            } else {
                vec![*then_bb, *else_bb]
            }
        }
        Terminator::Return(_) | Terminator::Unreachable => Vec::new(),
    }
}

pub fn predecessors(func: &Function) -> Vec<Vec<BlockId>> {
    let mut preds = vec![Vec::new(); func.blocks.len()];
    for bb in 0..func.blocks.len() {
        for succ in successors(func, bb) {
            preds[succ].push(bb);
        }
    }
    preds
}

/// CFG post-order from the entry block. Unreachable blocks are not visited.
pub fn post_order(func: &Function) -> Vec<BlockId> {
    let mut order = Vec::with_capacity(func.blocks.len());
    let mut visited = FxHashSet::default();
    if func.blocks.is_empty() {
        return order;
    }
    // Iterative DFS; a node is emitted once all successors are done.
    let mut stack: Vec<(BlockId, usize)> = vec![(func.entry, 0)];
    visited.insert(func.entry);
    while let Some((bb, next)) = stack.pop() {
        let succs = successors(func, bb);
        if next < succs.len() {
            stack.push((bb, next + 1));
            let s = succs[next];
            if visited.insert(s) {
                stack.push((s, 0));
            }
        } else {
            order.push(bb);
        }
    }
    order
}

/// Set-based dominator solution: dom(b) is every block on all paths to b.
#[derive(Debug)]
pub struct Dominators {
    doms: Vec<FxHashSet<BlockId>>,
}

impl Dominators {
    pub fn compute(func: &Function) -> Self {
        let n = func.blocks.len();
        let preds = predecessors(func);
        let all: FxHashSet<BlockId> = (0..n).collect();
        let mut doms = vec![all; n];
        if n == 0 {
            return Self { doms };
        }
        let mut entry_set = FxHashSet::default();
        entry_set.insert(func.entry);
        doms[func.entry] = entry_set;

        let mut rpo = post_order(func);
        rpo.reverse();

        let mut changed = true;
        while changed {
            changed = false;
            for &bb in &rpo {
                if bb == func.entry {
                    continue;
                }
                let mut new_set: Option<FxHashSet<BlockId>> = None;
                for &p in &preds[bb] {
                    let pd = &doms[p];
                    new_set = Some(match new_set {
                        None => pd.clone(),
                        Some(acc) => acc.intersection(pd).copied().collect(),
                    });
                }
                let mut new_set = new_set.unwrap_or_default();
                new_set.insert(bb);
                if new_set != doms[bb] {
                    doms[bb] = new_set;
                    changed = true;
                }
            }
        }
        Self { doms }
    }

    pub fn block_dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.doms[b].contains(&a)
    }

    /// Whether the definition of `a` dominates the instruction `b`. Floating
    /// values (constants, parameters, globals) dominate everything; within a
    /// block, program order decides.
    pub fn value_dominates(&self, func: &Function, a: ValueId, b: ValueId) -> bool {
        let Some(block_a) = func.block_of(a) else {
            return true;
        };
        let Some(block_b) = func.block_of(b) else {
            return false;
        };
        if block_a == block_b {
            let pa = func.position_in_block(a);
            let pb = func.position_in_block(b);
            match (pa, pb) {
                (Some(pa), Some(pb)) => pa < pb,
                _ => false,
            }
        } else {
            self.block_dominates(block_a, block_b)
        }
    }
}
