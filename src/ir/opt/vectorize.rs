//! Rewrites runs of loads or stores to consecutive addresses into one wide
//! vector access. Works a basic block at a time and never reorders across
//! side-effecting operations.

use crate::ir::analyze::alias::{self, MemLoc};
use crate::ir::analyze::dom::{self, Dominators};
use crate::ir::analyze::known_bits::known_bits;
use crate::ir::analyze::scev;
use crate::ir::def::*;
use crate::ir::layout::DataLayout;
use crate::target::TargetInfo;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide totals across every run of the pass.
pub static VECTOR_INSTRUCTIONS: AtomicUsize = AtomicUsize::new(0);
pub static SCALARS_VECTORIZED: AtomicUsize = AtomicUsize::new(0);

pub fn process_counters() -> (usize, usize) {
    (
        VECTOR_INSTRUCTIONS.load(Ordering::Relaxed),
        SCALARS_VECTORIZED.load(Ordering::Relaxed),
    )
}

// TODO: query the target for the stack base alignment instead of assuming 4.
const TARGET_BASE_ALIGN: u32 = 4;

/// Candidate lists are searched pairwise; the chunk bound caps that quadratic
/// cost, it is not needed for correctness.
pub const DEFAULT_CHUNK: usize = 64;

#[derive(Debug, Default, Clone, Copy)]
pub struct VectorizeStats {
    pub vector_instructions: usize,
    pub scalars_vectorized: usize,
}

impl VectorizeStats {
    pub fn changed(self) -> bool {
        self.vector_instructions > 0
    }
}

pub fn optimize(func: &mut Function, target: &TargetInfo, layout: &DataLayout) -> bool {
    optimize_with_stats(func, target, layout).changed()
}

pub fn optimize_with_stats(
    func: &mut Function,
    target: &TargetInfo,
    layout: &DataLayout,
) -> VectorizeStats {
    optimize_chunked(func, target, layout, DEFAULT_CHUNK)
}

pub fn optimize_chunked(
    func: &mut Function,
    target: &TargetInfo,
    layout: &DataLayout,
    chunk: usize,
) -> VectorizeStats {
    // Functions built around x87-style implicit float state must not grow
    // vector instructions.
    if func.no_implicit_float {
        return VectorizeStats::default();
    }
    let dom = Dominators::compute(func);
    let mut v = Vectorizer {
        func,
        target,
        layout,
        dom,
        chunk: chunk.max(2),
        stats: VectorizeStats::default(),
    };
    v.run();
    v.stats
}

/// Per-object candidate lists in first-seen order.
#[derive(Default)]
struct ObjectBundles {
    order: Vec<ValueId>,
    map: FxHashMap<ValueId, Vec<ValueId>>,
}

impl ObjectBundles {
    fn push(&mut self, obj: ValueId, instr: ValueId) {
        let list = self.map.entry(obj).or_insert_with(|| {
            self.order.push(obj);
            Vec::new()
        });
        list.push(instr);
    }

    fn into_lists(self) -> Vec<Vec<ValueId>> {
        let mut map = self.map;
        self.order
            .into_iter()
            .map(|obj| map.remove(&obj).unwrap_or_default())
            .collect()
    }
}

struct Vectorizer<'a> {
    func: &'a mut Function,
    target: &'a TargetInfo,
    layout: &'a DataLayout,
    dom: Dominators,
    chunk: usize,
    stats: VectorizeStats,
}

impl<'a> Vectorizer<'a> {
    fn run(&mut self) -> bool {
        let mut changed = false;
        // Post-order block walk; loads first, then stores, per block.
        for bb in dom::post_order(self.func) {
            let (loads, stores) = self.collect_instructions(bb);
            changed |= self.vectorize_bundles(loads);
            changed |= self.vectorize_bundles(stores);
        }
        changed
    }

    // --- collection ---

    fn collect_instructions(&self, bb: BlockId) -> (ObjectBundles, ObjectBundles) {
        let func = &*self.func;
        let mut loads = ObjectBundles::default();
        let mut stores = ObjectBundles::default();

        for &ins in &func.blocks[bb].instrs {
            if !func.is_memory_op(ins) {
                continue;
            }
            if !func.is_simple_memory_op(ins) {
                continue;
            }
            let Some(addr_space) = func.pointer_addr_space(ins) else {
                continue;
            };
            let ty = func
                .accessed_ty(ins)
                .expect("memory op must have an accessed type")
                .clone();
            if !self.eligible_access_ty(&ty, addr_space) {
                continue;
            }
            // A vector-typed access can only be re-threaded lane by lane, so
            // every user must be a constant-index extraction.
            if ty.is_vector() && !self.all_users_const_extracts(ins) {
                continue;
            }
            let ptr = func
                .pointer_operand(ins)
                .expect("memory op must have a pointer operand");
            let obj = underlying_object(func, ptr);
            if func.is_load(ins) {
                loads.push(obj, ins);
            } else {
                stores.push(obj, ins);
            }
        }
        (loads, stores)
    }

    fn eligible_access_ty(&self, ty: &Type, addr_space: u32) -> bool {
        if !ty.scalar_ty().is_valid_vector_elem() {
            return false;
        }
        let bits = self.layout.type_size_in_bits(ty);
        // Skip sub-byte oddities, and anything too wide to pair up.
        if bits < 8 {
            return false;
        }
        let vec_reg = u64::from(self.target.vec_reg_bit_width(addr_space));
        bits <= vec_reg / 2
    }

    fn all_users_const_extracts(&self, mem: ValueId) -> bool {
        self.func.users(mem).iter().all(|&u| match self.func.kind(u) {
            ValueKind::ExtractElement { vec, lane } => {
                *vec == mem && self.func.const_int_value(*lane).is_some()
            }
            _ => false,
        })
    }

    // --- chain formation ---

    fn vectorize_bundles(&mut self, bundles: ObjectBundles) -> bool {
        let mut changed = false;
        for list in bundles.into_lists() {
            if list.len() < 2 {
                continue;
            }
            for chunk in list.chunks(self.chunk) {
                changed |= self.vectorize_instructions(chunk);
            }
        }
        changed
    }

    fn vectorize_instructions(&mut self, instrs: &[ValueId]) -> bool {
        let n = instrs.len();
        let mut succ: Vec<Option<usize>> = vec![None; n];
        let mut heads: Vec<usize> = Vec::new();
        let mut head_set: FxHashSet<usize> = FxHashSet::default();
        let mut tail_set: FxHashSet<usize> = FxHashSet::default();

        // Quadratic pairing: for each candidate, find the one access that
        // directly follows it in memory.
        for i in 0..n {
            for j in (0..n).rev() {
                if i == j {
                    continue;
                }
                if !self.consecutive(instrs[i], instrs[j]) {
                    continue;
                }
                if let Some(prev) = succ[i] {
                    let cur_distance = (prev as i64 - i as i64).abs();
                    let new_distance = (prev as i64 - j as i64).abs();
                    // Keep the forward-flowing, nearer candidate.
                    if j < i || new_distance > cur_distance {
                        continue;
                    }
                }
                tail_set.insert(j);
                if head_set.insert(i) {
                    heads.push(i);
                }
                succ[i] = Some(j);
            }
        }

        let mut changed = false;
        let mut vectorized: FxHashSet<ValueId> = FxHashSet::default();

        for &head in &heads {
            if tail_set.contains(&head) {
                continue;
            }

            // Found a chain start; follow successors, stopping at members a
            // previous chain in this chunk already rewrote.
            let mut operands: SmallVec<[ValueId; 16]> = SmallVec::new();
            let mut cur = Some(head);
            while let Some(i) = cur {
                if !(tail_set.contains(&i) || head_set.contains(&i)) {
                    break;
                }
                if vectorized.contains(&instrs[i]) {
                    break;
                }
                operands.push(instrs[i]);
                cur = succ[i];
            }
            let Some(&first) = operands.first() else {
                continue;
            };

            let rewrote = if self.func.is_load(first) {
                self.vectorize_load_chain(&operands)
            } else {
                self.vectorize_store_chain(&operands)
            };
            if rewrote {
                vectorized.extend(operands.iter().copied());
            }
            changed |= rewrote;
        }

        changed
    }

    // --- consecutivity ---

    fn consecutive(&self, a: ValueId, b: ValueId) -> bool {
        let func = &*self.func;
        let (Some(ptr_a), Some(ptr_b)) = (func.pointer_operand(a), func.pointer_operand(b))
        else {
            return false;
        };
        let (Some(as_a), Some(as_b)) = (
            func.ty(ptr_a).addr_space(),
            func.ty(ptr_b).addr_space(),
        ) else {
            return false;
        };
        if as_a != as_b || ptr_a == ptr_b {
            return false;
        }
        let (Some(ty_a), Some(ty_b)) = (func.ty(ptr_a).pointee(), func.ty(ptr_b).pointee())
        else {
            return false;
        };
        if self.layout.type_store_size(ty_a) != self.layout.type_store_size(ty_b)
            || self.layout.type_store_size(ty_a.scalar_ty())
                != self.layout.type_store_size(ty_b.scalar_ty())
        {
            return false;
        }

        let ptr_bits = self.layout.pointer_size_in_bits(as_a);
        let size = self.layout.type_store_size(ty_a) as i64;

        let (base_a, off_a) = strip_inbounds_constant_offsets(func, self.layout, ptr_a);
        let (base_b, off_b) = strip_inbounds_constant_offsets(func, self.layout, ptr_b);
        let delta = wrap_to(off_b.wrapping_sub(off_a), ptr_bits);

        // Same stripped base: the constant offsets decide.
        if base_a == base_b {
            return delta == wrap_to(size, ptr_bits);
        }

        // Symbolic probe: base_a + (size - delta) must equal base_b.
        let base_delta = wrap_to(size.wrapping_sub(delta), ptr_bits);
        let expr_a = scev::analyze(func, self.layout, base_a);
        let expr_b = scev::analyze(func, self.layout, base_b);
        if scev::add(expr_a, scev::constant(base_delta)) == expr_b {
            return true;
        }

        // The symbolic engine cannot see through patterns like
        // gep (ext (add (shl x, c1), c2)); check those the hard way.
        self.consecutive_through_gep(ptr_a, ptr_b)
    }

    fn consecutive_through_gep(&self, ptr_a: ValueId, ptr_b: ValueId) -> bool {
        let func = &*self.func;
        let (
            ValueKind::Gep {
                base: base_a,
                indices: idx_a,
                ..
            },
            ValueKind::Gep {
                base: base_b,
                indices: idx_b,
                ..
            },
        ) = (func.kind(ptr_a), func.kind(ptr_b))
        else {
            return false;
        };
        if base_a != base_b || idx_a.len() != idx_b.len() || idx_a.is_empty() {
            return false;
        }
        let last = idx_a.len() - 1;
        if idx_a[..last] != idx_b[..last] {
            return false;
        }

        // The trailing indices must be the same flavor of extension.
        let (
            ValueKind::Cast {
                op: op_a,
                arg: arg_a,
            },
            ValueKind::Cast {
                op: op_b,
                arg: arg_b,
            },
        ) = (func.kind(idx_a[last]), func.kind(idx_b[last]))
        else {
            return false;
        };
        if op_a != op_b
            || !matches!(*op_a, CastOp::SExt | CastOp::ZExt)
            || func.ty(idx_a[last]) != func.ty(idx_b[last])
        {
            return false;
        }
        let signed = matches!(*op_a, CastOp::SExt);

        let (alpha, beta) = (*arg_a, *arg_b);
        if !func.is_placed(alpha) || !func.is_placed(beta) || func.ty(alpha) != func.ty(beta) {
            return false;
        }
        let &Type::Int(bits) = func.ty(alpha) else {
            return false;
        };

        // Prove that adding one to alpha cannot wrap.
        let mut safe = false;
        if let ValueKind::Binary {
            op: BinOp::Add,
            rhs,
            nsw,
            nuw,
            ..
        } = func.kind(beta)
        {
            if func.const_int_value(*rhs).is_some_and(|c| c > 0) {
                safe = if signed { *nsw } else { *nuw };
            }
        }
        if !safe {
            // Any known-zero bit below the sign bit leaves headroom for the
            // increment.
            let kb = known_bits(func, alpha);
            let sign = 1u64 << (bits.min(64) - 1);
            if kb.zero & !sign != 0 {
                safe = true;
            }
        }
        if !safe {
            return false;
        }

        let expr_a = scev::analyze(func, self.layout, alpha);
        let expr_b = scev::analyze(func, self.layout, beta);
        scev::add(expr_a, scev::constant(1)) == expr_b
    }

    // --- legality ---

    /// Positions `[first, last)` covering the chain within its block.
    fn boundary_positions(&self, chain: &[ValueId], bb: BlockId) -> (usize, usize) {
        let members: FxHashSet<ValueId> = chain.iter().copied().collect();
        let mut first = 0;
        let mut last = 0;
        let mut found = 0usize;
        for (idx, &ins) in self.func.blocks[bb].instrs.iter().enumerate() {
            if !members.contains(&ins) {
                continue;
            }
            found += 1;
            if found == 1 {
                first = idx;
            }
            if found == chain.len() {
                last = idx;
                break;
            }
        }
        (first, last + 1)
    }

    /// Whether every chain member may move to the insertion point at the end
    /// of the range without changing observable memory behavior.
    fn legal_to_vectorize(&self, chain: &[ValueId], bb: BlockId, from: usize, to: usize) -> bool {
        let func = &*self.func;
        let members: FxHashSet<ValueId> = chain.iter().copied().collect();
        let mut memory_instrs: SmallVec<[(ValueId, usize); 16]> = SmallVec::new();
        let mut chain_instrs: SmallVec<[(ValueId, usize); 16]> = SmallVec::new();

        for idx in from..to {
            let ins = func.blocks[bb].instrs[idx];
            if func.is_memory_op(ins) {
                if members.contains(&ins) {
                    chain_instrs.push((ins, idx));
                } else if !func.is_simple_memory_op(ins) {
                    // Atomic or volatile traffic in the range always blocks.
                    return false;
                } else {
                    memory_instrs.push((ins, idx));
                }
            } else if func.may_have_side_effects(ins) {
                return false;
            }
        }

        assert_eq!(
            chain.len(),
            chain_instrs.len(),
            "all chain members must lie within [first, last)"
        );

        for &(m, m_idx) in &memory_instrs {
            for &(c, c_idx) in &chain_instrs {
                if func.is_load(m) && func.is_load(c) {
                    continue;
                }
                // A chain load that stays above a later store never moves
                // past it, and a chain store only sinks below earlier loads.
                if func.is_store(m) && func.is_load(c) && c_idx < m_idx {
                    continue;
                }
                if func.is_load(m) && func.is_store(c) && c_idx > m_idx {
                    continue;
                }
                let loc_m = MemLoc::of(func, self.layout, m)
                    .expect("memory op must have a location");
                let loc_c = MemLoc::of(func, self.layout, c)
                    .expect("memory op must have a location");
                if !alias::no_alias(func, self.layout, &loc_m, &loc_c) {
                    return false;
                }
            }
        }
        true
    }

    // --- legalization helpers ---

    /// Element type for the combined access: the first integer-typed member
    /// wins, then the first pointer-typed member reinterpreted as an integer,
    /// otherwise the first member.
    fn unify_element_ty(&self, chain: &[ValueId]) -> Type {
        for &m in chain {
            let ty = self
                .func
                .accessed_ty(m)
                .expect("chain member must access memory");
            if ty.is_int_or_int_vector() {
                return ty.clone();
            }
        }
        for &m in chain {
            let ty = self
                .func
                .accessed_ty(m)
                .expect("chain member must access memory");
            if ty.is_ptr_or_ptr_vector() {
                let bits = self.layout.type_size_in_bits(ty.scalar_ty()) as u32;
                return if ty.is_vector() {
                    Type::vector(Type::int(bits), ty.lanes())
                } else {
                    Type::int(bits)
                };
            }
        }
        self.func
            .accessed_ty(chain[0])
            .expect("chain member must access memory")
            .clone()
    }

    /// Split point such that the right piece carries the odd remainder and
    /// the left piece is a multiple of four bytes.
    fn split_odd_point(&self, chain_len: usize, elem_bits: u32) -> usize {
        let elem_bytes = (elem_bits / 8) as usize;
        let bytes = elem_bytes * chain_len;
        let num_right = (bytes % 4) / elem_bytes;
        chain_len - num_right
    }

    fn effective_alignment(&self, mem: ValueId) -> u32 {
        let stated = self
            .func
            .stated_align(mem)
            .expect("memory op must carry an alignment");
        if stated != 0 {
            return stated;
        }
        let ty = self
            .func
            .accessed_ty(mem)
            .expect("memory op must have an accessed type");
        self.layout.abi_alignment(ty)
    }

    /// Alignment gate shared by both chain kinds. May raise the alignment of
    /// a stack allocation, whose layout this pass owns.
    fn check_alignment(&mut self, leader: ValueId, addr_space: u32, bytes: usize) -> Option<u32> {
        let alignment = self.effective_alignment(leader);
        if alignment as usize % bytes == 0 || alignment % TARGET_BASE_ALIGN == 0 {
            return Some(alignment);
        }
        if addr_space != 0 {
            return None;
        }
        let ptr = self
            .func
            .pointer_operand(leader)
            .expect("memory op must have a pointer operand");
        let obj = underlying_object(self.func, ptr);
        match &mut self.func.values[obj].kind {
            ValueKind::Alloca { align } => {
                *align = TARGET_BASE_ALIGN;
                Some(TARGET_BASE_ALIGN)
            }
            _ => None,
        }
    }

    fn emit(&mut self, bb: BlockId, cursor: &mut usize, ty: Type, kind: ValueKind) -> ValueId {
        let id = self.func.insert_at(bb, *cursor, ty, kind);
        *cursor += 1;
        id
    }

    // --- rewriting ---

    fn vectorize_store_chain(&mut self, chain: &[ValueId]) -> bool {
        let store_ty = self.unify_element_ty(chain);
        let sz = self.layout.type_size_in_bits(&store_ty) as u32;
        let s0 = chain[0];
        let addr_space = self
            .func
            .pointer_addr_space(s0)
            .expect("store must have a pointer operand");
        let vec_reg = self.target.vec_reg_bit_width(addr_space);
        let chain_size = chain.len();

        if !sz.is_power_of_two() || vec_reg / sz < 2 || chain_size < 2 {
            return false;
        }
        let vf = (vec_reg / sz) as usize;

        // The combined access must span 1, 2 or a multiple of 4 bytes.
        let sz_bytes = (sz / 8) as usize * chain_size;
        if sz_bytes > 2 && sz_bytes % 4 != 0 {
            if sz_bytes == 3 {
                return self.vectorize_store_chain(&chain[..chain_size - 1]);
            }
            let split = self.split_odd_point(chain_size, sz);
            let left = self.vectorize_store_chain(&chain[..split]);
            let right = self.vectorize_store_chain(&chain[split..]);
            return left | right;
        }

        let elem_lanes = store_ty.lanes();
        let scalar = store_ty.scalar_ty().clone();
        let vec_ty = Type::vector(scalar.clone(), elem_lanes * chain_size as u32);

        // Too wide for one register: break the chain in two.
        if chain_size > vf {
            let left = self.vectorize_store_chain(&chain[..vf]);
            let right = self.vectorize_store_chain(&chain[vf..]);
            return left | right;
        }

        let Some(alignment) = self.check_alignment(s0, addr_space, sz_bytes) else {
            return false;
        };

        let bb = self.func.block_of(s0).expect("chain member must be placed");
        let (first, last) = self.boundary_positions(chain, bb);
        if !self.legal_to_vectorize(chain, bb, first, last) {
            return false;
        }

        // Assemble the wide value lane by lane at the insertion point.
        let mut cursor = last;
        let mut vec = self.func.add_value(vec_ty.clone(), ValueKind::Undef);
        for (i, &member) in chain.iter().enumerate() {
            let src = match self.func.kind(member) {
                ValueKind::Store { value, .. } => *value,
                _ => panic!("store chain member is not a store"),
            };
            if elem_lanes > 1 {
                let src_scalar = self.func.ty(src).scalar_ty().clone();
                for j in 0..elem_lanes {
                    let lane = self.func.const_int(32, i64::from(j));
                    let mut elt = self.emit(
                        bb,
                        &mut cursor,
                        src_scalar.clone(),
                        ValueKind::ExtractElement { vec: src, lane },
                    );
                    if *self.func.ty(elt) != scalar {
                        elt = self.emit(
                            bb,
                            &mut cursor,
                            scalar.clone(),
                            ValueKind::Cast {
                                op: CastOp::BitCast,
                                arg: elt,
                            },
                        );
                    }
                    let new_lane = self
                        .func
                        .const_int(32, i64::from(j + i as u32 * elem_lanes));
                    vec = self.emit(
                        bb,
                        &mut cursor,
                        vec_ty.clone(),
                        ValueKind::InsertElement {
                            vec,
                            elt,
                            lane: new_lane,
                        },
                    );
                }
            } else {
                let mut elt = src;
                if *self.func.ty(elt) != scalar {
                    elt = self.emit(
                        bb,
                        &mut cursor,
                        scalar.clone(),
                        ValueKind::Cast {
                            op: CastOp::BitCast,
                            arg: elt,
                        },
                    );
                }
                let lane = self.func.const_int(32, i as i64);
                vec = self.emit(
                    bb,
                    &mut cursor,
                    vec_ty.clone(),
                    ValueKind::InsertElement { vec, elt, lane },
                );
            }
        }

        let s0_ptr = self
            .func
            .pointer_operand(s0)
            .expect("store must have a pointer operand");
        let cast = self.emit(
            bb,
            &mut cursor,
            Type::ptr(vec_ty, addr_space),
            ValueKind::Cast {
                op: CastOp::BitCast,
                arg: s0_ptr,
            },
        );
        self.emit(
            bb,
            &mut cursor,
            Type::Void,
            ValueKind::Store {
                ptr: cast,
                value: vec,
                align: alignment,
                simple: true,
            },
        );

        self.erase_chain(chain);
        self.bump_counters(chain_size);
        true
    }

    fn vectorize_load_chain(&mut self, chain: &[ValueId]) -> bool {
        let load_ty = self.unify_element_ty(chain);
        let sz = self.layout.type_size_in_bits(&load_ty) as u32;
        let l0 = chain[0];
        let addr_space = self
            .func
            .pointer_addr_space(l0)
            .expect("load must have a pointer operand");
        let vec_reg = self.target.vec_reg_bit_width(addr_space);
        let chain_size = chain.len();

        if !sz.is_power_of_two() || vec_reg / sz < 2 || chain_size < 2 {
            return false;
        }
        let vf = (vec_reg / sz) as usize;

        let sz_bytes = (sz / 8) as usize * chain_size;
        if sz_bytes > 2 && sz_bytes % 4 != 0 {
            if sz_bytes == 3 {
                return self.vectorize_load_chain(&chain[..chain_size - 1]);
            }
            let split = self.split_odd_point(chain_size, sz);
            let left = self.vectorize_load_chain(&chain[..split]);
            let right = self.vectorize_load_chain(&chain[split..]);
            return left | right;
        }

        let elem_lanes = load_ty.lanes();
        let scalar = load_ty.scalar_ty().clone();
        let vec_ty = Type::vector(scalar.clone(), elem_lanes * chain_size as u32);

        if chain_size > vf {
            let left = self.vectorize_load_chain(&chain[..vf]);
            let right = self.vectorize_load_chain(&chain[vf..]);
            return left | right;
        }

        let Some(alignment) = self.check_alignment(l0, addr_space, sz_bytes) else {
            return false;
        };

        let bb = self.func.block_of(l0).expect("chain member must be placed");
        let (first, last) = self.boundary_positions(chain, bb);
        if !self.legal_to_vectorize(chain, bb, first, last) {
            return false;
        }

        let mut cursor = last;
        let l0_ptr = self
            .func
            .pointer_operand(l0)
            .expect("load must have a pointer operand");
        let cast = self.emit(
            bb,
            &mut cursor,
            Type::ptr(vec_ty.clone(), addr_space),
            ValueKind::Cast {
                op: CastOp::BitCast,
                arg: l0_ptr,
            },
        );
        let wide = self.emit(
            bb,
            &mut cursor,
            vec_ty,
            ValueKind::Load {
                ptr: cast,
                align: alignment,
                simple: true,
            },
        );

        let mut to_reorder: SmallVec<[ValueId; 16]> = SmallVec::new();
        if elem_lanes > 1 {
            // Users are constant-index extracts; re-point each at the
            // corresponding lane of the wide load.
            let mut to_erase: SmallVec<[ValueId; 16]> = SmallVec::new();
            for (i, &member) in chain.iter().enumerate() {
                for user in self.func.users(member) {
                    let lane = match self.func.kind(user) {
                        ValueKind::ExtractElement { lane, .. } => *lane,
                        _ => panic!("vector load user is not an extraction"),
                    };
                    let old_lane = self
                        .func
                        .const_int_value(lane)
                        .expect("vector load user must extract a constant lane");
                    let new_lane = self
                        .func
                        .const_int(32, old_lane + (i as i64) * i64::from(elem_lanes));
                    let mut ext = self.emit(
                        bb,
                        &mut cursor,
                        scalar.clone(),
                        ValueKind::ExtractElement {
                            vec: wide,
                            lane: new_lane,
                        },
                    );
                    if self.func.ty(ext) != self.func.ty(user) {
                        let user_ty = self.func.ty(user).clone();
                        ext = self.emit(
                            bb,
                            &mut cursor,
                            user_ty,
                            ValueKind::Cast {
                                op: CastOp::BitCast,
                                arg: ext,
                            },
                        );
                    }
                    self.func.replace_all_uses(user, ext);
                    to_reorder.push(ext);
                    to_erase.push(user);
                }
            }
            for v in to_reorder {
                self.reorder(v);
            }
            for u in to_erase {
                self.func.erase(u);
            }
        } else {
            for (i, &member) in chain.iter().enumerate() {
                let lane = self.func.const_int(32, i as i64);
                let mut ext = self.emit(
                    bb,
                    &mut cursor,
                    scalar.clone(),
                    ValueKind::ExtractElement { vec: wide, lane },
                );
                if self.func.ty(ext) != self.func.ty(member) {
                    let member_ty = self.func.ty(member).clone();
                    ext = self.emit(
                        bb,
                        &mut cursor,
                        member_ty,
                        ValueKind::Cast {
                            op: CastOp::BitCast,
                            arg: ext,
                        },
                    );
                }
                self.func.replace_all_uses(member, ext);
                to_reorder.push(ext);
            }
            for v in to_reorder {
                self.reorder(v);
            }
        }

        self.erase_chain(chain);
        self.bump_counters(chain_size);
        true
    }

    /// Moves users that now sit above their (later) definition down past it.
    /// Phi operands are block-edge-bound and never move.
    fn reorder(&mut self, inst: ValueId) {
        let mut insert_after = inst;
        for user in self.func.users(inst) {
            if !self.func.is_placed(user) {
                continue;
            }
            if matches!(self.func.kind(user), ValueKind::Phi { .. }) {
                continue;
            }
            if !self.dom.value_dominates(self.func, inst, user) {
                self.func.remove_from_block(user);
                self.func.insert_after(insert_after, user);
                insert_after = user;
                self.reorder(user);
            }
        }
    }

    fn erase_chain(&mut self, chain: &[ValueId]) {
        let mut instrs: SmallVec<[ValueId; 16]> = SmallVec::new();
        for &member in chain {
            let ptr = self
                .func
                .pointer_operand(member)
                .expect("chain member must have a pointer operand");
            instrs.push(member);
            if matches!(self.func.kind(ptr), ValueKind::Gep { .. }) {
                instrs.push(ptr);
            }
        }
        for v in instrs {
            if !self.func.has_users(v) {
                self.func.erase(v);
            }
        }
    }

    fn bump_counters(&mut self, chain_size: usize) {
        self.stats.vector_instructions += 1;
        self.stats.scalars_vectorized += chain_size;
        VECTOR_INSTRUCTIONS.fetch_add(1, Ordering::Relaxed);
        SCALARS_VECTORIZED.fetch_add(chain_size, Ordering::Relaxed);
    }
}

fn wrap_to(value: i64, bits: u32) -> i64 {
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    (value << shift) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verify::verify_ir;

    fn one_block_fn(name: &str) -> Function {
        let mut f = Function::new(name);
        let b0 = f.add_block();
        f.entry = b0;
        f.blocks[b0].term = Terminator::Return(None);
        f
    }

    fn env() -> (TargetInfo, DataLayout) {
        (TargetInfo::default(), DataLayout::default())
    }

    fn alloca(f: &mut Function, elem: Type, align: u32) -> ValueId {
        let bb = f.entry;
        f.append(bb, Type::ptr(elem, 0), ValueKind::Alloca { align })
    }

    fn gep(f: &mut Function, base: ValueId, idx: i64) -> ValueId {
        let bb = f.entry;
        let c = f.const_int(64, idx);
        let ty = f.ty(base).clone();
        f.append(
            bb,
            ty,
            ValueKind::Gep {
                base,
                indices: vec![c],
                inbounds: true,
            },
        )
    }

    fn store_to(f: &mut Function, ptr: ValueId, value: ValueId, align: u32) -> ValueId {
        let bb = f.entry;
        f.append(
            bb,
            Type::Void,
            ValueKind::Store {
                ptr,
                value,
                align,
                simple: true,
            },
        )
    }

    fn load_from(f: &mut Function, ptr: ValueId, align: u32) -> ValueId {
        let bb = f.entry;
        let ty = f.ty(ptr).pointee().expect("load pointer").clone();
        f.append(
            bb,
            ty,
            ValueKind::Load {
                ptr,
                align,
                simple: true,
            },
        )
    }

    fn placed_wide_store(f: &Function) -> Option<ValueId> {
        f.values.iter().find_map(|v| match &v.kind {
            ValueKind::Store { value, .. }
                if v.block.is_some() && f.ty(*value).is_vector() =>
            {
                Some(v.id)
            }
            _ => None,
        })
    }

    fn placed_wide_load(f: &Function) -> Option<ValueId> {
        f.values.iter().find_map(|v| match &v.kind {
            ValueKind::Load { .. } if v.block.is_some() && v.ty.is_vector() => Some(v.id),
            _ => None,
        })
    }

    #[test]
    fn stores_out_of_program_order_form_one_chain() {
        let (target, layout) = env();
        let mut f = one_block_fn("shuffled_stores");
        let a = alloca(&mut f, Type::int(32), 4);
        let vals: Vec<ValueId> = (0..4)
            .map(|i| f.add_value(Type::int(32), ValueKind::Param { index: i }))
            .collect();
        let mut stores = Vec::new();
        for idx in [2i64, 3, 0, 1] {
            let g = gep(&mut f, a, idx);
            stores.push(store_to(&mut f, g, vals[idx as usize], 4));
        }

        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert_eq!(stats.vector_instructions, 1);
        assert_eq!(stats.scalars_vectorized, 4);
        for s in stores {
            assert!(f.is_erased(s), "original store should be erased");
        }
        let wide = placed_wide_store(&f).expect("expected one wide store");
        let ValueKind::Store { value, .. } = f.kind(wide) else {
            unreachable!()
        };
        assert_eq!(*f.ty(*value), Type::vector(Type::int(32), 4));
        verify_ir(&f).expect("rewritten IR must verify");
    }

    #[test]
    fn load_chain_rethreads_scalar_users() {
        let (target, layout) = env();
        let mut f = one_block_fn("three_loads");
        let a = alloca(&mut f, Type::int(32), 16);
        let mut loads = Vec::new();
        for idx in 0..3 {
            let g = gep(&mut f, a, idx);
            loads.push(load_from(&mut f, g, 4));
        }
        let bb = f.entry;
        let sum01 = f.append(
            bb,
            Type::int(32),
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: loads[0],
                rhs: loads[1],
                nsw: false,
                nuw: false,
            },
        );
        let sum = f.append(
            bb,
            Type::int(32),
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: sum01,
                rhs: loads[2],
                nsw: false,
                nuw: false,
            },
        );

        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert_eq!(stats.vector_instructions, 1);
        assert_eq!(stats.scalars_vectorized, 3);
        let wide = placed_wide_load(&f).expect("expected one wide load");
        assert_eq!(*f.ty(wide), Type::vector(Type::int(32), 3));
        for l in loads {
            assert!(f.is_erased(l));
        }
        // Both adds now consume lane extractions of the wide load.
        let ValueKind::Binary { lhs, rhs, .. } = f.kind(sum) else {
            unreachable!()
        };
        assert_eq!(*lhs, sum01);
        assert!(matches!(
            f.kind(*rhs),
            ValueKind::ExtractElement { vec, .. } if *vec == wide
        ));
        verify_ir(&f).expect("rewritten IR must verify");
    }

    #[test]
    fn reorder_moves_early_users_below_the_wide_load() {
        let (target, layout) = env();
        let mut f = one_block_fn("early_user");
        let a = alloca(&mut f, Type::int(32), 16);
        let g0 = gep(&mut f, a, 0);
        let l0 = load_from(&mut f, g0, 4);
        // A user placed between the chain members, above the insertion point.
        let bb = f.entry;
        let doubled = f.append(
            bb,
            Type::int(32),
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: l0,
                rhs: l0,
                nsw: false,
                nuw: false,
            },
        );
        let g1 = gep(&mut f, a, 1);
        let _l1 = load_from(&mut f, g1, 4);

        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert!(stats.changed());
        // The add must have been pushed below the extraction that now feeds it.
        let ValueKind::Binary { lhs, .. } = f.kind(doubled) else {
            unreachable!()
        };
        let def_pos = f.position_in_block(*lhs).expect("extract is placed");
        let use_pos = f.position_in_block(doubled).expect("user is placed");
        assert!(def_pos < use_pos, "user must follow its new definition");
        verify_ir(&f).expect("rewritten IR must verify");
    }

    #[test]
    fn mixed_float_int_chain_unifies_to_int() {
        let (target, layout) = env();
        let mut f = one_block_fn("mixed_elems");
        let a = alloca(&mut f, Type::float(32), 8);
        let g0 = gep(&mut f, a, 0);
        let l0 = load_from(&mut f, g0, 4);
        let g1 = gep(&mut f, a, 1);
        let bb = f.entry;
        let c1 = f.append(
            bb,
            Type::ptr(Type::int(32), 0),
            ValueKind::Cast {
                op: CastOp::BitCast,
                arg: g1,
            },
        );
        let _l1 = load_from(&mut f, c1, 4);
        let user = f.append(
            bb,
            Type::float(32),
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: l0,
                rhs: l0,
                nsw: false,
                nuw: false,
            },
        );

        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert!(stats.changed());
        let wide = placed_wide_load(&f).expect("expected one wide load");
        // The integer member decides the element type.
        assert_eq!(*f.ty(wide), Type::vector(Type::int(32), 2));
        // The float member's users see a bitcast back to float.
        let ValueKind::Binary { lhs, .. } = f.kind(user) else {
            unreachable!()
        };
        assert!(matches!(
            f.kind(*lhs),
            ValueKind::Cast {
                op: CastOp::BitCast,
                ..
            }
        ));
        assert_eq!(*f.ty(*lhs), Type::float(32));
        verify_ir(&f).expect("rewritten IR must verify");
    }

    #[test]
    fn vector_members_rethread_constant_lane_extracts() {
        let (target, layout) = env();
        let mut f = one_block_fn("vector_members");
        let elem = Type::vector(Type::int(16), 2);
        let a = alloca(&mut f, elem.clone(), 8);
        let g0 = gep(&mut f, a, 0);
        let l0 = load_from(&mut f, g0, 4);
        let g1 = gep(&mut f, a, 1);
        let l1 = load_from(&mut f, g1, 4);
        let bb = f.entry;
        let mut old_extracts = Vec::new();
        for &(src, lane) in &[(l0, 0i64), (l0, 1), (l1, 0), (l1, 1)] {
            let c = f.const_int(32, lane);
            old_extracts.push(f.append(
                bb,
                Type::int(16),
                ValueKind::ExtractElement { vec: src, lane: c },
            ));
        }

        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert_eq!(stats.vector_instructions, 1);
        assert_eq!(stats.scalars_vectorized, 2);
        let wide = placed_wide_load(&f).expect("expected one wide load");
        assert_eq!(*f.ty(wide), Type::vector(Type::int(16), 4));
        for e in old_extracts {
            assert!(f.is_erased(e), "original extraction should be erased");
        }
        let mut lanes: Vec<i64> = f
            .values
            .iter()
            .filter_map(|v| match &v.kind {
                ValueKind::ExtractElement { vec, lane } if *vec == wide => {
                    f.const_int_value(*lane)
                }
                _ => None,
            })
            .collect();
        lanes.sort_unstable();
        assert_eq!(lanes, vec![0, 1, 2, 3]);
        verify_ir(&f).expect("rewritten IR must verify");
    }

    #[test]
    fn side_effecting_call_blocks_chain() {
        let (target, layout) = env();
        let mut f = one_block_fn("call_between");
        let a = alloca(&mut f, Type::int(32), 16);
        let x = f.add_value(Type::int(32), ValueKind::Param { index: 0 });
        let g0 = gep(&mut f, a, 0);
        let s0 = store_to(&mut f, g0, x, 4);
        let bb = f.entry;
        f.append(
            bb,
            Type::Void,
            ValueKind::Call {
                callee: "may_write".into(),
                args: Vec::new(),
                side_effects: true,
            },
        );
        let g1 = gep(&mut f, a, 1);
        let s1 = store_to(&mut f, g1, x, 4);

        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert!(!stats.changed());
        assert!(f.is_placed(s0) && f.is_placed(s1));
    }

    #[test]
    fn atomic_store_in_range_blocks_chain() {
        let (target, layout) = env();
        let mut f = one_block_fn("atomic_between");
        let a = alloca(&mut f, Type::int(32), 16);
        let b = alloca(&mut f, Type::int(32), 4);
        let x = f.add_value(Type::int(32), ValueKind::Param { index: 0 });
        let g0 = gep(&mut f, a, 0);
        let s0 = store_to(&mut f, g0, x, 4);
        let bb = f.entry;
        f.append(
            bb,
            Type::Void,
            ValueKind::Store {
                ptr: b,
                value: x,
                align: 4,
                simple: false,
            },
        );
        let g1 = gep(&mut f, a, 1);
        let s1 = store_to(&mut f, g1, x, 4);

        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert!(!stats.changed());
        assert!(f.is_placed(s0) && f.is_placed(s1));
    }

    #[test]
    fn aliasing_store_between_loads_blocks_chain() {
        let (target, layout) = env();
        let mut f = one_block_fn("clobber_between");
        let a = alloca(&mut f, Type::int(32), 16);
        let p = f.add_value(Type::ptr(Type::int(32), 0), ValueKind::Param { index: 0 });
        let x = f.add_value(Type::int(32), ValueKind::Param { index: 1 });
        let g0 = gep(&mut f, a, 0);
        let _l0 = load_from(&mut f, g0, 4);
        // A store through an unknown pointer may clobber the chain range.
        store_to(&mut f, p, x, 4);
        let g1 = gep(&mut f, a, 1);
        let _l1 = load_from(&mut f, g1, 4);

        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert!(!stats.changed());
    }

    #[test]
    fn three_byte_chain_drops_the_tail_element() {
        let (target, layout) = env();
        let mut f = one_block_fn("byte_loads");
        let a = alloca(&mut f, Type::int(8), 1);
        let mut loads = Vec::new();
        for idx in 0..3 {
            let g = gep(&mut f, a, idx);
            loads.push(load_from(&mut f, g, 0));
        }

        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert_eq!(stats.vector_instructions, 1);
        assert_eq!(stats.scalars_vectorized, 2);
        let wide = placed_wide_load(&f).expect("expected one wide load");
        assert_eq!(*f.ty(wide), Type::vector(Type::int(8), 2));
        assert!(f.is_erased(loads[0]) && f.is_erased(loads[1]));
        assert!(f.is_placed(loads[2]), "tail element stays scalar");
        // The stack slot's alignment was raised to satisfy the wide access.
        assert!(matches!(f.kind(a), ValueKind::Alloca { align: 4 }));
        verify_ir(&f).expect("rewritten IR must verify");
    }

    #[test]
    fn wide_chain_splits_at_the_vector_factor() {
        let (target, layout) = env();
        let mut f = one_block_fn("eight_stores");
        let a = alloca(&mut f, Type::int(32), 16);
        let x = f.add_value(Type::int(32), ValueKind::Param { index: 0 });
        for idx in 0..8 {
            let g = gep(&mut f, a, idx);
            store_to(&mut f, g, x, 4);
        }

        // VF is 4 for 32-bit elements in a 128-bit register.
        let stats = optimize_with_stats(&mut f, &target, &layout);
        assert_eq!(stats.vector_instructions, 2);
        assert_eq!(stats.scalars_vectorized, 8);
        verify_ir(&f).expect("rewritten IR must verify");
    }
}
