use crate::error::{RangeCode, RangeException, Stage, RR};
use crate::mir::analyze::range::{
    Range, INCLUDES_INFINITY, NO_INT32_LOWER_BOUND, NO_INT32_UPPER_BOUND,
};
use crate::mir::analyze::symbolic::BoundArena;
use crate::mir::flow::Cfg;
use crate::mir::opt::loop_analysis::{LoopAnalyzer, LoopInfo};
use crate::mir::opt::{RangeConfig, RangeStats};
use crate::mir::*;
use std::cmp::max;
use std::fmt::Write as _;
use tracing::{debug, debug_span, trace};

/// Range analysis over one function.
///
/// The analysis borrows the function for its whole life. Blocks never change
/// while it runs, so the control-flow facts and the loop forest are computed
/// once up front. Symbolic bounds attached to ranges are indices into
/// `arena`, which dies with the analysis.
pub struct RangeAnalysis<'a> {
    pub(crate) fn_ir: &'a mut FnIR,
    pub(crate) cfg: Cfg,
    pub(crate) loops: Vec<LoopInfo>,
    pub(crate) config: RangeConfig,
    pub(crate) arena: BoundArena,
    pub(crate) stats: RangeStats,
}

pub(crate) fn has_numeric_type(ty: MirType) -> bool {
    matches!(ty, MirType::Int32 | MirType::Double | MirType::Boolean)
}

fn scalar_range(elem: ScalarType, ty: MirType) -> Range {
    match elem {
        ScalarType::Int8 => Range::int32(i8::MIN as i32, i8::MAX as i32),
        ScalarType::Uint8 | ScalarType::Uint8Clamped => Range::int32(0, u8::MAX as i32),
        ScalarType::Int16 => Range::int32(i16::MIN as i32, i16::MAX as i32),
        ScalarType::Uint16 => Range::int32(0, u16::MAX as i32),
        ScalarType::Int32 => Range::int32(i32::MIN, i32::MAX),
        ScalarType::Uint32 => Range::uint32(0, u32::MAX),
        ScalarType::Float32 | ScalarType::Float64 => Range::for_type(ty),
    }
}

/// Drops every part of `new` that still moved since `old` to its limit.
/// `new` must contain `old`.
fn widen(old: &Range, new: &Range) -> Range {
    let l = if new.has_int32_lower_bound() && new.lower() >= old.lower() {
        new.lower() as i64
    } else {
        NO_INT32_LOWER_BOUND
    };
    let h = if new.has_int32_upper_bound() && new.upper() <= old.upper() {
        new.upper() as i64
    } else {
        NO_INT32_UPPER_BOUND
    };
    let e = if new.max_exponent() > old.max_exponent() {
        max(new.max_exponent(), INCLUDES_INFINITY)
    } else {
        new.max_exponent()
    };
    Range::new(l, h, new.can_have_fractional_part(), e)
}

impl<'a> RangeAnalysis<'a> {
    pub fn new(fn_ir: &'a mut FnIR, config: RangeConfig) -> Self {
        let cfg = Cfg::new(fn_ir);
        let loops = LoopAnalyzer::new(fn_ir, &cfg).find_loops();
        Self {
            fn_ir,
            cfg,
            loops,
            config,
            arena: BoundArena::new(config.arena_capacity),
            stats: RangeStats::default(),
        }
    }

    pub fn fn_ir(&self) -> &FnIR {
        self.fn_ir
    }

    pub fn arena(&self) -> &BoundArena {
        &self.arena
    }

    pub fn stats(&self) -> RangeStats {
        self.stats
    }

    /// Computes a range for every numeric value, infers loop bounds, hoists
    /// bounds checks and finally records which arithmetic can no longer
    /// overflow.
    pub fn analyze(&mut self) -> RR<()> {
        let span = debug_span!("analyze", function = %self.fn_ir.name);
        let _enter = span.enter();

        for val in &mut self.fn_ir.values {
            val.range = None;
        }
        self.compute_fixed_point()?;

        let loops = self.loops.clone();
        for lp in &loops {
            if self.fn_ir.blocks[lp.header].unreachable {
                continue;
            }
            self.analyze_loop(lp)?;
        }

        // Body values see the refined loop phis.
        self.propagate_pass(None);
        self.stats.unreachable_blocks = self
            .fn_ir
            .blocks
            .iter()
            .filter(|b| b.unreachable)
            .count();

        self.collect_range_info();
        debug!("ranges:\n{}", self.dump_ranges());
        Ok(())
    }

    fn compute_fixed_point(&mut self) -> RR<()> {
        let mut pass = 0;
        loop {
            pass += 1;
            if pass > self.config.max_iterations {
                return Err(RangeException::new(
                    "InternalError",
                    RangeCode::E4002,
                    Stage::Analyze,
                    format!(
                        "range analysis did not converge after {} passes",
                        self.config.max_iterations
                    ),
                )
                .note("raise IONRANGE_MAX_ITERATIONS or lower IONRANGE_WIDEN_AFTER"));
            }
            let widening = pass > self.config.widen_after;
            let changed = self.propagate_pass(Some(widening));
            trace!(pass, changed, "range pass");
            if !changed {
                break;
            }
        }
        self.stats.fixpoint_passes += pass;
        Ok(())
    }

    /// One RPO sweep. With `merge_loops = Some(widen)` loop phis are merged
    /// monotonically and the return value says whether any of them moved;
    /// with `None` loop phis keep their current (refined) ranges.
    fn propagate_pass(&mut self, merge_loops: Option<bool>) -> bool {
        for blk in &mut self.fn_ir.blocks {
            blk.unreachable = false;
        }
        let mut changed = false;
        let rpo = self.cfg.rpo.clone();
        for bid in rpo {
            if self.block_is_dead(bid) {
                self.fn_ir.blocks[bid].unreachable = true;
            }
            for vid in self.fn_ir.block_values(bid) {
                if self.is_loop_phi(vid) {
                    if let Some(widening) = merge_loops {
                        changed |= self.merge_loop_phi(vid, widening);
                    }
                } else {
                    self.recompute(vid);
                }
            }
        }
        changed
    }

    fn block_is_dead(&self, bid: BlockId) -> bool {
        if bid == self.fn_ir.entry {
            return false;
        }
        if let Some(dom) = self.cfg.idom(bid) {
            if self.fn_ir.blocks[dom].unreachable {
                return true;
            }
        }
        let mut preds = self.cfg.preds[bid]
            .iter()
            .filter(|p| self.cfg.is_reachable(**p))
            .peekable();
        preds.peek().is_some() && preds.all(|p| self.fn_ir.blocks[*p].unreachable)
    }

    /// A phi with an incoming edge from a block not yet visited in RPO.
    pub(crate) fn is_loop_phi(&self, vid: ValueId) -> bool {
        let val = &self.fn_ir.values[vid];
        if !val.kind.is_phi() {
            return false;
        }
        let Some(bid) = val.block else {
            return false;
        };
        let Some(own) = self.cfg.rpo_index(bid) else {
            return false;
        };
        self.cfg.preds[bid]
            .iter()
            .any(|p| self.cfg.rpo_index(*p).is_some_and(|i| i >= own))
    }

    fn merge_loop_phi(&mut self, vid: ValueId, widening: bool) -> bool {
        let Some(inputs) = self.phi_union(vid) else {
            return false;
        };
        let ty = self.fn_ir.values[vid].ty;
        let Some(old) = self.fn_ir.values[vid].range else {
            self.fn_ir.values[vid].range = Some(self.finalize(vid, inputs));
            return true;
        };
        let mut merged = old;
        merged.union_with(&inputs);
        if ty == MirType::Int32 {
            merged.clamp_to_int32();
        }
        if widening && merged != old {
            merged = widen(&old, &merged);
            if ty == MirType::Int32 {
                merged.clamp_to_int32();
            }
            self.stats.widened_phis += 1;
        }
        let mut cur = old;
        let changed = cur.update(&merged);
        if changed {
            trace!(phi = vid, range = %merged, "loop phi moved");
            self.fn_ir.values[vid].range = Some(cur);
        }
        changed
    }

    /// Union of the phi inputs arriving over live edges that already have
    /// a range.
    fn phi_union(&self, vid: ValueId) -> Option<Range> {
        let ValueKind::Phi { args } = &self.fn_ir.values[vid].kind else {
            return None;
        };
        let mut acc: Option<Range> = None;
        for (arg, pred) in args {
            if !self.cfg.is_reachable(*pred) || self.fn_ir.blocks[*pred].unreachable {
                continue;
            }
            if self.fn_ir.values[*arg].range.is_none() {
                continue;
            }
            let r = self.operand_range(*arg);
            match &mut acc {
                Some(a) => a.union_with(&r),
                None => acc = Some(r),
            }
        }
        acc
    }

    /// Recomputes the range of a non-loop value and records dead refinements.
    pub(crate) fn recompute(&mut self, vid: ValueId) {
        if let ValueKind::Beta { input, refinement } = self.fn_ir.values[vid].kind {
            let input_range = self.operand_range(input);
            let r = match Range::intersect(&input_range, &refinement) {
                Some(r) => r,
                None => {
                    if let Some(bid) = self.fn_ir.values[vid].block {
                        trace!(beta = vid, block = bid, "empty refinement");
                        self.fn_ir.blocks[bid].unreachable = true;
                    }
                    input_range
                }
            };
            self.fn_ir.values[vid].range = Some(self.finalize(vid, r));
            return;
        }
        let r = self.compute_range(vid);
        self.fn_ir.values[vid].range = r;
    }

    /// Range of `vid` as an operand: its computed range, or the default of
    /// its type, clamped to what the type can hold.
    pub(crate) fn operand_range(&self, vid: ValueId) -> Range {
        let val = &self.fn_ir.values[vid];
        let mut r = val
            .range
            .map(Range::without_symbolic)
            .unwrap_or_else(|| Range::for_type(val.ty));
        match val.ty {
            MirType::Int32 => r.clamp_to_int32(),
            MirType::Boolean => r.wrap_around_to_boolean(),
            _ => {}
        }
        r
    }

    // Arithmetic that may leave int32 keeps its unclamped range so that
    // `collect_range_info` can tell whether it overflows.
    fn keeps_overflow(kind: &ValueKind) -> bool {
        match kind {
            ValueKind::Binary { op, flags, .. } => op.is_arith() && !flags.wrapping,
            ValueKind::Unary { op, .. } => *op == UnaryOp::Abs,
            _ => false,
        }
    }

    fn finalize(&self, vid: ValueId, mut r: Range) -> Range {
        let val = &self.fn_ir.values[vid];
        match val.ty {
            MirType::Int32 if !Self::keeps_overflow(&val.kind) => r.clamp_to_int32(),
            MirType::Boolean => r.wrap_around_to_boolean(),
            _ => {}
        }
        r
    }

    /// Per-opcode range of `vid` from the current ranges of its operands.
    /// `None` for values that produce no number.
    pub(crate) fn compute_range(&self, vid: ValueId) -> Option<Range> {
        let val = &self.fn_ir.values[vid];
        if !has_numeric_type(val.ty) {
            return None;
        }
        let r = match &val.kind {
            ValueKind::Const(Lit::Int(n)) => Range::int32(*n, *n),
            ValueKind::Const(Lit::Double(d)) => Range::from_f64_singleton(*d),
            ValueKind::Const(Lit::Bool(b)) => Range::int32(*b as i32, *b as i32),
            ValueKind::Param { .. } | ValueKind::Call { .. } | ValueKind::LoadElement { .. } => {
                Range::for_type(val.ty)
            }
            ValueKind::Phi { .. } => self.phi_union(vid)?,
            ValueKind::Beta { input, refinement } => {
                let input_range = self.operand_range(*input);
                Range::intersect(&input_range, refinement).unwrap_or(input_range)
            }
            ValueKind::Binary {
                op,
                lhs,
                rhs,
                flags,
            } => self.binary_range(val.ty, *op, *lhs, *rhs, *flags),
            ValueKind::Unary { op, rhs } => self.unary_range(*op, *rhs),
            ValueKind::Compare { .. } => Range::int32(0, 1),
            ValueKind::ArrayLength { .. } | ValueKind::TypedArrayLength { .. } => {
                Range::int32(0, i32::MAX)
            }
            ValueKind::LoadTypedArray { elem, .. } => scalar_range(*elem, val.ty),
            ValueKind::BoundsCheck {
                index,
                length,
                minimum,
                maximum,
                ..
            } => self.bounds_check_range(*index, *length, *minimum, *maximum),
            ValueKind::StoreElement { .. }
            | ValueKind::BoundsCheckLower { .. }
            | ValueKind::AssertRange { .. } => return None,
        };
        Some(self.finalize(vid, r))
    }

    fn binary_range(
        &self,
        ty: MirType,
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
        flags: ArithFlags,
    ) -> Range {
        let l = self.operand_range(lhs);
        let r = self.operand_range(rhs);
        let shift = self.fn_ir.as_const_int(rhs);
        let mut out = match op {
            BinOp::Add => Range::add(&l, &r),
            BinOp::Sub => Range::sub(&l, &r),
            BinOp::Mul => Range::mul(&l, &r),
            BinOp::Div => Range::div(&l, &r, ty == MirType::Int32),
            BinOp::Mod => Range::mod_(&l, &r),
            BinOp::BitAnd => Range::and_(&l, &r),
            BinOp::BitOr => Range::or_(&l, &r),
            BinOp::BitXor => Range::xor_(&l, &r),
            BinOp::Lsh => match shift {
                Some(c) => Range::lsh_const(&l, c),
                None => Range::lsh(&l, &r),
            },
            BinOp::Rsh => match shift {
                Some(c) => Range::rsh_const(&l, c),
                None => Range::rsh(&l, &r),
            },
            BinOp::Ursh => match shift {
                Some(c) => Range::ursh_const(&l, c),
                None => Range::ursh(&l, &r),
            },
            BinOp::Min => Range::min(&l, &r),
            BinOp::Max => Range::max(&l, &r),
        };
        if ty == MirType::Int32 {
            if op == BinOp::Ursh && !out.has_int32_upper_bound() {
                out.extend_uint32_to_int32_min();
            }
            if flags.wrapping {
                out.wrap_around_to_int32();
            }
        }
        out
    }

    fn unary_range(&self, op: UnaryOp, rhs: ValueId) -> Range {
        let o = self.operand_range(rhs);
        match op {
            UnaryOp::BitNot => Range::not_(&o),
            UnaryOp::Abs => Range::abs(&o),
            UnaryOp::Floor => Range::floor(&o),
            UnaryOp::Ceil => Range::ceil(&o),
            UnaryOp::Sqrt => Range::sqrt(&o),
            UnaryOp::ToInt32 => {
                let mut r = o;
                r.wrap_around_to_int32();
                r
            }
            UnaryOp::ToDouble => o,
        }
    }

    // A passing check pins the index to [-minimum, length.upper - 1 - maximum].
    fn bounds_check_range(
        &self,
        index: ValueId,
        length: ValueId,
        minimum: i32,
        maximum: i32,
    ) -> Range {
        let idx = self.operand_range(index);
        let len = self.operand_range(length);
        let upper = if len.has_int32_upper_bound() {
            len.upper() as i64 - 1 - maximum as i64
        } else {
            NO_INT32_UPPER_BOUND
        };
        let lower = -(minimum as i64);
        if upper < lower {
            // The check always fails; nothing after it runs.
            return idx;
        }
        let pass = Range::new(lower, upper, false, 31);
        Range::intersect(&idx, &pass).unwrap_or(idx)
    }

    /// Uses the final ranges to drop overflow and edge-case checks on int32
    /// arithmetic.
    pub(crate) fn collect_range_info(&mut self) {
        for vid in 0..self.fn_ir.values.len() {
            if self.fn_ir.values[vid].block.is_none() || self.fn_ir.values[vid].ty != MirType::Int32 {
                continue;
            }
            let ValueKind::Binary {
                op,
                lhs,
                rhs,
                mut flags,
            } = self.fn_ir.values[vid].kind
            else {
                continue;
            };
            if flags.wrapping {
                continue;
            }
            let Some(range) = self.fn_ir.values[vid].range else {
                continue;
            };
            let l = self.operand_range(lhs);
            let r = self.operand_range(rhs);
            let was_fallible = flags.fallible;
            match op {
                BinOp::Add | BinOp::Sub => {
                    if range.has_int32_bounds() {
                        flags.fallible = false;
                    }
                }
                BinOp::Mul => {
                    flags.can_be_negative_zero = Range::negative_zero_mul(&l, &r);
                    if range.has_int32_bounds() && !flags.can_be_negative_zero {
                        flags.fallible = false;
                    }
                }
                BinOp::Div => {
                    flags.can_be_negative_zero = l.can_be_zero() && r.can_be_finite_negative();
                    flags.can_be_divide_by_zero = r.can_be_zero();
                }
                BinOp::Mod => {
                    flags.can_be_negative_zero = l.can_be_finite_negative();
                    flags.can_be_divide_by_zero = r.can_be_zero();
                }
                _ => continue,
            }
            if was_fallible && !flags.fallible {
                trace!(value = vid, "overflow check removed");
                self.stats.overflow_checks_removed += 1;
            }
            if let ValueKind::Binary { flags: f, .. } = &mut self.fn_ir.values[vid].kind {
                *f = flags;
            }
        }
    }

    /// Every placed value with its range, block by block, symbolic bounds
    /// resolved through the arena.
    pub fn dump_ranges(&self) -> String {
        let mut out = String::new();
        for blk in &self.fn_ir.blocks {
            let _ = writeln!(
                out,
                "block {}{}:",
                blk.id,
                if blk.unreachable { " (unreachable)" } else { "" }
            );
            for vid in self.fn_ir.block_values(blk.id) {
                let val = &self.fn_ir.values[vid];
                match &val.range {
                    Some(r) => {
                        let _ = writeln!(
                            out,
                            "  v{} {} : {}",
                            vid,
                            opcode_name(&val.kind),
                            self.arena.range_display(r)
                        );
                    }
                    None => {
                        let _ = writeln!(out, "  v{} {}", vid, opcode_name(&val.kind));
                    }
                }
            }
        }
        out
    }
}

pub(crate) fn opcode_name(kind: &ValueKind) -> String {
    match kind {
        ValueKind::Const(Lit::Int(n)) => format!("const {}", n),
        ValueKind::Const(Lit::Double(d)) => format!("const {}", d),
        ValueKind::Const(Lit::Bool(b)) => format!("const {}", b),
        ValueKind::Param { index } => format!("param {}", index),
        ValueKind::Phi { .. } => "phi".to_string(),
        ValueKind::Beta { input, .. } => format!("beta v{}", input),
        ValueKind::Binary { op, lhs, rhs, .. } => format!("{:?} v{} v{}", op, lhs, rhs),
        ValueKind::Unary { op, rhs } => format!("{:?} v{}", op, rhs),
        ValueKind::Compare { op, lhs, rhs } => format!("compare {:?} v{} v{}", op, lhs, rhs),
        ValueKind::ArrayLength { array } => format!("length v{}", array),
        ValueKind::TypedArrayLength { array } => format!("typedlength v{}", array),
        ValueKind::LoadElement { array, index } => format!("load v{}[v{}]", array, index),
        ValueKind::LoadTypedArray { array, index, elem } => {
            format!("load.{:?} v{}[v{}]", elem, array, index)
        }
        ValueKind::StoreElement { array, index, val } => {
            format!("store v{}[v{}] = v{}", array, index, val)
        }
        ValueKind::BoundsCheck { index, length, .. } => {
            format!("boundscheck v{} < v{}", index, length)
        }
        ValueKind::BoundsCheckLower { index, minimum } => {
            format!("boundschecklower v{} >= {}", index, minimum)
        }
        ValueKind::Call { callee, .. } => format!("call {}", callee),
        ValueKind::AssertRange { input, .. } => format!("assertrange v{}", input),
    }
}
