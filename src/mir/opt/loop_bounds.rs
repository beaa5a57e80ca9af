use crate::error::RR;
use crate::mir::analyze::range::Range;
use crate::mir::analyze::symbolic::{
    extract_linear_inequality, extract_linear_sum, LinearSum, LoopBoundId, LoopIterationBound,
    SymbolicBound, SymbolicId,
};
use crate::mir::opt::loop_analysis::LoopInfo;
use crate::mir::opt::range_analysis::RangeAnalysis;
use crate::mir::*;
use std::cmp::{max, min};
use tracing::{debug, trace};

/// The loop shape every inference below relies on: one way in, one way
/// back.
#[derive(Debug, Clone, Copy)]
struct LoopEdges {
    header: BlockId,
    preheader: BlockId,
    backedge: BlockId,
}

fn strip_betas(fn_ir: &FnIR, mut vid: ValueId) -> ValueId {
    while let ValueKind::Beta { input, .. } = fn_ir.values[vid].kind {
        vid = input;
    }
    vid
}

impl RangeAnalysis<'_> {
    /// Infers an iteration bound for the loop, then uses it to give the
    /// header phis symbolic bounds and to hoist bounds checks.
    pub(crate) fn analyze_loop(&mut self, lp: &LoopInfo) -> RR<()> {
        let (Some(backedge), Some(preheader)) = (lp.backedge(), lp.preheader()) else {
            return Ok(());
        };
        let edges = LoopEdges {
            header: lp.header,
            preheader,
            backedge,
        };

        // Walk up from the backedge looking for a test whose other
        // successor leaves the loop.
        let mut found = None;
        let mut block = backedge;
        while block != lp.header {
            if let Some(test_bb) = self.cfg.immediate_dominator_branch(self.fn_ir, block) {
                if let Terminator::If {
                    cond,
                    then_bb,
                    else_bb,
                } = self.fn_ir.blocks[test_bb].term
                {
                    let exit_direction = then_bb != block;
                    let other = if exit_direction { then_bb } else { else_bb };
                    if !lp.contains(other) {
                        if let Some(sum) =
                            self.analyze_loop_iteration_count(lp, edges, cond, exit_direction)
                        {
                            found = Some((test_bb, sum));
                            break;
                        }
                    }
                }
            }
            match self.cfg.idom(block) {
                Some(dom) => block = dom,
                None => break,
            }
        }
        let Some((test, sum)) = found else {
            trace!(header = lp.header, "no iteration bound");
            return Ok(());
        };

        debug!(header = lp.header, test, bound = %sum, "loop iteration bound");
        let bound = self.arena.alloc_loop_bound(LoopIterationBound {
            header: lp.header,
            test,
            sum,
        })?;
        self.stats.loop_bounds += 1;

        for phi in self.fn_ir.blocks[lp.header].phis.clone() {
            self.analyze_loop_phi(lp, edges, bound, phi)?;
        }

        if !self.config.hoist_bounds_checks {
            return Ok(());
        }
        let mut checks = Vec::new();
        for &bid in &self.cfg.rpo {
            if !lp.contains(bid) {
                continue;
            }
            for &vid in &self.fn_ir.blocks[bid].instrs {
                if matches!(
                    self.fn_ir.values[vid].kind,
                    ValueKind::BoundsCheck { movable: true, .. }
                ) {
                    checks.push(vid);
                }
            }
        }
        let mut hoisted = Vec::new();
        for check in checks {
            if self.try_hoist_bounds_check(lp, edges, check)? {
                hoisted.push(check);
            }
        }
        // The loads and stores behind a hoisted check now index directly.
        for check in hoisted {
            if let ValueKind::BoundsCheck { index, .. } = self.fn_ir.values[check].kind {
                self.fn_ir.replace_all_uses(check, index);
                self.fn_ir.remove_instr(check);
                self.stats.hoisted_checks += 1;
            }
        }
        Ok(())
    }

    /// Bound on the backedges taken by a loop leaving through `cond` on
    /// `exit_direction`, as a sum of loop-invariant terms.
    fn analyze_loop_iteration_count(
        &self,
        lp: &LoopInfo,
        edges: LoopEdges,
        cond: ValueId,
        exit_direction: bool,
    ) -> Option<LinearSum> {
        let ineq = extract_linear_inequality(self.fn_ir, cond, exit_direction)?;
        let mut lhs = ineq.lhs;
        let mut rhs = ineq.rhs;
        let mut less_equal = ineq.less_equal;

        // Keep the loop-variant side on the left.
        if let Some(r) = rhs {
            if lp.contains(self.fn_ir.def_block(r)) {
                if let Some(t) = lhs.term {
                    if lp.contains(self.fn_ir.def_block(t)) {
                        return None;
                    }
                }
                lhs.constant = 0i32.checked_sub(lhs.constant)?;
                rhs = lhs.term;
                lhs.term = Some(r);
                less_equal = !less_equal;
            }
        }

        let phi = lhs.term?;
        if self.fn_ir.values[phi].block != Some(edges.header) {
            return None;
        }
        let (initial, write) = self.phi_inputs(phi, edges)?;
        if lp.contains(self.fn_ir.def_block(initial)) {
            return None;
        }

        // The write must be an add/sub executed on every iteration.
        let write = strip_betas(self.fn_ir, write);
        let ValueKind::Binary {
            op: BinOp::Add | BinOp::Sub,
            flags,
            ..
        } = self.fn_ir.values[write].kind
        else {
            return None;
        };
        if flags.wrapping {
            return None;
        }
        let write_bb = self.fn_ir.values[write].block?;
        if !lp.contains(write_bb) || !self.cfg.dominates(write_bb, edges.backedge) {
            return None;
        }
        let modified = extract_linear_sum(self.fn_ir, write);
        if modified.term != Some(phi) {
            return None;
        }

        let mut bound = LinearSum::new();
        if modified.constant == 1 && !less_equal {
            // Exits once initial + iterations + c >= rhs.
            if let Some(r) = rhs {
                if !bound.add_term(self.fn_ir, r, 1) {
                    return None;
                }
            }
            if !bound.add_term(self.fn_ir, initial, -1) {
                return None;
            }
            if !bound.add_constant(0i32.checked_sub(lhs.constant)?) {
                return None;
            }
        } else if modified.constant == -1 && less_equal {
            // Exits once initial - iterations + c <= rhs.
            if !bound.add_term(self.fn_ir, initial, 1) {
                return None;
            }
            if let Some(r) = rhs {
                if !bound.add_term(self.fn_ir, r, -1) {
                    return None;
                }
            }
            if !bound.add_constant(lhs.constant) {
                return None;
            }
        } else {
            return None;
        }
        Some(bound)
    }

    // (entry input, backedge input) of a two-input header phi.
    fn phi_inputs(&self, phi: ValueId, edges: LoopEdges) -> Option<(ValueId, ValueId)> {
        let ValueKind::Phi { args } = &self.fn_ir.values[phi].kind else {
            return None;
        };
        if args.len() != 2 {
            return None;
        }
        let initial = args.iter().find(|(_, b)| *b == edges.preheader)?.0;
        let write = args.iter().find(|(_, b)| *b == edges.backedge)?.0;
        Some((initial, write))
    }

    /// Gives a header phi stepping by a constant its symbolic bounds for
    /// the loop and narrows its numeric range accordingly.
    fn analyze_loop_phi(
        &mut self,
        lp: &LoopInfo,
        edges: LoopEdges,
        bound: LoopBoundId,
        phi: ValueId,
    ) -> RR<()> {
        if self.fn_ir.values[phi].ty != MirType::Int32 {
            return Ok(());
        }
        let Some((initial, write)) = self.phi_inputs(phi, edges) else {
            return Ok(());
        };
        if lp.contains(self.fn_ir.def_block(initial)) {
            return Ok(());
        }
        let modified = extract_linear_sum(self.fn_ir, write);
        if modified.term != Some(phi) || modified.constant == 0 {
            return Ok(());
        }
        let step = modified.constant;

        let mut initial_sum = LinearSum::new();
        if !initial_sum.add_term(self.fn_ir, initial, 1) {
            return Ok(());
        }
        // Value on the last iteration: bound * step + initial - step.
        let mut limit_sum = self.arena.loop_bound(bound).sum.clone();
        let Some(neg_step) = 0i32.checked_sub(step) else {
            return Ok(());
        };
        if !limit_sum.multiply(step)
            || !limit_sum.add_sum(1, &initial_sum)
            || !limit_sum.add_constant(neg_step)
        {
            return Ok(());
        }

        // The phi itself reaches one more step when the loop exits.
        let mut reach_sum = limit_sum.clone();
        let reach = if reach_sum.add_constant(step) {
            Some(self.sum_range(&reach_sum))
        } else {
            None
        };
        let init = self.operand_range(initial);
        let mut range = self.fn_ir.values[phi]
            .range
            .unwrap_or_else(|| Range::for_type(MirType::Int32));

        let (lower, upper) = if step > 0 {
            if init.has_int32_lower_bound() && init.lower() <= range.upper() {
                range.refine_lower(init.lower());
            }
            if let Some(reach) = reach.filter(|r| r.has_int32_upper_bound()) {
                if init.has_int32_upper_bound() {
                    let x = max(init.upper(), reach.upper());
                    if x >= range.lower() {
                        range.refine_upper(x);
                    }
                }
            }
            let lower = self.arena.alloc_symbolic(SymbolicBound {
                loop_bound: None,
                sum: initial_sum,
            })?;
            let upper = self.arena.alloc_symbolic(SymbolicBound {
                loop_bound: Some(bound),
                sum: limit_sum,
            })?;
            (lower, upper)
        } else {
            if init.has_int32_upper_bound() && init.upper() >= range.lower() {
                range.refine_upper(init.upper());
            }
            if let Some(reach) = reach.filter(|r| r.has_int32_lower_bound()) {
                if init.has_int32_lower_bound() {
                    let x = min(init.lower(), reach.lower());
                    if x <= range.upper() {
                        range.refine_lower(x);
                    }
                }
            }
            let lower = self.arena.alloc_symbolic(SymbolicBound {
                loop_bound: Some(bound),
                sum: limit_sum,
            })?;
            let upper = self.arena.alloc_symbolic(SymbolicBound {
                loop_bound: None,
                sum: initial_sum,
            })?;
            (lower, upper)
        };
        range.set_symbolic_lower(Some(lower));
        range.set_symbolic_upper(Some(upper));
        debug!(phi, range = %self.arena.range_display(&range), "loop phi bounds");
        self.fn_ir.values[phi].range = Some(range);
        self.stats.refined_phis += 1;
        Ok(())
    }

    /// Numeric range of a linear sum from the current ranges of its terms.
    pub(crate) fn sum_range(&self, sum: &LinearSum) -> Range {
        let mut acc = Range::int32(sum.constant(), sum.constant());
        for t in sum.terms() {
            let term = self.operand_range(t.term);
            let scaled = Range::mul(&term, &Range::int32(t.scale, t.scale));
            acc = Range::add(&acc, &scaled);
        }
        acc
    }

    // A bound tied to a loop test only holds where that test dominates.
    fn symbolic_bound_is_valid(&self, lp: &LoopInfo, check: ValueId, id: SymbolicId) -> bool {
        let Some(lb) = self.arena.symbolic(id).loop_bound else {
            return true;
        };
        let test = self.arena.loop_bound(lb).test;
        let check_bb = self.fn_ir.def_block(check);
        if check_bb == lp.header {
            return false;
        }
        let mut bb = self.cfg.idom(check_bb);
        while let Some(b) = bb {
            if b == test {
                return true;
            }
            if b == lp.header {
                return false;
            }
            bb = self.cfg.idom(b);
        }
        false
    }

    /// Replaces an in-loop bounds check by a lower and an upper check in
    /// the preheader, derived from the symbolic bounds of its index.
    fn try_hoist_bounds_check(
        &mut self,
        lp: &LoopInfo,
        edges: LoopEdges,
        check: ValueId,
    ) -> RR<bool> {
        let ValueKind::BoundsCheck {
            index,
            length,
            minimum,
            maximum,
            ..
        } = self.fn_ir.values[check].kind
        else {
            return Ok(false);
        };
        if !matches!(self.fn_ir.blocks[edges.preheader].term, Terminator::Goto(h) if h == edges.header)
        {
            return Ok(false);
        }
        if lp.contains(self.fn_ir.def_block(length)) {
            return Ok(false);
        }
        let idx = extract_linear_sum(self.fn_ir, index);
        let Some(term) = idx.term else {
            return Ok(false);
        };
        if !lp.contains(self.fn_ir.def_block(term)) {
            return Ok(false);
        }
        let Some(range) = self.fn_ir.values[term].range else {
            return Ok(false);
        };
        let (Some(lo), Some(hi)) = (range.symbolic_lower(), range.symbolic_upper()) else {
            return Ok(false);
        };
        if !self.symbolic_bound_is_valid(lp, check, lo)
            || !self.symbolic_bound_is_valid(lp, check, hi)
        {
            return Ok(false);
        }
        let lower = self.arena.symbolic(lo).sum.clone();
        let upper = self.arena.symbolic(hi).sum.clone();

        // index + c + minimum >= 0 given index >= lower_terms + lower.c:
        // lower_terms >= -c - minimum - lower.c
        let lower_constant = 0i32
            .checked_sub(idx.constant)
            .and_then(|v| v.checked_sub(minimum))
            .and_then(|v| v.checked_sub(lower.constant()));
        // index + c + maximum < length given index <= upper_terms + upper.c
        let upper_constant = upper
            .constant()
            .checked_add(idx.constant)
            .and_then(|v| v.checked_add(maximum));
        let (Some(lower_constant), Some(upper_constant)) = (lower_constant, upper_constant) else {
            return Ok(false);
        };

        let lower_term = self.convert_linear_sum(edges.preheader, &lower);
        let upper_term = self.convert_linear_sum(edges.preheader, &upper);
        self.fn_ir.push_instr(
            edges.preheader,
            ValueKind::BoundsCheckLower {
                index: lower_term,
                minimum: lower_constant,
            },
            MirType::None,
        );
        let upper_check = self.fn_ir.push_instr(
            edges.preheader,
            ValueKind::BoundsCheck {
                index: upper_term,
                length,
                minimum: upper_constant,
                maximum: upper_constant,
                movable: false,
            },
            MirType::Int32,
        );
        self.recompute(upper_check);
        debug!(
            check,
            preheader = edges.preheader,
            lower = %lower,
            upper = %upper,
            "hoisted bounds check"
        );
        Ok(true)
    }

    /// Materializes the terms of `sum` (not its constant) at the end of
    /// `block` as checked int32 arithmetic.
    fn convert_linear_sum(&mut self, block: BlockId, sum: &LinearSum) -> ValueId {
        let mut def: Option<ValueId> = None;
        for t in sum.terms() {
            def = Some(if t.scale == 1 {
                match def {
                    Some(d) => self.emit_binary(block, BinOp::Add, d, t.term),
                    None => t.term,
                }
            } else if t.scale == -1 {
                let base = match def {
                    Some(d) => d,
                    None => self.emit_const(block, 0),
                };
                self.emit_binary(block, BinOp::Sub, base, t.term)
            } else {
                let factor = self.emit_const(block, t.scale);
                let mul = self.emit_binary(block, BinOp::Mul, t.term, factor);
                match def {
                    Some(d) => self.emit_binary(block, BinOp::Add, d, mul),
                    None => mul,
                }
            });
        }
        match def {
            Some(d) => d,
            None => self.emit_const(block, 0),
        }
    }

    fn emit_const(&mut self, block: BlockId, n: i32) -> ValueId {
        let vid = self.fn_ir.const_int(block, n);
        self.recompute(vid);
        vid
    }

    fn emit_binary(&mut self, block: BlockId, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let vid = self.fn_ir.push_instr(
            block,
            ValueKind::Binary {
                op,
                lhs,
                rhs,
                flags: ArithFlags::checked(),
            },
            MirType::Int32,
        );
        self.recompute(vid);
        vid
    }
}
