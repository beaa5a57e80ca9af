use crate::error::RR;
use crate::mir::analyze::range::Range;
use crate::mir::opt::range_analysis::RangeAnalysis;
use crate::mir::*;
use tracing::{debug, debug_span, trace};

impl RangeAnalysis<'_> {
    /// Moves arithmetic to int32 where the ranges or the uses allow it, then
    /// folds bitwise identities that became no-ops.
    pub fn truncate(&mut self) -> RR<()> {
        let span = debug_span!("truncate", function = %self.fn_ir.name);
        let _enter = span.enter();

        // Each rewrite only moves a value towards int32, so this settles.
        let mut changed = true;
        while changed {
            changed = false;
            let mut uses = self.fn_ir.use_map();
            for vid in self.postorder_values() {
                if self.fn_ir.values[vid].block.is_none() {
                    continue;
                }
                let vid_uses = uses.get(&vid).cloned().unwrap_or_default();
                if self.try_narrow(vid, &vid_uses) || self.try_truncate(vid, &vid_uses) {
                    // Rewrites add conversions and drop users, so refresh.
                    uses = self.fn_ir.use_map();
                    changed = true;
                }
            }
        }
        self.fold_unnecessary_bitops();
        debug!(
            narrowed = self.stats.narrowed,
            truncated = self.stats.truncated,
            folded = self.stats.folded_bitops,
            "truncation done"
        );
        Ok(())
    }

    // Users before definitions, as far as the CFG allows.
    fn postorder_values(&self) -> Vec<ValueId> {
        let mut out = Vec::new();
        for &bid in &self.cfg.postorder {
            out.extend(self.fn_ir.blocks[bid].instrs.iter().rev().copied());
        }
        out
    }

    fn accepts_int32(&self, u: Use) -> bool {
        let Use::Operand { user, index } = u else {
            return true;
        };
        let user = &self.fn_ir.values[user];
        match &user.kind {
            ValueKind::Binary { op, .. } => op.is_bitwise() || user.ty == MirType::Int32,
            ValueKind::Unary {
                op: UnaryOp::ToInt32 | UnaryOp::ToDouble | UnaryOp::BitNot,
                ..
            } => true,
            ValueKind::Compare { .. }
            | ValueKind::BoundsCheck { .. }
            | ValueKind::BoundsCheckLower { .. }
            | ValueKind::AssertRange { .. } => true,
            ValueKind::Phi { .. } => user.ty == MirType::Int32,
            ValueKind::LoadElement { .. }
            | ValueKind::LoadTypedArray { .. }
            | ValueKind::StoreElement { .. } => index == 1,
            _ => false,
        }
    }

    // Users that apply ToInt32 to their operand themselves.
    fn use_truncates_directly(&self, u: Use) -> bool {
        let Use::Operand { user, .. } = u else {
            return false;
        };
        match &self.fn_ir.values[user].kind {
            ValueKind::Unary {
                op: UnaryOp::ToInt32 | UnaryOp::BitNot,
                ..
            } => true,
            ValueKind::Binary { op, .. } => op.is_bitwise(),
            _ => false,
        }
    }

    // Users that only look at their operand modulo 2^32. A wrapping add
    // keeps integral inputs modulo 2^32 but never drops a fraction.
    fn use_truncates(&self, u: Use) -> bool {
        if self.use_truncates_directly(u) {
            return true;
        }
        let Use::Operand { user, .. } = u else {
            return false;
        };
        let user = &self.fn_ir.values[user];
        match &user.kind {
            ValueKind::Binary { op, flags, .. } => {
                matches!(op, BinOp::Add | BinOp::Sub | BinOp::Mul)
                    && flags.wrapping
                    && user.ty == MirType::Int32
            }
            _ => false,
        }
    }

    /// A double add/sub/mul that provably computes an int32 from int32
    /// operands becomes an int32 op that cannot overflow.
    fn try_narrow(&mut self, vid: ValueId, uses: &[Use]) -> bool {
        let val = &self.fn_ir.values[vid];
        if val.ty != MirType::Double {
            return false;
        }
        let ValueKind::Binary {
            op: op @ (BinOp::Add | BinOp::Sub | BinOp::Mul),
            lhs,
            rhs,
            ..
        } = val.kind
        else {
            return false;
        };
        let Some(range) = val.range else {
            return false;
        };
        if !range.is_int32() {
            return false;
        }
        let (l, r) = (self.operand_range(lhs), self.operand_range(rhs));
        if !l.is_int32() || !r.is_int32() {
            return false;
        }
        if op == BinOp::Mul && Range::negative_zero_mul(&l, &r) {
            return false;
        }
        if !uses.iter().all(|u| self.accepts_int32(*u)) {
            return false;
        }

        let exact = ArithFlags {
            fallible: false,
            wrapping: false,
            can_be_negative_zero: false,
            can_be_divide_by_zero: false,
        };
        self.retype_int32(vid, exact);
        trace!(value = vid, %range, "narrowed to int32");
        self.stats.narrowed += 1;
        true
    }

    /// Arithmetic whose every use truncates to int32 may wrap itself.
    /// Division and modulus can produce a fraction or NaN, so their uses
    /// must truncate directly.
    fn try_truncate(&mut self, vid: ValueId, uses: &[Use]) -> bool {
        let val = &self.fn_ir.values[vid];
        if !val.ty.is_number() {
            return false;
        }
        let ValueKind::Binary { op, flags, .. } = val.kind else {
            return false;
        };
        if flags.wrapping {
            return false;
        }
        let Some(range) = val.range else {
            return false;
        };
        let truncating = match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul => {
                if range.can_have_rounding_errors() {
                    return false;
                }
                uses.iter().all(|u| self.use_truncates(*u))
            }
            BinOp::Div | BinOp::Mod => {
                if val.ty != MirType::Int32 {
                    return false;
                }
                uses.iter().all(|u| self.use_truncates_directly(*u))
            }
            _ => return false,
        };
        if uses.is_empty() || !truncating {
            return false;
        }

        self.retype_int32(vid, ArithFlags::wrapping());
        if let Some(r) = &mut self.fn_ir.values[vid].range {
            r.wrap_around_to_int32();
        }
        self.remove_truncates_on_output(vid, uses);
        trace!(value = vid, "truncated");
        self.stats.truncated += 1;
        true
    }

    // Int32 type and `flags` for `vid`, with double operands converted.
    fn retype_int32(&mut self, vid: ValueId, new_flags: ArithFlags) {
        let ValueKind::Binary { lhs, rhs, .. } = self.fn_ir.values[vid].kind else {
            return;
        };
        let lhs = self.int32_input(vid, lhs);
        let rhs = self.int32_input(vid, rhs);
        let val = &mut self.fn_ir.values[vid];
        val.ty = MirType::Int32;
        if let ValueKind::Binary {
            lhs: l,
            rhs: r,
            flags,
            ..
        } = &mut val.kind
        {
            *l = lhs;
            *r = rhs;
            *flags = new_flags;
        }
        if let Some(r) = &mut val.range {
            if r.is_int32() {
                r.clamp_to_int32();
            }
        }
    }

    // An int32 view of `input` placed right before `user`.
    fn int32_input(&mut self, user: ValueId, input: ValueId) -> ValueId {
        if self.fn_ir.values[input].ty == MirType::Int32 {
            return input;
        }
        let Some(bid) = self.fn_ir.values[user].block else {
            return input;
        };
        let Some(pos) = self.fn_ir.blocks[bid].instrs.iter().position(|v| *v == user) else {
            return input;
        };
        let conv = self.fn_ir.insert_instr(
            bid,
            pos,
            ValueKind::Unary {
                op: UnaryOp::ToInt32,
                rhs: input,
            },
            MirType::Int32,
        );
        self.recompute(conv);
        conv
    }

    fn remove_truncates_on_output(&mut self, vid: ValueId, uses: &[Use]) {
        for &u in uses {
            let Use::Operand { user, .. } = u else {
                continue;
            };
            if matches!(
                self.fn_ir.values[user].kind,
                ValueKind::Unary {
                    op: UnaryOp::ToInt32,
                    ..
                }
            ) && self.fn_ir.values[user].block.is_some()
            {
                self.fn_ir.replace_all_uses(user, vid);
                self.fn_ir.remove_instr(user);
            }
        }
    }

    /// Replaces `x | 0`, `x ^ 0`, `x & -1`, `x << 0`, `x >> 0`, `x & x` and
    /// `x | x` on int32 `x` by `x`.
    pub(crate) fn fold_unnecessary_bitops(&mut self) {
        for vid in self.postorder_values() {
            let val = &self.fn_ir.values[vid];
            if val.ty != MirType::Int32 || val.block.is_none() {
                continue;
            }
            let ValueKind::Binary { op, lhs, rhs, .. } = val.kind else {
                continue;
            };
            let lc = self.fn_ir.as_const_int(lhs);
            let rc = self.fn_ir.as_const_int(rhs);
            let folded = match op {
                BinOp::BitOr | BinOp::BitXor => {
                    if rc == Some(0) {
                        Some(lhs)
                    } else if lc == Some(0) {
                        Some(rhs)
                    } else if op == BinOp::BitOr && lhs == rhs {
                        Some(lhs)
                    } else {
                        None
                    }
                }
                BinOp::BitAnd => {
                    if rc == Some(-1) {
                        Some(lhs)
                    } else if lc == Some(-1) {
                        Some(rhs)
                    } else if lhs == rhs {
                        Some(lhs)
                    } else {
                        None
                    }
                }
                BinOp::Lsh | BinOp::Rsh => rc.filter(|c| c & 31 == 0).map(|_| lhs),
                _ => None,
            };
            let Some(x) = folded else {
                continue;
            };
            if self.fn_ir.values[x].ty != MirType::Int32 {
                continue;
            }
            self.fn_ir.replace_all_uses(vid, x);
            self.fn_ir.remove_instr(vid);
            trace!(value = vid, into = x, "folded bitop");
            self.stats.folded_bitops += 1;
        }
    }
}
