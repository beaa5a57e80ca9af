use crate::error::{RangeCode, RangeException, Stage, RR};
use crate::mir::analyze::range::Range;
use crate::mir::opt::range_analysis::RangeAnalysis;
use crate::mir::*;
use tracing::{debug, trace};

impl RangeAnalysis<'_> {
    /// Inserts a `Beta` at the top of every block entered only through a
    /// numeric comparison, carrying what the comparison proves about its
    /// operand, and redirects the dominated uses of that operand to it.
    pub fn add_beta_nodes(&mut self) -> RR<()> {
        let rpo = self.cfg.rpo.clone();
        for bid in rpo {
            let Some(test_bb) = self.cfg.immediate_dominator_branch(self.fn_ir, bid) else {
                continue;
            };
            let Terminator::If { cond, then_bb, .. } = self.fn_ir.blocks[test_bb].term else {
                continue;
            };
            let ValueKind::Compare { op, lhs, rhs } = self.fn_ir.values[cond].kind else {
                continue;
            };
            let (lty, rty) = (self.fn_ir.values[lhs].ty, self.fn_ir.values[rhs].ty);
            if !lty.is_number() || !rty.is_number() {
                continue;
            }
            let taken = then_bb == bid;
            let op = if taken { op } else { op.negate() };

            let (val, op, bound) = if let Some(c) = self.fn_ir.as_const_number(lhs) {
                (rhs, op.reverse(), c)
            } else if let Some(c) = self.fn_ir.as_const_number(rhs) {
                (lhs, op, c)
            } else {
                if lty == MirType::Int32 && rty == MirType::Int32 {
                    let pair = match op {
                        CmpOp::Lt => Some((lhs, rhs)),
                        CmpOp::Gt => Some((rhs, lhs)),
                        _ => None,
                    };
                    if let Some((smaller, greater)) = pair {
                        self.insert_beta(bid, smaller, Range::int32(i32::MIN, i32::MAX - 1))?;
                        self.insert_beta(bid, greater, Range::int32(i32::MIN + 1, i32::MAX))?;
                    }
                }
                continue;
            };

            let int_operand = self.fn_ir.values[val].ty == MirType::Int32;
            // x < c on integers is x <= c - 1.
            let int_bound = |b: f64, delta: i32| -> f64 {
                if int_operand && b.fract() == 0.0 && b >= i32::MIN as f64 && b <= i32::MAX as f64 {
                    match (b as i32).checked_add(delta) {
                        Some(v) => v as f64,
                        None => b,
                    }
                } else {
                    b
                }
            };
            let mut comp = match op {
                CmpOp::Le => Range::from_f64_bounds(f64::NEG_INFINITY, bound),
                CmpOp::Lt => Range::from_f64_bounds(f64::NEG_INFINITY, int_bound(bound, -1)),
                CmpOp::Ge => Range::from_f64_bounds(bound, f64::INFINITY),
                CmpOp::Gt => Range::from_f64_bounds(int_bound(bound, 1), f64::INFINITY),
                CmpOp::Eq => Range::from_f64_bounds(bound, bound),
                // A hole in the middle is not a range.
                CmpOp::Ne => continue,
            };
            // The false edge of an ordered comparison also admits NaN.
            if !taken && !int_operand {
                comp = comp.with_nan();
            }
            self.insert_beta(bid, val, comp)?;
        }
        debug!(count = self.stats.betas_inserted, "beta nodes inserted");
        Ok(())
    }

    fn insert_beta(&mut self, bid: BlockId, input: ValueId, refinement: Range) -> RR<ValueId> {
        if self.fn_ir.values[input].block.is_none() {
            return Err(RangeException::new(
                "InternalError",
                RangeCode::ICE9001,
                Stage::Beta,
                format!("branch in block {} tests a detached value", bid),
            )
            .at_value(input));
        }
        let ty = self.fn_ir.values[input].ty;
        let beta = self
            .fn_ir
            .insert_instr(bid, 0, ValueKind::Beta { input, refinement }, ty);
        let redirected = self.replace_dominated_uses(input, beta, bid);
        trace!(beta, input, block = bid, %refinement, redirected, "beta");
        self.stats.betas_inserted += 1;
        Ok(beta)
    }

    // Phi operands count as used at the end of their incoming block.
    fn replace_dominated_uses(&mut self, orig: ValueId, beta: ValueId, dom: BlockId) -> usize {
        let mut replaced = 0;
        for bid in 0..self.fn_ir.blocks.len() {
            let block_dominated = self.cfg.dominates(dom, bid);
            for &phi in &self.fn_ir.blocks[bid].phis {
                if let ValueKind::Phi { args } = &mut self.fn_ir.values[phi].kind {
                    for (arg, pred) in args.iter_mut() {
                        if *arg == orig && self.cfg.dominates(dom, *pred) {
                            *arg = beta;
                            replaced += 1;
                        }
                    }
                }
            }
            if !block_dominated {
                continue;
            }
            for &vid in &self.fn_ir.blocks[bid].instrs {
                if vid == beta {
                    continue;
                }
                self.fn_ir.values[vid].kind.for_each_operand_mut(|op| {
                    if *op == orig {
                        *op = beta;
                        replaced += 1;
                    }
                });
            }
            match &mut self.fn_ir.blocks[bid].term {
                Terminator::If { cond, .. } if *cond == orig => {
                    *cond = beta;
                    replaced += 1;
                }
                Terminator::Return(Some(v)) if *v == orig => {
                    *v = beta;
                    replaced += 1;
                }
                _ => {}
            }
        }
        replaced
    }

    /// Rewires every use of a beta to its input and drops the betas.
    pub fn remove_beta_nodes(&mut self) -> RR<()> {
        let betas: Vec<ValueId> = self
            .fn_ir
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter().copied())
            .filter(|v| self.fn_ir.values[*v].kind.is_beta())
            .collect();
        for beta in betas {
            let ValueKind::Beta { input, .. } = self.fn_ir.values[beta].kind else {
                continue;
            };
            self.fn_ir.replace_all_uses(beta, input);
            self.fn_ir.remove_instr(beta);
            self.stats.betas_removed += 1;
        }
        debug!(count = self.stats.betas_removed, "beta nodes removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::mir::analyze::range::Range;
    use crate::mir::opt::range_analysis::RangeAnalysis;
    use crate::mir::opt::RangeConfig;
    use crate::mir::verify::{verify_ir, verify_no_betas};
    use crate::mir::*;

    // if (x < 10) { return x + 1 } else { return x }
    fn branch_on_const(x_ty: MirType) -> (FnIR, ValueId, ValueId) {
        let mut f = FnIR::new("branch");
        let entry = f.add_block();
        let then_bb = f.add_block();
        let else_bb = f.add_block();
        let x = f.push_instr(entry, ValueKind::Param { index: 0 }, x_ty);
        let ten = f.const_int(entry, 10);
        let cond = f.push_instr(
            entry,
            ValueKind::Compare {
                op: CmpOp::Lt,
                lhs: x,
                rhs: ten,
            },
            MirType::Boolean,
        );
        f.set_term(
            entry,
            Terminator::If {
                cond,
                then_bb,
                else_bb,
            },
        );
        let one = f.const_int(then_bb, 1);
        let add = f.push_instr(
            then_bb,
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: x,
                rhs: one,
                flags: ArithFlags::checked(),
            },
            x_ty,
        );
        f.set_term(then_bb, Terminator::Return(Some(add)));
        f.set_term(else_bb, Terminator::Return(Some(x)));
        (f, x, add)
    }

    #[test]
    fn refines_both_edges_of_int_compare() {
        let (mut f, x, add) = branch_on_const(MirType::Int32);
        let mut ra = RangeAnalysis::new(&mut f, RangeConfig::default());
        ra.add_beta_nodes().unwrap();
        assert_eq!(ra.stats.betas_inserted, 2);

        let then_beta = ra.fn_ir.blocks[1].instrs[0];
        let else_beta = ra.fn_ir.blocks[2].instrs[0];
        assert_eq!(
            ra.fn_ir.values[then_beta].kind,
            ValueKind::Beta {
                input: x,
                refinement: Range::from_f64_bounds(f64::NEG_INFINITY, 9.0),
            }
        );
        assert!(matches!(
            ra.fn_ir.values[add].kind,
            ValueKind::Binary { lhs, .. } if lhs == then_beta
        ));
        assert_eq!(ra.fn_ir.blocks[2].term, Terminator::Return(Some(else_beta)));
        assert_eq!(verify_ir(ra.fn_ir), Ok(()));

        ra.analyze().unwrap();
        let r = ra.fn_ir.values[add].range.unwrap();
        assert_eq!(r.upper(), 10);
        assert_eq!(ra.fn_ir.values[else_beta].range.unwrap().lower(), 10);

        ra.remove_beta_nodes().unwrap();
        assert_eq!(ra.stats.betas_removed, 2);
        assert_eq!(verify_no_betas(ra.fn_ir), Ok(()));
        assert_eq!(ra.fn_ir.blocks[2].term, Terminator::Return(Some(x)));
    }

    #[test]
    fn false_edge_of_double_compare_keeps_nan() {
        let (mut f, _, _) = branch_on_const(MirType::Double);
        let mut ra = RangeAnalysis::new(&mut f, RangeConfig::default());
        ra.add_beta_nodes().unwrap();
        let else_beta = ra.fn_ir.blocks[2].instrs[0];
        let ValueKind::Beta { refinement, .. } = ra.fn_ir.values[else_beta].kind else {
            panic!("expected a beta");
        };
        assert!(refinement.can_be_nan());
        assert_eq!(refinement.lower(), 10);
    }

    #[test]
    fn empty_refinement_marks_block_unreachable() {
        // x = 20; if (x < 10) { dead } else { live }
        let mut f = FnIR::new("dead");
        let entry = f.add_block();
        let then_bb = f.add_block();
        let else_bb = f.add_block();
        let x = f.const_int(entry, 20);
        let y = f.push_instr(entry, ValueKind::Unary { op: UnaryOp::Abs, rhs: x }, MirType::Int32);
        let ten = f.const_int(entry, 10);
        let cond = f.push_instr(
            entry,
            ValueKind::Compare {
                op: CmpOp::Lt,
                lhs: y,
                rhs: ten,
            },
            MirType::Boolean,
        );
        f.set_term(
            entry,
            Terminator::If {
                cond,
                then_bb,
                else_bb,
            },
        );
        f.set_term(then_bb, Terminator::Return(Some(y)));
        f.set_term(else_bb, Terminator::Return(Some(y)));

        let mut ra = RangeAnalysis::new(&mut f, RangeConfig::default());
        ra.add_beta_nodes().unwrap();
        ra.analyze().unwrap();
        assert!(ra.fn_ir.blocks[then_bb].unreachable);
        assert!(!ra.fn_ir.blocks[else_bb].unreachable);
        assert_eq!(ra.stats.unreachable_blocks, 1);
    }

    #[test]
    fn variable_compare_refines_both_sides() {
        // if (a < b) { return a }
        let mut f = FnIR::new("cmp");
        let entry = f.add_block();
        let then_bb = f.add_block();
        let else_bb = f.add_block();
        let a = f.push_instr(entry, ValueKind::Param { index: 0 }, MirType::Int32);
        let b = f.push_instr(entry, ValueKind::Param { index: 1 }, MirType::Int32);
        let cond = f.push_instr(
            entry,
            ValueKind::Compare {
                op: CmpOp::Lt,
                lhs: a,
                rhs: b,
            },
            MirType::Boolean,
        );
        f.set_term(
            entry,
            Terminator::If {
                cond,
                then_bb,
                else_bb,
            },
        );
        f.set_term(then_bb, Terminator::Return(Some(a)));
        f.set_term(else_bb, Terminator::Return(None));

        let mut ra = RangeAnalysis::new(&mut f, RangeConfig::default());
        ra.add_beta_nodes().unwrap();
        // Only the taken `<` edge carries a strict relation.
        assert_eq!(ra.stats.betas_inserted, 2);
        ra.analyze().unwrap();
        let Terminator::Return(Some(ret)) = ra.fn_ir.blocks[then_bb].term else {
            panic!("expected a return");
        };
        assert_eq!(ra.fn_ir.values[ret].range.unwrap().upper(), i32::MAX - 1);
    }
}
