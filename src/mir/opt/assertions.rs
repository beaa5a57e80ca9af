use crate::error::RR;
use crate::mir::opt::range_analysis::{has_numeric_type, RangeAnalysis};
use crate::mir::*;
use tracing::debug;

impl RangeAnalysis<'_> {
    /// Follows every value that has an informative range with an
    /// `AssertRange` so that executing the function checks the analysis.
    pub fn add_range_assertions(&mut self) -> RR<()> {
        let rpo = self.cfg.rpo.clone();
        for bid in rpo {
            if self.fn_ir.blocks[bid].unreachable {
                continue;
            }
            for vid in self.fn_ir.block_values(bid) {
                let val = &self.fn_ir.values[vid];
                if val.kind.is_beta() || !has_numeric_type(val.ty) {
                    continue;
                }
                let Some(range) = val.range else {
                    continue;
                };
                if range.is_unknown() || (val.ty == MirType::Int32 && range.is_unknown_int32()) {
                    continue;
                }

                // Phis are followed by the block's leading betas.
                let pos = if val.kind.is_phi() {
                    self.fn_ir.blocks[bid]
                        .instrs
                        .iter()
                        .take_while(|v| self.fn_ir.values[**v].kind.is_beta())
                        .count()
                } else {
                    match self.fn_ir.blocks[bid].instrs.iter().position(|v| *v == vid) {
                        Some(p) => p + 1,
                        None => continue,
                    }
                };
                self.fn_ir.insert_instr(
                    bid,
                    pos,
                    ValueKind::AssertRange {
                        input: vid,
                        range: range.without_symbolic(),
                    },
                    MirType::None,
                );
                self.stats.assertions += 1;
            }
        }
        debug!(count = self.stats.assertions, "range assertions inserted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::mir::analyze::range::Range;
    use crate::mir::opt::range_analysis::RangeAnalysis;
    use crate::mir::opt::RangeConfig;
    use crate::mir::verify::verify_ir;
    use crate::mir::*;

    #[test]
    fn asserts_informative_ranges_only() {
        let mut f = FnIR::new("assert");
        let b = f.add_block();
        let x = f.push_instr(b, ValueKind::Param { index: 0 }, MirType::Int32);
        let seven = f.const_int(b, 7);
        let and = f.push_instr(
            b,
            ValueKind::Binary {
                op: BinOp::BitAnd,
                lhs: x,
                rhs: seven,
                flags: ArithFlags::wrapping(),
            },
            MirType::Int32,
        );
        f.set_term(b, Terminator::Return(Some(and)));

        let mut ra = RangeAnalysis::new(&mut f, RangeConfig::default());
        ra.analyze().unwrap();
        ra.add_range_assertions().unwrap();
        // The parameter spans all of int32 and gets nothing.
        assert_eq!(ra.stats.assertions, 2);
        assert_eq!(verify_ir(ra.fn_ir), Ok(()));

        let instrs = &ra.fn_ir.blocks[b].instrs;
        assert_eq!(instrs.len(), 5);
        assert_eq!(
            ra.fn_ir.values[instrs[4]].kind,
            ValueKind::AssertRange {
                input: and,
                range: Range::int32(0, 7),
            }
        );
    }
}
