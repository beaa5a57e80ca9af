use crate::error::{RangeCode, RangeException, Stage};
use crate::mir::flow::Cfg;
use crate::mir::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    BadValue(ValueId),
    BadBlock(BlockId),
    BadOperand {
        value: ValueId,
        operand: ValueId,
    },
    BadTerminator(BlockId),
    Misplaced {
        block: BlockId,
        value: ValueId,
    },
    UseBeforeDef {
        block: BlockId,
        value: ValueId,
    },
    InvalidPhiArgs {
        phi_val: ValueId,
        expected: usize,
        got: usize,
    },
    InvalidPhiSource {
        phi_val: ValueId,
        block: BlockId,
    },
    StrayBeta(ValueId),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::BadValue(v) => write!(f, "Invalid ValueId: {}", v),
            VerifyError::BadBlock(b) => write!(f, "Invalid BlockId: {}", b),
            VerifyError::BadOperand { value, operand } => {
                write!(f, "Value {} uses unplaced or invalid operand {}", value, operand)
            }
            VerifyError::BadTerminator(b) => write!(f, "Invalid Terminator in Block: {}", b),
            VerifyError::Misplaced { block, value } => {
                write!(f, "Value {} is listed in Block {} but placed elsewhere", value, block)
            }
            VerifyError::UseBeforeDef { block, value } => {
                write!(f, "Use before def in Block {}: Value {}", block, value)
            }
            VerifyError::InvalidPhiArgs {
                phi_val,
                expected,
                got,
            } => write!(
                f,
                "Phi {} has wrong arg count. Expected {}, got {}",
                phi_val, expected, got
            ),
            VerifyError::InvalidPhiSource { phi_val, block } => write!(
                f,
                "Phi {} references invalid predecessor block {}",
                phi_val, block
            ),
            VerifyError::StrayBeta(v) => write!(f, "Beta {} survived beta removal", v),
        }
    }
}

impl VerifyError {
    pub fn value(&self) -> Option<ValueId> {
        match self {
            VerifyError::BadValue(v) | VerifyError::StrayBeta(v) => Some(*v),
            VerifyError::BadOperand { value, .. }
            | VerifyError::Misplaced { value, .. }
            | VerifyError::UseBeforeDef { value, .. } => Some(*value),
            VerifyError::InvalidPhiArgs { phi_val, .. }
            | VerifyError::InvalidPhiSource { phi_val, .. } => Some(*phi_val),
            VerifyError::BadBlock(_) | VerifyError::BadTerminator(_) => None,
        }
    }

    pub fn into_exception(self, fn_name: &str, stage: &str) -> RangeException {
        let vid = self.value();
        let mut e = RangeException::new(
            "VerifyError",
            RangeCode::E1001,
            Stage::Verify,
            format!("invalid MIR at {}: {}", stage, self),
        )
        .note(format!("function: {}", fn_name));
        if let Some(v) = vid {
            e = e.at_value(v);
        }
        e
    }
}

/// Structural checks: ids in range, every listed value placed in the block
/// that lists it, phi arity matching the predecessors, and SSA dominance of
/// every use in reachable code.
pub fn verify_ir(fn_ir: &FnIR) -> Result<(), VerifyError> {
    check_blk(fn_ir, fn_ir.entry)?;

    // 1. Values and their operands
    for (vid, val) in fn_ir.values.iter().enumerate() {
        if val.id != vid {
            return Err(VerifyError::BadValue(vid));
        }
        for op in val.kind.operands() {
            if op >= fn_ir.values.len() {
                return Err(VerifyError::BadOperand {
                    value: vid,
                    operand: op,
                });
            }
        }
        if let ValueKind::Phi { args } = &val.kind {
            let mut seen = FxHashSet::default();
            for (_, b) in args {
                check_blk(fn_ir, *b)?;
                if !seen.insert(*b) {
                    return Err(VerifyError::InvalidPhiSource {
                        phi_val: vid,
                        block: *b,
                    });
                }
            }
        }
    }

    // 2. Blocks and terminators
    for (bid, blk) in fn_ir.blocks.iter().enumerate() {
        if blk.id != bid {
            return Err(VerifyError::BadBlock(bid));
        }
        for succ in blk.term.successors() {
            check_blk(fn_ir, succ)?;
        }
        if let Some(v) = blk.term.operand() {
            check_val(fn_ir, v)?;
        }
        // Branches test numbers or booleans, never arrays or effects.
        if let Terminator::If { cond, .. } = blk.term {
            if matches!(fn_ir.values[cond].ty, MirType::Object | MirType::None) {
                return Err(VerifyError::BadTerminator(bid));
            }
        }
    }

    // 3. Placement
    let mut listed: FxHashMap<ValueId, BlockId> = FxHashMap::default();
    for (bid, blk) in fn_ir.blocks.iter().enumerate() {
        for &vid in &blk.phis {
            check_val(fn_ir, vid)?;
            if !fn_ir.values[vid].kind.is_phi() {
                return Err(VerifyError::Misplaced { block: bid, value: vid });
            }
        }
        for &vid in &blk.instrs {
            check_val(fn_ir, vid)?;
            if fn_ir.values[vid].kind.is_phi() {
                return Err(VerifyError::Misplaced { block: bid, value: vid });
            }
        }
        for vid in fn_ir.block_values(bid) {
            if fn_ir.values[vid].block != Some(bid) || listed.insert(vid, bid).is_some() {
                return Err(VerifyError::Misplaced { block: bid, value: vid });
            }
        }
    }

    // 4. Phi arity and SSA dominance, reachable code only
    let cfg = Cfg::new(fn_ir);
    for &bid in &cfg.rpo {
        let blk = &fn_ir.blocks[bid];
        let preds = &cfg.preds[bid];
        let position: FxHashMap<ValueId, usize> = fn_ir
            .block_values(bid)
            .into_iter()
            .enumerate()
            .map(|(i, v)| (v, i))
            .collect();

        for &phi in &blk.phis {
            let ValueKind::Phi { args } = &fn_ir.values[phi].kind else {
                continue;
            };
            if args.len() != preds.len() {
                return Err(VerifyError::InvalidPhiArgs {
                    phi_val: phi,
                    expected: preds.len(),
                    got: args.len(),
                });
            }
            for (arg, pred) in args {
                if !preds.contains(pred) {
                    return Err(VerifyError::InvalidPhiSource {
                        phi_val: phi,
                        block: *pred,
                    });
                }
                if cfg.is_reachable(*pred) && !defined_at_end_of(fn_ir, &cfg, *arg, *pred) {
                    return Err(VerifyError::UseBeforeDef {
                        block: *pred,
                        value: *arg,
                    });
                }
            }
        }

        for (pos, &vid) in blk.instrs.iter().enumerate() {
            let user_pos = blk.phis.len() + pos;
            for op in fn_ir.values[vid].kind.operands() {
                check_use(fn_ir, &cfg, &position, bid, user_pos, op)?;
            }
        }
        if let Some(op) = blk.term.operand() {
            check_use(fn_ir, &cfg, &position, bid, usize::MAX, op)?;
        }
    }

    Ok(())
}

/// `verify_ir` plus the guarantee that no beta node is left in the IR.
pub fn verify_no_betas(fn_ir: &FnIR) -> Result<(), VerifyError> {
    verify_ir(fn_ir)?;
    for blk in &fn_ir.blocks {
        for &vid in &blk.instrs {
            if fn_ir.values[vid].kind.is_beta() {
                return Err(VerifyError::StrayBeta(vid));
            }
        }
    }
    Ok(())
}

fn check_use(
    fn_ir: &FnIR,
    cfg: &Cfg,
    position: &FxHashMap<ValueId, usize>,
    bid: BlockId,
    user_pos: usize,
    op: ValueId,
) -> Result<(), VerifyError> {
    check_val(fn_ir, op)?;
    let Some(def_bb) = fn_ir.values[op].block else {
        // Detached values must not be used.
        return Err(VerifyError::UseBeforeDef { block: bid, value: op });
    };
    let ok = if def_bb == bid {
        position.get(&op).is_some_and(|p| *p < user_pos)
    } else {
        cfg.dominates(def_bb, bid)
    };
    if ok {
        Ok(())
    } else {
        Err(VerifyError::UseBeforeDef { block: bid, value: op })
    }
}

fn defined_at_end_of(fn_ir: &FnIR, cfg: &Cfg, vid: ValueId, bid: BlockId) -> bool {
    match fn_ir.values[vid].block {
        Some(def_bb) => cfg.dominates(def_bb, bid),
        None => false,
    }
}

fn check_val(fn_ir: &FnIR, vid: ValueId) -> Result<(), VerifyError> {
    if vid >= fn_ir.values.len() {
        Err(VerifyError::BadValue(vid))
    } else {
        Ok(())
    }
}

fn check_blk(fn_ir: &FnIR, bid: BlockId) -> Result<(), VerifyError> {
    if bid >= fn_ir.blocks.len() {
        Err(VerifyError::BadBlock(bid))
    } else {
        Ok(())
    }
}
