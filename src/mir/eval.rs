//! Reference interpreter for `FnIR`.
//!
//! Numbers follow JS semantics: doubles everywhere, int32 wrapping for
//! bitwise ops and `ToInt32`, `>>>` producing a uint32. `Object` parameters
//! are arrays whose length is the matching argument and whose elements are
//! their own indices. Failing runtime checks end the run with a bailout; a
//! failing `AssertRange` means range analysis was unsound and is an error.

use crate::error::{RangeCode, RangeException, Stage, RR};
use crate::mir::analyze::range::Range;
use crate::mir::*;
use crate::{bail, bail_at, ensure, ensure_at};
use tracing::{instrument, trace};

pub const DEFAULT_STEP_BUDGET: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    Return(Option<f64>),
    Bailout { value: ValueId, reason: &'static str },
    BudgetExhausted,
}

/// JS `ToInt32`.
pub fn to_int32(x: f64) -> i32 {
    if !x.is_finite() {
        return 0;
    }
    let m = x.trunc().rem_euclid(4294967296.0);
    if m >= 2147483648.0 {
        (m - 4294967296.0) as i32
    } else {
        m as i32
    }
}

fn load_scalar(elem: ScalarType, x: f64) -> f64 {
    match elem {
        ScalarType::Int8 => to_int32(x) as i8 as f64,
        ScalarType::Uint8 => to_int32(x) as u8 as f64,
        ScalarType::Uint8Clamped => {
            if x.is_nan() {
                0.0
            } else {
                x.clamp(0.0, 255.0).round_ties_even()
            }
        }
        ScalarType::Int16 => to_int32(x) as i16 as f64,
        ScalarType::Uint16 => to_int32(x) as u16 as f64,
        ScalarType::Int32 => to_int32(x) as f64,
        ScalarType::Uint32 => to_int32(x) as u32 as f64,
        ScalarType::Float32 => x as f32 as f64,
        ScalarType::Float64 => x,
    }
}

fn js_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn js_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Unset,
    Empty,
    Num(f64),
    Array(usize),
}

// Outcome of one instruction.
enum Step {
    Next(Slot),
    Bail(&'static str),
}

struct Machine<'a> {
    fn_ir: &'a FnIR,
    args: &'a [f64],
    slots: Vec<Slot>,
    heap: Vec<Vec<f64>>,
}

pub fn run(fn_ir: &FnIR, args: &[f64]) -> RR<EvalOutcome> {
    run_with_budget(fn_ir, args, DEFAULT_STEP_BUDGET)
}

#[instrument(level = "trace", skip_all, fields(function = %fn_ir.name))]
pub fn run_with_budget(fn_ir: &FnIR, args: &[f64], budget: usize) -> RR<EvalOutcome> {
    let mut m = Machine {
        fn_ir,
        args,
        slots: vec![Slot::Unset; fn_ir.values.len()],
        heap: Vec::new(),
    };
    let mut steps = 0usize;
    let mut pred: Option<BlockId> = None;
    let mut bid = fn_ir.entry;
    loop {
        ensure!(
            bid < fn_ir.blocks.len(),
            "InternalError",
            RangeCode::ICE9001,
            Stage::Eval,
            "jump to missing block {}",
            bid
        );
        let blk = &fn_ir.blocks[bid];

        // Phis read their inputs before any of them is written.
        if let Some(p) = pred {
            let mut incoming = Vec::with_capacity(blk.phis.len());
            for &phi in &blk.phis {
                let ValueKind::Phi { args } = &fn_ir.values[phi].kind else {
                    bail_at!(phi, "InternalError", RangeCode::ICE9001, Stage::Eval, "non-phi in phi list");
                };
                let Some((arg, _)) = args.iter().find(|(_, b)| *b == p) else {
                    bail_at!(
                        phi,
                        "InternalError",
                        RangeCode::ICE9001,
                        Stage::Eval,
                        "phi v{} has no input for block {}",
                        phi,
                        p
                    );
                };
                incoming.push((phi, m.read(phi, *arg)?));
            }
            for (phi, slot) in incoming {
                m.slots[phi] = slot;
            }
        }

        for &vid in &blk.instrs {
            steps += 1;
            if steps > budget {
                return Ok(EvalOutcome::BudgetExhausted);
            }
            match m.exec(vid)? {
                Step::Next(slot) => m.slots[vid] = slot,
                Step::Bail(reason) => {
                    trace!(value = vid, reason, "bailout");
                    return Ok(EvalOutcome::Bailout { value: vid, reason });
                }
            }
        }

        steps += 1;
        if steps > budget {
            return Ok(EvalOutcome::BudgetExhausted);
        }
        pred = Some(bid);
        match &blk.term {
            Terminator::Goto(t) => bid = *t,
            Terminator::If {
                cond,
                then_bb,
                else_bb,
            } => {
                let c = m.num(*cond)?;
                bid = if c != 0.0 && !c.is_nan() {
                    *then_bb
                } else {
                    *else_bb
                };
            }
            Terminator::Return(v) => {
                let out = match v {
                    Some(v) => match m.read(*v, *v)? {
                        Slot::Num(x) => Some(x),
                        _ => None,
                    },
                    None => None,
                };
                return Ok(EvalOutcome::Return(out));
            }
            Terminator::Unreachable => bail!(
                "InternalError",
                RangeCode::ICE9001,
                Stage::Eval,
                "reached the unreachable terminator of block {}",
                bid
            ),
        }
    }
}

impl Machine<'_> {
    fn read(&self, user: ValueId, vid: ValueId) -> RR<Slot> {
        match self.slots.get(vid) {
            Some(Slot::Unset) | None => bail_at!(
                user,
                "InternalError",
                RangeCode::ICE9001,
                Stage::Eval,
                "v{} read before it was computed",
                vid
            ),
            Some(s) => Ok(*s),
        }
    }

    fn num(&self, vid: ValueId) -> RR<f64> {
        match self.read(vid, vid)? {
            Slot::Num(x) => Ok(x),
            _ => bail_at!(
                vid,
                "InternalError",
                RangeCode::ICE9001,
                Stage::Eval,
                "v{} is not a number",
                vid
            ),
        }
    }

    fn array(&self, vid: ValueId) -> RR<usize> {
        match self.read(vid, vid)? {
            Slot::Array(h) => Ok(h),
            _ => bail_at!(
                vid,
                "InternalError",
                RangeCode::ICE9001,
                Stage::Eval,
                "v{} is not an array",
                vid
            ),
        }
    }

    // Index into `array`, or None when out of bounds.
    fn element(&self, array: ValueId, index: ValueId) -> RR<Option<(usize, usize)>> {
        let h = self.array(array)?;
        let i = self.num(index)?;
        if i.fract() != 0.0 || i < 0.0 || i >= self.heap[h].len() as f64 {
            return Ok(None);
        }
        Ok(Some((h, i as usize)))
    }

    fn exec(&mut self, vid: ValueId) -> RR<Step> {
        let fn_ir = self.fn_ir;
        let val = &fn_ir.values[vid];
        let out = match &val.kind {
            ValueKind::Const(lit) => Slot::Num(match lit {
                Lit::Int(i) => *i as f64,
                Lit::Double(d) => *d,
                Lit::Bool(b) => *b as i32 as f64,
            }),
            ValueKind::Param { index } => {
                let arg = self.args.get(*index).copied().unwrap_or(0.0);
                match val.ty {
                    MirType::Object => {
                        let len = if arg.is_nan() { 0.0 } else { arg.clamp(0.0, 1e7).floor() };
                        self.heap.push((0..len as usize).map(|i| i as f64).collect());
                        Slot::Array(self.heap.len() - 1)
                    }
                    MirType::Int32 => Slot::Num(to_int32(arg) as f64),
                    MirType::Boolean => Slot::Num((arg != 0.0 && !arg.is_nan()) as i32 as f64),
                    _ => Slot::Num(arg),
                }
            }
            ValueKind::Phi { .. } => bail_at!(
                vid,
                "InternalError",
                RangeCode::ICE9001,
                Stage::Eval,
                "phi v{} listed as an instruction",
                vid
            ),
            ValueKind::Beta { input, .. } => self.read(vid, *input)?,
            ValueKind::Binary {
                op,
                lhs,
                rhs,
                flags,
            } => {
                let (a, b) = (self.num(*lhs)?, self.num(*rhs)?);
                return self.binary(vid, *op, a, b, *flags, val.ty);
            }
            ValueKind::Unary { op, rhs } => {
                let a = self.num(*rhs)?;
                let r = match op {
                    UnaryOp::BitNot => !to_int32(a) as f64,
                    UnaryOp::Abs => a.abs(),
                    UnaryOp::Floor => a.floor(),
                    UnaryOp::Ceil => a.ceil(),
                    UnaryOp::Sqrt => a.sqrt(),
                    UnaryOp::ToInt32 => to_int32(a) as f64,
                    UnaryOp::ToDouble => a,
                };
                if val.ty == MirType::Int32
                    && (r.fract() != 0.0 || r < i32::MIN as f64 || r > i32::MAX as f64)
                {
                    return Ok(Step::Bail("int32 overflow"));
                }
                Slot::Num(r)
            }
            ValueKind::Compare { op, lhs, rhs } => {
                let (a, b) = (self.num(*lhs)?, self.num(*rhs)?);
                let r = match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                };
                Slot::Num(r as i32 as f64)
            }
            ValueKind::ArrayLength { array } | ValueKind::TypedArrayLength { array } => {
                let h = self.array(*array)?;
                Slot::Num(self.heap[h].len() as f64)
            }
            ValueKind::LoadElement { array, index } => match self.element(*array, *index)? {
                Some((h, i)) => Slot::Num(self.heap[h][i]),
                None => return Ok(Step::Bail("element out of bounds")),
            },
            ValueKind::LoadTypedArray { array, index, elem } => match self.element(*array, *index)? {
                Some((h, i)) => Slot::Num(load_scalar(*elem, self.heap[h][i])),
                None => return Ok(Step::Bail("element out of bounds")),
            },
            ValueKind::StoreElement { array, index, val: v } => {
                let x = self.num(*v)?;
                match self.element(*array, *index)? {
                    Some((h, i)) => self.heap[h][i] = x,
                    None => return Ok(Step::Bail("element out of bounds")),
                }
                Slot::Empty
            }
            ValueKind::BoundsCheck {
                index,
                length,
                minimum,
                maximum,
                ..
            } => {
                let (i, len) = (self.num(*index)?, self.num(*length)?);
                if i + *minimum as f64 >= 0.0 && i + (*maximum as f64) < len {
                    Slot::Num(i)
                } else {
                    return Ok(Step::Bail("bounds check failed"));
                }
            }
            ValueKind::BoundsCheckLower { index, minimum } => {
                if self.num(*index)? >= *minimum as f64 {
                    Slot::Empty
                } else {
                    return Ok(Step::Bail("lower bounds check failed"));
                }
            }
            ValueKind::Call { args, .. } => match args.first() {
                Some(a) => self.read(vid, *a)?,
                None => Slot::Num(0.0),
            },
            ValueKind::AssertRange { input, range } => {
                let x = self.num(*input)?;
                check_assertion(*input, x, range)?;
                Slot::Empty
            }
        };
        Ok(Step::Next(out))
    }

    fn binary(
        &self,
        vid: ValueId,
        op: BinOp,
        a: f64,
        b: f64,
        flags: ArithFlags,
        ty: MirType,
    ) -> RR<Step> {
        if op.is_bitwise() {
            let (x, y) = (to_int32(a), to_int32(b));
            let shift = (y as u32) & 31;
            let r = match op {
                BinOp::BitAnd => (x & y) as f64,
                BinOp::BitOr => (x | y) as f64,
                BinOp::BitXor => (x ^ y) as f64,
                BinOp::Lsh => x.wrapping_shl(shift) as f64,
                BinOp::Rsh => (x >> shift) as f64,
                _ => {
                    let u = (x as u32) >> shift;
                    if ty != MirType::Int32 {
                        u as f64
                    } else if u > i32::MAX as u32 && flags.fallible {
                        return Ok(Step::Bail("ursh result exceeds int32"));
                    } else {
                        u as i32 as f64
                    }
                }
            };
            return Ok(Step::Next(Slot::Num(r)));
        }

        if ty != MirType::Int32 {
            let r = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Mod => a % b,
                BinOp::Min => js_min(a, b),
                _ => js_max(a, b),
            };
            return Ok(Step::Next(Slot::Num(r)));
        }

        if flags.wrapping {
            let (x, y) = (to_int32(a), to_int32(b));
            let r = match op {
                BinOp::Add => x.wrapping_add(y) as f64,
                BinOp::Sub => x.wrapping_sub(y) as f64,
                BinOp::Mul => x.wrapping_mul(y) as f64,
                BinOp::Div => to_int32(a / b) as f64,
                BinOp::Mod => to_int32(a % b) as f64,
                BinOp::Min => x.min(y) as f64,
                _ => x.max(y) as f64,
            };
            return Ok(Step::Next(Slot::Num(r)));
        }

        ensure_at!(
            a.fract() == 0.0 && b.fract() == 0.0,
            vid,
            "InternalError",
            RangeCode::ICE9001,
            Stage::Eval,
            "int32 op v{} on non-integral operands {} and {}",
            vid,
            a,
            b
        );
        let exact = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => {
                let p = (a as i64) * (b as i64);
                if p == 0 && (a < 0.0 || b < 0.0) {
                    return negative_zero(vid, flags);
                }
                p as f64
            }
            BinOp::Div => {
                if b == 0.0 {
                    return divide_by_zero(vid, flags);
                }
                if a == 0.0 && b < 0.0 {
                    return negative_zero(vid, flags);
                }
                if a % b != 0.0 {
                    return Ok(Step::Bail("inexact int32 division"));
                }
                a / b
            }
            BinOp::Mod => {
                if b == 0.0 {
                    return divide_by_zero(vid, flags);
                }
                let r = a % b;
                if r == 0.0 && a < 0.0 {
                    return negative_zero(vid, flags);
                }
                r
            }
            BinOp::Min => a.min(b),
            _ => a.max(b),
        };
        if exact < i32::MIN as f64 || exact > i32::MAX as f64 {
            if flags.fallible || matches!(op, BinOp::Div | BinOp::Mod) {
                return Ok(Step::Bail("int32 overflow"));
            }
            bail_at!(
                vid,
                "InternalError",
                RangeCode::ICE9001,
                Stage::Eval,
                "unchecked int32 op v{} overflowed to {}",
                vid,
                exact
            );
        }
        Ok(Step::Next(Slot::Num(exact)))
    }
}

fn negative_zero(vid: ValueId, flags: ArithFlags) -> RR<Step> {
    ensure_at!(
        flags.can_be_negative_zero,
        vid,
        "InternalError",
        RangeCode::ICE9001,
        Stage::Eval,
        "v{} produced -0 but was marked as never negative zero",
        vid
    );
    Ok(Step::Bail("negative zero"))
}

fn divide_by_zero(vid: ValueId, flags: ArithFlags) -> RR<Step> {
    ensure_at!(
        flags.can_be_divide_by_zero,
        vid,
        "InternalError",
        RangeCode::ICE9001,
        Stage::Eval,
        "v{} divided by zero but was marked as never dividing by zero",
        vid
    );
    Ok(Step::Bail("division by zero"))
}

fn check_assertion(input: ValueId, x: f64, range: &Range) -> RR<()> {
    if range.contains(x) {
        return Ok(());
    }
    Err(RangeException::new(
        "RangeAssertionError",
        RangeCode::E3001,
        Stage::Eval,
        format!("v{} = {} is outside {}", input, x, range),
    )
    .at_value(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(f: &mut FnIR, bb: BlockId, op: BinOp, lhs: ValueId, rhs: ValueId, flags: ArithFlags) -> ValueId {
        f.push_instr(bb, ValueKind::Binary { op, lhs, rhs, flags }, MirType::Int32)
    }

    #[test]
    fn to_int32_wraps_like_js() {
        assert_eq!(to_int32(2147483648.0), i32::MIN);
        assert_eq!(to_int32(4294967297.0), 1);
        assert_eq!(to_int32(-1.5), -1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);
    }

    #[test]
    fn checked_overflow_bails_and_wrapping_wraps() {
        let mut f = FnIR::new("ovf");
        let b = f.add_block();
        let x = f.push_instr(b, ValueKind::Param { index: 0 }, MirType::Int32);
        let one = f.const_int(b, 1);
        let w = bin(&mut f, b, BinOp::Add, x, one, ArithFlags::wrapping());
        let c = bin(&mut f, b, BinOp::Add, w, one, ArithFlags::checked());
        f.set_term(b, Terminator::Return(Some(c)));

        assert_eq!(run(&f, &[5.0]).unwrap(), EvalOutcome::Return(Some(7.0)));
        // MAX + 1 wraps to MIN, then MIN + 1 is fine.
        assert_eq!(
            run(&f, &[i32::MAX as f64]).unwrap(),
            EvalOutcome::Return(Some(i32::MIN as f64 + 1.0))
        );
        assert_eq!(
            run(&f, &[i32::MAX as f64 - 1.0]).unwrap(),
            EvalOutcome::Bailout {
                value: c,
                reason: "int32 overflow"
            }
        );
    }

    #[test]
    fn unchecked_overflow_is_an_internal_error() {
        let mut f = FnIR::new("lie");
        let b = f.add_block();
        let x = f.push_instr(b, ValueKind::Param { index: 0 }, MirType::Int32);
        let one = f.const_int(b, 1);
        let mut flags = ArithFlags::checked();
        flags.fallible = false;
        let s = bin(&mut f, b, BinOp::Add, x, one, flags);
        f.set_term(b, Terminator::Return(Some(s)));

        let err = run(&f, &[i32::MAX as f64]).unwrap_err();
        assert_eq!(err.code, RangeCode::ICE9001);
        assert_eq!(err.value, Some(s));
    }

    #[test]
    fn failing_assertion_is_reported_at_its_input() {
        let mut f = FnIR::new("assert");
        let b = f.add_block();
        let x = f.push_instr(b, ValueKind::Param { index: 0 }, MirType::Int32);
        f.push_instr(
            b,
            ValueKind::AssertRange {
                input: x,
                range: Range::int32(0, 10),
            },
            MirType::None,
        );
        f.set_term(b, Terminator::Return(Some(x)));

        assert_eq!(run(&f, &[3.0]).unwrap(), EvalOutcome::Return(Some(3.0)));
        let err = run(&f, &[11.0]).unwrap_err();
        assert_eq!(err.code, RangeCode::E3001);
        assert_eq!(err.value, Some(x));
        assert!(err.message.contains("outside"));
    }

    #[test]
    fn loops_run_phis_in_parallel_and_respect_the_budget() {
        // i = 0; s = 0; while (i < n) { s = s + i; i = i + 1 } return s
        let mut f = FnIR::new("sum");
        let entry = f.add_block();
        let header = f.add_block();
        let body = f.add_block();
        let exit = f.add_block();
        let n = f.push_instr(entry, ValueKind::Param { index: 0 }, MirType::Int32);
        let zero = f.const_int(entry, 0);
        f.set_term(entry, Terminator::Goto(header));
        let i = f.add_value(ValueKind::Phi { args: vec![] }, MirType::Int32);
        let s = f.add_value(ValueKind::Phi { args: vec![] }, MirType::Int32);
        let cond = f.push_instr(
            header,
            ValueKind::Compare {
                op: CmpOp::Lt,
                lhs: i,
                rhs: n,
            },
            MirType::Boolean,
        );
        f.set_term(
            header,
            Terminator::If {
                cond,
                then_bb: body,
                else_bb: exit,
            },
        );
        let one = f.const_int(body, 1);
        let s2 = bin(&mut f, body, BinOp::Add, s, i, ArithFlags::checked());
        let i2 = bin(&mut f, body, BinOp::Add, i, one, ArithFlags::checked());
        f.set_term(body, Terminator::Goto(header));
        f.set_term(exit, Terminator::Return(Some(s)));
        for (phi, init, next) in [(i, zero, i2), (s, zero, s2)] {
            f.values[phi].kind = ValueKind::Phi {
                args: vec![(init, entry), (next, body)],
            };
            f.values[phi].block = Some(header);
            f.blocks[header].phis.push(phi);
        }

        assert_eq!(run(&f, &[5.0]).unwrap(), EvalOutcome::Return(Some(10.0)));
        assert_eq!(run(&f, &[0.0]).unwrap(), EvalOutcome::Return(Some(0.0)));
        assert_eq!(
            run_with_budget(&f, &[1e6], 100).unwrap(),
            EvalOutcome::BudgetExhausted
        );
    }

    #[test]
    fn arrays_hold_their_indices_and_bail_out_of_bounds() {
        let mut f = FnIR::new("load");
        let b = f.add_block();
        let a = f.push_instr(b, ValueKind::Param { index: 0 }, MirType::Object);
        let i = f.push_instr(b, ValueKind::Param { index: 1 }, MirType::Int32);
        let len = f.push_instr(b, ValueKind::ArrayLength { array: a }, MirType::Int32);
        let check = f.push_instr(
            b,
            ValueKind::BoundsCheck {
                index: i,
                length: len,
                minimum: 0,
                maximum: 0,
                movable: true,
            },
            MirType::Int32,
        );
        let v = f.push_instr(b, ValueKind::LoadElement { array: a, index: check }, MirType::Double);
        f.set_term(b, Terminator::Return(Some(v)));

        assert_eq!(run(&f, &[4.0, 3.0]).unwrap(), EvalOutcome::Return(Some(3.0)));
        assert_eq!(
            run(&f, &[4.0, 4.0]).unwrap(),
            EvalOutcome::Bailout {
                value: check,
                reason: "bounds check failed"
            }
        );
    }

    #[test]
    fn typed_array_loads_convert_elements() {
        assert_eq!(load_scalar(ScalarType::Int8, 200.0), -56.0);
        assert_eq!(load_scalar(ScalarType::Uint8Clamped, 300.0), 255.0);
        assert_eq!(load_scalar(ScalarType::Uint8Clamped, 2.5), 2.0);
        assert_eq!(load_scalar(ScalarType::Uint32, -1.0), 4294967295.0);
    }
}
