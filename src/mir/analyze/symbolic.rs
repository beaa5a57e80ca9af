use crate::error::{RangeCode, RangeException, Stage, RR};
use crate::mir::*;
use std::fmt;

pub type SymbolicId = usize;
pub type LoopBoundId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearTerm {
    pub term: ValueId,
    pub scale: i32,
}

/// `sum(scale_i * term_i) + constant` over int32 SSA values. Every mutation
/// is overflow checked and reports failure with `false`; the sum is
/// unspecified afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearSum {
    terms: Vec<LinearTerm>,
    constant: i32,
}

impl LinearSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_constant(constant: i32) -> Self {
        Self {
            terms: Vec::new(),
            constant,
        }
    }

    pub fn terms(&self) -> &[LinearTerm] {
        &self.terms
    }

    pub fn constant(&self) -> i32 {
        self.constant
    }

    pub fn add_sum(&mut self, scale: i32, other: &LinearSum) -> bool {
        for t in &other.terms {
            let Some(s) = scale.checked_mul(t.scale) else {
                return false;
            };
            if !self.add_raw_term(t.term, s) {
                return false;
            }
        }
        match scale.checked_mul(other.constant) {
            Some(c) => self.add_constant(c),
            None => false,
        }
    }

    /// Adds `scale * term`, folding int32 constants into the constant part.
    pub fn add_term(&mut self, fn_ir: &FnIR, term: ValueId, scale: i32) -> bool {
        if scale == 0 {
            return true;
        }
        if let Some(c) = fn_ir.as_const_int(term) {
            return match c.checked_mul(scale) {
                Some(v) => self.add_constant(v),
                None => false,
            };
        }
        self.add_raw_term(term, scale)
    }

    fn add_raw_term(&mut self, term: ValueId, scale: i32) -> bool {
        if scale == 0 {
            return true;
        }
        if let Some(pos) = self.terms.iter().position(|t| t.term == term) {
            let Some(s) = self.terms[pos].scale.checked_add(scale) else {
                return false;
            };
            if s == 0 {
                self.terms.remove(pos);
            } else {
                self.terms[pos].scale = s;
            }
            return true;
        }
        self.terms.push(LinearTerm { term, scale });
        true
    }

    pub fn add_constant(&mut self, constant: i32) -> bool {
        match self.constant.checked_add(constant) {
            Some(c) => {
                self.constant = c;
                true
            }
            None => false,
        }
    }

    pub fn multiply(&mut self, scale: i32) -> bool {
        for t in &mut self.terms {
            match t.scale.checked_mul(scale) {
                Some(s) => t.scale = s,
                None => return false,
            }
        }
        if scale == 0 {
            self.terms.clear();
        }
        match self.constant.checked_mul(scale) {
            Some(c) => {
                self.constant = c;
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for LinearSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, t) in self.terms.iter().enumerate() {
            let (neg, mag) = (t.scale < 0, t.scale.unsigned_abs());
            match (i, neg) {
                (0, false) => {}
                (0, true) => write!(f, "-")?,
                (_, false) => write!(f, " + ")?,
                (_, true) => write!(f, " - ")?,
            }
            if mag == 1 {
                write!(f, "#{}", t.term)?;
            } else {
                write!(f, "{}*#{}", mag, t.term)?;
            }
        }
        if self.terms.is_empty() {
            write!(f, "{}", self.constant)?;
        } else if self.constant > 0 {
            write!(f, " + {}", self.constant)?;
        } else if self.constant < 0 {
            write!(f, " - {}", self.constant.unsigned_abs())?;
        }
        Ok(())
    }
}

/// Upper bound on the remaining backedge executions of a loop. Code
/// dominated by `test` runs at most `sum` more times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopIterationBound {
    pub header: BlockId,
    pub test: BlockId,
    pub sum: LinearSum,
}

/// A linear sum bounding a value. Tied to a loop bound, it only holds at
/// points dominated by that bound's test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicBound {
    pub loop_bound: Option<LoopBoundId>,
    pub sum: LinearSum,
}

/// Owns every loop and symbolic bound of one analysis run.
#[derive(Debug, Clone)]
pub struct BoundArena {
    loop_bounds: Vec<LoopIterationBound>,
    symbolic: Vec<SymbolicBound>,
    capacity: usize,
}

impl BoundArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            loop_bounds: Vec::new(),
            symbolic: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.loop_bounds.len() + self.symbolic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reserve_slot(&self) -> RR<()> {
        if self.len() >= self.capacity {
            return Err(RangeException::new(
                "RangeAnalysis",
                RangeCode::E4001,
                Stage::Analyze,
                format!("bound arena exhausted ({} entries)", self.capacity),
            )
            .note("raise IONRANGE_ARENA_CAPACITY"));
        }
        Ok(())
    }

    pub fn alloc_loop_bound(&mut self, bound: LoopIterationBound) -> RR<LoopBoundId> {
        self.reserve_slot()?;
        self.loop_bounds.push(bound);
        Ok(self.loop_bounds.len() - 1)
    }

    pub fn alloc_symbolic(&mut self, bound: SymbolicBound) -> RR<SymbolicId> {
        self.reserve_slot()?;
        self.symbolic.push(bound);
        Ok(self.symbolic.len() - 1)
    }

    pub fn loop_bound(&self, id: LoopBoundId) -> &LoopIterationBound {
        &self.loop_bounds[id]
    }

    pub fn symbolic(&self, id: SymbolicId) -> &SymbolicBound {
        &self.symbolic[id]
    }

    pub fn loop_bounds(&self) -> &[LoopIterationBound] {
        &self.loop_bounds
    }

    pub fn display_symbolic(&self, id: SymbolicId) -> String {
        let b = self.symbolic(id);
        match b.loop_bound {
            Some(lb) => format!("{} [loop {}]", b.sum, self.loop_bound(lb).header),
            None => b.sum.to_string(),
        }
    }

    /// `Display` adapter printing a range with its symbolic bounds.
    pub fn range_display<'a>(&'a self, range: &'a Range) -> RangeDisplay<'a> {
        RangeDisplay { arena: self, range }
    }
}

pub struct RangeDisplay<'a> {
    arena: &'a BoundArena,
    range: &'a Range,
}

impl fmt::Display for RangeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lower = self
            .range
            .symbolic_lower()
            .map(|id| self.arena.display_symbolic(id));
        let upper = self
            .range
            .symbolic_upper()
            .map(|id| self.arena.display_symbolic(id));
        self.range
            .write_annotated(f, lower.as_deref(), upper.as_deref())
    }
}

/// `term + constant`; no term means a plain constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleLinearSum {
    pub term: Option<ValueId>,
    pub constant: i32,
}

impl SimpleLinearSum {
    pub fn new(term: Option<ValueId>, constant: i32) -> Self {
        Self { term, constant }
    }
}

fn skip_betas(fn_ir: &FnIR, mut vid: ValueId) -> ValueId {
    while let ValueKind::Beta { input, .. } = fn_ir.values[vid].kind {
        vid = input;
    }
    vid
}

/// Splits an int32 value into `term + constant` when it is a non-wrapping
/// addition or subtraction of a constant.
pub fn extract_linear_sum(fn_ir: &FnIR, vid: ValueId) -> SimpleLinearSum {
    let vid = skip_betas(fn_ir, vid);
    let val = &fn_ir.values[vid];
    if val.ty != MirType::Int32 {
        return SimpleLinearSum::new(Some(vid), 0);
    }

    match val.kind {
        ValueKind::Const(Lit::Int(c)) => SimpleLinearSum::new(None, c),
        ValueKind::Binary {
            op: op @ (BinOp::Add | BinOp::Sub),
            lhs,
            rhs,
            flags,
        } if !flags.wrapping => {
            let lsum = extract_linear_sum(fn_ir, lhs);
            let rsum = extract_linear_sum(fn_ir, rhs);
            if lsum.term.is_some() && rsum.term.is_some() {
                return SimpleLinearSum::new(Some(vid), 0);
            }
            // <SUM> + n, n + <SUM> or <SUM> - n
            if op == BinOp::Add {
                match lsum.constant.checked_add(rsum.constant) {
                    Some(c) => SimpleLinearSum::new(lsum.term.or(rsum.term), c),
                    None => SimpleLinearSum::new(Some(vid), 0),
                }
            } else if lsum.term.is_some() {
                match lsum.constant.checked_sub(rsum.constant) {
                    Some(c) => SimpleLinearSum::new(lsum.term, c),
                    None => SimpleLinearSum::new(Some(vid), 0),
                }
            } else {
                SimpleLinearSum::new(Some(vid), 0)
            }
        }
        _ => SimpleLinearSum::new(Some(vid), 0),
    }
}

/// `lhs <= rhs` (or `>=`) known to hold on one edge of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearInequality {
    pub lhs: SimpleLinearSum,
    pub rhs: Option<ValueId>,
    pub less_equal: bool,
}

/// Reads the int32 comparison `cond` as taken on the `direction` edge and
/// normalizes it to `lhs_term + c (<= | >=) rhs_term`.
pub fn extract_linear_inequality(
    fn_ir: &FnIR,
    cond: ValueId,
    direction: bool,
) -> Option<LinearInequality> {
    let ValueKind::Compare { op, lhs, rhs } = fn_ir.values[cond].kind else {
        return None;
    };
    if fn_ir.values[lhs].ty != MirType::Int32 || fn_ir.values[rhs].ty != MirType::Int32 {
        return None;
    }
    let op = if direction { op } else { op.negate() };

    let mut lsum = extract_linear_sum(fn_ir, lhs);
    let rsum = extract_linear_sum(fn_ir, rhs);
    lsum.constant = lsum.constant.checked_sub(rsum.constant)?;

    let less_equal = match op {
        CmpOp::Le => true,
        // x < y ==> x + 1 <= y
        CmpOp::Lt => {
            lsum.constant = lsum.constant.checked_add(1)?;
            true
        }
        CmpOp::Ge => false,
        // x > y ==> x - 1 >= y
        CmpOp::Gt => {
            lsum.constant = lsum.constant.checked_sub(1)?;
            false
        }
        CmpOp::Eq | CmpOp::Ne => return None,
    };

    Some(LinearInequality {
        lhs: lsum,
        rhs: rsum.term,
        less_equal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(f: &mut FnIR, bb: BlockId, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        f.push_instr(
            bb,
            ValueKind::Binary {
                op,
                lhs,
                rhs,
                flags: ArithFlags::checked(),
            },
            MirType::Int32,
        )
    }

    #[test]
    fn linear_sum_merges_and_cancels_terms() {
        let f = FnIR::new("f");
        let mut s = LinearSum::new();
        assert!(s.add_raw_term(3, 2));
        assert!(s.add_raw_term(5, 1));
        assert!(s.add_raw_term(3, -2));
        assert_eq!(s.terms(), &[LinearTerm { term: 5, scale: 1 }]);
        assert!(s.add_term(&f, 5, 0));
        assert_eq!(s.terms().len(), 1);
    }

    #[test]
    fn linear_sum_folds_constant_terms() {
        let mut f = FnIR::new("f");
        let b = f.add_block();
        let seven = f.const_int(b, 7);
        let mut s = LinearSum::from_constant(1);
        assert!(s.add_term(&f, seven, 3));
        assert!(s.terms().is_empty());
        assert_eq!(s.constant(), 22);
    }

    #[test]
    fn linear_sum_reports_overflow() {
        let mut s = LinearSum::from_constant(i32::MAX);
        assert!(!s.add_constant(1));
        let mut s = LinearSum::from_constant(1 << 20);
        assert!(!s.multiply(1 << 12));
        let mut s = LinearSum::new();
        assert!(s.add_raw_term(1, i32::MAX));
        assert!(!s.add_sum(2, &s.clone()));
    }

    #[test]
    fn linear_sum_display() {
        let mut s = LinearSum::from_constant(-1);
        assert!(s.add_raw_term(3, 1));
        assert!(s.add_raw_term(5, 2));
        assert_eq!(s.to_string(), "#3 + 2*#5 - 1");
        let mut s = LinearSum::from_constant(4);
        assert!(s.add_raw_term(2, -1));
        assert_eq!(s.to_string(), "-#2 + 4");
        assert_eq!(LinearSum::from_constant(0).to_string(), "0");
    }

    #[test]
    fn extract_sum_through_beta_and_constants() {
        let mut f = FnIR::new("f");
        let b = f.add_block();
        let x = f.push_instr(b, ValueKind::Param { index: 0 }, MirType::Int32);
        let three = f.const_int(b, 3);
        let one = f.const_int(b, 1);
        let xp3 = add(&mut f, b, BinOp::Add, x, three);
        let sum = add(&mut f, b, BinOp::Sub, xp3, one);
        let beta = f.push_instr(
            b,
            ValueKind::Beta {
                input: sum,
                refinement: Range::int32(0, 10),
            },
            MirType::Int32,
        );
        assert_eq!(extract_linear_sum(&f, beta), SimpleLinearSum::new(Some(x), 2));
        assert_eq!(extract_linear_sum(&f, three), SimpleLinearSum::new(None, 3));
        let xx = add(&mut f, b, BinOp::Add, x, x);
        assert_eq!(extract_linear_sum(&f, xx), SimpleLinearSum::new(Some(xx), 0));
        // 1 - x is not of the form term + c
        let neg = add(&mut f, b, BinOp::Sub, one, x);
        assert_eq!(extract_linear_sum(&f, neg), SimpleLinearSum::new(Some(neg), 0));
    }

    #[test]
    fn extract_sum_ignores_wrapping_arith() {
        let mut f = FnIR::new("f");
        let b = f.add_block();
        let x = f.push_instr(b, ValueKind::Param { index: 0 }, MirType::Int32);
        let one = f.const_int(b, 1);
        let wrapped = f.push_instr(
            b,
            ValueKind::Binary {
                op: BinOp::Add,
                lhs: x,
                rhs: one,
                flags: ArithFlags::wrapping(),
            },
            MirType::Int32,
        );
        assert_eq!(
            extract_linear_sum(&f, wrapped),
            SimpleLinearSum::new(Some(wrapped), 0)
        );
    }

    #[test]
    fn extract_inequality_normalizes() {
        let mut f = FnIR::new("f");
        let b = f.add_block();
        let i = f.push_instr(b, ValueKind::Param { index: 0 }, MirType::Int32);
        let n = f.push_instr(b, ValueKind::Param { index: 1 }, MirType::Int32);
        let lt = f.push_instr(
            b,
            ValueKind::Compare {
                op: CmpOp::Lt,
                lhs: i,
                rhs: n,
            },
            MirType::Boolean,
        );
        // i < n  ==>  i + 1 <= n
        let taken = extract_linear_inequality(&f, lt, true).unwrap();
        assert_eq!(taken.lhs, SimpleLinearSum::new(Some(i), 1));
        assert_eq!(taken.rhs, Some(n));
        assert!(taken.less_equal);
        // !(i < n)  ==>  i >= n
        let exit = extract_linear_inequality(&f, lt, false).unwrap();
        assert_eq!(exit.lhs, SimpleLinearSum::new(Some(i), 0));
        assert!(!exit.less_equal);

        let eq = f.push_instr(
            b,
            ValueKind::Compare {
                op: CmpOp::Eq,
                lhs: i,
                rhs: n,
            },
            MirType::Boolean,
        );
        assert!(extract_linear_inequality(&f, eq, true).is_none());
    }

    #[test]
    fn arena_enforces_capacity() {
        let mut arena = BoundArena::new(2);
        let lb = arena
            .alloc_loop_bound(LoopIterationBound {
                header: 1,
                test: 1,
                sum: LinearSum::from_constant(10),
            })
            .unwrap();
        let sym = arena
            .alloc_symbolic(SymbolicBound {
                loop_bound: Some(lb),
                sum: LinearSum::from_constant(9),
            })
            .unwrap();
        assert_eq!(arena.display_symbolic(sym), "9 [loop 1]");
        let err = arena
            .alloc_symbolic(SymbolicBound {
                loop_bound: None,
                sum: LinearSum::new(),
            })
            .unwrap_err();
        assert_eq!(err.code, RangeCode::E4001);

        let mut r = Range::int32(0, 9);
        r.set_symbolic_upper(Some(sym));
        assert_eq!(
            arena.range_display(&r).to_string(),
            "[0, 9 {9 [loop 1]}]"
        );
    }
}
