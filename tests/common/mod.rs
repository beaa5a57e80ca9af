#![allow(dead_code)]

use ionrange::mir::*;

/// Thin helper over `FnIR` for hand-built test functions.
pub struct Builder {
    pub f: FnIR,
}

impl Builder {
    pub fn new(name: &str) -> Self {
        Self { f: FnIR::new(name) }
    }

    pub fn block(&mut self) -> BlockId {
        self.f.add_block()
    }

    pub fn param(&mut self, b: BlockId, index: usize, ty: MirType) -> ValueId {
        self.f.push_instr(b, ValueKind::Param { index }, ty)
    }

    pub fn int(&mut self, b: BlockId, n: i32) -> ValueId {
        self.f.const_int(b, n)
    }

    pub fn double(&mut self, b: BlockId, d: f64) -> ValueId {
        self.f.push_instr(b, ValueKind::Const(Lit::Double(d)), MirType::Double)
    }

    fn binary(&mut self, b: BlockId, op: BinOp, lhs: ValueId, rhs: ValueId, flags: ArithFlags, ty: MirType) -> ValueId {
        self.f.push_instr(b, ValueKind::Binary { op, lhs, rhs, flags }, ty)
    }

    /// Int32 arithmetic with an overflow check.
    pub fn checked(&mut self, b: BlockId, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(b, op, lhs, rhs, ArithFlags::checked(), MirType::Int32)
    }

    /// Int32 bitwise ops and truncated arithmetic.
    pub fn wrapping(&mut self, b: BlockId, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(b, op, lhs, rhs, ArithFlags::wrapping(), MirType::Int32)
    }

    pub fn dbl(&mut self, b: BlockId, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(b, op, lhs, rhs, ArithFlags::checked(), MirType::Double)
    }

    pub fn unary(&mut self, b: BlockId, op: UnaryOp, rhs: ValueId, ty: MirType) -> ValueId {
        self.f.push_instr(b, ValueKind::Unary { op, rhs }, ty)
    }

    pub fn cmp(&mut self, b: BlockId, op: CmpOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.f.push_instr(b, ValueKind::Compare { op, lhs, rhs }, MirType::Boolean)
    }

    pub fn phi(&mut self, b: BlockId, args: Vec<(ValueId, BlockId)>, ty: MirType) -> ValueId {
        self.f.push_phi(b, args, ty)
    }

    pub fn add_phi_arg(&mut self, phi: ValueId, v: ValueId, pred: BlockId) {
        if let ValueKind::Phi { args } = &mut self.f.values[phi].kind {
            args.push((v, pred));
        }
    }

    pub fn goto(&mut self, b: BlockId, target: BlockId) {
        self.f.set_term(b, Terminator::Goto(target));
    }

    pub fn branch(&mut self, b: BlockId, cond: ValueId, then_bb: BlockId, else_bb: BlockId) {
        self.f.set_term(b, Terminator::If { cond, then_bb, else_bb });
    }

    pub fn ret(&mut self, b: BlockId, v: ValueId) {
        self.f.set_term(b, Terminator::Return(Some(v)));
    }
}

pub struct ArraySum {
    pub f: FnIR,
    pub i: ValueId,
    pub next: ValueId,
    pub check: ValueId,
    pub load: ValueId,
}

/// `s = 0; for (i = 0; i < n; i++) s += a[i]; return s`
/// with parameters `(a, n)`.
pub fn array_sum() -> ArraySum {
    let mut bld = Builder::new("array_sum");
    let entry = bld.block();
    let header = bld.block();
    let body = bld.block();
    let exit = bld.block();

    let a = bld.param(entry, 0, MirType::Object);
    let n = bld.param(entry, 1, MirType::Int32);
    let zero = bld.int(entry, 0);
    let zero_d = bld.double(entry, 0.0);
    let one = bld.int(entry, 1);
    let len = bld.f.push_instr(entry, ValueKind::ArrayLength { array: a }, MirType::Int32);
    bld.goto(entry, header);

    let i = bld.phi(header, vec![(zero, entry)], MirType::Int32);
    let s = bld.phi(header, vec![(zero_d, entry)], MirType::Double);
    let cond = bld.cmp(header, CmpOp::Lt, i, n);
    bld.branch(header, cond, body, exit);

    let check = bld.f.push_instr(
        body,
        ValueKind::BoundsCheck {
            index: i,
            length: len,
            minimum: 0,
            maximum: 0,
            movable: true,
        },
        MirType::Int32,
    );
    let load = bld.f.push_instr(body, ValueKind::LoadElement { array: a, index: check }, MirType::Double);
    let s2 = bld.dbl(body, BinOp::Add, s, load);
    let next = bld.checked(body, BinOp::Add, i, one);
    bld.goto(body, header);
    bld.add_phi_arg(i, next, body);
    bld.add_phi_arg(s, s2, body);

    bld.ret(exit, s);
    ArraySum {
        f: bld.f,
        i,
        next,
        check,
        load,
    }
}

/// `if (x < 10) y = x * 3 else y = x - 100; return ((y & 255) >> 2) + (y % 7)`
pub fn branchy() -> FnIR {
    let mut bld = Builder::new("branchy");
    let entry = bld.block();
    let small = bld.block();
    let large = bld.block();
    let join = bld.block();

    let x = bld.param(entry, 0, MirType::Int32);
    let ten = bld.int(entry, 10);
    let cond = bld.cmp(entry, CmpOp::Lt, x, ten);
    bld.branch(entry, cond, small, large);

    let three = bld.int(small, 3);
    let y1 = bld.checked(small, BinOp::Mul, x, three);
    bld.goto(small, join);

    let hundred = bld.int(large, 100);
    let y2 = bld.checked(large, BinOp::Sub, x, hundred);
    bld.goto(large, join);

    let y = bld.phi(join, vec![(y1, small), (y2, large)], MirType::Int32);
    let mask = bld.int(join, 255);
    let masked = bld.wrapping(join, BinOp::BitAnd, y, mask);
    let two = bld.int(join, 2);
    let shifted = bld.wrapping(join, BinOp::Rsh, masked, two);
    let seven = bld.int(join, 7);
    let rem = bld.checked(join, BinOp::Mod, y, seven);
    let out = bld.checked(join, BinOp::Add, shifted, rem);
    bld.ret(join, out);
    bld.f
}

/// `i = n; while (i > 0) i = i - 2; return i >>> 1`
pub fn countdown_by_two() -> FnIR {
    let mut bld = Builder::new("countdown");
    let entry = bld.block();
    let header = bld.block();
    let body = bld.block();
    let exit = bld.block();

    let n = bld.param(entry, 0, MirType::Int32);
    let zero = bld.int(entry, 0);
    let two = bld.int(entry, 2);
    let one = bld.int(entry, 1);
    bld.goto(entry, header);

    let i = bld.phi(header, vec![(n, entry)], MirType::Int32);
    let cond = bld.cmp(header, CmpOp::Gt, i, zero);
    bld.branch(header, cond, body, exit);

    let next = bld.checked(body, BinOp::Sub, i, two);
    bld.goto(body, header);
    bld.add_phi_arg(i, next, body);

    let shifted = bld.wrapping(exit, BinOp::Ursh, i, one);
    bld.ret(exit, shifted);
    bld.f
}

/// Double math over a double parameter: `x > 0.5 ? floor(sqrt(x)) : abs(x) * 0.5`.
pub fn doubles() -> FnIR {
    let mut bld = Builder::new("doubles");
    let entry = bld.block();
    let pos = bld.block();
    let neg = bld.block();
    let join = bld.block();

    let x = bld.param(entry, 0, MirType::Double);
    let half = bld.double(entry, 0.5);
    let cond = bld.cmp(entry, CmpOp::Gt, x, half);
    bld.branch(entry, cond, pos, neg);

    let root = bld.unary(pos, UnaryOp::Sqrt, x, MirType::Double);
    let fl = bld.unary(pos, UnaryOp::Floor, root, MirType::Double);
    bld.goto(pos, join);

    let abs = bld.unary(neg, UnaryOp::Abs, x, MirType::Double);
    let scaled = bld.dbl(neg, BinOp::Mul, abs, half);
    bld.goto(neg, join);

    let out = bld.phi(join, vec![(fl, pos), (scaled, neg)], MirType::Double);
    bld.ret(join, out);
    bld.f
}

/// The same function with JS number semantics: every int32 arithmetic
/// result becomes a double. Bitwise ops and `ToInt32` keep truncating.
pub fn double_reference(f: &FnIR) -> FnIR {
    let mut out = f.clone();
    for v in out.values.iter_mut() {
        if v.ty != MirType::Int32 {
            continue;
        }
        let arith = match &v.kind {
            ValueKind::Binary { op, .. } => !op.is_bitwise(),
            ValueKind::Unary { op, .. } => !matches!(op, UnaryOp::ToInt32 | UnaryOp::BitNot),
            ValueKind::Phi { .. } => true,
            _ => false,
        };
        if arith {
            v.ty = MirType::Double;
        }
    }
    out
}

/// `ToInt32((x / 2) + z)` with an int32 division and a wrapping add.
pub fn half_sum() -> (FnIR, ValueId) {
    let mut bld = Builder::new("half_sum");
    let b = bld.block();
    let x = bld.param(b, 0, MirType::Int32);
    let z = bld.param(b, 1, MirType::Int32);
    let two = bld.int(b, 2);
    let half = bld.checked(b, BinOp::Div, x, two);
    let sum = bld.wrapping(b, BinOp::Add, half, z);
    let out = bld.unary(b, UnaryOp::ToInt32, sum, MirType::Int32);
    bld.ret(b, out);
    (bld.f, half)
}

/// `((x / y) ^ (x % y)) + ((x + y) | 0)`
pub fn div_mod_mix() -> FnIR {
    let mut bld = Builder::new("div_mod_mix");
    let b = bld.block();
    let x = bld.param(b, 0, MirType::Int32);
    let y = bld.param(b, 1, MirType::Int32);
    let q = bld.checked(b, BinOp::Div, x, y);
    let r = bld.checked(b, BinOp::Mod, x, y);
    let mixed = bld.wrapping(b, BinOp::BitXor, q, r);
    let sum = bld.checked(b, BinOp::Add, x, y);
    let zero = bld.int(b, 0);
    let wrapped = bld.wrapping(b, BinOp::BitOr, sum, zero);
    let out = bld.checked(b, BinOp::Add, mixed, wrapped);
    bld.ret(b, out);
    bld.f
}
