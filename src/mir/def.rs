pub use crate::mir::analyze::range::Range;
use rustc_hash::FxHashMap;

pub type BlockId = usize;
pub type ValueId = usize;

/// Machine-level representation chosen for a value by the IR builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirType {
    Int32,
    Double,
    Boolean,
    Value,  // Boxed, any dynamic value
    Object, // Arrays and typed arrays
    None,   // Produces nothing (checks, stores)
}

impl MirType {
    pub fn is_number(self) -> bool {
        matches!(self, Self::Int32 | Self::Double)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lit {
    Int(i32),
    Double(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Lsh,
    Rsh,
    Ursh,
    Min,
    Max,
}

impl BinOp {
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            Self::BitAnd | Self::BitOr | Self::BitXor | Self::Lsh | Self::Rsh | Self::Ursh
        )
    }

    pub fn is_arith(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    BitNot,
    Abs,
    Floor,
    Ceil,
    Sqrt,
    ToInt32,  // ECMAScript ToInt32, wraps modulo 2^32
    ToDouble, // Representation change only
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    /// Operator that holds exactly when `self` does not (ignoring NaN).
    pub fn negate(self) -> Self {
        match self {
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Gt => Self::Le,
            Self::Ge => Self::Lt,
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
        }
    }

    /// Operator with swapped operands: `a < b` is `b > a`.
    pub fn reverse(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

/// Per-instruction arithmetic facts, filled in by range analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithFlags {
    pub fallible: bool, // Needs an overflow / precision check at runtime
    pub wrapping: bool, // Truncated: int32 result wraps modulo 2^32
    pub can_be_negative_zero: bool,
    pub can_be_divide_by_zero: bool,
}

impl ArithFlags {
    pub fn checked() -> Self {
        Self {
            fallible: true,
            wrapping: false,
            can_be_negative_zero: true,
            can_be_divide_by_zero: true,
        }
    }

    pub fn wrapping() -> Self {
        Self {
            fallible: false,
            wrapping: true,
            can_be_negative_zero: false,
            can_be_divide_by_zero: true,
        }
    }
}

impl Default for ArithFlags {
    fn default() -> Self {
        Self::checked()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Goto(BlockId),
    If {
        cond: ValueId,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Return(Option<ValueId>),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Goto(t) => vec![*t],
            Terminator::If {
                then_bb, else_bb, ..
            } => vec![*then_bb, *else_bb],
            _ => vec![],
        }
    }

    pub fn operand(&self) -> Option<ValueId> {
        match self {
            Terminator::If { cond, .. } => Some(*cond),
            Terminator::Return(v) => *v,
            _ => None,
        }
    }

    fn operand_mut(&mut self) -> Option<&mut ValueId> {
        match self {
            Terminator::If { cond, .. } => Some(cond),
            Terminator::Return(Some(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub phis: Vec<ValueId>,
    pub instrs: Vec<ValueId>,
    pub term: Terminator,
    // Set by range analysis when a refinement on the only incoming edge is empty.
    pub unreachable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Const(Lit),
    Param {
        index: usize,
    },

    // SSA Phi Node: one (value, predecessor) pair per incoming edge.
    Phi {
        args: Vec<(ValueId, BlockId)>,
    },
    // Branch refinement of `input`, only present between
    // `add_beta_nodes` and `remove_beta_nodes`.
    Beta {
        input: ValueId,
        refinement: Range,
    },

    Binary {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
        flags: ArithFlags,
    },
    Unary {
        op: UnaryOp,
        rhs: ValueId,
    },
    Compare {
        op: CmpOp,
        lhs: ValueId,
        rhs: ValueId,
    },

    ArrayLength {
        array: ValueId,
    },
    TypedArrayLength {
        array: ValueId,
    },
    LoadElement {
        array: ValueId,
        index: ValueId,
    },
    LoadTypedArray {
        array: ValueId,
        index: ValueId,
        elem: ScalarType,
    },
    StoreElement {
        array: ValueId,
        index: ValueId,
        val: ValueId,
    },

    // Passes iff index + minimum >= 0 && index + maximum < length.
    // Produces `index`.
    BoundsCheck {
        index: ValueId,
        length: ValueId,
        minimum: i32,
        maximum: i32,
        movable: bool,
    },
    // Passes iff index >= minimum.
    BoundsCheckLower {
        index: ValueId,
        minimum: i32,
    },

    Call {
        callee: String,
        args: Vec<ValueId>,
    },

    // Debug-only self check inserted by `add_range_assertions`.
    AssertRange {
        input: ValueId,
        range: Range,
    },
}

impl ValueKind {
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            ValueKind::Const(_) | ValueKind::Param { .. } => vec![],
            ValueKind::Phi { args } => args.iter().map(|(v, _)| *v).collect(),
            ValueKind::Beta { input, .. } | ValueKind::AssertRange { input, .. } => vec![*input],
            ValueKind::Binary { lhs, rhs, .. } | ValueKind::Compare { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            ValueKind::Unary { rhs, .. } => vec![*rhs],
            ValueKind::ArrayLength { array } | ValueKind::TypedArrayLength { array } => {
                vec![*array]
            }
            ValueKind::LoadElement { array, index }
            | ValueKind::LoadTypedArray { array, index, .. } => vec![*array, *index],
            ValueKind::StoreElement { array, index, val } => vec![*array, *index, *val],
            ValueKind::BoundsCheck { index, length, .. } => vec![*index, *length],
            ValueKind::BoundsCheckLower { index, .. } => vec![*index],
            ValueKind::Call { args, .. } => args.clone(),
        }
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            ValueKind::Const(_) | ValueKind::Param { .. } => {}
            ValueKind::Phi { args } => args.iter_mut().for_each(|(v, _)| f(v)),
            ValueKind::Beta { input, .. } | ValueKind::AssertRange { input, .. } => f(input),
            ValueKind::Binary { lhs, rhs, .. } | ValueKind::Compare { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            ValueKind::Unary { rhs, .. } => f(rhs),
            ValueKind::ArrayLength { array } | ValueKind::TypedArrayLength { array } => f(array),
            ValueKind::LoadElement { array, index }
            | ValueKind::LoadTypedArray { array, index, .. } => {
                f(array);
                f(index);
            }
            ValueKind::StoreElement { array, index, val } => {
                f(array);
                f(index);
                f(val);
            }
            ValueKind::BoundsCheck { index, length, .. } => {
                f(index);
                f(length);
            }
            ValueKind::BoundsCheckLower { index, .. } => f(index),
            ValueKind::Call { args, .. } => args.iter_mut().for_each(f),
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, ValueKind::Phi { .. })
    }

    pub fn is_beta(&self) -> bool {
        matches!(self, ValueKind::Beta { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Value {
    pub id: ValueId,
    pub kind: ValueKind,
    pub ty: MirType,
    pub block: Option<BlockId>, // None for values not (or no longer) placed in a block
    pub range: Option<Range>,   // Range analysis result
}

/// One use of a value: either operand `index` of a placed value, or a
/// block terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Use {
    Operand { user: ValueId, index: usize },
    Terminator(BlockId),
}

#[derive(Debug, Clone)]
pub struct FnIR {
    pub name: String,
    pub blocks: Vec<Block>, // indices are BlockIds
    pub values: Vec<Value>, // indices are ValueIds
    pub entry: BlockId,
    // Hybrid fallback: the optimizing path gave up on this function.
    pub unsupported_dynamic: bool,
    pub fallback_reasons: Vec<String>,
}

impl FnIR {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
            values: Vec::new(),
            entry: 0,
            unsupported_dynamic: false,
            fallback_reasons: Vec::new(),
        }
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(Block {
            id,
            phis: Vec::new(),
            instrs: Vec::new(),
            // Set to a real terminator when the block is finalized.
            term: Terminator::Unreachable,
            unreachable: false,
        });
        id
    }

    /// Creates a value that is not placed in any block yet.
    pub fn add_value(&mut self, kind: ValueKind, ty: MirType) -> ValueId {
        let id = self.values.len();
        self.values.push(Value {
            id,
            kind,
            ty,
            block: None,
            range: None,
        });
        id
    }

    /// Appends a new instruction at the end of `bid` (before its terminator).
    pub fn push_instr(&mut self, bid: BlockId, kind: ValueKind, ty: MirType) -> ValueId {
        let pos = self.blocks[bid].instrs.len();
        self.insert_instr(bid, pos, kind, ty)
    }

    pub fn insert_instr(
        &mut self,
        bid: BlockId,
        pos: usize,
        kind: ValueKind,
        ty: MirType,
    ) -> ValueId {
        let vid = self.add_value(kind, ty);
        self.values[vid].block = Some(bid);
        self.blocks[bid].instrs.insert(pos, vid);
        vid
    }

    pub fn push_phi(&mut self, bid: BlockId, args: Vec<(ValueId, BlockId)>, ty: MirType) -> ValueId {
        let vid = self.add_value(ValueKind::Phi { args }, ty);
        self.values[vid].block = Some(bid);
        self.blocks[bid].phis.push(vid);
        vid
    }

    /// Detaches `vid` from its block. The value stays in the arena.
    pub fn remove_instr(&mut self, vid: ValueId) {
        if let Some(bid) = self.values[vid].block.take() {
            let blk = &mut self.blocks[bid];
            blk.instrs.retain(|v| *v != vid);
            blk.phis.retain(|v| *v != vid);
        }
    }

    pub fn set_term(&mut self, bid: BlockId, term: Terminator) {
        self.blocks[bid].term = term;
    }

    pub fn const_int(&mut self, bid: BlockId, n: i32) -> ValueId {
        self.push_instr(bid, ValueKind::Const(Lit::Int(n)), MirType::Int32)
    }

    pub fn as_const_int(&self, vid: ValueId) -> Option<i32> {
        match self.values[vid].kind {
            ValueKind::Const(Lit::Int(n)) => Some(n),
            _ => None,
        }
    }

    pub fn as_const_number(&self, vid: ValueId) -> Option<f64> {
        match self.values[vid].kind {
            ValueKind::Const(Lit::Int(n)) => Some(n as f64),
            ValueKind::Const(Lit::Double(d)) => Some(d),
            _ => None,
        }
    }

    /// Block a value is defined in. Floating values belong to the entry.
    pub fn def_block(&self, vid: ValueId) -> BlockId {
        self.values[vid].block.unwrap_or(self.entry)
    }

    /// All placed values of a block, phis first.
    pub fn block_values(&self, bid: BlockId) -> Vec<ValueId> {
        let blk = &self.blocks[bid];
        blk.phis.iter().chain(blk.instrs.iter()).copied().collect()
    }

    pub fn use_map(&self) -> FxHashMap<ValueId, Vec<Use>> {
        let mut uses: FxHashMap<ValueId, Vec<Use>> = FxHashMap::default();
        for blk in &self.blocks {
            for vid in blk.phis.iter().chain(blk.instrs.iter()) {
                for (index, op) in self.values[*vid].kind.operands().into_iter().enumerate() {
                    uses.entry(op).or_default().push(Use::Operand { user: *vid, index });
                }
            }
            if let Some(op) = blk.term.operand() {
                uses.entry(op).or_default().push(Use::Terminator(blk.id));
            }
        }
        uses
    }

    /// Rewrites every placed use of `old` (operands and terminators) to `new`.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) -> usize {
        let mut replaced = 0;
        for bid in 0..self.blocks.len() {
            for vid in self.block_values(bid) {
                if vid == new {
                    continue;
                }
                self.values[vid].kind.for_each_operand_mut(|op| {
                    if *op == old {
                        *op = new;
                        replaced += 1;
                    }
                });
            }
            if let Some(op) = self.blocks[bid].term.operand_mut() {
                if *op == old {
                    *op = new;
                    replaced += 1;
                }
            }
        }
        replaced
    }

    pub fn mark_unsupported_dynamic(&mut self, reason: String) {
        self.unsupported_dynamic = true;
        if !self.fallback_reasons.iter().any(|r| r == &reason) {
            self.fallback_reasons.push(reason);
        }
    }
}
