use crate::mir::analyze::symbolic::SymbolicId;
use std::cmp::{max, min};
use std::fmt;

// Int32 are signed. i32::MAX is 2^31-1 and i32::MIN is -2^31, so the
// greatest exponent we need is 31.
pub const MAX_INT32_EXPONENT: u16 = 31;

// u32::MAX is 2^32-1, the greatest value with an exponent of 31.
pub const MAX_UINT32_EXPONENT: u16 = 31;

// Doubles have 52 bits of mantissa; above 2^52 integer arithmetic on
// doubles starts losing precision.
pub const MAX_TRUNCATABLE_EXPONENT: u16 = 52;

pub const MAX_FINITE_EXPONENT: u16 = 1023;

// All non-NaN doubles, finite values and the infinities.
pub const INCLUDES_INFINITY: u16 = MAX_FINITE_EXPONENT + 1;

// Every double, NaN included.
pub const INCLUDES_INFINITY_AND_NAN: u16 = u16::MAX;

// 64-bit endpoints just outside int32. They compare greater (resp. less)
// than any int32 and mean "no int32 bound on this side".
pub const NO_INT32_UPPER_BOUND: i64 = i32::MAX as i64 + 1;
pub const NO_INT32_LOWER_BOUND: i64 = i32::MIN as i64 - 1;

fn floor_log2(x: u32) -> u16 {
    if x == 0 {
        0
    } else {
        (31 - x.leading_zeros()) as u16
    }
}

/// Exponent of a finite double, with everything below 1 mapped to 0.
fn double_exponent(d: f64) -> u16 {
    let abs = d.abs();
    if abs < 1.0 {
        return 0;
    }
    let biased = ((abs.to_bits() >> 52) & 0x7ff) as i64;
    (biased - 1023).clamp(0, MAX_FINITE_EXPONENT as i64) as u16
}

/// Abstract value of one IR value.
///
/// Endpoints are in `{-inf} U [i32::MIN, i32::MAX] U {+inf}`: a missing
/// int32 bound means the value may have overflowed in that direction. In
/// that case the stored endpoint is the matching int32 extreme, so that
/// consumers which only run when no overflow happened can read the
/// endpoint as a clamped bound.
///
/// Next to the endpoints the range keeps `max_exponent`, an over-estimate
/// of `floor(log2(|x|))` for every value `x`, or one of the sentinels
/// [`INCLUDES_INFINITY`] / [`INCLUDES_INFINITY_AND_NAN`].
///
/// For fractional ranges `lower <= floor(min)` and `upper >= ceil(max)`.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    lower: i32,
    has_int32_lower_bound: bool,

    upper: i32,
    has_int32_upper_bound: bool,

    can_have_fractional_part: bool,
    max_exponent: u16,

    // Symbolic bounds, indices into the analysis' bound arena.
    symbolic_lower: Option<SymbolicId>,
    symbolic_upper: Option<SymbolicId>,
}

/// Numeric equality: symbolic bounds are annotations and do not take part.
impl PartialEq for Range {
    fn eq(&self, other: &Self) -> bool {
        self.lower == other.lower
            && self.has_int32_lower_bound == other.has_int32_lower_bound
            && self.upper == other.upper
            && self.has_int32_upper_bound == other.has_int32_upper_bound
            && self.can_have_fractional_part == other.can_have_fractional_part
            && self.max_exponent == other.max_exponent
    }
}

impl Default for Range {
    fn default() -> Self {
        Self::unknown()
    }
}

impl Range {
    fn raw(l: i32, lb: bool, h: i32, hb: bool, f: bool, e: u16) -> Self {
        let mut r = Self {
            lower: l,
            has_int32_lower_bound: lb,
            upper: h,
            has_int32_upper_bound: hb,
            can_have_fractional_part: f,
            max_exponent: e,
            symbolic_lower: None,
            symbolic_upper: None,
        };
        r.optimize();
        r
    }

    /// Range from 64-bit endpoints; endpoints outside int32 become
    /// missing bounds.
    pub fn new(l: i64, h: i64, fractional: bool, exponent: u16) -> Self {
        let mut r = Self {
            lower: i32::MIN,
            has_int32_lower_bound: false,
            upper: i32::MAX,
            has_int32_upper_bound: false,
            can_have_fractional_part: fractional,
            max_exponent: exponent,
            symbolic_lower: None,
            symbolic_upper: None,
        };
        r.set(l, h, fractional, exponent);
        r
    }

    pub fn unknown() -> Self {
        Self::double(
            NO_INT32_LOWER_BOUND,
            NO_INT32_UPPER_BOUND,
            INCLUDES_INFINITY_AND_NAN,
        )
    }

    pub fn int32(l: i32, h: i32) -> Self {
        Self::new(l as i64, h as i64, false, MAX_INT32_EXPONENT)
    }

    /// Uint32 values above i32::MAX leave the range upper-unbounded.
    pub fn uint32(l: u32, h: u32) -> Self {
        Self::new(l as i64, h as i64, false, MAX_UINT32_EXPONENT)
    }

    pub fn double(l: i64, h: i64, exponent: u16) -> Self {
        Self::new(l, h, true, exponent)
    }

    pub fn single_value(v: i64) -> Self {
        Self::new(v, v, false, INCLUDES_INFINITY_AND_NAN)
    }

    /// Exact range of one double constant.
    pub fn from_f64_singleton(d: f64) -> Self {
        if d.is_nan() {
            return Self::unknown();
        }
        if d.is_infinite() {
            return if d > 0.0 {
                Self::new(
                    NO_INT32_UPPER_BOUND,
                    NO_INT32_UPPER_BOUND,
                    false,
                    INCLUDES_INFINITY,
                )
            } else {
                Self::new(
                    NO_INT32_LOWER_BOUND,
                    NO_INT32_LOWER_BOUND,
                    false,
                    INCLUDES_INFINITY,
                )
            };
        }
        // `as` saturates, which lands on the sentinels for large values.
        let l = d.floor() as i64;
        let h = d.ceil() as i64;
        let implied = floor_log2(max(l.unsigned_abs(), h.unsigned_abs()).min(u32::MAX as u64) as u32);
        Self::new(l, h, d.fract() != 0.0, max(double_exponent(d), implied))
    }

    /// Range of all doubles in `[l, h]`, infinite endpoints allowed. The
    /// result never holds NaN; see [`Range::with_nan`].
    pub fn from_f64_bounds(l: f64, h: f64) -> Self {
        let exp_of = |d: f64| {
            if d.is_nan() {
                INCLUDES_INFINITY_AND_NAN
            } else if d.is_infinite() {
                INCLUDES_INFINITY
            } else {
                double_exponent(d)
            }
        };
        let lower = if l.is_nan() {
            NO_INT32_LOWER_BOUND
        } else {
            (l.floor() as i64).clamp(NO_INT32_LOWER_BOUND, NO_INT32_UPPER_BOUND)
        };
        let upper = if h.is_nan() {
            NO_INT32_UPPER_BOUND
        } else {
            (h.ceil() as i64).clamp(NO_INT32_LOWER_BOUND, NO_INT32_UPPER_BOUND)
        };
        let (le, he) = (exp_of(l), exp_of(h));
        // Fractions survive near zero and below the precision limit.
        let crosses_zero = (l.is_nan() || l < 0.0) && (h.is_nan() || h > 0.0);
        let fractional = crosses_zero || min(le, he) < MAX_TRUNCATABLE_EXPONENT;
        let implied = floor_log2(
            max(lower.unsigned_abs(), upper.unsigned_abs()).min(u32::MAX as u64) as u32,
        );
        Self::new(lower, upper, fractional, max(max(le, he), implied))
    }

    /// Adds NaN to a range that is open on at least one side. Closed int32
    /// ranges cannot hold NaN and are returned unchanged.
    pub fn with_nan(mut self) -> Self {
        if !self.has_int32_bounds() {
            self.max_exponent = INCLUDES_INFINITY_AND_NAN;
        }
        self
    }

    /// Default range for a value of the given representation.
    pub fn for_type(ty: crate::mir::MirType) -> Self {
        match ty {
            crate::mir::MirType::Int32 => Self::int32(i32::MIN, i32::MAX),
            crate::mir::MirType::Boolean => Self::int32(0, 1),
            _ => Self::unknown(),
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(self.lower <= self.upper, "{:?}", self);
        debug_assert!(self.has_int32_lower_bound || self.lower == i32::MIN);
        debug_assert!(self.has_int32_upper_bound || self.upper == i32::MAX);
        debug_assert!(
            (self.has_int32_lower_bound && self.has_int32_upper_bound)
                || self.max_exponent >= MAX_INT32_EXPONENT
        );
        debug_assert!(
            self.max_exponent <= MAX_FINITE_EXPONENT
                || self.max_exponent == INCLUDES_INFINITY
                || self.max_exponent == INCLUDES_INFINITY_AND_NAN
        );
        debug_assert!(self.max_exponent >= floor_log2(self.upper.unsigned_abs()));
        debug_assert!(self.max_exponent >= floor_log2(self.lower.unsigned_abs()));
    }

    fn set_lower_init(&mut self, x: i64) {
        if x > i32::MAX as i64 {
            self.lower = i32::MAX;
            self.has_int32_lower_bound = true;
        } else if x < i32::MIN as i64 {
            self.lower = i32::MIN;
            self.has_int32_lower_bound = false;
        } else {
            self.lower = x as i32;
            self.has_int32_lower_bound = true;
        }
    }

    fn set_upper_init(&mut self, x: i64) {
        if x > i32::MAX as i64 {
            self.upper = i32::MAX;
            self.has_int32_upper_bound = false;
        } else if x < i32::MIN as i64 {
            self.upper = i32::MIN;
            self.has_int32_upper_bound = true;
        } else {
            self.upper = x as i32;
            self.has_int32_upper_bound = true;
        }
    }

    fn exponent_implied_by_int32_bounds(&self) -> u16 {
        floor_log2(max(self.lower.unsigned_abs(), self.upper.unsigned_abs()))
    }

    // Tighten whatever the other fields imply. The range must be valid
    // before and stays valid after.
    fn optimize(&mut self) {
        self.assert_invariants();
        if self.has_int32_bounds() {
            let implied = self.exponent_implied_by_int32_bounds();
            if implied < self.max_exponent {
                self.max_exponent = implied;
            }
            // A precise single-point range can only hold an integer.
            if self.can_have_fractional_part && self.lower == self.upper {
                self.can_have_fractional_part = false;
            }
        }
        self.assert_invariants();
    }

    pub fn set(&mut self, l: i64, h: i64, fractional: bool, exponent: u16) {
        self.can_have_fractional_part = fractional;
        self.set_lower_init(l);
        self.set_upper_init(h);
        // Anything beyond int32 has at least the magnitude of an int32.
        self.max_exponent = if self.has_int32_bounds() {
            exponent
        } else {
            max(exponent, MAX_INT32_EXPONENT)
        };
        self.optimize();
    }

    pub fn set_int32(&mut self, l: i32, h: i32) {
        self.has_int32_lower_bound = true;
        self.has_int32_upper_bound = true;
        self.lower = l;
        self.upper = h;
        self.can_have_fractional_part = false;
        self.max_exponent = self.exponent_implied_by_int32_bounds();
        self.assert_invariants();
    }

    pub fn set_unknown(&mut self) {
        *self = Self::unknown();
    }

    /// Copy with the symbolic annotations dropped.
    pub fn without_symbolic(mut self) -> Self {
        self.symbolic_lower = None;
        self.symbolic_upper = None;
        self
    }

    // ---------------------------------------------------------------- queries

    /// Lower endpoint; `i32::MIN` when there is no int32 lower bound.
    pub fn lower(&self) -> i32 {
        self.lower
    }

    /// Upper endpoint; `i32::MAX` when there is no int32 upper bound.
    pub fn upper(&self) -> i32 {
        self.upper
    }

    pub fn max_exponent(&self) -> u16 {
        self.max_exponent
    }

    pub fn has_int32_lower_bound(&self) -> bool {
        self.has_int32_lower_bound
    }

    pub fn has_int32_upper_bound(&self) -> bool {
        self.has_int32_upper_bound
    }

    /// Value is within [i32::MIN, i32::MAX]; not necessarily an integer.
    pub fn has_int32_bounds(&self) -> bool {
        self.has_int32_lower_bound && self.has_int32_upper_bound
    }

    /// Value is representable as an int32.
    pub fn is_int32(&self) -> bool {
        self.has_int32_bounds() && !self.can_have_fractional_part
    }

    pub fn is_boolean(&self) -> bool {
        self.lower >= 0 && self.upper <= 1 && !self.can_have_fractional_part
    }

    pub fn can_have_rounding_errors(&self) -> bool {
        self.can_have_fractional_part || self.max_exponent >= MAX_TRUNCATABLE_EXPONENT
    }

    pub fn can_be_zero(&self) -> bool {
        self.lower <= 0 && self.upper >= 0
    }

    pub fn can_be_nan(&self) -> bool {
        self.max_exponent == INCLUDES_INFINITY_AND_NAN
    }

    pub fn can_be_infinite_or_nan(&self) -> bool {
        self.max_exponent >= INCLUDES_INFINITY
    }

    pub fn can_have_fractional_part(&self) -> bool {
        self.can_have_fractional_part
    }

    pub fn exponent(&self) -> u16 {
        debug_assert!(!self.can_be_infinite_or_nan());
        self.max_exponent
    }

    pub fn num_bits(&self) -> u16 {
        self.exponent() + 1
    }

    pub fn is_finite_negative(&self) -> bool {
        self.upper < 0 && !self.can_be_infinite_or_nan()
    }

    pub fn is_finite_non_negative(&self) -> bool {
        self.lower >= 0 && !self.can_be_infinite_or_nan()
    }

    pub fn can_be_finite_negative(&self) -> bool {
        self.lower < 0
    }

    pub fn can_be_finite_non_negative(&self) -> bool {
        self.upper >= 0
    }

    pub fn is_unknown(&self) -> bool {
        !self.has_int32_lower_bound
            && !self.has_int32_upper_bound
            && self.can_have_fractional_part
            && self.max_exponent == INCLUDES_INFINITY_AND_NAN
    }

    pub fn is_unknown_int32(&self) -> bool {
        self.is_int32() && self.lower == i32::MIN && self.upper == i32::MAX
    }

    /// Whether the concrete double `d` is described by this range.
    pub fn contains(&self, d: f64) -> bool {
        if d.is_nan() {
            return self.can_be_nan();
        }
        if d.is_infinite() {
            let side_open = if d > 0.0 {
                !self.has_int32_upper_bound
            } else {
                !self.has_int32_lower_bound
            };
            return self.can_be_infinite_or_nan() && side_open;
        }
        if self.has_int32_lower_bound && d < self.lower as f64 {
            return false;
        }
        if self.has_int32_upper_bound && d > self.upper as f64 {
            return false;
        }
        if !self.can_have_fractional_part && d.fract() != 0.0 {
            return false;
        }
        if !self.can_be_infinite_or_nan() && d.abs() >= 2f64.powi(self.max_exponent as i32 + 1) {
            return false;
        }
        true
    }

    pub fn symbolic_lower(&self) -> Option<SymbolicId> {
        self.symbolic_lower
    }

    pub fn symbolic_upper(&self) -> Option<SymbolicId> {
        self.symbolic_upper
    }

    pub fn set_symbolic_lower(&mut self, bound: Option<SymbolicId>) {
        self.symbolic_lower = bound;
    }

    pub fn set_symbolic_upper(&mut self, bound: Option<SymbolicId>) {
        self.symbolic_upper = bound;
    }

    // ------------------------------------------------------------ in-place ops

    /// Raise the lower bound to at least `x`.
    pub fn refine_lower(&mut self, x: i32) {
        debug_assert!(x <= self.upper);
        self.has_int32_lower_bound = true;
        self.lower = max(self.lower, x);
        self.optimize();
    }

    /// Lower the upper bound to at most `x`.
    pub fn refine_upper(&mut self, x: i32) {
        debug_assert!(x >= self.lower);
        self.has_int32_upper_bound = true;
        self.upper = min(self.upper, x);
        self.optimize();
    }

    /// Replaces the numeric state with `other`'s; returns whether it changed.
    pub fn update(&mut self, other: &Range) -> bool {
        let changed = *self != *other;
        if changed {
            self.lower = other.lower;
            self.has_int32_lower_bound = other.has_int32_lower_bound;
            self.upper = other.upper;
            self.has_int32_upper_bound = other.has_int32_upper_bound;
            self.can_have_fractional_part = other.can_have_fractional_part;
            self.max_exponent = other.max_exponent;
            self.assert_invariants();
        }
        changed
    }

    /// Widens `self` to also cover every value of `other`.
    pub fn union_with(&mut self, other: &Range) {
        let lower = min(self.lower, other.lower);
        let upper = max(self.upper, other.upper);
        let lb = self.has_int32_lower_bound && other.has_int32_lower_bound;
        let hb = self.has_int32_upper_bound && other.has_int32_upper_bound;
        let f = self.can_have_fractional_part || other.can_have_fractional_part;
        let e = max(self.max_exponent, other.max_exponent);
        *self = Self::raw(lower, lb, upper, hb, f, e);
    }

    /// Clamp the endpoints into int32 and drop the fractional part.
    pub fn clamp_to_int32(&mut self) {
        if self.is_int32() {
            return;
        }
        let l = if self.has_int32_lower_bound {
            self.lower
        } else {
            i32::MIN
        };
        let h = if self.has_int32_upper_bound {
            self.upper
        } else {
            i32::MAX
        };
        self.set_int32(l, h);
    }

    /// Models ToInt32: anything leaving int32 may wrap to any int32.
    pub fn wrap_around_to_int32(&mut self) {
        if !self.has_int32_bounds() {
            self.set_int32(i32::MIN, i32::MAX);
        } else if self.can_have_fractional_part {
            self.can_have_fractional_part = false;
            self.optimize();
        }
    }

    /// Reduce a shift count modulo 32.
    pub fn wrap_around_to_shift_count(&mut self) {
        self.wrap_around_to_int32();
        if self.lower < 0 || self.upper >= 32 {
            if (self.lower >> 5) == (self.upper >> 5) {
                self.set_int32(self.lower & 31, self.upper & 31);
            } else {
                self.set_int32(0, 31);
            }
        }
    }

    pub fn wrap_around_to_boolean(&mut self) {
        self.wrap_around_to_int32();
        if !self.is_boolean() {
            self.set_int32(0, 1);
        }
    }

    /// Int32 stand-in for a uint32 result: a value above i32::MAX reads as
    /// a negative int32, so the lower bound drops to i32::MIN while the
    /// upper side stays unbounded.
    pub fn extend_uint32_to_int32_min(&mut self) {
        debug_assert!(!self.has_int32_upper_bound);
        self.lower = i32::MIN;
        self.assert_invariants();
    }

    fn wrapped_int32(&self) -> Range {
        let mut r = self.without_symbolic();
        r.wrap_around_to_int32();
        r
    }

    // ---------------------------------------------------------------- set ops

    /// Values in both ranges. `None` when the ranges provably share no
    /// value, which makes the code guarded by the refinement dead.
    pub fn intersect(lhs: &Range, rhs: &Range) -> Option<Range> {
        let mut new_lower = max(lhs.lower, rhs.lower);
        let mut new_upper = min(lhs.upper, rhs.upper);

        if new_upper < new_lower {
            // Both sides may still be NaN, which they then share.
            if lhs.can_be_nan() && rhs.can_be_nan() {
                return Some(Range::unknown());
            }
            return None;
        }

        let mut lb = lhs.has_int32_lower_bound || rhs.has_int32_lower_bound;
        let mut hb = lhs.has_int32_upper_bound || rhs.has_int32_upper_bound;
        let f = lhs.can_have_fractional_part && rhs.can_have_fractional_part;
        let e = min(lhs.max_exponent, rhs.max_exponent);

        // [?, 0] and [0, ?] give both bounds while NaN is still possible.
        if lb && hb && e == INCLUDES_INFINITY_AND_NAN {
            return Some(Range::unknown());
        }

        // With mixed fractional flags the exponent may be tighter than the
        // endpoints.
        if lhs.can_have_fractional_part != rhs.can_have_fractional_part
            && e < MAX_INT32_EXPONENT
        {
            refine_int32_bounds_by_exponent(e, &mut new_lower, &mut new_upper);
            lb = true;
            hb = true;
            if new_lower > new_upper {
                return None;
            }
        }

        Some(Range::raw(new_lower, lb, new_upper, hb, f, e))
    }

    // ------------------------------------------------------------- arithmetic

    pub fn add(lhs: &Range, rhs: &Range) -> Range {
        let l = if lhs.has_int32_lower_bound && rhs.has_int32_lower_bound {
            lhs.lower as i64 + rhs.lower as i64
        } else {
            NO_INT32_LOWER_BOUND
        };
        let h = if lhs.has_int32_upper_bound && rhs.has_int32_upper_bound {
            lhs.upper as i64 + rhs.upper as i64
        } else {
            NO_INT32_UPPER_BOUND
        };

        // A carry adds at most one bit.
        let mut e = max(lhs.max_exponent, rhs.max_exponent);
        if e <= MAX_FINITE_EXPONENT {
            e += 1;
        }
        // Infinity + -Infinity is NaN.
        if lhs.can_be_infinite_or_nan() && rhs.can_be_infinite_or_nan() {
            e = INCLUDES_INFINITY_AND_NAN;
        }

        Range::new(
            l,
            h,
            lhs.can_have_fractional_part || rhs.can_have_fractional_part,
            e,
        )
    }

    pub fn sub(lhs: &Range, rhs: &Range) -> Range {
        let l = if lhs.has_int32_lower_bound && rhs.has_int32_upper_bound {
            lhs.lower as i64 - rhs.upper as i64
        } else {
            NO_INT32_LOWER_BOUND
        };
        let h = if lhs.has_int32_upper_bound && rhs.has_int32_lower_bound {
            lhs.upper as i64 - rhs.lower as i64
        } else {
            NO_INT32_UPPER_BOUND
        };

        let mut e = max(lhs.max_exponent, rhs.max_exponent);
        if e <= MAX_FINITE_EXPONENT {
            e += 1;
        }
        // Infinity - Infinity is NaN.
        if lhs.can_be_infinite_or_nan() && rhs.can_be_infinite_or_nan() {
            e = INCLUDES_INFINITY_AND_NAN;
        }

        Range::new(
            l,
            h,
            lhs.can_have_fractional_part || rhs.can_have_fractional_part,
            e,
        )
    }

    pub fn mul(lhs: &Range, rhs: &Range) -> Range {
        let fractional = lhs.can_have_fractional_part || rhs.can_have_fractional_part;

        let exponent = if !lhs.can_be_infinite_or_nan() && !rhs.can_be_infinite_or_nan() {
            let e = lhs.num_bits() + rhs.num_bits() - 1;
            if e > MAX_FINITE_EXPONENT {
                INCLUDES_INFINITY
            } else {
                e
            }
        } else if !lhs.can_be_nan()
            && !rhs.can_be_nan()
            && !(lhs.can_be_zero() && rhs.can_be_infinite_or_nan())
            && !(rhs.can_be_zero() && lhs.can_be_infinite_or_nan())
        {
            // 0 * Infinity is the only remaining way to NaN.
            INCLUDES_INFINITY
        } else {
            INCLUDES_INFINITY_AND_NAN
        };

        if !lhs.has_int32_bounds() || !rhs.has_int32_bounds() {
            return Range::new(
                NO_INT32_LOWER_BOUND,
                NO_INT32_UPPER_BOUND,
                fractional,
                exponent,
            );
        }

        let (ll, lu) = (lhs.lower as i64, lhs.upper as i64);
        let (rl, ru) = (rhs.lower as i64, rhs.upper as i64);
        let (lo, hi) = if ll >= 0 && rl >= 0 {
            (ll * rl, lu * ru)
        } else if lu <= 0 && ru <= 0 {
            (lu * ru, ll * rl)
        } else if ll >= 0 && ru <= 0 {
            (lu * rl, ll * ru)
        } else if lu <= 0 && rl >= 0 {
            (ll * ru, lu * rl)
        } else {
            // At least one operand straddles zero.
            let (a, b, c, d) = (ll * rl, ll * ru, lu * rl, lu * ru);
            (min(min(a, b), min(c, d)), max(max(a, b), max(c, d)))
        };

        Range::new(lo, hi, fractional, exponent)
    }

    /// Whether `lhs * rhs` may produce -0.
    pub fn negative_zero_mul(lhs: &Range, rhs: &Range) -> bool {
        // Both values are positive.
        if lhs.lower >= 0 && rhs.lower >= 0 {
            return false;
        }
        // Both values are negative (non zero).
        if lhs.upper < 0 && rhs.upper < 0 {
            return false;
        }
        // One operand is positive (non zero).
        if lhs.lower > 0 || rhs.lower > 0 {
            return false;
        }
        true
    }

    pub fn div(lhs: &Range, rhs: &Range, integer_result: bool) -> Range {
        // NaN and Infinity operands are not worth tracking here.
        if !lhs.has_int32_bounds() || !rhs.has_int32_bounds() {
            return Range::unknown();
        }
        let e = if integer_result {
            MAX_INT32_EXPONENT
        } else {
            lhs.exponent()
        };
        // Dividing by a value of magnitude >= 1 never moves away from zero.
        if rhs.lower >= 1 {
            Range::new(
                min(lhs.lower as i64, 0),
                max(lhs.upper as i64, 0),
                !integer_result,
                e,
            )
        } else if rhs.upper <= -1 {
            Range::new(
                min(-(lhs.upper as i64), 0),
                max(-(lhs.lower as i64), 0),
                !integer_result,
                e,
            )
        } else {
            Range::unknown()
        }
    }

    pub fn mod_(lhs: &Range, rhs: &Range) -> Range {
        if !lhs.has_int32_bounds() || !rhs.has_int32_bounds() {
            return Range::unknown();
        }
        // x % 0 is NaN.
        if rhs.lower <= 0 && rhs.upper >= 0 {
            return Range::unknown();
        }

        // |lhs % rhs| < |rhs|, and for integers <= |rhs| - 1.
        let mut rhs_abs_bound = max((rhs.lower as i64).abs(), (rhs.upper as i64).abs());
        if !lhs.can_have_fractional_part && !rhs.can_have_fractional_part {
            rhs_abs_bound -= 1;
        }
        // |lhs % rhs| <= |lhs|
        let lhs_abs_bound = max((lhs.lower as i64).abs(), (lhs.upper as i64).abs());
        let abs_bound = min(lhs_abs_bound, rhs_abs_bound);

        // The result takes the sign of the dividend.
        let lower = if lhs.lower >= 0 { 0 } else { -abs_bound };
        let upper = if lhs.upper <= 0 { 0 } else { abs_bound };

        Range::new(
            lower,
            upper,
            lhs.can_have_fractional_part || rhs.can_have_fractional_part,
            min(lhs.exponent(), rhs.exponent()),
        )
    }

    // ---------------------------------------------------------------- bitwise

    pub fn and_(lhs: &Range, rhs: &Range) -> Range {
        let (lhs, rhs) = (lhs.wrapped_int32(), rhs.wrapped_int32());

        // Both may be negative: the result may be anything negative.
        if lhs.lower < 0 && rhs.lower < 0 {
            return Range::int32(i32::MIN, max(lhs.upper, rhs.upper));
        }

        // At most one side is negative, so the result is not, and it is
        // bounded by the non-negative side(s). -1 & 5 == 5.
        let mut upper = min(lhs.upper, rhs.upper);
        if lhs.lower < 0 {
            upper = rhs.upper;
        }
        if rhs.lower < 0 {
            upper = lhs.upper;
        }
        Range::int32(0, upper)
    }

    pub fn or_(lhs: &Range, rhs: &Range) -> Range {
        let (lhs, rhs) = (lhs.wrapped_int32(), rhs.wrapped_int32());

        // x | 0 and x | -1 are exact. This also keeps leading_zeros away
        // from zero operands below.
        if lhs.lower == lhs.upper {
            if lhs.lower == 0 {
                return rhs;
            }
            if lhs.lower == -1 {
                return lhs;
            }
        }
        if rhs.lower == rhs.upper {
            if rhs.lower == 0 {
                return lhs;
            }
            if rhs.lower == -1 {
                return rhs;
            }
        }

        let mut lower = i32::MIN;
        let mut upper = i32::MAX;
        if lhs.lower >= 0 && rhs.lower >= 0 {
            // Never below either operand; leading zeros common to both
            // operands survive.
            lower = max(lhs.lower, rhs.lower);
            let lz = min(lhs.upper.leading_zeros(), rhs.upper.leading_zeros());
            upper = (u32::MAX >> lz) as i32;
        } else {
            // Leading ones of either operand survive.
            if lhs.upper < 0 {
                let leading_ones = (!lhs.lower).leading_zeros();
                lower = max(lower, !((u32::MAX >> leading_ones) as i32));
                upper = -1;
            }
            if rhs.upper < 0 {
                let leading_ones = (!rhs.lower).leading_zeros();
                lower = max(lower, !((u32::MAX >> leading_ones) as i32));
                upper = -1;
            }
        }
        Range::int32(lower, upper)
    }

    pub fn xor_(lhs: &Range, rhs: &Range) -> Range {
        let (lhs, rhs) = (lhs.wrapped_int32(), rhs.wrapped_int32());
        let (mut lhs_lower, mut lhs_upper) = (lhs.lower, lhs.upper);
        let (mut rhs_lower, mut rhs_upper) = (rhs.lower, rhs.upper);
        let mut invert_after = false;

        // ~((~x) ^ y) == x ^ y, and (~x) ^ (~y) == x ^ y: fold negative
        // operands into the non-negative case.
        if lhs_upper < 0 {
            (lhs_lower, lhs_upper) = (!lhs_upper, !lhs_lower);
            invert_after = !invert_after;
        }
        if rhs_upper < 0 {
            (rhs_lower, rhs_upper) = (!rhs_upper, !rhs_lower);
            invert_after = !invert_after;
        }

        let mut lower = i32::MIN;
        let mut upper = i32::MAX;
        if lhs_lower == 0 && lhs_upper == 0 {
            lower = rhs_lower;
            upper = rhs_upper;
        } else if rhs_lower == 0 && rhs_upper == 0 {
            lower = lhs_lower;
            upper = lhs_upper;
        } else if lhs_lower >= 0 && rhs_lower >= 0 {
            lower = 0;
            // Set every bit below the other operand's leading zeros.
            let lhs_lz = lhs_upper.leading_zeros();
            let rhs_lz = rhs_upper.leading_zeros();
            upper = min(
                rhs_upper | (u32::MAX >> lhs_lz) as i32,
                lhs_upper | (u32::MAX >> rhs_lz) as i32,
            );
        }

        if invert_after {
            (lower, upper) = (!upper, !lower);
        }
        Range::int32(lower, upper)
    }

    pub fn not_(op: &Range) -> Range {
        let op = op.wrapped_int32();
        Range::int32(!op.upper, !op.lower)
    }

    pub fn lsh_const(lhs: &Range, c: i32) -> Range {
        let lhs = lhs.wrapped_int32();
        let shift = (c & 0x1f) as u32;

        // Exact when no bits are lost and none reach the sign bit.
        let fits = |x: i32| ((((x as u32) << shift << 1) as i32) >> shift >> 1) == x;
        if fits(lhs.lower) && fits(lhs.upper) {
            return Range::int32(
                ((lhs.lower as u32) << shift) as i32,
                ((lhs.upper as u32) << shift) as i32,
            );
        }
        Range::int32(i32::MIN, i32::MAX)
    }

    pub fn rsh_const(lhs: &Range, c: i32) -> Range {
        let lhs = lhs.wrapped_int32();
        let shift = c & 0x1f;
        Range::int32(lhs.lower >> shift, lhs.upper >> shift)
    }

    /// The left operand is read as int32 and reinterpreted as uint32.
    pub fn ursh_const(lhs: &Range, c: i32) -> Range {
        let lhs = lhs.wrapped_int32();
        let shift = (c & 0x1f) as u32;

        // Sign-uniform operands shift exactly.
        if lhs.is_finite_non_negative() || lhs.is_finite_negative() {
            return Range::uint32(
                (lhs.lower as u32) >> shift,
                (lhs.upper as u32) >> shift,
            );
        }
        Range::uint32(0, u32::MAX >> shift)
    }

    fn shift_count(rhs: &Range) -> Range {
        let mut count = rhs.without_symbolic();
        count.wrap_around_to_shift_count();
        count
    }

    pub fn lsh(lhs: &Range, rhs: &Range) -> Range {
        let count = Self::shift_count(rhs);
        if count.lower == count.upper {
            return Self::lsh_const(lhs, count.lower);
        }
        Range::int32(i32::MIN, i32::MAX)
    }

    pub fn rsh(lhs: &Range, rhs: &Range) -> Range {
        let lhs = lhs.wrapped_int32();
        let count = Self::shift_count(rhs);
        let (smin, smax) = (count.lower, count.upper);
        let lower = if lhs.lower < 0 {
            lhs.lower >> smin
        } else {
            lhs.lower >> smax
        };
        let upper = if lhs.upper >= 0 {
            lhs.upper >> smin
        } else {
            lhs.upper >> smax
        };
        Range::int32(lower, upper)
    }

    pub fn ursh(lhs: &Range, rhs: &Range) -> Range {
        let count = Self::shift_count(rhs);
        if count.lower == count.upper {
            return Self::ursh_const(lhs, count.lower);
        }
        let lhs = lhs.wrapped_int32();
        let top = if lhs.is_finite_non_negative() {
            lhs.upper as u32
        } else {
            u32::MAX
        };
        Range::uint32(0, top >> count.lower)
    }

    // ------------------------------------------------------------------- math

    pub fn abs(op: &Range) -> Range {
        let l = op.lower;
        let u = op.upper;
        Range::raw(
            max(max(0, l), if u == i32::MIN { i32::MAX } else { -u }),
            true,
            max(max(0, u), if l == i32::MIN { i32::MAX } else { -l }),
            op.has_int32_bounds() && l != i32::MIN,
            op.can_have_fractional_part,
            op.max_exponent,
        )
    }

    pub fn min(lhs: &Range, rhs: &Range) -> Range {
        // NaN in, NaN out.
        if lhs.can_be_nan() || rhs.can_be_nan() {
            return Range::unknown();
        }
        Range::raw(
            min(lhs.lower, rhs.lower),
            lhs.has_int32_lower_bound && rhs.has_int32_lower_bound,
            min(lhs.upper, rhs.upper),
            lhs.has_int32_upper_bound || rhs.has_int32_upper_bound,
            lhs.can_have_fractional_part || rhs.can_have_fractional_part,
            max(lhs.max_exponent, rhs.max_exponent),
        )
    }

    pub fn max(lhs: &Range, rhs: &Range) -> Range {
        if lhs.can_be_nan() || rhs.can_be_nan() {
            return Range::unknown();
        }
        Range::raw(
            max(lhs.lower, rhs.lower),
            lhs.has_int32_lower_bound || rhs.has_int32_lower_bound,
            max(lhs.upper, rhs.upper),
            lhs.has_int32_upper_bound && rhs.has_int32_upper_bound,
            lhs.can_have_fractional_part || rhs.can_have_fractional_part,
            max(lhs.max_exponent, rhs.max_exponent),
        )
    }

    pub fn floor(op: &Range) -> Range {
        Self::round_to_integer(op)
    }

    pub fn ceil(op: &Range) -> Range {
        Self::round_to_integer(op)
    }

    // The endpoints already enclose floor(min) and ceil(max), so rounding
    // only drops the fractional flag; |x| can grow by one, though.
    fn round_to_integer(op: &Range) -> Range {
        let mut r = op.without_symbolic();
        if r.has_int32_bounds() {
            r.max_exponent = r.exponent_implied_by_int32_bounds();
        } else if r.can_have_fractional_part && r.max_exponent < MAX_FINITE_EXPONENT {
            r.max_exponent += 1;
        }
        r.can_have_fractional_part = false;
        r.assert_invariants();
        r
    }

    pub fn sqrt(op: &Range) -> Range {
        // sqrt of a negative value, or of NaN, is NaN.
        if op.lower < 0 || op.can_be_nan() {
            return Range::unknown();
        }
        let upper = if op.has_int32_upper_bound {
            (op.upper as f64).sqrt().ceil() as i64
        } else {
            NO_INT32_UPPER_BOUND
        };
        Range::new(0, upper, true, op.max_exponent)
    }
}

// Narrow endpoints to what an exponent below 31 allows.
fn refine_int32_bounds_by_exponent(e: u16, lower: &mut i32, upper: &mut i32) {
    if e < MAX_INT32_EXPONENT {
        let limit = ((1u32 << (e + 1)) - 1) as i32;
        *upper = min(*upper, limit);
        *lower = max(*lower, -limit);
    }
}

impl Range {
    /// Prints the range, with optional notes after each endpoint.
    pub(crate) fn write_annotated(
        &self,
        f: &mut fmt::Formatter<'_>,
        lower_note: Option<&str>,
        upper_note: Option<&str>,
    ) -> fmt::Result {
        write!(f, "[")?;
        if self.has_int32_lower_bound {
            write!(f, "{}", self.lower)?;
        } else {
            write!(f, "?")?;
        }
        if let Some(note) = lower_note {
            write!(f, " {{{}}}", note)?;
        }
        write!(f, ", ")?;
        if self.has_int32_upper_bound {
            write!(f, "{}", self.upper)?;
        } else {
            write!(f, "?")?;
        }
        if let Some(note) = upper_note {
            write!(f, " {{{}}}", note)?;
        }
        write!(f, "]")?;
        if self.can_have_fractional_part {
            write!(f, " (fractional)")?;
        }
        // Only print the exponent when it says more than the endpoints.
        if self.max_exponent == INCLUDES_INFINITY_AND_NAN {
            write!(f, " (U inf U NaN)")?;
        } else if self.max_exponent == INCLUDES_INFINITY {
            write!(f, " (U inf)")?;
        } else if !self.has_int32_bounds() || self.can_have_fractional_part {
            write!(f, " (< pow(2, {}+1))", self.max_exponent)?;
        }
        Ok(())
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_annotated(f, None, None)
    }
}
