#![no_main]

use ionrange::mir::analyze::range::Range;
use ionrange::mir::eval::to_int32;
use libfuzzer_sys::fuzz_target;

fn word(data: &[u8], at: usize) -> i32 {
    let mut b = [0u8; 4];
    for (i, slot) in b.iter_mut().enumerate() {
        *slot = data.get(at + i).copied().unwrap_or(0);
    }
    i32::from_le_bytes(b)
}

// An int32 range and a member of it.
fn pick(data: &[u8], at: usize) -> (Range, i32) {
    let (a, b, c) = (word(data, at), word(data, at + 4), word(data, at + 8));
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let span = (hi as i64 - lo as i64 + 1) as u64;
    let x = (lo as i64 + (c as u32 as u64 % span) as i64) as i32;
    (Range::int32(lo, hi), x)
}

fn check(name: &str, r: &Range, v: f64, x: i32, y: i32) {
    assert!(r.contains(v), "{}({}, {}) = {} escapes {}", name, x, y, v, r);
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 24 {
        return;
    }
    let (lr, x) = pick(data, 0);
    let (rr, y) = pick(data, 12);
    let (xf, yf) = (x as f64, y as f64);

    check("add", &Range::add(&lr, &rr), xf + yf, x, y);
    check("sub", &Range::sub(&lr, &rr), xf - yf, x, y);
    check("mul", &Range::mul(&lr, &rr), xf * yf, x, y);
    check("min", &Range::min(&lr, &rr), xf.min(yf), x, y);
    check("max", &Range::max(&lr, &rr), xf.max(yf), x, y);
    check("and", &Range::and_(&lr, &rr), (x & y) as f64, x, y);
    check("or", &Range::or_(&lr, &rr), (x | y) as f64, x, y);
    check("xor", &Range::xor_(&lr, &rr), (x ^ y) as f64, x, y);
    check("not", &Range::not_(&lr), !x as f64, x, y);
    check("abs", &Range::abs(&lr), xf.abs(), x, y);

    let shift = (y as u32) & 31;
    check("lsh", &Range::lsh(&lr, &rr), x.wrapping_shl(shift) as f64, x, y);
    check("rsh", &Range::rsh(&lr, &rr), (x >> shift) as f64, x, y);
    check("ursh", &Range::ursh(&lr, &rr), ((x as u32) >> shift) as f64, x, y);

    if y != 0 {
        check("div", &Range::div(&lr, &rr, false), xf / yf, x, y);
        check("mod", &Range::mod_(&lr, &rr), xf % yf, x, y);
    }

    let mut wrapped = Range::add(&lr, &rr);
    wrapped.wrap_around_to_int32();
    check("wrap", &wrapped, to_int32(xf + yf) as f64, x, y);

    if let Some(both) = Range::intersect(&lr, &rr) {
        if rr.contains(xf) {
            check("intersect", &both, xf, x, y);
        }
    } else {
        assert!(!rr.contains(xf), "empty intersection misses {}", x);
    }

    let mut u = lr;
    u.union_with(&rr);
    check("union", &u, xf, x, y);
    check("union", &u, yf, x, y);
});
