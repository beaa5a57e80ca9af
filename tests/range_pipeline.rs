mod common;

use common::{array_sum, branchy, countdown_by_two, double_reference, doubles, half_sum, Builder};
use ionrange::mir::eval::{run, EvalOutcome};
use ionrange::mir::verify::{verify_ir, verify_no_betas};
use ionrange::mir::*;
use ionrange::{RangeCode, RangeConfig, RangePipeline};
use rustc_hash::FxHashMap;

fn pipeline() -> RangePipeline {
    RangePipeline::new(RangeConfig {
        verify_each_stage: true,
        ..RangeConfig::default()
    })
}

#[test]
fn loop_counter_overflow_check_is_removed() {
    let mut fixture = array_sum();
    let stats = pipeline()
        .run(&mut fixture.f)
        .expect("array_sum must pass the range pipeline");

    assert_eq!(stats.loop_bounds, 1);
    assert!(stats.overflow_checks_removed >= 1);
    let ValueKind::Binary { flags, .. } = fixture.f.values[fixture.next].kind else {
        panic!("loop increment must stay a binary op");
    };
    assert!(!flags.fallible, "i + 1 under i < n cannot overflow");

    let r = fixture.f.values[fixture.i].range.expect("loop phi must have a range");
    assert_eq!(r.lower(), 0);
    assert!(r.has_int32_upper_bound());
    assert_eq!(verify_ir(&fixture.f), Ok(()));
}

#[test]
fn betas_are_gone_after_the_pipeline() {
    for mut f in [array_sum().f, branchy(), countdown_by_two(), doubles()] {
        let stats = pipeline().run(&mut f).expect("fixture must pass the pipeline");
        assert!(stats.betas_inserted > 0, "{} has branches to refine", f.name);
        assert_eq!(stats.betas_inserted, stats.betas_removed);
        assert_eq!(verify_no_betas(&f), Ok(()));
        let placed_betas = f
            .values
            .iter()
            .filter(|v| v.block.is_some() && v.kind.is_beta())
            .count();
        assert_eq!(placed_betas, 0, "{} still holds betas", f.name);
    }
}

#[test]
fn bitor_zero_folds_away() {
    let mut bld = Builder::new("or_zero");
    let b = bld.block();
    let x = bld.param(b, 0, MirType::Int32);
    let zero = bld.int(b, 0);
    let or = bld.wrapping(b, BinOp::BitOr, x, zero);
    bld.ret(b, or);
    let mut f = bld.f;

    let stats = pipeline().run(&mut f).expect("or_zero must pass the pipeline");
    assert_eq!(stats.folded_bitops, 1);
    assert_eq!(f.blocks[b].term, Terminator::Return(Some(x)));
    assert!(f.values[or].block.is_none());
    assert_eq!(run(&f, &[-5.0]).unwrap(), EvalOutcome::Return(Some(-5.0)));
}

#[test]
fn sum_under_bitor_is_truncated() {
    // (x + y) | 0
    let mut bld = Builder::new("wrap_sum");
    let b = bld.block();
    let x = bld.param(b, 0, MirType::Int32);
    let y = bld.param(b, 1, MirType::Int32);
    let sum = bld.checked(b, BinOp::Add, x, y);
    let zero = bld.int(b, 0);
    let or = bld.wrapping(b, BinOp::BitOr, sum, zero);
    bld.ret(b, or);
    let mut f = bld.f;

    let before = f.clone();
    assert_eq!(
        run(&before, &[i32::MAX as f64, 1.0]).unwrap(),
        EvalOutcome::Bailout {
            value: sum,
            reason: "int32 overflow"
        }
    );

    let stats = pipeline().run(&mut f).expect("wrap_sum must pass the pipeline");
    assert_eq!(stats.truncated, 1);
    assert_eq!(stats.folded_bitops, 1);
    assert_eq!(f.blocks[b].term, Terminator::Return(Some(sum)));
    assert_eq!(
        run(&f, &[i32::MAX as f64, 1.0]).unwrap(),
        EvalOutcome::Return(Some(i32::MIN as f64))
    );
    assert_eq!(run(&f, &[40.0, 2.0]).unwrap(), EvalOutcome::Return(Some(42.0)));
}

#[test]
fn int_valued_double_add_is_narrowed() {
    // double(x & 255) + 1.0
    let mut bld = Builder::new("narrow");
    let b = bld.block();
    let x = bld.param(b, 0, MirType::Int32);
    let mask = bld.int(b, 255);
    let masked = bld.wrapping(b, BinOp::BitAnd, x, mask);
    let d = bld.unary(b, UnaryOp::ToDouble, masked, MirType::Double);
    let one = bld.double(b, 1.0);
    let sum = bld.dbl(b, BinOp::Add, d, one);
    bld.ret(b, sum);
    let mut f = bld.f;
    let before = f.clone();

    let stats = pipeline().run(&mut f).expect("narrow must pass the pipeline");
    assert_eq!(stats.narrowed, 1);
    assert_eq!(f.values[sum].ty, MirType::Int32);
    for arg in [0.0, 1.0, 254.0, 255.0, 256.0, -1.0, i32::MIN as f64] {
        assert_eq!(run(&f, &[arg]).unwrap(), run(&before, &[arg]).unwrap());
    }
}

#[test]
fn malformed_function_falls_back_alone() {
    let good = branchy();

    let mut bld = Builder::new("broken");
    let b = bld.block();
    let ghost = bld.f.add_value(ValueKind::Const(Lit::Int(1)), MirType::Int32);
    bld.ret(b, ghost);
    let broken = bld.f;

    let mut all: FxHashMap<String, FnIR> = FxHashMap::default();
    all.insert("branchy".to_string(), good);
    all.insert("broken".to_string(), broken);

    let (stats, errors) = pipeline().run_program(&mut all);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, RangeCode::E1001);
    let frames: Vec<&str> = errors[0].stacktrace.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(frames, ["range.verify", "broken"]);
    assert!(stats.betas_inserted > 0);

    let broken = &all["broken"];
    assert!(broken.unsupported_dynamic);
    assert!(broken
        .fallback_reasons
        .iter()
        .any(|r| r.starts_with("range analysis [E1001]")));
    assert!(!all["branchy"].unsupported_dynamic);

    // Already rejected functions are skipped on the next run.
    let (_, errors) = pipeline().run_program(&mut all);
    assert!(errors.is_empty());
}

#[test]
fn ranges_after_a_branch_join() {
    let mut f = branchy();
    pipeline().run(&mut f).expect("branchy must pass the pipeline");

    let ret = match f.blocks[3].term {
        Terminator::Return(Some(v)) => v,
        ref other => panic!("unexpected terminator {:?}", other),
    };
    let r = f.values[ret].range.expect("result must have a range");
    // (y & 255) >> 2 is in [0, 63] and y % 7 in [-6, 6].
    assert_eq!((r.lower(), r.upper()), (-6, 69));
    assert!(r.is_int32());
}

#[test]
fn inexact_division_under_wrapping_add_still_bails() {
    let (mut f, half) = half_sum();
    let reference = double_reference(&f);
    pipeline().run(&mut f).expect("half_sum must pass the pipeline");

    let ValueKind::Binary { flags, .. } = f.values[half].kind else {
        panic!("division must stay a binary op");
    };
    assert!(!flags.wrapping, "x / 2 feeds an add, not a truncation");

    // 7 / 2 + -10 is -6.5, so ToInt32 gives -6, never -7.
    assert_eq!(
        run(&reference, &[7.0, -10.0]).unwrap(),
        EvalOutcome::Return(Some(-6.0))
    );
    assert_eq!(
        run(&f, &[7.0, -10.0]).unwrap(),
        EvalOutcome::Bailout {
            value: half,
            reason: "inexact int32 division"
        }
    );
    for args in [[8.0, -10.0], [-4.0, 3.0], [0.0, 0.0]] {
        assert_eq!(run(&f, &args).unwrap(), run(&reference, &args).unwrap());
    }
}
