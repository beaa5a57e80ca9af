mod common;

use common::array_sum;
use ionrange::mir::eval::{run, EvalOutcome};
use ionrange::mir::verify::verify_ir;
use ionrange::mir::*;
use ionrange::{RangeConfig, RangePipeline};

fn preheader_checks(f: &FnIR, entry: BlockId) -> (usize, usize) {
    let mut lower = 0;
    let mut upper = 0;
    for &vid in &f.blocks[entry].instrs {
        match f.values[vid].kind {
            ValueKind::BoundsCheckLower { .. } => lower += 1,
            ValueKind::BoundsCheck { movable: false, .. } => upper += 1,
            _ => {}
        }
    }
    (lower, upper)
}

#[test]
fn array_loop_check_moves_to_preheader() {
    let mut fixture = array_sum();
    let stats = RangePipeline::new(RangeConfig::default())
        .run(&mut fixture.f)
        .expect("array_sum must pass the range pipeline");

    assert_eq!(stats.hoisted_checks, 1);
    let f = &fixture.f;
    assert!(f.values[fixture.check].block.is_none(), "in-loop check must be gone");
    assert_eq!(preheader_checks(f, f.entry), (1, 1));
    let ValueKind::LoadElement { index, .. } = f.values[fixture.load].kind else {
        panic!("load must stay a load");
    };
    assert_eq!(index, fixture.i);
    assert_eq!(verify_ir(f), Ok(()));

    // a = [0, 1, ..., 9]
    assert_eq!(run(f, &[10.0, 10.0]).unwrap(), EvalOutcome::Return(Some(45.0)));
    assert_eq!(run(f, &[10.0, 4.0]).unwrap(), EvalOutcome::Return(Some(6.0)));
    assert!(matches!(
        run(f, &[10.0, 11.0]).unwrap(),
        EvalOutcome::Bailout { .. }
    ));
}

#[test]
fn hoisting_can_be_disabled() {
    let mut fixture = array_sum();
    let config = RangeConfig {
        hoist_bounds_checks: false,
        ..RangeConfig::default()
    };
    let stats = RangePipeline::new(config)
        .run(&mut fixture.f)
        .expect("array_sum must pass the range pipeline");

    assert_eq!(stats.hoisted_checks, 0);
    let f = &fixture.f;
    assert!(f.values[fixture.check].block.is_some());
    assert_eq!(preheader_checks(f, f.entry), (0, 0));
    assert_eq!(
        run(f, &[10.0, 11.0]).unwrap(),
        EvalOutcome::Bailout {
            value: fixture.check,
            reason: "bounds check failed"
        }
    );
}

#[test]
fn hoisted_loop_matches_the_plain_loop() {
    let plain = array_sum().f;
    let mut hoisted = plain.clone();
    RangePipeline::new(RangeConfig::default())
        .run(&mut hoisted)
        .expect("array_sum must pass the range pipeline");

    for len in 0..8 {
        for n in 1..=len {
            let args = [len as f64, n as f64];
            assert_eq!(
                run(&hoisted, &args).unwrap(),
                run(&plain, &args).unwrap(),
                "len={} n={}",
                len,
                n
            );
        }
    }
}
