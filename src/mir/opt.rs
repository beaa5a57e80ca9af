use crate::error::{RangeCtx, RangeException, RR};
use crate::mir::verify::{verify_ir, verify_no_betas};
use crate::mir::*;
use rustc_hash::FxHashMap;
use std::env;
use tracing::{debug, debug_span};

pub mod assertions;
pub mod beta;
pub mod loop_analysis;
pub mod loop_bounds;
pub mod range_analysis;
pub mod truncate;

pub use range_analysis::RangeAnalysis;

/// Knobs of the range pipeline. `Default` is the production setting;
/// `from_env` lets the `IONRANGE_*` variables override each field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeConfig {
    pub check_range_analysis: bool,
    pub hoist_bounds_checks: bool,
    pub truncate: bool,
    pub verify_each_stage: bool,
    pub widen_after: usize,
    pub max_iterations: usize,
    pub arena_capacity: usize,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            check_range_analysis: false,
            hoist_bounds_checks: true,
            truncate: true,
            verify_each_stage: false,
            widen_after: 8,
            max_iterations: 64,
            arena_capacity: 4096,
        }
    }
}

impl RangeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            check_range_analysis: env_bool("IONRANGE_CHECK_RANGES", d.check_range_analysis),
            hoist_bounds_checks: env_bool("IONRANGE_HOIST_BOUNDS_CHECKS", d.hoist_bounds_checks),
            truncate: env_bool("IONRANGE_TRUNCATE", d.truncate),
            verify_each_stage: env_bool("IONRANGE_VERIFY_EACH_STAGE", d.verify_each_stage),
            widen_after: env_usize("IONRANGE_WIDEN_AFTER", d.widen_after),
            max_iterations: env_usize("IONRANGE_MAX_ITERATIONS", d.max_iterations),
            arena_capacity: env_usize("IONRANGE_ARENA_CAPACITY", d.arena_capacity),
        }
    }
}

fn env_bool(key: &str, default_v: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default_v,
    }
}

fn env_usize(key: &str, default_v: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_v)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RangeStats {
    pub betas_inserted: usize,
    pub betas_removed: usize,
    pub fixpoint_passes: usize,
    pub widened_phis: usize,
    pub unreachable_blocks: usize,
    pub loop_bounds: usize,
    pub refined_phis: usize,
    pub hoisted_checks: usize,
    pub overflow_checks_removed: usize,
    pub assertions: usize,
    pub narrowed: usize,
    pub truncated: usize,
    pub folded_bitops: usize,
}

impl RangeStats {
    pub fn accumulate(&mut self, other: Self) {
        self.betas_inserted += other.betas_inserted;
        self.betas_removed += other.betas_removed;
        self.fixpoint_passes += other.fixpoint_passes;
        self.widened_phis += other.widened_phis;
        self.unreachable_blocks += other.unreachable_blocks;
        self.loop_bounds += other.loop_bounds;
        self.refined_phis += other.refined_phis;
        self.hoisted_checks += other.hoisted_checks;
        self.overflow_checks_removed += other.overflow_checks_removed;
        self.assertions += other.assertions;
        self.narrowed += other.narrowed;
        self.truncated += other.truncated;
        self.folded_bitops += other.folded_bitops;
    }
}

pub struct RangePipeline {
    config: RangeConfig,
}

impl RangePipeline {
    pub fn new(config: RangeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RangeConfig {
        &self.config
    }

    fn verify_or_reject(fn_ir: &FnIR, stage: &str) -> RR<()> {
        verify_ir(fn_ir)
            .map_err(|e| e.into_exception(&fn_ir.name, stage))
            .ctx("range.verify", None)
    }

    fn maybe_verify(&self, fn_ir: &FnIR, stage: &str) -> RR<()> {
        if self.config.verify_each_stage {
            Self::verify_or_reject(fn_ir, stage)?;
        }
        Ok(())
    }

    /// Runs the whole range pipeline on one function. On failure the
    /// function is flagged for the unoptimized path and the error returned.
    pub fn run(&self, fn_ir: &mut FnIR) -> RR<RangeStats> {
        let span = debug_span!("range_pipeline", function = %fn_ir.name);
        let _enter = span.enter();
        match self.run_stages(fn_ir) {
            Ok(stats) => {
                debug!(?stats, "range pipeline done");
                Ok(stats)
            }
            Err(e) => {
                fn_ir.mark_unsupported_dynamic(Self::fallback_reason(&e));
                debug!(
                    code = e.code.as_str(),
                    report = %e.render(Some(&fn_ir.name), false),
                    "range pipeline rejected function"
                );
                Err(e)
            }
        }
    }

    /// Runs every supported function of a program. Rejected functions keep
    /// their `unsupported_dynamic` mark and their errors are returned.
    pub fn run_program(
        &self,
        all_fns: &mut FxHashMap<String, FnIR>,
    ) -> (RangeStats, Vec<RangeException>) {
        let mut stats = RangeStats::default();
        let mut errors = Vec::new();
        let mut names: Vec<String> = all_fns.keys().cloned().collect();
        names.sort();
        for name in names {
            let Some(fn_ir) = all_fns.get_mut(&name) else {
                continue;
            };
            if fn_ir.unsupported_dynamic {
                continue;
            }
            match self.run(fn_ir) {
                Ok(s) => stats.accumulate(s),
                Err(e) => errors.push(e.push_frame(name, None)),
            }
        }
        (stats, errors)
    }

    fn fallback_reason(e: &RangeException) -> String {
        format!("range analysis [{}]: {}", e.code.as_str(), e.message)
    }

    fn run_stages(&self, fn_ir: &mut FnIR) -> RR<RangeStats> {
        Self::verify_or_reject(fn_ir, "Start")?;

        let stats = {
            let mut ra = RangeAnalysis::new(fn_ir, self.config);
            ra.add_beta_nodes().ctx("range.beta", None)?;
            self.maybe_verify(ra.fn_ir(), "After Beta Insertion")?;

            ra.analyze().ctx("range.analyze", None)?;
            self.maybe_verify(ra.fn_ir(), "After Analysis")?;

            if self.config.check_range_analysis {
                ra.add_range_assertions().ctx("range.assert", None)?;
                self.maybe_verify(ra.fn_ir(), "After Range Assertions")?;
            }

            ra.remove_beta_nodes().ctx("range.beta", None)?;
            self.maybe_verify(ra.fn_ir(), "After Beta Removal")?;

            if self.config.truncate {
                ra.truncate().ctx("range.truncate", None)?;
                self.maybe_verify(ra.fn_ir(), "After Truncation")?;
            }
            ra.stats()
        };

        verify_no_betas(fn_ir)
            .map_err(|e| e.into_exception(&fn_ir.name, "End"))
            .ctx("range.verify", None)?;
        Ok(stats)
    }
}
