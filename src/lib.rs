//! Range analysis for an SSA JIT IR: interval inference, loop iteration
//! bounds, bounds-check hoisting and double-to-int32 truncation.

pub mod error;
pub mod mir;

pub use error::{RangeCode, RangeException, Stage, RR};
pub use mir::opt::{RangeConfig, RangePipeline, RangeStats};
