pub mod analyze;
pub mod def;
pub mod eval;
pub mod flow;
pub mod opt;
pub mod verify;

pub use def::*;
