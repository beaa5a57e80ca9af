pub mod range;
pub mod symbolic;
