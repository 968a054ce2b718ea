//! Type definitions

pub mod audit;
pub mod problem;
pub mod result;

pub use audit::*;
pub use problem::*;
pub use result::*;
