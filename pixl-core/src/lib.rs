#![forbid(unsafe_op_in_unsafe_fn)]

pub use half;
pub use num_traits;

pub mod descriptor;
pub mod scalar;
pub mod shape;
