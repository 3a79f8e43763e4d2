// src/diff/mod.rs

pub mod numeric;
pub mod symbolic;

pub use numeric::numeric_backprop;
pub use symbolic::backprop;
