// src/ops/registry.rs
// Elementwise kernel tables for the tensor binary dispatcher. Built once
// when a graph is created and passed around behind an `Arc`; nothing here
// is process-wide state.

use std::collections::HashMap;

use crate::backend::GradixF;
use crate::error::{GradixError, Result};
use crate::ops::BinOpKind;

#[derive(Debug)]
pub struct KernelRegistry<T> {
    arith: HashMap<BinOpKind, fn(T, T) -> T>,
    compare: HashMap<BinOpKind, fn(T, T) -> bool>,
}

impl<T: GradixF> KernelRegistry<T> {
    pub fn new() -> Self {
        let mut arith: HashMap<BinOpKind, fn(T, T) -> T> = HashMap::new();
        arith.insert(BinOpKind::Add, |a, b| a + b);
        arith.insert(BinOpKind::Sub, |a, b| a - b);
        arith.insert(BinOpKind::HadamardProd, |a, b| a * b);
        arith.insert(BinOpKind::HadamardDiv, |a, b| a / b);
        arith.insert(BinOpKind::HadamardPow, |a, b| a.powf(b));

        let mut compare: HashMap<BinOpKind, fn(T, T) -> bool> = HashMap::new();
        compare.insert(BinOpKind::Lt, |a, b| a < b);
        compare.insert(BinOpKind::Gt, |a, b| a > b);
        compare.insert(BinOpKind::Lte, |a, b| a <= b);
        compare.insert(BinOpKind::Gte, |a, b| a >= b);
        compare.insert(BinOpKind::Eq, |a, b| a == b);
        compare.insert(BinOpKind::Ne, |a, b| a != b);

        Self { arith, compare }
    }

    pub fn arith(&self, kind: BinOpKind) -> Result<fn(T, T) -> T> {
        self.arith
            .get(&kind)
            .copied()
            .ok_or_else(|| GradixError::nyi("elementwise arithmetic", kind.to_string(), false))
    }

    pub fn compare(&self, kind: BinOpKind) -> Result<fn(T, T) -> bool> {
        self.compare
            .get(&kind)
            .copied()
            .ok_or_else(|| GradixError::nyi("elementwise comparison", kind.to_string(), false))
    }
}

impl<T: GradixF> Default for KernelRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arith_table_covers_all_arith_kinds() {
        let reg: KernelRegistry<f64> = KernelRegistry::new();
        for kind in [
            BinOpKind::Add,
            BinOpKind::Sub,
            BinOpKind::HadamardProd,
            BinOpKind::HadamardDiv,
            BinOpKind::HadamardPow,
        ] {
            assert!(reg.arith(kind).is_ok(), "{kind} missing");
        }
    }

    #[test]
    fn comparison_kind_in_arith_table_is_nyi() {
        let reg: KernelRegistry<f64> = KernelRegistry::new();
        let err = reg.arith(BinOpKind::Lt).unwrap_err();
        assert!(matches!(
            err,
            GradixError::NotYetImplemented { is_type_error: false, .. }
        ));
    }

    #[test]
    fn pow_kernel_matches_powf() {
        let reg: KernelRegistry<f64> = KernelRegistry::new();
        let f = reg.arith(BinOpKind::HadamardPow).unwrap();
        assert_eq!(f(2.0, 3.0), 8.0);
    }
}
