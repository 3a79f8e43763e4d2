// src/ops/mod.rs
// Operator contract. Every operation applied to the graph implements
// `Operator`; memory-reusing and differentiation capabilities are optional
// extension traits discovered through probe methods, so dispatch code asks
// an operator what it can do instead of downcasting.

pub mod nn;
pub mod registry;
pub mod scalar;
pub mod tensor;
pub mod unary;

pub use nn::{BatchNorm, Col2Im, Im2Col, MaxPool2D, MaxPool2DDiff};
pub use registry::KernelRegistry;
pub use scalar::ScalarBinOp;
pub use tensor::TensorBinOp;
pub use unary::{LnOp, NegOp};

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use crate::backend::{DeviceContext, GradixF};
use crate::error::{GradixError, Result};
use crate::graph::{ExprGraph, NodeId};
use crate::value::{DType, Value};

/// Core operator contract: forward compute plus metadata the graph needs
/// to type, shape and wire an application.
pub trait Operator<T>: Debug
where
    T: GradixF,
{
    /// Declared operand count.
    fn arity(&self) -> usize;

    /// Diagnostic name, used in error reports and logs.
    fn name(&self) -> String;

    /// Resolves the output dtype against concrete operand dtypes.
    fn out_dtype(&self, inputs: &[DType]) -> Result<DType>;

    /// Computes output shape from input shapes and operator parameters.
    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>>;

    /// Computes a fresh result. `same` forces boolean-producing comparison
    /// operators to emit 1/0 in the operands' numeric dtype instead.
    fn do_op(&self, same: bool, inputs: &[Value<T>]) -> Result<Value<T>>;

    fn clone_op(&self) -> Box<dyn Operator<T>>;

    // ===== capability probes =====

    fn unsafe_doer(&self) -> Option<&dyn UnsafeDoer<T>> {
        None
    }

    fn prealloc_doer(&self) -> Option<&dyn PreallocDoer<T>> {
        None
    }

    fn incr_doer(&self) -> Option<&dyn IncrDoer<T>> {
        None
    }

    fn sym_diff_op(&self) -> Option<&dyn SymDiffOp<T>> {
        None
    }

    fn num_diff_op(&self) -> Option<&dyn NumDiffOp<T>> {
        None
    }
}

/// Overwrites the first operand in place and returns it. Callers own the
/// aliasing hazard; failures are wrapped with the unsafe flag set.
pub trait UnsafeDoer<T: GradixF> {
    fn unsafe_do(&self, same: bool, inputs: &mut [Value<T>]) -> Result<Value<T>>;
}

/// Writes the result into a caller-supplied buffer of the right shape.
pub trait PreallocDoer<T: GradixF> {
    fn prealloc_do(&self, prealloc: &mut Value<T>, same: bool, inputs: &[Value<T>]) -> Result<()>;
}

/// Adds the result into an existing accumulator instead of replacing it.
pub trait IncrDoer<T: GradixF> {
    fn incr_do(&self, incr: &mut Value<T>, same: bool, inputs: &[Value<T>]) -> Result<()>;
}

/// Symbolic differentiation: appends gradient nodes to the graph. Returns
/// one entry per input; `None` marks an input whose branch was skipped
/// (constant operands).
pub trait SymDiffOp<T: GradixF> {
    fn sym_diff(
        &self,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
        grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>>;
}

/// Numeric differentiation: reads the output node's accumulated derivative
/// and accumulates gradient buffers into each input's derivative slot,
/// honoring device placement.
pub trait NumDiffOp<T: GradixF> {
    fn do_diff(
        &self,
        ctx: &dyn DeviceContext<T>,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
    ) -> Result<()>;
}

pub(crate) fn check_arity<T: GradixF>(op: &dyn Operator<T>, got: usize) -> Result<()> {
    if got != op.arity() {
        return Err(GradixError::ArityMismatch {
            op: op.name(),
            expected: op.arity(),
            got,
        });
    }
    Ok(())
}

/// Operator kinds for the scalar/tensor binary dispatchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    HadamardProd,
    HadamardDiv,
    HadamardPow,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Ne,
}

impl BinOpKind {
    /// Arithmetic kinds produce numeric outputs and are differentiable;
    /// comparison kinds produce booleans and are not.
    pub fn is_arith(&self) -> bool {
        matches!(
            self,
            BinOpKind::Add
                | BinOpKind::Sub
                | BinOpKind::HadamardProd
                | BinOpKind::HadamardDiv
                | BinOpKind::HadamardPow
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOpKind::Add => "+",
            BinOpKind::Sub => "-",
            BinOpKind::HadamardProd => "*",
            BinOpKind::HadamardDiv => "/",
            BinOpKind::HadamardPow => "^",
            BinOpKind::Lt => "<",
            BinOpKind::Gt => ">",
            BinOpKind::Lte => "<=",
            BinOpKind::Gte => ">=",
            BinOpKind::Eq => "==",
            BinOpKind::Ne => "!=",
        }
    }
}

impl std::fmt::Display for BinOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Capability set of one operator, as reported by its probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpCaps {
    pub unsafe_do: bool,
    pub prealloc_do: bool,
    pub incr_do: bool,
    pub sym_diff: bool,
    pub num_diff: bool,
}

/// Immutable description of one applied operation: arity, name, a content
/// hash for structural deduplication, and the capability set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpDescriptor {
    pub name: String,
    pub arity: usize,
    pub hash: u64,
    pub caps: OpCaps,
}

impl OpDescriptor {
    pub fn of<T: GradixF>(op: &dyn Operator<T>) -> Self {
        let name = op.name();
        let arity = op.arity();
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        arity.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            caps: OpCaps {
                unsafe_do: op.unsafe_doer().is_some(),
                prealloc_do: op.prealloc_doer().is_some(),
                incr_do: op.incr_doer().is_some(),
                sym_diff: op.sym_diff_op().is_some(),
                num_diff: op.num_diff_op().is_some(),
            },
            name,
            arity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arith_and_comparison_kinds_are_disjoint() {
        assert!(BinOpKind::HadamardPow.is_arith());
        assert!(!BinOpKind::Lte.is_arith());
        assert_eq!(BinOpKind::Ne.to_string(), "!=");
    }

    #[test]
    fn descriptor_hashes_are_structural() {
        let a = OpDescriptor::of::<f64>(&ScalarBinOp::new(BinOpKind::Add));
        let b = OpDescriptor::of::<f64>(&ScalarBinOp::new(BinOpKind::Add));
        let c = OpDescriptor::of::<f64>(&ScalarBinOp::new(BinOpKind::Sub));
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn descriptor_reports_capabilities() {
        let cmp = OpDescriptor::of::<f64>(&ScalarBinOp::new(BinOpKind::Eq));
        assert!(!cmp.caps.sym_diff);
        let add = OpDescriptor::of::<f64>(&ScalarBinOp::new(BinOpKind::Add));
        assert!(add.caps.sym_diff);
        assert!(add.caps.num_diff);
    }
}
