// src/ops/scalar.rs
// Binary operations over scalar operands. Each kind resolves to a match
// arm on the concrete numeric type; unsupported operand forms report the
// standard not-yet-implemented error with the type flag set.

use std::marker::PhantomData;

use crate::backend::{DeviceContext, GradixF, GradixN};
use crate::error::{GradixError, Result};
use crate::graph::{ExprGraph, NodeId};
use crate::ops::{check_arity, BinOpKind, IncrDoer, NumDiffOp, Operator, SymDiffOp};
use crate::value::{DType, Value};

#[derive(Debug, Clone, Copy)]
pub struct ScalarBinOp<T> {
    kind: BinOpKind,
    _elem: PhantomData<T>,
}

impl<T: GradixF> ScalarBinOp<T> {
    pub fn new(kind: BinOpKind) -> Self {
        Self {
            kind,
            _elem: PhantomData,
        }
    }

    pub fn kind(&self) -> BinOpKind {
        self.kind
    }
}

impl<T> Operator<T> for ScalarBinOp<T>
where
    T: GradixF,
{
    fn arity(&self) -> usize {
        2
    }

    fn name(&self) -> String {
        format!("ScalarBinOp({})", self.kind)
    }

    fn out_dtype(&self, inputs: &[DType]) -> Result<DType> {
        if inputs.iter().any(|&d| d != DType::Numeric) {
            return Err(GradixError::TypeMismatch {
                op: self.name(),
                left: inputs[0],
                right: inputs[1],
            });
        }
        Ok(if self.kind.is_arith() {
            DType::Numeric
        } else {
            DType::Bool
        })
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        for shape in inputs {
            if !shape.is_empty() {
                return Err(GradixError::ShapeMismatch {
                    op: self.name(),
                    left: vec![],
                    right: shape.to_vec(),
                });
            }
        }
        Ok(vec![])
    }

    fn do_op(&self, same: bool, inputs: &[Value<T>]) -> Result<Value<T>> {
        check_arity(self, inputs.len())?;
        let a = inputs[0].try_scalar(&self.name())?;
        let b = inputs[1].try_scalar(&self.name())?;
        let out = match self.kind {
            BinOpKind::Add => return Ok(Value::Scalar(a + b)),
            BinOpKind::Sub => return Ok(Value::Scalar(a - b)),
            BinOpKind::HadamardProd => return Ok(Value::Scalar(a * b)),
            BinOpKind::HadamardDiv => return Ok(Value::Scalar(a / b)),
            BinOpKind::HadamardPow => return Ok(Value::Scalar(a.powf(b))),
            BinOpKind::Lt => a < b,
            BinOpKind::Gt => a > b,
            BinOpKind::Lte => a <= b,
            BinOpKind::Gte => a >= b,
            BinOpKind::Eq => a == b,
            BinOpKind::Ne => a != b,
        };
        if same {
            Ok(Value::Scalar(if out {
                <T as GradixN>::one()
            } else {
                <T as GradixN>::zero()
            }))
        } else {
            Ok(Value::Bool(out))
        }
    }

    fn clone_op(&self) -> Box<dyn Operator<T>> {
        Box::new(*self)
    }

    fn incr_doer(&self) -> Option<&dyn IncrDoer<T>> {
        Some(self)
    }

    fn sym_diff_op(&self) -> Option<&dyn SymDiffOp<T>> {
        if self.kind.is_arith() {
            Some(self)
        } else {
            None
        }
    }

    fn num_diff_op(&self) -> Option<&dyn NumDiffOp<T>> {
        if self.kind.is_arith() {
            Some(self)
        } else {
            None
        }
    }
}

impl<T: GradixF> IncrDoer<T> for ScalarBinOp<T> {
    fn incr_do(&self, incr: &mut Value<T>, same: bool, inputs: &[Value<T>]) -> Result<()> {
        let run = || -> Result<()> {
            let out = self.do_op(same, inputs)?;
            match (incr, out) {
                (Value::Scalar(acc), Value::Scalar(s)) => {
                    *acc += s;
                    Ok(())
                }
                (acc, _) => Err(GradixError::nyi(
                    "IncrDo",
                    format!("{}", acc.dtype()),
                    true,
                )),
            }
        };
        run().map_err(|e| GradixError::do_fail(e, false))
    }
}

impl<T: GradixF> SymDiffOp<T> for ScalarBinOp<T> {
    fn sym_diff(
        &self,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
        grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        crate::diff::symbolic::sym_diff_bin(self.kind, g, inputs, output, grad)
    }
}

impl<T: GradixF> NumDiffOp<T> for ScalarBinOp<T> {
    fn do_diff(
        &self,
        ctx: &dyn DeviceContext<T>,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
    ) -> Result<()> {
        crate::diff::numeric::do_diff_bin(self.kind, ctx, g, inputs, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: BinOpKind, same: bool, a: f64, b: f64) -> Value<f64> {
        ScalarBinOp::new(kind)
            .do_op(same, &[Value::Scalar(a), Value::Scalar(b)])
            .unwrap()
    }

    #[test]
    fn arithmetic_kinds() {
        assert_eq!(run(BinOpKind::Add, false, 2.0, 3.0).as_scalar(), Some(5.0));
        assert_eq!(run(BinOpKind::Sub, false, 5.0, 2.0).as_scalar(), Some(3.0));
        assert_eq!(
            run(BinOpKind::HadamardProd, false, 2.0, 3.0).as_scalar(),
            Some(6.0)
        );
        assert_eq!(
            run(BinOpKind::HadamardDiv, false, 3.0, 2.0).as_scalar(),
            Some(1.5)
        );
        assert_eq!(
            run(BinOpKind::HadamardPow, false, 2.0, 3.0).as_scalar(),
            Some(8.0)
        );
    }

    #[test]
    fn comparisons_produce_bools_by_default() {
        assert_eq!(run(BinOpKind::Lt, false, 1.0, 2.0), Value::Bool(true));
        assert_eq!(run(BinOpKind::Gte, false, 1.0, 2.0), Value::Bool(false));
    }

    #[test]
    fn same_forces_numeric_comparison_output() {
        assert_eq!(run(BinOpKind::Lt, true, 1.0, 2.0).as_scalar(), Some(1.0));
        assert_eq!(run(BinOpKind::Eq, true, 1.0, 2.0).as_scalar(), Some(0.0));
    }

    #[test]
    fn non_scalar_operand_is_a_type_restricted_nyi() {
        let op: ScalarBinOp<f64> = ScalarBinOp::new(BinOpKind::Add);
        let err = op
            .do_op(false, &[Value::Bool(true), Value::Scalar(1.0)])
            .unwrap_err();
        assert!(matches!(
            err,
            GradixError::NotYetImplemented { is_type_error: true, .. }
        ));
    }

    #[test]
    fn comparison_kinds_refuse_differentiation_probes() {
        let op: ScalarBinOp<f64> = ScalarBinOp::new(BinOpKind::Gt);
        assert!(op.sym_diff_op().is_none());
        assert!(op.num_diff_op().is_none());
    }
}
