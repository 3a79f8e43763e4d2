// src/ops/unary.rs
// Elementwise unary operators. Negation and the natural logarithm are the
// two the gradient rules compose with (sub negates the upstream gradient,
// pow needs ln of the base).

use std::marker::PhantomData;

use crate::backend::{DeviceContext, GradixF};
use crate::error::Result;
use crate::graph::{ExprGraph, NodeId};
use crate::ops::{check_arity, BinOpKind, NumDiffOp, Operator, SymDiffOp};
use crate::value::{DType, Value};

fn unary_numeric_dtype<T: GradixF>(op: &dyn Operator<T>, inputs: &[DType]) -> Result<DType> {
    if inputs[0] != DType::Numeric {
        return Err(crate::error::GradixError::TypeMismatch {
            op: op.name(),
            left: DType::Numeric,
            right: inputs[0],
        });
    }
    Ok(DType::Numeric)
}

/// Elementwise negation.
#[derive(Debug, Clone, Copy)]
pub struct NegOp<T> {
    _elem: PhantomData<T>,
}

impl<T: GradixF> NegOp<T> {
    pub fn new() -> Self {
        Self { _elem: PhantomData }
    }
}

impl<T: GradixF> Default for NegOp<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Operator<T> for NegOp<T>
where
    T: GradixF,
{
    fn arity(&self) -> usize {
        1
    }

    fn name(&self) -> String {
        "Neg".to_string()
    }

    fn out_dtype(&self, inputs: &[DType]) -> Result<DType> {
        unary_numeric_dtype(self, inputs)
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        Ok(inputs[0].to_vec())
    }

    fn do_op(&self, _same: bool, inputs: &[Value<T>]) -> Result<Value<T>> {
        check_arity(self, inputs.len())?;
        match &inputs[0] {
            Value::Scalar(s) => Ok(Value::Scalar(-*s)),
            Value::Tensor(t) => Ok(Value::Tensor(t.map(|v| -v))),
            other => Err(crate::error::GradixError::nyi(
                self.name(),
                format!("{}", other.dtype()),
                true,
            )),
        }
    }

    fn clone_op(&self) -> Box<dyn Operator<T>> {
        Box::new(*self)
    }

    fn sym_diff_op(&self) -> Option<&dyn SymDiffOp<T>> {
        Some(self)
    }

    fn num_diff_op(&self) -> Option<&dyn NumDiffOp<T>> {
        Some(self)
    }
}

impl<T: GradixF> SymDiffOp<T> for NegOp<T> {
    // d(-x)/dx = -gz
    fn sym_diff(
        &self,
        g: &mut ExprGraph<T>,
        _inputs: &[NodeId],
        _output: NodeId,
        grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let neg = g.apply_op(Box::new(NegOp::<T>::new()), &[grad])?;
        Ok(vec![Some(neg)])
    }
}

impl<T: GradixF> NumDiffOp<T> for NegOp<T> {
    fn do_diff(
        &self,
        ctx: &dyn DeviceContext<T>,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
    ) -> Result<()> {
        let dz = crate::diff::numeric::output_deriv(g, output)?;
        let contribution = self.do_op(false, &[dz])?;
        crate::diff::numeric::add_into(ctx, g, inputs[0], &contribution)
    }
}

/// Elementwise natural logarithm.
#[derive(Debug, Clone, Copy)]
pub struct LnOp<T> {
    _elem: PhantomData<T>,
}

impl<T: GradixF> LnOp<T> {
    pub fn new() -> Self {
        Self { _elem: PhantomData }
    }
}

impl<T: GradixF> Default for LnOp<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Operator<T> for LnOp<T>
where
    T: GradixF,
{
    fn arity(&self) -> usize {
        1
    }

    fn name(&self) -> String {
        "Ln".to_string()
    }

    fn out_dtype(&self, inputs: &[DType]) -> Result<DType> {
        unary_numeric_dtype(self, inputs)
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        Ok(inputs[0].to_vec())
    }

    fn do_op(&self, _same: bool, inputs: &[Value<T>]) -> Result<Value<T>> {
        check_arity(self, inputs.len())?;
        match &inputs[0] {
            Value::Scalar(s) => Ok(Value::Scalar(s.ln())),
            Value::Tensor(t) => Ok(Value::Tensor(t.map(|v| v.ln()))),
            other => Err(crate::error::GradixError::nyi(
                self.name(),
                format!("{}", other.dtype()),
                true,
            )),
        }
    }

    fn clone_op(&self) -> Box<dyn Operator<T>> {
        Box::new(*self)
    }

    fn sym_diff_op(&self) -> Option<&dyn SymDiffOp<T>> {
        Some(self)
    }

    fn num_diff_op(&self) -> Option<&dyn NumDiffOp<T>> {
        Some(self)
    }
}

impl<T: GradixF> SymDiffOp<T> for LnOp<T> {
    // d(ln x)/dx = gz / x
    fn sym_diff(
        &self,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        _output: NodeId,
        grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let div = crate::diff::symbolic::apply_bin(g, BinOpKind::HadamardDiv, grad, inputs[0])?;
        Ok(vec![Some(div)])
    }
}

impl<T: GradixF> NumDiffOp<T> for LnOp<T> {
    fn do_diff(
        &self,
        ctx: &dyn DeviceContext<T>,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
    ) -> Result<()> {
        let dz = crate::diff::numeric::output_deriv(g, output)?;
        let x = g.value(inputs[0])?.clone();
        let contribution = crate::diff::numeric::elementwise(
            g,
            BinOpKind::HadamardDiv,
            &dz,
            &x,
        )?;
        crate::diff::numeric::add_into(ctx, g, inputs[0], &contribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use approx::assert_relative_eq;

    #[test]
    fn neg_flips_sign_elementwise() {
        let op: NegOp<f64> = NegOp::new();
        let out = op
            .do_op(
                false,
                &[Value::Tensor(
                    Tensor::from_vec(vec![1.0, -2.0], &[2]).unwrap(),
                )],
            )
            .unwrap();
        assert_eq!(
            out.as_tensor().unwrap().data().as_slice().unwrap(),
            &[-1.0, 2.0]
        );
    }

    #[test]
    fn ln_of_scalar() {
        let op: LnOp<f64> = LnOp::new();
        let out = op.do_op(false, &[Value::Scalar(2.0)]).unwrap();
        assert_relative_eq!(out.as_scalar().unwrap(), 2.0_f64.ln());
    }
}
