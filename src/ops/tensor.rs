// src/ops/tensor.rs
// Binary operations with a tensor operand. `tensor_left` records which
// operand must be the tensor; the companion may be a compatible scalar or
// a same-shaped tensor. All elementwise work goes through the shared
// kernel registry; dtype mismatches are errors, never coerced.

use std::sync::Arc;

use crate::backend::{DeviceContext, GradixF, GradixN};
use crate::error::{GradixError, Result};
use crate::graph::{ExprGraph, NodeId};
use crate::ops::{
    check_arity, BinOpKind, IncrDoer, KernelRegistry, NumDiffOp, Operator, PreallocDoer,
    SymDiffOp, UnsafeDoer,
};
use crate::tensor::Tensor;
use crate::value::{DType, Value};

#[derive(Debug)]
pub struct TensorBinOp<T> {
    kind: BinOpKind,
    tensor_left: bool,
    kernels: Arc<KernelRegistry<T>>,
}

impl<T: GradixF> TensorBinOp<T> {
    pub fn new(kind: BinOpKind, tensor_left: bool, kernels: Arc<KernelRegistry<T>>) -> Self {
        Self {
            kind,
            tensor_left,
            kernels,
        }
    }

    pub fn kind(&self) -> BinOpKind {
        self.kind
    }

    fn tensor_index(&self) -> usize {
        if self.tensor_left {
            0
        } else {
            1
        }
    }

    fn check_dtypes(&self, inputs: &[Value<T>]) -> Result<()> {
        let (l, r) = (inputs[0].dtype(), inputs[1].dtype());
        if l != DType::Numeric || r != DType::Numeric {
            return Err(GradixError::TypeMismatch {
                op: self.name(),
                left: l,
                right: r,
            });
        }
        Ok(())
    }
}

impl<T> Operator<T> for TensorBinOp<T>
where
    T: GradixF,
{
    fn arity(&self) -> usize {
        2
    }

    fn name(&self) -> String {
        format!("TensorBinOp({})", self.kind)
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
        let t = inputs[self.tensor_index()];
        let companion = inputs[1 - self.tensor_index()];
        if !companion.is_empty() && companion != t {
            return Err(GradixError::ShapeMismatch {
                op: self.name(),
                left: t.to_vec(),
                right: companion.to_vec(),
            });
        }
        Ok(t.to_vec())
    }

    fn do_op(&self, same: bool, inputs: &[Value<T>]) -> Result<Value<T>> {
        check_arity(self, inputs.len())?;
        self.check_dtypes(inputs)?;
        let tensor = inputs[self.tensor_index()].try_tensor(&self.name())?;
        let companion = &inputs[1 - self.tensor_index()];
        let companion_left = !self.tensor_left;

        if self.kind.is_arith() {
            let f = self.kernels.arith(self.kind)?;
            let out = match companion {
                Value::Scalar(s) => tensor.zip_scalar(*s, companion_left, f),
                Value::Tensor(other) => {
                    if companion_left {
                        other.zip_with(tensor, f)?
                    } else {
                        tensor.zip_with(other, f)?
                    }
                }
                _ => return Err(GradixError::nyi(self.name(), "bool", true)),
            };
            return Ok(Value::Tensor(out));
        }

        let f = self.kernels.compare(self.kind)?;
        let mask = match companion {
            Value::Scalar(s) => tensor.zip_scalar_compare(*s, companion_left, f),
            Value::Tensor(other) => {
                if companion_left {
                    other.zip_compare(tensor, f)?
                } else {
                    tensor.zip_compare(other, f)?
                }
            }
            _ => return Err(GradixError::nyi(self.name(), "bool", true)),
        };
        if same {
            let numeric = mask.mapv(|b| {
                if b {
                    <T as GradixN>::one()
                } else {
                    <T as GradixN>::zero()
                }
            });
            Ok(Value::Tensor(Tensor::new_on(numeric, tensor.device())))
        } else {
            Ok(Value::Mask(mask))
        }
    }

    fn clone_op(&self) -> Box<dyn Operator<T>> {
        Box::new(Self {
            kind: self.kind,
            tensor_left: self.tensor_left,
            kernels: Arc::clone(&self.kernels),
        })
    }

    fn unsafe_doer(&self) -> Option<&dyn UnsafeDoer<T>> {
        Some(self)
    }

    fn prealloc_doer(&self) -> Option<&dyn PreallocDoer<T>> {
        Some(self)
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

impl<T: GradixF> UnsafeDoer<T> for TensorBinOp<T> {
    fn unsafe_do(&self, same: bool, inputs: &mut [Value<T>]) -> Result<Value<T>> {
        let out = self
            .do_op(same, inputs)
            .map_err(|e| GradixError::do_fail(e, true))?;
        inputs[0] = out.clone();
        Ok(out)
    }
}

impl<T: GradixF> PreallocDoer<T> for TensorBinOp<T> {
    fn prealloc_do(&self, prealloc: &mut Value<T>, same: bool, inputs: &[Value<T>]) -> Result<()> {
        let out = self.do_op(same, inputs)?;
        write_into(&self.name(), prealloc, out)
    }
}

impl<T: GradixF> IncrDoer<T> for TensorBinOp<T> {
    fn incr_do(&self, incr: &mut Value<T>, same: bool, inputs: &[Value<T>]) -> Result<()> {
        let run = || -> Result<()> {
            let out = self.do_op(same, inputs)?;
            match (incr, out) {
                (Value::Tensor(acc), Value::Tensor(t)) => acc.add_assign_tensor(&t),
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

impl<T: GradixF> SymDiffOp<T> for TensorBinOp<T> {
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

impl<T: GradixF> NumDiffOp<T> for TensorBinOp<T> {
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

/// Copies a computed result into a caller-supplied buffer, shape-checked.
pub(crate) fn write_into<T: GradixF>(
    op: &str,
    prealloc: &mut Value<T>,
    out: Value<T>,
) -> Result<()> {
    match (prealloc, out) {
        (Value::Tensor(p), Value::Tensor(r)) => {
            if p.shape() != r.shape() {
                return Err(GradixError::ShapeMismatch {
                    op: op.to_string(),
                    left: p.shape().to_vec(),
                    right: r.shape().to_vec(),
                });
            }
            p.data_mut().assign(r.data());
            Ok(())
        }
        (Value::Scalar(p), Value::Scalar(r)) => {
            *p = r;
            Ok(())
        }
        (Value::Mask(p), Value::Mask(r)) => {
            *p = r;
            Ok(())
        }
        (p, _) => Err(GradixError::nyi(
            "UsePreallocDo",
            format!("{}", p.dtype()),
            true,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: BinOpKind, tensor_left: bool) -> TensorBinOp<f64> {
        TensorBinOp::new(kind, tensor_left, Arc::new(KernelRegistry::new()))
    }

    fn vec3(data: [f64; 3]) -> Value<f64> {
        Value::Tensor(Tensor::from_vec(data.to_vec(), &[3]).unwrap())
    }

    #[test]
    fn hadamard_product_of_vectors() {
        let z = op(BinOpKind::HadamardProd, true)
            .do_op(false, &[vec3([1.0, 2.0, 3.0]), vec3([4.0, 5.0, 6.0])])
            .unwrap();
        assert_eq!(
            z.as_tensor().unwrap().data().as_slice().unwrap(),
            &[4.0, 10.0, 18.0]
        );
    }

    #[test]
    fn scalar_companion_respects_operand_side() {
        // 10 - t, with the tensor as the second operand
        let z = op(BinOpKind::Sub, false)
            .do_op(false, &[Value::Scalar(10.0), vec3([1.0, 2.0, 3.0])])
            .unwrap();
        assert_eq!(
            z.as_tensor().unwrap().data().as_slice().unwrap(),
            &[9.0, 8.0, 7.0]
        );
    }

    #[test]
    fn comparison_yields_mask_or_same_type() {
        let mask = op(BinOpKind::Gt, true)
            .do_op(false, &[vec3([1.0, 5.0, 3.0]), vec3([2.0, 2.0, 2.0])])
            .unwrap();
        match mask {
            Value::Mask(m) => assert_eq!(m.as_slice().unwrap(), &[false, true, true]),
            other => panic!("expected mask, got {other:?}"),
        }

        let numeric = op(BinOpKind::Gt, true)
            .do_op(true, &[vec3([1.0, 5.0, 3.0]), vec3([2.0, 2.0, 2.0])])
            .unwrap();
        assert_eq!(
            numeric.as_tensor().unwrap().data().as_slice().unwrap(),
            &[0.0, 1.0, 1.0]
        );
    }

    #[test]
    fn arith_kinds_expose_differentiation_probes() {
        let o = op(BinOpKind::HadamardProd, true);
        assert!(o.sym_diff_op().is_some());
        assert!(o.num_diff_op().is_some());
        let cmp = op(BinOpKind::Gt, true);
        assert!(cmp.sym_diff_op().is_none());
        assert!(cmp.num_diff_op().is_none());
    }

    #[test]
    fn dtype_mismatch_is_never_coerced() {
        let err = op(BinOpKind::Add, true)
            .do_op(false, &[vec3([1.0, 2.0, 3.0]), Value::Bool(true)])
            .unwrap_err();
        assert!(matches!(err, GradixError::TypeMismatch { .. }));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let b = Value::Tensor(Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap());
        let err = op(BinOpKind::Add, true)
            .do_op(false, &[vec3([1.0, 2.0, 3.0]), b])
            .unwrap_err();
        assert!(matches!(err, GradixError::ShapeMismatch { .. }));
    }

    #[test]
    fn incr_do_accumulates_into_existing_buffer() {
        let o = op(BinOpKind::Add, true);
        let mut acc = Value::Tensor(Tensor::<f64>::ones(&[3]));
        o.incr_do(&mut acc, false, &[vec3([1.0, 2.0, 3.0]), vec3([1.0, 1.0, 1.0])])
            .unwrap();
        assert_eq!(
            acc.as_tensor().unwrap().data().as_slice().unwrap(),
            &[3.0, 4.0, 5.0]
        );
    }

    #[test]
    fn incr_do_failure_is_wrapped_without_unsafe_flag() {
        let o = op(BinOpKind::Add, true);
        let mut acc = Value::Tensor(Tensor::<f64>::ones(&[3]));
        let err = o
            .incr_do(&mut acc, false, &[vec3([1.0, 2.0, 3.0])])
            .unwrap_err();
        assert!(matches!(err, GradixError::DoFail { is_unsafe: false, .. }));
    }

    #[test]
    fn unsafe_do_overwrites_first_operand() {
        let o = op(BinOpKind::HadamardProd, true);
        let mut inputs = [vec3([1.0, 2.0, 3.0]), vec3([2.0, 2.0, 2.0])];
        let out = o.unsafe_do(false, &mut inputs).unwrap();
        assert_eq!(inputs[0], out);
        assert_eq!(
            out.as_tensor().unwrap().data().as_slice().unwrap(),
            &[2.0, 4.0, 6.0]
        );
    }

    #[test]
    fn prealloc_do_writes_into_supplied_buffer() {
        let o = op(BinOpKind::Add, true);
        let mut out = Value::Tensor(Tensor::<f64>::zeros(&[3]));
        o.prealloc_do(&mut out, false, &[vec3([1.0, 2.0, 3.0]), Value::Scalar(1.0)])
            .unwrap();
        assert_eq!(
            out.as_tensor().unwrap().data().as_slice().unwrap(),
            &[2.0, 3.0, 4.0]
        );
    }
}
