// src/diff/numeric.rs
// Numeric differentiation: gradient buffers are computed directly from
// bound values and accumulated into each input's derivative slot through
// the increment-accumulate contract. Device placement is honored through
// the execution context: off-default-device scratch is acquired from the
// context, released by a scope guard on every exit path, and followed by a
// scheduler signal after a successful accumulate.

use log::{debug, trace};

use crate::backend::{DeviceContext, GradixF, GradixN, ScopedValue};
use crate::error::{GradixError, Result};
use crate::graph::{ExprGraph, NodeId};
use crate::ops::{BinOpKind, IncrDoer, LnOp, NegOp, Operator, ScalarBinOp, TensorBinOp};
use crate::tensor::Tensor;
use crate::value::Value;

/// The output node's accumulated derivative, cloned for rule arithmetic.
pub(crate) fn output_deriv<T: GradixF>(g: &ExprGraph<T>, output: NodeId) -> Result<Value<T>> {
    g.node(output)
        .ok_or(GradixError::Unbound {
            id: output.0,
            what: "node",
        })?
        .dual()?
        .deriv()
        .cloned()
        .ok_or(GradixError::Unbound {
            id: output.0,
            what: "derivative",
        })
}

/// Raw elementwise application of a binary kind over bound values, routed
/// through the graph's kernel registry.
pub(crate) fn elementwise<T: GradixF>(
    g: &ExprGraph<T>,
    kind: BinOpKind,
    a: &Value<T>,
    b: &Value<T>,
) -> Result<Value<T>> {
    let inputs = [a.clone(), b.clone()];
    if a.is_scalar() && b.is_scalar() {
        ScalarBinOp::new(kind).do_op(false, &inputs)
    } else {
        let tensor_left = !a.is_scalar();
        TensorBinOp::new(kind, tensor_left, g.kernels()).do_op(false, &inputs)
    }
}

fn is_constant<T: GradixF>(g: &ExprGraph<T>, id: NodeId) -> bool {
    g.node(id).map(|n| n.is_constant()).unwrap_or(false)
}

/// Accumulates a gradient contribution into a node's derivative buffer.
///
/// The derivative accumulator is allocated (zeroed) before anything adds
/// into it. A scalar operand receiving a tensor-shaped gradient reduces the
/// contribution; when the gradient lives off the default device, the
/// reduction runs through a context-acquired scratch buffer sized from the
/// tensor's shape, released by its guard on success and failure alike.
pub(crate) fn add_into<T: GradixF>(
    ctx: &dyn DeviceContext<T>,
    g: &mut ExprGraph<T>,
    node: NodeId,
    contribution: &Value<T>,
) -> Result<()> {
    if is_constant(g, node) {
        trace!("constant {} takes no gradient", node);
        return Ok(());
    }
    let kernels = g.kernels();
    let device = contribution.device();
    let default = ctx.default_device();

    {
        let n = g.node_mut(node).ok_or(GradixError::Unbound {
            id: node.0,
            what: "node",
        })?;
        let dual = n.bind_dual()?;
        dual.bind_for()?;
    }
    let deriv_is_scalar = matches!(
        g.node(node).and_then(|n| n.dual().ok()).and_then(|d| d.deriv()),
        Some(Value::Scalar(_))
    );

    if deriv_is_scalar {
        if let Value::Tensor(ct) = contribution {
            let total = if device != default {
                let mut scratch = ScopedValue::new(ctx, device, ctx.get(device, ct.shape())?);
                scratch
                    .value_mut()
                    .as_tensor_mut()
                    .ok_or_else(|| GradixError::AllocFail {
                        device: device.to_string(),
                        size: ct.size(),
                    })?
                    .add_assign_tensor(ct)
                    .map_err(|e| GradixError::do_fail(e, false))?;
                scratch.value().as_tensor().map(Tensor::sum).unwrap_or_else(
                    <T as GradixN>::zero,
                )
                // scratch guard drops here, releasing the buffer
            } else {
                ct.sum()
            };
            let slot = g
                .node_mut(node)
                .ok_or(GradixError::Unbound {
                    id: node.0,
                    what: "node",
                })?
                .dual_mut()?
                .bind_for()?;
            if let Value::Scalar(s) = slot {
                *s += total;
            }
            if device != default {
                ctx.signal();
            }
            return Ok(());
        }
    }

    // matching forms accumulate through the Add operator's IncrDo
    let zero = contribution.zero_like();
    let slot = g
        .node_mut(node)
        .ok_or(GradixError::Unbound {
            id: node.0,
            what: "node",
        })?
        .dual_mut()?
        .bind_for()?;
    if contribution.is_scalar() {
        ScalarBinOp::new(BinOpKind::Add).incr_do(slot, false, &[contribution.clone(), zero])?;
    } else {
        TensorBinOp::new(BinOpKind::Add, true, kernels).incr_do(
            slot,
            false,
            &[contribution.clone(), zero],
        )?;
    }
    if device != default {
        ctx.signal();
    }
    Ok(())
}

/// Numeric gradient rules for the binary kinds, mirroring the symbolic
/// ones over bound values. Comparison kinds are not differentiable.
pub fn do_diff_bin<T: GradixF>(
    kind: BinOpKind,
    ctx: &dyn DeviceContext<T>,
    g: &mut ExprGraph<T>,
    inputs: &[NodeId],
    output: NodeId,
) -> Result<()> {
    if !kind.is_arith() {
        return Err(GradixError::AutoDiffUnsupported {
            op: kind.to_string(),
        });
    }
    let (x, y) = (inputs[0], inputs[1]);
    let dz = output_deriv(g, output)?;

    match kind {
        BinOpKind::Add => {
            add_into(ctx, g, x, &dz)?;
            add_into(ctx, g, y, &dz)
        }

        BinOpKind::Sub => {
            add_into(ctx, g, x, &dz)?;
            let neg = NegOp::<T>::new().do_op(false, &[dz])?;
            add_into(ctx, g, y, &neg)
        }

        BinOpKind::HadamardProd => {
            let xv = g.value(x)?.clone();
            let yv = g.value(y)?.clone();
            if !is_constant(g, x) {
                let cx = elementwise(g, BinOpKind::HadamardProd, &yv, &dz)?;
                add_into(ctx, g, x, &cx)?;
            }
            if !is_constant(g, y) {
                let cy = elementwise(g, BinOpKind::HadamardProd, &xv, &dz)?;
                add_into(ctx, g, y, &cy)?;
            }
            Ok(())
        }

        BinOpKind::HadamardDiv => {
            let yv = g.value(y)?.clone();
            let zv = g.value(output)?.clone();
            let cx = elementwise(g, BinOpKind::HadamardDiv, &dz, &yv)?;
            add_into(ctx, g, x, &cx)?;
            let zy = elementwise(g, BinOpKind::HadamardDiv, &zv, &yv)?;
            let nzy = NegOp::<T>::new().do_op(false, &[zy])?;
            let cy = elementwise(g, BinOpKind::HadamardProd, &nzy, &dz)?;
            add_into(ctx, g, y, &cy)
        }

        BinOpKind::HadamardPow => {
            let xv = g.value(x)?.clone();
            let yv = g.value(y)?.clone();
            let zv = g.value(output)?.clone();
            // the one constant in the operands' concrete dtype
            let one = Value::Scalar(<T as GradixN>::one());
            let ym1 = elementwise(g, BinOpKind::Sub, &yv, &one)?;
            let xym1 = elementwise(g, BinOpKind::HadamardPow, &xv, &ym1)?;
            let t = elementwise(g, BinOpKind::HadamardProd, &yv, &xym1)?;
            let cx = elementwise(g, BinOpKind::HadamardProd, &dz, &t)?;
            add_into(ctx, g, x, &cx)?;

            let lnx = LnOp::<T>::new().do_op(false, &[xv])?;
            let t2 = elementwise(g, BinOpKind::HadamardProd, &zv, &lnx)?;
            let cy = elementwise(g, BinOpKind::HadamardProd, &dz, &t2)?;
            add_into(ctx, g, y, &cy)
        }

        other => Err(GradixError::AutoDiffUnsupported {
            op: other.to_string(),
        }),
    }
}

/// Reverse-mode numeric backprop over a fully bound graph. Seeds the
/// output's derivative with ones and walks consumers before operands,
/// dispatching each node's numeric differentiation routine.
pub fn numeric_backprop<T: GradixF>(
    ctx: &dyn DeviceContext<T>,
    g: &mut ExprGraph<T>,
    output: NodeId,
) -> Result<()> {
    {
        let seed = g.value(output)?.one_like()?;
        let n = g.node_mut(output).ok_or(GradixError::Unbound {
            id: output.0,
            what: "node",
        })?;
        n.bind_dual()?.set_deriv(seed);
    }
    let order = g.sorted_from(output);
    debug!("numeric backprop from {} over {} node(s)", output, order.len());

    for id in order {
        let node = match g.node(id) {
            Some(node) => node,
            None => continue,
        };
        if node.is_leaf() {
            continue;
        }
        if !node.dual().map(|d| d.has_deriv()).unwrap_or(false) {
            trace!("no gradient reaches {}", id);
            continue;
        }
        let op = match node.op() {
            Some(op) => op.clone_op(),
            None => continue,
        };
        let num = op
            .num_diff_op()
            .ok_or_else(|| GradixError::AutoDiffUnsupported { op: op.name() })?;
        let inputs = g.operands(id);
        num.do_diff(ctx, g, &inputs, id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Device, HostContext};
    use approx::assert_relative_eq;

    fn scalar_graph(kind: BinOpKind, x: f64, y: f64) -> (ExprGraph<f64>, NodeId, NodeId, NodeId) {
        let mut g: ExprGraph<f64> = ExprGraph::new();
        let xn = g.variable(Value::Scalar(x)).unwrap();
        let yn = g.variable(Value::Scalar(y)).unwrap();
        let zn = g
            .apply_op(Box::new(ScalarBinOp::new(kind)), &[xn, yn])
            .unwrap();
        (g, xn, yn, zn)
    }

    fn deriv_scalar(g: &ExprGraph<f64>, id: NodeId) -> f64 {
        g.deriv(id).unwrap().unwrap().as_scalar().unwrap()
    }

    #[test]
    fn add_accumulates_upstream_into_both() {
        let (mut g, x, y, z) = scalar_graph(BinOpKind::Add, 2.0, 3.0);
        let ctx = HostContext::new();
        numeric_backprop(&ctx, &mut g, z).unwrap();
        assert_relative_eq!(deriv_scalar(&g, x), 1.0);
        assert_relative_eq!(deriv_scalar(&g, y), 1.0);
    }

    #[test]
    fn sub_negates_second_branch() {
        let (mut g, x, y, z) = scalar_graph(BinOpKind::Sub, 5.0, 2.0);
        let ctx = HostContext::new();
        numeric_backprop(&ctx, &mut g, z).unwrap();
        assert_relative_eq!(deriv_scalar(&g, x), 1.0);
        assert_relative_eq!(deriv_scalar(&g, y), -1.0);
    }

    #[test]
    fn pow_matches_closed_form() {
        let (mut g, x, y, z) = scalar_graph(BinOpKind::HadamardPow, 2.0, 3.0);
        let ctx = HostContext::new();
        numeric_backprop(&ctx, &mut g, z).unwrap();
        assert_relative_eq!(deriv_scalar(&g, x), 12.0);
        assert_relative_eq!(deriv_scalar(&g, y), 8.0 * 2.0_f64.ln());
    }

    #[test]
    fn div_matches_closed_form() {
        let (mut g, x, y, z) = scalar_graph(BinOpKind::HadamardDiv, 6.0, 2.0);
        let ctx = HostContext::new();
        numeric_backprop(&ctx, &mut g, z).unwrap();
        assert_relative_eq!(deriv_scalar(&g, x), 0.5);
        assert_relative_eq!(deriv_scalar(&g, y), -1.5);
    }

    #[test]
    fn constant_prod_factor_gets_no_buffer() {
        let mut g: ExprGraph<f64> = ExprGraph::new();
        let x = g.variable(Value::Scalar(2.0)).unwrap();
        let c = g.constant(Value::Scalar(10.0)).unwrap();
        let z = g
            .apply_op(Box::new(ScalarBinOp::new(BinOpKind::HadamardProd)), &[x, c])
            .unwrap();
        let ctx = HostContext::new();
        numeric_backprop(&ctx, &mut g, z).unwrap();
        assert_relative_eq!(deriv_scalar(&g, x), 10.0);
        assert!(g.deriv(c).unwrap().is_none());
    }

    #[test]
    fn accumulation_is_order_independent() {
        let contributions = [
            Value::Scalar(0.25_f64),
            Value::Scalar(1.5),
            Value::Scalar(-0.75),
        ];
        let run = |order: &[usize]| -> f64 {
            let mut g: ExprGraph<f64> = ExprGraph::new();
            let x = g.variable(Value::Scalar(0.0)).unwrap();
            let ctx = HostContext::new();
            for &i in order {
                add_into(&ctx, &mut g, x, &contributions[i]).unwrap();
            }
            deriv_scalar(&g, x)
        };
        assert_relative_eq!(run(&[0, 1, 2]), run(&[2, 0, 1]));
        assert_relative_eq!(run(&[0, 1, 2]), 1.0);
    }

    #[test]
    fn comparison_output_refuses_numeric_diff() {
        let err = do_diff_bin(
            BinOpKind::Gt,
            &HostContext::<f64>::new(),
            &mut ExprGraph::new(),
            &[NodeId(0), NodeId(1)],
            NodeId(2),
        );
        // the rule table rejects the kind before touching any node
        assert!(matches!(
            err.unwrap_err(),
            GradixError::AutoDiffUnsupported { .. }
        ));
    }

    #[test]
    fn scalar_operand_with_off_device_gradient_uses_scratch() {
        let mut g: ExprGraph<f64> = ExprGraph::new();
        let kernels = g.kernels();
        let s = g.variable(Value::Scalar(2.0)).unwrap();
        let t = g
            .variable(Value::Tensor(
                Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3])
                    .unwrap()
                    .to_device(Device::Accel(0)),
            ))
            .unwrap();
        let z = g
            .apply_op(
                Box::new(TensorBinOp::new(BinOpKind::HadamardProd, false, kernels)),
                &[s, t],
            )
            .unwrap();
        let ctx = HostContext::new();
        numeric_backprop(&ctx, &mut g, z).unwrap();

        // ds = sum(t) through the broadcast scratch, dt = s everywhere
        assert_relative_eq!(deriv_scalar(&g, s), 6.0);
        assert_eq!(
            g.deriv(t)
                .unwrap()
                .unwrap()
                .as_tensor()
                .unwrap()
                .data()
                .as_slice()
                .unwrap(),
            &[2.0, 2.0, 2.0]
        );
        // the scratch buffer was released back to the context and the
        // device scheduler was signalled
        assert_eq!(ctx.pooled(), 1);
        assert!(ctx.signal_count() >= 1);
    }

    #[test]
    fn comparison_output_cannot_seed_backprop() {
        // a boolean output has no "ones" gradient to seed with
        let (mut g, _, _, z) = scalar_graph(BinOpKind::Lt, 1.0, 2.0);
        let ctx = HostContext::new();
        let err = numeric_backprop(&ctx, &mut g, z).unwrap_err();
        assert!(matches!(
            err,
            GradixError::NotYetImplemented { is_type_error: true, .. }
        ));
    }
}
