// src/diff/symbolic.rs
// Symbolic differentiation: gradient expressions are built by appending
// further operator applications to the graph. No numeric work happens
// here; evaluation of the gradient nodes goes through the ordinary forward
// machinery.

use log::{debug, trace};

use crate::backend::{GradixF, GradixN};
use crate::error::{GradixError, Result};
use crate::graph::{ExprGraph, NodeId};
use crate::ops::{BinOpKind, LnOp, NegOp, ScalarBinOp, TensorBinOp};
use crate::tensor::Tensor;
use crate::value::Value;

const GRAD_GROUP: &str = "gradients";

/// Applies a binary kind to two existing nodes, picking the scalar or
/// tensor dispatcher from their shapes. Gradient construction funnels every
/// application through here.
pub fn apply_bin<T: GradixF>(
    g: &mut ExprGraph<T>,
    kind: BinOpKind,
    a: NodeId,
    b: NodeId,
) -> Result<NodeId> {
    let a_scalar = node_is_scalar(g, a)?;
    let b_scalar = node_is_scalar(g, b)?;
    let id = if a_scalar && b_scalar {
        g.apply_op(Box::new(ScalarBinOp::new(kind)), &[a, b])?
    } else {
        let kernels = g.kernels();
        g.apply_op(Box::new(TensorBinOp::new(kind, !a_scalar, kernels)), &[a, b])?
    };
    if let Some(node) = g.node_mut(id) {
        node.set_group(GRAD_GROUP);
    }
    Ok(id)
}

fn node_is_scalar<T: GradixF>(g: &ExprGraph<T>, id: NodeId) -> Result<bool> {
    Ok(g.node(id)
        .and_then(|n| n.shape())
        .ok_or(GradixError::Unbound {
            id: id.0,
            what: "shape",
        })?
        .is_empty())
}

fn apply_neg<T: GradixF>(g: &mut ExprGraph<T>, a: NodeId) -> Result<NodeId> {
    let id = g.apply_op(Box::new(NegOp::<T>::new()), &[a])?;
    if let Some(node) = g.node_mut(id) {
        node.set_group(GRAD_GROUP);
    }
    Ok(id)
}

/// Gradient rules for the binary kinds. Returns one entry per input;
/// `None` marks a branch skipped because the operand is constant.
/// Comparison kinds are not differentiable.
pub fn sym_diff_bin<T: GradixF>(
    kind: BinOpKind,
    g: &mut ExprGraph<T>,
    inputs: &[NodeId],
    output: NodeId,
    grad: NodeId,
) -> Result<Vec<Option<NodeId>>> {
    let (x, y) = (inputs[0], inputs[1]);
    let z = output;
    let gz = grad;
    let x_const = g.node(x).map(|n| n.is_constant()).unwrap_or(false);
    let y_const = g.node(y).map(|n| n.is_constant()).unwrap_or(false);

    match kind {
        // dz/dx = dz/dy = gz
        BinOpKind::Add => Ok(vec![Some(gz), Some(gz)]),

        // dz/dx = gz; dz/dy = -gz
        BinOpKind::Sub => {
            let dy = apply_neg(g, gz)?;
            Ok(vec![Some(gz), Some(dy)])
        }

        // dz/dx = y ⊙ gz; dz/dy = x ⊙ gz; constant factors are skipped
        BinOpKind::HadamardProd => {
            let dx = if x_const {
                None
            } else {
                Some(apply_bin(g, BinOpKind::HadamardProd, y, gz)?)
            };
            let dy = if y_const {
                None
            } else {
                Some(apply_bin(g, BinOpKind::HadamardProd, x, gz)?)
            };
            Ok(vec![dx, dy])
        }

        // dz/dx = gz / y; dz/dy = -(z/y) ⊙ gz
        BinOpKind::HadamardDiv => {
            let dx = apply_bin(g, BinOpKind::HadamardDiv, gz, y)?;
            let zy = apply_bin(g, BinOpKind::HadamardDiv, z, y)?;
            let nzy = apply_neg(g, zy)?;
            let dy = apply_bin(g, BinOpKind::HadamardProd, nzy, gz)?;
            Ok(vec![Some(dx), Some(dy)])
        }

        // dz/dx = gz ⊙ y ⊙ x^(y-1); dz/dy = gz ⊙ z ⊙ ln(x)
        BinOpKind::HadamardPow => {
            let one = g.constant(Value::Scalar(<T as GradixN>::one()))?;
            let ym1 = apply_bin(g, BinOpKind::Sub, y, one)?;
            let xym1 = apply_bin(g, BinOpKind::HadamardPow, x, ym1)?;
            let t = apply_bin(g, BinOpKind::HadamardProd, y, xym1)?;
            let dx = apply_bin(g, BinOpKind::HadamardProd, gz, t)?;

            let lnx = g.apply_op(Box::new(LnOp::<T>::new()), &[x])?;
            let t2 = apply_bin(g, BinOpKind::HadamardProd, z, lnx)?;
            let dy = apply_bin(g, BinOpKind::HadamardProd, gz, t2)?;
            Ok(vec![Some(dx), Some(dy)])
        }

        other => Err(GradixError::AutoDiffUnsupported {
            op: other.to_string(),
        }),
    }
}

/// Reverse-mode symbolic backprop. Seeds the output with a ones gradient
/// node, walks consumers before operands, and merges multiple contributions
/// into one accumulator node per operand through the `deriv` back-reference.
/// Returns the gradient node for each `wrt` entry (`None` when no gradient
/// flows into it).
pub fn backprop<T: GradixF>(
    g: &mut ExprGraph<T>,
    output: NodeId,
    wrt: &[NodeId],
) -> Result<Vec<Option<NodeId>>> {
    let shape = g
        .node(output)
        .and_then(|n| n.shape().map(<[usize]>::to_vec))
        .ok_or(GradixError::Unbound {
            id: output.0,
            what: "shape",
        })?;
    let seed = if shape.is_empty() {
        Value::Scalar(<T as GradixN>::one())
    } else {
        Value::Tensor(Tensor::ones(&shape))
    };
    // the walk list is fixed before any gradient nodes extend the graph
    let order = g.sorted_from(output);

    let gz = g.variable(seed)?;
    if let Some(node) = g.node_mut(gz) {
        node.set_name(format!("grad({output})"));
        node.set_group(GRAD_GROUP);
    }
    if let Some(node) = g.node_mut(output) {
        node.set_deriv_node(gz);
    }
    debug!("symbolic backprop from {} over {} node(s)", output, order.len());

    for id in order {
        let (is_leaf, deriv) = match g.node(id) {
            Some(node) => (node.is_leaf(), node.deriv_node()),
            None => continue,
        };
        if is_leaf {
            continue;
        }
        let Some(deriv) = deriv else {
            // nothing flows into this node (all consumers skipped it)
            trace!("no gradient reaches {}", id);
            continue;
        };
        let op = match g.node(id).and_then(|n| n.op()) {
            Some(op) => op.clone_op(),
            None => continue,
        };
        let sym = op
            .sym_diff_op()
            .ok_or_else(|| GradixError::AutoDiffUnsupported { op: op.name() })?;
        let inputs = g.operands(id);
        let partials = sym.sym_diff(g, &inputs, id, deriv)?;

        for (input, partial) in inputs.into_iter().zip(partials) {
            let Some(partial) = partial else { continue };
            if g.node(input).map(|n| n.is_constant()).unwrap_or(false) {
                continue;
            }
            let merged = match g.node(input).and_then(|n| n.deriv_node()) {
                Some(existing) => apply_bin(g, BinOpKind::Add, existing, partial)?,
                None => partial,
            };
            if let Some(node) = g.node_mut(input) {
                node.set_deriv_node(merged);
            }
        }
    }

    Ok(wrt
        .iter()
        .map(|&id| g.node(id).and_then(|n| n.deriv_node()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn grad_value(g: &ExprGraph<f64>, id: Option<NodeId>) -> f64 {
        g.value(id.unwrap()).unwrap().as_scalar().unwrap()
    }

    #[test]
    fn add_gradients_are_the_upstream() {
        let (mut g, x, y, z) = scalar_graph(BinOpKind::Add, 2.0, 3.0);
        assert_eq!(g.value(z).unwrap().as_scalar(), Some(5.0));
        let grads = backprop(&mut g, z, &[x, y]).unwrap();
        assert_relative_eq!(grad_value(&g, grads[0]), 1.0);
        assert_relative_eq!(grad_value(&g, grads[1]), 1.0);
    }

    #[test]
    fn sub_negates_second_gradient() {
        let (mut g, x, y, z) = scalar_graph(BinOpKind::Sub, 5.0, 2.0);
        assert_eq!(g.value(z).unwrap().as_scalar(), Some(3.0));
        let grads = backprop(&mut g, z, &[x, y]).unwrap();
        assert_relative_eq!(grad_value(&g, grads[0]), 1.0);
        assert_relative_eq!(grad_value(&g, grads[1]), -1.0);
    }

    #[test]
    fn prod_swaps_factors() {
        let (mut g, x, y, z) = scalar_graph(BinOpKind::HadamardProd, 2.0, 3.0);
        let grads = backprop(&mut g, z, &[x, y]).unwrap();
        assert_relative_eq!(grad_value(&g, grads[0]), 3.0);
        assert_relative_eq!(grad_value(&g, grads[1]), 2.0);
    }

    #[test]
    fn div_gradients() {
        let (mut g, x, y, z) = scalar_graph(BinOpKind::HadamardDiv, 6.0, 2.0);
        let grads = backprop(&mut g, z, &[x, y]).unwrap();
        // dz/dx = 1/y, dz/dy = -(z/y) = -x/y^2
        assert_relative_eq!(grad_value(&g, grads[0]), 0.5);
        assert_relative_eq!(grad_value(&g, grads[1]), -1.5);
    }

    #[test]
    fn pow_gradients() {
        let (mut g, x, y, z) = scalar_graph(BinOpKind::HadamardPow, 2.0, 3.0);
        assert_eq!(g.value(z).unwrap().as_scalar(), Some(8.0));
        let grads = backprop(&mut g, z, &[x, y]).unwrap();
        assert_relative_eq!(grad_value(&g, grads[0]), 12.0);
        assert_relative_eq!(grad_value(&g, grads[1]), 8.0 * 2.0_f64.ln());
    }

    #[test]
    fn constant_prod_factor_is_skipped() {
        let mut g: ExprGraph<f64> = ExprGraph::new();
        let x = g.variable(Value::Scalar(2.0)).unwrap();
        let c = g.constant(Value::Scalar(10.0)).unwrap();
        let z = g
            .apply_op(Box::new(ScalarBinOp::new(BinOpKind::HadamardProd)), &[x, c])
            .unwrap();
        let grads = backprop(&mut g, z, &[x, c]).unwrap();
        assert_relative_eq!(grad_value(&g, grads[0]), 10.0);
        assert!(grads[1].is_none());
    }

    #[test]
    fn fan_out_contributions_are_merged() {
        // z = x*x: dz/dx = 2x
        let mut g: ExprGraph<f64> = ExprGraph::new();
        let x = g.variable(Value::Scalar(3.0)).unwrap();
        let z = g
            .apply_op(Box::new(ScalarBinOp::new(BinOpKind::HadamardProd)), &[x, x])
            .unwrap();
        let grads = backprop(&mut g, z, &[x]).unwrap();
        assert_relative_eq!(grad_value(&g, grads[0]), 6.0);
    }

    #[test]
    fn comparison_output_refuses_symbolic_diff() {
        let (mut g, _, _, z) = scalar_graph(BinOpKind::Lt, 1.0, 2.0);
        let x = g.operands(z)[0];
        let err = backprop(&mut g, z, &[x]).unwrap_err();
        assert!(matches!(err, GradixError::AutoDiffUnsupported { .. }));
    }

    #[test]
    fn vector_prod_gradients() {
        let mut g: ExprGraph<f64> = ExprGraph::new();
        let kernels = g.kernels();
        let x = g
            .variable(Value::Tensor(
                Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap(),
            ))
            .unwrap();
        let y = g
            .variable(Value::Tensor(
                Tensor::from_vec(vec![4.0, 5.0, 6.0], &[3]).unwrap(),
            ))
            .unwrap();
        let z = g
            .apply_op(
                Box::new(TensorBinOp::new(BinOpKind::HadamardProd, true, kernels)),
                &[x, y],
            )
            .unwrap();
        let grads = backprop(&mut g, z, &[x, y]).unwrap();
        let dx = g.value(grads[0].unwrap()).unwrap();
        let dy = g.value(grads[1].unwrap()).unwrap();
        assert_eq!(
            dx.as_tensor().unwrap().data().as_slice().unwrap(),
            &[4.0, 5.0, 6.0]
        );
        assert_eq!(
            dy.as_tensor().unwrap().data().as_slice().unwrap(),
            &[1.0, 2.0, 3.0]
        );
    }
}
