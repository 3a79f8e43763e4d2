// src/graph/node.rs

use crate::backend::{Device, GradixF};
use crate::error::{GradixError, Result};
use crate::ops::Operator;
use crate::value::{DType, DualValue, Value};

/// Graph-scoped node identity. Issued monotonically by the owning
/// `ExprGraph` and never reused while the node is reachable; ids from
/// different graphs are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// What a node currently carries: nothing, a plain forward value, or a
/// dual value once the node participates in differentiation.
#[derive(Debug)]
pub enum Binding<T> {
    Unbound,
    Plain(Value<T>),
    Dual(DualValue<T>),
}

/// A vertex in the expression graph: one value, or one operator's output.
#[derive(Debug)]
pub struct Node<T>
where
    T: GradixF,
{
    id: NodeId,
    op: Option<Box<dyn Operator<T>>>,
    // operand list in declaration order; duplicated operands (x*x) cannot
    // be reconstructed from the edge set alone
    inputs: Vec<NodeId>,
    dtype: Option<DType>,
    shape: Option<Vec<usize>>,
    bound: Binding<T>,
    device: Device,
    constant: bool,
    /// Back-reference to this node's gradient node, set during symbolic
    /// backprop so revisits merge into one accumulator.
    deriv: Option<NodeId>,
    name: String,
    group: String,
}

impl<T> Node<T>
where
    T: GradixF,
{
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            op: None,
            inputs: Vec::new(),
            dtype: None,
            shape: None,
            bound: Binding::Unbound,
            device: Device::Cpu,
            constant: false,
            deriv: None,
            name: String::new(),
            group: String::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_leaf(&self) -> bool {
        self.op.is_none()
    }

    pub fn op(&self) -> Option<&dyn Operator<T>> {
        self.op.as_deref()
    }

    pub(crate) fn set_op(&mut self, op: Box<dyn Operator<T>>) {
        self.op = Some(op);
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub(crate) fn set_inputs(&mut self, inputs: Vec<NodeId>) {
        self.inputs = inputs;
    }

    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }

    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub(crate) fn set_constant(&mut self, constant: bool) {
        self.constant = constant;
    }

    pub fn deriv_node(&self) -> Option<NodeId> {
        self.deriv
    }

    pub(crate) fn set_deriv_node(&mut self, deriv: NodeId) {
        self.deriv = Some(deriv);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn set_group(&mut self, group: impl Into<String>) {
        self.group = group.into();
    }

    /// Assigns dtype, shape and device from a value and binds it. Once
    /// assigned from a bound value, dtype and shape never change; binding a
    /// value that disagrees is rejected.
    pub fn apply_data(&mut self, value: Value<T>) -> Result<()> {
        let dtype = value.dtype();
        let shape = value.shape().to_vec();
        if let Some(existing) = self.dtype {
            if existing != dtype {
                return Err(GradixError::TypeMismatch {
                    op: "Node::apply_data".to_string(),
                    left: existing,
                    right: dtype,
                });
            }
        }
        if let Some(ref existing) = self.shape {
            if existing != &shape {
                return Err(GradixError::ShapeMismatch {
                    op: "Node::apply_data".to_string(),
                    left: existing.clone(),
                    right: shape,
                });
            }
        }
        self.dtype = Some(dtype);
        self.shape = Some(shape);
        self.device = value.device();
        self.bound = match std::mem::replace(&mut self.bound, Binding::Unbound) {
            Binding::Dual(mut dual) => {
                dual.set_value(value);
                Binding::Dual(dual)
            }
            _ => Binding::Plain(value),
        };
        Ok(())
    }

    /// Records inferred dtype and shape for a node that has no bound value
    /// yet. Later `apply_data` calls must agree with them.
    pub(crate) fn set_type_shape(&mut self, dtype: DType, shape: Vec<usize>) {
        self.dtype = Some(dtype);
        self.shape = Some(shape);
    }

    pub fn is_bound(&self) -> bool {
        match &self.bound {
            Binding::Unbound => false,
            Binding::Plain(_) => true,
            Binding::Dual(dual) => dual.is_bound(),
        }
    }

    pub fn value(&self) -> Result<&Value<T>> {
        match &self.bound {
            Binding::Plain(v) => Ok(v),
            Binding::Dual(dual) => dual.value().ok_or(GradixError::Unbound {
                id: self.id.0,
                what: "value",
            }),
            Binding::Unbound => Err(GradixError::Unbound {
                id: self.id.0,
                what: "value",
            }),
        }
    }

    /// Promotes the binding to a dual value so the node can accumulate a
    /// derivative. Idempotent; fails when the node carries no value at all.
    pub fn bind_dual(&mut self) -> Result<&mut DualValue<T>> {
        match &mut self.bound {
            Binding::Dual(_) => {}
            Binding::Plain(_) => {
                let value = match std::mem::replace(&mut self.bound, Binding::Unbound) {
                    Binding::Plain(v) => v,
                    _ => unreachable!(),
                };
                self.bound = Binding::Dual(DualValue::new(value));
            }
            Binding::Unbound => {
                return Err(GradixError::Unbound {
                    id: self.id.0,
                    what: "value",
                })
            }
        }
        match &mut self.bound {
            Binding::Dual(dual) => Ok(dual),
            _ => unreachable!(),
        }
    }

    pub fn dual(&self) -> Result<&DualValue<T>> {
        match &self.bound {
            Binding::Dual(dual) => Ok(dual),
            _ => Err(GradixError::Unbound {
                id: self.id.0,
                what: "dual value",
            }),
        }
    }

    pub fn dual_mut(&mut self) -> Result<&mut DualValue<T>> {
        match &mut self.bound {
            Binding::Dual(dual) => Ok(dual),
            _ => Err(GradixError::Unbound {
                id: self.id.0,
                what: "dual value",
            }),
        }
    }

    /// Releases the node's dual value into a pool record, leaving the node
    /// unbound.
    pub fn take_dual(&mut self) -> Option<DualValue<T>> {
        match std::mem::replace(&mut self.bound, Binding::Unbound) {
            Binding::Dual(dual) => Some(dual),
            other => {
                self.bound = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn apply_data_freezes_shape_and_dtype() {
        let mut node: Node<f64> = Node::new(NodeId(0));
        node.apply_data(Value::Tensor(Tensor::zeros(&[2, 2]))).unwrap();
        assert_eq!(node.shape(), Some(&[2, 2][..]));
        assert_eq!(node.dtype(), Some(DType::Numeric));

        let err = node
            .apply_data(Value::Tensor(Tensor::zeros(&[3])))
            .unwrap_err();
        assert!(matches!(err, GradixError::ShapeMismatch { .. }));

        let err = node.apply_data(Value::Bool(true)).unwrap_err();
        assert!(matches!(err, GradixError::TypeMismatch { .. }));
    }

    #[test]
    fn bind_dual_preserves_value() {
        let mut node: Node<f64> = Node::new(NodeId(1));
        node.apply_data(Value::Scalar(2.5)).unwrap();
        node.bind_dual().unwrap();
        assert_eq!(node.value().unwrap().as_scalar(), Some(2.5));
        // rebinding data keeps the dual form
        node.apply_data(Value::Scalar(3.5)).unwrap();
        assert!(node.dual().is_ok());
        assert_eq!(node.value().unwrap().as_scalar(), Some(3.5));
    }

    #[test]
    fn unbound_node_reports_unbound() {
        let node: Node<f64> = Node::new(NodeId(2));
        assert!(matches!(
            node.value().unwrap_err(),
            GradixError::Unbound { id: 2, what: "value" }
        ));
    }
}
