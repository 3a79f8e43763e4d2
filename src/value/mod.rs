// src/value/mod.rs

pub mod pool;

pub use pool::DualValuePool;

use ndarray::ArrayD;

use crate::backend::{Device, GradixN};
use crate::error::{GradixError, Result};
use crate::tensor::Tensor;

/// Algebraic type of a value, as seen by the graph's type checker. The
/// element type `T` is fixed per graph, so only the numeric/boolean split
/// needs tracking: comparison operators produce `Bool` outputs unless the
/// dispatcher forces same-type results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Numeric,
    Bool,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::Numeric => write!(f, "numeric"),
            DType::Bool => write!(f, "bool"),
        }
    }
}

/// A value a graph node can bind: a scalar, a dense tensor, or the boolean
/// forms comparison operators produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<T> {
    Scalar(T),
    Tensor(Tensor<T>),
    Bool(bool),
    Mask(ArrayD<bool>),
}

impl<T: GradixN> Value<T> {
    pub fn dtype(&self) -> DType {
        match self {
            Value::Scalar(_) | Value::Tensor(_) => DType::Numeric,
            Value::Bool(_) | Value::Mask(_) => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Scalar(_) | Value::Bool(_) => &[],
            Value::Tensor(t) => t.shape(),
            Value::Mask(m) => m.shape(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Scalar(_) | Value::Bool(_))
    }

    pub fn size(&self) -> usize {
        match self {
            Value::Scalar(_) | Value::Bool(_) => 1,
            Value::Tensor(t) => t.size(),
            Value::Mask(m) => m.len(),
        }
    }

    /// The device owning this value's memory. Scalars live in host memory.
    pub fn device(&self) -> Device {
        match self {
            Value::Tensor(t) => t.device(),
            _ => Device::Cpu,
        }
    }

    /// A zeroed value of this value's dtype and shape. Gradient accumulators
    /// start from this.
    pub fn zero_like(&self) -> Value<T> {
        match self {
            Value::Scalar(_) => Value::Scalar(<T as GradixN>::zero()),
            Value::Tensor(t) => Value::Tensor(Tensor::zeros_on(t.shape(), t.device())),
            Value::Bool(_) => Value::Bool(false),
            Value::Mask(m) => Value::Mask(ArrayD::from_elem(m.raw_dim(), false)),
        }
    }

    /// The numeric constant `c` shaped like this value. This is how "the one
    /// in the operand's concrete dtype" is resolved for the power rule.
    pub fn same_type_const(&self, c: T) -> Result<Value<T>> {
        match self {
            Value::Scalar(_) => Ok(Value::Scalar(c)),
            Value::Tensor(t) => Ok(Value::Tensor(Tensor::full(t.shape(), c).to_device(t.device()))),
            _ => Err(GradixError::nyi(
                "same_type_const",
                format!("{}", self.dtype()),
                true,
            )),
        }
    }

    pub fn one_like(&self) -> Result<Value<T>> {
        self.same_type_const(<T as GradixN>::one())
    }

    pub fn as_scalar(&self) -> Option<T> {
        match self {
            Value::Scalar(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor<T>> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_tensor_mut(&mut self) -> Option<&mut Tensor<T>> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Scalar extraction with the standard "wrong type for this action"
    /// report when the value is anything else.
    pub fn try_scalar(&self, op: &str) -> Result<T> {
        self.as_scalar()
            .ok_or_else(|| GradixError::nyi(op, format!("{}", self.dtype()), true))
    }

    pub fn try_tensor(&self, op: &str) -> Result<&Tensor<T>> {
        self.as_tensor()
            .ok_or_else(|| GradixError::nyi(op, format!("{}", self.dtype()), true))
    }

    pub fn zero_fill(&mut self) {
        match self {
            Value::Scalar(s) => *s = <T as GradixN>::zero(),
            Value::Tensor(t) => t.zero_fill(),
            Value::Bool(b) => *b = false,
            Value::Mask(m) => m.fill(false),
        }
    }

    pub fn reshaped(self, shape: &[usize]) -> Result<Value<T>> {
        match self {
            Value::Tensor(t) => Ok(Value::Tensor(t.reshaped(shape)?)),
            other if shape.is_empty() => Ok(other),
            other => Err(GradixError::ShapeMismatch {
                op: "Value::reshaped".to_string(),
                left: other.shape().to_vec(),
                right: shape.to_vec(),
            }),
        }
    }
}

/// A primal value paired with its gradient accumulator. Owned by exactly
/// one node; the accumulator is created lazily on first differentiation
/// demand and must match the primal's dtype and shape.
#[derive(Debug, Clone, Default)]
pub struct DualValue<T> {
    value: Option<Value<T>>,
    deriv: Option<Value<T>>,
}

impl<T: GradixN> DualValue<T> {
    pub fn new(value: Value<T>) -> Self {
        Self {
            value: Some(value),
            deriv: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            value: None,
            deriv: None,
        }
    }

    pub fn value(&self) -> Option<&Value<T>> {
        self.value.as_ref()
    }

    pub fn deriv(&self) -> Option<&Value<T>> {
        self.deriv.as_ref()
    }

    pub fn set_value(&mut self, value: Value<T>) {
        self.value = Some(value);
    }

    pub fn set_deriv(&mut self, deriv: Value<T>) {
        self.deriv = Some(deriv);
    }

    pub fn has_deriv(&self) -> bool {
        self.deriv.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.value.is_some()
    }

    /// Lazily allocates a zeroed derivative accumulator sized from the
    /// primal. Allocation must happen-before any accumulation into it.
    pub fn bind_for(&mut self) -> Result<&mut Value<T>> {
        if self.deriv.is_none() {
            let zero = self
                .value
                .as_ref()
                .ok_or(GradixError::Unbound {
                    id: 0,
                    what: "value",
                })?
                .zero_like();
            self.deriv = Some(zero);
        }
        // just ensured above
        Ok(self.deriv.as_mut().unwrap())
    }

    /// Takes both slots out of the record, leaving it unbound. A pooled
    /// record must pass through this before it can be handed to another
    /// borrower; the caller owns returning the buffers to their allocator.
    pub fn release(&mut self) -> impl Iterator<Item = Value<T>> {
        self.value.take().into_iter().chain(self.deriv.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_of_each_form() {
        let s: Value<f64> = Value::Scalar(1.0);
        let t: Value<f64> = Value::Tensor(Tensor::zeros(&[2]));
        let b: Value<f64> = Value::Bool(true);
        assert_eq!(s.dtype(), DType::Numeric);
        assert_eq!(t.dtype(), DType::Numeric);
        assert_eq!(b.dtype(), DType::Bool);
    }

    #[test]
    fn same_type_const_matches_shape() {
        let t: Value<f64> = Value::Tensor(Tensor::zeros(&[2, 2]));
        let one = t.one_like().unwrap();
        assert_eq!(one.shape(), &[2, 2]);
        assert_eq!(one.as_tensor().unwrap().get(&[1, 1]), Some(1.0));

        let s: Value<f64> = Value::Scalar(3.0);
        assert_eq!(s.one_like().unwrap().as_scalar(), Some(1.0));
    }

    #[test]
    fn same_type_const_rejects_bool() {
        let b: Value<f64> = Value::Bool(true);
        assert!(matches!(
            b.one_like().unwrap_err(),
            GradixError::NotYetImplemented { is_type_error: true, .. }
        ));
    }

    #[test]
    fn bind_for_allocates_zeroed_deriv_once() {
        let mut dual = DualValue::new(Value::Tensor(Tensor::<f64>::ones(&[3])));
        dual.bind_for().unwrap();
        assert_eq!(
            dual.deriv().unwrap().as_tensor().unwrap().sum(),
            0.0
        );
        // rebinding does not reset an accumulated deriv
        dual.set_deriv(Value::Tensor(Tensor::ones(&[3])));
        dual.bind_for().unwrap();
        assert_eq!(dual.deriv().unwrap().as_tensor().unwrap().sum(), 3.0);
    }

    #[test]
    fn bind_for_without_primal_is_an_error() {
        let mut dual: DualValue<f64> = DualValue::empty();
        assert!(matches!(
            dual.bind_for().unwrap_err(),
            GradixError::Unbound { .. }
        ));
    }
}
