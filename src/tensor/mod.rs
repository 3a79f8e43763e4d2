// src/tensor/mod.rs
// Narrow dense-array collaborator. The graph and the differentiation engine
// only ever need: construction with a dtype/shape, elementwise kernels keyed
// by a caller-supplied function, in-place accumulation, and a stable
// provenance id so a value seen twice maps to the same leaf node.

use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::backend::{Device, GradixN};
use crate::error::{GradixError, Result};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

fn fresh_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Dense n-dimensional array with a device tag and a provenance id.
///
/// The provenance id is assigned once at construction and survives `clone`,
/// which is what lets the graph's value cache recognize "the same value,
/// handed in again" without pointer identity.
#[derive(Debug, Clone)]
pub struct Tensor<T> {
    data: ArrayD<T>,
    device: Device,
    uid: u64,
}

impl<T> PartialEq for Tensor<T>
where
    T: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.device == other.device
    }
}

impl<T: GradixN> Tensor<T> {
    pub fn new(data: ArrayD<T>) -> Self {
        Self::new_on(data, Device::Cpu)
    }

    pub fn new_on(data: ArrayD<T>, device: Device) -> Self {
        Self {
            data,
            device,
            uid: fresh_uid(),
        }
    }

    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(GradixError::InvalidInput {
                op: "Tensor::from_vec".to_string(),
                msg: format!("{} element(s) for shape {:?}", data.len(), shape),
            });
        }
        let arr = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|e| {
            GradixError::InvalidInput {
                op: "Tensor::from_vec".to_string(),
                msg: e.to_string(),
            }
        })?;
        Ok(Self::new(arr))
    }

    /// Materializes a tensor from a memory block already owned by `device`.
    pub fn from_mem(data: Vec<T>, shape: &[usize], device: Device) -> Result<Self> {
        let mut t = Self::from_vec(data, shape)?;
        t.device = device;
        Ok(t)
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::zeros_on(shape, Device::Cpu)
    }

    pub fn zeros_on(shape: &[usize], device: Device) -> Self {
        Self::new_on(
            ArrayD::from_elem(IxDyn(shape), <T as GradixN>::zero()),
            device,
        )
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, <T as GradixN>::one())
    }

    pub fn full(shape: &[usize], fill: T) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(shape), fill))
    }

    /// Standard-normal random tensor, for test fixtures and model init.
    pub fn randn(shape: &[usize]) -> Self
    where
        StandardNormal: Distribution<T>,
    {
        let mut rng = rand::rng();
        Self::new(ArrayD::from_shape_simple_fn(IxDyn(shape), || {
            rng.sample(StandardNormal)
        }))
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Total element count.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn data(&self) -> &ArrayD<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<T> {
        &mut self.data
    }

    /// Retags the tensor as owned by another device. Host memory is the
    /// only real backing store, so this is a marker move, not a copy.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.data.get(IxDyn(index)).copied()
    }

    /// Sum of all elements; the reduce half of scalar-operand broadcasting.
    pub fn sum(&self) -> T {
        self.data.iter().copied().sum()
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn zero_fill(&mut self) {
        self.fill(<T as GradixN>::zero());
    }

    pub fn reshaped(self, shape: &[usize]) -> Result<Self> {
        let old: Vec<usize> = self.shape().to_vec();
        let Tensor { data, device, uid } = self;
        let data = data.into_shape_with_order(IxDyn(shape)).map_err(|_| {
            GradixError::ShapeMismatch {
                op: "Tensor::reshaped".to_string(),
                left: old,
                right: shape.to_vec(),
            }
        })?;
        Ok(Self { data, device, uid })
    }

    pub fn map(&self, f: impl Fn(T) -> T) -> Self {
        Self::new_on(self.data.mapv(f), self.device)
    }

    /// Elementwise combine with another tensor of identical shape.
    pub fn zip_with(&self, other: &Self, f: fn(T, T) -> T) -> Result<Self> {
        self.check_same_shape("Tensor::zip_with", other)?;
        let mut out = self.data.clone();
        out.zip_mut_with(&other.data, |a, &b| *a = f(*a, b));
        Ok(Self::new_on(out, self.device))
    }

    /// Elementwise combine with a scalar companion. `scalar_left` says which
    /// side of `f` the scalar sits on.
    pub fn zip_scalar(&self, scalar: T, scalar_left: bool, f: fn(T, T) -> T) -> Self {
        let out = if scalar_left {
            self.data.mapv(|a| f(scalar, a))
        } else {
            self.data.mapv(|a| f(a, scalar))
        };
        Self::new_on(out, self.device)
    }

    /// Elementwise comparison against another tensor of identical shape.
    pub fn zip_compare(&self, other: &Self, f: fn(T, T) -> bool) -> Result<ArrayD<bool>> {
        self.check_same_shape("Tensor::zip_compare", other)?;
        let flat: Vec<bool> = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        ArrayD::from_shape_vec(self.data.raw_dim(), flat).map_err(|e| {
            GradixError::InvalidInput {
                op: "Tensor::zip_compare".to_string(),
                msg: e.to_string(),
            }
        })
    }

    /// Elementwise comparison against a scalar companion.
    pub fn zip_scalar_compare(&self, scalar: T, scalar_left: bool, f: fn(T, T) -> bool) -> ArrayD<bool> {
        if scalar_left {
            self.data.mapv(|a| f(scalar, a))
        } else {
            self.data.mapv(|a| f(a, scalar))
        }
    }

    /// Accumulates `other` into `self`. This is the buffer-level primitive
    /// behind increment-accumulate dispatch.
    pub fn add_assign_tensor(&mut self, other: &Self) -> Result<()> {
        self.check_same_shape("Tensor::add_assign_tensor", other)?;
        self.data.zip_mut_with(&other.data, |a, &b| *a += b);
        Ok(())
    }

    fn check_same_shape(&self, op: &str, other: &Self) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(GradixError::ShapeMismatch {
                op: op.to_string(),
                left: self.shape().to_vec(),
                right: other.shape().to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec3(data: [f64; 3]) -> Tensor<f64> {
        Tensor::from_vec(data.to_vec(), &[3]).unwrap()
    }

    #[test]
    fn uid_survives_clone_but_not_reconstruction() {
        let a = vec3([1.0, 2.0, 3.0]);
        let b = a.clone();
        let c = vec3([1.0, 2.0, 3.0]);
        assert_eq!(a.uid(), b.uid());
        assert_ne!(a.uid(), c.uid());
    }

    #[test]
    fn from_mem_keeps_the_owning_device() {
        let t = Tensor::from_mem(vec![1.0, 2.0], &[2], Device::Accel(1)).unwrap();
        assert_eq!(t.device(), Device::Accel(1));
        assert_eq!(t.data().as_slice().unwrap(), &[1.0, 2.0]);
        assert!(Tensor::from_mem(vec![1.0], &[3], Device::Cpu).is_err());
    }

    #[test]
    fn zip_with_requires_matching_shapes() {
        let a = vec3([1.0, 2.0, 3.0]);
        let b = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let err = a.zip_with(&b, |x, y| x + y).unwrap_err();
        assert!(matches!(err, GradixError::ShapeMismatch { .. }));
    }

    #[test]
    fn zip_scalar_respects_operand_side() {
        let a = vec3([1.0, 2.0, 4.0]);
        let left = a.zip_scalar(8.0, true, |x, y| x / y);
        let right = a.zip_scalar(8.0, false, |x, y| x / y);
        assert_eq!(left.data().as_slice().unwrap(), &[8.0, 4.0, 2.0]);
        assert_eq!(right.data().as_slice().unwrap(), &[0.125, 0.25, 0.5]);
    }

    #[test]
    fn add_assign_accumulates() {
        let mut acc = Tensor::<f64>::zeros(&[3]);
        acc.add_assign_tensor(&vec3([1.0, 2.0, 3.0])).unwrap();
        acc.add_assign_tensor(&vec3([0.5, 0.5, 0.5])).unwrap();
        assert_eq!(acc.data().as_slice().unwrap(), &[1.5, 2.5, 3.5]);
    }

    #[test]
    fn reshape_preserves_uid() {
        let a = Tensor::<f64>::zeros(&[2, 3]);
        let uid = a.uid();
        let b = a.reshaped(&[6]).unwrap();
        assert_eq!(b.uid(), uid);
        assert_eq!(b.shape(), &[6]);
    }

    #[test]
    fn randn_has_requested_shape() {
        let t = Tensor::<f64>::randn(&[4, 2]);
        assert_eq!(t.shape(), &[4, 2]);
        assert_eq!(t.size(), 8);
    }
}
