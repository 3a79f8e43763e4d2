// src/ops/nn.rs
// Convolution-adjacent operators. These follow the same contract as the
// binary dispatchers but carry execution state: max-pooling records an
// argmax mask during the forward pass, batch normalization keeps running
// statistics and scratch sized from the first input it sees. Shared state
// sits behind an Rc so a cloned op (graph clones operators on application)
// still observes the forward pass results; the engine is single-threaded
// per traversal, which is what makes RefCell adequate here.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

use ndarray::ArrayD;

use crate::backend::{DeviceContext, GradixF, GradixN};
use crate::error::{GradixError, Result};
use crate::graph::{ExprGraph, NodeId};
use crate::ops::tensor::write_into;
use crate::ops::{check_arity, NumDiffOp, Operator, PreallocDoer, SymDiffOp};
use crate::tensor::Tensor;
use crate::value::{DType, Value};

/// Output spatial extent of a convolution-style sliding window.
/// `floor((in + 2*pad - (dilation*(kernel-1)+1)) / stride) + 1`
pub fn conv_out_size(
    input: usize,
    kernel: usize,
    pad: usize,
    stride: usize,
    dilation: usize,
) -> Result<usize> {
    if kernel == 0 || stride == 0 {
        return Err(GradixError::InvalidInput {
            op: "conv_out_size".to_string(),
            msg: format!("kernel {kernel} and stride {stride} must be nonzero"),
        });
    }
    let effective = (dilation * (kernel - 1) + 1) as isize;
    let span = input as isize + 2 * pad as isize - effective;
    if span < 0 {
        return Err(GradixError::InvalidInput {
            op: "conv_out_size".to_string(),
            msg: format!(
                "kernel {kernel} (dilation {dilation}) does not fit input {input} with pad {pad}"
            ),
        });
    }
    Ok((span as usize) / stride + 1)
}

fn expect_4d(op: &str, shape: &[usize]) -> Result<[usize; 4]> {
    match shape {
        &[b, c, h, w] => Ok([b, c, h, w]),
        other => Err(GradixError::InvalidInput {
            op: op.to_string(),
            msg: format!("expected a [batch, channel, h, w] input, got {other:?}"),
        }),
    }
}

// ===== im2col / col2im =====

/// Unrolls sliding convolution windows into rows:
/// `[b, c, h, w] -> [b, outH, outW, c*kh*kw]`. Out-of-bounds (padding)
/// cells contribute zero.
#[derive(Debug, Clone, Copy)]
pub struct Im2Col<T> {
    kernel: (usize, usize),
    pad: (usize, usize),
    stride: (usize, usize),
    dilation: (usize, usize),
    _elem: PhantomData<T>,
}

impl<T: GradixF> Im2Col<T> {
    pub fn new(
        kernel: (usize, usize),
        pad: (usize, usize),
        stride: (usize, usize),
        dilation: (usize, usize),
    ) -> Self {
        Self {
            kernel,
            pad,
            stride,
            dilation,
            _elem: PhantomData,
        }
    }

    fn out_spatial(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        Ok((
            conv_out_size(h, self.kernel.0, self.pad.0, self.stride.0, self.dilation.0)?,
            conv_out_size(w, self.kernel.1, self.pad.1, self.stride.1, self.dilation.1)?,
        ))
    }
}

impl<T> Operator<T> for Im2Col<T>
where
    T: GradixF,
{
    fn arity(&self) -> usize {
        1
    }

    fn name(&self) -> String {
        "Im2Col".to_string()
    }

    fn out_dtype(&self, inputs: &[DType]) -> Result<DType> {
        if inputs[0] != DType::Numeric {
            return Err(GradixError::TypeMismatch {
                op: self.name(),
                left: DType::Numeric,
                right: inputs[0],
            });
        }
        Ok(DType::Numeric)
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        let [b, c, h, w] = expect_4d(&self.name(), inputs[0])?;
        let (oh, ow) = self.out_spatial(h, w)?;
        Ok(vec![b, oh, ow, c * self.kernel.0 * self.kernel.1])
    }

    fn do_op(&self, _same: bool, inputs: &[Value<T>]) -> Result<Value<T>> {
        check_arity(self, inputs.len())?;
        let x = inputs[0].try_tensor(&self.name())?;
        let [b, c, h, w] = expect_4d(&self.name(), x.shape())?;
        let (oh, ow) = self.out_spatial(h, w)?;
        let (kh, kw) = self.kernel;

        let mut out = Tensor::zeros_on(&[b, oh, ow, c * kh * kw], x.device());
        for bi in 0..b {
            for oy in 0..oh {
                for ox in 0..ow {
                    for ci in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * self.stride.0 + ky * self.dilation.0) as isize
                                    - self.pad.0 as isize;
                                let ix = (ox * self.stride.1 + kx * self.dilation.1) as isize
                                    - self.pad.1 as isize;
                                if iy < 0 || iy >= h as isize || ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let col = ci * kh * kw + ky * kw + kx;
                                out.data_mut()[[bi, oy, ox, col]] =
                                    x.data()[[bi, ci, iy as usize, ix as usize]];
                            }
                        }
                    }
                }
            }
        }
        Ok(Value::Tensor(out))
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

impl<T: GradixF> Im2Col<T> {
    fn adjoint_for(&self, g: &ExprGraph<T>, input: NodeId) -> Result<Col2Im<T>> {
        let shape = g
            .node(input)
            .and_then(|n| n.shape())
            .ok_or(GradixError::Unbound {
                id: input.0,
                what: "shape",
            })?;
        let [_, _, h, w] = expect_4d(&self.name(), shape)?;
        Ok(Col2Im::new(
            self.kernel,
            self.pad,
            self.stride,
            self.dilation,
            (h, w),
        ))
    }
}

impl<T: GradixF> SymDiffOp<T> for Im2Col<T> {
    fn sym_diff(
        &self,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        _output: NodeId,
        grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let adjoint = self.adjoint_for(g, inputs[0])?;
        let dx = g.apply_op(Box::new(adjoint), &[grad])?;
        Ok(vec![Some(dx)])
    }
}

impl<T: GradixF> NumDiffOp<T> for Im2Col<T> {
    fn do_diff(
        &self,
        ctx: &dyn DeviceContext<T>,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
    ) -> Result<()> {
        let dz = crate::diff::numeric::output_deriv(g, output)?;
        let adjoint = self.adjoint_for(g, inputs[0])?;
        let contribution = adjoint.do_op(false, &[dz])?;
        crate::diff::numeric::add_into(ctx, g, inputs[0], &contribution)
    }
}

/// Folds unrolled windows back into an image, summing overlaps:
/// `[b, outH, outW, c*kh*kw] -> [b, c, h, w]`. The adjoint of `Im2Col`.
#[derive(Debug, Clone, Copy)]
pub struct Col2Im<T> {
    kernel: (usize, usize),
    pad: (usize, usize),
    stride: (usize, usize),
    dilation: (usize, usize),
    out_hw: (usize, usize),
    _elem: PhantomData<T>,
}

impl<T: GradixF> Col2Im<T> {
    pub fn new(
        kernel: (usize, usize),
        pad: (usize, usize),
        stride: (usize, usize),
        dilation: (usize, usize),
        out_hw: (usize, usize),
    ) -> Self {
        Self {
            kernel,
            pad,
            stride,
            dilation,
            out_hw,
            _elem: PhantomData,
        }
    }

    fn channels(&self, cols: usize) -> Result<usize> {
        let window = self.kernel.0 * self.kernel.1;
        if window == 0 || cols % window != 0 {
            return Err(GradixError::InvalidInput {
                op: self.name(),
                msg: format!("{cols} columns do not split into {window}-element windows"),
            });
        }
        Ok(cols / window)
    }
}

impl<T> Operator<T> for Col2Im<T>
where
    T: GradixF,
{
    fn arity(&self) -> usize {
        1
    }

    fn name(&self) -> String {
        "Col2Im".to_string()
    }

    fn out_dtype(&self, inputs: &[DType]) -> Result<DType> {
        if inputs[0] != DType::Numeric {
            return Err(GradixError::TypeMismatch {
                op: self.name(),
                left: DType::Numeric,
                right: inputs[0],
            });
        }
        Ok(DType::Numeric)
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        let [b, _, _, cols] = expect_4d(&self.name(), inputs[0])?;
        let c = self.channels(cols)?;
        Ok(vec![b, c, self.out_hw.0, self.out_hw.1])
    }

    fn do_op(&self, _same: bool, inputs: &[Value<T>]) -> Result<Value<T>> {
        check_arity(self, inputs.len())?;
        let cols_t = inputs[0].try_tensor(&self.name())?;
        let [b, oh, ow, cols] = expect_4d(&self.name(), cols_t.shape())?;
        let c = self.channels(cols)?;
        let (h, w) = self.out_hw;
        let (kh, kw) = self.kernel;

        let mut out = Tensor::zeros_on(&[b, c, h, w], cols_t.device());
        for bi in 0..b {
            for oy in 0..oh {
                for ox in 0..ow {
                    for ci in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * self.stride.0 + ky * self.dilation.0) as isize
                                    - self.pad.0 as isize;
                                let ix = (ox * self.stride.1 + kx * self.dilation.1) as isize
                                    - self.pad.1 as isize;
                                if iy < 0 || iy >= h as isize || ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let col = ci * kh * kw + ky * kw + kx;
                                let v = cols_t.data()[[bi, oy, ox, col]];
                                out.data_mut()[[bi, ci, iy as usize, ix as usize]] += v;
                            }
                        }
                    }
                }
            }
        }
        Ok(Value::Tensor(out))
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

impl<T: GradixF> SymDiffOp<T> for Col2Im<T> {
    // the adjoint of a fold is the unroll
    fn sym_diff(
        &self,
        g: &mut ExprGraph<T>,
        _inputs: &[NodeId],
        _output: NodeId,
        grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let adjoint = Im2Col::new(self.kernel, self.pad, self.stride, self.dilation);
        let dx = g.apply_op(Box::new(adjoint), &[grad])?;
        Ok(vec![Some(dx)])
    }
}

impl<T: GradixF> NumDiffOp<T> for Col2Im<T> {
    fn do_diff(
        &self,
        ctx: &dyn DeviceContext<T>,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
    ) -> Result<()> {
        let dz = crate::diff::numeric::output_deriv(g, output)?;
        let adjoint = Im2Col::new(self.kernel, self.pad, self.stride, self.dilation);
        let contribution = adjoint.do_op(false, &[dz])?;
        crate::diff::numeric::add_into(ctx, g, inputs[0], &contribution)
    }
}

// ===== max pooling =====

/// 2D max pooling over `[b, c, h, w]`. The forward pass records, per output
/// cell, the flat `h*w` index of the winning input cell within its channel
/// slice; ties break by scan order, first maximum seen wins. Padding cells
/// never win.
#[derive(Debug, Clone)]
pub struct MaxPool2D<T> {
    kernel: (usize, usize),
    pad: (usize, usize),
    stride: (usize, usize),
    mask: Rc<RefCell<Option<ArrayD<i64>>>>,
    _elem: PhantomData<T>,
}

impl<T: GradixF> MaxPool2D<T> {
    pub fn new(kernel: (usize, usize), pad: (usize, usize), stride: (usize, usize)) -> Self {
        Self {
            kernel,
            pad,
            stride,
            mask: Rc::new(RefCell::new(None)),
            _elem: PhantomData,
        }
    }

    /// Argmax mask from the most recent forward pass.
    pub fn mask(&self) -> Option<ArrayD<i64>> {
        self.mask.borrow().clone()
    }

    fn out_spatial(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        Ok((
            conv_out_size(h, self.kernel.0, self.pad.0, self.stride.0, 1)?,
            conv_out_size(w, self.kernel.1, self.pad.1, self.stride.1, 1)?,
        ))
    }

    fn pool(&self, x: &Tensor<T>) -> Result<(Tensor<T>, ArrayD<i64>)> {
        let [b, c, h, w] = expect_4d(&self.name(), x.shape())?;
        let (oh, ow) = self.out_spatial(h, w)?;
        let (kh, kw) = self.kernel;

        let mut out = Tensor::zeros_on(&[b, c, oh, ow], x.device());
        let mut mask = ArrayD::<i64>::zeros(ndarray::IxDyn(&[b, c, oh, ow]));
        for bi in 0..b {
            for ci in 0..c {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best: Option<(T, usize)> = None;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy =
                                    (oy * self.stride.0 + ky) as isize - self.pad.0 as isize;
                                let ix =
                                    (ox * self.stride.1 + kx) as isize - self.pad.1 as isize;
                                if iy < 0 || iy >= h as isize || ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let v = x.data()[[bi, ci, iy as usize, ix as usize]];
                                let flat = iy as usize * w + ix as usize;
                                match best {
                                    // strict > keeps the first maximum
                                    Some((m, _)) if v > m => best = Some((v, flat)),
                                    None => best = Some((v, flat)),
                                    _ => {}
                                }
                            }
                        }
                        let (m, flat) = best.ok_or_else(|| GradixError::InvalidInput {
                            op: self.name(),
                            msg: "pooling window covers no input cells".to_string(),
                        })?;
                        out.data_mut()[[bi, ci, oy, ox]] = m;
                        mask[[bi, ci, oy, ox]] = flat as i64;
                    }
                }
            }
        }
        Ok((out, mask))
    }
}

impl<T> Operator<T> for MaxPool2D<T>
where
    T: GradixF,
{
    fn arity(&self) -> usize {
        1
    }

    fn name(&self) -> String {
        "MaxPool2D".to_string()
    }

    fn out_dtype(&self, inputs: &[DType]) -> Result<DType> {
        if inputs[0] != DType::Numeric {
            return Err(GradixError::TypeMismatch {
                op: self.name(),
                left: DType::Numeric,
                right: inputs[0],
            });
        }
        Ok(DType::Numeric)
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        let [b, c, h, w] = expect_4d(&self.name(), inputs[0])?;
        let (oh, ow) = self.out_spatial(h, w)?;
        Ok(vec![b, c, oh, ow])
    }

    fn do_op(&self, _same: bool, inputs: &[Value<T>]) -> Result<Value<T>> {
        check_arity(self, inputs.len())?;
        let x = inputs[0].try_tensor(&self.name())?;
        let (out, mask) = self.pool(x)?;
        *self.mask.borrow_mut() = Some(mask);
        Ok(Value::Tensor(out))
    }

    fn clone_op(&self) -> Box<dyn Operator<T>> {
        Box::new(self.clone())
    }

    fn prealloc_doer(&self) -> Option<&dyn PreallocDoer<T>> {
        Some(self)
    }

    fn sym_diff_op(&self) -> Option<&dyn SymDiffOp<T>> {
        Some(self)
    }

    fn num_diff_op(&self) -> Option<&dyn NumDiffOp<T>> {
        Some(self)
    }
}

impl<T: GradixF> PreallocDoer<T> for MaxPool2D<T> {
    fn prealloc_do(&self, prealloc: &mut Value<T>, same: bool, inputs: &[Value<T>]) -> Result<()> {
        let out = self.do_op(same, inputs)?;
        write_into(&self.name(), prealloc, out)
    }
}

impl<T: GradixF> MaxPool2D<T> {
    fn diff_op(&self) -> MaxPool2DDiff<T> {
        MaxPool2DDiff {
            mask: Rc::clone(&self.mask),
            _elem: PhantomData,
        }
    }
}

impl<T: GradixF> SymDiffOp<T> for MaxPool2D<T> {
    fn sym_diff(
        &self,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        _output: NodeId,
        grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let dx = g.apply_op(Box::new(self.diff_op()), &[inputs[0], grad])?;
        Ok(vec![Some(dx)])
    }
}

impl<T: GradixF> NumDiffOp<T> for MaxPool2D<T> {
    fn do_diff(
        &self,
        ctx: &dyn DeviceContext<T>,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
    ) -> Result<()> {
        let dz = crate::diff::numeric::output_deriv(g, output)?;
        let x = g.value(inputs[0])?.clone();
        let contribution = self.diff_op().do_op(false, &[x, dz])?;
        crate::diff::numeric::add_into(ctx, g, inputs[0], &contribution)
    }
}

/// Backward of `MaxPool2D`: routes each upstream gradient cell exclusively
/// to the input cell its pooling window's mask entry points at.
#[derive(Debug, Clone)]
pub struct MaxPool2DDiff<T> {
    mask: Rc<RefCell<Option<ArrayD<i64>>>>,
    _elem: PhantomData<T>,
}

impl<T> Operator<T> for MaxPool2DDiff<T>
where
    T: GradixF,
{
    fn arity(&self) -> usize {
        2
    }

    fn name(&self) -> String {
        "MaxPool2DDiff".to_string()
    }

    fn out_dtype(&self, inputs: &[DType]) -> Result<DType> {
        if inputs.iter().any(|&d| d != DType::Numeric) {
            return Err(GradixError::TypeMismatch {
                op: self.name(),
                left: inputs[0],
                right: inputs[1],
            });
        }
        Ok(DType::Numeric)
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        Ok(inputs[0].to_vec())
    }

    fn do_op(&self, _same: bool, inputs: &[Value<T>]) -> Result<Value<T>> {
        check_arity(self, inputs.len())?;
        let x = inputs[0].try_tensor(&self.name())?;
        let gz = inputs[1].try_tensor(&self.name())?;
        let mask_ref = self.mask.borrow();
        let mask = mask_ref.as_ref().ok_or_else(|| GradixError::InvalidInput {
            op: self.name(),
            msg: "no argmax mask recorded; forward pass has not run".to_string(),
        })?;
        if mask.shape() != gz.shape() {
            return Err(GradixError::ShapeMismatch {
                op: self.name(),
                left: mask.shape().to_vec(),
                right: gz.shape().to_vec(),
            });
        }
        let [_, _, _, w] = expect_4d(&self.name(), x.shape())?;
        let [b, c, oh, ow] = expect_4d(&self.name(), gz.shape())?;

        let mut out = Tensor::zeros_on(x.shape(), x.device());
        for bi in 0..b {
            for ci in 0..c {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let flat = mask[[bi, ci, oy, ox]] as usize;
                        let g = gz.data()[[bi, ci, oy, ox]];
                        out.data_mut()[[bi, ci, flat / w, flat % w]] += g;
                    }
                }
            }
        }
        Ok(Value::Tensor(out))
    }

    fn clone_op(&self) -> Box<dyn Operator<T>> {
        Box::new(self.clone())
    }
}

// ===== batch normalization =====

#[derive(Debug)]
struct BnState<T> {
    channels: usize,
    running_mean: Vec<T>,
    running_var: Vec<T>,
    // saved by the training forward for the backward pass
    saved_xhat: Option<Tensor<T>>,
    saved_inv_std: Vec<T>,
}

impl<T: GradixN> BnState<T> {
    fn new(channels: usize) -> Self {
        Self {
            channels,
            running_mean: vec![<T as GradixN>::zero(); channels],
            running_var: vec![<T as GradixN>::one(); channels],
            saved_xhat: None,
            saved_inv_std: vec![<T as GradixN>::zero(); channels],
        }
    }
}

/// Per-channel batch normalization (no affine scale/shift) over
/// `[b, c, h, w]`. Training mode normalizes with batch statistics and
/// folds them into the running mean/variance with `momentum`; inference
/// mode normalizes with the running statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm<T>
where
    T: GradixF,
{
    momentum: T,
    epsilon: T,
    training: Rc<Cell<bool>>,
    state: Rc<RefCell<Option<BnState<T>>>>,
}

impl<T: GradixF> BatchNorm<T> {
    pub fn new(momentum: T, epsilon: T) -> Self {
        Self {
            momentum,
            epsilon,
            training: Rc::new(Cell::new(true)),
            state: Rc::new(RefCell::new(None)),
        }
    }

    /// Sizes running statistics and scratch from an input shape. Called
    /// lazily by the first forward pass when the caller skipped it.
    pub fn init(&self, input_shape: &[usize]) -> Result<()> {
        let [_, c, _, _] = expect_4d("BatchNorm::init", input_shape)?;
        *self.state.borrow_mut() = Some(BnState::new(c));
        Ok(())
    }

    /// Switches to training mode, resetting the running statistics first.
    pub fn set_training(&self) {
        self.reset();
        self.training.set(true);
    }

    pub fn set_testing(&self) {
        self.training.set(false);
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Zeroes the running mean and restores the running variance to one.
    pub fn reset(&self) {
        if let Some(state) = self.state.borrow_mut().as_mut() {
            state.running_mean.fill(<T as GradixN>::zero());
            state.running_var.fill(<T as GradixN>::one());
            state.saved_xhat = None;
            state.saved_inv_std.fill(<T as GradixN>::zero());
        }
    }

    pub fn running_mean(&self) -> Vec<T> {
        self.state
            .borrow()
            .as_ref()
            .map(|s| s.running_mean.clone())
            .unwrap_or_default()
    }

    pub fn running_var(&self) -> Vec<T> {
        self.state
            .borrow()
            .as_ref()
            .map(|s| s.running_var.clone())
            .unwrap_or_default()
    }

    fn ensure_state(&self, shape: &[usize]) -> Result<()> {
        let [_, c, _, _] = expect_4d(&<Self as Operator<T>>::name(self), shape)?;
        let initialized = self.state.borrow().as_ref().map(|s| s.channels);
        match initialized {
            None => self.init(shape),
            Some(channels) if channels != c => Err(GradixError::InvalidInput {
                op: <Self as Operator<T>>::name(self),
                msg: format!("initialized for {channels} channel(s), input has {c}"),
            }),
            Some(_) => Ok(()),
        }
    }

    fn count(&self, b: usize, h: usize, w: usize) -> Result<T> {
        <T as GradixN>::from_usize(b * h * w).ok_or_else(|| GradixError::InvalidInput {
            op: <Self as Operator<T>>::name(self),
            msg: format!("{} elements per channel not representable", b * h * w),
        })
    }

    fn forward_training(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let [b, c, h, w] = expect_4d(&<Self as Operator<T>>::name(self), x.shape())?;
        let n = self.count(b, h, w)?;
        let mut out = Tensor::zeros_on(x.shape(), x.device());
        let mut xhat = Tensor::zeros_on(x.shape(), x.device());
        let mut state_ref = self.state.borrow_mut();
        let state = state_ref.as_mut().ok_or_else(|| GradixError::Unbound {
            id: 0,
            what: "batchnorm state",
        })?;

        let one = <T as GradixN>::one();
        for ci in 0..c {
            let mut sum = <T as GradixN>::zero();
            for bi in 0..b {
                for y in 0..h {
                    for z in 0..w {
                        sum += x.data()[[bi, ci, y, z]];
                    }
                }
            }
            let mean = sum / n;

            let mut var_sum = <T as GradixN>::zero();
            for bi in 0..b {
                for y in 0..h {
                    for z in 0..w {
                        let d = x.data()[[bi, ci, y, z]] - mean;
                        var_sum += d * d;
                    }
                }
            }
            let var = var_sum / n;
            let inv_std = one / (var + self.epsilon).sqrt();

            for bi in 0..b {
                for y in 0..h {
                    for z in 0..w {
                        let v = (x.data()[[bi, ci, y, z]] - mean) * inv_std;
                        xhat.data_mut()[[bi, ci, y, z]] = v;
                        out.data_mut()[[bi, ci, y, z]] = v;
                    }
                }
            }

            state.running_mean[ci] =
                state.running_mean[ci] * (one - self.momentum) + mean * self.momentum;
            state.running_var[ci] =
                state.running_var[ci] * (one - self.momentum) + var * self.momentum;
            state.saved_inv_std[ci] = inv_std;
        }
        state.saved_xhat = Some(xhat);
        Ok(out)
    }

    fn forward_inference(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let [b, c, h, w] = expect_4d(&<Self as Operator<T>>::name(self), x.shape())?;
        let state_ref = self.state.borrow();
        let state = state_ref.as_ref().ok_or_else(|| GradixError::Unbound {
            id: 0,
            what: "batchnorm state",
        })?;

        let one = <T as GradixN>::one();
        let mut out = Tensor::zeros_on(x.shape(), x.device());
        for ci in 0..c {
            let mean = state.running_mean[ci];
            let inv_std = one / (state.running_var[ci] + self.epsilon).sqrt();
            for bi in 0..b {
                for y in 0..h {
                    for z in 0..w {
                        out.data_mut()[[bi, ci, y, z]] =
                            (x.data()[[bi, ci, y, z]] - mean) * inv_std;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl<T> Operator<T> for BatchNorm<T>
where
    T: GradixF,
{
    fn arity(&self) -> usize {
        1
    }

    fn name(&self) -> String {
        "BatchNorm".to_string()
    }

    fn out_dtype(&self, inputs: &[DType]) -> Result<DType> {
        if inputs[0] != DType::Numeric {
            return Err(GradixError::TypeMismatch {
                op: self.name(),
                left: DType::Numeric,
                right: inputs[0],
            });
        }
        Ok(DType::Numeric)
    }

    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>> {
        expect_4d(&self.name(), inputs[0])?;
        Ok(inputs[0].to_vec())
    }

    fn do_op(&self, _same: bool, inputs: &[Value<T>]) -> Result<Value<T>> {
        check_arity(self, inputs.len())?;
        let x = inputs[0].try_tensor(&self.name())?;
        self.ensure_state(x.shape())?;
        let out = if self.training.get() {
            self.forward_training(x)?
        } else {
            self.forward_inference(x)?
        };
        Ok(Value::Tensor(out))
    }

    fn clone_op(&self) -> Box<dyn Operator<T>> {
        Box::new(self.clone())
    }

    fn num_diff_op(&self) -> Option<&dyn NumDiffOp<T>> {
        Some(self)
    }
}

impl<T: GradixF> NumDiffOp<T> for BatchNorm<T> {
    // dx = inv_std/n * (n*dy - sum(dy) - xhat * sum(dy*xhat)), per channel
    fn do_diff(
        &self,
        ctx: &dyn DeviceContext<T>,
        g: &mut ExprGraph<T>,
        inputs: &[NodeId],
        output: NodeId,
    ) -> Result<()> {
        let dz = crate::diff::numeric::output_deriv(g, output)?;
        let dy = dz.try_tensor(&self.name())?;
        let [b, c, h, w] = expect_4d(&self.name(), dy.shape())?;
        let n = self.count(b, h, w)?;

        let contribution = {
            let state_ref = self.state.borrow();
            let state = state_ref.as_ref().ok_or_else(|| GradixError::Unbound {
                id: output.0,
                what: "batchnorm state",
            })?;
            let xhat = state
                .saved_xhat
                .as_ref()
                .ok_or_else(|| GradixError::InvalidInput {
                    op: self.name(),
                    msg: "no saved batch statistics; training forward has not run".to_string(),
                })?;

            let mut dx = Tensor::zeros_on(dy.shape(), dy.device());
            for ci in 0..c {
                let mut sum_dy = <T as GradixN>::zero();
                let mut sum_dy_xhat = <T as GradixN>::zero();
                for bi in 0..b {
                    for y in 0..h {
                        for z in 0..w {
                            let d = dy.data()[[bi, ci, y, z]];
                            sum_dy += d;
                            sum_dy_xhat += d * xhat.data()[[bi, ci, y, z]];
                        }
                    }
                }
                let inv_std = state.saved_inv_std[ci];
                for bi in 0..b {
                    for y in 0..h {
                        for z in 0..w {
                            let d = dy.data()[[bi, ci, y, z]];
                            let xh = xhat.data()[[bi, ci, y, z]];
                            dx.data_mut()[[bi, ci, y, z]] =
                                inv_std / n * (n * d - sum_dy - xh * sum_dy_xhat);
                        }
                    }
                }
            }
            Value::Tensor(dx)
        };
        crate::diff::numeric::add_into(ctx, g, inputs[0], &contribution)
    }
}
