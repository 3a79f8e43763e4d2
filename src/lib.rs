//! # Gradix
//!
//! Gradix is a computation-graph engine for forward evaluation and
//! reverse-mode automatic differentiation of scalar and tensor expressions.
//!
//! ## Features
//!
//! - Expression graph with positionally-weighted edges, so operator
//!   operands are always reconstructible in order
//! - Capability-polymorphic operators (fresh compute, in-place compute,
//!   preallocated-output compute, increment-accumulate compute)
//! - Symbolic differentiation (gradient expressions appended to the graph)
//!   and numeric differentiation (gradient buffers accumulated in place)
//! - Device-aware gradient accumulation with scope-guaranteed release of
//!   scratch buffers
//! - Dual-value pooling to avoid allocation churn across repeated runs
//!
pub mod backend;
pub mod diff;
pub mod error;
pub mod graph;
pub mod ops;
pub mod tensor;
pub mod value;

// Re-export commonly used types for convenience
pub use backend::{cpu, default_device, Device, DeviceContext, GradixF, GradixN, HostContext};
pub use error::{GradixError, Result};
pub use graph::{ExprGraph, Node, NodeId};
pub use tensor::Tensor;
pub use value::{DType, DualValue, Value};
