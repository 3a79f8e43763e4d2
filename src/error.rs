// src/error.rs
// Error taxonomy for the graph/op/differentiation core.
// Everything here is returned to the immediate caller; there is no retry
// machinery anywhere in this crate. Graph-identity collisions and self-loop
// edges are programmer errors and panic instead of going through this enum.

use crate::value::DType;

pub type Result<T> = std::result::Result<T, GradixError>;

#[derive(Debug, thiserror::Error)]
pub enum GradixError {
    /// Wrong operand count for an operator. Always fatal to the call.
    #[error("{op} expects {expected} operand(s), got {got}")]
    ArityMismatch {
        op: String,
        expected: usize,
        got: usize,
    },

    /// Operand types disagree or are unsupported by a kernel.
    #[error("type mismatch in {op}: {left:?} != {right:?}")]
    TypeMismatch { op: String, left: DType, right: DType },

    /// Shapes cannot be broadcast together or do not match an op's contract.
    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    /// The operator/type or operator/shape combination has no kernel.
    /// `is_type_error` distinguishes "wrong type for this action" from
    /// "action unsupported outright".
    #[error("{action} not yet implemented for {target} (type restriction: {is_type_error})")]
    NotYetImplemented {
        action: String,
        target: String,
        is_type_error: bool,
    },

    /// An operator marked non-differentiable was asked to differentiate.
    #[error("automatic differentiation not supported by {op}")]
    AutoDiffUnsupported { op: String },

    /// A numeric accumulation step failed. `is_unsafe` marks whether the
    /// failing call was the in-place variant.
    #[error("cannot perform do (unsafe: {is_unsafe}): {source}")]
    DoFail {
        #[source]
        source: Box<GradixError>,
        is_unsafe: bool,
    },

    /// Device memory could not be acquired.
    #[error("failed to allocate {size} element(s) on {device}")]
    AllocFail { device: String, size: usize },

    /// A node was expected to carry a bound value (or a dual value) but
    /// does not.
    #[error("node {id} has no bound {what}")]
    Unbound { id: u64, what: &'static str },

    /// Catch-all for malformed inputs at the collaborator boundaries.
    #[error("invalid input to {op}: {msg}")]
    InvalidInput { op: String, msg: String },
}

impl GradixError {
    /// Wraps a nested failure the way the accumulation paths report them.
    pub fn do_fail(source: GradixError, is_unsafe: bool) -> Self {
        GradixError::DoFail {
            source: Box::new(source),
            is_unsafe,
        }
    }

    pub fn nyi(action: impl Into<String>, target: impl Into<String>, is_type_error: bool) -> Self {
        GradixError::NotYetImplemented {
            action: action.into(),
            target: target.into(),
            is_type_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn do_fail_preserves_unsafe_flag() {
        let inner = GradixError::nyi("IncrDo", "hadamard_pow", true);
        let err = GradixError::do_fail(inner, true);
        match err {
            GradixError::DoFail { is_unsafe, source } => {
                assert!(is_unsafe);
                assert!(matches!(
                    *source,
                    GradixError::NotYetImplemented { is_type_error: true, .. }
                ));
            }
            other => panic!("expected DoFail, got {other:?}"),
        }
    }

    #[test]
    fn nyi_message_carries_action_and_target() {
        let err = GradixError::nyi("ScalarBinOp::do_op", "bool", true);
        let msg = err.to_string();
        assert!(msg.contains("ScalarBinOp::do_op"));
        assert!(msg.contains("bool"));
    }
}
