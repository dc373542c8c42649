//! # Error Types
//!
//! Criterion errors are first-class: each one names a structural
//! precondition a node refused to proceed without. None of them are
//! retried or recovered locally — validation errors abort graph
//! construction, runtime errors abort the current minibatch.

use thiserror::Error;

/// Errors raised by criterion nodes and the graph that hosts them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CriterionError {
    /// A node was attached to a different number of inputs than it declares.
    #[error("{op} requires {expected} inputs, got {got}")]
    ArityMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// Input shapes are incompatible, or an input has zero elements.
    #[error("shape mismatch in {op}: {reason}")]
    ShapeMismatch { op: &'static str, reason: String },

    /// `compute_input_partial` was asked for an input slot outside the
    /// node's declared arity.
    #[error("{op} has no input {index} (arity {arity})")]
    InvalidInputIndex {
        op: &'static str,
        index: usize,
        arity: usize,
    },

    /// The gradient with respect to this input is not mathematically
    /// defined (labels, externally supplied objectives).
    #[error("{op}: gradient with respect to input {index} is undefined")]
    UnsupportedGradient { op: &'static str, index: usize },

    /// A tensor that must be host-addressable resides elsewhere.
    /// Placement is a validation-time contract; nothing is relocated.
    #[error("{op}: input {index} must reside in host memory")]
    DeviceResidencyViolation { op: &'static str, index: usize },

    /// The node is in the wrong persisted state for the requested
    /// operation (e.g. backward on an NCE node not in training mode).
    #[error("{op}: {reason}")]
    InvalidState { op: &'static str, reason: String },

    /// A label column is structurally impossible (zero-width class with a
    /// nonzero word id).
    #[error("{op}: {reason}")]
    StructuralLabelError { op: &'static str, reason: String },
}
