//! # Criterion Kinds
//!
//! One enum variant per node operation, with the per-kind state (cached
//! softmaxes, trellises, eval modes) living inside the variant. The
//! dispatch tables here — arity, gradient support per input slot — are
//! the single source of truth the graph consults before handing work to
//! a kind-specific module.

use num_traits::Float;
use trellis_core::{CriterionError, MinibatchLayout, Placement};

use crate::class_softmax::ClassSoftmaxState;
use crate::crf::CrfState;
use crate::elementwise::{CrossEntropyState, CrossEntropyWithSoftmaxState, SquareErrorState};
use crate::nce::NceState;
use crate::reg::L1RegState;

/// Shape and residency of one input, as seen at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputMeta {
    pub rows: usize,
    pub cols: usize,
    pub placement: Placement,
}

/// Convert an `f64` constant into the element type.
pub(crate) fn efrom<E: Float>(v: f64) -> E {
    E::from(v).expect("constant must be representable in the element type")
}

/// Dense dot product of two equal-length slices.
pub(crate) fn dot<E: Float>(a: &[E], b: &[E]) -> E {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).fold(E::zero(), |acc, (&x, &y)| acc + x * y)
}

/// A layout only applies to data packed against it.
pub(crate) fn check_layout(
    op: &'static str,
    cols: usize,
    layout: Option<&MinibatchLayout>,
) -> Result<(), CriterionError> {
    if let Some(layout) = layout {
        if layout.num_cols() != cols {
            return Err(CriterionError::ShapeMismatch {
                op,
                reason: format!(
                    "minibatch layout covers {} columns, data has {}",
                    layout.num_cols(),
                    cols
                ),
            });
        }
    }
    Ok(())
}

/// The operation a graph node performs.
///
/// `Source` nodes hold externally supplied values (features, labels,
/// learnable parameters); every other variant is a criterion reducing
/// its inputs to a 1×1 objective.
#[derive(Debug, Clone)]
pub enum Op<E> {
    Source,
    SquareError(SquareErrorState<E>),
    CrossEntropy(CrossEntropyState<E>),
    CrossEntropyWithSoftmax(CrossEntropyWithSoftmaxState<E>),
    L1Reg(L1RegState<E>),
    L2Reg,
    Nce(NceState<E>),
    ClassCrossEntropyWithSoftmax(ClassSoftmaxState<E>),
    Crf(CrfState<E>),
    DummyCriterion,
}

impl<E: Float> Op<E> {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Source => "Source",
            Op::SquareError(_) => "SquareError",
            Op::CrossEntropy(_) => "CrossEntropy",
            Op::CrossEntropyWithSoftmax(_) => "CrossEntropyWithSoftmax",
            Op::L1Reg(_) => "MatrixL1Reg",
            Op::L2Reg => "MatrixL2Reg",
            Op::Nce(_) => "NCEBasedCrossEntropyWithSoftmax",
            Op::ClassCrossEntropyWithSoftmax(_) => "ClassBasedCrossEntropyWithSoftmax",
            Op::Crf(_) => "CRF",
            Op::DummyCriterion => "DummyCriterion",
        }
    }

    /// Number of inputs this kind requires.
    pub fn arity(&self) -> usize {
        match self {
            Op::Source => 0,
            Op::SquareError(_) | Op::CrossEntropy(_) | Op::CrossEntropyWithSoftmax(_) => 2,
            Op::L1Reg(_) | Op::L2Reg => 1,
            Op::Nce(_) | Op::ClassCrossEntropyWithSoftmax(_) => 4,
            Op::Crf(_) | Op::DummyCriterion => 3,
        }
    }

    pub fn is_criterion(&self) -> bool {
        !matches!(self, Op::Source)
    }

    /// Whether the gradient with respect to input `index` is defined.
    ///
    /// Label inputs, sample descriptors and externally supplied
    /// objectives are observed data; no gradient flows into them.
    pub fn supports_gradient(&self, index: usize) -> bool {
        match self {
            Op::Source => false,
            Op::SquareError(_) | Op::CrossEntropy(_) | Op::CrossEntropyWithSoftmax(_) => index < 2,
            Op::L1Reg(_) | Op::L2Reg => index == 0,
            Op::Nce(_) | Op::ClassCrossEntropyWithSoftmax(_) => (1..4).contains(&index),
            Op::Crf(_) => index == 1 || index == 2,
            Op::DummyCriterion => index == 2,
        }
    }

    /// Size this kind's forward temporaries for the given input shapes.
    /// Called at validation; evaluation overwrites the contents.
    pub fn prepare(&mut self, metas: &[InputMeta]) {
        match self {
            Op::Source | Op::L2Reg | Op::DummyCriterion | Op::Nce(_) => {}
            Op::SquareError(s) => s.prepare(metas[0].rows, metas[0].cols),
            Op::CrossEntropy(s) => s.prepare(metas[0].rows, metas[0].cols),
            Op::CrossEntropyWithSoftmax(s) => s.prepare(metas[0].rows, metas[0].cols),
            Op::L1Reg(s) => s.prepare(metas[0].rows, metas[0].cols),
            Op::ClassCrossEntropyWithSoftmax(s) => s.prepare(metas[3].rows, metas[0].cols),
            Op::Crf(s) => s.prepare(metas[0].rows, metas[0].cols),
        }
    }

    /// Re-tag the intended residency of this kind's cached matrices.
    pub fn transfer_to(&mut self, placement: Placement) {
        match self {
            Op::Source | Op::L2Reg | Op::DummyCriterion => {}
            Op::SquareError(s) => s.transfer_to(placement),
            Op::CrossEntropy(s) => s.transfer_to(placement),
            Op::CrossEntropyWithSoftmax(s) => s.transfer_to(placement),
            Op::L1Reg(s) => s.transfer_to(placement),
            Op::Nce(s) => s.transfer_to(placement),
            Op::ClassCrossEntropyWithSoftmax(s) => s.transfer_to(placement),
            Op::Crf(s) => s.transfer_to(placement),
        }
    }
}
