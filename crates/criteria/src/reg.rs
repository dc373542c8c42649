//! # Norm Regularizers
//!
//! L1 and L2 penalties over a single input. Masked columns are zeroed
//! before the norm is taken, so padding never inflates the penalty.

use num_traits::Float;
use trellis_core::{CriterionError, Matrix, MinibatchLayout, Placement};

use crate::node::{check_layout, efrom, InputMeta};

/// Guards the division by the L2 norm when the input is all zeros.
const EPS_IN_INVERSE: f64 = 1e-30;

pub(crate) fn validate_single(
    op: &'static str,
    metas: &[InputMeta],
) -> Result<(), CriterionError> {
    let m = &metas[0];
    if m.rows == 0 || m.cols == 0 {
        return Err(CriterionError::ShapeMismatch {
            op,
            reason: "input must be non-empty".into(),
        });
    }
    Ok(())
}

fn masked_clone<E: Float>(input: &Matrix<E>, layout: Option<&MinibatchLayout>) -> Matrix<E> {
    let mut m = input.clone();
    if let Some(layout) = layout {
        layout.mask_missing_columns(&mut m);
    }
    m
}

// ============================================================================
// L1: sum |x|
// ============================================================================

#[derive(Debug, Clone)]
pub struct L1RegState<E> {
    gradient_of_l1: Matrix<E>,
}

impl<E: Float> L1RegState<E> {
    pub fn new() -> Self {
        Self {
            gradient_of_l1: Matrix::zeros(0, 0),
        }
    }

    pub(crate) fn prepare(&mut self, rows: usize, cols: usize) {
        self.gradient_of_l1.resize(rows, cols);
    }

    pub fn evaluate(
        &self,
        input: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        check_layout("MatrixL1Reg", input.cols(), layout)?;
        Ok(Matrix::scalar(masked_clone(input, layout).norm1()))
    }

    /// Subgradient: `sign(x)`, zero at zero.
    pub fn partial(
        &mut self,
        seed: E,
        input: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
        grad: &mut Matrix<E>,
    ) -> Result<(), CriterionError> {
        self.gradient_of_l1.assign_sign_of(input);
        if let Some(layout) = layout {
            layout.mask_missing_columns(&mut self.gradient_of_l1);
        }
        grad.add_scaled(seed, &self.gradient_of_l1);
        Ok(())
    }

    pub fn transfer_to(&mut self, placement: Placement) {
        self.gradient_of_l1.transfer_to(placement);
    }
}

// ============================================================================
// L2: sqrt(sum x^2)
// ============================================================================

pub fn l2_evaluate<E: Float>(
    input: &Matrix<E>,
    layout: Option<&MinibatchLayout>,
) -> Result<Matrix<E>, CriterionError> {
    check_layout("MatrixL2Reg", input.cols(), layout)?;
    Ok(Matrix::scalar(masked_clone(input, layout).frobenius_norm()))
}

/// `d/dx ||x|| = x / ||x||`, reading the norm back from the node's own
/// forward value.
pub fn l2_partial<E: Float>(
    seed: E,
    own_value: E,
    input: &Matrix<E>,
    layout: Option<&MinibatchLayout>,
    grad: &mut Matrix<E>,
) -> Result<(), CriterionError> {
    let masked = masked_clone(input, layout);
    let scale = seed / (own_value + efrom::<E>(EPS_IN_INVERSE));
    grad.add_scaled(scale, &masked);
    Ok(())
}
