//! # Elementwise Criteria
//!
//! The two-operand losses that reduce a label/prediction pair to a
//! scalar: squared error, plain cross entropy over already-normalized
//! predictions, and cross entropy fused with a column softmax. Each
//! keeps the intermediate its backward pass needs (the difference, the
//! log, the softmax) so gradients reuse the forward computation.

use num_traits::Float;
use trellis_core::{CriterionError, Matrix, MinibatchLayout};

use crate::node::{check_layout, InputMeta};

/// Shared shape check for two-operand elementwise criteria.
pub(crate) fn validate_matching_pair(
    op: &'static str,
    metas: &[InputMeta],
) -> Result<(), CriterionError> {
    let (a, b) = (&metas[0], &metas[1]);
    if a.rows == 0 || a.cols == 0 {
        return Err(CriterionError::ShapeMismatch {
            op,
            reason: "inputs must be non-empty".into(),
        });
    }
    if (a.rows, a.cols) != (b.rows, b.cols) {
        return Err(CriterionError::ShapeMismatch {
            op,
            reason: format!("{}x{} vs {}x{}", a.rows, a.cols, b.rows, b.cols),
        });
    }
    Ok(())
}

fn not_evaluated(op: &'static str) -> CriterionError {
    CriterionError::InvalidState {
        op,
        reason: "evaluate must run before gradients".into(),
    }
}

// ============================================================================
// SquareError: 1/2 * ||left - right||^2
// ============================================================================

#[derive(Debug, Clone)]
pub struct SquareErrorState<E> {
    left_minus_right: Matrix<E>,
}

impl<E: Float> SquareErrorState<E> {
    pub fn new() -> Self {
        Self {
            left_minus_right: Matrix::zeros(0, 0),
        }
    }

    pub(crate) fn prepare(&mut self, rows: usize, cols: usize) {
        self.left_minus_right.resize(rows, cols);
    }

    pub fn evaluate(
        &mut self,
        left: &Matrix<E>,
        right: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        check_layout("SquareError", left.cols(), layout)?;
        self.left_minus_right.assign_difference_of(left, right);
        if let Some(layout) = layout {
            layout.mask_missing_columns(&mut self.left_minus_right);
        }
        let norm = self.left_minus_right.frobenius_norm();
        Ok(Matrix::scalar(norm * norm / (E::one() + E::one())))
    }

    /// `d/d left = (left - right)`, `d/d right = -(left - right)`.
    pub fn partial(
        &self,
        index: usize,
        seed: E,
        grad: &mut Matrix<E>,
    ) -> Result<(), CriterionError> {
        if self.left_minus_right.is_empty() {
            return Err(not_evaluated("SquareError"));
        }
        let scale = if index == 0 { seed } else { -seed };
        grad.add_scaled(scale, &self.left_minus_right);
        Ok(())
    }

    pub fn transfer_to(&mut self, placement: trellis_core::Placement) {
        self.left_minus_right.transfer_to(placement);
    }
}

// ============================================================================
// CrossEntropy: -sum(label .* log(prediction))
// ============================================================================

/// Cross entropy over predictions that are already a distribution.
/// Prefer [`CrossEntropyWithSoftmaxState`] when the predictions are raw
/// scores; the fused form is cheaper and numerically stable.
#[derive(Debug, Clone)]
pub struct CrossEntropyState<E> {
    log_of_right: Matrix<E>,
    left_div_right: Matrix<E>,
}

impl<E: Float> CrossEntropyState<E> {
    pub fn new() -> Self {
        Self {
            log_of_right: Matrix::zeros(0, 0),
            left_div_right: Matrix::zeros(0, 0),
        }
    }

    pub(crate) fn prepare(&mut self, rows: usize, cols: usize) {
        self.log_of_right.resize(rows, cols);
        self.left_div_right.resize(rows, cols);
    }

    pub fn evaluate(
        &mut self,
        label: &Matrix<E>,
        prediction: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        check_layout("CrossEntropy", prediction.cols(), layout)?;
        self.log_of_right.set_value(prediction);
        self.log_of_right.inplace_log();
        if let Some(layout) = layout {
            layout.mask_missing_columns(&mut self.log_of_right);
        }
        Ok(Matrix::scalar(-Matrix::inner_product(
            label,
            &self.log_of_right,
        )))
    }

    pub fn partial(
        &mut self,
        index: usize,
        seed: E,
        label: &Matrix<E>,
        prediction: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
        grad: &mut Matrix<E>,
    ) -> Result<(), CriterionError> {
        if index == 0 {
            if self.log_of_right.is_empty() {
                return Err(not_evaluated("CrossEntropy"));
            }
            grad.add_scaled(-seed, &self.log_of_right);
        } else {
            self.left_div_right
                .assign_element_division_of(label, prediction);
            if let Some(layout) = layout {
                layout.mask_missing_columns(&mut self.left_div_right);
            }
            grad.add_scaled(-seed, &self.left_div_right);
        }
        Ok(())
    }

    pub fn transfer_to(&mut self, placement: trellis_core::Placement) {
        self.log_of_right.transfer_to(placement);
        self.left_div_right.transfer_to(placement);
    }
}

// ============================================================================
// CrossEntropyWithSoftmax: -sum(label .* log_softmax(prediction))
// ============================================================================

#[derive(Debug, Clone)]
pub struct CrossEntropyWithSoftmaxState<E> {
    log_softmax: Matrix<E>,
    softmax: Matrix<E>,
}

impl<E: Float> CrossEntropyWithSoftmaxState<E> {
    pub fn new() -> Self {
        Self {
            log_softmax: Matrix::zeros(0, 0),
            softmax: Matrix::zeros(0, 0),
        }
    }

    pub(crate) fn prepare(&mut self, rows: usize, cols: usize) {
        self.log_softmax.resize(rows, cols);
        self.softmax.resize(rows, cols);
    }

    pub fn evaluate(
        &mut self,
        label: &Matrix<E>,
        prediction: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        check_layout("CrossEntropyWithSoftmax", prediction.cols(), layout)?;
        self.log_softmax.set_value(prediction);
        self.log_softmax.log_softmax_columns();
        self.softmax.set_value(&self.log_softmax);
        self.softmax.inplace_exp();
        if let Some(layout) = layout {
            layout.mask_missing_columns(&mut self.log_softmax);
        }
        Ok(Matrix::scalar(-Matrix::inner_product(
            label,
            &self.log_softmax,
        )))
    }

    /// The fused gradient: `d/d prediction = softmax - label`, with the
    /// softmax taken from the forward pass.
    pub fn partial(
        &self,
        index: usize,
        seed: E,
        label: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
        grad: &mut Matrix<E>,
    ) -> Result<(), CriterionError> {
        if self.log_softmax.is_empty() {
            return Err(not_evaluated("CrossEntropyWithSoftmax"));
        }
        if index == 0 {
            grad.add_scaled(-seed, &self.log_softmax);
        } else {
            let mut delta = Matrix::zeros(0, 0);
            delta.assign_difference_of(&self.softmax, label);
            if let Some(layout) = layout {
                layout.mask_missing_columns(&mut delta);
            }
            grad.add_scaled(seed, &delta);
        }
        Ok(())
    }

    pub fn transfer_to(&mut self, placement: trellis_core::Placement) {
        self.log_softmax.transfer_to(placement);
        self.softmax.transfer_to(placement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::PackingFlags;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    #[test]
    fn test_square_error_forward() {
        let a = Matrix::from_columns(2, 1, vec![1.0, 2.0]);
        let b = Matrix::from_columns(2, 1, vec![0.0, 0.0]);
        let mut state = SquareErrorState::new();
        let v = state.evaluate(&a, &b, None).unwrap();
        // 1/2 * (1 + 4)
        assert!(close(v.first(), 2.5));
    }

    #[test]
    fn test_square_error_gradients_are_opposite() {
        let a = Matrix::from_columns(1, 2, vec![3.0, -1.0]);
        let b = Matrix::from_columns(1, 2, vec![1.0, 1.0]);
        let mut state = SquareErrorState::new();
        state.evaluate(&a, &b, None).unwrap();

        let mut ga = Matrix::zeros(1, 2);
        let mut gb = Matrix::zeros(1, 2);
        state.partial(0, 2.0, &mut ga).unwrap();
        state.partial(1, 2.0, &mut gb).unwrap();
        assert_eq!(ga.data(), &[4.0, -4.0]);
        assert_eq!(gb.data(), &[-4.0, 4.0]);
    }

    #[test]
    fn test_cross_entropy_with_softmax_uniform_logits() {
        // Equal logits over 2 classes: loss is ln 2 per labeled column.
        let label = Matrix::from_columns(2, 1, vec![1.0, 0.0]);
        let pred = Matrix::from_columns(2, 1, vec![0.0, 0.0]);
        let mut state = CrossEntropyWithSoftmaxState::new();
        let v = state.evaluate(&label, &pred, None).unwrap();
        assert!(close(v.first(), 2.0f64.ln()));

        let mut g = Matrix::zeros(2, 1);
        state.partial(1, 1.0, &label, None, &mut g).unwrap();
        assert!(close(g.get(0, 0), 0.5 - 1.0));
        assert!(close(g.get(1, 0), 0.5));
    }

    #[test]
    fn test_cross_entropy_forward_and_prediction_gradient() {
        let label = Matrix::from_columns(2, 1, vec![0.5, 0.5]);
        let pred = Matrix::from_columns(2, 1, vec![0.25, 0.75]);
        let mut state = CrossEntropyState::new();
        let v = state.evaluate(&label, &pred, None).unwrap();
        assert!(close(v.first(), -(0.5 * 0.25f64.ln() + 0.5 * 0.75f64.ln())));

        let mut g = Matrix::zeros(2, 1);
        state
            .partial(1, 1.0, &label, &pred, None, &mut g)
            .unwrap();
        assert!(close(g.get(0, 0), -0.5 / 0.25));
        assert!(close(g.get(1, 0), -0.5 / 0.75));
    }

    #[test]
    fn test_masked_column_contributes_nothing() {
        // Second time step carries no label; loss and gradient must
        // match the single-column case exactly.
        let mut layout = MinibatchLayout::dense(2, 1);
        layout.set(1, 0, PackingFlags::NO_LABEL);

        let label = Matrix::from_columns(2, 2, vec![1.0, 0.0, 0.0, 1.0]);
        let pred = Matrix::from_columns(2, 2, vec![0.2, -0.4, 9.0, 9.0]);

        let mut masked = CrossEntropyWithSoftmaxState::new();
        let v = masked.evaluate(&label, &pred, Some(&layout)).unwrap();

        let label1 = Matrix::from_columns(2, 1, vec![1.0, 0.0]);
        let pred1 = Matrix::from_columns(2, 1, vec![0.2, -0.4]);
        let mut single = CrossEntropyWithSoftmaxState::new();
        let v1 = single.evaluate(&label1, &pred1, None).unwrap();
        assert!(close(v.first(), v1.first()));

        let mut g = Matrix::zeros(2, 2);
        masked
            .partial(1, 1.0, &label, Some(&layout), &mut g)
            .unwrap();
        assert_eq!(g.col(1), &[0.0, 0.0]);
        assert!(g.col(0).iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_partial_before_evaluate_is_an_error() {
        let state = SquareErrorState::<f64>::new();
        let mut g = Matrix::zeros(1, 1);
        let err = state.partial(0, 1.0, &mut g).unwrap_err();
        assert!(matches!(err, CriterionError::InvalidState { .. }));
    }
}
