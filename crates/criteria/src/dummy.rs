//! # Pass-Through Criterion
//!
//! For objectives computed outside the graph (sequence-level MMI and
//! similar lattice-based losses): input 0 is the precomputed 1×1
//! objective, input 1 the externally computed derivative with respect
//! to input 2, the prediction. Forward copies the objective through;
//! backward injects the supplied derivative, scaled by the seed.

use num_traits::Float;
use trellis_core::{CriterionError, Matrix};

use crate::node::InputMeta;

const OP: &str = "DummyCriterion";

pub(crate) fn validate(metas: &[InputMeta]) -> Result<(), CriterionError> {
    let (objective, derivative, prediction) = (&metas[0], &metas[1], &metas[2]);
    if objective.rows != 1 || objective.cols != 1 {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "objective must be 1x1, got {}x{}",
                objective.rows, objective.cols
            ),
        });
    }
    if prediction.rows == 0 || prediction.cols == 0 {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: "prediction must be non-empty".into(),
        });
    }
    if derivative.rows != prediction.rows {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "derivative has {} rows, prediction has {}",
                derivative.rows, prediction.rows
            ),
        });
    }
    Ok(())
}

pub fn evaluate<E: Float>(objective: &Matrix<E>) -> Result<Matrix<E>, CriterionError> {
    if objective.rows() != 1 || objective.cols() != 1 {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "objective must be 1x1, got {}x{}",
                objective.rows(),
                objective.cols()
            ),
        });
    }
    Ok(Matrix::scalar(objective.first()))
}

pub fn partial<E: Float>(
    seed: E,
    derivative: &Matrix<E>,
    grad: &mut Matrix<E>,
) -> Result<(), CriterionError> {
    if (derivative.rows(), derivative.cols()) != (grad.rows(), grad.cols()) {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "derivative {}x{} does not match prediction {}x{}",
                derivative.rows(),
                derivative.cols(),
                grad.rows(),
                grad.cols()
            ),
        });
    }
    grad.add_scaled(seed, derivative);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_passes_through() {
        let obj = Matrix::scalar(3.5);
        let v = evaluate(&obj).unwrap();
        assert_eq!(v.first(), 3.5);
    }

    #[test]
    fn test_non_scalar_objective_rejected() {
        let obj = Matrix::<f64>::zeros(1, 2);
        assert!(matches!(
            evaluate(&obj),
            Err(CriterionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_partial_injects_scaled_derivative() {
        let derivative = Matrix::from_columns(1, 3, vec![0.1, 0.2, 0.3]);
        let mut g = Matrix::zeros(1, 3);
        partial(2.0, &derivative, &mut g).unwrap();
        assert_eq!(g.data(), &[0.2, 0.4, 0.6]);
    }
}
