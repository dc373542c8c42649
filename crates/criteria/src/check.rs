//! # Gradient Checking
//!
//! Central-difference verification of the analytic gradients. Test
//! tooling, but shipped in the crate so downstream criteria can verify
//! themselves the same way.

use num_traits::Float;
use petgraph::graph::NodeIndex;
use thiserror::Error;
use trellis_core::CriterionError;

use crate::graph::CriterionGraph;

#[derive(Debug, Error)]
pub enum GradCheckError {
    #[error("gradient mismatch at ({row},{col}): analytic {analytic}, numeric {numeric}")]
    Mismatch {
        row: usize,
        col: usize,
        analytic: f64,
        numeric: f64,
    },
    #[error(transparent)]
    Criterion(#[from] CriterionError),
}

/// Central-difference derivative of `criterion`'s objective with
/// respect to one element of `source`'s value. Restores the perturbed
/// element and the graph's forward values before returning.
pub fn numerical_gradient<E: Float>(
    graph: &mut CriterionGraph<E>,
    criterion: NodeIndex,
    source: NodeIndex,
    row: usize,
    col: usize,
    eps: E,
) -> Result<E, CriterionError> {
    let original = graph.value(source).get(row, col);

    graph.value_mut(source).set(row, col, original + eps);
    graph.forward()?;
    let plus = graph.value(criterion).first();

    graph.value_mut(source).set(row, col, original - eps);
    graph.forward()?;
    let minus = graph.value(criterion).first();

    graph.value_mut(source).set(row, col, original);
    graph.forward()?;

    Ok((plus - minus) / (eps + eps))
}

/// Compare the analytic gradient flowing into `source` against central
/// differences, element by element.
pub fn check_input_gradient<E: Float>(
    graph: &mut CriterionGraph<E>,
    criterion: NodeIndex,
    source: NodeIndex,
    eps: E,
    tolerance: E,
) -> Result<(), GradCheckError> {
    graph.forward()?;
    graph.backward(criterion, E::one())?;
    let analytic = graph.gradient(source).clone();

    for row in 0..analytic.rows() {
        for col in 0..analytic.cols() {
            let numeric = numerical_gradient(graph, criterion, source, row, col, eps)?;
            let a = analytic.get(row, col);
            let scale = E::one() + a.abs() + numeric.abs();
            if (a - numeric).abs() > tolerance * scale {
                return Err(GradCheckError::Mismatch {
                    row,
                    col,
                    analytic: a.to_f64().unwrap_or(f64::NAN),
                    numeric: numeric.to_f64().unwrap_or(f64::NAN),
                });
            }
        }
    }
    Ok(())
}
