//! # Chain CRF
//!
//! Linear-chain conditional random field over per-position emission
//! scores and a tag-transition matrix. The loss per sequence is
//! `log Z - score(observed path)`, with `log Z` from the log-domain
//! forward recursion.
//!
//! ## Trellis Layout
//!
//! `alpha`, `beta` and `post_prob` mirror the emission matrix, one
//! column per position. The backward recursion is folded so that
//! `exp(beta[k, t])` is directly the posterior marginal `P(y_t = k)`;
//! `post_prob` stores exactly that, and the emission gradient is then
//! `post_prob - label`.
//!
//! `transition.get(k, j)` scores the move from tag `j` to tag `k`.
//! Multiple parallel sequences partition the columns contiguously: with
//! `S` streams over `N` columns, stream `i` owns columns
//! `[i·N/S, (i+1)·N/S)`, all streams equal length.

use num_traits::Float;
use trellis_core::{log_sum_exp, CriterionError, Matrix, MinibatchLayout};

use crate::node::{check_layout, InputMeta};

const OP: &str = "CRF";

#[derive(Debug, Clone)]
pub struct CrfState<E> {
    alpha: Matrix<E>,
    beta: Matrix<E>,
    post_prob: Matrix<E>,
}

pub(crate) fn validate(metas: &[InputMeta]) -> Result<(), CriterionError> {
    let (label, emission, trans) = (&metas[0], &metas[1], &metas[2]);
    if label.rows == 0 || label.cols == 0 {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: "label must be non-empty".into(),
        });
    }
    if (label.rows, label.cols) != (emission.rows, emission.cols) {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "label {}x{} vs emission {}x{}",
                label.rows, label.cols, emission.rows, emission.cols
            ),
        });
    }
    if trans.rows != label.rows || trans.cols != label.rows {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "transition must be {0}x{0}, got {1}x{2}",
                label.rows, trans.rows, trans.cols
            ),
        });
    }
    if !label.placement.is_host() {
        return Err(CriterionError::DeviceResidencyViolation { op: OP, index: 0 });
    }
    Ok(())
}

fn decode_one_hot<E: Float>(label: &Matrix<E>, col: usize) -> Result<usize, CriterionError> {
    let mut found = None;
    for (k, &v) in label.col(col).iter().enumerate() {
        if v != E::zero() {
            if found.is_some() {
                return Err(CriterionError::StructuralLabelError {
                    op: OP,
                    reason: format!("column {col}: more than one active tag"),
                });
            }
            found = Some(k);
        }
    }
    found.ok_or_else(|| CriterionError::StructuralLabelError {
        op: OP,
        reason: format!("column {col}: no active tag"),
    })
}

fn stream_split(
    cols: usize,
    layout: Option<&MinibatchLayout>,
) -> Result<(usize, usize), CriterionError> {
    let streams = layout.map_or(1, |l| l.num_parallel_sequences());
    if streams == 0 || cols % streams != 0 {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!("{cols} columns cannot be split into {streams} equal-length sequences"),
        });
    }
    Ok((streams, cols / streams))
}

impl<E: Float> CrfState<E> {
    pub fn new() -> Self {
        Self {
            alpha: Matrix::zeros(0, 0),
            beta: Matrix::zeros(0, 0),
            post_prob: Matrix::zeros(0, 0),
        }
    }

    pub(crate) fn prepare(&mut self, tags: usize, cols: usize) {
        self.alpha.resize(tags, cols);
        self.beta.resize(tags, cols);
        self.post_prob.resize(tags, cols);
    }

    pub fn evaluate(
        &mut self,
        label: &Matrix<E>,
        emission: &Matrix<E>,
        trans: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        let cols = label.cols();
        check_layout(OP, cols, layout)?;
        let (streams, nstep) = stream_split(cols, layout)?;

        let tags = emission.rows();
        self.alpha.resize(tags, cols);
        self.beta.resize(tags, cols);
        self.post_prob.resize(tags, cols);

        let mut total = E::zero();
        for s in 0..streams {
            total = total + self.forward_backward_one(label, emission, trans, s * nstep, nstep)?;
        }
        Ok(Matrix::scalar(total))
    }

    /// Forward-backward over one sequence occupying columns
    /// `[base, base + nstep)`; returns its `log Z - path score`.
    fn forward_backward_one(
        &mut self,
        label: &Matrix<E>,
        emission: &Matrix<E>,
        trans: &Matrix<E>,
        base: usize,
        nstep: usize,
    ) -> Result<E, CriterionError> {
        let tags = emission.rows();
        let mut scratch = vec![E::zero(); tags];

        // Forward: alpha[k, t] = lse_j(alpha[j, t-1] + trans[k, j]) + emission[k, t]
        for k in 0..tags {
            self.alpha.set(k, base, emission.get(k, base));
        }
        for t in 1..nstep {
            let g = base + t;
            for k in 0..tags {
                for j in 0..tags {
                    scratch[j] = self.alpha.get(j, g - 1) + trans.get(k, j);
                }
                self.alpha.set(k, g, log_sum_exp(&scratch) + emission.get(k, g));
            }
        }
        let last = base + nstep - 1;
        let log_z = log_sum_exp(self.alpha.col(last));

        // Backward, folded: exp(beta[k, t]) = P(y_t = k).
        for k in 0..tags {
            self.beta.set(k, last, self.alpha.get(k, last) - log_z);
        }
        let mut fsum = vec![E::zero(); tags];
        for t in (0..nstep.saturating_sub(1)).rev() {
            let g = base + t;
            for (j, f) in fsum.iter_mut().enumerate() {
                for m in 0..tags {
                    scratch[m] = self.alpha.get(m, g) + trans.get(j, m);
                }
                *f = log_sum_exp(&scratch);
            }
            for k in 0..tags {
                for j in 0..tags {
                    scratch[j] =
                        self.beta.get(j, g + 1) + self.alpha.get(k, g) + trans.get(j, k) - fsum[j];
                }
                self.beta.set(k, g, log_sum_exp(&scratch));
            }
        }
        for t in 0..nstep {
            let g = base + t;
            for k in 0..tags {
                self.post_prob.set(k, g, self.beta.get(k, g).exp());
            }
        }

        // Score of the observed tag path.
        let mut path = Vec::with_capacity(nstep);
        for t in 0..nstep {
            path.push(decode_one_hot(label, base + t)?);
        }
        let mut score = E::zero();
        for (t, &tag) in path.iter().enumerate() {
            score = score + emission.get(tag, base + t);
        }
        for t in 0..nstep - 1 {
            score = score + trans.get(path[t + 1], path[t]);
        }
        Ok(log_z - score)
    }

    pub fn partial(
        &self,
        index: usize,
        seed: E,
        inputs: &[Matrix<E>],
        layout: Option<&MinibatchLayout>,
        grad: &mut Matrix<E>,
    ) -> Result<(), CriterionError> {
        let label = &inputs[0];
        let trans = &inputs[2];
        if self.post_prob.is_empty() {
            return Err(CriterionError::InvalidState {
                op: OP,
                reason: "evaluate must run before gradients".into(),
            });
        }
        match index {
            // d/d emission = posterior - observed
            1 => {
                let mut diff = Matrix::zeros(0, 0);
                diff.assign_difference_of(&self.post_prob, label);
                grad.add_scaled(seed, &diff);
            }
            // d/d trans(j, k) = expected count of k -> j minus observed
            2 => {
                let cols = label.cols();
                let (streams, nstep) = stream_split(cols, layout)?;
                let tags = trans.rows();
                let mut scratch = vec![E::zero(); tags];
                for s in 0..streams {
                    let base = s * nstep;
                    for t in 0..nstep.saturating_sub(1) {
                        let g = base + t;
                        for j in 0..tags {
                            for m in 0..tags {
                                scratch[m] = self.alpha.get(m, g) + trans.get(j, m);
                            }
                            let fsum = log_sum_exp(&scratch);
                            for k in 0..tags {
                                let expected = (self.alpha.get(k, g) + trans.get(j, k) - fsum
                                    + self.beta.get(j, g + 1))
                                .exp();
                                grad.add_to_element(j, k, seed * expected);
                            }
                        }
                    }
                    let mut prev = decode_one_hot(label, base)?;
                    for t in 1..nstep {
                        let cur = decode_one_hot(label, base + t)?;
                        grad.add_to_element(cur, prev, -seed);
                        prev = cur;
                    }
                }
            }
            _ => {
                return Err(CriterionError::InvalidInputIndex {
                    op: OP,
                    index,
                    arity: 3,
                });
            }
        }
        Ok(())
    }

    pub fn transfer_to(&mut self, placement: trellis_core::Placement) {
        self.alpha.transfer_to(placement);
        self.beta.transfer_to(placement);
        self.post_prob.transfer_to(placement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elementwise::CrossEntropyWithSoftmaxState;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    #[test]
    fn test_length_one_sequence_is_softmax_cross_entropy() {
        // With a single position no transition fires, so the loss must
        // equal cross entropy with softmax over the emission column.
        let label = Matrix::from_columns(3, 1, vec![0.0, 1.0, 0.0]);
        let emission = Matrix::from_columns(3, 1, vec![1.0, 2.0, 3.0]);
        let trans = Matrix::from_rows(3, 3, vec![0.5, -1.0, 0.2, 0.1, 0.0, 0.9, -0.3, 0.4, 0.7]);

        let mut crf = CrfState::new();
        let v = crf.evaluate(&label, &emission, &trans, None).unwrap();

        let mut ce = CrossEntropyWithSoftmaxState::new();
        let v_ce = ce.evaluate(&label, &emission, None).unwrap();
        assert!(close(v.first(), v_ce.first()));
    }

    #[test]
    fn test_length_one_transition_gradient_is_zero() {
        let label = Matrix::from_columns(2, 1, vec![1.0, 0.0]);
        let emission = Matrix::from_columns(2, 1, vec![0.3, -0.2]);
        let trans = Matrix::from_rows(2, 2, vec![0.1, 0.2, 0.3, 0.4]);

        let mut crf = CrfState::new();
        crf.evaluate(&label, &emission, &trans, None).unwrap();

        let inputs = vec![label, emission, trans];
        let mut g = Matrix::zeros(2, 2);
        crf.partial(2, 1.0, &inputs, None, &mut g).unwrap();
        assert!(g.data().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_posteriors_sum_to_one_per_position() {
        let label = Matrix::from_rows(2, 3, vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        let emission = Matrix::from_rows(2, 3, vec![0.5, 1.5, -0.5, -1.0, 0.2, 0.8]);
        let trans = Matrix::from_rows(2, 2, vec![0.3, -0.6, 0.1, 0.4]);

        let mut crf = CrfState::new();
        crf.evaluate(&label, &emission, &trans, None).unwrap();
        for t in 0..3 {
            let total: f64 = crf.post_prob.col(t).iter().sum();
            assert!(close(total, 1.0));
        }
    }

    #[test]
    fn test_observed_path_has_zero_loss_when_certain() {
        // Overwhelming emissions make the path posterior near 1; the
        // loss approaches zero from above.
        let label = Matrix::from_rows(2, 2, vec![1.0, 0.0, 0.0, 1.0]);
        let emission = Matrix::from_rows(2, 2, vec![100.0, -100.0, -100.0, 100.0]);
        let trans = Matrix::from_rows(2, 2, vec![0.0, 0.0, 0.0, 0.0]);

        let mut crf = CrfState::new();
        let v = crf.evaluate(&label, &emission, &trans, None).unwrap();
        assert!(v.first() >= 0.0);
        assert!(v.first() < 1e-6);
    }

    #[test]
    fn test_parallel_streams_sum_independent_losses() {
        // Two streams of two steps each, packed contiguously.
        let layout = MinibatchLayout::dense(2, 2);
        let label = Matrix::from_rows(
            2,
            4,
            vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0],
        );
        let emission = Matrix::from_rows(
            2,
            4,
            vec![0.5, 1.0, -0.3, 0.2, -0.1, 0.6, 0.9, -0.8],
        );
        let trans = Matrix::from_rows(2, 2, vec![0.2, -0.4, 0.3, 0.1]);

        let mut joint = CrfState::new();
        let v = joint
            .evaluate(&label, &emission, &trans, Some(&layout))
            .unwrap();

        let mut total = 0.0;
        for s in 0..2 {
            let lbl = Matrix::from_columns(2, 2, label.col_range(s * 2, 2).to_vec());
            let emi = Matrix::from_columns(2, 2, emission.col_range(s * 2, 2).to_vec());
            let mut single = CrfState::new();
            total += single.evaluate(&lbl, &emi, &trans, None).unwrap().first();
        }
        assert!(close(v.first(), total));
    }

    #[test]
    fn test_uneven_stream_split_rejected() {
        let layout = MinibatchLayout::dense(1, 2);
        let label = Matrix::from_columns(2, 3, vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        let emission = Matrix::zeros(2, 3);
        let trans = Matrix::zeros(2, 2);

        let mut crf = CrfState::new();
        let err = crf
            .evaluate(&label, &emission, &trans, Some(&layout))
            .unwrap_err();
        assert!(matches!(err, CriterionError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_column_without_active_tag_rejected() {
        let label = Matrix::zeros(2, 1);
        let emission = Matrix::from_columns(2, 1, vec![0.1, 0.2]);
        let trans = Matrix::zeros(2, 2);

        let mut crf = CrfState::new();
        let err = crf.evaluate(&label, &emission, &trans, None).unwrap_err();
        assert!(matches!(err, CriterionError::StructuralLabelError { .. }));
    }
}
