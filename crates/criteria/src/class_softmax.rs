//! # Class-Based Hierarchical Softmax
//!
//! Factors `P(word)` into `P(class) · P(word | class)`: a softmax over
//! word classes plus a softmax restricted to the words of the observed
//! class. Only the observed class's slice of the vocabulary is ever
//! touched, so the cost per column is the class width, not the
//! vocabulary size.
//!
//! ## Label Encoding
//!
//! Input 0 has four rows per column: the word id, its class id, and the
//! `[left, right)` bounds of that class's contiguous word-id range. A
//! zero-width class with word id 0 marks "no word at this position" and
//! is skipped; a zero-width class with any other word id is corrupt
//! data. The label matrix is walked element-by-element on the host and
//! must be host-resident.

use num_traits::Float;
use trellis_core::tensor::log_softmax_slice;
use trellis_core::{CriterionError, Matrix, MinibatchLayout};

use crate::node::{check_layout, dot, InputMeta};

const OP: &str = "ClassBasedCrossEntropyWithSoftmax";

/// Cached forward state. The in-class softmax is stored packed: one row
/// whose columns are the concatenated class slices of every column of
/// the minibatch, `total_words` wide.
#[derive(Debug, Clone)]
pub struct ClassSoftmaxState<E> {
    log_softmax: Matrix<E>,
    softmax: Matrix<E>,
    cls_log_softmax: Matrix<E>,
    cls_softmax: Matrix<E>,
    grad_to_softmax_input: Matrix<E>,
    total_words: usize,
    grad_generation: u64,
}

struct ColumnLabel {
    word: usize,
    class: usize,
    left: usize,
    right: usize,
}

impl ColumnLabel {
    fn width(&self) -> usize {
        self.right - self.left
    }
}

pub(crate) fn validate(metas: &[InputMeta]) -> Result<(), CriterionError> {
    let (label, hidden, weight, cls) = (&metas[0], &metas[1], &metas[2], &metas[3]);
    if label.rows != 4 {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!("label must have 4 rows, got {}", label.rows),
        });
    }
    if label.cols != hidden.cols || label.cols != cls.cols {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "column counts disagree: label {}, hidden {}, class scores {}",
                label.cols, hidden.cols, cls.cols
            ),
        });
    }
    if hidden.rows != weight.rows {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "hidden dimension {} does not match weight rows {}",
                hidden.rows, weight.rows
            ),
        });
    }
    if cls.rows == 0 {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: "class score matrix must be non-empty".into(),
        });
    }
    if !label.placement.is_host() {
        return Err(CriterionError::DeviceResidencyViolation { op: OP, index: 0 });
    }
    Ok(())
}

fn decode_column<E: Float>(
    label: &Matrix<E>,
    col: usize,
    vocab: usize,
    classes: usize,
) -> Result<ColumnLabel, CriterionError> {
    let read = |row: usize, what: &str| -> Result<usize, CriterionError> {
        label
            .get(row, col)
            .to_usize()
            .ok_or_else(|| CriterionError::StructuralLabelError {
                op: OP,
                reason: format!("column {col}: {what} is not a valid index"),
            })
    };
    let decoded = ColumnLabel {
        word: read(0, "word id")?,
        class: read(1, "class id")?,
        left: read(2, "class left bound")?,
        right: read(3, "class right bound")?,
    };
    if decoded.right < decoded.left || decoded.right > vocab {
        return Err(CriterionError::StructuralLabelError {
            op: OP,
            reason: format!(
                "column {col}: class range [{}, {}) is invalid for a vocabulary of {vocab}",
                decoded.left, decoded.right
            ),
        });
    }
    if decoded.class >= classes {
        return Err(CriterionError::StructuralLabelError {
            op: OP,
            reason: format!(
                "column {col}: class id {} out of {classes} classes",
                decoded.class
            ),
        });
    }
    if decoded.width() == 0 {
        if decoded.word != 0 {
            return Err(CriterionError::StructuralLabelError {
                op: OP,
                reason: format!(
                    "column {col}: zero-width class with word id {}",
                    decoded.word
                ),
            });
        }
    } else if decoded.word < decoded.left || decoded.word >= decoded.right {
        return Err(CriterionError::StructuralLabelError {
            op: OP,
            reason: format!(
                "column {col}: word id {} outside its class range [{}, {})",
                decoded.word, decoded.left, decoded.right
            ),
        });
    }
    Ok(decoded)
}

impl<E: Float> ClassSoftmaxState<E> {
    pub fn new() -> Self {
        Self {
            log_softmax: Matrix::zeros(0, 0),
            softmax: Matrix::zeros(0, 0),
            cls_log_softmax: Matrix::zeros(0, 0),
            cls_softmax: Matrix::zeros(0, 0),
            grad_to_softmax_input: Matrix::zeros(0, 0),
            total_words: 0,
            grad_generation: 0,
        }
    }

    pub(crate) fn prepare(&mut self, classes: usize, cols: usize) {
        self.cls_log_softmax.resize(classes, cols);
        self.cls_softmax.resize(classes, cols);
    }

    pub fn evaluate(
        &mut self,
        label: &Matrix<E>,
        hidden: &Matrix<E>,
        weight: &Matrix<E>,
        cls_scores: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        check_layout(OP, label.cols(), layout)?;
        let vocab = weight.cols();
        let classes = cls_scores.rows();
        let cols = label.cols();
        let missing = |t: usize| layout.map_or(false, |l| l.col_is_missing(t));

        // First pass: structural checks and the packed width.
        let mut total_words = 0;
        for t in 0..cols {
            total_words += decode_column(label, t, vocab, classes)?.width();
        }
        self.total_words = total_words;

        self.cls_log_softmax.set_value(cls_scores);
        self.cls_log_softmax.log_softmax_columns();
        self.cls_softmax.set_value(&self.cls_log_softmax);
        self.cls_softmax.inplace_exp();

        self.log_softmax.resize(1, total_words);
        self.softmax.resize(1, total_words);

        let mut loss = E::zero();
        let mut sz = 0;
        for t in 0..cols {
            let lbl = decode_column(label, t, vocab, classes)?;
            let width = lbl.width();
            if width == 0 {
                continue;
            }
            if missing(t) {
                sz += width;
                continue;
            }
            {
                let region = &mut self.log_softmax.data_mut()[sz..sz + width];
                for (j, slot) in region.iter_mut().enumerate() {
                    *slot = dot(weight.col(lbl.left + j), hidden.col(t));
                }
                log_softmax_slice(region);
            }
            for j in 0..width {
                let v = self.log_softmax.data()[sz + j].exp();
                self.softmax.data_mut()[sz + j] = v;
            }
            loss = loss
                + self.log_softmax.data()[sz + (lbl.word - lbl.left)]
                + self.cls_log_softmax.get(lbl.class, t);
            sz += width;
        }
        Ok(Matrix::scalar(-loss))
    }

    pub fn partial(
        &mut self,
        index: usize,
        seed: E,
        generation: u64,
        inputs: &[Matrix<E>],
        layout: Option<&MinibatchLayout>,
        grad: &mut Matrix<E>,
    ) -> Result<(), CriterionError> {
        let label = &inputs[0];
        let hidden = &inputs[1];
        let weight = &inputs[2];
        let cls_scores = &inputs[3];
        let vocab = weight.cols();
        let classes = cls_scores.rows();
        let cols = label.cols();
        // The packed softmax is only sized by the forward pass; a width
        // mismatch means no forward pass covered this minibatch.
        let mut total_words = 0;
        for t in 0..cols {
            total_words += decode_column(label, t, vocab, classes)?.width();
        }
        if self.softmax.len() != total_words {
            return Err(CriterionError::InvalidState {
                op: OP,
                reason: "evaluate must run before gradients".into(),
            });
        }
        let missing = |t: usize| layout.map_or(false, |l| l.col_is_missing(t));

        // Gradient to the in-class softmax input, shared by the hidden
        // and weight partials. Recomputed once per forward generation.
        if self.grad_generation != generation {
            self.grad_to_softmax_input.set_value(&self.softmax);
            let mut sz = 0;
            for t in 0..cols {
                let lbl = decode_column(label, t, vocab, classes)?;
                let width = lbl.width();
                if width == 0 {
                    continue;
                }
                if missing(t) {
                    sz += width;
                    continue;
                }
                self.grad_to_softmax_input.minus_one_at(sz + (lbl.word - lbl.left));
                sz += width;
            }
            self.grad_generation = generation;
        }

        match index {
            1 | 2 => {
                let mut sz = 0;
                for t in 0..cols {
                    let lbl = decode_column(label, t, vocab, classes)?;
                    let width = lbl.width();
                    if width == 0 {
                        continue;
                    }
                    if missing(t) {
                        sz += width;
                        continue;
                    }
                    for j in 0..width {
                        let g = seed * self.grad_to_softmax_input.data()[sz + j];
                        if index == 1 {
                            let wcol = weight.col(lbl.left + j);
                            for (dst, &w) in grad.col_mut(t).iter_mut().zip(wcol.iter()) {
                                *dst = *dst + g * w;
                            }
                        } else {
                            let hcol = hidden.col(t);
                            for (dst, &h) in
                                grad.col_mut(lbl.left + j).iter_mut().zip(hcol.iter())
                            {
                                *dst = *dst + g * h;
                            }
                        }
                    }
                    sz += width;
                }
            }
            3 => {
                for t in 0..cols {
                    let lbl = decode_column(label, t, vocab, classes)?;
                    if lbl.width() == 0 || missing(t) {
                        continue;
                    }
                    for k in 0..classes {
                        let indicator = if k == lbl.class { E::one() } else { E::zero() };
                        let delta = self.cls_softmax.get(k, t) - indicator;
                        grad.add_to_element(k, t, seed * delta);
                    }
                }
            }
            _ => {
                return Err(CriterionError::InvalidInputIndex {
                    op: OP,
                    index,
                    arity: 4,
                });
            }
        }
        Ok(())
    }

    pub fn transfer_to(&mut self, placement: trellis_core::Placement) {
        self.log_softmax.transfer_to(placement);
        self.softmax.transfer_to(placement);
        self.cls_log_softmax.transfer_to(placement);
        self.cls_softmax.transfer_to(placement);
        self.grad_to_softmax_input.transfer_to(placement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{log_sum_exp, PackingFlags};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    // V=4 words in C=2 classes: class 0 owns [0, 2), class 1 owns [2, 4).
    fn toy_inputs() -> (Matrix<f64>, Matrix<f64>) {
        let hidden = Matrix::from_columns(1, 1, vec![2.0]);
        let weight = Matrix::from_columns(1, 4, vec![0.1, -0.2, 0.3, 0.5]);
        (hidden, weight)
    }

    #[test]
    fn test_loss_is_class_term_plus_in_class_term() {
        let (hidden, weight) = toy_inputs();
        // Word 2 in class 1.
        let label = Matrix::from_rows(4, 1, vec![2.0, 1.0, 2.0, 4.0]);
        let cls_scores = Matrix::from_columns(2, 1, vec![0.4, 1.2]);

        let mut state = ClassSoftmaxState::new();
        let v = state
            .evaluate(&label, &hidden, &weight, &cls_scores, None)
            .unwrap();

        // In-class logits over words 2 and 3: [0.6, 1.0].
        let in_class = 0.6 - log_sum_exp(&[0.6, 1.0]);
        let class = 1.2 - log_sum_exp(&[0.4, 1.2]);
        assert!(close(v.first(), -(in_class + class)));
    }

    #[test]
    fn test_zero_width_class_with_word_zero_is_skipped() {
        let (hidden, weight) = toy_inputs();
        let label = Matrix::from_rows(4, 1, vec![0.0, 0.0, 0.0, 0.0]);
        let cls_scores = Matrix::from_columns(2, 1, vec![0.4, 1.2]);

        let mut state = ClassSoftmaxState::new();
        let v = state
            .evaluate(&label, &hidden, &weight, &cls_scores, None)
            .unwrap();
        assert_eq!(v.first(), 0.0);
    }

    #[test]
    fn test_zero_width_class_with_nonzero_word_is_corrupt() {
        let (hidden, weight) = toy_inputs();
        let label = Matrix::from_rows(4, 1, vec![1.0, 0.0, 0.0, 0.0]);
        let cls_scores = Matrix::from_columns(2, 1, vec![0.4, 1.2]);

        let mut state = ClassSoftmaxState::new();
        let err = state
            .evaluate(&label, &hidden, &weight, &cls_scores, None)
            .unwrap_err();
        assert!(matches!(err, CriterionError::StructuralLabelError { .. }));
    }

    #[test]
    fn test_word_outside_class_range_is_corrupt() {
        let (hidden, weight) = toy_inputs();
        // Word 1 claimed to be in class 1's range [2, 4).
        let label = Matrix::from_rows(4, 1, vec![1.0, 1.0, 2.0, 4.0]);
        let cls_scores = Matrix::from_columns(2, 1, vec![0.4, 1.2]);

        let mut state = ClassSoftmaxState::new();
        let err = state
            .evaluate(&label, &hidden, &weight, &cls_scores, None)
            .unwrap_err();
        assert!(matches!(err, CriterionError::StructuralLabelError { .. }));
    }

    #[test]
    fn test_masked_column_contributes_nothing() {
        // Second column flagged missing; loss and every gradient must
        // match the single-column minibatch exactly.
        let hidden = Matrix::from_columns(1, 2, vec![2.0, -1.0]);
        let weight = Matrix::from_columns(1, 4, vec![0.1, -0.2, 0.3, 0.5]);
        let label = Matrix::from_rows(4, 2, vec![2.0, 1.0, 1.0, 0.0, 2.0, 0.0, 4.0, 2.0]);
        let cls_scores = Matrix::from_columns(2, 2, vec![0.4, 1.2, -0.3, 0.6]);
        let mut layout = MinibatchLayout::dense(2, 1);
        layout.set(1, 0, PackingFlags::NO_LABEL);

        let mut masked = ClassSoftmaxState::new();
        let v = masked
            .evaluate(&label, &hidden, &weight, &cls_scores, Some(&layout))
            .unwrap();

        let label1 = Matrix::from_rows(4, 1, vec![2.0, 1.0, 2.0, 4.0]);
        let hidden1 = Matrix::from_columns(1, 1, vec![2.0]);
        let cls1 = Matrix::from_columns(2, 1, vec![0.4, 1.2]);
        let mut single = ClassSoftmaxState::new();
        let v1 = single
            .evaluate(&label1, &hidden1, &weight, &cls1, None)
            .unwrap();
        assert!(close(v.first(), v1.first()));

        let inputs = vec![label, hidden.clone(), weight, cls_scores];
        let mut g = Matrix::zeros(1, 2);
        masked
            .partial(1, 1.0, 1, &inputs, Some(&layout), &mut g)
            .unwrap();
        assert_eq!(g.col(1), &[0.0]);
        assert!(g.col(0)[0] != 0.0);

        let mut gc = Matrix::zeros(2, 2);
        masked
            .partial(3, 1.0, 1, &inputs, Some(&layout), &mut gc)
            .unwrap();
        assert_eq!(gc.col(1), &[0.0, 0.0]);
    }

    #[test]
    fn test_class_score_gradient_is_softmax_minus_onehot() {
        let (hidden, weight) = toy_inputs();
        let label = Matrix::from_rows(4, 1, vec![2.0, 1.0, 2.0, 4.0]);
        let cls_scores = Matrix::from_columns(2, 1, vec![0.4, 1.2]);

        let mut state = ClassSoftmaxState::new();
        state
            .evaluate(&label, &hidden, &weight, &cls_scores, None)
            .unwrap();

        let inputs = vec![label, hidden, weight, cls_scores.clone()];
        let mut g = Matrix::zeros(2, 1);
        state.partial(3, 1.0, 1, &inputs, None, &mut g).unwrap();

        let z = log_sum_exp(&[0.4, 1.2]);
        assert!(close(g.get(0, 0), (0.4 - z).exp()));
        assert!(close(g.get(1, 0), (1.2 - z).exp() - 1.0));
    }
}
