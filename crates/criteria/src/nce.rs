//! # Noise-Contrastive Estimation
//!
//! Trains a full-vocabulary softmax output layer without ever
//! normalizing over the vocabulary: each position contributes one true
//! sample and `k` noise samples, and the model learns to separate them
//! with per-sample logistic losses.
//!
//! ## Key Concepts
//!
//! - **Sample descriptor** — input 0 packs, per column, `(word id,
//!   log noise probability)` row pairs with the true sample first.
//!   A one-row descriptor instead selects an evaluation mode per the
//!   sign of its ids: non-negative means full softmax, negative means
//!   unnormalized scores with ids read as `|id|`.
//! - **Eval mode** — the node persists an [`NceEvalMode`]. Training
//!   (gradients) is only defined in `None` mode; the other two modes
//!   exist to score held-out data.
//! - **Stable logistic terms** — `-ln σ(Δ)` and `-ln(1 - σ(Δ))` are
//!   computed through `log_add`, never by exponentiating `Δ` directly.

use std::io::{self, Read, Seek, SeekFrom, Write};

use num_traits::Float;
use trellis_core::{log_add, log_sum_exp, CriterionError, Matrix, MinibatchLayout};

use crate::node::{check_layout, dot, efrom, InputMeta};

const OP: &str = "NCEBasedCrossEntropyWithSoftmax";

/// How the node scores a minibatch. Stored in checkpoints as a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NceEvalMode {
    /// Full softmax negative log-likelihood over the vocabulary.
    Softmax = 0,
    /// Negated sum of raw scores of the true words.
    Unnormalized = 1,
    /// Training: the noise-contrastive objective itself.
    None = 2,
}

/// Per-node state: the persisted eval mode plus the per-sample logistic
/// predictions cached by the forward pass for the backward pass.
#[derive(Debug, Clone)]
pub struct NceState<E> {
    pub mode: NceEvalMode,
    predictions: Matrix<E>,
    grad_to_score: Matrix<E>,
    grad_generation: u64,
}

pub(crate) fn validate(metas: &[InputMeta]) -> Result<(), CriterionError> {
    let (desc, hidden, weight, bias) = (&metas[0], &metas[1], &metas[2], &metas[3]);
    if desc.rows != 1 && (desc.rows < 4 || desc.rows % 2 != 0) {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "sample descriptor must have 1 row or an even row count of at least 4, got {}",
                desc.rows
            ),
        });
    }
    if desc.cols != hidden.cols {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "descriptor has {} columns, hidden activations have {}",
                desc.cols, hidden.cols
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
    if bias.rows != weight.cols || bias.cols != 1 {
        return Err(CriterionError::ShapeMismatch {
            op: OP,
            reason: format!(
                "bias must be {}x1, got {}x{}",
                weight.cols, bias.rows, bias.cols
            ),
        });
    }
    Ok(())
}

fn word_id<E: Float>(v: E, vocab: usize) -> Result<usize, CriterionError> {
    let id = v.to_usize().ok_or_else(|| CriterionError::StructuralLabelError {
        op: OP,
        reason: format!(
            "word id {} is not a valid vocabulary index",
            v.to_f64().unwrap_or(f64::NAN)
        ),
    })?;
    if id >= vocab {
        return Err(CriterionError::StructuralLabelError {
            op: OP,
            reason: format!("word id {id} out of vocabulary of size {vocab}"),
        });
    }
    Ok(id)
}

fn score<E: Float>(
    weight: &Matrix<E>,
    bias: &Matrix<E>,
    hidden: &Matrix<E>,
    word: usize,
    col: usize,
) -> E {
    dot(weight.col(word), hidden.col(col)) + bias.get(word, 0)
}

fn sigmoid<E: Float>(x: E) -> E {
    if x >= E::zero() {
        E::one() / (E::one() + (-x).exp())
    } else {
        let e = x.exp();
        e / (E::one() + e)
    }
}

impl<E: Float> NceState<E> {
    pub fn new(mode: NceEvalMode) -> Self {
        Self {
            mode,
            predictions: Matrix::zeros(0, 0),
            grad_to_score: Matrix::zeros(0, 0),
            grad_generation: 0,
        }
    }

    pub fn evaluate(
        &mut self,
        desc: &Matrix<E>,
        hidden: &Matrix<E>,
        weight: &Matrix<E>,
        bias: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        check_layout(OP, desc.cols(), layout)?;
        if desc.rows() == 1 {
            return self.evaluate_single_row(desc, hidden, weight, bias, layout);
        }
        match self.mode {
            NceEvalMode::Softmax => self.evaluate_softmax(desc, hidden, weight, bias, layout),
            NceEvalMode::Unnormalized => {
                self.evaluate_unnormalized(desc, hidden, weight, bias, layout)
            }
            NceEvalMode::None => self.evaluate_training(desc, hidden, weight, bias, layout),
        }
    }

    /// One-row descriptors carry only word ids; the sign selects the
    /// mode and must be consistent across the minibatch.
    fn evaluate_single_row(
        &mut self,
        desc: &Matrix<E>,
        hidden: &Matrix<E>,
        weight: &Matrix<E>,
        bias: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        let vocab = weight.cols();
        let missing = |t: usize| layout.map_or(false, |l| l.col_is_missing(t));
        let mut resolved: Option<NceEvalMode> = None;
        let mut total = E::zero();
        for t in 0..desc.cols() {
            if missing(t) {
                continue;
            }
            let v = desc.get(0, t);
            let mode = if v >= E::zero() {
                NceEvalMode::Softmax
            } else {
                NceEvalMode::Unnormalized
            };
            match resolved {
                None => resolved = Some(mode),
                Some(prev) if prev != mode => {
                    return Err(CriterionError::InvalidState {
                        op: OP,
                        reason: "one-row descriptor mixes positive and negative word ids".into(),
                    });
                }
                _ => {}
            }
            let y = word_id(v.abs(), vocab)?;
            match mode {
                NceEvalMode::Softmax => {
                    total = total + full_softmax_nll(y, t, hidden, weight, bias);
                }
                NceEvalMode::Unnormalized => {
                    total = total - score(weight, bias, hidden, y, t);
                }
                NceEvalMode::None => unreachable!(),
            }
        }
        Ok(Matrix::scalar(total))
    }

    fn evaluate_softmax(
        &mut self,
        desc: &Matrix<E>,
        hidden: &Matrix<E>,
        weight: &Matrix<E>,
        bias: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        let vocab = weight.cols();
        let missing = |t: usize| layout.map_or(false, |l| l.col_is_missing(t));
        let mut total = E::zero();
        for t in 0..desc.cols() {
            if missing(t) {
                continue;
            }
            let y = word_id(desc.get(0, t), vocab)?;
            total = total + full_softmax_nll(y, t, hidden, weight, bias);
        }
        Ok(Matrix::scalar(total))
    }

    fn evaluate_unnormalized(
        &mut self,
        desc: &Matrix<E>,
        hidden: &Matrix<E>,
        weight: &Matrix<E>,
        bias: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        let vocab = weight.cols();
        let missing = |t: usize| layout.map_or(false, |l| l.col_is_missing(t));
        let mut total = E::zero();
        for t in 0..desc.cols() {
            if missing(t) {
                continue;
            }
            let y = word_id(desc.get(0, t), vocab)?;
            total = total - score(weight, bias, hidden, y, t);
        }
        Ok(Matrix::scalar(total))
    }

    /// The noise-contrastive objective. For each sample `j` with noise
    /// probability `q`, `Δ = s(w) - ln(k·q(w))`; the true sample pays
    /// `-ln σ(Δ)` and each noise sample pays `-ln(1 - σ(Δ))`.
    fn evaluate_training(
        &mut self,
        desc: &Matrix<E>,
        hidden: &Matrix<E>,
        weight: &Matrix<E>,
        bias: &Matrix<E>,
        layout: Option<&MinibatchLayout>,
    ) -> Result<Matrix<E>, CriterionError> {
        let vocab = weight.cols();
        let cols = desc.cols();
        let pairs = desc.rows() / 2;
        let noise = pairs - 1;
        let log_noise = efrom::<E>((noise as f64).ln());
        let missing = |t: usize| layout.map_or(false, |l| l.col_is_missing(t));

        self.predictions.resize(pairs, cols);
        let mut total = E::zero();
        for t in 0..cols {
            if missing(t) {
                continue;
            }
            for j in 0..pairs {
                let id = word_id(desc.get(2 * j, t), vocab)?;
                let log_q = desc.get(2 * j + 1, t);
                let delta = score(weight, bias, hidden, id, t) - (log_noise + log_q);
                self.predictions.set(j, t, sigmoid(delta));
                // -ln σ(Δ) = log_add(0, -Δ); -ln(1-σ(Δ)) = log_add(0, Δ)
                let term = if j == 0 {
                    log_add(E::zero(), -delta)
                } else {
                    log_add(E::zero(), delta)
                };
                total = total + term;
            }
        }
        Ok(Matrix::scalar(total))
    }

    /// Training gradients. The per-sample gradient to the score is
    /// `σ - 1` for the true sample and `σ` for noise samples; it is
    /// computed once per forward generation and fanned out to the
    /// hidden activations, the weight matrix and the bias.
    pub fn partial(
        &mut self,
        index: usize,
        seed: E,
        generation: u64,
        inputs: &[Matrix<E>],
        layout: Option<&MinibatchLayout>,
        grad: &mut Matrix<E>,
    ) -> Result<(), CriterionError> {
        let desc = &inputs[0];
        let hidden = &inputs[1];
        let weight = &inputs[2];
        let vocab = weight.cols();
        if desc.rows() == 1 {
            return Err(CriterionError::InvalidState {
                op: OP,
                reason: "one-row descriptor supports evaluation only".into(),
            });
        }
        let pairs = desc.rows() / 2;
        let cols = desc.cols();
        if self.predictions.is_empty() || self.predictions.rows() != pairs {
            return Err(CriterionError::InvalidState {
                op: OP,
                reason: "evaluate must run before gradients".into(),
            });
        }
        let missing = |t: usize| layout.map_or(false, |l| l.col_is_missing(t));

        if self.grad_generation != generation {
            self.grad_to_score.resize(pairs, cols);
            for t in 0..cols {
                if missing(t) {
                    continue;
                }
                for j in 0..pairs {
                    let sigma = self.predictions.get(j, t);
                    let g = if j == 0 { sigma - E::one() } else { sigma };
                    self.grad_to_score.set(j, t, g);
                }
            }
            self.grad_generation = generation;
        }

        for t in 0..cols {
            if missing(t) {
                continue;
            }
            for j in 0..pairs {
                let id = word_id(desc.get(2 * j, t), vocab)?;
                let g = seed * self.grad_to_score.get(j, t);
                match index {
                    1 => {
                        let wcol = weight.col(id);
                        for (dst, &w) in grad.col_mut(t).iter_mut().zip(wcol.iter()) {
                            *dst = *dst + g * w;
                        }
                    }
                    2 => {
                        let hcol = hidden.col(t);
                        for (dst, &h) in grad.col_mut(id).iter_mut().zip(hcol.iter()) {
                            *dst = *dst + g * h;
                        }
                    }
                    3 => {
                        grad.add_to_element(id, 0, g);
                    }
                    _ => {
                        return Err(CriterionError::InvalidInputIndex {
                            op: OP,
                            index,
                            arity: 4,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn save_mode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&(self.mode as u32).to_le_bytes())
    }

    /// Checkpoints written before the eval mode existed have another
    /// field where the mode word would be; on an out-of-range value the
    /// word is put back for the next field and the mode defaults to
    /// `None`.
    pub fn load_mode<R: Read + Seek>(&mut self, reader: &mut R) -> io::Result<()> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        self.mode = match u32::from_le_bytes(buf) {
            0 => NceEvalMode::Softmax,
            1 => NceEvalMode::Unnormalized,
            2 => NceEvalMode::None,
            _ => {
                reader.seek(SeekFrom::Current(-4))?;
                NceEvalMode::None
            }
        };
        Ok(())
    }

    pub fn transfer_to(&mut self, placement: trellis_core::Placement) {
        self.predictions.transfer_to(placement);
        self.grad_to_score.transfer_to(placement);
    }
}

fn full_softmax_nll<E: Float>(
    y: usize,
    col: usize,
    hidden: &Matrix<E>,
    weight: &Matrix<E>,
    bias: &Matrix<E>,
) -> E {
    let logits: Vec<E> = (0..weight.cols())
        .map(|w| score(weight, bias, hidden, w, col))
        .collect();
    log_sum_exp(&logits) - logits[y]
}
