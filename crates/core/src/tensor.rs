//! # Matrix - Column-Major Numeric Buffer
//!
//! The one tensor type the criteria consume. Storage is column-major, so
//! a contiguous range of columns is a contiguous slice of the backing
//! buffer — column views come out as plain `&[E]` / `&mut [E]` with no
//! copying, which the per-column loops in the hierarchical-softmax and
//! CRF criteria rely on.
//!
//! The operation set is deliberately small: elementwise log/exp/sign,
//! column- and row-wise log-softmax, inner product reduced to a scalar,
//! Frobenius and L1 norms, scale-and-accumulate, and the stable log-add
//! family. Everything here is a synchronous host computation; the
//! `Placement` tag records where the buffer is *supposed* to live and is
//! checked by node validation, never acted on here.

use num_traits::Float;

use crate::device::Placement;

/// Stable `log(e^x + e^y)` without overflow.
///
/// Negative infinity is the additive identity: `log_add(x, -inf) == x`.
pub fn log_add<E: Float>(x: E, y: E) -> E {
    let (hi, lo) = if x >= y { (x, y) } else { (y, x) };
    if lo == E::neg_infinity() {
        return hi;
    }
    hi + (E::one() + (lo - hi).exp()).ln()
}

/// Stable `log(sum_i e^{x_i})` over a slice.
pub fn log_sum_exp<E: Float>(xs: &[E]) -> E {
    let mut acc = E::neg_infinity();
    for &x in xs {
        acc = log_add(acc, x);
    }
    acc
}

/// A 2D numeric buffer in column-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<E> {
    rows: usize,
    cols: usize,
    data: Vec<E>,
    placement: Placement,
}

impl<E: Float> Matrix<E> {
    /// Create a matrix of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![E::zero(); rows * cols],
            placement: Placement::Host,
        }
    }

    /// Create a 1×1 matrix holding one value.
    pub fn scalar(value: E) -> Self {
        Self {
            rows: 1,
            cols: 1,
            data: vec![value],
            placement: Placement::Host,
        }
    }

    /// Create a matrix from column-major data.
    pub fn from_columns(rows: usize, cols: usize, data: Vec<E>) -> Self {
        assert_eq!(
            data.len(),
            rows * cols,
            "data length {} doesn't match {}x{}",
            data.len(),
            rows,
            cols
        );
        Self {
            rows,
            cols,
            data,
            placement: Placement::Host,
        }
    }

    /// Create a matrix from row-major data (convenient in tests, where
    /// literals read the way the math is written).
    pub fn from_rows(rows: usize, cols: usize, data: Vec<E>) -> Self {
        assert_eq!(data.len(), rows * cols);
        let mut m = Self::zeros(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                m.set(r, c, data[r * cols + c]);
            }
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Re-tag this matrix's intended residency. A tag change only; the
    /// buffer itself is always host storage in this implementation.
    pub fn transfer_to(&mut self, placement: Placement) {
        self.placement = placement;
    }

    pub fn get(&self, r: usize, c: usize) -> E {
        debug_assert!(r < self.rows && c < self.cols);
        self.data[c * self.rows + r]
    }

    pub fn set(&mut self, r: usize, c: usize, v: E) {
        debug_assert!(r < self.rows && c < self.cols);
        self.data[c * self.rows + r] = v;
    }

    /// The (0,0) element — criterion outputs are 1×1, and the chain-rule
    /// seed is read from here.
    pub fn first(&self) -> E {
        self.data[0]
    }

    /// Resize to `rows × cols`, zero-filled. Placement survives.
    pub fn resize(&mut self, rows: usize, cols: usize) {
        self.rows = rows;
        self.cols = cols;
        self.data.clear();
        self.data.resize(rows * cols, E::zero());
    }

    /// Copy another matrix's shape and contents into this one.
    pub fn set_value(&mut self, other: &Matrix<E>) {
        self.rows = other.rows;
        self.cols = other.cols;
        self.data.clear();
        self.data.extend_from_slice(&other.data);
    }

    pub fn fill(&mut self, v: E) {
        for x in &mut self.data {
            *x = v;
        }
    }

    pub fn data(&self) -> &[E] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [E] {
        &mut self.data
    }

    // ========================================================================
    // Column views
    // ========================================================================

    /// View of one column.
    pub fn col(&self, c: usize) -> &[E] {
        &self.data[c * self.rows..(c + 1) * self.rows]
    }

    pub fn col_mut(&mut self, c: usize) -> &mut [E] {
        &mut self.data[c * self.rows..(c + 1) * self.rows]
    }

    /// View of `n` contiguous columns starting at `start`.
    pub fn col_range(&self, start: usize, n: usize) -> &[E] {
        &self.data[start * self.rows..(start + n) * self.rows]
    }

    pub fn col_range_mut(&mut self, start: usize, n: usize) -> &mut [E] {
        &mut self.data[start * self.rows..(start + n) * self.rows]
    }

    /// Zero one column in place.
    pub fn zero_col(&mut self, c: usize) {
        for x in self.col_mut(c) {
            *x = E::zero();
        }
    }

    // ========================================================================
    // Elementwise assignment
    // ========================================================================

    /// `self = a - b`, resizing to match.
    pub fn assign_difference_of(&mut self, a: &Matrix<E>, b: &Matrix<E>) {
        debug_assert_eq!((a.rows, a.cols), (b.rows, b.cols));
        self.resize(a.rows, a.cols);
        for (dst, (&x, &y)) in self.data.iter_mut().zip(a.data.iter().zip(b.data.iter())) {
            *dst = x - y;
        }
    }

    /// `self = a / b` elementwise, resizing to match.
    pub fn assign_element_division_of(&mut self, a: &Matrix<E>, b: &Matrix<E>) {
        debug_assert_eq!((a.rows, a.cols), (b.rows, b.cols));
        self.resize(a.rows, a.cols);
        for (dst, (&x, &y)) in self.data.iter_mut().zip(a.data.iter().zip(b.data.iter())) {
            *dst = x / y;
        }
    }

    /// `self = sign(a)` elementwise (-1, 0, +1), resizing to match.
    pub fn assign_sign_of(&mut self, a: &Matrix<E>) {
        self.resize(a.rows, a.cols);
        for (dst, &x) in self.data.iter_mut().zip(a.data.iter()) {
            *dst = if x > E::zero() {
                E::one()
            } else if x < E::zero() {
                -E::one()
            } else {
                E::zero()
            };
        }
    }

    /// `self += scale * other`. The one accumulation primitive gradient
    /// buffers are updated through — adds, never overwrites.
    pub fn add_scaled(&mut self, scale: E, other: &Matrix<E>) {
        debug_assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        for (dst, &x) in self.data.iter_mut().zip(other.data.iter()) {
            *dst = *dst + scale * x;
        }
    }

    /// `self[(r, c)] += v`. Scalar accumulation for gradients that land
    /// one element at a time (bias rows, transition cells).
    pub fn add_to_element(&mut self, r: usize, c: usize, v: E) {
        debug_assert!(r < self.rows && c < self.cols);
        self.data[c * self.rows + r] = self.data[c * self.rows + r] + v;
    }

    /// Subtract 1 at one flat element index. The indicator step of
    /// softmax-minus-onehot gradients over packed row buffers.
    pub fn minus_one_at(&mut self, index: usize) {
        self.data[index] = self.data[index] - E::one();
    }

    pub fn inplace_exp(&mut self) {
        for x in &mut self.data {
            *x = x.exp();
        }
    }

    pub fn inplace_log(&mut self) {
        for x in &mut self.data {
            *x = x.ln();
        }
    }

    // ========================================================================
    // Reductions
    // ========================================================================

    /// Frobenius norm: `sqrt(sum x^2)`.
    pub fn frobenius_norm(&self) -> E {
        self.data
            .iter()
            .fold(E::zero(), |acc, &x| acc + x * x)
            .sqrt()
    }

    /// L1 norm: `sum |x|`.
    pub fn norm1(&self) -> E {
        self.data.iter().fold(E::zero(), |acc, &x| acc + x.abs())
    }

    /// Inner product of two equal-shaped matrices, reduced to a scalar.
    pub fn inner_product(a: &Matrix<E>, b: &Matrix<E>) -> E {
        debug_assert_eq!((a.rows, a.cols), (b.rows, b.cols));
        a.data
            .iter()
            .zip(b.data.iter())
            .fold(E::zero(), |acc, (&x, &y)| acc + x * y)
    }

    /// Diagnostic only — callers log, they never branch on this.
    pub fn has_nan(&self) -> bool {
        self.data.iter().any(|x| x.is_nan())
    }

    // ========================================================================
    // Log-softmax
    // ========================================================================

    /// In-place log-softmax over each column.
    pub fn log_softmax_columns(&mut self) {
        let rows = self.rows;
        for c in 0..self.cols {
            log_softmax_slice(&mut self.data[c * rows..(c + 1) * rows]);
        }
    }

    /// In-place log-softmax over each row, for buffers laid out one
    /// distribution per row rather than per column. The criteria all
    /// normalize per column (or over packed slices via
    /// [`log_softmax_slice`]); this is the row-wise half of the tensor
    /// surface for callers that transpose their layout.
    pub fn log_softmax_rows(&mut self) {
        for r in 0..self.rows {
            let mut row: Vec<E> = (0..self.cols).map(|c| self.get(r, c)).collect();
            log_softmax_slice(&mut row);
            for (c, &v) in row.iter().enumerate() {
                self.set(r, c, v);
            }
        }
    }
}

/// In-place log-softmax over one contiguous slice.
pub fn log_softmax_slice<E: Float>(xs: &mut [E]) {
    let z = log_sum_exp(xs);
    for x in xs {
        *x = *x - z;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_log_add_identity() {
        assert!(close(log_add(3.0, f64::NEG_INFINITY), 3.0));
        assert!(close(log_add(f64::NEG_INFINITY, 3.0), 3.0));
    }

    #[test]
    fn test_log_add_symmetric() {
        let direct = (2.0f64.exp() + 5.0f64.exp()).ln();
        assert!(close(log_add(2.0, 5.0), direct));
        assert!(close(log_add(5.0, 2.0), direct));
    }

    #[test]
    fn test_log_sum_exp_large_magnitude() {
        // Would overflow if exponentiated directly.
        let xs = [1000.0f64, 1000.0, 1000.0];
        assert!(close(log_sum_exp(&xs), 1000.0 + 3.0f64.ln()));
    }

    #[test]
    fn test_column_major_layout() {
        // [1 3]
        // [2 4]
        let m = Matrix::from_columns(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(m.get(0, 1), 3.0);
        assert_eq!(m.col(1), &[3.0, 4.0]);
        assert_eq!(m.col_range(0, 2), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_from_rows_matches_from_columns() {
        let a = Matrix::from_rows(2, 2, vec![1.0, 3.0, 2.0, 4.0]);
        let b = Matrix::from_columns(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_norms() {
        let m = Matrix::from_columns(2, 2, vec![3.0, -4.0, 0.0, 0.0]);
        assert!(close(m.frobenius_norm(), 5.0));
        assert!(close(m.norm1(), 7.0));
    }

    #[test]
    fn test_add_scaled_accumulates() {
        let mut g = Matrix::from_columns(1, 2, vec![1.0, 1.0]);
        let d = Matrix::from_columns(1, 2, vec![2.0, 3.0]);
        g.add_scaled(0.5, &d);
        g.add_scaled(0.5, &d);
        assert_eq!(g.data(), &[3.0, 4.0]);
    }

    #[test]
    fn test_log_softmax_columns_normalizes() {
        let mut m = Matrix::from_columns(3, 2, vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
        m.log_softmax_columns();
        for c in 0..2 {
            let total: f64 = m.col(c).iter().map(|x| x.exp()).sum();
            assert!(close(total, 1.0));
        }
    }

    #[test]
    fn test_log_softmax_rows_on_row_vector() {
        let mut m = Matrix::from_columns(1, 3, vec![0.0, 0.0, 0.0]);
        m.log_softmax_rows();
        for c in 0..3 {
            assert!(close(m.get(0, c), -(3.0f64.ln())));
        }
    }

    #[test]
    fn test_sign_assignment() {
        let a = Matrix::from_columns(1, 3, vec![-2.5, 0.0, 7.0]);
        let mut s = Matrix::zeros(0, 0);
        s.assign_sign_of(&a);
        assert_eq!(s.data(), &[-1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_resize_zero_fills() {
        let mut m = Matrix::from_columns(1, 2, vec![5.0, 6.0]);
        m.resize(2, 2);
        assert_eq!(m.data(), &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_scalar_element_updates() {
        let mut m = Matrix::from_columns(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        m.add_to_element(1, 1, 0.5);
        assert_eq!(m.get(1, 1), 4.5);
        m.minus_one_at(0);
        assert_eq!(m.get(0, 0), 0.0);
    }

    #[test]
    fn test_has_nan() {
        let mut m = Matrix::<f64>::zeros(2, 2);
        assert!(!m.has_nan());
        m.set(1, 1, f64::NAN);
        assert!(m.has_nan());
    }
}
