//! # Minibatch Layout
//!
//! A minibatch packs `S` parallel sequence streams over `T` time steps
//! into a single buffer of `T·S` columns, column `t·S + s` holding stream
//! `s` at time `t`. Each (time, stream) position carries packing flags;
//! positions flagged as having no label or no feature are padding and
//! must contribute exactly zero to both loss and gradient.
//!
//! The masking invariant is cross-cutting: every criterion zeroes at
//! least one of its operands at masked positions before reducing.

use bitflags::bitflags;
use num_traits::Float;

use crate::tensor::Matrix;

bitflags! {
    /// Per-position validity flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PackingFlags: u8 {
        const SEQUENCE_START = 1 << 0;
        const SEQUENCE_END   = 1 << 1;
        const NO_FEATURE     = 1 << 2;
        const NO_LABEL       = 1 << 3;
    }
}

impl PackingFlags {
    /// True when this position must be excluded from loss and gradient.
    pub fn is_missing(&self) -> bool {
        self.intersects(PackingFlags::NO_FEATURE | PackingFlags::NO_LABEL)
    }
}

/// Describes how parallel sequences are packed into a minibatch buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinibatchLayout {
    time_steps: usize,
    streams: usize,
    /// Flags per (time, stream), indexed `t * streams + s`.
    flags: Vec<PackingFlags>,
}

impl MinibatchLayout {
    /// A layout where every position is valid.
    pub fn dense(time_steps: usize, streams: usize) -> Self {
        Self {
            time_steps,
            streams,
            flags: vec![PackingFlags::empty(); time_steps * streams],
        }
    }

    pub fn time_steps(&self) -> usize {
        self.time_steps
    }

    pub fn num_parallel_sequences(&self) -> usize {
        self.streams
    }

    /// Total columns in the packed buffer.
    pub fn num_cols(&self) -> usize {
        self.time_steps * self.streams
    }

    pub fn set(&mut self, time: usize, stream: usize, flags: PackingFlags) {
        self.flags[time * self.streams + stream] |= flags;
    }

    pub fn get(&self, time: usize, stream: usize) -> PackingFlags {
        self.flags[time * self.streams + stream]
    }

    pub fn is(&self, time: usize, stream: usize, flags: PackingFlags) -> bool {
        self.get(time, stream).intersects(flags)
    }

    /// True when any stream carries the flags at this time step.
    pub fn is_in_step(&self, time: usize, flags: PackingFlags) -> bool {
        (0..self.streams).any(|s| self.is(time, s, flags))
    }

    /// True when no position in the whole minibatch carries any flag —
    /// the common case, letting masking be skipped wholesale.
    pub fn is_all_none(&self) -> bool {
        self.flags.iter().all(|f| f.is_empty())
    }

    /// Flags for a packed column index.
    pub fn col_flags(&self, col: usize) -> PackingFlags {
        let time = col / self.streams;
        let stream = col % self.streams;
        self.get(time, stream)
    }

    /// True when the packed column is padding (no label or no feature).
    pub fn col_is_missing(&self, col: usize) -> bool {
        self.col_flags(col).is_missing()
    }

    /// Zero every column of `m` whose position is flagged missing.
    ///
    /// `m` must have exactly `num_cols()` columns; layouts are only ever
    /// applied to matrices packed against them.
    pub fn mask_missing_columns<E: Float>(&self, m: &mut Matrix<E>) {
        if self.is_all_none() {
            return;
        }
        debug_assert_eq!(m.cols(), self.num_cols());
        for col in 0..m.cols() {
            if self.col_is_missing(col) {
                m.zero_col(col);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_layout_is_all_none() {
        let layout = MinibatchLayout::dense(4, 2);
        assert!(layout.is_all_none());
        assert_eq!(layout.num_cols(), 8);
    }

    #[test]
    fn test_column_to_position_mapping() {
        let mut layout = MinibatchLayout::dense(3, 2);
        layout.set(1, 0, PackingFlags::NO_LABEL);
        // column = time * streams + stream
        assert!(layout.col_is_missing(2));
        assert!(!layout.col_is_missing(3));
    }

    #[test]
    fn test_mask_zeroes_only_flagged_columns() {
        let mut layout = MinibatchLayout::dense(2, 2);
        layout.set(0, 1, PackingFlags::NO_FEATURE);

        let mut m = Matrix::from_columns(2, 4, vec![1.0; 8]);
        layout.mask_missing_columns(&mut m);

        assert_eq!(m.col(0), &[1.0, 1.0]);
        assert_eq!(m.col(1), &[0.0, 0.0]);
        assert_eq!(m.col(2), &[1.0, 1.0]);
        assert_eq!(m.col(3), &[1.0, 1.0]);
    }

    #[test]
    fn test_step_query_spans_streams() {
        let mut layout = MinibatchLayout::dense(2, 3);
        layout.set(1, 2, PackingFlags::NO_LABEL);
        assert!(!layout.is_in_step(0, PackingFlags::NO_LABEL));
        assert!(layout.is_in_step(1, PackingFlags::NO_LABEL));
    }

    #[test]
    fn test_sequence_boundaries_do_not_mask() {
        let mut layout = MinibatchLayout::dense(2, 1);
        layout.set(0, 0, PackingFlags::SEQUENCE_START);
        layout.set(1, 0, PackingFlags::SEQUENCE_END);
        assert!(!layout.col_is_missing(0));
        assert!(!layout.col_is_missing(1));
    }
}
