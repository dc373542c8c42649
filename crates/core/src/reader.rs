//! # Reader Boundary
//!
//! The interface between minibatch producers and the criterion graph.
//! This crate consumes it, it does not implement it: reading, parsing and
//! randomization live behind these traits. A reader advertises the set of
//! named inputs it can produce; an epoch is started with an
//! `EpochConfiguration` and then yields minibatches one at a time until
//! it reports end-of-epoch.

use std::collections::HashMap;

use crate::layout::MinibatchLayout;

/// Identifier a reader assigns to one of its inputs.
pub type InputId = usize;

/// Parameters for one epoch of reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochConfiguration {
    pub worker_rank: usize,
    pub number_of_workers: usize,
    pub minibatch_size: usize,
    pub total_size: usize,
    pub number_of_sequences: usize,
    pub index: usize,
}

/// Static description of an input a reader can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDescription {
    pub name: String,
    pub id: InputId,
}

/// One input's data for one minibatch: a raw buffer plus the layout
/// describing how its columns are packed.
#[derive(Debug, Clone)]
pub struct MinibatchInput {
    /// Raw element data, column-major, `sample_rows` rows per column.
    pub data: Vec<u8>,
    pub sample_rows: usize,
    pub layout: MinibatchLayout,
}

impl MinibatchInput {
    pub fn data_size(&self) -> usize {
        self.data.len()
    }
}

/// A single minibatch: end-of-epoch flag plus input-id → data map.
#[derive(Debug, Clone, Default)]
pub struct Minibatch {
    pub at_end_of_epoch: bool,
    pub inputs: HashMap<InputId, MinibatchInput>,
}

impl Minibatch {
    /// True while there is data left to train on.
    pub fn has_data(&self) -> bool {
        !self.at_end_of_epoch
    }
}

/// An in-progress epoch, producing minibatches until exhausted.
pub trait Epoch {
    fn next_minibatch(&mut self) -> Minibatch;
}

/// A minibatch producer.
pub trait Reader {
    /// The static set of inputs this reader can produce.
    fn inputs(&self) -> Vec<InputDescription>;

    /// Begin a new epoch of reading.
    fn start_epoch(&mut self, config: &EpochConfiguration) -> Box<dyn Epoch>;
}
