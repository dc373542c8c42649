//! # Criteria - Differentiable Training Criteria
//!
//! The training-criterion layer of a computation graph: scalar-valued
//! loss nodes, each implementing a forward evaluation and a reverse-mode
//! gradient step that *adds* into its inputs' gradient accumulators.
//!
//! ## Core Concepts
//!
//! - **Arena-owned nodes** — the graph owns every node; edges are
//!   `NodeIndex` handles annotated with the input slot, never ownership.
//!   Diamonds are legal; gradient accumulation makes them correct.
//! - **Tagged criterion kinds** — one enum variant per criterion, with
//!   the per-kind state (softmax caches, trellises) living inside the
//!   variant.
//! - **Two-phase caches** — forward bumps a generation counter; backward
//!   caches recompute once per generation, never reusing stale
//!   cross-minibatch state.
//! - **Masking** — positions the minibatch layout flags as missing
//!   contribute exactly zero to loss and gradient.
//!
//! ## Modules
//!
//! - [`graph`] — the node arena, validation, and forward/backward drivers
//! - [`node`] — the criterion-kind enum and its dispatch tables
//! - [`elementwise`] — SquareError, CrossEntropy, CrossEntropyWithSoftmax
//! - [`reg`] — L1/L2 norm penalties
//! - [`nce`] — noise-contrastive estimation with persisted eval mode
//! - [`class_softmax`] — class-based hierarchical softmax
//! - [`crf`] — chain CRF via log-domain forward-backward
//! - [`dummy`] — pass-through criterion for externally computed objectives
//! - [`check`] — finite-difference gradient checking

pub mod check;
pub mod class_softmax;
pub mod crf;
pub mod dummy;
pub mod elementwise;
pub mod graph;
pub mod nce;
pub mod node;
pub mod reg;

// Re-export key types
pub use check::GradCheckError;
pub use graph::{CopyFlags, CriterionGraph};
pub use nce::{NceEvalMode, NceState};
pub use node::{InputMeta, Op};
