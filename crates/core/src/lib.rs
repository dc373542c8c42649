//! # Core - Numeric Substrate for Criterion Graphs
//!
//! This crate provides the foundations the criterion nodes are built on:
//!
//! - **Matrices**: a column-major 2D buffer with the small set of numeric
//!   operations the criteria consume (log-domain helpers included)
//! - **Minibatch layouts**: how parallel sequences are packed into columns,
//!   with per-position validity flags
//! - **Placement**: host/accelerator residency tags, checked at validation
//!   time and never silently migrated
//! - **Errors**: the criterion error taxonomy — all fatal, none retried
//! - **Reader boundary**: the interface minibatch producers implement
//!
//! ## Design Philosophy
//!
//! Criterion nodes require exact structural preconditions. A shape mismatch
//! or a mis-placed label tensor is not a recoverable condition — it is a
//! graph-construction bug, and it surfaces as an error before any numeric
//! work runs.

pub mod device;
pub mod error;
pub mod layout;
pub mod reader;
pub mod tensor;

// Re-export key types at crate root for convenience
pub use device::Placement;
pub use error::CriterionError;
pub use layout::{MinibatchLayout, PackingFlags};
pub use reader::{Epoch, EpochConfiguration, Minibatch, MinibatchInput, Reader};
pub use tensor::{log_add, log_sum_exp, Matrix};
