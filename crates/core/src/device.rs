//! # Placement
//!
//! Where a matrix is *supposed* to reside. Criteria that walk labels
//! element-by-element require them host-resident and check the tag at
//! validation time; nothing in this crate relocates data on its own.

/// Residency tag for a matrix buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Host memory, directly addressable.
    #[default]
    Host,
    /// An accelerator device, identified by ordinal.
    Accelerator(u32),
}

impl Placement {
    pub fn is_host(&self) -> bool {
        matches!(self, Placement::Host)
    }
}
