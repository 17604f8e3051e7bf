//! Address space handles.

use crate::PhysicalAddress;

/// An opaque handle to a translation tree, identified by the physical address of its
/// root.
///
/// Handles are only minted by the memory manager: one for the kernel tree, one per
/// task tree created with `create_address_space`. A task keeps its handle and hands
/// it back for switching, user mapping and teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    pub(crate) const fn new(root: PhysicalAddress) -> Self {
        Self { root }
    }

    /// The physical address loaded into the translation-root register for this space.
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }
}
