//! Frame numbers and frame geometry.

use core::fmt;
use core::ops::Add;

use crate::address::PhysicalAddress;

/// log2 of [`FRAME_SIZE`].
pub const FRAME_SHIFT: usize = 12;

/// Size in bytes of a physical frame (and of a translation-table page).
pub const FRAME_SIZE: usize = 1 << FRAME_SHIFT;

/// A physical memory frame number.
///
/// Frame numbers are zero-indexed and correspond to [`FRAME_SIZE`]-aligned
/// physical addresses. The frame bitmap is indexed by these.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    /// Creates a new frame number.
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    /// Returns the frame containing `addr`.
    #[inline]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_usize() >> FRAME_SHIFT)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << FRAME_SHIFT)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::containing(addr)
    }
}
