//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, plus the [`AddressTranslator`] through which the memory manager reaches
//! physical frames (to write encoded translation tables into them).

use core::fmt;
use core::ops::{Add, Sub};

use crate::numbers::{FRAME_SIZE, FrameNumber};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// How the memory manager reaches the contents of a physical frame.
///
/// On hardware, every frame is visible at `physical + direct_map_offset` (the
/// bootloader's direct map, or zero under identity mapping). Under emulation the frames
/// live in a sparse store owned by the translator.
pub enum AddressTranslator {
    Hardware { direct_map_offset: usize },
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator backed by empty (all-zero) physical memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated() -> Self {
        Self::Emulated(EmulatedMemory::new())
    }

    /// Overwrites the frame at `frame` with `bytes`.
    pub fn write_frame(&self, frame: PhysicalAddress, bytes: &[u8; FRAME_SIZE]) {
        debug_assert!(frame.is_aligned(FRAME_SIZE), "frame address must be aligned");
        match self {
            Self::Hardware { direct_map_offset } => {
                let dst = frame.as_usize().wrapping_add(*direct_map_offset) as *mut u8;
                // SAFETY: the frame was handed out by the frame allocator for table storage and
                // the direct map covers all of physical memory the allocator manages.
                unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, FRAME_SIZE) }
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.write(frame.frame_number(), bytes),
        }
    }

    /// Copies the contents of the frame at `frame` into `out`.
    pub fn read_frame(&self, frame: PhysicalAddress, out: &mut [u8; FRAME_SIZE]) {
        debug_assert!(frame.is_aligned(FRAME_SIZE), "frame address must be aligned");
        match self {
            Self::Hardware { direct_map_offset } => {
                let src = frame.as_usize().wrapping_add(*direct_map_offset) as *const u8;
                // SAFETY: see `write_frame`.
                unsafe { core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), FRAME_SIZE) }
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.read(frame.frame_number(), out),
        }
    }
}

/// Defines an address newtype with the arithmetic and formatting shared by physical and
/// virtual addresses.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns true for the null address.
            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment, saturating at the highest
            /// aligned address.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                match self.0.checked_add(align - 1) {
                    Some(v) => Self(v & !(align - 1)),
                    None => Self(usize::MAX & !(align - 1)),
                }
            }

            /// Adds `rhs` bytes, returning `None` on overflow.
            #[inline]
            pub const fn checked_add(self, rhs: usize) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        #[cfg(target_pointer_width = "64")]
        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Width limits depend on the translation format in use, so construction does not\n\
     validate; the memory manager rejects out-of-reach addresses when mapping."
);

impl PhysicalAddress {
    /// Returns the frame containing this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::containing(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Canonical form is format-specific; see `PagingFormat::virtual_in_range`."
);

impl VirtualAddress {
    /// Returns the offset of this address within its frame-sized page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (FRAME_SIZE - 1)
    }

    /// Returns the identity-mapped virtual address of a physical address.
    #[inline]
    pub const fn identity(phys: PhysicalAddress) -> Self {
        Self(phys.as_usize())
    }
}
