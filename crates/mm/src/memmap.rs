//! The boot memory map consumed by the allocator and the memory manager.
//!
//! The bootloader hands over an ordered list of fixed-size records, each giving the
//! base address of a region, its kind and some flags. A record's region runs up to the
//! next record's base; the final record is an end marker whose base is the top of
//! physical memory.
//!
//! ```
//! use mm::{BootMap, BootRecord, RegionKind};
//!
//! let records = [
//!     BootRecord::new(0x0, RegionKind::Reserved),
//!     BootRecord::new(0x10_0000, RegionKind::Free),
//!     BootRecord::new(0x410_0000, RegionKind::End),
//! ];
//! let map = BootMap::new(&records).unwrap();
//! assert_eq!(map.regions().count(), 2);
//! assert_eq!(map.end().as_usize(), 0x410_0000);
//! ```

use core::fmt;

use thiserror::Error;

use crate::{HumanSize, PhysicalAddress};

/// What a boot-map region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RegionKind {
    /// Ordinary RAM the allocator may hand out.
    Free = 0,
    /// The loaded kernel image.
    KernelImage = 1,
    /// The boot stack the kernel is running on.
    KernelStack = 2,
    /// Bootloader data that may be reclaimed once the kernel no longer needs it.
    BootReclaimable = 3,
    /// ACPI tables that may be reclaimed once parsed.
    AcpiReclaimable = 4,
    /// ACPI non-volatile storage.
    AcpiNvs = 5,
    /// Firmware-reserved memory.
    Reserved = 6,
    /// Memory-mapped device registers or framebuffers.
    Device = 7,
    /// Memory reported as defective.
    Bad = 8,
    /// End-of-map marker; its base is the top of physical memory.
    End = 9,
}

impl RegionKind {
    /// Decodes a raw type tag. Unknown tags are treated as reserved.
    pub const fn from_tag(tag: u32) -> Self {
        match tag {
            0 => Self::Free,
            1 => Self::KernelImage,
            2 => Self::KernelStack,
            3 => Self::BootReclaimable,
            4 => Self::AcpiReclaimable,
            5 => Self::AcpiNvs,
            7 => Self::Device,
            8 => Self::Bad,
            9 => Self::End,
            _ => Self::Reserved,
        }
    }

    /// Regions the kernel identity-maps during memory manager init.
    pub const fn is_kernel_owned(self) -> bool {
        !matches!(self, Self::Reserved | Self::Bad | Self::End)
    }
}

bitflags::bitflags! {
    /// Per-record flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// Map the region with caching disabled.
        const UNCACHED = 1 << 0;
        /// Never map the region, even if its kind is kernel-owned.
        const NO_MAP = 1 << 1;
    }
}

/// One fixed-size record of the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BootRecord {
    pub base: u64,
    pub kind: RegionKind,
    pub flags: RegionFlags,
}

impl BootRecord {
    pub const fn new(base: u64, kind: RegionKind) -> Self {
        Self {
            base,
            kind,
            flags: RegionFlags::empty(),
        }
    }

    pub const fn with_flags(self, flags: RegionFlags) -> Self {
        Self { flags, ..self }
    }

    /// Builds a record from its raw on-wire fields.
    pub const fn from_raw(base: u64, tag: u32, flags: u32) -> Self {
        Self {
            base,
            kind: RegionKind::from_tag(tag),
            flags: RegionFlags::from_bits_truncate(flags),
        }
    }
}

/// Structural problems in a boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BootMapError {
    #[error("boot memory map has no records")]
    Empty,
    #[error("boot memory map is not terminated by an end marker")]
    MissingEndMarker,
    #[error("boot record {index} starts below the record before it")]
    Unordered { index: usize },
    #[error("boot record {index} follows the end marker")]
    RecordAfterEnd { index: usize },
}

/// A validated boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct BootMap<'a> {
    records: &'a [BootRecord],
}

impl<'a> BootMap<'a> {
    /// Validates `records`.
    ///
    /// Bases must be non-decreasing and the last record, and only the last record,
    /// must be [`RegionKind::End`].
    pub fn new(records: &'a [BootRecord]) -> Result<Self, BootMapError> {
        let (last, body) = records.split_last().ok_or(BootMapError::Empty)?;
        if let Some(index) = body.iter().position(|r| r.kind == RegionKind::End) {
            return Err(BootMapError::RecordAfterEnd { index: index + 1 });
        }
        if last.kind != RegionKind::End {
            return Err(BootMapError::MissingEndMarker);
        }
        if let Some(index) = records.windows(2).position(|w| w[1].base < w[0].base) {
            return Err(BootMapError::Unordered { index: index + 1 });
        }
        Ok(Self { records })
    }

    /// Iterates over every non-empty region, in address order.
    pub fn regions(&self) -> impl Iterator<Item = BootRegion> + '_ {
        self.records.windows(2).filter_map(|pair| {
            let size = (pair[1].base - pair[0].base) as usize;
            (size > 0).then(|| BootRegion {
                region: MemoryRegion::new(PhysicalAddress::from(pair[0].base as usize), size),
                kind: pair[0].kind,
                flags: pair[0].flags,
            })
        })
    }

    /// The top of physical memory (base of the end marker).
    pub fn end(&self) -> PhysicalAddress {
        // `new` guarantees at least the end marker is present
        let top = self.records.last().map_or(0, |r| r.base);
        PhysicalAddress::new(top as usize)
    }

    /// Total bytes of [`RegionKind::Free`] memory.
    pub fn free_bytes(&self) -> usize {
        self.regions()
            .filter(|r| r.kind == RegionKind::Free)
            .map(|r| r.size())
            .sum()
    }

    pub fn log(&self) {
        log::debug!("boot memory map, {} free:", HumanSize(self.free_bytes()));
        for region in self.regions() {
            log::debug!(
                "  {}..{} {:?} {:?} ({})",
                region.base(),
                region.end(),
                region.kind,
                region.flags,
                HumanSize(region.size())
            );
        }
    }
}

/// A region of a validated boot map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRegion {
    pub region: MemoryRegion,
    pub kind: RegionKind,
    pub flags: RegionFlags,
}

impl BootRegion {
    pub const fn base(&self) -> PhysicalAddress {
        self.region.base()
    }

    pub const fn size(&self) -> usize {
        self.region.size()
    }

    pub const fn end(&self) -> PhysicalAddress {
        self.region.end()
    }

    /// Whether the memory manager identity-maps this region at init.
    pub const fn is_mapped(&self) -> bool {
        self.kind.is_kernel_owned() && !self.flags.contains(RegionFlags::NO_MAP)
    }

    /// Whether the region must be mapped with caching disabled.
    pub fn is_uncached(&self) -> bool {
        self.kind == RegionKind::Device || self.flags.contains(RegionFlags::UNCACHED)
    }
}

/// A contiguous range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    base: PhysicalAddress,
    size: usize,
}

impl MemoryRegion {
    /// Creates a new memory region.
    pub const fn new(base: PhysicalAddress, size: usize) -> Self {
        Self { base, size }
    }

    /// Returns the base address of this region.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the size of this region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the end address (exclusive) of this region.
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_usize() + self.size)
    }

    /// Returns true if this region overlaps with another region.
    pub const fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base.as_usize() < other.end().as_usize()
            && other.base.as_usize() < self.end().as_usize()
    }

    /// Returns true if this region contains the given address range.
    pub const fn contains(&self, base: PhysicalAddress, size: usize) -> bool {
        base.as_usize() >= self.base.as_usize() && base.as_usize() + size <= self.end().as_usize()
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{} ({})", self.base, self.end(), HumanSize(self.size))
    }
}
