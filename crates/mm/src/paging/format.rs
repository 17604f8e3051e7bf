//! Translation-table shapes.
//!
//! The walk is the same for every shape; what differs is the number of levels, how
//! many virtual-address bits each level consumes, how wide an entry is and how an
//! entry is encoded. [`PagingFormat`] captures exactly those differences.
//!
//! Levels are numbered from the leaf table (level 0) up to the root
//! (`LEVELS - 1`). Large pages live at level [`PagingFormat::LARGE_PAGE_LEVEL`].

use x86_64::structures::paging::PageTableFlags;

use crate::{FRAME_SHIFT, PhysicalAddress, VirtualAddress, paging::PageFlags};

/// Which mode bits a tree shape needs enabled on the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranslationMode {
    /// Two-level, 32-bit entries, 4 MiB large pages.
    Narrow,
    /// Four-level, 64-bit entries, 2 MiB large pages, no-execute.
    Wide,
}

/// A translation-table shape.
pub trait PagingFormat: 'static {
    const NAME: &'static str;
    const MODE: TranslationMode;
    const LEVELS: usize;
    /// Virtual-address bits consumed per level.
    const INDEX_BITS: usize;
    /// Size in bytes of one encoded entry.
    const ENTRY_BYTES: usize;
    const LARGE_PAGE_LEVEL: usize = 1;
    const ENTRIES: usize = 1 << Self::INDEX_BITS;
    /// Root slots below this index are private to an address space; slots at or
    /// above it are the shared kernel range.
    const USER_SPLIT: usize = Self::ENTRIES / 2;
    /// First physical address an entry cannot name.
    const PHYSICAL_END: u64;
    /// End of the lowest contiguous run of valid virtual addresses, which bounds what
    /// can be identity-mapped.
    const IDENTITY_END: u64;

    /// Index into the table at `level` for `virt`.
    #[inline]
    fn index(virt: VirtualAddress, level: usize) -> usize {
        (virt.as_usize() >> (FRAME_SHIFT + level * Self::INDEX_BITS)) & (Self::ENTRIES - 1)
    }

    /// Bytes translated by one entry at `level`.
    #[inline]
    fn span(level: usize) -> usize {
        1 << (FRAME_SHIFT + level * Self::INDEX_BITS)
    }

    /// First virtual address above the private lower half.
    #[inline]
    fn user_end() -> usize {
        Self::USER_SPLIT * Self::span(Self::LEVELS - 1)
    }

    /// Encodes an entry pointing at a lower-level table.
    fn encode_table(frame: PhysicalAddress, user: bool) -> u64;

    /// Encodes an entry mapping a page at `level` (a large page above level 0).
    fn encode_page(frame: PhysicalAddress, flags: PageFlags, level: usize) -> u64;

    /// Whether `virt` can be translated by this shape.
    fn virtual_in_range(virt: usize) -> bool;

    /// Whether every address of `first..=last` can be translated.
    fn virtual_range_in_range(first: usize, last: usize) -> bool {
        first <= last && Self::virtual_in_range(first) && Self::virtual_in_range(last)
    }

    /// Whether `phys` can be named by an entry of this shape.
    #[inline]
    fn physical_in_range(phys: usize) -> bool {
        (phys as u64) < Self::PHYSICAL_END
    }
}

/// Flags shared by both shapes. The low byte of a 32-bit entry uses the same bit
/// positions as the 64-bit one.
fn common_flags(flags: PageFlags) -> PageTableFlags {
    let mut raw = PageTableFlags::PRESENT;
    raw.set(PageTableFlags::WRITABLE, flags.is_writable());
    raw.set(PageTableFlags::USER_ACCESSIBLE, flags.is_user());
    raw.set(PageTableFlags::WRITE_THROUGH, flags.is_write_through());
    raw.set(PageTableFlags::NO_CACHE, flags.is_no_cache());
    raw.set(PageTableFlags::GLOBAL, flags.is_global());
    raw
}

fn table_bits(user: bool) -> u64 {
    let mut raw = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    raw.set(PageTableFlags::USER_ACCESSIBLE, user);
    raw.bits()
}

/// Classic two-level 32-bit paging with page-size extension.
#[derive(Debug, Clone, Copy)]
pub enum Narrow {}

impl Narrow {
    const ADDRESS_MASK: u64 = 0xFFFF_F000;
    const LARGE_ADDRESS_MASK: u64 = 0xFFC0_0000;
}

impl PagingFormat for Narrow {
    const NAME: &'static str = "narrow";
    const MODE: TranslationMode = TranslationMode::Narrow;
    const LEVELS: usize = 2;
    const INDEX_BITS: usize = 10;
    const ENTRY_BYTES: usize = 4;
    const PHYSICAL_END: u64 = 1 << 32;
    const IDENTITY_END: u64 = 1 << 32;

    fn encode_table(frame: PhysicalAddress, user: bool) -> u64 {
        (frame.as_usize() as u64 & Self::ADDRESS_MASK) | table_bits(user)
    }

    fn encode_page(frame: PhysicalAddress, flags: PageFlags, level: usize) -> u64 {
        // no-execute does not exist in this shape
        let mut raw = common_flags(flags);
        raw.set(PageTableFlags::HUGE_PAGE, level > 0);
        let mask = if level == 0 {
            Self::ADDRESS_MASK
        } else {
            Self::LARGE_ADDRESS_MASK
        };
        (frame.as_usize() as u64 & mask) | raw.bits()
    }

    fn virtual_in_range(virt: usize) -> bool {
        (virt as u64) < Self::IDENTITY_END
    }
}

/// Four-level 64-bit paging with 48-bit canonical virtual addresses.
#[derive(Debug, Clone, Copy)]
pub enum Wide {}

impl Wide {
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    const VIRTUAL_BITS: u32 = 48;
}

impl PagingFormat for Wide {
    const NAME: &'static str = "wide";
    const MODE: TranslationMode = TranslationMode::Wide;
    const LEVELS: usize = 4;
    const INDEX_BITS: usize = 9;
    const ENTRY_BYTES: usize = 8;
    const PHYSICAL_END: u64 = 1 << 52;
    const IDENTITY_END: u64 = 1 << (Self::VIRTUAL_BITS - 1);

    fn encode_table(frame: PhysicalAddress, user: bool) -> u64 {
        (frame.as_usize() as u64 & Self::ADDRESS_MASK) | table_bits(user)
    }

    fn encode_page(frame: PhysicalAddress, flags: PageFlags, level: usize) -> u64 {
        let mut raw = common_flags(flags);
        raw.set(PageTableFlags::NO_EXECUTE, flags.is_no_execute());
        raw.set(PageTableFlags::HUGE_PAGE, level > 0);
        (frame.as_usize() as u64 & Self::ADDRESS_MASK) | raw.bits()
    }

    fn virtual_in_range(virt: usize) -> bool {
        // canonical: bits 47..63 all equal
        let top = (virt as u64) >> (Self::VIRTUAL_BITS - 1);
        top == 0 || top == (1 << (64 - Self::VIRTUAL_BITS + 1)) - 1
    }

    fn virtual_range_in_range(first: usize, last: usize) -> bool {
        // both halves are contiguous, the hole between them is not
        first <= last
            && Self::virtual_in_range(first)
            && Self::virtual_in_range(last)
            && (first as u64 >> 63) == (last as u64 >> 63)
    }
}
