//! Format-independent page attributes and the leaf-entry view.

use core::fmt;

use crate::PhysicalAddress;

/// Caching behavior of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CachePolicy {
    #[default]
    WriteBack,
    WriteThrough,
    /// Caching disabled, for device registers.
    Uncached,
}

/// Attributes of a page mapping, independent of the table shape.
///
/// Present-ness is implied: a mapping always produces a present entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageFlags(u8);

impl PageFlags {
    const WRITABLE: u8 = 1 << 0;
    const USER: u8 = 1 << 1;
    const NO_EXECUTE: u8 = 1 << 2;
    const GLOBAL: u8 = 1 << 3;
    const WRITE_THROUGH: u8 = 1 << 4;
    const NO_CACHE: u8 = 1 << 5;

    /// Read-only, supervisor-only, cached.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Writable supervisor data.
    pub const fn kernel_data() -> Self {
        Self(Self::WRITABLE)
    }

    /// Writable data accessible from user mode.
    pub const fn user_data() -> Self {
        Self(Self::WRITABLE | Self::USER)
    }

    const fn with(self, bit: u8, on: bool) -> Self {
        if on { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }

    pub const fn with_writable(self, on: bool) -> Self {
        self.with(Self::WRITABLE, on)
    }

    pub const fn with_user(self, on: bool) -> Self {
        self.with(Self::USER, on)
    }

    pub const fn with_no_execute(self, on: bool) -> Self {
        self.with(Self::NO_EXECUTE, on)
    }

    pub const fn with_global(self, on: bool) -> Self {
        self.with(Self::GLOBAL, on)
    }

    /// Replaces the caching bits with the ones for `policy`.
    pub const fn with_cache_policy(self, policy: CachePolicy) -> Self {
        let base = Self(self.0 & !(Self::WRITE_THROUGH | Self::NO_CACHE));
        match policy {
            CachePolicy::WriteBack => base,
            CachePolicy::WriteThrough => base.with(Self::WRITE_THROUGH, true),
            CachePolicy::Uncached => base.with(Self::WRITE_THROUGH | Self::NO_CACHE, true),
        }
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub const fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    pub const fn is_no_execute(self) -> bool {
        self.0 & Self::NO_EXECUTE != 0
    }

    pub const fn is_global(self) -> bool {
        self.0 & Self::GLOBAL != 0
    }

    pub const fn is_write_through(self) -> bool {
        self.0 & Self::WRITE_THROUGH != 0
    }

    pub const fn is_no_cache(self) -> bool {
        self.0 & Self::NO_CACHE != 0
    }

    pub const fn cache_policy(self) -> CachePolicy {
        if self.is_no_cache() {
            CachePolicy::Uncached
        } else if self.is_write_through() {
            CachePolicy::WriteThrough
        } else {
            CachePolicy::WriteBack
        }
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageFlags({}{}{}{} {:?})",
            if self.is_writable() { "W" } else { "R" },
            if self.is_user() { "U" } else { "S" },
            if self.is_no_execute() { "" } else { "X" },
            if self.is_global() { "G" } else { "" },
            self.cache_policy()
        )
    }
}

/// A present leaf entry, as returned by `VirtualMemoryManager::get_entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    frame: PhysicalAddress,
    flags: PageFlags,
    raw: u64,
}

impl PageEntry {
    pub(crate) const fn new(frame: PhysicalAddress, flags: PageFlags, raw: u64) -> Self {
        Self { frame, flags, raw }
    }

    /// The mapped frame.
    pub const fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    pub const fn flags(&self) -> PageFlags {
        self.flags
    }

    pub const fn cache_policy(&self) -> CachePolicy {
        self.flags.cache_policy()
    }

    /// The entry exactly as the hardware sees it.
    pub const fn raw(&self) -> u64 {
        self.raw
    }
}
