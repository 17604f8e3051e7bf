#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Memory manager
//!
//! The kernel's physical page allocator and address-translation manager. It provides:
//!
//! - Boot memory map parsing ([`BootMap`]).
//! - A bitmap frame allocator with power-of-two blocks and address zones
//!   ([`FrameAllocator`]).
//! - Translation-tree management for a shared kernel tree and per-task trees
//!   ([`VirtualMemoryManager`]), over a two-level 32-bit ([`Narrow`]) or four-level
//!   64-bit ([`Wide`]) table shape.
//! - Software emulation of the CPU hooks and of physical memory, for testing in
//!   non-kernel environments.
//!
//! Services are explicitly constructed with `const fn new` so they can live in
//! `static`s, then initialized once from the boot memory map.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod descriptor;
mod frame_allocator;
mod human_size;
mod memmap;
mod numbers;
mod paging;
mod sync;
mod vmm;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use arch::InterruptGuard;
pub use descriptor::{KernelDescriptor, PanicHandler};
pub use frame_allocator::{AllocError, AllocatorConfig, FrameAllocator, MAX_ORDER, Zone};
pub use human_size::HumanSize;
pub use memmap::{
    BootMap, BootMapError, BootRecord, BootRegion, MemoryRegion, RegionFlags, RegionKind,
};
pub use numbers::{FRAME_SHIFT, FRAME_SIZE, FrameNumber};
pub use paging::{CachePolicy, Narrow, PageEntry, PageFlags, PagingFormat, TranslationMode, Wide};
pub use sync::{IrqSpinLock, IrqSpinLockGuard};
pub use vmm::{DeviceWindow, VirtualMemoryManager, VmError, VmmConfig};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, emulation};
