//! x86_64 hardware implementation.
//!
//! Control-register and TLB access goes through the `x86_64` crate.

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::{
        control::{Cr3, Cr3Flags, Cr4, Cr4Flags},
        model_specific::{Efer, EferFlags},
    },
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress, paging::TranslationMode};

pub mod interrupts {
    /// Disables interrupts, returning whether they were enabled before.
    #[inline]
    pub fn disable() -> bool {
        let enabled = x86_64::instructions::interrupts::are_enabled();
        if enabled {
            x86_64::instructions::interrupts::disable();
        }
        enabled
    }

    /// Re-enables interrupts if `were_enabled` is set.
    #[inline]
    pub fn restore(were_enabled: bool) {
        if were_enabled {
            x86_64::instructions::interrupts::enable();
        }
    }
}

/// Initial local APIC id of the executing CPU, from CPUID leaf 1.
#[inline]
pub fn cpu_id() -> usize {
    // SAFETY: leaf 1 is available on every x86_64 CPU.
    #[allow(unused_unsafe)]
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    (leaf.ebx >> 24) as usize
}

/// Returns the physical address of the translation root currently loaded in CR3.
#[inline]
pub fn active_root() -> PhysicalAddress {
    let (frame, _) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64() as usize)
}

/// Loads a new translation root into CR3.
///
/// # Safety
///
/// `root` must be the frame of a complete translation tree that maps the currently
/// executing code and stack.
#[inline]
pub unsafe fn load_root(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    // SAFETY: forwarded to the caller.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) }
}

/// Invalidates the local TLB entry for one page.
#[inline]
pub fn invalidate_page(addr: VirtualAddress) {
    tlb::flush(VirtAddr::new_truncate(addr.as_usize() as u64));
}

/// Invalidates every non-global local TLB entry.
#[inline]
pub fn invalidate_all() {
    tlb::flush_all();
}

/// Long mode only runs with the four-level wide shape.
#[inline]
pub fn supports(mode: TranslationMode) -> bool {
    matches!(mode, TranslationMode::Wide)
}

/// Sets the paging mode bits the tree shape relies on.
///
/// # Safety
///
/// Must be called with interrupts disabled, after `load_root` installed a tree that
/// maps the executing code.
pub unsafe fn enable_translation(mode: TranslationMode) {
    debug_assert!(supports(mode));
    // SAFETY: PAE is already on in long mode; PSE is ignored under PAE. Adding PGE and
    // NXE only widens what valid entries may express.
    unsafe {
        Cr4::update(|flags| {
            flags.insert(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION | Cr4Flags::PAGE_GLOBAL);
        });
        Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));
    }
}
