//! Architecture-specific CPU hooks used by the memory manager.
//!
//! Both implementations expose the same free functions:
//!
//! - `interrupts::{disable, restore}` for the critical-section type
//! - `cpu_id` to tell the executing CPU apart from the others
//! - `active_root`/`load_root` for the translation-root register
//! - `invalidate_page`/`invalidate_all` for the local translation cache
//! - `supports`/`enable_translation` for the paging mode bits
//!
//! The hardware implementation is used on x86_64 builds that are neither tests nor
//! software-emulated. Everything else runs against a per-thread emulated CPU.

#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Disables interrupts for as long as the guard is alive.
///
/// Dropping the guard restores the interrupt flag to what it was when the guard was
/// created, so guards nest.
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct InterruptGuard {
    were_enabled: bool,
}

impl InterruptGuard {
    /// Saves the interrupt flag and disables interrupts.
    #[inline]
    pub fn new() -> Self {
        Self {
            were_enabled: interrupts::disable(),
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    #[inline]
    fn drop(&mut self) {
        interrupts::restore(self.were_enabled);
    }
}
