//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated CPU that can run on any host. Each host
//! thread gets its own emulated CPU (translation root, interrupt flag, paging mode and
//! a log of TLB invalidations), so tests that run in parallel never see each other's
//! state.
//!
//! Physical memory is emulated by [`EmulatedMemory`], a sparse frame store owned by
//! the address translator.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
    vec::Vec,
};

use spin::Mutex;

use crate::{
    FRAME_SIZE, FrameNumber, PhysicalAddress, VirtualAddress, paging::TranslationMode,
};

#[derive(Debug)]
struct EmulatedCpu {
    root: PhysicalAddress,
    interrupts_enabled: bool,
    mode: Option<TranslationMode>,
    invalidated: Vec<VirtualAddress>,
    full_flushes: usize,
}

impl EmulatedCpu {
    const fn new() -> Self {
        Self {
            root: PhysicalAddress::new(0),
            interrupts_enabled: true,
            mode: None,
            invalidated: Vec::new(),
            full_flushes: 0,
        }
    }
}

static NEXT_CPU_ID: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static CPU: RefCell<EmulatedCpu> = const { RefCell::new(EmulatedCpu::new()) };
    static CPU_ID: usize = NEXT_CPU_ID.fetch_add(1, Ordering::Relaxed);
}

fn with_cpu<R>(f: impl FnOnce(&mut EmulatedCpu) -> R) -> R {
    CPU.with(|cpu| f(&mut cpu.borrow_mut()))
}

pub mod interrupts {
    /// Disables interrupts, returning whether they were enabled before.
    pub fn disable() -> bool {
        super::with_cpu(|cpu| core::mem::replace(&mut cpu.interrupts_enabled, false))
    }

    /// Re-enables interrupts if `were_enabled` is set.
    pub fn restore(were_enabled: bool) {
        if were_enabled {
            super::with_cpu(|cpu| cpu.interrupts_enabled = true);
        }
    }
}

/// Identifier of the calling thread's emulated CPU. Ids are never reused, and
/// `emulation::reset` keeps the id.
pub fn cpu_id() -> usize {
    CPU_ID.with(|id| *id)
}

/// Returns the emulated translation root.
pub fn active_root() -> PhysicalAddress {
    with_cpu(|cpu| cpu.root)
}

/// Loads a new emulated translation root.
///
/// # Safety
///
/// Always safe in emulation; `unsafe` to match the hardware signature.
pub unsafe fn load_root(root: PhysicalAddress) {
    with_cpu(|cpu| cpu.root = root);
}

/// Records a single-page invalidation.
pub fn invalidate_page(addr: VirtualAddress) {
    with_cpu(|cpu| cpu.invalidated.push(addr));
}

/// Records a full flush.
pub fn invalidate_all() {
    with_cpu(|cpu| cpu.full_flushes += 1);
}

/// The emulated CPU runs either tree shape.
pub fn supports(_mode: TranslationMode) -> bool {
    true
}

/// Records the enabled paging mode.
///
/// # Safety
///
/// Always safe in emulation; `unsafe` to match the hardware signature.
pub unsafe fn enable_translation(mode: TranslationMode) {
    with_cpu(|cpu| cpu.mode = Some(mode));
}

/// Inspection hooks for the emulated CPU of the calling thread.
pub mod emulation {
    use super::*;

    /// Whether the emulated interrupt flag is set.
    pub fn interrupts_enabled() -> bool {
        with_cpu(|cpu| cpu.interrupts_enabled)
    }

    /// Sets the emulated interrupt flag directly.
    pub fn set_interrupts_enabled(enabled: bool) {
        with_cpu(|cpu| cpu.interrupts_enabled = enabled);
    }

    /// The paging mode enabled on this thread's emulated CPU, if any.
    pub fn translation_mode() -> Option<TranslationMode> {
        with_cpu(|cpu| cpu.mode)
    }

    /// Drains the single-page invalidations recorded so far.
    pub fn take_invalidations() -> Vec<VirtualAddress> {
        with_cpu(|cpu| core::mem::take(&mut cpu.invalidated))
    }

    /// Number of full flushes recorded so far.
    pub fn full_flushes() -> usize {
        with_cpu(|cpu| cpu.full_flushes)
    }

    /// Resets this thread's emulated CPU to its power-on state.
    pub fn reset() {
        with_cpu(|cpu| *cpu = EmulatedCpu::new());
    }
}

/// Emulated physical memory.
///
/// Frames are materialized on first write; frames never written read back as zero.
pub struct EmulatedMemory {
    frames: Mutex<BTreeMap<FrameNumber, Box<[u8; FRAME_SIZE]>>>,
}

impl EmulatedMemory {
    /// Creates an empty emulated memory.
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(BTreeMap::new()),
        }
    }

    /// Overwrites a whole frame.
    pub fn write(&self, frame: FrameNumber, bytes: &[u8; FRAME_SIZE]) {
        let mut frames = self.frames.lock();
        match frames.get_mut(&frame) {
            Some(existing) => existing.copy_from_slice(bytes),
            None => {
                frames.insert(frame, Box::new(*bytes));
            }
        }
    }

    /// Reads a whole frame.
    pub fn read(&self, frame: FrameNumber, out: &mut [u8; FRAME_SIZE]) {
        match self.frames.lock().get(&frame) {
            Some(bytes) => out.copy_from_slice(&bytes[..]),
            None => out.fill(0),
        }
    }

    /// Number of frames that have been written at least once.
    pub fn resident_frames(&self) -> usize {
        self.frames.lock().len()
    }
}

impl Default for EmulatedMemory {
    fn default() -> Self {
        Self::new()
    }
}
