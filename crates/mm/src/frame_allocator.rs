//! Bitmap-backed physical frame allocator.
//!
//! One bit tracks each frame from frame 0 up to the top of the boot map: a set bit
//! means the frame is unavailable, a clear bit means it is free. Single pages and
//! naturally aligned power-of-two blocks are handed out; blocks can be confined to a
//! [`Zone`] for devices and early code that cannot reach all of memory.
//!
//! Frame 0 is never handed out, so a physical address of zero never names an
//! allocation.

use alloc::{boxed::Box, vec};

use thiserror::Error;

use crate::{
    BootMap, FRAME_SIZE, FrameNumber, HumanSize, KernelDescriptor, MemoryRegion, PhysicalAddress,
    RegionKind, sync::IrqSpinLock,
};

/// Largest supported block order: a block of `2^10` frames (4 MiB).
pub const MAX_ORDER: usize = 10;

const WORD_BITS: usize = u64::BITS as usize;

/// Address ceilings for block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zone {
    /// Below 16 MiB, for ISA DMA.
    Legacy,
    /// Below 4 GiB, for 32-bit DMA.
    Addr32,
    /// Below 256 MiB, for memory the early kernel must reach directly.
    Kernel,
    /// Anywhere.
    Normal,
}

impl Zone {
    /// Exclusive upper bound on the physical end of a block in this zone.
    pub const fn ceiling(self) -> u64 {
        match self {
            Self::Legacy => 16 << 20,
            Self::Addr32 => 4 << 30,
            Self::Kernel => 256 << 20,
            Self::Normal => u64::MAX,
        }
    }

    /// Number of frames that lie entirely below the ceiling.
    const fn frame_limit(self) -> usize {
        let frames = self.ceiling() >> crate::FRAME_SHIFT;
        if frames > usize::MAX as u64 {
            usize::MAX
        } else {
            frames as usize
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("the frame allocator has not been initialized")]
    NotInitialized,
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("block order {0} is larger than the maximum of {max}", max = MAX_ORDER)]
    OrderTooLarge(usize),
}

/// Allocator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorConfig {
    /// Pages taken out of free memory at init and published as the kernel heap pool.
    pub pool_pages: usize,
}

impl AllocatorConfig {
    pub const fn new() -> Self {
        Self { pool_pages: 0 }
    }

    pub const fn with_pool_pages(self, pool_pages: usize) -> Self {
        Self { pool_pages }
    }
}

/// The bitmap itself. Always accessed under the allocator lock.
struct FrameBitmap {
    words: Box<[u64]>,
    frames: usize,
    /// Index of the first word that may contain a free bit. Every word below it is full.
    used_tail: usize,
    free: usize,
}

impl FrameBitmap {
    /// Creates a bitmap covering `frames` frames, all marked used.
    fn new(frames: usize) -> Self {
        Self {
            words: vec![u64::MAX; frames.div_ceil(WORD_BITS)].into_boxed_slice(),
            frames,
            used_tail: 0,
            free: 0,
        }
    }

    fn is_free(&self, frame: usize) -> bool {
        frame < self.frames && self.words[frame / WORD_BITS] & (1 << (frame % WORD_BITS)) == 0
    }

    /// Clears one bit. Returns false if the frame was already free or out of range.
    fn mark_free(&mut self, frame: usize) -> bool {
        if frame >= self.frames || self.is_free(frame) {
            return false;
        }
        let word = frame / WORD_BITS;
        self.words[word] &= !(1 << (frame % WORD_BITS));
        self.free += 1;
        self.used_tail = self.used_tail.min(word);
        true
    }

    /// Sets one bit. Returns false if the frame was already used or out of range.
    fn mark_used(&mut self, frame: usize) -> bool {
        if !self.is_free(frame) {
            return false;
        }
        self.words[frame / WORD_BITS] |= 1 << (frame % WORD_BITS);
        self.free -= 1;
        true
    }

    fn mark_range_free(&mut self, start: usize, count: usize) -> usize {
        (start..start.saturating_add(count).min(self.frames))
            .filter(|&frame| self.mark_free(frame))
            .count()
    }

    fn mark_range_used(&mut self, start: usize, count: usize) {
        for frame in start..start + count {
            self.mark_used(frame);
        }
        self.settle_tail();
    }

    /// Moves the used-tail past words that have become full.
    fn settle_tail(&mut self) {
        while self.words.get(self.used_tail) == Some(&u64::MAX) {
            self.used_tail += 1;
        }
    }

    /// Takes the lowest free frame.
    fn allocate_one(&mut self) -> Option<usize> {
        self.settle_tail();
        let word = self.used_tail;
        let bits = *self.words.get(word)?;
        let frame = word * WORD_BITS + (!bits).trailing_zeros() as usize;
        self.mark_used(frame);
        Some(frame)
    }

    /// Takes the lowest free run of `count` frames starting on an `align`-frame
    /// boundary and ending at or below frame `limit`.
    fn allocate_run(&mut self, count: usize, align: usize, limit: usize) -> Option<usize> {
        let limit = limit.min(self.frames);
        let mut start = (self.used_tail * WORD_BITS).next_multiple_of(align);
        while start.checked_add(count)? <= limit {
            match self.first_used_in(start, count) {
                None => {
                    self.mark_range_used(start, count);
                    return Some(start);
                }
                Some(used) => start = (used + 1).next_multiple_of(align),
            }
        }
        None
    }

    /// Returns the first used frame in `start..start + count`.
    fn first_used_in(&self, start: usize, count: usize) -> Option<usize> {
        let end = start + count;
        let mut frame = start;
        while frame < end {
            let word = frame / WORD_BITS;
            let bit = frame % WORD_BITS;
            let span = (WORD_BITS - bit).min(end - frame);
            let mask = if span == WORD_BITS {
                u64::MAX
            } else {
                ((1u64 << span) - 1) << bit
            };
            let used = self.words[word] & mask;
            if used != 0 {
                return Some(word * WORD_BITS + used.trailing_zeros() as usize);
            }
            frame += span;
        }
        None
    }

    /// Counts free frames below frame `limit`.
    fn free_below(&self, limit: usize) -> usize {
        if limit >= self.frames {
            return self.free;
        }
        let full_words = limit / WORD_BITS;
        let mut free: usize = self.words[..full_words]
            .iter()
            .map(|w| w.count_zeros() as usize)
            .sum();
        let rest = limit % WORD_BITS;
        if rest != 0 {
            let mask = (1u64 << rest) - 1;
            free += (!self.words[full_words] & mask).count_ones() as usize;
        }
        free
    }
}

/// The physical page allocator service.
///
/// Constructed empty (usable in a `static`), then brought up once with
/// [`FrameAllocator::init`]. Every operation takes one short interrupt-safe spinlock.
pub struct FrameAllocator {
    config: AllocatorConfig,
    bitmap: IrqSpinLock<Option<FrameBitmap>>,
}

impl FrameAllocator {
    pub const fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            bitmap: IrqSpinLock::new(None),
        }
    }

    /// Heap bytes `init` allocates for the bitmap of a map ending at `end`.
    ///
    /// The bitmap comes from the global allocator, so the early heap must hold at least
    /// this much before `init` runs.
    pub const fn bitmap_bytes(end: PhysicalAddress) -> usize {
        (end.as_usize() / FRAME_SIZE).div_ceil(WORD_BITS) * size_of::<u64>()
    }

    /// Builds the bitmap from the boot map.
    ///
    /// Every frame starts out used; frames of [`RegionKind::Free`] regions are then
    /// cleared. Frame 0 stays used regardless. Afterwards the configured pool is carved
    /// out of free memory and published to `descriptor` as the heap, together with the
    /// kernel image and stack regions.
    ///
    /// Only the first call has any effect. Returns whether this call initialized.
    pub fn init(&self, map: &BootMap<'_>, descriptor: &KernelDescriptor) -> bool {
        let mut state = self.bitmap.lock();
        if state.is_some() {
            log::warn!("frame allocator already initialized");
            return false;
        }

        let frames = map.end().as_usize() / FRAME_SIZE;
        let mut bitmap = FrameBitmap::new(frames);
        for region in map.regions() {
            match region.kind {
                RegionKind::Free => {
                    // partial frames at either edge stay used
                    let start = region.base().align_up(FRAME_SIZE).as_usize() / FRAME_SIZE;
                    let end = region.end().align_down(FRAME_SIZE).as_usize() / FRAME_SIZE;
                    if end > start {
                        bitmap.mark_range_free(start, end - start);
                    }
                }
                RegionKind::KernelImage => {
                    descriptor.publish_kernel_image(region.region);
                }
                RegionKind::KernelStack => {
                    descriptor.publish_kernel_stack(region.region);
                }
                _ => {}
            }
        }
        bitmap.mark_used(0);
        bitmap.settle_tail();

        log::info!(
            "frame bitmap covers {} frames ({}), {} free",
            frames,
            HumanSize(Self::bitmap_bytes(map.end())),
            HumanSize(bitmap.free * FRAME_SIZE)
        );

        if self.config.pool_pages > 0 {
            let pool = bitmap
                .allocate_run(self.config.pool_pages, 1, Zone::Kernel.frame_limit())
                .or_else(|| bitmap.allocate_run(self.config.pool_pages, 1, usize::MAX));
            match pool {
                Some(start) => {
                    let region = MemoryRegion::new(
                        FrameNumber::new(start).start(),
                        self.config.pool_pages * FRAME_SIZE,
                    );
                    log::debug!("donated {} to the heap pool", region);
                    descriptor.publish_heap(region);
                }
                None => log::warn!(
                    "no contiguous run of {} pages for the heap pool",
                    self.config.pool_pages
                ),
            }
        }

        *state = Some(bitmap);
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.bitmap.lock().is_some()
    }

    /// Allocates the lowest free frame.
    pub fn allocate_page(&self) -> Result<PhysicalAddress, AllocError> {
        let mut state = self.bitmap.lock();
        let bitmap = state.as_mut().ok_or(AllocError::NotInitialized)?;
        let frame = bitmap.allocate_one().ok_or(AllocError::OutOfMemory)?;
        log::trace!("allocated frame {}", frame);
        Ok(FrameNumber::new(frame).start())
    }

    /// Allocates `2^order` contiguous frames aligned to their own size, ending at or
    /// below the zone's ceiling.
    pub fn allocate_block(&self, order: usize, zone: Zone) -> Result<PhysicalAddress, AllocError> {
        if order > MAX_ORDER {
            return Err(AllocError::OrderTooLarge(order));
        }
        let mut state = self.bitmap.lock();
        let bitmap = state.as_mut().ok_or(AllocError::NotInitialized)?;
        let count = 1 << order;
        match bitmap.allocate_run(count, count, zone.frame_limit()) {
            Some(frame) => {
                log::trace!("allocated order-{} block at frame {} ({:?})", order, frame, zone);
                Ok(FrameNumber::new(frame).start())
            }
            None => {
                log::warn!(
                    "no free order-{} block in {:?} zone ({} free)",
                    order,
                    zone,
                    HumanSize(bitmap.free_below(zone.frame_limit()) * FRAME_SIZE)
                );
                Err(AllocError::OutOfMemory)
            }
        }
    }

    /// Returns one frame. Null, misaligned, out-of-range and already-free addresses are
    /// ignored.
    pub fn free_page(&self, addr: PhysicalAddress) {
        self.free_block(addr, 0);
    }

    /// Returns a block of `2^order` frames. Frames of the block that are already free
    /// are left alone, as are null, misaligned or out-of-range addresses.
    pub fn free_block(&self, addr: PhysicalAddress, order: usize) {
        if addr.is_null() || order > MAX_ORDER || !addr.is_aligned(FRAME_SIZE) {
            return;
        }
        let mut state = self.bitmap.lock();
        let Some(bitmap) = state.as_mut() else {
            return;
        };
        let freed = bitmap.mark_range_free(addr.frame_number().as_usize(), 1 << order);
        log::trace!("freed {} frames at {}", freed, addr);
    }

    /// Free frames that lie entirely below the zone's ceiling.
    pub fn available_pages(&self, zone: Zone) -> usize {
        self.bitmap
            .lock()
            .as_ref()
            .map_or(0, |bitmap| bitmap.free_below(zone.frame_limit()))
    }

    /// Frames covered by the bitmap.
    pub fn total_pages(&self) -> usize {
        self.bitmap.lock().as_ref().map_or(0, |bitmap| bitmap.frames)
    }

    /// Frames not currently free, including never-usable ones.
    pub fn used_pages(&self) -> usize {
        self.bitmap
            .lock()
            .as_ref()
            .map_or(0, |bitmap| bitmap.frames - bitmap.free)
    }
}
