//! Typed storage for translation-table pages.
//!
//! Every directory of every tree lives in one [`TableArena`] slab, addressed by a
//! [`SlabId`]. Slots are kept in tagged form; the bit-exact hardware encoding is only
//! produced by [`TableArena::commit`], which writes every directory touched since the
//! last commit into its physical frame.

use alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec};
use core::{marker::PhantomData, ops::Index};

use crate::{
    AddressTranslator, FRAME_SIZE, FrameAllocator, PhysicalAddress, VmError,
    paging::{PageFlags, PagingFormat},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlabId(usize);

/// A frame and the attributes it is mapped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub frame: PhysicalAddress,
    pub flags: PageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slot {
    #[default]
    Empty,
    /// Points at the directory one level down.
    Table(SlabId),
    /// Maps one frame (level 0 only).
    Leaf(Mapping),
    /// Maps a large page (above level 0).
    Large(Mapping),
}

#[derive(Debug)]
pub struct Directory {
    frame: PhysicalAddress,
    level: usize,
    /// Entries pointing at this directory grant user access.
    user: bool,
    dirty: bool,
    slots: Box<[Slot]>,
}

impl Directory {
    pub fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn slot(&self, index: usize) -> Slot {
        self.slots[index]
    }
}

pub struct TableArena<F: PagingFormat> {
    slabs: Vec<Option<Directory>>,
    vacant: Vec<SlabId>,
    by_frame: BTreeMap<PhysicalAddress, SlabId>,
    dirty: Vec<SlabId>,
    _format: PhantomData<F>,
}

impl<F: PagingFormat> TableArena<F> {
    pub fn new() -> Self {
        Self {
            slabs: Vec::new(),
            vacant: Vec::new(),
            by_frame: BTreeMap::new(),
            dirty: Vec::new(),
            _format: PhantomData,
        }
    }

    /// Allocates a frame and an empty directory for `level`.
    pub fn alloc(
        &mut self,
        frames: &FrameAllocator,
        level: usize,
        user: bool,
    ) -> Result<SlabId, VmError> {
        debug_assert!(level < F::LEVELS);
        let frame = frames.allocate_page()?;
        let directory = Directory {
            frame,
            level,
            user,
            dirty: false,
            slots: vec![Slot::Empty; F::ENTRIES].into_boxed_slice(),
        };
        let id = match self.vacant.pop() {
            Some(id) => {
                self.slabs[id.0] = Some(directory);
                id
            }
            None => {
                self.slabs.push(Some(directory));
                SlabId(self.slabs.len() - 1)
            }
        };
        self.by_frame.insert(frame, id);
        self.touch(id);
        log::trace!("level-{} table at {}", level, frame);
        Ok(id)
    }

    /// Drops a directory and returns its frame to the allocator. Slots are not
    /// followed.
    pub fn release(&mut self, id: SlabId, frames: &FrameAllocator) {
        if let Some(directory) = self.slabs.get_mut(id.0).and_then(Option::take) {
            self.by_frame.remove(&directory.frame);
            self.vacant.push(id);
            frames.free_page(directory.frame);
        }
    }

    /// Releases every live directory, e.g. after a tree failed to build.
    pub fn release_all(&mut self, frames: &FrameAllocator) {
        for index in 0..self.slabs.len() {
            self.release(SlabId(index), frames);
        }
        self.dirty.clear();
    }

    pub fn get(&self, id: SlabId) -> Option<&Directory> {
        self.slabs.get(id.0)?.as_ref()
    }

    /// Looks a directory up by the frame it is stored in.
    pub fn find(&self, frame: PhysicalAddress) -> Option<SlabId> {
        self.by_frame.get(&frame).copied()
    }

    /// Overwrites one slot and schedules the directory for encoding.
    pub fn set(&mut self, id: SlabId, index: usize, slot: Slot) {
        if let Some(directory) = self.slabs[id.0].as_mut() {
            directory.slots[index] = slot;
        }
        self.touch(id);
    }

    fn touch(&mut self, id: SlabId) {
        if let Some(directory) = self.slabs[id.0].as_mut()
            && !directory.dirty
        {
            directory.dirty = true;
            self.dirty.push(id);
        }
    }

    /// Number of live directories.
    pub fn len(&self) -> usize {
        self.by_frame.len()
    }

    /// Encodes one directory into a frame image.
    pub fn encode(&self, id: SlabId) -> [u8; FRAME_SIZE] {
        let mut page = [0u8; FRAME_SIZE];
        let directory = &self[id];
        for (index, slot) in directory.slots.iter().enumerate() {
            let raw = match *slot {
                Slot::Empty => 0,
                Slot::Table(child) => {
                    let child = &self[child];
                    F::encode_table(child.frame, child.user)
                }
                Slot::Leaf(m) => F::encode_page(m.frame, m.flags, 0),
                Slot::Large(m) => F::encode_page(m.frame, m.flags, directory.level),
            };
            let offset = index * F::ENTRY_BYTES;
            page[offset..offset + F::ENTRY_BYTES]
                .copy_from_slice(&raw.to_le_bytes()[..F::ENTRY_BYTES]);
        }
        page
    }

    /// Writes every directory modified since the last commit into its frame.
    /// Returns how many frames were written.
    pub fn commit(&mut self, translator: &AddressTranslator) -> usize {
        let dirty = core::mem::take(&mut self.dirty);
        let mut written = 0;
        for id in dirty {
            let Some(directory) = self.slabs[id.0].as_mut() else {
                continue;
            };
            directory.dirty = false;
            let frame = directory.frame;
            translator.write_frame(frame, &self.encode(id));
            written += 1;
        }
        written
    }
}

impl<F: PagingFormat> Default for TableArena<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PagingFormat> Index<SlabId> for TableArena<F> {
    type Output = Directory;

    fn index(&self, id: SlabId) -> &Directory {
        match self.get(id) {
            Some(directory) => directory,
            None => panic!("stale table slab {:?}", id),
        }
    }
}
