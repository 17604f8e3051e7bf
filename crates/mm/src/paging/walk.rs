//! The top-down table walk shared by every tree shape.

use crate::{
    FRAME_SIZE, FrameAllocator, PhysicalAddress, VirtualAddress, VmError,
    paging::{
        PageFlags, PagingFormat,
        arena::{Mapping, SlabId, Slot, TableArena},
    },
};

/// What a single map step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A new entry was written.
    Installed,
    /// The translation already existed with the requested attributes.
    Unchanged,
    /// The translation already existed; its attributes were replaced.
    Updated,
}

/// Parameters of one range mapping.
#[derive(Debug, Clone, Copy)]
pub struct MapRequest {
    pub root: SlabId,
    pub virt: VirtualAddress,
    pub phys: PhysicalAddress,
    pub size: usize,
    pub flags: PageFlags,
    /// Refuse to create new slots in the root.
    pub sealed: bool,
    /// New directories grant user access.
    pub user: bool,
    pub large_pages: bool,
}

/// Totals over a mapped range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapSummary {
    pub installed: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl MapSummary {
    fn record(&mut self, step: Step) {
        match step {
            Step::Installed => self.installed += 1,
            Step::Updated => self.updated += 1,
            Step::Unchanged => self.unchanged += 1,
        }
    }

    /// Whether any entry the hardware may have cached was changed.
    pub fn changed(&self) -> bool {
        self.installed + self.updated > 0
    }
}

enum Outcome {
    Done(Step),
    /// The target slot holds a table; retry one level down.
    Descend,
}

/// Returns the page-aligned bounds `(virt, phys, len)` covering a byte range, or `None`
/// when the rounded range does not fit the address width.
pub fn page_bounds(
    virt: VirtualAddress,
    phys: PhysicalAddress,
    size: usize,
) -> Option<(VirtualAddress, PhysicalAddress, usize)> {
    let len = virt
        .page_offset()
        .checked_add(size)?
        .div_ceil(FRAME_SIZE)
        .checked_mul(FRAME_SIZE)?;
    Some((virt.align_down(FRAME_SIZE), phys.align_down(FRAME_SIZE), len))
}

/// Maps a range, large pages first where alignment and remaining length allow, one
/// frame at a time otherwise. Virtual page 0 is skipped.
///
/// Stops at the first error; entries installed before it stay installed.
pub fn map_range<F: PagingFormat>(
    arena: &mut TableArena<F>,
    frames: &FrameAllocator,
    request: &MapRequest,
) -> Result<MapSummary, VmError> {
    let (mut virt, mut phys, mut remaining) =
        page_bounds(request.virt, request.phys, request.size).ok_or(VmError::AddressOutOfRange)?;
    let large = F::span(F::LARGE_PAGE_LEVEL);
    let mut summary = MapSummary::default();

    if virt.is_null() && remaining > 0 {
        virt = virt + FRAME_SIZE;
        phys = phys + FRAME_SIZE;
        remaining -= FRAME_SIZE;
    }

    while remaining > 0 {
        let mut step = None;
        if request.large_pages
            && remaining >= large
            && virt.is_aligned(large)
            && phys.is_aligned(large)
            && let Outcome::Done(done) =
                map_one(arena, frames, request, virt, phys, F::LARGE_PAGE_LEVEL)?
        {
            step = Some((done, large));
        }
        let (done, advance) = match step {
            Some(step) => step,
            None => match map_one(arena, frames, request, virt, phys, 0)? {
                Outcome::Done(done) => (done, FRAME_SIZE),
                Outcome::Descend => unreachable!("level 0 slots never hold tables"),
            },
        };
        summary.record(done);

        // the last step may end at the very top of the address space
        remaining -= advance;
        if remaining > 0 {
            virt = virt + advance;
            phys = phys + advance;
        }
    }
    Ok(summary)
}

fn map_one<F: PagingFormat>(
    arena: &mut TableArena<F>,
    frames: &FrameAllocator,
    request: &MapRequest,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    target: usize,
) -> Result<Outcome, VmError> {
    let top = F::LEVELS - 1;
    let wanted = Mapping {
        frame: phys,
        flags: request.flags,
    };
    let mut dir = request.root;

    for level in (target + 1..=top).rev() {
        let index = F::index(virt, level);
        match arena[dir].slot(index) {
            Slot::Table(child) => dir = child,
            Slot::Empty => {
                if request.sealed && level == top {
                    return Err(VmError::BootstrapOnly);
                }
                let child = arena.alloc(frames, level - 1, request.user)?;
                arena.set(dir, index, Slot::Table(child));
                dir = child;
            }
            Slot::Large(existing) => {
                // a large page already covers the target; accept it only if it
                // translates the same way with the same attributes
                let base = virt.as_usize() & !(F::span(level) - 1);
                let expected = existing.frame + (virt.as_usize() - base);
                if expected == phys && existing.flags == request.flags {
                    return Ok(Outcome::Done(Step::Unchanged));
                }
                log::warn!(
                    "{} -> {} conflicts with large page {:?} at level {}",
                    virt,
                    phys,
                    existing,
                    level
                );
                return Err(VmError::Incompatible);
            }
            Slot::Leaf(_) => return Err(VmError::Incompatible),
        }
    }

    let index = F::index(virt, target);
    let installed = if target == 0 {
        Slot::Leaf(wanted)
    } else {
        Slot::Large(wanted)
    };
    match arena[dir].slot(index) {
        Slot::Empty => {
            if request.sealed && target == top {
                return Err(VmError::BootstrapOnly);
            }
            arena.set(dir, index, installed);
            Ok(Outcome::Done(Step::Installed))
        }
        Slot::Table(_) => Ok(Outcome::Descend),
        Slot::Leaf(existing) | Slot::Large(existing) => {
            if existing.frame != phys {
                log::warn!(
                    "{} -> {} conflicts with existing mapping {:?}",
                    virt,
                    phys,
                    existing
                );
                Err(VmError::Incompatible)
            } else if existing.flags == request.flags {
                Ok(Outcome::Done(Step::Unchanged))
            } else {
                arena.set(dir, index, installed);
                Ok(Outcome::Done(Step::Updated))
            }
        }
    }
}

/// Finds the level-0 mapping for `virt`. Absent levels and large pages give `None`.
pub fn leaf<F: PagingFormat>(
    arena: &TableArena<F>,
    root: SlabId,
    virt: VirtualAddress,
) -> Option<Mapping> {
    let mut dir = root;
    for level in (1..F::LEVELS).rev() {
        match arena[dir].slot(F::index(virt, level)) {
            Slot::Table(child) => dir = child,
            _ => return None,
        }
    }
    match arena[dir].slot(F::index(virt, 0)) {
        Slot::Leaf(mapping) => Some(mapping),
        _ => None,
    }
}

/// Translates `virt` through leaf or large entries.
pub fn resolve<F: PagingFormat>(
    arena: &TableArena<F>,
    root: SlabId,
    virt: VirtualAddress,
) -> Option<PhysicalAddress> {
    let mut dir = root;
    for level in (0..F::LEVELS).rev() {
        match arena[dir].slot(F::index(virt, level)) {
            Slot::Table(child) => dir = child,
            Slot::Leaf(mapping) | Slot::Large(mapping) => {
                let offset = virt.as_usize() & (F::span(level) - 1);
                return Some(mapping.frame + offset);
            }
            Slot::Empty => return None,
        }
    }
    None
}

/// Frees every directory reachable from the private lower half of `root`, then `root`
/// itself. Shared upper-half entries are left untouched. Returns the number of frames
/// released.
pub fn release_private<F: PagingFormat>(
    arena: &mut TableArena<F>,
    frames: &FrameAllocator,
    root: SlabId,
) -> usize {
    let mut released = 0;
    for index in 0..F::USER_SPLIT {
        if let Slot::Table(child) = arena[root].slot(index) {
            released += release_subtree(arena, frames, child);
        }
    }
    arena.release(root, frames);
    released + 1
}

fn release_subtree<F: PagingFormat>(
    arena: &mut TableArena<F>,
    frames: &FrameAllocator,
    dir: SlabId,
) -> usize {
    let mut released = 0;
    if arena[dir].level() > 0 {
        for index in 0..F::ENTRIES {
            if let Slot::Table(child) = arena[dir].slot(index) {
                released += release_subtree(arena, frames, child);
            }
        }
    }
    arena.release(dir, frames);
    released + 1
}
