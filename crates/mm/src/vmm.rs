//! The virtual memory manager.
//!
//! Owns one shared kernel translation tree and any number of task trees. A task tree
//! shares the kernel's upper-half root entries by reference and keeps its lower half
//! private. All table pages come from the [`FrameAllocator`]; every structural change
//! happens under one interrupt-safe spinlock.
//!
//! The lifecycle is `new` (nothing mapped, usable in a `static`) followed by exactly
//! one successful [`VirtualMemoryManager::init`], which builds the kernel tree and
//! activates it on the calling CPU.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use spin::Once;
use thiserror::Error;

use crate::{
    AddressSpace, AddressTranslator, AllocError, BootMap, BootRegion, CachePolicy, FRAME_SIZE,
    FrameAllocator, HumanSize, KernelDescriptor, PageEntry, PageFlags, PhysicalAddress,
    VirtualAddress,
    arch::{self, InterruptGuard},
    paging::{
        PagingFormat,
        arena::{SlabId, Slot, TableArena},
        walk::{self, MapRequest, MapSummary},
    },
    sync::IrqSpinLock,
};

/// Ranges longer than this many pages flush the whole local TLB instead of one page at
/// a time.
const FLUSH_ALL_THRESHOLD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("the memory manager has not been initialized")]
    NotInitialized,
    #[error("out of physical memory for translation tables")]
    OutOfMemory,
    #[error("new top-level kernel entries can only be created during bootstrap")]
    BootstrapOnly,
    #[error("the range overlaps an incompatible existing mapping")]
    Incompatible,
    #[error("the address space is not the active one")]
    NotActive,
    #[error("the operation is not allowed on the kernel address space")]
    KernelSpace,
    #[error("the range is outside the user half of the address space")]
    NotUserAddress,
    #[error("the address cannot be expressed by this translation format")]
    AddressOutOfRange,
    #[error("already running on the kernel address space through enter_kernel")]
    NestedKernelEntry,
    #[error("leave_kernel without a matching enter_kernel")]
    NotInKernel,
    #[error("the address space is not known to this memory manager")]
    UnknownAddressSpace,
    #[error("the address space is active or saved and cannot be destroyed")]
    AddressSpaceActive,
    #[error("the CPU cannot run this translation format")]
    UnsupportedMode,
}

impl From<AllocError> for VmError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::NotInitialized => Self::NotInitialized,
            AllocError::OutOfMemory | AllocError::OrderTooLarge(_) => Self::OutOfMemory,
        }
    }
}

/// A physical address window of device registers the kernel needs mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceWindow {
    pub base: PhysicalAddress,
    pub size: usize,
    pub policy: CachePolicy,
}

impl DeviceWindow {
    /// An uncached window.
    pub const fn new(base: PhysicalAddress, size: usize) -> Self {
        Self {
            base,
            size,
            policy: CachePolicy::Uncached,
        }
    }

    pub const fn with_policy(self, policy: CachePolicy) -> Self {
        Self { policy, ..self }
    }
}

impl fmt::Display for DeviceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{} ({:?})",
            self.base,
            self.base.as_usize().saturating_add(self.size),
            self.policy
        )
    }
}

/// Memory manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmmConfig {
    /// Promote aligned ranges to large pages.
    pub large_pages: bool,
    /// Also map all kernel-owned memory at `physical + offset`.
    pub direct_map_offset: Option<usize>,
    /// Also map the kernel image region at this virtual address.
    pub kernel_image_base: Option<VirtualAddress>,
}

impl VmmConfig {
    pub const fn new() -> Self {
        Self {
            large_pages: true,
            direct_map_offset: None,
            kernel_image_base: None,
        }
    }

    pub const fn with_large_pages(self, large_pages: bool) -> Self {
        Self {
            large_pages,
            ..self
        }
    }

    pub const fn with_direct_map_offset(self, offset: usize) -> Self {
        Self {
            direct_map_offset: Some(offset),
            ..self
        }
    }

    pub const fn with_kernel_image_base(self, base: VirtualAddress) -> Self {
        Self {
            kernel_image_base: Some(base),
            ..self
        }
    }
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Roots one CPU is using, as seen by this manager.
#[derive(Debug, Default, Clone, Copy)]
struct CpuRoots {
    /// Last root this manager loaded on the CPU.
    loaded: PhysicalAddress,
    /// Root that was active when `enter_kernel` switched away from it.
    saved: Option<PhysicalAddress>,
}

struct Tree<F: PagingFormat> {
    arena: TableArena<F>,
    kernel_root: SlabId,
    bootstrap: bool,
    /// Keyed by `arch::cpu_id`.
    cpus: BTreeMap<usize, CpuRoots>,
    spaces: BTreeSet<PhysicalAddress>,
}

impl<F: PagingFormat> Tree<F> {
    /// Whether any CPU has `root` loaded or saved.
    fn in_use(&self, root: PhysicalAddress) -> bool {
        self.cpus
            .values()
            .any(|cpu| cpu.loaded == root || cpu.saved == Some(root))
    }

    fn in_kernel(&self, cpu: usize) -> bool {
        self.cpus.get(&cpu).is_some_and(|roots| roots.saved.is_some())
    }

    fn kernel_root_frame(&self) -> PhysicalAddress {
        self.arena[self.kernel_root].frame()
    }

    fn task_root(&self, space: AddressSpace) -> Result<SlabId, VmError> {
        if space.root() == self.kernel_root_frame() {
            return Err(VmError::KernelSpace);
        }
        if !self.spaces.contains(&space.root()) {
            return Err(VmError::UnknownAddressSpace);
        }
        self.arena
            .find(space.root())
            .ok_or(VmError::UnknownAddressSpace)
    }

    fn any_root(&self, space: AddressSpace) -> Option<SlabId> {
        if space.root() == self.kernel_root_frame() || self.spaces.contains(&space.root()) {
            self.arena.find(space.root())
        } else {
            None
        }
    }
}

/// The virtual memory manager service for tree shape `F`.
pub struct VirtualMemoryManager<'a, F: PagingFormat> {
    frames: &'a FrameAllocator,
    descriptor: &'a KernelDescriptor,
    translator: AddressTranslator,
    config: VmmConfig,
    tree: IrqSpinLock<Option<Tree<F>>>,
    kernel_space: Once<AddressSpace>,
    /// Physical address of the active root, read by the interrupt path.
    root_feed: AtomicUsize,
}

impl<'a, F: PagingFormat> VirtualMemoryManager<'a, F> {
    pub const fn new(
        frames: &'a FrameAllocator,
        descriptor: &'a KernelDescriptor,
        translator: AddressTranslator,
        config: VmmConfig,
    ) -> Self {
        Self {
            frames,
            descriptor,
            translator,
            config,
            tree: IrqSpinLock::new(None),
            kernel_space: Once::new(),
            root_feed: AtomicUsize::new(0),
        }
    }

    /// Builds and activates the kernel tree.
    ///
    /// Every kernel-owned region of `map` is identity-mapped (and mirrored at the
    /// direct-map offset when configured), the kernel image is mapped at its configured
    /// base, and each device window is mapped with its cache policy. Windows that
    /// conflict with earlier mappings are skipped; the ones that were mapped are
    /// published to the kernel descriptor. The tree is then loaded with interrupts held
    /// off and the root feed updated before they come back on.
    ///
    /// Calling `init` again after it succeeded returns the kernel space unchanged.
    pub fn init(
        &self,
        map: &BootMap<'_>,
        windows: &[DeviceWindow],
    ) -> Result<AddressSpace, VmError> {
        let mut state = self.tree.lock();
        if let Some(space) = self.kernel_space.get() {
            return Ok(*space);
        }
        if !arch::supports(F::MODE) {
            return Err(VmError::UnsupportedMode);
        }

        let mut arena = TableArena::new();
        let kernel_root = arena.alloc(self.frames, F::LEVELS - 1, false)?;
        let mut tree = Tree {
            arena,
            kernel_root,
            bootstrap: true,
            cpus: BTreeMap::new(),
            spaces: BTreeSet::new(),
        };

        if let Err(err) = self.populate(&mut tree, map, windows) {
            tree.arena.release_all(self.frames);
            return Err(err);
        }
        tree.arena.commit(&self.translator);

        let root = tree.kernel_root_frame();
        {
            let _irq = InterruptGuard::new();
            // SAFETY: the tree maps every kernel-owned region, which includes the running
            // kernel image and boot stack.
            unsafe {
                arch::load_root(root);
                arch::enable_translation(F::MODE);
            }
            self.root_feed.store(root.as_usize(), Ordering::Release);
        }
        tree.cpus.insert(
            arch::cpu_id(),
            CpuRoots {
                loaded: root,
                saved: None,
            },
        );
        tree.bootstrap = false;

        log::info!(
            "{} translation active, root {}, {} table pages",
            F::NAME,
            root,
            tree.arena.len()
        );
        *state = Some(tree);
        Ok(*self.kernel_space.call_once(|| AddressSpace::new(root)))
    }

    fn populate(
        &self,
        tree: &mut Tree<F>,
        map: &BootMap<'_>,
        windows: &[DeviceWindow],
    ) -> Result<(), VmError> {
        for region in map.regions().filter(BootRegion::is_mapped) {
            let Some((base, size)) = Self::reachable(&region) else {
                continue;
            };
            let policy = if region.is_uncached() {
                CachePolicy::Uncached
            } else {
                CachePolicy::WriteBack
            };
            self.map_kernel_locked(tree, base, size, policy)?;
            log::debug!("mapped {:?} {}..{} {:?}", region.kind, base, base + size, policy);
        }

        if let Some(virt) = self.config.kernel_image_base {
            match self.descriptor.kernel_image() {
                Some(image) => {
                    let flags = PageFlags::kernel_data();
                    self.map_locked(tree, virt, image.base(), image.size(), flags)?;
                    log::debug!("mapped kernel image {} at {}", image, virt);
                }
                None => log::warn!("kernel image base set but no kernel image region known"),
            }
        }

        let mut enabled = Vec::with_capacity(windows.len());
        for window in windows {
            match self.map_kernel_locked(tree, window.base, window.size, window.policy) {
                Ok(_) => {
                    log::debug!("mapped device window {}", window);
                    enabled.push(*window);
                }
                Err(VmError::OutOfMemory) => return Err(VmError::OutOfMemory),
                Err(err) => log::warn!("device window {} skipped: {}", window, err),
            }
        }
        self.descriptor.publish_device_windows(&enabled);
        Ok(())
    }

    /// Clips a boot region to what this format can identity-map.
    fn reachable(region: &BootRegion) -> Option<(PhysicalAddress, usize)> {
        let limit = F::PHYSICAL_END.min(F::IDENTITY_END);
        let base = region.base().as_usize() as u64;
        let end = region.end().as_usize() as u64;
        if base >= limit {
            log::warn!(
                "{:?} region at {} is beyond {} reach",
                region.kind,
                region.base(),
                F::NAME
            );
            return None;
        }
        if end > limit {
            log::warn!(
                "{:?} region at {} clipped to {} of {}",
                region.kind,
                region.base(),
                HumanSize((limit - base) as usize),
                HumanSize(region.size())
            );
            return Some((region.base(), (limit - base) as usize));
        }
        Some((region.base(), region.size()))
    }

    fn map_locked(
        &self,
        tree: &mut Tree<F>,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: usize,
        flags: PageFlags,
    ) -> Result<MapSummary, VmError> {
        if size == 0 {
            return Ok(MapSummary::default());
        }
        Self::check_range(virt, phys, size)?;
        walk::map_range(
            &mut tree.arena,
            self.frames,
            &MapRequest {
                root: tree.kernel_root,
                virt,
                phys,
                size,
                flags,
                sealed: !tree.bootstrap,
                user: false,
                large_pages: self.config.large_pages,
            },
        )
    }

    fn check_range(
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<(), VmError> {
        let Some(last) = size.checked_sub(1) else {
            return Ok(());
        };
        let last_virt = virt
            .as_usize()
            .checked_add(last)
            .ok_or(VmError::AddressOutOfRange)?;
        let last_phys = phys
            .as_usize()
            .checked_add(last)
            .ok_or(VmError::AddressOutOfRange)?;
        if !F::virtual_range_in_range(virt.as_usize(), last_virt)
            || !F::physical_in_range(last_phys)
        {
            return Err(VmError::AddressOutOfRange);
        }
        Ok(())
    }

    /// Both views are checked before either is touched, so `AddressOutOfRange` leaves
    /// the tree unchanged.
    fn map_kernel_locked(
        &self,
        tree: &mut Tree<F>,
        addr: PhysicalAddress,
        size: usize,
        policy: CachePolicy,
    ) -> Result<bool, VmError> {
        let flags = PageFlags::kernel_data().with_cache_policy(policy);
        let mirror = self.mirror(addr).transpose()?;
        Self::check_range(VirtualAddress::identity(addr), addr, size)?;
        if let Some(mirror) = mirror {
            Self::check_range(mirror, addr, size)?;
        }
        let identity = self.map_locked(tree, VirtualAddress::identity(addr), addr, size, flags)?;
        let mut changed = identity.changed();
        if let Some(mirror) = mirror {
            changed |= self.map_locked(tree, mirror, addr, size, flags)?.changed();
        }
        Ok(changed)
    }

    fn mirror(&self, addr: PhysicalAddress) -> Option<Result<VirtualAddress, VmError>> {
        let offset = self.config.direct_map_offset?;
        Some(
            addr.as_usize()
                .checked_add(offset)
                .map(VirtualAddress::new)
                .ok_or(VmError::AddressOutOfRange),
        )
    }

    /// Ensures `addr..addr + size` is identity-mapped in the kernel tree with `policy`,
    /// and mirrored at the direct-map offset when one is configured.
    ///
    /// Pages already mapped to the same frame are left alone, or have their attributes
    /// replaced if they differ. Mapping over a different frame fails with
    /// [`VmError::Incompatible`]; needing a new top-level kernel entry fails with
    /// [`VmError::BootstrapOnly`]. The local TLB is invalidated for the range before
    /// returning, also on failure unless the range itself was rejected.
    pub fn map_kernel(
        &self,
        addr: PhysicalAddress,
        size: usize,
        policy: CachePolicy,
    ) -> Result<(), VmError> {
        let result = {
            let mut state = self.tree.lock();
            let tree = state.as_mut().ok_or(VmError::NotInitialized)?;
            let result = self.map_kernel_locked(tree, addr, size, policy);
            tree.arena.commit(&self.translator);
            result
        };
        if result != Err(VmError::AddressOutOfRange) {
            self.invalidate(VirtualAddress::identity(addr), size);
            if let Some(Ok(mirror)) = self.mirror(addr) {
                self.invalidate(mirror, size);
            }
        }
        if let Ok(true) = result {
            log::trace!("mapped {}..{} {:?}", addr, addr + size, policy);
        }
        result.map(|_| ())
    }

    /// Creates a task address space: a new root sharing the kernel's upper-half entries
    /// with an empty private lower half.
    pub fn create_address_space(&self) -> Result<AddressSpace, VmError> {
        let mut state = self.tree.lock();
        let tree = state.as_mut().ok_or(VmError::NotInitialized)?;
        let root = tree.arena.alloc(self.frames, F::LEVELS - 1, false)?;
        for index in F::USER_SPLIT..F::ENTRIES {
            let shared = tree.arena[tree.kernel_root].slot(index);
            if shared != Slot::Empty {
                tree.arena.set(root, index, shared);
            }
        }
        tree.arena.commit(&self.translator);

        let frame = tree.arena[root].frame();
        tree.spaces.insert(frame);
        log::debug!("created address space {}", frame);
        Ok(AddressSpace::new(frame))
    }

    /// Destroys a task address space, freeing every private table and then the root.
    /// Shared kernel tables are never touched. Frames mapped by the task's leaves are
    /// the caller's to free.
    ///
    /// Fails with [`VmError::AddressSpaceActive`] while any CPU has the space loaded or
    /// saved by `enter_kernel`.
    pub fn delete_address_space(&self, space: AddressSpace) -> Result<(), VmError> {
        let mut state = self.tree.lock();
        let tree = state.as_mut().ok_or(VmError::NotInitialized)?;
        let root = tree.task_root(space)?;
        if arch::active_root() == space.root() || tree.in_use(space.root()) {
            return Err(VmError::AddressSpaceActive);
        }
        let released = walk::release_private(&mut tree.arena, self.frames, root);
        tree.spaces.remove(&space.root());
        log::debug!(
            "deleted address space {} ({} table pages)",
            space.root(),
            released
        );
        Ok(())
    }

    /// Maps `vaddr..vaddr + size` to `paddr` in the private half of `space` with user
    /// access.
    ///
    /// `space` must be the active address space. Table updates are made from the kernel
    /// address space, entered and left internally; the range is invalidated after
    /// switching back.
    pub fn map_user(
        &self,
        space: AddressSpace,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        size: usize,
    ) -> Result<(), VmError> {
        if space.root() != arch::active_root() {
            return Err(VmError::NotActive);
        }
        self.enter_kernel()?;
        let result = self.map_user_locked(space, vaddr, paddr, size);
        self.leave_kernel()?;
        if !matches!(
            result,
            Err(VmError::NotUserAddress | VmError::AddressOutOfRange)
        ) {
            self.invalidate(vaddr, size);
        }
        result
    }

    fn map_user_locked(
        &self,
        space: AddressSpace,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        size: usize,
    ) -> Result<(), VmError> {
        let mut state = self.tree.lock();
        let tree = state.as_mut().ok_or(VmError::NotInitialized)?;
        let root = tree.task_root(space)?;
        if size == 0 {
            return Ok(());
        }
        let last = vaddr
            .as_usize()
            .checked_add(size - 1)
            .ok_or(VmError::NotUserAddress)?;
        if last >= F::user_end() {
            return Err(VmError::NotUserAddress);
        }
        let last_phys = paddr
            .as_usize()
            .checked_add(size - 1)
            .ok_or(VmError::AddressOutOfRange)?;
        if !F::physical_in_range(last_phys) {
            return Err(VmError::AddressOutOfRange);
        }

        let result = walk::map_range(
            &mut tree.arena,
            self.frames,
            &MapRequest {
                root,
                virt: vaddr,
                phys: paddr,
                size,
                flags: PageFlags::user_data(),
                sealed: false,
                user: true,
                large_pages: self.config.large_pages,
            },
        );
        tree.arena.commit(&self.translator);
        result.map(|_| ())
    }

    /// Switches this CPU to the kernel address space, remembering the active one. Does
    /// not nest; other CPUs are unaffected.
    pub fn enter_kernel(&self) -> Result<(), VmError> {
        let mut state = self.tree.lock();
        let tree = state.as_mut().ok_or(VmError::NotInitialized)?;
        let cpu = arch::cpu_id();
        if tree.in_kernel(cpu) {
            return Err(VmError::NestedKernelEntry);
        }
        let current = arch::active_root();
        let kernel = tree.kernel_root_frame();
        tree.cpus.insert(
            cpu,
            CpuRoots {
                loaded: current,
                saved: Some(current),
            },
        );
        if current != kernel {
            self.load(tree, kernel);
        }
        Ok(())
    }

    /// Switches this CPU back to the address space that was active at its
    /// `enter_kernel`.
    pub fn leave_kernel(&self) -> Result<(), VmError> {
        let mut state = self.tree.lock();
        let tree = state.as_mut().ok_or(VmError::NotInitialized)?;
        let saved = tree
            .cpus
            .get_mut(&arch::cpu_id())
            .and_then(|roots| roots.saved.take())
            .ok_or(VmError::NotInKernel)?;
        if arch::active_root() != saved {
            self.load(tree, saved);
        }
        Ok(())
    }

    /// Makes `space` the active address space on this CPU.
    pub fn switch_to(&self, space: AddressSpace) -> Result<(), VmError> {
        let mut state = self.tree.lock();
        let tree = state.as_mut().ok_or(VmError::NotInitialized)?;
        if tree.in_kernel(arch::cpu_id()) {
            return Err(VmError::NestedKernelEntry);
        }
        tree.any_root(space).ok_or(VmError::UnknownAddressSpace)?;
        if arch::active_root() != space.root() {
            self.load(tree, space.root());
        }
        Ok(())
    }

    /// Loads a root on this CPU. Callers hold the tree lock, so interrupts are already
    /// off.
    fn load(&self, tree: &mut Tree<F>, root: PhysicalAddress) {
        // SAFETY: every root this manager hands out shares the kernel's upper half,
        // which maps the running kernel.
        unsafe { arch::load_root(root) };
        tree.cpus.entry(arch::cpu_id()).or_default().loaded = root;
        self.root_feed.store(root.as_usize(), Ordering::Release);
    }

    fn invalidate(&self, virt: VirtualAddress, size: usize) {
        if size == 0 {
            return;
        }
        let Some((start, _, len)) = walk::page_bounds(virt, PhysicalAddress::new(0), size)
        else {
            arch::invalidate_all();
            return;
        };
        let pages = len / FRAME_SIZE;
        if pages > FLUSH_ALL_THRESHOLD {
            arch::invalidate_all();
        } else {
            for page in 0..pages {
                arch::invalidate_page(start + page * FRAME_SIZE);
            }
        }
    }

    /// Returns the level-0 entry translating `vaddr` in `space`.
    ///
    /// `None` when any level is absent, when a large page covers the address, or when
    /// `space` is unknown.
    pub fn get_entry(&self, space: AddressSpace, vaddr: VirtualAddress) -> Option<PageEntry> {
        let state = self.tree.lock();
        let tree = state.as_ref()?;
        let root = tree.any_root(space)?;
        walk::leaf(&tree.arena, root, vaddr).map(|mapping| {
            PageEntry::new(
                mapping.frame,
                mapping.flags,
                F::encode_page(mapping.frame, mapping.flags, 0),
            )
        })
    }

    /// Translates `vaddr` in `space`, through large pages too.
    pub fn translate(&self, space: AddressSpace, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let state = self.tree.lock();
        let tree = state.as_ref()?;
        walk::resolve(&tree.arena, tree.any_root(space)?, vaddr)
    }

    /// The kernel address space, once initialized.
    pub fn kernel_space(&self) -> Option<AddressSpace> {
        self.kernel_space.get().copied()
    }

    /// The root most recently loaded by this manager.
    pub fn active_root_feed(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_feed.load(Ordering::Acquire))
    }

    /// Table pages held across all trees.
    pub fn table_pages(&self) -> usize {
        self.tree
            .lock()
            .as_ref()
            .map_or(0, |tree| tree.arena.len())
    }

    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AllocatorConfig, BootRecord, Narrow, RegionFlags, RegionKind, Wide, Zone,
        arch::emulation,
        descriptor::test_panic,
        frame_allocator::tests::SIXTY_FOUR_MIB,
        paging::TranslationMode,
    };
    use std::sync::Barrier;

    const DIRECT_MAP: usize = 0xFFFF_8000_0000_0000;

    struct Fixture {
        frames: FrameAllocator,
        descriptor: KernelDescriptor,
        records: Vec<BootRecord>,
    }

    impl Fixture {
        fn new(records: &[BootRecord]) -> Self {
            emulation::reset();
            let fixture = Self {
                frames: FrameAllocator::new(AllocatorConfig::new()),
                descriptor: KernelDescriptor::new(test_panic),
                records: records.to_vec(),
            };
            assert!(fixture.frames.init(&fixture.map(), &fixture.descriptor));
            fixture
        }

        fn map(&self) -> BootMap<'_> {
            BootMap::new(&self.records).unwrap()
        }

        fn vmm<F: PagingFormat>(&self, config: VmmConfig) -> VirtualMemoryManager<'_, F> {
            VirtualMemoryManager::new(
                &self.frames,
                &self.descriptor,
                AddressTranslator::emulated(),
                config,
            )
        }

        fn free(&self) -> usize {
            self.frames.available_pages(Zone::Normal)
        }
    }

    fn read_root(vmm: &VirtualMemoryManager<'_, Wide>, space: AddressSpace) -> Vec<u8> {
        let mut page = [0u8; FRAME_SIZE];
        vmm.translator().read_frame(space.root(), &mut page);
        page.to_vec()
    }

    #[test]
    fn init_identity_maps_and_activates() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();

        assert_eq!(arch::active_root(), kernel.root());
        assert_eq!(vmm.active_root_feed(), kernel.root());
        assert_eq!(emulation::translation_mode(), Some(TranslationMode::Wide));
        assert!(emulation::interrupts_enabled());

        for addr in [0x10_0000, 0x1F_F000, 0x20_0000, 0x300_0123, 0x40F_F000] {
            assert_eq!(
                vmm.translate(kernel, VirtualAddress::new(addr)),
                Some(PhysicalAddress::new(addr)),
                "{addr:#x}"
            );
        }
        // reserved memory below 1 MiB is not mapped
        assert_eq!(vmm.translate(kernel, VirtualAddress::new(0x8_0000)), None);
        // root, level 2, level 1, and the two edge leaf tables
        assert_eq!(vmm.table_pages(), 5);
        assert_eq!(fixture.free(), 16384 - 5);
    }

    #[test]
    fn tables_are_readable_through_the_translator() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();

        let root = read_root(&vmm, kernel);
        let entry = u64::from_le_bytes(root[..8].try_into().unwrap());
        assert_eq!(entry & 0x3, 0x3);
        assert_eq!(entry & 0x4, 0, "kernel tables are supervisor-only");
        assert!(root[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn init_is_idempotent() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let first = vmm.init(&fixture.map(), &[]).unwrap();
        let pages = vmm.table_pages();
        assert_eq!(vmm.init(&fixture.map(), &[]).unwrap(), first);
        assert_eq!(vmm.table_pages(), pages);
        assert_eq!(vmm.kernel_space(), Some(first));
    }

    #[test]
    fn operations_before_init_are_rejected() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        assert_eq!(
            vmm.map_kernel(PhysicalAddress::new(0x1000), 0x1000, CachePolicy::WriteBack),
            Err(VmError::NotInitialized)
        );
        assert_eq!(vmm.create_address_space(), Err(VmError::NotInitialized));
        assert_eq!(vmm.enter_kernel(), Err(VmError::NotInitialized));
        assert_eq!(vmm.kernel_space(), None);
        assert_eq!(vmm.table_pages(), 0);
    }

    #[test]
    fn uncached_device_window_after_init() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();
        emulation::take_invalidations();

        let window = PhysicalAddress::new(0xFEC0_0000);
        vmm.map_kernel(window, 0x1000, CachePolicy::Uncached).unwrap();

        let entry = vmm.get_entry(kernel, VirtualAddress::identity(window)).unwrap();
        assert_eq!(entry.frame(), window);
        assert_eq!(entry.cache_policy(), CachePolicy::Uncached);
        assert_ne!(entry.raw() & 0x1, 0, "present");
        assert_ne!(entry.raw() & 0x10, 0, "cache disable");
        assert_eq!(emulation::take_invalidations(), [VirtualAddress::new(0xFEC0_0000)]);
    }

    #[test]
    fn map_kernel_is_idempotent() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();

        let addr = PhysicalAddress::new(0x8000_0000);
        vmm.map_kernel(addr, 0x5000, CachePolicy::WriteThrough).unwrap();
        let pages = vmm.table_pages();
        let free = fixture.free();
        let before = vmm.get_entry(kernel, VirtualAddress::new(0x8000_2000));

        vmm.map_kernel(addr, 0x5000, CachePolicy::WriteThrough).unwrap();
        assert_eq!(vmm.table_pages(), pages);
        assert_eq!(fixture.free(), free);
        assert_eq!(vmm.get_entry(kernel, VirtualAddress::new(0x8000_2000)), before);
    }

    #[test]
    fn map_kernel_changes_policy_but_not_frames() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new().with_large_pages(false));
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();

        // turn a cached identity page uncached
        vmm.map_kernel(PhysicalAddress::new(0x20_0000), 0x1000, CachePolicy::Uncached)
            .unwrap();
        let entry = vmm.get_entry(kernel, VirtualAddress::new(0x20_0000)).unwrap();
        assert_eq!(entry.cache_policy(), CachePolicy::Uncached);
    }

    #[test]
    fn large_flushes_invalidate_everything() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        vmm.init(&fixture.map(), &[]).unwrap();
        emulation::take_invalidations();

        vmm.map_kernel(PhysicalAddress::new(0x8000_0000), 64 * FRAME_SIZE, CachePolicy::WriteBack)
            .unwrap();
        assert_eq!(emulation::full_flushes(), 1);
        assert!(emulation::take_invalidations().is_empty());
    }

    #[test]
    fn kernel_top_level_is_sealed_after_init() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        vmm.init(&fixture.map(), &[]).unwrap();

        // 512 GiB lies in the second top-level slot, which init never created
        assert_eq!(
            vmm.map_kernel(PhysicalAddress::new(0x80_0000_0000), 0x1000, CachePolicy::WriteBack),
            Err(VmError::BootstrapOnly)
        );
    }

    #[test]
    fn direct_map_mirror_and_kernel_image() {
        let records = [
            BootRecord::new(0x0, RegionKind::Reserved),
            BootRecord::new(0x10_0000, RegionKind::KernelImage),
            BootRecord::new(0x30_0000, RegionKind::Free),
            BootRecord::new(0x100_0000, RegionKind::End),
        ];
        let fixture = Fixture::new(&records);
        let image_base = VirtualAddress::new(0xFFFF_FFFF_8000_0000);
        let vmm = fixture.vmm::<Wide>(
            VmmConfig::new()
                .with_direct_map_offset(DIRECT_MAP)
                .with_kernel_image_base(image_base),
        );
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();

        assert_eq!(
            vmm.translate(kernel, VirtualAddress::new(DIRECT_MAP + 0x40_1234)),
            Some(PhysicalAddress::new(0x40_1234))
        );
        assert_eq!(
            vmm.translate(kernel, image_base + 0x1_2345),
            Some(PhysicalAddress::new(0x11_2345))
        );

        // new windows after init land in the already-created direct-map slot
        vmm.map_kernel(PhysicalAddress::new(0xFEE0_0000), 0x1000, CachePolicy::Uncached)
            .unwrap();
        let mirror = vmm
            .get_entry(kernel, VirtualAddress::new(DIRECT_MAP + 0xFEE0_0000))
            .unwrap();
        assert_eq!(mirror.cache_policy(), CachePolicy::Uncached);
    }

    #[test]
    fn boot_flags_drive_caching() {
        let records = [
            BootRecord::new(0x0, RegionKind::Reserved),
            BootRecord::new(0x10_0000, RegionKind::Free),
            BootRecord::new(0x20_0000, RegionKind::AcpiNvs).with_flags(RegionFlags::UNCACHED),
            BootRecord::new(0x20_1000, RegionKind::BootReclaimable)
                .with_flags(RegionFlags::NO_MAP),
            BootRecord::new(0x20_2000, RegionKind::Device),
            BootRecord::new(0x20_3000, RegionKind::Bad),
            BootRecord::new(0x20_4000, RegionKind::End),
        ];
        let fixture = Fixture::new(&records);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();

        let policy = |addr| {
            vmm.get_entry(kernel, VirtualAddress::new(addr))
                .map(|entry| entry.cache_policy())
        };
        assert_eq!(policy(0x1F_F000), Some(CachePolicy::WriteBack));
        assert_eq!(policy(0x20_0000), Some(CachePolicy::Uncached));
        assert_eq!(policy(0x20_1000), None);
        assert_eq!(policy(0x20_2000), Some(CachePolicy::Uncached));
        assert_eq!(policy(0x20_3000), None);
    }

    #[test]
    fn conflicting_windows_are_skipped_and_not_published() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new().with_large_pages(false));
        let good = DeviceWindow::new(PhysicalAddress::new(0xFEC0_0000), 0x1000);
        let out_of_reach = DeviceWindow::new(PhysicalAddress::new(0x0010_0000_0000_0000), 0x1000);
        vmm.init(&fixture.map(), &[good, out_of_reach]).unwrap();

        assert_eq!(fixture.descriptor.device_windows(), [good]);
    }

    #[test]
    fn init_out_of_memory_returns_every_table() {
        let records = [
            BootRecord::new(0x0, RegionKind::Reserved),
            BootRecord::new(0x1000, RegionKind::Free),
            BootRecord::new(0x4000, RegionKind::Reserved),
            BootRecord::new(0x10_0000, RegionKind::KernelImage),
            BootRecord::new(0x10_1000, RegionKind::End),
        ];
        let fixture = Fixture::new(&records);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        assert_eq!(vmm.init(&fixture.map(), &[]), Err(VmError::OutOfMemory));
        assert_eq!(fixture.free(), 3);
        assert_eq!(vmm.kernel_space(), None);
        assert_eq!(vmm.table_pages(), 0);
    }

    #[test]
    fn task_spaces_are_isolated() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new().with_direct_map_offset(DIRECT_MAP));
        vmm.init(&fixture.map(), &[]).unwrap();
        let a = vmm.create_address_space().unwrap();
        let b = vmm.create_address_space().unwrap();
        let user = VirtualAddress::new(0x40_0000);

        vmm.switch_to(a).unwrap();
        assert_eq!(vmm.active_root_feed(), a.root());
        vmm.map_user(a, user, PhysicalAddress::new(0x80_0000), 0x2000).unwrap();
        assert_eq!(
            vmm.map_user(b, user, PhysicalAddress::new(0x90_0000), 0x1000),
            Err(VmError::NotActive)
        );

        vmm.switch_to(b).unwrap();
        vmm.map_user(b, user, PhysicalAddress::new(0x90_0000), 0x1000).unwrap();

        assert_eq!(vmm.translate(a, user), Some(PhysicalAddress::new(0x80_0000)));
        assert_eq!(vmm.translate(b, user), Some(PhysicalAddress::new(0x90_0000)));
        assert_eq!(vmm.translate(b, user + 0x1000), None);
        assert!(vmm.get_entry(a, user).unwrap().flags().is_user());

        // both share the kernel's upper half
        let shared = VirtualAddress::new(DIRECT_MAP + 0x20_0000);
        assert_eq!(vmm.translate(a, shared), Some(PhysicalAddress::new(0x20_0000)));
        assert_eq!(vmm.translate(b, shared), Some(PhysicalAddress::new(0x20_0000)));
        // but not its identity-mapped lower half
        assert_eq!(vmm.translate(a, VirtualAddress::new(0x20_0000)), None);
    }

    #[test]
    fn map_user_rejects_kernel_half_and_restores_root() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();
        let task = vmm.create_address_space().unwrap();
        vmm.switch_to(task).unwrap();

        assert_eq!(
            vmm.map_user(task, VirtualAddress::new(0x7FFF_FFFF_F000), PhysicalAddress::new(0x1000), 0x2000),
            Err(VmError::NotUserAddress)
        );
        assert_eq!(arch::active_root(), task.root());

        vmm.switch_to(kernel).unwrap();
        assert_eq!(
            vmm.map_user(kernel, VirtualAddress::new(0x1000), PhysicalAddress::new(0x1000), 0x1000),
            Err(VmError::KernelSpace)
        );
        assert_eq!(arch::active_root(), kernel.root());
    }

    #[test]
    fn teardown_frees_exactly_the_private_tables() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new().with_direct_map_offset(DIRECT_MAP));
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();
        let kernel_root = read_root(&vmm, kernel);
        let free = fixture.free();
        let tables = vmm.table_pages();

        let task = vmm.create_address_space().unwrap();
        vmm.switch_to(task).unwrap();
        vmm.map_user(task, VirtualAddress::new(0x40_0000), PhysicalAddress::new(0x80_0000), 0x1000)
            .unwrap();
        vmm.map_user(task, VirtualAddress::new(0x7000_0000_0000), PhysicalAddress::new(0x90_0000), 0x1000)
            .unwrap();
        // root plus two private three-level branches
        assert_eq!(vmm.table_pages(), tables + 7);

        assert_eq!(vmm.delete_address_space(task), Err(VmError::AddressSpaceActive));
        vmm.switch_to(kernel).unwrap();
        vmm.delete_address_space(task).unwrap();

        assert_eq!(fixture.free(), free);
        assert_eq!(vmm.table_pages(), tables);
        assert_eq!(read_root(&vmm, kernel), kernel_root);
        assert_eq!(
            vmm.translate(kernel, VirtualAddress::new(DIRECT_MAP + 0x20_0000)),
            Some(PhysicalAddress::new(0x20_0000))
        );
        assert_eq!(
            vmm.delete_address_space(task),
            Err(VmError::UnknownAddressSpace)
        );
        assert_eq!(vmm.delete_address_space(kernel), Err(VmError::KernelSpace));
    }

    #[test]
    fn enter_and_leave_kernel() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();
        let task = vmm.create_address_space().unwrap();
        vmm.switch_to(task).unwrap();

        assert_eq!(vmm.leave_kernel(), Err(VmError::NotInKernel));
        vmm.enter_kernel().unwrap();
        assert_eq!(arch::active_root(), kernel.root());
        assert_eq!(vmm.active_root_feed(), kernel.root());
        assert_eq!(vmm.enter_kernel(), Err(VmError::NestedKernelEntry));
        assert_eq!(vmm.switch_to(task), Err(VmError::NestedKernelEntry));
        assert_eq!(vmm.delete_address_space(task), Err(VmError::AddressSpaceActive));

        vmm.leave_kernel().unwrap();
        assert_eq!(arch::active_root(), task.root());
        assert_eq!(vmm.active_root_feed(), task.root());
        assert!(emulation::interrupts_enabled());
    }

    #[test]
    fn cpus_enter_and_leave_the_kernel_independently() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();
        let a = vmm.create_address_space().unwrap();
        let b = vmm.create_address_space().unwrap();

        // every host thread runs on its own emulated CPU
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    vmm.switch_to(a).unwrap();
                    vmm.enter_kernel().unwrap();
                    assert_eq!(arch::active_root(), kernel.root());
                })
                .join()
                .unwrap();

            scope
                .spawn(|| {
                    assert_eq!(vmm.leave_kernel(), Err(VmError::NotInKernel));
                    vmm.switch_to(b).unwrap();
                    vmm.map_user(b, VirtualAddress::new(0x40_0000), PhysicalAddress::new(0x80_0000), 0x1000)
                        .unwrap();
                    assert_eq!(arch::active_root(), b.root());

                    vmm.enter_kernel().unwrap();
                    vmm.leave_kernel().unwrap();
                    assert_eq!(arch::active_root(), b.root());

                    // the other CPU still holds `a` saved
                    assert_eq!(vmm.delete_address_space(a), Err(VmError::AddressSpaceActive));
                    vmm.switch_to(kernel).unwrap();
                    vmm.delete_address_space(b).unwrap();
                })
                .join()
                .unwrap();
        });

        assert_eq!(vmm.translate(a, VirtualAddress::new(0x40_0000)), None);
        assert_eq!(vmm.delete_address_space(a), Err(VmError::AddressSpaceActive));
    }

    #[test]
    fn spaces_loaded_on_another_cpu_are_not_deleted() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();
        let task = vmm.create_address_space().unwrap();

        let barrier = Barrier::new(2);
        let while_loaded = std::thread::scope(|scope| {
            scope.spawn(|| {
                vmm.switch_to(task).unwrap();
                barrier.wait();
                barrier.wait();
                vmm.switch_to(kernel).unwrap();
            });
            barrier.wait();
            let result = vmm.delete_address_space(task);
            barrier.wait();
            result
        });
        assert_eq!(while_loaded, Err(VmError::AddressSpaceActive));
        assert_eq!(arch::active_root(), kernel.root());
        vmm.delete_address_space(task).unwrap();
    }

    #[test]
    fn overflowing_ranges_are_rejected_without_flushing() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new().with_direct_map_offset(DIRECT_MAP));
        vmm.init(&fixture.map(), &[]).unwrap();
        let tables = vmm.table_pages();
        emulation::take_invalidations();
        let flushes = emulation::full_flushes();

        assert_eq!(
            vmm.map_kernel(PhysicalAddress::new(0x1234), usize::MAX - 0x10, CachePolicy::Uncached),
            Err(VmError::AddressOutOfRange)
        );
        assert_eq!(vmm.table_pages(), tables);
        assert!(emulation::take_invalidations().is_empty());
        assert_eq!(emulation::full_flushes(), flushes);

        let task = vmm.create_address_space().unwrap();
        vmm.switch_to(task).unwrap();
        assert_eq!(
            vmm.map_user(task, VirtualAddress::new(0x40_0000), PhysicalAddress::new(0x1000), usize::MAX),
            Err(VmError::NotUserAddress)
        );
        assert_eq!(emulation::full_flushes(), flushes);
    }

    #[test]
    fn narrow_tree_with_windows() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Narrow>(VmmConfig::new());
        let window = DeviceWindow::new(PhysicalAddress::new(0xFEC0_0000), 0x1000);
        let kernel = vmm.init(&fixture.map(), &[window]).unwrap();
        assert_eq!(emulation::translation_mode(), Some(TranslationMode::Narrow));

        let entry = vmm.get_entry(kernel, VirtualAddress::new(0xFEC0_0000)).unwrap();
        assert_eq!(entry.cache_policy(), CachePolicy::Uncached);
        assert!(entry.raw() <= u32::MAX as u64);
        // 4 MiB pages cover the aligned middle of the free region
        assert_eq!(
            vmm.translate(kernel, VirtualAddress::new(0x80_1234)),
            Some(PhysicalAddress::new(0x80_1234))
        );
        assert_eq!(vmm.get_entry(kernel, VirtualAddress::new(0x80_1000)), None);

        assert_eq!(
            vmm.map_kernel(PhysicalAddress::new(0x1_0000_0000), 0x1000, CachePolicy::Uncached),
            Err(VmError::AddressOutOfRange)
        );
        // 3 GiB: no top-level slot was created there during init
        assert_eq!(
            vmm.map_kernel(PhysicalAddress::new(0xC000_0000), 0x1000, CachePolicy::Uncached),
            Err(VmError::BootstrapOnly)
        );
    }

    #[test]
    fn narrow_init_clips_unreachable_regions() {
        let records = [
            BootRecord::new(0x0, RegionKind::Reserved),
            BootRecord::new(0x10_0000, RegionKind::Free),
            BootRecord::new(0x50_0000, RegionKind::Reserved),
            BootRecord::new(0xFFC0_0000, RegionKind::BootReclaimable),
            BootRecord::new(0x1_0040_0000, RegionKind::End),
        ];
        let fixture = Fixture::new(&records);
        let vmm = fixture.vmm::<Narrow>(VmmConfig::new());
        let kernel = vmm.init(&fixture.map(), &[]).unwrap();
        assert_eq!(
            vmm.translate(kernel, VirtualAddress::new(0xFFFF_F000)),
            Some(PhysicalAddress::new(0xFFFF_F000))
        );
    }

    #[test]
    fn get_entry_for_unknown_space_is_none() {
        let fixture = Fixture::new(&SIXTY_FOUR_MIB);
        let vmm = fixture.vmm::<Wide>(VmmConfig::new());
        vmm.init(&fixture.map(), &[]).unwrap();
        let bogus = AddressSpace::new(PhysicalAddress::new(0x1234_0000));
        assert_eq!(vmm.get_entry(bogus, VirtualAddress::new(0x10_0000)), None);
        assert_eq!(vmm.switch_to(bogus), Err(VmError::UnknownAddressSpace));
    }
}
