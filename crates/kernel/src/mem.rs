// cSpell:ignore Hhdm

//! Memory bring-up: the Limine memory map becomes boot records, which feed the frame
//! allocator, the kernel heap and the translation manager.

use alloc::vec::Vec;

use limine::{
    memory_map::EntryType,
    request::{ExecutableAddressRequest, HhdmRequest, MemoryMapRequest, StackSizeRequest},
};
use mm::{
    AddressTranslator, AllocatorConfig, BootMap, BootRecord, DeviceWindow, FRAME_SIZE,
    FrameAllocator, HumanSize, KernelDescriptor, MemoryRegion, PhysicalAddress, RegionKind,
    VirtualAddress, VirtualMemoryManager, VmmConfig, Wide,
};
use spin::Once;

/// Pages donated to the kernel heap once the frame allocator is up (4 MiB).
const POOL_PAGES: usize = 1024;

const STACK_SIZE: u64 = 64 * 1024;

/// Heap claimed on top of the frame bitmap before the frame allocator is up.
const BOOTSTRAP_HEAP_SLACK: u64 = 64 * 1024;

/// The bootstrap heap stays out of the first MiB.
const LOW_MEMORY_END: u64 = 0x10_0000;

const DEVICE_WINDOWS: [DeviceWindow; 2] = [
    // I/O APIC
    DeviceWindow::new(PhysicalAddress::new(0xFEC0_0000), 0x1000),
    // local APIC
    DeviceWindow::new(PhysicalAddress::new(0xFEE0_0000), 0x1000),
];

pub static DESCRIPTOR: KernelDescriptor = KernelDescriptor::new(boot_contract_violated);

pub static FRAMES: FrameAllocator =
    FrameAllocator::new(AllocatorConfig::new().with_pool_pages(POOL_PAGES));

static VMM: Once<VirtualMemoryManager<'static, Wide>> = Once::new();

fn boot_contract_violated(args: core::fmt::Arguments<'_>) -> ! {
    panic!("boot contract violated: {}", args)
}

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HIGHER_HALF_DIRECT_MAP: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static EXECUTABLE_ADDRESS: ExecutableAddressRequest = ExecutableAddressRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static STACK_SIZE_REQUEST: StackSizeRequest = StackSizeRequest::new().with_size(STACK_SIZE);

#[cfg(not(test))]
mod heap {
    use talc::{ClaimOnOom, Span, Talc, Talck};

    const EARLY_HEAP_SIZE: usize = 256 * 1024;

    static mut EARLY_HEAP: [u8; EARLY_HEAP_SIZE] = [0; EARLY_HEAP_SIZE];

    #[global_allocator]
    static ALLOCATOR: Talck<spin::Mutex<()>, ClaimOnOom> = Talc::new(unsafe {
        // SAFETY: the early arena is handed to this allocator and nothing else.
        ClaimOnOom::new(Span::from_array(core::ptr::addr_of!(EARLY_HEAP).cast_mut()))
    })
    .lock();

    /// Extends the heap with memory reachable at `base`.
    ///
    /// # Safety
    ///
    /// `base..base + size` must be mapped, writable and otherwise unused for the rest of
    /// the kernel's life.
    pub unsafe fn claim(base: *mut u8, size: usize) -> bool {
        // SAFETY: forwarded to the caller.
        unsafe { ALLOCATOR.lock().claim(Span::from_base_size(base, size)) }.is_ok()
    }
}


fn region_kind(entry_type: EntryType) -> RegionKind {
    match entry_type {
        EntryType::USABLE => RegionKind::Free,
        EntryType::ACPI_RECLAIMABLE => RegionKind::AcpiReclaimable,
        EntryType::ACPI_NVS => RegionKind::AcpiNvs,
        EntryType::BAD_MEMORY => RegionKind::Bad,
        EntryType::BOOTLOADER_RECLAIMABLE => RegionKind::BootReclaimable,
        EntryType::EXECUTABLE_AND_MODULES => RegionKind::KernelImage,
        EntryType::FRAMEBUFFER => RegionKind::Device,
        _ => RegionKind::Reserved,
    }
}

/// Physical frames under the boot stack, found through the direct map.
fn stack_frames(stack_top: usize, hhdm: usize) -> Option<(u64, u64)> {
    let top = stack_top.checked_sub(hhdm)? as u64;
    let bottom = top.checked_sub(STACK_SIZE)?;
    let page = FRAME_SIZE as u64;
    Some((bottom & !(page - 1), top.div_ceil(page) * page))
}

fn physical_region(low: u64, high: u64) -> MemoryRegion {
    MemoryRegion::new(PhysicalAddress::new(low as usize), (high - low) as usize)
}

/// Picks `bytes` (rounded to pages) at the top of the highest free range that holds
/// them above the first MiB without touching `avoid`.
fn bootstrap_heap_span(
    ranges: &[(u64, u64, RegionKind)],
    bytes: u64,
    avoid: Option<(u64, u64)>,
) -> Option<(u64, u64)> {
    let page = FRAME_SIZE as u64;
    let size = bytes.div_ceil(page) * page;
    let avoid = avoid.map(|(low, high)| physical_region(low, high));
    ranges
        .iter()
        .rev()
        .filter(|(_, _, kind)| *kind == RegionKind::Free)
        .find_map(|&(base, length, _)| {
            let high = base.saturating_add(length) & !(page - 1);
            let low = high.checked_sub(size)?;
            let clear = avoid.is_none_or(|stack| !stack.overlaps(&physical_region(low, high)));
            (low >= base.max(LOW_MEMORY_END) && clear).then_some((low, high))
        })
}

/// Turns `(base, length, kind)` ranges into an ordered record list closed by an end
/// marker. Holes between ranges become reserved records.
///
/// `carve_outs` are sorted, disjoint `(low, high, kind)` spans split out of whatever
/// ranges hold them and recorded with their own kind.
pub fn boot_records(
    ranges: impl IntoIterator<Item = (u64, u64, RegionKind)>,
    carve_outs: &[(u64, u64, RegionKind)],
) -> Vec<BootRecord> {
    let mut records = Vec::new();
    let mut end = 0;
    for (base, length, kind) in ranges {
        if length == 0 {
            continue;
        }
        let range_end = base.saturating_add(length);
        if base > end {
            records.push(BootRecord::new(end, RegionKind::Reserved));
        }
        let mut cursor = base;
        for &(low, high, carved) in carve_outs {
            if low >= range_end || high <= cursor {
                continue;
            }
            if low > cursor {
                records.push(BootRecord::new(cursor, kind));
            }
            records.push(BootRecord::new(low.max(cursor), carved));
            cursor = high.min(range_end);
        }
        if cursor < range_end {
            records.push(BootRecord::new(cursor, kind));
        }
        end = end.max(range_end);
    }
    records.push(BootRecord::new(end, RegionKind::End));
    records
}

/// Brings up the frame allocator, the heap pool and the kernel translation tree.
pub fn init(stack_top: usize) -> &'static VirtualMemoryManager<'static, Wide> {
    let Some(hhdm) = HIGHER_HALF_DIRECT_MAP.get_response() else {
        DESCRIPTOR.fatal(format_args!("higher-half direct map request unanswered"))
    };
    let hhdm = hhdm.offset() as usize;
    let Some(memmap) = MEMORY_MAP_REQUEST.get_response() else {
        DESCRIPTOR.fatal(format_args!("memory map request unanswered"))
    };

    let ranges: Vec<_> = memmap
        .entries()
        .iter()
        .map(|entry| (entry.base, entry.length, region_kind(entry.entry_type)))
        .collect();
    let stack = stack_frames(stack_top, hhdm);
    let bootstrap = claim_bootstrap_heap(&ranges, stack, hhdm);

    let mut carve_outs: Vec<_> = stack
        .map(|(low, high)| (low, high, RegionKind::KernelStack))
        .into_iter()
        .chain(bootstrap.map(|(low, high)| (low, high, RegionKind::BootReclaimable)))
        .collect();
    carve_outs.sort_unstable_by_key(|&(low, _, _)| low);
    let records = boot_records(ranges, &carve_outs);
    let map = match BootMap::new(&records) {
        Ok(map) => map,
        Err(err) => DESCRIPTOR.fatal(format_args!("bad boot memory map: {}", err)),
    };
    map.log();

    if !FRAMES.init(&map, &DESCRIPTOR) {
        DESCRIPTOR.fatal(format_args!("frame allocator initialized twice"));
    }
    claim_pool(hhdm);

    let vmm = VMM.call_once(|| {
        VirtualMemoryManager::new(
            &FRAMES,
            &DESCRIPTOR,
            AddressTranslator::hardware(hhdm),
            vmm_config(hhdm),
        )
    });
    if let Err(err) = vmm.init(&map, &DEVICE_WINDOWS) {
        DESCRIPTOR.fatal(format_args!("translation manager failed to start: {}", err));
    }
    vmm
}

fn vmm_config(hhdm: usize) -> VmmConfig {
    let config = VmmConfig::new().with_direct_map_offset(hhdm);
    let Some(executable) = EXECUTABLE_ADDRESS.get_response() else {
        log::warn!("executable address request unanswered, kernel image stays unmapped");
        return config;
    };
    let image = DESCRIPTOR.kernel_image().map(|region| region.base());
    if image != Some(PhysicalAddress::new(executable.physical_base() as usize)) {
        log::warn!(
            "kernel loaded at {:#x} but image region is {:?}",
            executable.physical_base(),
            image
        );
        return config;
    }
    config.with_kernel_image_base(VirtualAddress::new(executable.virtual_base() as usize))
}

/// Grows the heap to hold the frame bitmap of this machine and returns the claimed
/// span, which must be recorded as boot-reclaimable.
fn claim_bootstrap_heap(
    ranges: &[(u64, u64, RegionKind)],
    stack: Option<(u64, u64)>,
    hhdm: usize,
) -> Option<(u64, u64)> {
    let end = ranges
        .iter()
        .map(|&(base, length, _)| base.saturating_add(length))
        .max()?;
    let bytes = FrameAllocator::bitmap_bytes(PhysicalAddress::new(end as usize)) as u64
        + BOOTSTRAP_HEAP_SLACK;
    let Some((low, high)) = bootstrap_heap_span(ranges, bytes, stack) else {
        log::warn!("no usable range holds a {} bootstrap heap", HumanSize(bytes as usize));
        return None;
    };
    let region = physical_region(low, high);
    // SAFETY: the span is usable memory under the bootloader's direct map, and the caller
    // records it as boot-reclaimable so the frame allocator never hands it out.
    if unsafe { heap::claim((low as usize + hhdm) as *mut u8, region.size()) } {
        log::debug!("bootstrap heap at {}", region);
        Some((low, high))
    } else {
        log::warn!("heap could not claim bootstrap span {}", region);
        None
    }
}

fn claim_pool(hhdm: usize) {
    let Some(pool) = DESCRIPTOR.heap() else {
        log::warn!("no heap pool, running on the early arena only");
        return;
    };
    let base = (pool.base().as_usize() + hhdm) as *mut u8;
    // SAFETY: the pool frames were taken out of the frame allocator for good and the
    // bootloader's direct map covers them.
    if unsafe { heap::claim(base, pool.size()) } {
        log::debug!("heap extended by {} at {}", HumanSize(pool.size()), pool);
    } else {
        log::warn!("heap could not claim pool {}", pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holes_become_reserved() {
        let records = boot_records(
            [
                (0x1000, 0x9_F000, RegionKind::Free),
                (0x10_0000, 0x300_0000, RegionKind::Free),
            ],
            &[],
        );
        assert_eq!(
            records,
            [
                BootRecord::new(0, RegionKind::Reserved),
                BootRecord::new(0x1000, RegionKind::Free),
                BootRecord::new(0xA_0000, RegionKind::Reserved),
                BootRecord::new(0x10_0000, RegionKind::Free),
                BootRecord::new(0x310_0000, RegionKind::End),
            ]
        );
        assert!(BootMap::new(&records).is_ok());
    }

    #[test]
    fn stack_is_split_out() {
        let records = boot_records(
            [
                (0x0, 0x8_0000, RegionKind::Free),
                (0x8_0000, 0x8_0000, RegionKind::BootReclaimable),
            ],
            &[(0x9_0000, 0xA_0000, RegionKind::KernelStack)],
        );
        assert_eq!(
            records,
            [
                BootRecord::new(0x0, RegionKind::Free),
                BootRecord::new(0x8_0000, RegionKind::BootReclaimable),
                BootRecord::new(0x9_0000, RegionKind::KernelStack),
                BootRecord::new(0xA_0000, RegionKind::BootReclaimable),
                BootRecord::new(0x10_0000, RegionKind::End),
            ]
        );
    }

    #[test]
    fn stack_at_range_edges() {
        let records = boot_records(
            [(0x8_0000, 0x1_0000, RegionKind::BootReclaimable)],
            &[(0x8_0000, 0x9_0000, RegionKind::KernelStack)],
        );
        assert_eq!(
            records,
            [
                BootRecord::new(0x0, RegionKind::Reserved),
                BootRecord::new(0x8_0000, RegionKind::KernelStack),
                BootRecord::new(0x9_0000, RegionKind::End),
            ]
        );
    }

    #[test]
    fn several_carve_outs_in_one_range() {
        let records = boot_records(
            [(0x10_0000, 0x10_0000, RegionKind::Free)],
            &[
                (0x10_0000, 0x11_0000, RegionKind::KernelStack),
                (0x18_0000, 0x1A_0000, RegionKind::BootReclaimable),
            ],
        );
        assert_eq!(
            records,
            [
                BootRecord::new(0x0, RegionKind::Reserved),
                BootRecord::new(0x10_0000, RegionKind::KernelStack),
                BootRecord::new(0x11_0000, RegionKind::Free),
                BootRecord::new(0x18_0000, RegionKind::BootReclaimable),
                BootRecord::new(0x1A_0000, RegionKind::Free),
                BootRecord::new(0x20_0000, RegionKind::End),
            ]
        );
    }

    /// Low memory, 2 GiB of RAM and the firmware hole QEMU reports below 1 TiB.
    const LARGE_MAP: [(u64, u64, RegionKind); 3] = [
        (0x1000, 0x9_F000, RegionKind::Free),
        (0x10_0000, 0x7FEF_0000, RegionKind::Free),
        (0xFC_FD00_0000, 0x300_0000, RegionKind::Reserved),
    ];

    #[test]
    fn bootstrap_heap_holds_the_bitmap_of_a_large_map() {
        let bitmap = FrameAllocator::bitmap_bytes(PhysicalAddress::new(0xFD_0000_0000)) as u64;
        assert!(bitmap > 256 * 1024);

        let span = bootstrap_heap_span(&LARGE_MAP, bitmap + BOOTSTRAP_HEAP_SLACK, None);
        assert_eq!(span, Some((0x7E04_0000, 0x7FFF_0000)));

        let (low, high) = span.unwrap();
        let records = boot_records(LARGE_MAP, &[(low, high, RegionKind::BootReclaimable)]);
        let map = BootMap::new(&records).unwrap();
        let heap = map
            .regions()
            .find(|region| region.kind == RegionKind::BootReclaimable)
            .unwrap();
        assert_eq!(heap.size() as u64, bitmap + BOOTSTRAP_HEAP_SLACK);
        assert!(heap.is_mapped());
        assert_eq!(map.free_bytes() as u64, 0x9_F000 + 0x7FEF_0000 - (high - low));
    }

    #[test]
    fn bootstrap_heap_avoids_the_stack_and_low_memory() {
        assert_eq!(
            bootstrap_heap_span(&LARGE_MAP, 0x1_0000, Some((0x7FFE_0000, 0x7FFF_0000))),
            None
        );
        assert_eq!(
            bootstrap_heap_span(&LARGE_MAP[..1], 0x1000, None),
            None
        );
        assert_eq!(
            bootstrap_heap_span(&LARGE_MAP, 0x1000, Some((0x10_0000, 0x11_0000))),
            Some((0x7FFE_F000, 0x7FFF_0000))
        );
    }

    #[test]
    fn stack_frames_cover_partial_pages() {
        let hhdm = 0xFFFF_8000_0000_0000;
        assert_eq!(
            stack_frames(hhdm + 0x9_FFF8, hhdm),
            Some((0x8_F000, 0xA_0000))
        );
        assert_eq!(stack_frames(0x1000, hhdm), None);
    }

    #[test]
    fn limine_types_map_to_kinds() {
        assert_eq!(region_kind(EntryType::USABLE), RegionKind::Free);
        assert_eq!(region_kind(EntryType::FRAMEBUFFER), RegionKind::Device);
        assert_eq!(region_kind(EntryType::RESERVED), RegionKind::Reserved);
    }
}
