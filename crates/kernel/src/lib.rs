// cSpell:ignore kmain

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod arch;
mod console;
mod mem;
mod serial;

use limine::BaseRevision;
use mm::{FRAME_SIZE, VirtualAddress, VirtualMemoryManager, VmError, Wide};

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(4);

/// Where the boot self-check maps its scratch page in a task address space.
const SCRATCH_USER_PAGE: VirtualAddress = VirtualAddress::new(0x40_0000);

pub fn kernel_main(stack_top: usize) -> ! {
    let console = console::Console::init();
    serial::init(console);

    if !BASE_REVISION.is_supported() {
        mem::DESCRIPTOR.fatal(format_args!("Limine base revision 4 is not supported"));
    }

    let vmm = mem::init(stack_top);
    match exercise_task_space(vmm) {
        Ok(()) => log::debug!("task address space round trip passed"),
        Err(err) => log::error!("task address space round trip failed: {}", err),
    }

    log::info!(
        "boot complete: {} of {} frames in use, {} table pages",
        mem::FRAMES.used_pages(),
        mem::FRAMES.total_pages(),
        vmm.table_pages()
    );
    arch::park()
}

/// Creates a task address space, maps one page into it, and tears it down again.
fn exercise_task_space(vmm: &VirtualMemoryManager<'_, Wide>) -> Result<(), VmError> {
    let kernel = vmm.kernel_space().ok_or(VmError::NotInitialized)?;
    let space = vmm.create_address_space()?;
    let frame = mem::FRAMES.allocate_page()?;

    vmm.switch_to(space)?;
    let mapped = vmm.map_user(space, SCRATCH_USER_PAGE, frame, FRAME_SIZE);
    let resolved = vmm.translate(space, SCRATCH_USER_PAGE);
    vmm.switch_to(kernel)?;

    mapped?;
    if resolved != Some(frame) {
        log::warn!("scratch page resolved to {:?}, expected {}", resolved, frame);
    }
    vmm.delete_address_space(space)?;
    mem::FRAMES.free_page(frame);
    Ok(())
}

pub fn handle_panic(info: &core::panic::PanicInfo) -> ! {
    let console = console::Console::default();
    if console.has_output() {
        console.emergency_write(format_args!("kernel panic: {}", info));
    }
    arch::park()
}
