use x86_64::instructions::{hlt, interrupts};

/// The architecture-specific entry point
///
/// Captures the boot stack pointer and calls the main kernel entry point.
#[unsafe(no_mangle)]
pub extern "C" fn kenter() -> ! {
    let stack_top = unsafe {
        // SAFETY: the bootloader sets up the stack pointer before transferring control
        // to the kernel entry point.
        let rsp: u64;
        core::arch::asm!("mov {}, rsp", out(reg) rsp);
        rsp as usize
    };
    crate::kernel_main(stack_top)
}

/// Stops this CPU for good.
pub fn park() -> ! {
    interrupts::disable();
    loop {
        hlt();
    }
}
