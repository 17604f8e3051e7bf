//! The kernel descriptor block.
//!
//! A populate-once table shared between the memory subsystem and the rest of the
//! kernel. The memory subsystem publishes where the kernel image, the boot stack, the
//! heap pool and the enabled device windows live; the kernel supplies the panic
//! callback used for boot-contract violations.

use alloc::vec::Vec;
use core::fmt;

use spin::Once;

use crate::{DeviceWindow, MemoryRegion};

/// Callback invoked on unrecoverable contract violations.
pub type PanicHandler = fn(fmt::Arguments<'_>) -> !;

pub struct KernelDescriptor {
    panic: PanicHandler,
    kernel_image: Once<MemoryRegion>,
    kernel_stack: Once<MemoryRegion>,
    heap: Once<MemoryRegion>,
    device_windows: Once<Vec<DeviceWindow>>,
}

impl KernelDescriptor {
    /// Creates an empty descriptor. Usable in a `static`.
    pub const fn new(panic: PanicHandler) -> Self {
        Self {
            panic,
            kernel_image: Once::new(),
            kernel_stack: Once::new(),
            heap: Once::new(),
            device_windows: Once::new(),
        }
    }

    /// Reports a contract violation through the registered callback.
    #[cold]
    pub fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        (self.panic)(args)
    }

    /// Publishes the kernel image region. Only the first call has any effect; returns
    /// whether this call published.
    pub fn publish_kernel_image(&self, region: MemoryRegion) -> bool {
        publish(&self.kernel_image, region)
    }

    pub fn kernel_image(&self) -> Option<MemoryRegion> {
        self.kernel_image.get().copied()
    }

    /// Publishes the boot stack region. Only the first call has any effect.
    pub fn publish_kernel_stack(&self, region: MemoryRegion) -> bool {
        publish(&self.kernel_stack, region)
    }

    pub fn kernel_stack(&self) -> Option<MemoryRegion> {
        self.kernel_stack.get().copied()
    }

    /// Publishes the heap pool region. Only the first call has any effect.
    pub fn publish_heap(&self, region: MemoryRegion) -> bool {
        publish(&self.heap, region)
    }

    pub fn heap(&self) -> Option<MemoryRegion> {
        self.heap.get().copied()
    }

    /// Publishes the device windows enabled at memory manager init.
    pub fn publish_device_windows(&self, windows: &[DeviceWindow]) -> bool {
        let mut published = false;
        self.device_windows.call_once(|| {
            published = true;
            windows.to_vec()
        });
        published
    }

    /// The published device windows; empty until published.
    pub fn device_windows(&self) -> &[DeviceWindow] {
        self.device_windows.get().map_or(&[], Vec::as_slice)
    }
}

fn publish<T>(slot: &Once<T>, value: T) -> bool {
    let mut published = false;
    slot.call_once(|| {
        published = true;
        value
    });
    published
}

impl fmt::Debug for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDescriptor")
            .field("kernel_image", &self.kernel_image())
            .field("kernel_stack", &self.kernel_stack())
            .field("heap", &self.heap())
            .field("device_windows", &self.device_windows())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_panic(args: fmt::Arguments<'_>) -> ! {
    panic!("{}", args)
}
