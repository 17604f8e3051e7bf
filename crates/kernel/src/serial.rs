use core::fmt::Write;

use crate::console::Console;

/// COM1.
const PORT: u16 = 0x3F8;

pub struct SerialWriter {
    port: uart_16550::SerialPort,
}

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.port.write_str(s)
    }
}

// cSpell:ignore uart
pub fn init(console: &Console) {
    // SAFETY: COM1 is a standard port that nothing else in the kernel drives.
    let mut port = unsafe { uart_16550::SerialPort::new(PORT) };
    port.init();
    console.attach_serial(SerialWriter { port });
}
