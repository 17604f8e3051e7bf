//! The early debug console that sends log records to the serial port.

use core::{
    fmt::Write,
    sync::atomic::{AtomicBool, Ordering},
};

use log::LevelFilter;
use mm::IrqSpinLock;
use spin::Once;

use crate::serial::SerialWriter;

pub struct Console {
    has_output: AtomicBool,
    /// Log records can come from interrupt handlers.
    serial: IrqSpinLock<Option<SerialWriter>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    pub fn init() -> &'static Self {
        let console = Self::default();
        console.install();
        console
    }

    pub fn default() -> &'static Self {
        DEFAULT.call_once(|| Console {
            has_output: AtomicBool::new(false),
            serial: IrqSpinLock::new(None),
        })
    }

    pub fn install(&'static self) {
        if log::set_logger(self).is_err() {
            return;
        }

        #[cfg(debug_assertions)]
        log::set_max_level(LevelFilter::Trace);

        #[cfg(not(debug_assertions))]
        log::set_max_level(LevelFilter::Info);
    }

    pub fn has_output(&self) -> bool {
        self.has_output.load(Ordering::SeqCst)
    }

    pub fn attach_serial(&self, serial: SerialWriter) {
        *self.serial.lock() = Some(serial);
        self.has_output.store(true, Ordering::SeqCst);
    }

    /// Writes a line straight to the attached outputs, bypassing the logger.
    pub fn emergency_write(&self, args: core::fmt::Arguments<'_>) {
        // the panicking path may have interrupted a holder of the lock
        if let Some(mut serial) = self.serial.try_lock()
            && let Some(serial) = serial.as_mut()
        {
            let _ = writeln!(serial, "{}", args);
        }
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Some(serial) = &mut *self.serial.lock() {
            let _ = write_log_entry_to(serial, record);
        }
    }

    fn flush(&self) {}
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
