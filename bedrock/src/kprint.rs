//! Debug print utilities.
//!
//! The hypervisor core has no device of its own to write to; the loadable
//! wrapper owns the debug channel (serial port, kernel log, whatever the OS
//! offers) and registers it here as a sink before bring-up. Until a sink is
//! registered every print is dropped.

use core::fmt::Write;
use spin_lock::SpinLock;

/// A registered line sink. Must be callable at the elevated priority the
/// hypervisor runs at.
pub type Sink = fn(&str);

static SINK: SpinLock<Option<Sink>> = SpinLock::new(None);

/// Register the byte sink used by the print macros.
pub fn set_sink(sink: Sink) {
    *SINK.lock() = Some(sink);
}

struct SinkWriter(Sink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let sink = *SINK.lock();
    if let Some(sink) = sink {
        let _ = write!(SinkWriter(sink), "{}", fmt);
    }
}

/// Prints out the message through the registered sink.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[INFO] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[WARNING] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static WRITTEN: AtomicUsize = AtomicUsize::new(0);

    fn counting_sink(s: &str) {
        WRITTEN.fetch_add(s.len(), Ordering::SeqCst);
    }

    #[test]
    fn prints_reach_registered_sink() {
        _print(format_args!("dropped before registration"));
        set_sink(counting_sink);
        _print(format_args!("12345"));
        assert!(WRITTEN.load(Ordering::SeqCst) >= 5);
    }
}
