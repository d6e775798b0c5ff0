//! # hexloader
//!
//! A library for turning firmware binaries into Intel HEX images and for
//! programming STK500-compatible serial bootloaders.
//!
//! This crate provides the two halves of a firmware loading pipeline:
//!
//! - Intel HEX generation from a flat binary image, including extended
//!   linear addressing and page-aware zero-run elision
//! - An STK500v1 protocol engine that drives set-device / enter-mode /
//!   load-address / program-page / verify / leave-mode sequences over a
//!   serial byte stream
//!
//! ## Supported Platforms
//!
//! - Linux, macOS, Windows via the `serialport` crate (`native` feature,
//!   enabled by default)
//!
//! ## Example
//!
//! ```rust,no_run
//! use hexloader::{ChipFamily, FirmwareImage, MemoryKind};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.bin", 0)?;
//!
//!     let chip = ChipFamily::Atmega328p;
//!     let mut programmer = chip.create_programmer("/dev/ttyUSB0", 115200)?;
//!     programmer.connect()?;
//!     programmer.check_signature()?;
//!     programmer.program(&image, MemoryKind::Flash, true, &mut |page, total| {
//!         println!("Page {page}/{total}");
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use target::{ChipConfig, ChipFamily, Programmer};
pub use {
    device::{DetectedPort, DeviceKind, TransportKind},
    error::{Error, Result},
    host::{auto_detect_port, discover_avr_ports, discover_ports},
    image::{
        FirmwareImage,
        ihex::{EncodeOptions, HexRecord, RecordType, encode, encode_records},
    },
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{
        session::{FailureReason, Phase, ProgrammingSession, SessionConfig},
        stk500::{Command, DeviceParams, MemoryKind, Signature},
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupt_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        test_set_interrupted(true);
        assert!(is_interrupt_requested());

        test_set_interrupted(false);
        assert!(!is_interrupt_requested());
    }
}
