//! STK500 programmer implementation.
//!
//! This module provides the main programming interface for AVR serial
//! bootloaders.
//!
//! ## Generic Port Support
//!
//! The programmer uses a generic `Port` trait, allowing it to work with
//! different serial port implementations:
//!
//! - **Native platforms**: Uses the `serialport` crate via `NativePort`
//! - **Custom transports**: Anything implementing `Port`
//!
//! ## Example
//!
//! ```rust,no_run
//! use hexloader::{ChipFamily, FirmwareImage, MemoryKind};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut programmer = ChipFamily::Atmega328p.create_programmer("/dev/ttyUSB0", 115200)?;
//!
//!     programmer.connect()?;
//!     programmer.check_signature()?;
//!
//!     let image = FirmwareImage::from_file("firmware.bin", 0)?;
//!     programmer.program(&image, MemoryKind::Flash, true, &mut |done, total| {
//!         println!("Page {done}/{total}");
//!     })?;
//!
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::port::Port;
use crate::protocol::session::{
    ProgrammingSession, SessionConfig, flash_plan, read_plan, signature_plan, sync_plan,
};
use crate::protocol::stk500::{MemoryKind, Signature};
use crate::target::chip::{ChipConfig, Programmer};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::Duration;

/// Duration the reset line is held asserted.
const RESET_PULSE: Duration = Duration::from_millis(100);

/// Delay after releasing reset, giving the bootloader time to start.
const BOOTLOADER_SETTLE: Duration = Duration::from_millis(300);

/// Delay between synchronization attempts.
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Shorter per-command budget used only for GetSync probes.
const SYNC_TIMEOUT: Duration = Duration::from_millis(400);

/// STK500 programmer.
///
/// Generic over the port type `P`, which must implement the `Port` trait.
/// Each operation builds a fresh command sequence and runs it in its own
/// single-use session.
pub struct Stk500Programmer<P: Port> {
    port: P,
    config: ChipConfig,
}

impl<P: Port> Stk500Programmer<P> {
    /// Create a new programmer with an existing port.
    ///
    /// # Arguments
    ///
    /// * `port` - An opened port implementing the `Port` trait
    /// * `config` - Chip and connection configuration
    pub fn new(port: P, config: ChipConfig) -> Self {
        Self { port, config }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the programmer and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::default().with_command_timeout(self.config.command_timeout)
    }

    /// Pulse the auto-reset line to restart the board into its bootloader.
    fn pulse_reset(&mut self) -> Result<()> {
        trace!("Pulsing DTR/RTS to reset the board");
        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;
        thread::sleep(RESET_PULSE);
        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;
        thread::sleep(BOOTLOADER_SETTLE);
        Ok(())
    }

    /// Connect to the bootloader.
    ///
    /// Resets the board (when auto-reset is enabled) and probes with
    /// GetSync until the bootloader answers, with a retry mechanism.
    pub fn connect(&mut self) -> Result<()> {
        info!(
            "Connecting to {} bootloader on {}...",
            self.config.family,
            self.port.name()
        );

        let mut last_error = None;

        for attempt in 1..=self.config.sync_attempts {
            if crate::is_interrupt_requested() {
                return Err(Error::Stopped);
            }
            if attempt > 1 {
                debug!(
                    "Synchronization attempt {attempt}/{}",
                    self.config.sync_attempts
                );
                thread::sleep(SYNC_RETRY_DELAY);
            }

            if self.config.auto_reset && attempt == 1 {
                self.pulse_reset()?;
            }
            self.port.clear_buffers()?;

            let sync_config = SessionConfig::default().with_command_timeout(SYNC_TIMEOUT);
            let mut session =
                ProgrammingSession::with_config(&mut self.port, sync_plan(), sync_config);
            match session.run(|_, _| {}) {
                Ok(()) => {
                    info!("Bootloader in sync");
                    return Ok(());
                },
                Err(e @ Error::Stopped) => return Err(e),
                Err(e) => {
                    warn!(
                        "Sync failed (attempt {attempt}/{}): {e}",
                        self.config.sync_attempts
                    );
                    last_error = Some(e);
                },
            }
        }

        Err(last_error.unwrap_or(Error::DeviceNotFound))
    }

    /// Read the device signature without checking it.
    pub fn read_signature(&mut self) -> Result<Signature> {
        let config = self.session_config();
        let mut session =
            ProgrammingSession::with_config(&mut self.port, signature_plan(None), config);
        session.run(|_, _| {})?;
        session
            .signature()
            .ok_or_else(|| Error::Unsupported("device reported no signature".into()))
    }

    /// Read the device signature and fail if it does not match the
    /// configured chip.
    pub fn check_signature(&mut self) -> Result<Signature> {
        let expected = self.config.family.signature();
        let config = self.session_config();
        let mut session =
            ProgrammingSession::with_config(&mut self.port, signature_plan(Some(expected)), config);
        session.run(|_, _| {})?;
        debug!("Signature check passed ({expected})");
        Ok(expected)
    }

    /// Program a firmware image into the given memory.
    pub fn program<F>(
        &mut self,
        image: &FirmwareImage,
        memory: MemoryKind,
        verify: bool,
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let params = self.config.family.device_params();
        let plan = flash_plan(image, &params, memory, verify)?;
        debug!(
            "Programming {} bytes of {memory} at {:#010X} ({} commands, verify: {verify})",
            image.len(),
            image.origin(),
            plan.len()
        );

        let config = self.session_config();
        let mut session = ProgrammingSession::with_config(&mut self.port, plan, config);
        session.run(&mut progress)?;

        info!(
            "Programmed {} pages of {memory}",
            session.pages_done()
        );
        Ok(())
    }

    /// Read a memory range back from the device.
    pub fn read_memory(&mut self, memory: MemoryKind, address: u32, length: u32) -> Result<Vec<u8>> {
        let params = self.config.family.device_params();
        let plan = read_plan(&params, memory, address, length)?;
        debug!("Reading {length} bytes of {memory} from {address:#010X}");

        let config = self.session_config();
        let mut session = ProgrammingSession::with_config(&mut self.port, plan, config);
        session.run(|_, _| {})?;
        Ok(session.data_read().to_vec())
    }

    /// Close the programmer and release the port.
    pub fn close(&mut self) {
        if let Err(e) = self.port.close() {
            warn!("Failed to close port: {e}");
        }
    }
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{ChipConfig, Duration, Error, Result, Stk500Programmer, debug, thread, warn};
    use crate::port::{NativePort, SerialConfig};

    impl Stk500Programmer<NativePort> {
        /// Create a new programmer by opening a serial port.
        ///
        /// This is a convenience function for native platforms that opens
        /// the port with default settings and a short read timeout suited
        /// to the session pump.
        pub fn open(port_name: &str, config: ChipConfig) -> Result<Self> {
            Self::open_with_retry(port_name, config)
        }

        /// Open the serial port with a retry mechanism.
        fn open_with_retry(port_name: &str, config: ChipConfig) -> Result<Self> {
            const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
            const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

            let mut last_error = None;

            for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
                let serial_config = SerialConfig::new(port_name, config.baud)
                    .with_timeout(Duration::from_millis(50));
                match NativePort::open(&serial_config) {
                    Ok(port) => {
                        if attempt > 1 {
                            debug!("Port opened on attempt {attempt}");
                        }
                        return Ok(Self::new(port, config));
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open port {port_name} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}"
                        );
                        last_error = Some(e);

                        if attempt < MAX_OPEN_PORT_ATTEMPTS {
                            thread::sleep(OPEN_RETRY_DELAY);
                        }
                    },
                }
            }

            Err(last_error.unwrap_or(Error::DeviceNotFound))
        }
    }
}

impl<P: Port> Programmer for Stk500Programmer<P> {
    fn connect(&mut self) -> Result<()> {
        self.connect()
    }

    fn check_signature(&mut self) -> Result<Signature> {
        self.check_signature()
    }

    fn read_signature(&mut self) -> Result<Signature> {
        self.read_signature()
    }

    fn program(
        &mut self,
        image: &FirmwareImage,
        memory: MemoryKind,
        verify: bool,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        self.program(image, memory, verify, |done, total| progress(done, total))
    }

    fn read_memory(&mut self, memory: MemoryKind, address: u32, length: u32) -> Result<Vec<u8>> {
        self.read_memory(memory, address, length)
    }

    fn close(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    // The protocol engine is exercised end-to-end against a mock bootloader
    // in protocol::session; programming against real hardware is covered by
    // manual integration testing.
}
