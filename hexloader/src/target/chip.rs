//! Chip/target abstraction for supporting multiple AVR parts.
//!
//! This module provides the per-chip data (signature, programming parameter
//! block, baud rates) and a trait-based programmer abstraction so the CLI
//! can drive any supported part through a common API.

use crate::error::Result;
use crate::image::FirmwareImage;
use crate::protocol::stk500::{DeviceParams, MemoryKind, Signature};
use std::fmt;
use std::time::Duration;

/// Supported chip families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChipFamily {
    /// ATmega328P (Uno-class boards).
    #[default]
    Atmega328p,
    /// ATmega168 (older Uno/Nano-class boards).
    Atmega168,
    /// ATmega8 (legacy boards).
    Atmega8,
    /// ATmega2560 (Mega-class boards).
    Atmega2560,
    /// ATmega32U4 (Leonardo-class boards).
    Atmega32u4,
}

impl ChipFamily {
    /// Expected device signature for this part.
    #[must_use]
    pub fn signature(&self) -> Signature {
        match self {
            Self::Atmega328p => Signature([0x1E, 0x95, 0x0F]),
            Self::Atmega168 => Signature([0x1E, 0x94, 0x06]),
            Self::Atmega8 => Signature([0x1E, 0x93, 0x07]),
            Self::Atmega2560 => Signature([0x1E, 0x98, 0x01]),
            Self::Atmega32u4 => Signature([0x1E, 0x95, 0x87]),
        }
    }

    /// Device parameter block for this part.
    #[must_use]
    pub fn device_params(&self) -> DeviceParams {
        match self {
            Self::Atmega328p => DeviceParams::new(128, 1024, 32768).with_device_code(0x86),
            Self::Atmega168 => DeviceParams::new(128, 512, 16384).with_device_code(0x86),
            Self::Atmega8 => DeviceParams::new(64, 512, 8192).with_device_code(0x76),
            Self::Atmega2560 => DeviceParams::new(256, 4096, 262144).with_device_code(0xB2),
            Self::Atmega32u4 => DeviceParams::new(128, 1024, 32768).with_device_code(0x44),
        }
    }

    /// Get default baud rate for this chip family's stock bootloader.
    #[must_use]
    pub fn default_baud(&self) -> u32 {
        match self {
            Self::Atmega8 => 19200,
            Self::Atmega168 => 57600,
            _ => 115200,
        }
    }

    /// Get baud rates commonly used by bootloaders on this chip family.
    #[must_use]
    pub fn supported_bauds(&self) -> &'static [u32] {
        match self {
            Self::Atmega8 => &[9600, 19200],
            Self::Atmega168 => &[19200, 57600, 115200],
            _ => &[57600, 115200],
        }
    }

    /// Get the chip family from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "atmega328p" | "m328p" | "328p" => Some(Self::Atmega328p),
            "atmega168" | "m168" | "168" => Some(Self::Atmega168),
            "atmega8" | "m8" => Some(Self::Atmega8),
            "atmega2560" | "m2560" | "2560" => Some(Self::Atmega2560),
            "atmega32u4" | "m32u4" | "32u4" => Some(Self::Atmega32u4),
            _ => None,
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atmega328p => write!(f, "ATmega328P"),
            Self::Atmega168 => write!(f, "ATmega168"),
            Self::Atmega8 => write!(f, "ATmega8"),
            Self::Atmega2560 => write!(f, "ATmega2560"),
            Self::Atmega32u4 => write!(f, "ATmega32U4"),
        }
    }
}

/// Chip programming configuration.
#[derive(Debug, Clone)]
pub struct ChipConfig {
    /// Chip family.
    pub family: ChipFamily,
    /// Baud rate for the bootloader connection.
    pub baud: u32,
    /// Time budget for one command's complete response.
    pub command_timeout: Duration,
    /// Number of reset-and-sync attempts while connecting.
    pub sync_attempts: usize,
    /// Pulse DTR/RTS to reset the board into its bootloader.
    pub auto_reset: bool,
}

impl ChipConfig {
    /// Create a new chip configuration for the given family.
    pub fn new(family: ChipFamily) -> Self {
        Self {
            family,
            baud: family.default_baud(),
            command_timeout: Duration::from_secs(1),
            sync_attempts: 5,
            auto_reset: true,
        }
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Set the per-command response time budget.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Enable or disable the auto-reset pulse.
    #[must_use]
    pub fn with_auto_reset(mut self, auto_reset: bool) -> Self {
        self.auto_reset = auto_reset;
        self
    }
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self::new(ChipFamily::default())
    }
}

/// Trait for programming operations across all chip families.
///
/// This trait provides a unified interface for device programming,
/// allowing the CLI to work with any chip family through a common API.
pub trait Programmer {
    /// Connect to the bootloader: reset the board if configured and
    /// establish protocol synchronization.
    fn connect(&mut self) -> Result<()>;

    /// Read the device signature and compare it against the configured
    /// chip's expected identifier.
    fn check_signature(&mut self) -> Result<Signature>;

    /// Read the device signature without checking it.
    fn read_signature(&mut self) -> Result<Signature>;

    /// Program a firmware image into the given memory.
    ///
    /// # Arguments
    ///
    /// * `image` - The firmware image to write
    /// * `memory` - Target memory space
    /// * `verify` - Read every page back and compare after writing
    /// * `progress` - Progress callback (pages_done, pages_total)
    fn program(
        &mut self,
        image: &FirmwareImage,
        memory: MemoryKind,
        verify: bool,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()>;

    /// Read a memory range back from the device.
    fn read_memory(&mut self, memory: MemoryKind, address: u32, length: u32) -> Result<Vec<u8>>;

    /// Close the programmer and release the underlying port.
    ///
    /// It is safe to call even if the connection is not active. After
    /// calling this method, the programmer cannot be used.
    fn close(&mut self);
}

impl ChipFamily {
    /// Create a programmer instance for this chip family (native platforms).
    ///
    /// This is the main entry point for creating chip-specific programmers.
    ///
    /// # Arguments
    ///
    /// * `port_name` - Serial port name (e.g., "/dev/ttyUSB0")
    /// * `baud` - Baud rate for the bootloader connection
    ///
    /// # Returns
    ///
    /// A boxed programmer instance implementing the `Programmer` trait
    #[cfg(feature = "native")]
    pub fn create_programmer(&self, port_name: &str, baud: u32) -> Result<Box<dyn Programmer>> {
        let config = ChipConfig::new(*self).with_baud(baud);
        let programmer = super::avr::Stk500Programmer::open(port_name, config)?;
        Ok(Box::new(programmer))
    }

    /// Create a programmer with an existing port (generic, works for any
    /// `Port` type). This is useful for testing or custom transports.
    pub fn create_programmer_with_port<P: crate::port::Port + 'static>(
        &self,
        port: P,
        baud: u32,
    ) -> Result<Box<dyn Programmer>> {
        let config = ChipConfig::new(*self).with_baud(baud);
        Ok(Box::new(super::avr::Stk500Programmer::new(port, config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_family_from_name() {
        assert_eq!(
            ChipFamily::from_name("atmega328p"),
            Some(ChipFamily::Atmega328p)
        );
        assert_eq!(ChipFamily::from_name("M2560"), Some(ChipFamily::Atmega2560));
        assert_eq!(ChipFamily::from_name("unknown"), None);
    }

    #[test]
    fn test_chip_signatures() {
        assert_eq!(
            ChipFamily::Atmega328p.signature(),
            Signature([0x1E, 0x95, 0x0F])
        );
        assert_eq!(
            ChipFamily::Atmega2560.signature(),
            Signature([0x1E, 0x98, 0x01])
        );
    }

    #[test]
    fn test_chip_device_params_geometry() {
        let params = ChipFamily::Atmega328p.device_params();
        assert_eq!(params.page_size, 128);
        assert_eq!(params.eeprom_size, 1024);
        assert_eq!(params.flash_size, 32768);

        let params = ChipFamily::Atmega2560.device_params();
        assert_eq!(params.page_size, 256);
        assert_eq!(params.flash_size, 262144);
    }

    #[test]
    fn test_chip_config_defaults() {
        let config = ChipConfig::new(ChipFamily::Atmega328p);
        assert_eq!(config.baud, 115200);
        assert_eq!(config.sync_attempts, 5);
        assert!(config.auto_reset);

        let config = ChipConfig::new(ChipFamily::Atmega8);
        assert_eq!(config.baud, 19200);
    }
}
