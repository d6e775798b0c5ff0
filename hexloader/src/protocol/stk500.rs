//! STK500v1 protocol commands and structures.
//!
//! This module implements the host side of the STK500v1 serial protocol as
//! spoken by AVR serial bootloaders (optiboot and friends). It covers the
//! command subset needed to configure a device, enter programming mode,
//! write and read pages, and read the device signature.
//!
//! ## Frame Format
//!
//! Commands are a command byte, optional operands, and a terminating sync
//! byte:
//!
//! ```text
//! +---------+--------------+---------+
//! | Command |   Operands   | CRC_EOP |
//! +---------+--------------+---------+
//! | 1 byte  |   variable   |  0x20   |
//! +---------+--------------+---------+
//! ```
//!
//! Responses are framed by two marker bytes:
//!
//! ```text
//! +------------+----------------+--------+
//! | STK_INSYNC |  payload bytes | STK_OK |
//! +------------+----------------+--------+
//! |    0x14    |    variable    |  0x10  |
//! +------------+----------------+--------+
//! ```
//!
//! The payload length is fixed per command (empty for most, the page
//! contents for `ReadPage`, three bytes for `ReadSignature`), so a complete
//! response is recognized purely by byte count plus marker validation.

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::fmt;

/// Response marker: command understood, response follows (0x14).
pub const STK_INSYNC: u8 = 0x14;

/// Response marker: command completed (0x10).
pub const STK_OK: u8 = 0x10;

/// Response marker: command failed (0x11).
pub const STK_FAILED: u8 = 0x11;

/// Response marker: device lost synchronization (0x15).
pub const STK_NOSYNC: u8 = 0x15;

/// Command terminator expected by the bootloader (0x20).
pub const CRC_EOP: u8 = 0x20;

/// Command code: establish synchronization (0x30).
pub const STK_GET_SYNC: u8 = 0x30;

/// Command code: set device programming parameters (0x42).
pub const STK_SET_DEVICE: u8 = 0x42;

/// Command code: enter programming mode (0x50).
pub const STK_ENTER_PROGMODE: u8 = 0x50;

/// Command code: leave programming mode (0x51).
pub const STK_LEAVE_PROGMODE: u8 = 0x51;

/// Command code: load the address for the next page operation (0x55).
pub const STK_LOAD_ADDRESS: u8 = 0x55;

/// Command code: program one page (0x64).
pub const STK_PROG_PAGE: u8 = 0x64;

/// Command code: read one page (0x74).
pub const STK_READ_PAGE: u8 = 0x74;

/// Command code: read the device signature (0x75).
pub const STK_READ_SIGN: u8 = 0x75;

/// Memory space addressed by page operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Flash program memory.
    Flash,
    /// EEPROM data memory.
    Eeprom,
}

impl MemoryKind {
    /// Wire value used in page commands ('F' or 'E').
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Flash => b'F',
            Self::Eeprom => b'E',
        }
    }

    /// Address granularity for `LoadAddress`: flash is word addressed,
    /// EEPROM is byte addressed.
    pub fn address_unit(self) -> u32 {
        match self {
            Self::Flash => 2,
            Self::Eeprom => 1,
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash => write!(f, "flash"),
            Self::Eeprom => write!(f, "eeprom"),
        }
    }
}

/// Three-byte device signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 3]);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

/// Device programming parameter block for `SetDevice`.
///
/// This is the 20-byte operand of STK_SET_DEVICE. The engine treats it as
/// caller-supplied data; chip presets live in [`crate::target::chip`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceParams {
    /// STK500 device code.
    pub device_code: u8,
    /// Device revision.
    pub revision: u8,
    /// Programming type (0 = both parallel and serial).
    pub prog_type: u8,
    /// Parallel mode width flag.
    pub par_mode: u8,
    /// Polling supported flag.
    pub polling: u8,
    /// Self-timed programming flag.
    pub self_timed: u8,
    /// Number of lock bytes.
    pub lock_bytes: u8,
    /// Number of fuse bytes.
    pub fuse_bytes: u8,
    /// Flash polling value (repeated on the wire).
    pub flash_poll_val: u8,
    /// EEPROM polling value 1.
    pub eeprom_poll_val1: u8,
    /// EEPROM polling value 2.
    pub eeprom_poll_val2: u8,
    /// Flash page size in bytes.
    pub page_size: u16,
    /// EEPROM size in bytes.
    pub eeprom_size: u16,
    /// Flash size in bytes.
    pub flash_size: u32,
}

impl DeviceParams {
    /// Create a parameter block with conventional defaults for serial
    /// bootloaders; only the memory geometry varies between parts.
    pub fn new(page_size: u16, eeprom_size: u16, flash_size: u32) -> Self {
        Self {
            device_code: 0x86,
            revision: 0,
            prog_type: 0,
            par_mode: 1,
            polling: 1,
            self_timed: 1,
            lock_bytes: 1,
            fuse_bytes: 3,
            flash_poll_val: 0xFF,
            eeprom_poll_val1: 0xFF,
            eeprom_poll_val2: 0xFF,
            page_size,
            eeprom_size,
            flash_size,
        }
    }

    /// Set the STK500 device code.
    #[must_use]
    pub fn with_device_code(mut self, code: u8) -> Self {
        self.device_code = code;
        self
    }

    /// Wire image of the parameter block (20 bytes, sizes big-endian).
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        buf.push(self.device_code);
        buf.push(self.revision);
        buf.push(self.prog_type);
        buf.push(self.par_mode);
        buf.push(self.polling);
        buf.push(self.self_timed);
        buf.push(self.lock_bytes);
        buf.push(self.fuse_bytes);
        buf.push(self.flash_poll_val);
        buf.push(self.flash_poll_val);
        buf.push(self.eeprom_poll_val1);
        buf.push(self.eeprom_poll_val2);
        buf.write_u16::<BigEndian>(self.page_size).unwrap();
        buf.write_u16::<BigEndian>(self.eeprom_size).unwrap();
        buf.write_u32::<BigEndian>(self.flash_size).unwrap();
        buf
    }
}

/// One programming command: the bytes to transmit plus the exact shape of
/// the expected response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Establish synchronization after reset.
    GetSync,
    /// Send the device parameter block.
    SetDevice(DeviceParams),
    /// Enter programming mode.
    EnterProgMode,
    /// Load the address for the next page operation. Word address for
    /// flash, byte address for EEPROM.
    LoadAddress(u16),
    /// Program one page of the given memory.
    ProgPage {
        /// Target memory space.
        memory: MemoryKind,
        /// Page contents.
        data: Vec<u8>,
        /// Read the page back and compare after programming.
        verify: bool,
    },
    /// Read one page of the given memory.
    ReadPage {
        /// Source memory space.
        memory: MemoryKind,
        /// Number of bytes to read.
        length: u16,
    },
    /// Leave programming mode.
    LeaveProgMode,
    /// Read the device signature, optionally checking it against an
    /// expected identifier.
    ReadSignature {
        /// Signature the caller expects, if any.
        expected: Option<Signature>,
    },
}

impl Command {
    /// Command name for logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetSync => "GetSync",
            Self::SetDevice(_) => "SetDevice",
            Self::EnterProgMode => "EnterProgMode",
            Self::LoadAddress(_) => "LoadAddress",
            Self::ProgPage { .. } => "ProgPage",
            Self::ReadPage { .. } => "ReadPage",
            Self::LeaveProgMode => "LeaveProgMode",
            Self::ReadSignature { .. } => "ReadSignature",
        }
    }

    /// Build the complete transmit frame, CRC_EOP included.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::GetSync => buf.push(STK_GET_SYNC),
            Self::SetDevice(params) => {
                buf.push(STK_SET_DEVICE);
                buf.extend_from_slice(&params.to_bytes());
            },
            Self::EnterProgMode => buf.push(STK_ENTER_PROGMODE),
            Self::LoadAddress(address) => {
                buf.push(STK_LOAD_ADDRESS);
                buf.write_u16::<LittleEndian>(*address).unwrap();
            },
            Self::ProgPage {
                memory,
                data,
                verify: _,
            } => {
                buf.push(STK_PROG_PAGE);
                // Page length is sent big-endian, unlike the load address.
                buf.write_u16::<BigEndian>(data.len() as u16).unwrap();
                buf.push(memory.as_u8());
                buf.extend_from_slice(data);
            },
            Self::ReadPage { memory, length } => {
                buf.push(STK_READ_PAGE);
                buf.write_u16::<BigEndian>(*length).unwrap();
                buf.push(memory.as_u8());
            },
            Self::LeaveProgMode => buf.push(STK_LEAVE_PROGMODE),
            Self::ReadSignature { .. } => buf.push(STK_READ_SIGN),
        }
        buf.push(CRC_EOP);
        buf
    }

    /// Exact length of a complete response, markers included.
    pub fn response_len(&self) -> usize {
        match self {
            Self::ReadPage { length, .. } => 2 + *length as usize,
            Self::ReadSignature { .. } => 2 + 3,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_sync_frame() {
        assert_eq!(Command::GetSync.to_bytes(), vec![STK_GET_SYNC, CRC_EOP]);
    }

    #[test]
    fn test_set_device_frame_length() {
        let params = DeviceParams::new(128, 1024, 32768);
        let frame = Command::SetDevice(params).to_bytes();
        // Command + 20 parameter bytes + CRC_EOP
        assert_eq!(frame.len(), 22);
        assert_eq!(frame[0], STK_SET_DEVICE);
        assert_eq!(frame[21], CRC_EOP);
    }

    #[test]
    fn test_device_params_wire_layout() {
        let params = DeviceParams::new(0x0080, 0x0400, 0x00008000);
        let bytes = params.to_bytes();
        assert_eq!(bytes.len(), 20);
        // Page size big-endian at offset 12
        assert_eq!(&bytes[12..14], &[0x00, 0x80]);
        // EEPROM size big-endian at offset 14
        assert_eq!(&bytes[14..16], &[0x04, 0x00]);
        // Flash size big-endian at offset 16
        assert_eq!(&bytes[16..20], &[0x00, 0x00, 0x80, 0x00]);
    }

    #[test]
    fn test_load_address_frame_is_little_endian() {
        let frame = Command::LoadAddress(0x1234).to_bytes();
        assert_eq!(frame, vec![STK_LOAD_ADDRESS, 0x34, 0x12, CRC_EOP]);
    }

    #[test]
    fn test_prog_page_frame() {
        let frame = Command::ProgPage {
            memory: MemoryKind::Flash,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
            verify: false,
        }
        .to_bytes();
        assert_eq!(
            frame,
            vec![STK_PROG_PAGE, 0x00, 0x04, b'F', 0xDE, 0xAD, 0xBE, 0xEF, CRC_EOP]
        );
    }

    #[test]
    fn test_read_page_frame_eeprom() {
        let frame = Command::ReadPage {
            memory: MemoryKind::Eeprom,
            length: 0x0100,
        }
        .to_bytes();
        assert_eq!(frame, vec![STK_READ_PAGE, 0x01, 0x00, b'E', CRC_EOP]);
    }

    #[test]
    fn test_response_lengths() {
        assert_eq!(Command::GetSync.response_len(), 2);
        assert_eq!(Command::EnterProgMode.response_len(), 2);
        assert_eq!(
            Command::ProgPage {
                memory: MemoryKind::Flash,
                data: vec![0; 128],
                verify: true,
            }
            .response_len(),
            2
        );
        assert_eq!(
            Command::ReadPage {
                memory: MemoryKind::Flash,
                length: 128,
            }
            .response_len(),
            130
        );
        assert_eq!(
            Command::ReadSignature { expected: None }.response_len(),
            5
        );
    }

    #[test]
    fn test_memory_kind_wire_values() {
        assert_eq!(MemoryKind::Flash.as_u8(), b'F');
        assert_eq!(MemoryKind::Eeprom.as_u8(), b'E');
        assert_eq!(MemoryKind::Flash.address_unit(), 2);
        assert_eq!(MemoryKind::Eeprom.address_unit(), 1);
    }

    #[test]
    fn test_signature_display() {
        let sig = Signature([0x1E, 0x95, 0x0F]);
        assert_eq!(sig.to_string(), "1E950F");
    }
}
