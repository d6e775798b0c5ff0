//! Intel HEX image generation.
//!
//! Converts a flat binary buffer plus a 32-bit start address into Intel HEX
//! text records. Only generation is supported; parsing existing HEX files is
//! not.
//!
//! ## Record Format
//!
//! Every line is a checksummed, address-tagged record:
//!
//! ```text
//! +---+----+------+----+----------+----+
//! | : | BB | AAAA | TT | DD .. DD | CC |
//! +---+----+------+----+----------+----+
//!       |     |     |       |       |
//!       |     |     |       |       +-- checksum (two's complement)
//!       |     |     |       +---------- payload, two hex digits per byte
//!       |     |     +------------------ record type (00-05)
//!       |     +------------------------ 16-bit address
//!       +------------------------------ payload byte count
//! ```
//!
//! All hex digits are uppercase and each record ends with a newline. The
//! 16-bit address field covers one 64 KiB block; a type-04 Extended Linear
//! Address record establishes the upper 16 bits for everything that follows.
//!
//! ## Zero-run elision
//!
//! When enabled, the encoder works page by page and skips runs of zero
//! bytes instead of emitting them, on the assumption that the receiving
//! bootloader clears each page before writing. A page that is entirely zero
//! still produces a single one-byte zero record so the receiver knows to
//! clear it.

use crate::error::{Error, Result};
use log::debug;
use std::fmt::Write as _;

/// Default payload bytes per data record.
///
/// 16 data bytes keep a full record at 44 characters, inside the 64-byte
/// receive ring buffer of common serial bootloaders (32 bytes would produce
/// 76-character lines that can overrun it).
pub const DEFAULT_LINE_DATA_LEN: u8 = 16;

/// Minimum zero-run length that ends a data record early.
///
/// Starting a new record costs about five bytes of fixed overhead, so only
/// runs of at least this many zeros are worth splitting a record for.
pub const NULL_RUN_SPLIT: usize = 6;

/// Size of one Extended Linear Address block.
const LINEAR_BLOCK: u32 = 0x1_0000;

/// Intel HEX record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Data record (00).
    Data = 0,
    /// End of file marker (01).
    EndOfFile = 1,
    /// Extended segment address (02).
    ExtendedSegmentAddress = 2,
    /// Start segment address (03).
    StartSegmentAddress = 3,
    /// Extended linear address (04): upper 16 address bits.
    ExtendedLinearAddress = 4,
    /// Start linear address (05).
    StartLinearAddress = 5,
}

impl RecordType {
    /// Wire value of this record type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One Intel HEX record before text formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Record type.
    pub record_type: RecordType,
    /// 16-bit address field (zero for non-data records).
    pub address: u16,
    /// Payload bytes (at most 255).
    pub data: Vec<u8>,
}

impl HexRecord {
    /// Create a data record.
    pub fn data(address: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= 255);
        Self {
            record_type: RecordType::Data,
            address,
            data,
        }
    }

    /// Create the end-of-file record.
    pub fn end_of_file() -> Self {
        Self {
            record_type: RecordType::EndOfFile,
            address: 0,
            data: Vec::new(),
        }
    }

    /// Create an extended linear address record carrying the upper 16
    /// address bits.
    #[allow(clippy::cast_possible_truncation)]
    pub fn extended_linear(upper: u16) -> Self {
        Self {
            record_type: RecordType::ExtendedLinearAddress,
            address: 0,
            data: vec![(upper >> 8) as u8, (upper & 0xFF) as u8],
        }
    }

    /// Record checksum: two's complement of the byte count, address bytes,
    /// type byte and every payload byte, mod 256.
    #[allow(clippy::cast_possible_truncation)]
    pub fn checksum(&self) -> u8 {
        let mut sum = (self.data.len() as u8)
            .wrapping_add((self.address >> 8) as u8)
            .wrapping_add((self.address & 0xFF) as u8)
            .wrapping_add(self.record_type.as_u8());
        for byte in &self.data {
            sum = sum.wrapping_add(*byte);
        }
        0u8.wrapping_sub(sum)
    }

    /// Format this record as one text line, newline included.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to String cannot fail
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(13 + self.data.len() * 2);
        line.push(':');
        write!(line, "{:02X}", self.data.len() as u8).unwrap();
        write!(line, "{:04X}", self.address).unwrap();
        write!(line, "{:02X}", self.record_type.as_u8()).unwrap();
        for byte in &self.data {
            write!(line, "{byte:02X}").unwrap();
        }
        write!(line, "{:02X}", self.checksum()).unwrap();
        line.push('\n');
        line
    }
}

/// Encoder options.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Payload bytes per data record (1-255).
    pub line_data_len: u8,
    /// Device page size in bytes; must be a power of two when zero-run
    /// elision is enabled.
    pub page_size: u32,
    /// Skip zero runs within a page instead of encoding them.
    pub omit_null_runs: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            line_data_len: DEFAULT_LINE_DATA_LEN,
            page_size: 128,
            omit_null_runs: false,
        }
    }
}

impl EncodeOptions {
    /// Set the payload bytes per data record.
    #[must_use]
    pub fn with_line_data_len(mut self, len: u8) -> Self {
        self.line_data_len = len;
        self
    }

    /// Set the device page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Enable or disable zero-run elision.
    #[must_use]
    pub fn with_omit_null_runs(mut self, omit: bool) -> Self {
        self.omit_null_runs = omit;
        self
    }

    /// Reject invalid option combinations before producing any output.
    fn validate(&self) -> Result<()> {
        if self.line_data_len == 0 {
            return Err(Error::Encoding("line data length must be at least 1".into()));
        }
        if self.omit_null_runs && (self.page_size == 0 || !self.page_size.is_power_of_two()) {
            return Err(Error::Encoding(format!(
                "zero-run elision requires a power-of-two page size, got {}",
                self.page_size
            )));
        }
        Ok(())
    }
}

/// Encode a binary buffer into Intel HEX records.
///
/// The returned list is deterministic for identical inputs, every record
/// satisfies the checksum invariant, no data record exceeds
/// `line_data_len` payload bytes, and the list always ends with exactly one
/// end-of-file record.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_records(data: &[u8], start_address: u32, opts: &EncodeOptions) -> Result<Vec<HexRecord>> {
    opts.validate()?;

    if u64::from(start_address) + data.len() as u64 > u64::from(u32::MAX) + 1 {
        return Err(Error::Encoding(format!(
            "{} bytes at {start_address:#010X} exceed the 32-bit address space",
            data.len()
        )));
    }

    let mut records = Vec::new();
    let line_len = opts.line_data_len as usize;
    let mut emitted_upper: u16 = 0;
    let mut pos = 0usize;

    while pos < data.len() {
        let addr = start_address + pos as u32;

        // The address field is only 16 bits; moving into a new 64 KiB block
        // needs an extended linear address record before any of its data.
        let upper = (addr >> 16) as u16;
        if upper != emitted_upper {
            records.push(HexRecord::extended_linear(upper));
            emitted_upper = upper;
        }

        let block_end = data
            .len()
            .min(pos + (LINEAR_BLOCK - (addr % LINEAR_BLOCK)) as usize);

        if opts.omit_null_runs {
            encode_block_sparse(data, start_address, &mut pos, block_end, opts, &mut records);
        } else {
            while pos < block_end {
                let end = block_end.min(pos + line_len);
                records.push(HexRecord::data(
                    (start_address + pos as u32) as u16,
                    data[pos..end].to_vec(),
                ));
                pos = end;
            }
        }
    }

    records.push(HexRecord::end_of_file());

    debug!(
        "Encoded {} bytes at {start_address:#010X} into {} records",
        data.len(),
        records.len()
    );

    Ok(records)
}

/// Encode one 64 KiB block page by page, skipping zero runs.
#[allow(clippy::cast_possible_truncation)]
fn encode_block_sparse(
    data: &[u8],
    start_address: u32,
    pos: &mut usize,
    block_end: usize,
    opts: &EncodeOptions,
    records: &mut Vec<HexRecord>,
) {
    let page_size = opts.page_size as usize;
    let line_len = opts.line_data_len as usize;

    while *pos < block_end {
        let addr = start_address as usize + *pos;
        // Non-zero only for the first page when the start address is not
        // page aligned.
        let into_page = addr % page_size;
        let page_start = *pos;
        let page_end = block_end.min(*pos + (page_size - into_page));
        let mut entire_page_null = into_page == 0;

        while *pos < page_end {
            // Skip leading zeros
            if data[*pos] == 0 {
                *pos += 1;
                continue;
            }

            let rec_start = *pos;
            let line_end = page_end.min(rec_start + line_len);

            // Extend the record until the line fills or a zero run long
            // enough to be worth a split is seen. The run may continue past
            // the split point; the leading-zero skip above swallows the rest.
            let mut null_run = 0usize;
            *pos += 1;
            while *pos < line_end {
                if data[*pos] != 0 {
                    null_run = 0;
                    *pos += 1;
                    continue;
                }
                null_run += 1;
                *pos += 1;
                if null_run >= NULL_RUN_SPLIT {
                    break;
                }
            }

            // Trailing zeros never make it into the record.
            let rec_len = (*pos - rec_start) - null_run;
            if rec_len > 0 {
                entire_page_null = false;
                records.push(HexRecord::data(
                    (start_address + rec_start as u32) as u16,
                    data[rec_start..rec_start + rec_len].to_vec(),
                ));
            }
        }

        // A fully zero page still needs one zero byte so the receiver
        // clears it rather than leaving stale contents.
        if entire_page_null {
            records.push(HexRecord::data(
                (start_address + page_start as u32) as u16,
                vec![0],
            ));
        }
    }
}

/// Encode a binary buffer into complete Intel HEX text.
pub fn encode(data: &[u8], start_address: u32, opts: &EncodeOptions) -> Result<String> {
    let records = encode_records(data, start_address, opts)?;
    let mut text = String::new();
    for record in &records {
        text.push_str(&record.to_line());
    }
    Ok(text)
}

/// Write encoded records to an output stream.
pub fn write_hex<W: std::io::Write>(writer: &mut W, records: &[HexRecord]) -> Result<()> {
    for record in records {
        writer.write_all(record.to_line().as_bytes())?;
    }
    Ok(())
}
