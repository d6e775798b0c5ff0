//! STK500 programming session engine.
//!
//! A [`ProgrammingSession`] executes one prepared command sequence against a
//! bootloader over a duplex byte stream. The engine is event-driven: it
//! transmits exactly one command at a time and accumulates arriving bytes in
//! a response buffer until the in-flight command's complete response has
//! been recognized, then validates it and advances. Stream delivery
//! boundaries carry no meaning — a response may arrive in any number of
//! chunks, and surplus bytes beyond one response are retained for the next.
//!
//! Sessions are single-use: a session runs its sequence to completion, to
//! the first failure, or to an explicit stop, and is then discarded. Retry
//! policy belongs to the caller, by building a fresh session.
//!
//! The blocking [`ProgrammingSession::run`] pump drives the engine from a
//! [`Port`] for callers that do not have their own event loop; the
//! `on_*` entry points are the engine itself and are what the pump calls.

use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::port::Port;
use crate::protocol::stk500::{Command, DeviceParams, MemoryKind, STK_INSYNC, STK_OK, Signature};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Session configuration options.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time budget for one command's complete response.
    pub command_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(1000),
        }
    }
}

impl SessionConfig {
    /// Set the per-command response time budget.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Why a session entered the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// A response marker byte did not match the in-flight command.
    Desync {
        /// Command that was outstanding.
        command: &'static str,
        /// Marker byte the command expected.
        expected: u8,
        /// Byte actually received.
        actual: u8,
    },
    /// No complete response within the configured time budget.
    Timeout {
        /// Command that was outstanding.
        command: &'static str,
    },
    /// The stream closed while a command was outstanding.
    Disconnected {
        /// Command that was outstanding.
        command: &'static str,
    },
    /// Read-back data differed from what was written.
    VerifyMismatch {
        /// Absolute byte address of the first differing byte.
        offset: u32,
        /// Byte that was written.
        expected: u8,
        /// Byte that was read back.
        actual: u8,
    },
    /// The device signature did not match the expected identifier.
    SignatureMismatch {
        /// Signature supplied by the caller.
        expected: Signature,
        /// Signature reported by the device.
        actual: Signature,
    },
}

impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Desync {
                command,
                expected,
                actual,
            } => Error::Desync {
                command,
                expected,
                actual,
            },
            FailureReason::Timeout { command } => Error::Timeout { command },
            FailureReason::Disconnected { command } => Error::Disconnected { command },
            FailureReason::VerifyMismatch {
                offset,
                expected,
                actual,
            } => Error::VerifyMismatch {
                offset,
                expected,
                actual,
            },
            FailureReason::SignatureMismatch { expected, actual } => {
                Error::SignatureMismatch { expected, actual }
            },
        }
    }
}

/// Protocol phase of a session.
///
/// Exactly one case per protocol step, plus the three terminal states. The
/// phase is derived from the in-flight command by a single dispatch point,
/// so there are no loose counters to reset between steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Created, nothing sent yet.
    Idle,
    /// GetSync outstanding.
    Synchronizing,
    /// SetDevice outstanding.
    ConfiguringDevice,
    /// EnterProgMode outstanding.
    EnteringProgMode,
    /// LoadAddress outstanding.
    LoadingAddress,
    /// ProgPage outstanding.
    ProgrammingPage,
    /// ReadPage outstanding for a verify read-back.
    VerifyingPage,
    /// ReadPage outstanding for a plain memory read.
    ReadingMemory,
    /// LeaveProgMode outstanding.
    LeavingProgMode,
    /// ReadSignature outstanding.
    ReadingSignature,
    /// Sequence completed successfully. Terminal.
    Done,
    /// Stopped by an explicit stop request. Terminal.
    Stopped,
    /// Failed; no further commands will be sent. Terminal.
    Failed(FailureReason),
}

/// A programmed page awaiting its verify read-back.
#[derive(Debug)]
struct PendingVerify {
    /// Absolute byte address of the page.
    byte_address: u32,
    /// Bytes that were written.
    data: Vec<u8>,
}

/// One programming session over a byte stream.
pub struct ProgrammingSession<'a, P: Port> {
    port: &'a mut P,
    config: SessionConfig,
    queue: VecDeque<Command>,
    inflight: Option<Command>,
    response: Vec<u8>,
    phase: Phase,
    /// Device write cursor in address units, tracked from LoadAddress and
    /// page completions. `None` until the first LoadAddress.
    cursor: Option<u32>,
    pending_verify: Option<PendingVerify>,
    signature: Option<Signature>,
    data_read: Vec<u8>,
    pages_total: usize,
    pages_done: usize,
    sent_at: Option<Instant>,
}

impl<'a, P: Port> ProgrammingSession<'a, P> {
    /// Create a session bound to a port and a prepared command sequence.
    pub fn new(port: &'a mut P, commands: Vec<Command>) -> Self {
        Self::with_config(port, commands, SessionConfig::default())
    }

    /// Create a session with custom configuration.
    pub fn with_config(port: &'a mut P, commands: Vec<Command>, config: SessionConfig) -> Self {
        let pages_total = commands
            .iter()
            .filter(|c| matches!(c, Command::ProgPage { .. }))
            .count();
        Self {
            port,
            config,
            queue: commands.into(),
            inflight: None,
            response: Vec::new(),
            phase: Phase::Idle,
            cursor: None,
            pending_verify: None,
            signature: None,
            data_read: Vec::new(),
            pages_total,
            pages_done: 0,
            sent_at: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Whether the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            Phase::Done | Phase::Stopped | Phase::Failed(_)
        )
    }

    /// Signature read during this session, if any.
    pub fn signature(&self) -> Option<Signature> {
        self.signature
    }

    /// Bytes accumulated by non-verify ReadPage commands.
    pub fn data_read(&self) -> &[u8] {
        &self.data_read
    }

    /// Pages programmed so far.
    pub fn pages_done(&self) -> usize {
        self.pages_done
    }

    /// Total pages in the sequence.
    pub fn pages_total(&self) -> usize {
        self.pages_total
    }

    /// Send the first command. An empty sequence completes immediately.
    pub fn start(&mut self) -> Result<()> {
        debug_assert!(matches!(self.phase, Phase::Idle));
        self.send_next()
    }

    /// Feed newly arrived stream bytes into the engine.
    ///
    /// Chunk boundaries are arbitrary: one call may complete zero, one, or
    /// several responses, and leftover bytes stay buffered for the next
    /// response. Events arriving after a terminal state are ignored.
    pub fn on_bytes_received(&mut self, chunk: &[u8]) -> Result<()> {
        if self.is_terminal() {
            trace!("Ignoring {} bytes after terminal state", chunk.len());
            return Ok(());
        }
        if !chunk.is_empty() {
            self.response.extend_from_slice(chunk);
            trace!(
                "<= {} bytes ({} buffered)",
                chunk.len(),
                self.response.len()
            );
        }
        self.advance()
    }

    /// Notify the engine that the stream closed.
    pub fn on_stream_closed(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        match self.inflight.take() {
            Some(cmd) => self.fail(FailureReason::Disconnected {
                command: cmd.name(),
            }),
            None => Ok(()),
        }
    }

    /// Notify the engine that the in-flight command's time budget elapsed.
    pub fn on_response_timeout(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        match self.inflight.take() {
            Some(cmd) => self.fail(FailureReason::Timeout {
                command: cmd.name(),
            }),
            None => Ok(()),
        }
    }

    /// Stop the session. In-flight state is discarded; no partial result is
    /// trusted. The caller is expected to close the stream.
    pub fn stop(&mut self) {
        if self.is_terminal() {
            return;
        }
        debug!("Stop requested, discarding in-flight state");
        self.inflight = None;
        self.queue.clear();
        self.response.clear();
        self.pending_verify = None;
        self.phase = Phase::Stopped;
    }

    /// Drive the session to a terminal state by reading from the port.
    ///
    /// `progress` is called with `(pages_done, pages_total)` after each
    /// programmed page. Honors the global interrupt checker.
    pub fn run<F>(&mut self, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        if matches!(self.phase, Phase::Idle) {
            self.start()?;
        }

        let mut buf = [0u8; 256];
        while !self.is_terminal() {
            if crate::is_interrupt_requested() {
                self.stop();
                break;
            }

            match self.port.read(&mut buf) {
                Ok(0) => self.on_stream_closed()?,
                Ok(n) => {
                    let before = self.pages_done;
                    self.on_bytes_received(&buf[..n])?;
                    if self.pages_done != before {
                        progress(self.pages_done, self.pages_total);
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if let Some(sent_at) = self.sent_at {
                        if sent_at.elapsed() >= self.config.command_timeout {
                            self.on_response_timeout()?;
                        }
                    }
                },
                Err(e) => {
                    warn!("Read error: {e}");
                    self.on_stream_closed()?;
                },
            }
        }

        match self.phase.clone() {
            Phase::Stopped => Err(Error::Stopped),
            Phase::Failed(reason) => Err(reason.into()),
            _ => Ok(()),
        }
    }

    /// Recognize as many complete responses as the buffer holds.
    fn advance(&mut self) -> Result<()> {
        loop {
            let Some(cmd) = self.inflight.take() else {
                return Ok(());
            };

            if self.response.is_empty() {
                self.inflight = Some(cmd);
                return Ok(());
            }

            // Fail fast on a bad leading marker instead of waiting out a
            // full-length response that will never arrive.
            if self.response[0] != STK_INSYNC {
                let actual = self.response[0];
                return self.fail(FailureReason::Desync {
                    command: cmd.name(),
                    expected: STK_INSYNC,
                    actual,
                });
            }

            let expected_len = cmd.response_len();
            if self.response.len() < expected_len {
                self.inflight = Some(cmd);
                return Ok(());
            }

            let terminator = self.response[expected_len - 1];
            if terminator != STK_OK {
                return self.fail(FailureReason::Desync {
                    command: cmd.name(),
                    expected: STK_OK,
                    actual: terminator,
                });
            }

            let payload = self.response[1..expected_len - 1].to_vec();
            self.response.drain(..expected_len);
            self.sent_at = None;
            trace!("<= {} complete ({} payload bytes)", cmd.name(), payload.len());

            self.complete(cmd, payload)?;
        }
    }

    /// Apply one completed command and move on to the next.
    #[allow(clippy::cast_possible_truncation)]
    fn complete(&mut self, cmd: Command, payload: Vec<u8>) -> Result<()> {
        match cmd {
            Command::GetSync
            | Command::SetDevice(_)
            | Command::EnterProgMode
            | Command::LeaveProgMode => {},
            Command::LoadAddress(address) => {
                self.cursor = Some(u32::from(address));
            },
            Command::ProgPage {
                memory,
                data,
                verify,
            } => {
                let base_units = self.cursor.unwrap_or(0);
                let unit = memory.address_unit();
                let page_units = (data.len() as u32).div_ceil(unit);
                self.cursor = Some(base_units + page_units);
                self.pages_done += 1;

                if verify {
                    // The device cursor advanced while programming; the
                    // page address must be re-loaded before reading back.
                    // Plan builders keep base_units within 16 bits.
                    self.queue.push_front(Command::ReadPage {
                        memory,
                        length: data.len() as u16,
                    });
                    self.queue.push_front(Command::LoadAddress(base_units as u16));
                    self.pending_verify = Some(PendingVerify {
                        byte_address: base_units * unit,
                        data,
                    });
                }
            },
            Command::ReadPage { memory, length } => {
                let units = u32::from(length).div_ceil(memory.address_unit());
                if let Some(cursor) = self.cursor {
                    self.cursor = Some(cursor + units);
                }

                if let Some(pending) = self.pending_verify.take() {
                    for (i, (wrote, got)) in
                        pending.data.iter().zip(payload.iter()).enumerate()
                    {
                        if wrote != got {
                            return self.fail(FailureReason::VerifyMismatch {
                                offset: pending.byte_address + i as u32,
                                expected: *wrote,
                                actual: *got,
                            });
                        }
                    }
                    trace!("Page at {:#010X} verified", pending.byte_address);
                } else {
                    self.data_read.extend_from_slice(&payload);
                }
            },
            Command::ReadSignature { expected } => {
                let actual = Signature([payload[0], payload[1], payload[2]]);
                debug!("Device signature: {actual}");
                self.signature = Some(actual);
                if let Some(expected) = expected {
                    if expected != actual {
                        return self.fail(FailureReason::SignatureMismatch { expected, actual });
                    }
                }
            },
        }

        self.send_next()
    }

    /// Transmit the next queued command, or finish the session.
    fn send_next(&mut self) -> Result<()> {
        loop {
            let Some(cmd) = self.queue.pop_front() else {
                debug!("Session complete ({} pages)", self.pages_done);
                self.phase = Phase::Done;
                return Ok(());
            };

            // The device keeps its own write cursor across page
            // operations; a LoadAddress to where it already points is
            // redundant traffic.
            if let Command::LoadAddress(address) = &cmd {
                if self.cursor == Some(u32::from(*address)) {
                    trace!("Skipping LoadAddress({address:#06X}): cursor already there");
                    continue;
                }
            }

            let frame = cmd.to_bytes();
            trace!("=> {} ({} bytes)", cmd.name(), frame.len());
            self.phase = self.phase_for(&cmd);

            if let Err(e) = self.port.write_all_bytes(&frame) {
                warn!("Write failed for {}: {e}", cmd.name());
                return self.fail(FailureReason::Disconnected {
                    command: cmd.name(),
                });
            }

            self.inflight = Some(cmd);
            self.sent_at = Some(Instant::now());
            return Ok(());
        }
    }

    fn phase_for(&self, cmd: &Command) -> Phase {
        match cmd {
            Command::GetSync => Phase::Synchronizing,
            Command::SetDevice(_) => Phase::ConfiguringDevice,
            Command::EnterProgMode => Phase::EnteringProgMode,
            Command::LoadAddress(_) => Phase::LoadingAddress,
            Command::ProgPage { .. } => Phase::ProgrammingPage,
            Command::ReadPage { .. } => {
                if self.pending_verify.is_some() {
                    Phase::VerifyingPage
                } else {
                    Phase::ReadingMemory
                }
            },
            Command::LeaveProgMode => Phase::LeavingProgMode,
            Command::ReadSignature { .. } => Phase::ReadingSignature,
        }
    }

    /// Enter the failed state and surface the reason.
    fn fail(&mut self, reason: FailureReason) -> Result<()> {
        warn!("Session failed: {reason:?}");
        self.inflight = None;
        self.queue.clear();
        self.sent_at = None;
        self.phase = Phase::Failed(reason.clone());
        Err(reason.into())
    }
}

/// Build the command sequence that flashes `image` into `memory`.
///
/// Emits a LoadAddress before every page; the session elides the redundant
/// ones against its cursor model at send time.
#[allow(clippy::cast_possible_truncation)]
pub fn flash_plan(
    image: &FirmwareImage,
    params: &DeviceParams,
    memory: MemoryKind,
    verify: bool,
) -> Result<Vec<Command>> {
    let unit = memory.address_unit();
    let page_size = u32::from(params.page_size);
    if page_size == 0 {
        return Err(Error::Unsupported("device page size is zero".into()));
    }
    if image.origin() % unit != 0 {
        return Err(Error::Unsupported(format!(
            "image origin {:#010X} is not aligned to the {memory} address unit",
            image.origin()
        )));
    }
    let last_unit_addr = (image.end_address() - 1) / unit;
    if last_unit_addr > u32::from(u16::MAX) {
        return Err(Error::Unsupported(format!(
            "image extends beyond 16-bit {memory} addressing"
        )));
    }

    let mut commands = vec![Command::SetDevice(params.clone()), Command::EnterProgMode];
    for page in image.pages(page_size) {
        commands.push(Command::LoadAddress((page.address / unit) as u16));
        commands.push(Command::ProgPage {
            memory,
            data: page.data.to_vec(),
            verify,
        });
    }
    commands.push(Command::LeaveProgMode);
    Ok(commands)
}

/// Build the command sequence that reads `length` bytes of `memory`
/// starting at `address`.
#[allow(clippy::cast_possible_truncation)]
pub fn read_plan(
    params: &DeviceParams,
    memory: MemoryKind,
    address: u32,
    length: u32,
) -> Result<Vec<Command>> {
    let unit = memory.address_unit();
    let page_size = u32::from(params.page_size);
    if length == 0 {
        return Err(Error::Unsupported("read length is zero".into()));
    }
    if page_size == 0 {
        return Err(Error::Unsupported("device page size is zero".into()));
    }
    if address % unit != 0 {
        return Err(Error::Unsupported(format!(
            "read address {address:#010X} is not aligned to the {memory} address unit"
        )));
    }
    if (address + length - 1) / unit > u32::from(u16::MAX) {
        return Err(Error::Unsupported(format!(
            "read range extends beyond 16-bit {memory} addressing"
        )));
    }

    let mut commands = vec![Command::SetDevice(params.clone()), Command::EnterProgMode];
    let mut offset = 0u32;
    while offset < length {
        let chunk = page_size.min(length - offset);
        commands.push(Command::LoadAddress(((address + offset) / unit) as u16));
        commands.push(Command::ReadPage {
            memory,
            length: chunk as u16,
        });
        offset += chunk;
    }
    commands.push(Command::LeaveProgMode);
    Ok(commands)
}

/// Build the standalone signature read sequence.
pub fn signature_plan(expected: Option<Signature>) -> Vec<Command> {
    vec![Command::ReadSignature { expected }]
}

/// Build the synchronization sequence used while connecting.
pub fn sync_plan() -> Vec<Command> {
    vec![Command::GetSync]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::stk500::{
        CRC_EOP, STK_ENTER_PROGMODE, STK_GET_SYNC, STK_LEAVE_PROGMODE, STK_LOAD_ADDRESS,
        STK_PROG_PAGE, STK_READ_PAGE, STK_READ_SIGN, STK_SET_DEVICE,
    };
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::time::Duration;

    const TEST_SIGNATURE: [u8; 3] = [0x1E, 0x95, 0x0F];

    /// Scripted port: canned response bytes, records writes, never behaves
    /// like a device. For driving the engine through `on_bytes_received`.
    struct ScriptedPort {
        read_buf: VecDeque<u8>,
        written: Vec<u8>,
        closed: bool,
    }

    impl ScriptedPort {
        fn new(response: &[u8]) -> Self {
            Self {
                read_buf: response.iter().copied().collect(),
                written: Vec::new(),
                closed: false,
            }
        }

        fn closed() -> Self {
            let mut port = Self::new(&[]);
            port.closed = true;
            port
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.read_buf.is_empty() {
                if self.closed {
                    return Ok(0);
                }
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.read_buf.len());
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for ScriptedPort {
        fn set_timeout(&mut self, _timeout: Duration) -> crate::Result<()> {
            Ok(())
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(10)
        }
        fn set_baud_rate(&mut self, _baud_rate: u32) -> crate::Result<()> {
            Ok(())
        }
        fn baud_rate(&self) -> u32 {
            115200
        }
        fn clear_buffers(&mut self) -> crate::Result<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "scripted"
        }
        fn set_dtr(&mut self, _level: bool) -> crate::Result<()> {
            Ok(())
        }
        fn set_rts(&mut self, _level: bool) -> crate::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> crate::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    /// Mock bootloader: parses command frames from writes and queues the
    /// matching responses, maintaining a small flash array so programmed
    /// pages can be read back.
    struct MockBootloader {
        incoming: Vec<u8>,
        outgoing: VecDeque<u8>,
        flash: Vec<u8>,
        cursor_units: usize,
        /// Command codes in the order frames were received.
        commands_seen: Vec<u8>,
        /// Absolute byte offset to corrupt on read-back, if any.
        flip_byte_at: Option<usize>,
        /// Maximum bytes handed out per read call.
        read_chunk: usize,
        signature: [u8; 3],
    }

    impl MockBootloader {
        fn new() -> Self {
            Self {
                incoming: Vec::new(),
                outgoing: VecDeque::new(),
                flash: vec![0xFF; 0x10000],
                cursor_units: 0,
                commands_seen: Vec::new(),
                flip_byte_at: None,
                read_chunk: usize::MAX,
                signature: TEST_SIGNATURE,
            }
        }

        fn with_flipped_byte(mut self, offset: usize) -> Self {
            self.flip_byte_at = Some(offset);
            self
        }

        fn with_read_chunk(mut self, chunk: usize) -> Self {
            self.read_chunk = chunk;
            self
        }

        fn respond(&mut self, payload: &[u8]) {
            self.outgoing.push_back(STK_INSYNC);
            self.outgoing.extend(payload.iter().copied());
            self.outgoing.push_back(STK_OK);
        }

        fn unit_for(memtype: u8) -> usize {
            if memtype == b'F' { 2 } else { 1 }
        }

        fn process_frames(&mut self) {
            loop {
                let Some(&code) = self.incoming.first() else {
                    return;
                };
                let have = self.incoming.len();
                let frame_len = match code {
                    STK_SET_DEVICE => 22,
                    STK_LOAD_ADDRESS => 4,
                    STK_PROG_PAGE => {
                        if have < 3 {
                            return;
                        }
                        let len =
                            usize::from(self.incoming[1]) << 8 | usize::from(self.incoming[2]);
                        5 + len
                    },
                    STK_READ_PAGE => 5,
                    _ => 2,
                };
                if have < frame_len {
                    return;
                }

                let frame: Vec<u8> = self.incoming.drain(..frame_len).collect();
                assert_eq!(*frame.last().unwrap(), CRC_EOP, "frame missing CRC_EOP");
                self.commands_seen.push(code);

                match code {
                    STK_LOAD_ADDRESS => {
                        self.cursor_units =
                            usize::from(frame[1]) | usize::from(frame[2]) << 8;
                        self.respond(&[]);
                    },
                    STK_PROG_PAGE => {
                        let len = usize::from(frame[1]) << 8 | usize::from(frame[2]);
                        let unit = Self::unit_for(frame[3]);
                        let base = self.cursor_units * unit;
                        self.flash[base..base + len].copy_from_slice(&frame[4..4 + len]);
                        self.cursor_units += len.div_ceil(unit);
                        self.respond(&[]);
                    },
                    STK_READ_PAGE => {
                        let len = usize::from(frame[1]) << 8 | usize::from(frame[2]);
                        let unit = Self::unit_for(frame[3]);
                        let base = self.cursor_units * unit;
                        let mut data = self.flash[base..base + len].to_vec();
                        if let Some(flip) = self.flip_byte_at {
                            if (base..base + len).contains(&flip) {
                                data[flip - base] ^= 0x01;
                            }
                        }
                        self.cursor_units += len.div_ceil(unit);
                        self.respond(&data);
                    },
                    STK_READ_SIGN => {
                        let signature = self.signature;
                        self.respond(&signature);
                    },
                    _ => self.respond(&[]),
                }
            }
        }
    }

    impl Read for MockBootloader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.outgoing.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.outgoing.len()).min(self.read_chunk);
            for b in buf.iter_mut().take(n) {
                *b = self.outgoing.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockBootloader {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.incoming.extend_from_slice(buf);
            self.process_frames();
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockBootloader {
        fn set_timeout(&mut self, _timeout: Duration) -> crate::Result<()> {
            Ok(())
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(10)
        }
        fn set_baud_rate(&mut self, _baud_rate: u32) -> crate::Result<()> {
            Ok(())
        }
        fn baud_rate(&self) -> u32 {
            115200
        }
        fn clear_buffers(&mut self) -> crate::Result<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "mock-bootloader"
        }
        fn set_dtr(&mut self, _level: bool) -> crate::Result<()> {
            Ok(())
        }
        fn set_rts(&mut self, _level: bool) -> crate::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    fn test_params() -> DeviceParams {
        DeviceParams::new(32, 1024, 32768)
    }

    fn test_image(len: usize, origin: u32) -> FirmwareImage {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        FirmwareImage::from_bytes(data, origin).unwrap()
    }

    // ---- full sequences against the mock bootloader ----

    #[test]
    fn test_flash_with_verify_reaches_done() {
        crate::test_set_interrupted(false);
        let image = test_image(96, 0);
        let plan = flash_plan(&image, &test_params(), MemoryKind::Flash, true).unwrap();

        let mut port = MockBootloader::new();
        let mut pages_reported = Vec::new();
        {
            let mut session = ProgrammingSession::new(&mut port, plan);
            session
                .run(|done, total| pages_reported.push((done, total)))
                .unwrap();
            assert_eq!(*session.phase(), Phase::Done);
        }

        assert_eq!(&port.flash[..96], image.data());
        assert_eq!(pages_reported, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn test_flash_without_verify_sends_no_read_page() {
        crate::test_set_interrupted(false);
        let image = test_image(64, 0);
        let plan = flash_plan(&image, &test_params(), MemoryKind::Flash, false).unwrap();

        let mut port = MockBootloader::new();
        {
            let mut session = ProgrammingSession::new(&mut port, plan);
            session.run(|_, _| {}).unwrap();
        }

        assert!(!port.commands_seen.contains(&STK_READ_PAGE));
        assert_eq!(
            port.commands_seen.first().copied(),
            Some(STK_SET_DEVICE)
        );
        assert_eq!(
            port.commands_seen.last().copied(),
            Some(STK_LEAVE_PROGMODE)
        );
    }

    #[test]
    fn test_sequential_pages_need_single_load_address() {
        crate::test_set_interrupted(false);
        let image = test_image(96, 0);
        let plan = flash_plan(&image, &test_params(), MemoryKind::Flash, false).unwrap();

        let mut port = MockBootloader::new();
        {
            let mut session = ProgrammingSession::new(&mut port, plan);
            session.run(|_, _| {}).unwrap();
        }

        // The device cursor advances across pages, so only the first page
        // needs an explicit address load.
        let loads = port
            .commands_seen
            .iter()
            .filter(|&&c| c == STK_LOAD_ADDRESS)
            .count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_verify_reloads_address_per_page() {
        crate::test_set_interrupted(false);
        let image = test_image(64, 0);
        let plan = flash_plan(&image, &test_params(), MemoryKind::Flash, true).unwrap();

        let mut port = MockBootloader::new();
        {
            let mut session = ProgrammingSession::new(&mut port, plan);
            session.run(|_, _| {}).unwrap();
        }

        // One initial load plus one re-load before each of the two
        // read-backs; the second page's own load is elided because the
        // read-back leaves the cursor at the page base.
        let loads = port
            .commands_seen
            .iter()
            .filter(|&&c| c == STK_LOAD_ADDRESS)
            .count();
        assert_eq!(loads, 3);
    }

    #[test]
    fn test_verify_mismatch_reports_exact_offset() {
        crate::test_set_interrupted(false);
        let image = test_image(96, 0);
        let plan = flash_plan(&image, &test_params(), MemoryKind::Flash, true).unwrap();

        // Corrupt one byte in the second page on read-back.
        let mut port = MockBootloader::new().with_flipped_byte(0x25);
        let result = {
            let mut session = ProgrammingSession::new(&mut port, plan);
            session.run(|_, _| {})
        };

        match result {
            Err(Error::VerifyMismatch {
                offset,
                expected,
                actual,
            }) => {
                assert_eq!(offset, 0x25);
                assert_eq!(actual, expected ^ 0x01);
            },
            other => panic!("Expected VerifyMismatch, got {other:?}"),
        }

        // The failure is terminal: nothing after the failed page.
        assert!(!port.commands_seen.contains(&STK_LEAVE_PROGMODE));
    }

    #[test]
    fn test_eeprom_uses_byte_addressing() {
        crate::test_set_interrupted(false);
        let data = vec![0x42; 48];
        let image = FirmwareImage::from_bytes(data.clone(), 0x40).unwrap();
        let plan = flash_plan(&image, &test_params(), MemoryKind::Eeprom, true).unwrap();

        let mut port = MockBootloader::new();
        {
            let mut session = ProgrammingSession::new(&mut port, plan);
            session.run(|_, _| {}).unwrap();
        }

        assert_eq!(&port.flash[0x40..0x40 + 48], &data[..]);
    }

    #[test]
    fn test_read_plan_returns_memory_contents() {
        crate::test_set_interrupted(false);
        let mut port = MockBootloader::new();
        port.flash[0x100..0x140].copy_from_slice(&[0xA5; 0x40]);

        let plan = read_plan(&test_params(), MemoryKind::Flash, 0x100, 0x40).unwrap();
        let mut session = ProgrammingSession::new(&mut port, plan);
        session.run(|_, _| {}).unwrap();

        assert_eq!(session.data_read(), &[0xA5; 0x40][..]);
    }

    #[test]
    fn test_signature_check_matches() {
        crate::test_set_interrupted(false);
        let mut port = MockBootloader::new();
        let plan = signature_plan(Some(Signature(TEST_SIGNATURE)));
        let mut session = ProgrammingSession::new(&mut port, plan);
        session.run(|_, _| {}).unwrap();
        assert_eq!(session.signature(), Some(Signature(TEST_SIGNATURE)));
        assert_eq!(*session.phase(), Phase::Done);
    }

    #[test]
    fn test_signature_mismatch_fails_before_programming() {
        crate::test_set_interrupted(false);
        let mut port = MockBootloader::new();
        let expected = Signature([0x1E, 0x95, 0x14]);
        let plan = signature_plan(Some(expected));
        let result = {
            let mut session = ProgrammingSession::new(&mut port, plan);
            session.run(|_, _| {})
        };

        match result {
            Err(Error::SignatureMismatch {
                expected: e,
                actual,
            }) => {
                assert_eq!(e, expected);
                assert_eq!(actual, Signature(TEST_SIGNATURE));
            },
            other => panic!("Expected SignatureMismatch, got {other:?}"),
        }
        assert_eq!(port.commands_seen, vec![STK_READ_SIGN]);
    }

    #[test]
    fn test_fragmented_delivery_matches_single_chunk() {
        crate::test_set_interrupted(false);
        for chunk in [1usize, 2, 3, usize::MAX] {
            let image = test_image(64, 0);
            let plan = flash_plan(&image, &test_params(), MemoryKind::Flash, true).unwrap();
            let mut port = MockBootloader::new().with_read_chunk(chunk);
            let mut session = ProgrammingSession::new(&mut port, plan);
            session.run(|_, _| {}).unwrap();
            assert_eq!(
                *session.phase(),
                Phase::Done,
                "chunk size {chunk} changed the outcome"
            );
        }
    }

    // ---- direct event-driven engine tests ----

    #[test]
    fn test_response_split_across_three_chunks() {
        let mut port = ScriptedPort::new(&[]);
        let mut session =
            ProgrammingSession::new(&mut port, signature_plan(Some(Signature(TEST_SIGNATURE))));
        session.start().unwrap();

        session.on_bytes_received(&[STK_INSYNC]).unwrap();
        assert_eq!(*session.phase(), Phase::ReadingSignature);
        session.on_bytes_received(&[0x1E, 0x95]).unwrap();
        assert_eq!(*session.phase(), Phase::ReadingSignature);
        session.on_bytes_received(&[0x0F, STK_OK]).unwrap();
        assert_eq!(*session.phase(), Phase::Done);
    }

    #[test]
    fn test_surplus_bytes_carry_into_next_response() {
        let mut port = ScriptedPort::new(&[]);
        let plan = vec![
            Command::GetSync,
            Command::ReadSignature { expected: None },
        ];
        let mut session = ProgrammingSession::new(&mut port, plan);
        session.start().unwrap();

        // One arrival completes the GetSync response and starts the
        // signature response.
        session
            .on_bytes_received(&[STK_INSYNC, STK_OK, STK_INSYNC, 0x1E])
            .unwrap();
        assert_eq!(*session.phase(), Phase::ReadingSignature);

        session.on_bytes_received(&[0x95, 0x0F, STK_OK]).unwrap();
        assert_eq!(*session.phase(), Phase::Done);
        assert_eq!(session.signature(), Some(Signature(TEST_SIGNATURE)));
    }

    #[test]
    fn test_bad_leading_marker_fails_fast() {
        let mut port = ScriptedPort::new(&[]);
        let mut session = ProgrammingSession::new(&mut port, sync_plan());
        session.start().unwrap();

        // A single wrong byte is enough; the engine does not wait for the
        // full response length.
        let result = session.on_bytes_received(&[0x15]);
        match result {
            Err(Error::Desync {
                command,
                expected,
                actual,
            }) => {
                assert_eq!(command, "GetSync");
                assert_eq!(expected, STK_INSYNC);
                assert_eq!(actual, 0x15);
            },
            other => panic!("Expected Desync, got {other:?}"),
        }
        assert!(matches!(session.phase(), Phase::Failed(_)));
    }

    #[test]
    fn test_bad_trailing_marker_fails() {
        let mut port = ScriptedPort::new(&[]);
        let mut session = ProgrammingSession::new(&mut port, sync_plan());
        session.start().unwrap();

        let result = session.on_bytes_received(&[STK_INSYNC, 0x11]);
        match result {
            Err(Error::Desync {
                expected, actual, ..
            }) => {
                assert_eq!(expected, STK_OK);
                assert_eq!(actual, 0x11);
            },
            other => panic!("Expected Desync, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_closed_mid_command_is_disconnected() {
        crate::test_set_interrupted(false);
        let mut port = ScriptedPort::closed();
        let mut session = ProgrammingSession::new(&mut port, sync_plan());
        let result = session.run(|_, _| {});

        match result {
            Err(Error::Disconnected { command }) => assert_eq!(command, "GetSync"),
            other => panic!("Expected Disconnected, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_event_fails_session() {
        let mut port = ScriptedPort::new(&[]);
        let mut session = ProgrammingSession::new(&mut port, sync_plan());
        session.start().unwrap();

        let result = session.on_response_timeout();
        match result {
            Err(Error::Timeout { command }) => assert_eq!(command, "GetSync"),
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert!(session.is_terminal());
    }

    #[test]
    fn test_run_times_out_with_silent_device() {
        crate::test_set_interrupted(false);
        let mut port = ScriptedPort::new(&[]);
        let config = SessionConfig::default().with_command_timeout(Duration::from_millis(0));
        let mut session = ProgrammingSession::with_config(&mut port, sync_plan(), config);
        let result = session.run(|_, _| {});
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[test]
    fn test_stop_discards_in_flight_state() {
        let mut port = ScriptedPort::new(&[]);
        let mut session = ProgrammingSession::new(&mut port, sync_plan());
        session.start().unwrap();

        session.stop();
        assert_eq!(*session.phase(), Phase::Stopped);

        // Late arrivals are ignored, not processed.
        session.on_bytes_received(&[STK_INSYNC, STK_OK]).unwrap();
        assert_eq!(*session.phase(), Phase::Stopped);
    }

    #[test]
    fn test_events_after_failure_are_ignored() {
        let mut port = ScriptedPort::new(&[]);
        let mut session = ProgrammingSession::new(&mut port, sync_plan());
        session.start().unwrap();
        let _ = session.on_bytes_received(&[0x15]);
        let failed = session.phase().clone();

        session.on_bytes_received(&[STK_INSYNC, STK_OK]).unwrap();
        session.on_stream_closed().unwrap();
        session.on_response_timeout().unwrap();
        assert_eq!(*session.phase(), failed);
    }

    #[test]
    fn test_empty_plan_completes_immediately() {
        let mut port = ScriptedPort::new(&[]);
        let mut session = ProgrammingSession::new(&mut port, Vec::new());
        session.start().unwrap();
        assert_eq!(*session.phase(), Phase::Done);
        assert!(port.written.is_empty());
    }

    #[test]
    fn test_command_frames_are_written_verbatim() {
        let mut port = ScriptedPort::new(&[]);
        let mut session = ProgrammingSession::new(&mut port, sync_plan());
        session.start().unwrap();
        assert_eq!(port.written, vec![STK_GET_SYNC, CRC_EOP]);
    }

    #[test]
    fn test_phase_tracks_in_flight_command() {
        let mut port = ScriptedPort::new(&[]);
        let plan = vec![Command::SetDevice(test_params()), Command::EnterProgMode];
        let mut session = ProgrammingSession::new(&mut port, plan);
        session.start().unwrap();
        assert_eq!(*session.phase(), Phase::ConfiguringDevice);
        session.on_bytes_received(&[STK_INSYNC, STK_OK]).unwrap();
        assert_eq!(*session.phase(), Phase::EnteringProgMode);
        assert!(port.written.contains(&STK_ENTER_PROGMODE));
    }

    // ---- plan builders ----

    #[test]
    fn test_flash_plan_shape() {
        let image = test_image(96, 0);
        let plan = flash_plan(&image, &test_params(), MemoryKind::Flash, false).unwrap();

        assert!(matches!(plan[0], Command::SetDevice(_)));
        assert!(matches!(plan[1], Command::EnterProgMode));
        assert!(matches!(plan.last(), Some(Command::LeaveProgMode)));
        let pages = plan
            .iter()
            .filter(|c| matches!(c, Command::ProgPage { .. }))
            .count();
        assert_eq!(pages, 3);
    }

    #[test]
    fn test_flash_plan_uses_word_addresses_for_flash() {
        let image = test_image(32, 0x100);
        let plan = flash_plan(&image, &test_params(), MemoryKind::Flash, false).unwrap();
        let load = plan
            .iter()
            .find_map(|c| match c {
                Command::LoadAddress(a) => Some(*a),
                _ => None,
            })
            .unwrap();
        assert_eq!(load, 0x80);
    }

    #[test]
    fn test_flash_plan_rejects_odd_flash_origin() {
        let image = test_image(16, 0x101);
        assert!(matches!(
            flash_plan(&image, &test_params(), MemoryKind::Flash, false),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_flash_plan_rejects_out_of_range_image() {
        let image = test_image(32, 0x0002_0000);
        assert!(matches!(
            flash_plan(&image, &test_params(), MemoryKind::Flash, false),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_read_plan_chunks_by_page_size() {
        let plan = read_plan(&test_params(), MemoryKind::Flash, 0, 100).unwrap();
        let chunks: Vec<u16> = plan
            .iter()
            .filter_map(|c| match c {
                Command::ReadPage { length, .. } => Some(*length),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![32, 32, 32, 4]);
    }

    #[test]
    fn test_read_plan_rejects_zero_length() {
        assert!(matches!(
            read_plan(&test_params(), MemoryKind::Flash, 0, 0),
            Err(Error::Unsupported(_))
        ));
    }
}
