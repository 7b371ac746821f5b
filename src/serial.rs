//! Serial byte stream transport.
//!
//! Every command starts with an opcode byte and its complement. Each step
//! is answered with [`ACK`] or [`NACK`]. Multi-byte fields are followed by
//! the XOR of their bytes, 32-bit words are sent least significant byte first.

use core::fmt;

use embedded_io::{Read, ReadExactError, Write};
use heapless::Vec;
use log::{debug, info, warn};

use crate::board::{
    Board, SpecialCommand, SpecialKind, SPECIAL_BUFFER1_SIZE, SPECIAL_BUFFER2_SIZE,
};
use crate::error::Error;
use crate::mem::{AreaType, Dispatch, MemoryRegistry};
use crate::phase::Phase;
use crate::session::{DownloadSession, Flow};

/// Acknowledge byte.
pub const ACK: u8 = 0x79;

/// Reject byte.
pub const NACK: u8 = 0x1F;

/// Largest data chunk of a single command.
pub const PACKET_SIZE: usize = 256;

/// Maximum number of pages in one erase command.
pub const MAX_ERASE_PAGES: usize = 128;

const MASS_ERASE: u16 = 0xFFFF;
const BANK1_ERASE: u16 = 0xFFFE;
const BANK2_ERASE: u16 = 0xFFFD;
const SPECIAL_ERASE_MASK: u16 = 0xFFF0;

/// Address that carries no destination.
const NO_ADDRESS: u32 = 0xFFFF_FFFF;

/// Serial command opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Protocol version and supported commands
    Get = 0x00,
    /// Protocol version
    GetVersion = 0x01,
    /// Product id
    GetId = 0x02,
    /// Next download phase and its destination
    GetPhase = 0x03,
    /// Read up to 256 bytes of memory
    ReadMemory = 0x11,
    /// Read a partition, OTP only
    ReadPartition = 0x12,
    /// Start the image at an address
    Start = 0x21,
    /// Write up to 256 bytes
    Download = 0x31,
    /// Mass or page erase
    ExtendedErase = 0x44,
    /// Board specific command
    SpecialCommand = 0x50,
    /// Board specific command with a data buffer
    ExtendedSpecialCommand = 0x51,
    /// Enable write protection of sectors
    WriteProtect = 0x63,
    /// Disable write protection
    WriteUnprotect = 0x73,
    /// Enable readout protection
    ReadoutProtect = 0x82,
    /// Disable readout protection
    ReadoutUnprotect = 0x92,
}

/// Commands in the order `Get` reports them.
pub const COMMANDS: [Command; 15] = [
    Command::Get,
    Command::GetVersion,
    Command::GetId,
    Command::GetPhase,
    Command::ReadMemory,
    Command::ReadPartition,
    Command::Start,
    Command::Download,
    Command::ExtendedErase,
    Command::WriteProtect,
    Command::WriteUnprotect,
    Command::ReadoutProtect,
    Command::ReadoutUnprotect,
    Command::SpecialCommand,
    Command::ExtendedSpecialCommand,
];

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(opcode: u8) -> Result<Self, u8> {
        COMMANDS
            .iter()
            .copied()
            .find(|c| *c as u8 == opcode)
            .ok_or(opcode)
    }
}

/// The byte link failed, the session cannot continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError<E> {
    /// Link closed while a byte was expected
    Eof,
    /// Underlying I/O error
    Io(E),
}

impl<E> From<ReadExactError<E>> for LinkError<E> {
    fn from(e: ReadExactError<E>) -> Self {
        match e {
            ReadExactError::UnexpectedEof => LinkError::Eof,
            ReadExactError::Other(e) => LinkError::Io(e),
        }
    }
}

impl<E: fmt::Debug> fmt::Display for LinkError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => write!(f, "link closed"),
            Self::Io(e) => write!(f, "link error: {:?}", e),
        }
    }
}

type LinkResult<T, E> = Result<T, LinkError<E>>;

/// Where a host address points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Memory { address: u32, packet: u32 },
    Otp { packet: u32 },
    Nowhere,
}

fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Serial command dispatcher.
pub struct SerialDispatcher<'d, L, B: Board> {
    link: L,
    board: B,
    registry: MemoryRegistry<'d>,
    session: DownloadSession<B>,
}

impl<'d, L, B> SerialDispatcher<'d, L, B>
where
    L: Read + Write,
    B: Board,
{
    /// Dispatcher with a fresh session.
    pub fn new(link: L, board: B, registry: MemoryRegistry<'d>) -> Self {
        Self {
            link,
            board,
            registry,
            session: DownloadSession::new(),
        }
    }

    /// Session state.
    pub fn session(&self) -> &DownloadSession<B> {
        &self.session
    }

    /// Registered memories.
    pub fn registry(&self) -> &MemoryRegistry<'d> {
        &self.registry
    }

    /// Board hooks.
    pub fn board(&self) -> &B {
        &self.board
    }

    /// The byte link.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Give back the link and the board.
    pub fn release(self) -> (L, B) {
        (self.link, self.board)
    }

    /// Receive and run one command.
    pub fn poll(&mut self) -> LinkResult<Flow, L::Error> {
        let mut frame = [0u8; 2];
        self.link.read_exact(&mut frame)?;

        let flow = if frame[0] ^ frame[1] != 0xFF {
            warn!("bad command frame {:02X} {:02X}", frame[0], frame[1]);
            self.send(&[NACK])?;
            Flow::Continue
        } else {
            match Command::try_from(frame[0]) {
                Ok(command) => {
                    debug!("command {:?}", command);
                    self.execute(command)?
                }
                Err(opcode) => {
                    warn!("unknown opcode 0x{:02X}", opcode);
                    self.send(&[NACK])?;
                    Flow::Continue
                }
            }
        };
        self.link.flush().map_err(LinkError::Io)?;
        Ok(flow)
    }

    fn execute(&mut self, command: Command) -> LinkResult<Flow, L::Error> {
        match command {
            Command::Get => self.get_command()?,
            Command::GetVersion => self.get_version()?,
            Command::GetId => self.get_id()?,
            Command::GetPhase => self.get_phase()?,
            Command::ReadMemory => self.read_memory()?,
            Command::ReadPartition => self.read_partition()?,
            Command::Start => return self.start(),
            Command::Download => self.download()?,
            Command::ExtendedErase => self.erase()?,
            Command::WriteProtect => self.write_protect()?,
            Command::WriteUnprotect => {
                self.send(&[ACK])?;
                let r = self.board.set_write_protection(false, &[]);
                self.reply(r)?;
            }
            Command::ReadoutProtect => {
                self.send(&[ACK])?;
                let r = self.board.set_readout_protection(true);
                self.reply(r)?;
            }
            Command::ReadoutUnprotect => {
                self.send(&[ACK])?;
                let r = self.board.set_readout_protection(false);
                self.reply(r)?;
            }
            Command::SpecialCommand => self.special(SpecialKind::Special)?,
            Command::ExtendedSpecialCommand => self.special(SpecialKind::Extended)?,
        }
        Ok(Flow::Continue)
    }

    fn read_byte(&mut self) -> LinkResult<u8, L::Error> {
        let mut b = [0u8; 1];
        self.link.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn send(&mut self, bytes: &[u8]) -> LinkResult<(), L::Error> {
        self.link.write_all(bytes).map_err(LinkError::Io)
    }

    fn send_word(&mut self, word: u32) -> LinkResult<(), L::Error> {
        self.send(&word.to_le_bytes())
    }

    fn reply<T>(&mut self, result: Result<T, Error>) -> LinkResult<(), L::Error> {
        match result {
            Ok(_) => self.send(&[ACK]),
            Err(e) => {
                warn!("rejected: {}", e);
                self.send(&[NACK])
            }
        }
    }

    /// Big-endian address plus XOR, `None` on checksum mismatch.
    fn receive_address(&mut self) -> LinkResult<Option<u32>, L::Error> {
        let mut frame = [0u8; 5];
        self.link.read_exact(&mut frame)?;
        if xor(&frame[..4]) != frame[4] {
            return Ok(None);
        }
        Ok(Some(u32::from_be_bytes([
            frame[0], frame[1], frame[2], frame[3],
        ])))
    }

    /// Length byte plus its complement, `None` if they do not match.
    fn receive_length(&mut self) -> LinkResult<Option<usize>, L::Error> {
        let mut frame = [0u8; 2];
        self.link.read_exact(&mut frame)?;
        if frame[0] ^ frame[1] != 0xFF {
            return Ok(None);
        }
        Ok(Some(frame[0] as usize + 1))
    }

    fn resolve(&self, raw: u32) -> Result<Target, Error> {
        if raw == NO_ADDRESS {
            return Ok(Target::Nowhere);
        }
        let packet = raw & 0x00FF_FFFF;
        if Phase::from_id((raw >> 24) as u8) == Phase::Otp {
            return Ok(Target::Otp { packet });
        }
        let address = packet
            .checked_mul(PACKET_SIZE as u32)
            .and_then(|offset| self.session.current().destination.checked_add(offset))
            .ok_or(Error::AddressOutOfRange)?;
        if self.registry.memory_index(address).is_none() {
            return Err(Error::AddressOutOfRange);
        }
        Ok(Target::Memory { address, packet })
    }

    fn get_command(&mut self) -> LinkResult<(), L::Error> {
        self.session.otp_reset_read();

        let mut reply = [0u8; COMMANDS.len() + 4];
        reply[0] = ACK;
        reply[1] = COMMANDS.len() as u8;
        reply[2] = B::PROTOCOL_VERSION;
        for (slot, command) in reply[3..].iter_mut().zip(COMMANDS.iter()) {
            *slot = *command as u8;
        }
        reply[COMMANDS.len() + 3] = ACK;
        self.send(&reply)
    }

    fn get_version(&mut self) -> LinkResult<(), L::Error> {
        self.send(&[ACK, B::PROTOCOL_VERSION, 0x00, 0x00, ACK])
    }

    fn get_id(&mut self) -> LinkResult<(), L::Error> {
        let [msb, lsb] = B::DEVICE_ID.to_be_bytes();
        self.send(&[ACK, 0x01, msb, lsb, ACK])
    }

    fn get_phase(&mut self) -> LinkResult<(), L::Error> {
        match self.session.next_phase(&self.registry) {
            Ok(step) => {
                info!("phase 0x{:02X} at 0x{:08X}", step.phase.id(), step.destination);
                let d = step.destination.to_le_bytes();
                self.send(&[ACK, 6, step.phase.id(), d[0], d[1], d[2], d[3], 1, 0, ACK])
            }
            Err(e) => self.reply::<()>(Err(e)),
        }
    }

    fn read_memory(&mut self) -> LinkResult<(), L::Error> {
        if self.board.readout_protected() {
            return self.reply::<()>(Err(Error::ReadoutProtected));
        }
        self.send(&[ACK])?;

        let address = match self.receive_address()? {
            None => return self.reply::<()>(Err(Error::ChecksumMismatch)),
            Some(raw) => match self.resolve(raw) {
                Ok(Target::Memory { address, .. }) => address,
                Ok(_) => return self.reply::<()>(Err(Error::AddressOutOfRange)),
                Err(e) => return self.reply::<()>(Err(e)),
            },
        };
        self.send(&[ACK])?;

        let len = match self.receive_length()? {
            Some(len) => len,
            None => return self.reply::<()>(Err(Error::ChecksumMismatch)),
        };
        self.send(&[ACK])?;

        let index = self.registry.memory_index(address);
        for i in 0..len {
            let addr = address.wrapping_add(i as u32);
            let byte = index.map_or(0, |index| self.registry.read(addr, index));
            self.send(&[byte])?;
        }
        Ok(())
    }

    fn read_partition(&mut self) -> LinkResult<(), L::Error> {
        self.send(&[ACK])?;

        let mut frame = [0u8; 6];
        self.link.read_exact(&mut frame)?;
        if xor(&frame[..5]) != frame[5] {
            return self.reply::<()>(Err(Error::ChecksumMismatch));
        }
        if Phase::from_id(frame[0]) != Phase::Otp {
            warn!("partition 0x{:02X} cannot be read", frame[0]);
            return self.reply::<()>(Err(Error::UnsupportedSubcommand));
        }
        let offset = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.send(&[ACK])?;

        let len = match self.receive_length()? {
            Some(len) => len,
            None => return self.reply::<()>(Err(Error::ChecksumMismatch)),
        };
        self.send(&[ACK])?;

        let mut words = len / 4;
        if offset == 0 {
            let (version, global_state) = self.session.otp_begin_read(&self.registry);
            self.send_word(version)?;
            self.send_word(global_state)?;
            words = words.saturating_sub(2);
        }
        for _ in 0..words {
            let word = self.session.otp_next_word(&self.registry);
            self.send_word(word)?;
        }
        Ok(())
    }

    fn start(&mut self) -> LinkResult<Flow, L::Error> {
        self.send(&[ACK])?;

        let target = match self.receive_address()? {
            None => Err(Error::ChecksumMismatch),
            Some(raw) => self.resolve(raw),
        };
        match target {
            Ok(Target::Memory { address, .. }) if self.registry.check_jump_address(address) => {
                info!("start image at 0x{:08X}", address);
                self.send(&[ACK])?;
                Ok(Flow::Jump(address))
            }
            Ok(Target::Nowhere) => {
                self.send(&[ACK])?;
                Ok(Flow::Continue)
            }
            Ok(_) => {
                self.reply::<()>(Err(Error::AddressOutOfRange))?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                self.reply::<()>(Err(e))?;
                Ok(Flow::Continue)
            }
        }
    }

    fn download(&mut self) -> LinkResult<(), L::Error> {
        if self.board.readout_protected() {
            return self.reply::<()>(Err(Error::ReadoutProtected));
        }
        self.send(&[ACK])?;

        let target = match self.receive_address()? {
            None => return self.reply::<()>(Err(Error::ChecksumMismatch)),
            Some(raw) => match self.resolve(raw) {
                Ok(target) => target,
                Err(e) => return self.reply::<()>(Err(e)),
            },
        };
        self.send(&[ACK])?;

        let mut buffer = [0u8; PACKET_SIZE + 2];
        let n = self.read_byte()?;
        let len = n as usize + 1;
        self.link.read_exact(&mut buffer[..len + 1])?;
        if n ^ xor(&buffer[..len]) != buffer[len] {
            return self.reply::<()>(Err(Error::ChecksumMismatch));
        }
        let data = &buffer[..len];

        let result = match target {
            Target::Otp { packet } => self
                .session
                .otp_write(&self.registry, packet == 0, data)
                .map(|_| ()),
            Target::Memory { packet, .. }
                if self.session.current().phase == Phase::FlashLayout =>
            {
                self.session
                    .ingest_layout(packet as usize * PACKET_SIZE, data)
            }
            Target::Memory { address, .. } => {
                self.session.program(&self.registry, address, data)
            }
            Target::Nowhere => {
                debug!("download without destination ignored");
                Ok(())
            }
        };
        self.reply(result)
    }

    fn erase(&mut self) -> LinkResult<(), L::Error> {
        if self.board.readout_protected() {
            return self.reply::<()>(Err(Error::ReadoutProtected));
        }
        self.send(&[ACK])?;

        let mut head = [0u8; 2];
        self.link.read_exact(&mut head)?;
        let code = u16::from_be_bytes(head);

        if code & SPECIAL_ERASE_MASK == SPECIAL_ERASE_MASK {
            let checksum = self.read_byte()?;
            if xor(&head) != checksum {
                return self.reply::<()>(Err(Error::ChecksumMismatch));
            }
            let result = match code {
                MASS_ERASE | BANK1_ERASE | BANK2_ERASE => {
                    info!("mass erase 0x{:04X}", code);
                    match self.registry.mass_erase(B::DEFAULT_MEMORY_ADDRESS) {
                        Dispatch::Done => Ok(()),
                        Dispatch::Skipped => Err(Error::MissingCapability),
                    }
                }
                _ => Err(Error::UnsupportedSubcommand),
            };
            return self.reply(result);
        }

        let count = code as usize + 1;
        let mut pages: Vec<u16, MAX_ERASE_PAGES> = Vec::new();
        let mut sum = xor(&head);
        let mut overflow = false;
        for _ in 0..count {
            let mut page = [0u8; 2];
            self.link.read_exact(&mut page)?;
            sum ^= xor(&page);
            overflow |= pages.push(u16::from_be_bytes(page)).is_err();
        }
        let checksum = self.read_byte()?;
        if sum != checksum {
            return self.reply::<()>(Err(Error::ChecksumMismatch));
        }
        if overflow {
            return self.reply::<()>(Err(Error::InvalidLength));
        }

        // every page must be valid before anything is erased
        let mut ranges: Vec<(u32, u32), MAX_ERASE_PAGES> = Vec::new();
        for &page in pages.iter() {
            match self.page_range(page) {
                Some(range) => {
                    if ranges.push(range).is_err() {
                        return self.reply::<()>(Err(Error::InvalidLength));
                    }
                }
                None => {
                    warn!("page {} is outside memory", page);
                    return self.reply::<()>(Err(Error::AddressOutOfRange));
                }
            }
        }

        let mut result = Ok(());
        for (start, end) in ranges {
            debug!("erase page at 0x{:08X}", start);
            if self
                .registry
                .sector_erase(B::DEFAULT_MEMORY_ADDRESS, start, end)
                == Dispatch::Skipped
            {
                result = Err(Error::MissingCapability);
                break;
            }
        }
        self.reply(result)
    }

    /// `[start, end)` of a page of the default memory, `None` if it does not exist.
    fn page_range(&self, page: u16) -> Option<(u32, u32)> {
        let start = (page as u32)
            .checked_mul(B::FLASH_PAGE_SIZE)
            .and_then(|offset| B::DEFAULT_MEMORY_ADDRESS.checked_add(offset))?;
        let end = start.checked_add(B::FLASH_PAGE_SIZE)?;
        let memory = self.registry.memory_index(B::DEFAULT_MEMORY_ADDRESS);
        if self.registry.address_area(start) == AreaType::Error
            || self.registry.memory_index(start) != memory
            || self.registry.memory_index(end - 1) != memory
        {
            return None;
        }
        Some((start, end))
    }

    fn write_protect(&mut self) -> LinkResult<(), L::Error> {
        self.send(&[ACK])?;

        let mut buffer = [0u8; PACKET_SIZE + 1];
        let n = self.read_byte()?;
        let len = n as usize + 1;
        self.link.read_exact(&mut buffer[..len + 1])?;
        if n ^ xor(&buffer[..len]) != buffer[len] {
            return self.reply::<()>(Err(Error::ChecksumMismatch));
        }
        let r = self.board.set_write_protection(true, &buffer[..len]);
        self.reply(r)
    }

    /// Two byte big-endian length, the bytes and their XOR.
    fn receive_buffer<const N: usize>(&mut self) -> LinkResult<Result<Vec<u8, N>, Error>, L::Error> {
        let mut head = [0u8; 2];
        self.link.read_exact(&mut head)?;
        let len = u16::from_be_bytes(head) as usize;
        if len > N {
            return Ok(Err(Error::InvalidLength));
        }

        let mut buffer: Vec<u8, N> = Vec::new();
        if buffer.resize(len, 0).is_err() {
            return Ok(Err(Error::InvalidLength));
        }
        self.link.read_exact(&mut buffer)?;
        let checksum = self.read_byte()?;
        if xor(&head) ^ xor(&buffer) != checksum {
            return Ok(Err(Error::ChecksumMismatch));
        }
        Ok(Ok(buffer))
    }

    fn special(&mut self, kind: SpecialKind) -> LinkResult<(), L::Error> {
        self.send(&[ACK])?;

        let mut frame = [0u8; 3];
        self.link.read_exact(&mut frame)?;
        if xor(&frame[..2]) != frame[2] {
            return self.reply::<()>(Err(Error::ChecksumMismatch));
        }
        let opcode = u16::from_be_bytes([frame[0], frame[1]]);
        let supported = match kind {
            SpecialKind::Special => B::SPECIAL_OPCODES,
            SpecialKind::Extended => B::EXTENDED_SPECIAL_OPCODES,
        };
        if !supported.contains(&opcode) {
            return self.reply::<()>(Err(Error::UnsupportedSubcommand));
        }
        self.send(&[ACK])?;

        let buffer1 = match self.receive_buffer::<SPECIAL_BUFFER1_SIZE>()? {
            Ok(buffer) => buffer,
            Err(e) => return self.reply::<()>(Err(e)),
        };

        let buffer2 = if kind == SpecialKind::Extended {
            self.send(&[ACK])?;
            match self.receive_buffer::<SPECIAL_BUFFER2_SIZE>()? {
                Ok(buffer) => buffer,
                Err(e) => return self.reply::<()>(Err(e)),
            }
        } else {
            Vec::new()
        };

        let command = SpecialCommand {
            kind,
            opcode,
            buffer1,
            buffer2,
        };
        match self.board.special_command(&command) {
            Ok(reply) => {
                let [hi, lo] = (reply.len() as u16).to_be_bytes();
                self.send(&[ACK, hi, lo])?;
                self.send(&reply)?;
                self.send(&[ACK])
            }
            Err(e) => self.reply::<()>(Err(e)),
        }
    }
}
