//! OTP partition codec.
//!
//! The host sends the partition as a header `{version, global_state}`
//! followed by [`OTP_PART_SIZE`] words, all little-endian, split over as
//! many packets as the transport needs. The partition is programmed once
//! every word has arrived.

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mem::{Dispatch, MemoryRegistry};

/// Number of payload words in the OTP partition.
pub const OTP_PART_SIZE: usize = 96;

/// Header size in bytes.
pub const OTP_HEADER_SIZE: usize = 8;

/// Size of the programmed image, header plus words rounded up to a doubleword.
pub const OTP_IMAGE_SIZE: usize = (OTP_HEADER_SIZE + OTP_PART_SIZE * 4 + 7) & !7;

/// Versioned OTP word array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpPartition {
    /// Layout version of the partition
    pub version: u32,
    /// Lock state of the whole OTP area
    pub global_state: u32,
    /// Payload words
    pub words: [u32; OTP_PART_SIZE],
}

impl Default for OtpPartition {
    fn default() -> Self {
        Self {
            version: 0,
            global_state: 0,
            words: [0; OTP_PART_SIZE],
        }
    }
}

impl OtpPartition {
    /// Serialize to the programmed image, zero padded.
    pub fn to_image(&self) -> [u8; OTP_IMAGE_SIZE] {
        let mut image = [0u8; OTP_IMAGE_SIZE];
        image[0..4].copy_from_slice(&self.version.to_le_bytes());
        image[4..8].copy_from_slice(&self.global_state.to_le_bytes());
        for (chunk, word) in image[OTP_HEADER_SIZE..]
            .chunks_exact_mut(4)
            .zip(self.words.iter())
        {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        image
    }

    /// Read the partition back through the registry.
    pub fn load(registry: &MemoryRegistry<'_>, address: u32) -> Self {
        let word_at = |offset: usize| {
            let mut bytes = [0u8; 4];
            for (i, b) in bytes.iter_mut().enumerate() {
                let addr = address.wrapping_add((offset + i) as u32);
                *b = registry
                    .memory_index(addr)
                    .map(|index| registry.read(addr, index))
                    .unwrap_or(0);
            }
            u32::from_le_bytes(bytes)
        };

        let mut part = Self {
            version: word_at(0),
            global_state: word_at(4),
            ..Self::default()
        };
        for (i, word) in part.words.iter_mut().enumerate() {
            *word = word_at(OTP_HEADER_SIZE + i * 4);
        }
        part
    }
}

/// Progress of a multi-packet OTP write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpProgress {
    /// More words are expected, the value is the count received so far
    Pending(usize),
    /// The partition has been programmed
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Idle,
    Receiving,
    Aborted,
}

/// Assembles OTP writes and serves OTP reads.
pub struct OtpCodec {
    incoming: OtpPartition,
    outgoing: OtpPartition,
    write_index: usize,
    read_index: usize,
    state: WriteState,
    loaded: bool,
}

impl Default for OtpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl OtpCodec {
    /// Codec with no write or read in progress.
    pub fn new() -> Self {
        Self {
            incoming: OtpPartition::default(),
            outgoing: OtpPartition::default(),
            write_index: 0,
            read_index: 0,
            state: WriteState::Idle,
            loaded: false,
        }
    }

    /// Feed one packet of an OTP write.
    ///
    /// `first` marks the packet carrying the header. A wrong version rejects
    /// the packet and every following packet until a new header arrives.
    pub fn write_packet(
        &mut self,
        registry: &MemoryRegistry<'_>,
        address: u32,
        expected_version: u32,
        first: bool,
        data: &[u8],
    ) -> Result<OtpProgress> {
        let payload = if first {
            if data.len() < OTP_HEADER_SIZE {
                return Err(Error::InvalidLength);
            }
            let version = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            if version != expected_version {
                warn!("OTP version 0x{:08X}, write aborted", version);
                self.state = WriteState::Aborted;
                self.write_index = 0;
                return Err(Error::OtpVersionMismatch { found: version });
            }
            self.incoming = OtpPartition {
                version,
                global_state: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
                ..OtpPartition::default()
            };
            self.write_index = 0;
            self.state = WriteState::Receiving;
            &data[OTP_HEADER_SIZE..]
        } else {
            if self.state != WriteState::Receiving {
                return Err(Error::OtpWriteAborted);
            }
            data
        };

        for chunk in payload.chunks_exact(4) {
            if self.write_index >= OTP_PART_SIZE {
                break;
            }
            self.incoming.words[self.write_index] =
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.write_index += 1;
        }

        if self.write_index < OTP_PART_SIZE {
            debug!("OTP {} of {} words", self.write_index, OTP_PART_SIZE);
            return Ok(OtpProgress::Pending(self.write_index));
        }

        self.state = WriteState::Idle;
        self.write_index = 0;
        self.read_index = 0;
        self.loaded = false;

        match registry.write(address, &self.incoming.to_image()) {
            Dispatch::Done => {
                info!("OTP partition programmed");
                Ok(OtpProgress::Committed)
            }
            Dispatch::Skipped => {
                warn!("no writable OTP memory at 0x{:08X}", address);
                Err(Error::MissingCapability)
            }
        }
    }

    /// Start a read: load the partition and rewind.
    pub fn begin_read(&mut self, registry: &MemoryRegistry<'_>, address: u32) -> (u32, u32) {
        self.outgoing = OtpPartition::load(registry, address);
        self.loaded = true;
        self.read_index = 0;
        (self.outgoing.version, self.outgoing.global_state)
    }

    /// Rewind the read index without reloading.
    pub fn reset_read(&mut self) {
        self.read_index = 0;
    }

    /// Next payload word of the current read, `0` past the partition.
    pub fn next_word(&mut self, registry: &MemoryRegistry<'_>, address: u32) -> u32 {
        if !self.loaded {
            self.outgoing = OtpPartition::load(registry, address);
            self.loaded = true;
        }
        match self.outgoing.words.get(self.read_index) {
            Some(&word) => {
                self.read_index += 1;
                word
            }
            None => 0,
        }
    }
}
