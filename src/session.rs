//! Download session state shared by every transport.

use core::marker::PhantomData;

use heapless::Vec;
use log::{debug, warn};

use crate::board::Board;
use crate::error::{Error, LayoutError, Result};
use crate::layout::FlashLayout;
use crate::mem::{AreaType, Dispatch, MemoryRegistry};
use crate::otp::{OtpCodec, OtpProgress};
use crate::phase::{self, Phase, PhaseSequencer, PhaseStep};

/// Capacity of the flash layout text buffer.
pub const LAYOUT_TEXT_SIZE: usize = 4096;

/// What the main loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep polling for commands
    Continue,
    /// End the session and start the image at this address
    Jump(u32),
}

/// State of one download session.
///
/// Owned by the active dispatcher, every mutation goes through `&mut self`.
pub struct DownloadSession<B: Board> {
    sequencer: PhaseSequencer,
    current: PhaseStep,
    layout: FlashLayout,
    layout_text: Vec<u8, LAYOUT_TEXT_SIZE>,
    offsets: [u32; 4],
    last_sector: u32,
    write_end: u32,
    otp: OtpCodec,
    _board: PhantomData<B>,
}

impl<B: Board> Default for DownloadSession<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Board> DownloadSession<B> {
    /// Fresh session, positioned before the flash layout phase.
    pub fn new() -> Self {
        Self {
            sequencer: PhaseSequencer::new(),
            current: PhaseStep {
                phase: Phase::FlashLayout,
                destination: B::FLASHLAYOUT_ADDRESS,
            },
            layout: FlashLayout::new(),
            layout_text: Vec::new(),
            offsets: [0; 4],
            last_sector: 0,
            write_end: 0,
            otp: OtpCodec::new(),
            _board: PhantomData,
        }
    }

    /// Forget everything and start over.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Phase last handed out by [`next_phase()`](DownloadSession::next_phase).
    pub fn current(&self) -> PhaseStep {
        self.current
    }

    /// Partition table received so far.
    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// Highest external sector index erased in this session, `0` if none.
    pub fn last_erased_sector(&self) -> u32 {
        self.last_sector
    }

    /// Move to the next phase.
    pub fn next_phase(&mut self, registry: &MemoryRegistry<'_>) -> Result<PhaseStep> {
        let step = self.sequencer.advance::<B>(&self.layout, registry)?;
        self.current = step;
        Ok(step)
    }

    /// Destination of `phase` for the current layout.
    pub fn destination(&self, phase: Phase) -> u32 {
        phase::destination::<B>(phase, &self.layout)
    }

    /// Reserve `len` bytes in the running offset of `phase`.
    ///
    /// Returns the offset the data goes to. `restart` rewinds the phase first.
    pub fn take_offset(&mut self, phase: Phase, len: usize, restart: bool) -> u32 {
        let slot = match phase {
            Phase::FlashLayout => 0,
            Phase::Phase3 => 1,
            Phase::Phase4 => 2,
            _ => 3,
        };
        if restart {
            self.offsets[slot] = 0;
        }
        let offset = self.offsets[slot];
        self.offsets[slot] = offset.wrapping_add(len as u32);
        offset
    }

    /// Feed layout payload found at `offset` in the layout stream.
    ///
    /// Bytes inside the signature are dropped, the rest is appended and the
    /// whole text parsed again. On error the table is discarded.
    pub fn ingest_layout(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset == 0 {
            self.layout_text.clear();
            self.layout.clear();
        }

        let skip = B::LAYOUT_SIGNATURE_SIZE.saturating_sub(offset);
        if skip >= data.len() {
            return Ok(());
        }
        let position = (offset + skip) - B::LAYOUT_SIGNATURE_SIZE;
        if position != self.layout_text.len() {
            warn!("layout data at {} while expecting {}", position, self.layout_text.len());
            self.discard_layout();
            return Err(Error::OutOfOrderWrite);
        }
        if self.layout_text.extend_from_slice(&data[skip..]).is_err() {
            self.discard_layout();
            return Err(LayoutError::TooLarge.into());
        }

        match FlashLayout::parse(&self.layout_text) {
            Ok(layout) => {
                debug!("layout has {} partitions", layout.len());
                self.layout = layout;
                Ok(())
            }
            Err(e) => {
                warn!("layout refused: {}", e);
                self.discard_layout();
                Err(e.into())
            }
        }
    }

    fn discard_layout(&mut self) {
        self.layout_text.clear();
        self.layout.clear();
    }

    fn is_external(address: u32) -> bool {
        (B::EXT_MEMORY_START_ADDRESS..=B::EXT_MEMORY_END_ADDRESS).contains(&address)
    }

    fn sector_of(address: u32) -> u32 {
        (address - B::EXT_MEMORY_START_ADDRESS) / B::EXT_MEMORY_SECTOR_SIZE + 1
    }

    fn sector_start(sector: u32) -> u32 {
        B::EXT_MEMORY_START_ADDRESS + (sector - 1) * B::EXT_MEMORY_SECTOR_SIZE
    }

    /// Program an image chunk.
    ///
    /// Inside the external memory window sectors are erased the first time
    /// they are reached, and every write is verified. A verify failure is
    /// reported after the data has been written.
    pub fn program(
        &mut self,
        registry: &MemoryRegistry<'_>,
        address: u32,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = address
            .checked_add(data.len() as u32)
            .ok_or(Error::AddressOutOfRange)?;
        if registry.address_area(address) == AreaType::Error {
            warn!("no memory at 0x{:08X}", address);
            return Err(Error::AddressOutOfRange);
        }

        let external = Self::is_external(address);
        if external {
            if address < self.write_end {
                warn!(
                    "write at 0x{:08X} below previous end 0x{:08X}",
                    address, self.write_end
                );
                return Err(Error::OutOfOrderWrite);
            }
            let first = Self::sector_of(address);
            let last = Self::sector_of(end - 1);
            if last > self.last_sector {
                let from = first.max(self.last_sector + 1);
                let start = if from == first {
                    address
                } else {
                    Self::sector_start(from)
                };
                debug!("erase sectors {}..={}", from, last);
                if registry.sector_erase(address, start, end) == Dispatch::Skipped {
                    debug!("memory at 0x{:08X} has no sector erase", address);
                }
                self.last_sector = last;
            }
        }

        if registry.write(address, data) == Dispatch::Skipped {
            warn!("memory at 0x{:08X} is not writable", address);
            return Err(Error::MissingCapability);
        }

        if external {
            self.write_end = end;
            let mismatch = registry.verify(address, data, 0);
            if mismatch != 0 && mismatch < end {
                warn!("verify failed at 0x{:08X}", mismatch);
                return Err(Error::VerifyMismatch { address: mismatch });
            }
        }
        Ok(())
    }

    /// Feed one OTP write packet, `first` carries the header.
    pub fn otp_write(
        &mut self,
        registry: &MemoryRegistry<'_>,
        first: bool,
        data: &[u8],
    ) -> Result<OtpProgress> {
        self.otp
            .write_packet(registry, B::OTP_ADDRESS, B::OTP_VERSION, first, data)
    }

    /// Start an OTP read, returns the header `(version, global_state)`.
    pub fn otp_begin_read(&mut self, registry: &MemoryRegistry<'_>) -> (u32, u32) {
        self.otp.begin_read(registry, B::OTP_ADDRESS)
    }

    /// Next OTP word of the current read, zero past the partition.
    pub fn otp_next_word(&mut self, registry: &MemoryRegistry<'_>) -> u32 {
        self.otp.next_word(registry, B::OTP_ADDRESS)
    }

    /// Rewind the OTP read.
    pub fn otp_reset_read(&mut self) {
        self.otp.reset_read();
    }
}
