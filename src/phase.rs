//! Download phases and the sequencer that walks them.
//!
//! The sequence is fixed at the start and then follows the flash layout:
//!
//! ```text
//! FlashLayout -> Phase3 -> Phase4 -> [Phase5] -> user partitions -> End
//! ```
//!
//! Phase5 is offered when rows follow the Phase4 row. User partitions are
//! every row of the table, in table order, whose id is not reserved, so
//! their position relative to the Phase4 and Phase5 rows does not matter.
//!
//! Both transports query the same [`PhaseSequencer`], so a given layout
//! always yields the same phases and destinations.

use log::{debug, warn};

use crate::board::Board;
use crate::error::{Error, Result};
use crate::layout::FlashLayout;
use crate::mem::MemoryRegistry;

const ID_FLASHLAYOUT: u8 = 0x00;
const ID_PHASE_3: u8 = 0x03;
const ID_PHASE_4: u8 = 0x04;
const ID_PHASE_5: u8 = 0x05;
const ID_CMD: u8 = 0xF1;
const ID_OTP: u8 = 0xF2;
const ID_END: u8 = 0xFE;

/// A download phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Flash layout text
    FlashLayout,
    /// Loader image
    Phase3,
    /// First external memory image
    Phase4,
    /// Second external memory image
    Phase5,
    /// Command channel (USB only)
    Cmd,
    /// OTP partition
    Otp,
    /// Nothing left to download
    End,
    /// Partition declared by the flash layout
    User(u8),
}

impl Phase {
    /// Wire id of the phase.
    pub fn id(self) -> u8 {
        match self {
            Phase::FlashLayout => ID_FLASHLAYOUT,
            Phase::Phase3 => ID_PHASE_3,
            Phase::Phase4 => ID_PHASE_4,
            Phase::Phase5 => ID_PHASE_5,
            Phase::Cmd => ID_CMD,
            Phase::Otp => ID_OTP,
            Phase::End => ID_END,
            Phase::User(id) => id,
        }
    }

    /// Phase for a wire id.
    pub fn from_id(id: u8) -> Self {
        match id {
            ID_FLASHLAYOUT => Phase::FlashLayout,
            ID_PHASE_3 => Phase::Phase3,
            ID_PHASE_4 => Phase::Phase4,
            ID_PHASE_5 => Phase::Phase5,
            ID_CMD => Phase::Cmd,
            ID_OTP => Phase::Otp,
            ID_END => Phase::End,
            id => Phase::User(id),
        }
    }

    /// `true` for ids the layout cannot use for user partitions.
    fn is_reserved(id: u32) -> bool {
        match u8::try_from(id) {
            Ok(id) => id <= ID_PHASE_5 || !matches!(Self::from_id(id), Phase::User(_)),
            Err(_) => true,
        }
    }
}

/// A phase and where its data goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStep {
    /// The phase
    pub phase: Phase,
    /// Destination address of its data
    pub destination: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    FlashLayout,
    Phase3,
    Phase4,
    Phase5,
    Partition,
    End,
}

/// Walks the download phases of a session.
#[derive(Debug, Clone)]
pub struct PhaseSequencer {
    next: Next,
    cursor: usize,
}

impl Default for PhaseSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseSequencer {
    /// Sequencer positioned on [`Phase::FlashLayout`].
    pub const fn new() -> Self {
        Self {
            next: Next::FlashLayout,
            cursor: 0,
        }
    }

    /// Resolve the next phase and move past it.
    ///
    /// If external memory initialization fails the sequencer does not move,
    /// the same phase is resolved again on the next call.
    pub fn advance<B: Board>(
        &mut self,
        layout: &FlashLayout,
        registry: &MemoryRegistry<'_>,
    ) -> Result<PhaseStep> {
        let step = match self.next {
            Next::FlashLayout => {
                self.next = Next::Phase3;
                PhaseStep {
                    phase: Phase::FlashLayout,
                    destination: B::FLASHLAYOUT_ADDRESS,
                }
            }
            Next::Phase3 => {
                self.next = Next::Phase4;
                PhaseStep {
                    phase: Phase::Phase3,
                    destination: B::FLASH_LOADER_WRITE_ADDRESS,
                }
            }
            Next::Phase4 => {
                let found = layout.find(ID_PHASE_4 as u32).map(|(index, _)| index);
                let destination = external_destination::<B>(layout, ID_PHASE_4);
                if found.is_some() && !registry.init(destination) {
                    warn!("external memory init failed at 0x{:08X}", destination);
                    return Err(Error::MemoryInitFailure);
                }
                self.cursor = 0;
                self.next = match found {
                    Some(index) if index + 1 < layout.len() => Next::Phase5,
                    _ => Next::Partition,
                };
                PhaseStep {
                    phase: Phase::Phase4,
                    destination,
                }
            }
            Next::Phase5 => {
                self.next = Next::Partition;
                PhaseStep {
                    phase: Phase::Phase5,
                    destination: external_destination::<B>(layout, ID_PHASE_5),
                }
            }
            Next::Partition => return self.next_partition::<B>(layout, registry),
            Next::End => PhaseStep {
                phase: Phase::End,
                destination: B::UNDEF_ADDRESS,
            },
        };
        debug!("phase 0x{:02X} -> 0x{:08X}", step.phase.id(), step.destination);
        Ok(step)
    }

    fn next_partition<B: Board>(
        &mut self,
        layout: &FlashLayout,
        registry: &MemoryRegistry<'_>,
    ) -> Result<PhaseStep> {
        while let Some(entry) = layout.get(self.cursor) {
            if Phase::is_reserved(entry.id) {
                self.cursor += 1;
                continue;
            }

            let destination = match entry.interface.as_str() {
                "none" => B::RAM_WRITE_ADDRESS,
                "nor" | "mmc" => entry.offset,
                other => {
                    warn!("partition 0x{:02X}: unsupported interface {}", entry.id, other);
                    self.cursor += 1;
                    return Err(Error::UnsupportedInterface);
                }
            };

            if !registry.init(destination) {
                warn!("memory init failed at 0x{:08X}", destination);
                return Err(Error::MemoryInitFailure);
            }

            self.cursor += 1;
            let step = PhaseStep {
                phase: Phase::User(entry.id as u8),
                destination,
            };
            debug!("phase 0x{:02X} -> 0x{:08X}", step.phase.id(), step.destination);
            return Ok(step);
        }

        self.next = Next::End;
        Ok(PhaseStep {
            phase: Phase::End,
            destination: B::UNDEF_ADDRESS,
        })
    }
}

/// Destination of a fixed phase, without any side effect.
///
/// Used by transports that address phases directly.
pub fn destination<B: Board>(phase: Phase, layout: &FlashLayout) -> u32 {
    match phase {
        Phase::FlashLayout => B::FLASHLAYOUT_ADDRESS,
        Phase::Phase3 => B::FLASH_LOADER_WRITE_ADDRESS,
        Phase::Phase4 => external_destination::<B>(layout, ID_PHASE_4),
        Phase::Phase5 => external_destination::<B>(layout, ID_PHASE_5),
        Phase::Otp => B::OTP_ADDRESS,
        Phase::Cmd | Phase::End => B::UNDEF_ADDRESS,
        Phase::User(id) => match layout.find(id as u32) {
            Some((_, entry)) if entry.interface.as_str() == "none" => B::RAM_WRITE_ADDRESS,
            Some((_, entry)) => entry.offset,
            None => B::UNDEF_ADDRESS,
        },
    }
}

fn external_destination<B: Board>(layout: &FlashLayout, id: u8) -> u32 {
    match layout.find(id as u32) {
        Some((_, entry)) => B::EXT_MEMORY_START_ADDRESS.wrapping_add(entry.offset),
        None => B::UNDEF_ADDRESS,
    }
}
