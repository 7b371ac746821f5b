//! Board configuration and device policy hooks.

use heapless::Vec;

use crate::error::{Error, Result};

/// Size of the first special command buffer.
pub const SPECIAL_BUFFER1_SIZE: usize = 128;

/// Size of the second special command buffer, used by extended special commands.
pub const SPECIAL_BUFFER2_SIZE: usize = 1024;

/// Maximum size of a special command reply.
pub const SPECIAL_REPLY_SIZE: usize = 128;

/// Which special command opcode the host sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    /// `SpecialCommand`, one buffer
    Special,
    /// `ExtendedSpecialCommand`, command buffer plus data buffer
    Extended,
}

/// A special command as received from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialCommand {
    /// Command variant
    pub kind: SpecialKind,
    /// Board defined sub-opcode
    pub opcode: u16,
    /// First payload
    pub buffer1: Vec<u8, SPECIAL_BUFFER1_SIZE>,
    /// Second payload, empty for [`SpecialKind::Special`]
    pub buffer2: Vec<u8, SPECIAL_BUFFER2_SIZE>,
}

/// Bytes a special command sends back before the final ACK.
pub type SpecialReply = Vec<u8, SPECIAL_REPLY_SIZE>;

/// Device specific configuration and policy.
///
/// Addresses describe where each download phase lands. The hooks are
/// the only place where protection state changes, the core just calls them.
pub trait Board {
    /// Where the flash layout text is written
    const FLASHLAYOUT_ADDRESS: u32;

    /// Where the Phase3 loader image is written
    const FLASH_LOADER_WRITE_ADDRESS: u32;

    /// Destination of user partitions with interface `none`
    const RAM_WRITE_ADDRESS: u32;

    /// First address of the external memory window
    const EXT_MEMORY_START_ADDRESS: u32;

    /// Last address of the external memory window (inclusive)
    const EXT_MEMORY_END_ADDRESS: u32;

    /// Erase granularity of the external memory
    const EXT_MEMORY_SECTOR_SIZE: u32;

    /// Address of the OTP area in the registry
    const OTP_ADDRESS: u32;

    /// Version word the OTP header must carry
    const OTP_VERSION: u32;

    /// Memory used by mass erase, page erase and protection commands
    const DEFAULT_MEMORY_ADDRESS: u32;

    /// Page size used by the page list erase
    const FLASH_PAGE_SIZE: u32;

    /// Address reported for phases that have no destination. Default: `0xFFFF_FFFF`.
    const UNDEF_ADDRESS: u32 = 0xFFFF_FFFF;

    /// Size of the signature in front of the layout text. Default: `256` bytes.
    const LAYOUT_SIGNATURE_SIZE: usize = 256;

    /// Product id returned by `GetId`
    const DEVICE_ID: u16;

    /// Protocol version returned by `Get` and `GetVersion`. Default: `0x31`.
    const PROTOCOL_VERSION: u8 = 0x31;

    /// Opcodes accepted by `SpecialCommand`
    const SPECIAL_OPCODES: &'static [u16] = &[];

    /// Opcodes accepted by `ExtendedSpecialCommand`
    const EXTENDED_SPECIAL_OPCODES: &'static [u16] = &[];

    /// `true` while reads and downloads must be refused.
    fn readout_protected(&self) -> bool {
        false
    }

    /// Change readout protection. Usually followed by a system reset.
    fn set_readout_protection(&mut self, _enable: bool) -> Result<()> {
        Err(Error::UnsupportedSubcommand)
    }

    /// Change write protection of the listed sectors, all when `sectors` is empty.
    fn set_write_protection(&mut self, _enable: bool, _sectors: &[u8]) -> Result<()> {
        Err(Error::UnsupportedSubcommand)
    }

    /// Run a special command.
    fn special_command(&mut self, _command: &SpecialCommand) -> Result<SpecialReply> {
        Err(Error::UnsupportedSubcommand)
    }
}
