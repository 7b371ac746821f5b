//! Error types shared by the registry, the session and both dispatchers.

use core::fmt;

/// Reasons a flash layout text is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// A row does not have exactly six tab separated fields
    FieldCount {
        /// Zero based row number, comments included
        row: usize,
    },
    /// `id` or `offset` is not a valid unsigned number
    Number {
        /// Zero based row number, comments included
        row: usize,
    },
    /// A text field is longer than the entry can hold
    FieldTooLong {
        /// Zero based row number, comments included
        row: usize,
    },
    /// More partitions than the table capacity
    TooManyPartitions,
    /// Layout text is not valid UTF-8
    Encoding,
    /// Layout text does not fit the receive buffer
    TooLarge,
}

/// Core error type, `no_std` and `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Wire errors
    /// Checksum or complement byte does not match
    ChecksumMismatch,
    /// Length field is out of range for the command
    InvalidLength,
    /// Unknown sub-opcode or special command
    UnsupportedSubcommand,

    // Address errors
    /// No registered memory contains the address
    AddressOutOfRange,
    /// Write address went backwards inside the external memory range
    OutOfOrderWrite,

    // Memory errors
    /// External memory initialization failed
    MemoryInitFailure,
    /// Readback after write differs
    VerifyMismatch {
        /// First mismatching address reported by the driver
        address: u32,
    },
    /// The memory has no driver capability for the requested operation
    MissingCapability,

    // Registry errors
    /// Registry has no free slot
    CapacityExceeded,
    /// Descriptor range overlaps an already registered one
    OverlappingRange,

    // Layout errors
    /// Flash layout text was refused, table discarded
    Layout(LayoutError),
    /// Partition interface is not `none`, `nor` or `mmc`
    UnsupportedInterface,

    // OTP errors
    /// OTP header carries an unexpected version
    OtpVersionMismatch {
        /// Version found in the header
        found: u32,
    },
    /// OTP packet received while no write is in progress
    OtpWriteAborted,

    // Policy errors
    /// Device is readout protected
    ReadoutProtected,
}

impl From<LayoutError> for Error {
    fn from(e: LayoutError) -> Self {
        Error::Layout(e)
    }
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldCount { row } => write!(f, "row {}: expected 6 fields", row),
            Self::Number { row } => write!(f, "row {}: invalid number", row),
            Self::FieldTooLong { row } => write!(f, "row {}: field too long", row),
            Self::TooManyPartitions => write!(f, "too many partitions"),
            Self::Encoding => write!(f, "layout is not valid text"),
            Self::TooLarge => write!(f, "layout too large"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::InvalidLength => write!(f, "invalid length"),
            Self::UnsupportedSubcommand => write!(f, "unsupported subcommand"),
            Self::AddressOutOfRange => write!(f, "address out of range"),
            Self::OutOfOrderWrite => write!(f, "write address went backwards"),
            Self::MemoryInitFailure => write!(f, "memory initialization failed"),
            Self::VerifyMismatch { address } => {
                write!(f, "verify failed at 0x{:08X}", address)
            }
            Self::MissingCapability => write!(f, "memory does not support the operation"),
            Self::CapacityExceeded => write!(f, "memory registry is full"),
            Self::OverlappingRange => write!(f, "memory range overlaps a registered one"),
            Self::Layout(e) => write!(f, "flash layout: {}", e),
            Self::UnsupportedInterface => write!(f, "unsupported partition interface"),
            Self::OtpVersionMismatch { found } => {
                write!(f, "OTP version 0x{:08X} not supported", found)
            }
            Self::OtpWriteAborted => write!(f, "OTP write aborted"),
            Self::ReadoutProtected => write!(f, "readout protection is active"),
        }
    }
}

/// Result type alias using the crate error.
pub type Result<T> = core::result::Result<T, Error>;
