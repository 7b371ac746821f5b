//! Memory registry: maps addresses to memory drivers.
//!
//! Each registered [`MemoryDescriptor`] covers `[start, end)`. Lookups are
//! linear and the first matching range wins. Operations on a memory whose
//! driver lacks the needed [`Capabilities`] are no-ops that return a default.

use bitflags::bitflags;
use heapless::Vec;
use log::{debug, warn};

use crate::error::{Error, Result};

/// Maximum number of memories a registry holds.
pub const MAX_MEMORIES: usize = 7;

bitflags! {
    /// Operations a memory driver implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        /// [`MemoryDriver::init`]
        const INIT         = 1 << 0;
        /// [`MemoryDriver::read`]
        const READ         = 1 << 1;
        /// [`MemoryDriver::write`]
        const WRITE        = 1 << 2;
        /// [`MemoryDriver::jump_to`]
        const JUMP         = 1 << 3;
        /// [`MemoryDriver::mass_erase`]
        const MASS_ERASE   = 1 << 4;
        /// [`MemoryDriver::sector_erase`]
        const SECTOR_ERASE = 1 << 5;
        /// [`MemoryDriver::verify`]
        const VERIFY       = 1 << 6;
    }
}

/// Kind of memory area a descriptor covers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaType {
    /// Address is not covered by any memory
    Error = 0,
    /// Internal flash
    Flash = 1,
    /// RAM
    Ram = 2,
    /// Option bytes
    OptionBytes = 3,
    /// One-time-programmable words
    Otp = 4,
    /// System memory (bootloader ROM area)
    SystemMemory = 5,
    /// Engineering bytes
    EngiBytes = 6,
}

/// Register-level access to one memory.
///
/// Only the methods whose flag is present in [`capabilities()`](MemoryDriver::capabilities)
/// are ever called by the registry. Drivers take `&self`, hardware access
/// and test doubles use interior mutability.
pub trait MemoryDriver {
    /// Operations this driver supports.
    fn capabilities(&self) -> Capabilities;

    /// Bring the memory up, e.g. probe an external NOR.
    fn init(&self, _address: u32) -> bool {
        false
    }

    /// Read one byte.
    fn read(&self, _address: u32) -> u8 {
        0
    }

    /// Program `data` at `address`.
    fn write(&self, _address: u32, _data: &[u8]) {}

    /// Erase every sector touching `[start, end)`.
    fn sector_erase(&self, _start: u32, _end: u32) {}

    /// Erase the whole memory.
    fn mass_erase(&self, _address: u32) {}

    /// Compare memory at `address` with `data`.
    ///
    /// Returns the address of the first mismatch or `0`.
    fn verify(&self, _address: u32, _data: &[u8], _seed: u32) -> u32 {
        0
    }

    /// Start the image at `address`. Does not return on hardware.
    fn jump_to(&self, _address: u32) {}
}

/// One memory known to the registry.
#[derive(Clone, Copy)]
pub struct MemoryDescriptor<'d> {
    /// First address of the memory
    pub start: u32,
    /// One past the last address of the memory
    pub end: u32,
    /// Size in bytes
    pub size: u32,
    /// What kind of memory this is
    pub area: AreaType,
    /// Driver, `None` for a memory that only reserves an address range
    pub driver: Option<&'d dyn MemoryDriver>,
}

impl<'d> MemoryDescriptor<'d> {
    /// Descriptor for `[start, start + size)`.
    pub fn new(start: u32, size: u32, area: AreaType, driver: &'d dyn MemoryDriver) -> Self {
        Self {
            start,
            end: start.saturating_add(size),
            size,
            area,
            driver: Some(driver),
        }
    }

    /// Descriptor with no driver.
    pub fn reserved(start: u32, size: u32, area: AreaType) -> Self {
        Self {
            start,
            end: start.saturating_add(size),
            size,
            area,
            driver: None,
        }
    }

    /// `true` if `address` is inside `[start, end)`.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end
    }

    fn overlaps(&self, other: &MemoryDescriptor<'_>) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn driver_with(&self, cap: Capabilities) -> Option<&'d dyn MemoryDriver> {
        self.driver
            .filter(|driver| driver.capabilities().contains(cap))
    }
}

/// Outcome of a dispatched operation that has no return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The driver ran the operation
    Done,
    /// No memory at the address, or its driver lacks the capability
    Skipped,
}

/// Bounded table of memories.
pub struct MemoryRegistry<'d> {
    memories: Vec<MemoryDescriptor<'d>, MAX_MEMORIES>,
}

impl<'d> Default for MemoryRegistry<'d> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d> MemoryRegistry<'d> {
    /// Empty registry.
    pub const fn new() -> Self {
        Self {
            memories: Vec::new(),
        }
    }

    /// Add a memory.
    ///
    /// Fails if the table is full or the range overlaps a registered memory.
    pub fn register(&mut self, descriptor: MemoryDescriptor<'d>) -> Result<()> {
        if self.memories.iter().any(|m| m.overlaps(&descriptor)) {
            warn!(
                "memory 0x{:08X}..0x{:08X} overlaps a registered range",
                descriptor.start, descriptor.end
            );
            return Err(Error::OverlappingRange);
        }
        self.memories
            .push(descriptor)
            .map_err(|_| Error::CapacityExceeded)?;
        debug!(
            "registered {:?} memory 0x{:08X}..0x{:08X}",
            descriptor.area, descriptor.start, descriptor.end
        );
        Ok(())
    }

    /// Number of registered memories.
    pub fn len(&self) -> usize {
        self.memories.len()
    }

    /// `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    /// Registered memories in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &MemoryDescriptor<'d>> {
        self.memories.iter()
    }

    /// Index of the first memory containing `address`.
    pub fn memory_index(&self, address: u32) -> Option<usize> {
        self.memories.iter().position(|m| m.contains(address))
    }

    fn find(&self, address: u32) -> Option<&MemoryDescriptor<'d>> {
        self.memories.iter().find(|m| m.contains(address))
    }

    /// Area type of the memory containing `address`, [`AreaType::Error`] if none.
    pub fn address_area(&self, address: u32) -> AreaType {
        self.find(address)
            .map(|m| m.area)
            .unwrap_or(AreaType::Error)
    }

    /// Initialize the memory containing `address`.
    pub fn init(&self, address: u32) -> bool {
        match self.find(address).and_then(|m| m.driver_with(Capabilities::INIT)) {
            Some(driver) => driver.init(address),
            None => false,
        }
    }

    /// Read one byte from memory number `index`.
    ///
    /// `0` if `index` is invalid or the memory cannot be read.
    pub fn read(&self, address: u32, index: usize) -> u8 {
        match self
            .memories
            .get(index)
            .and_then(|m| m.driver_with(Capabilities::READ))
        {
            Some(driver) => driver.read(address),
            None => 0,
        }
    }

    /// Program `data` at `address`.
    pub fn write(&self, address: u32, data: &[u8]) -> Dispatch {
        match self.find(address).and_then(|m| m.driver_with(Capabilities::WRITE)) {
            Some(driver) => {
                driver.write(address, data);
                Dispatch::Done
            }
            None => Dispatch::Skipped,
        }
    }

    /// Compare memory with `data`, returns first mismatching address or `0`.
    pub fn verify(&self, address: u32, data: &[u8], seed: u32) -> u32 {
        match self.find(address).and_then(|m| m.driver_with(Capabilities::VERIFY)) {
            Some(driver) => driver.verify(address, data, seed),
            None => 0,
        }
    }

    /// Erase sectors of the memory containing `address` between `start` and `end`.
    pub fn sector_erase(&self, address: u32, start: u32, end: u32) -> Dispatch {
        match self
            .find(address)
            .and_then(|m| m.driver_with(Capabilities::SECTOR_ERASE))
        {
            Some(driver) => {
                driver.sector_erase(start, end);
                Dispatch::Done
            }
            None => Dispatch::Skipped,
        }
    }

    /// Erase the whole memory containing `address`.
    pub fn mass_erase(&self, address: u32) -> Dispatch {
        match self
            .find(address)
            .and_then(|m| m.driver_with(Capabilities::MASS_ERASE))
        {
            Some(driver) => {
                driver.mass_erase(address);
                Dispatch::Done
            }
            None => Dispatch::Skipped,
        }
    }

    /// `true` if an image at `address` can be started.
    pub fn check_jump_address(&self, address: u32) -> bool {
        self.find(address)
            .and_then(|m| m.driver_with(Capabilities::JUMP))
            .is_some()
    }

    /// Hand control to the image at `address`.
    ///
    /// On hardware the driver does not return. Dispatchers never call this,
    /// they return [`Flow::Jump`](crate::Flow::Jump) to the main loop instead.
    pub fn jump_to_address(&self, address: u32) -> Dispatch {
        match self.find(address).and_then(|m| m.driver_with(Capabilities::JUMP)) {
            Some(driver) => {
                driver.jump_to(address);
                Dispatch::Done
            }
            None => Dispatch::Skipped,
        }
    }
}
