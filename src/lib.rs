#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! Device side core of a multi-phase bootloader.
//!
//! ## About
//!
//! A host reprograms the device memories in phases: it first sends a
//! flash layout (a text partition table), then a loader image, then the
//! images listed in the layout, and optionally an OTP partition. The
//! device answers every phase query with the destination address the
//! data will be written to.
//!
//! The same session logic is reachable over two transports:
//!
//! * [`serial::SerialDispatcher`] - byte stream commands with ACK/NACK
//!   framing over any `embedded-io` link.
//! * [`class::DFUClass`] - DFU 1.1a over a `usb-device` bus, one alternate
//!   setting per phase.
//!
//! This library is a protocol implementation only. Code that programs,
//! erases or reads memory is provided by the user as [`mem::MemoryDriver`]
//! implementations, device policy as a [`board::Board`].
//!
//! ### Supported operations
//!
//! * Phase query, download and start
//! * Memory and OTP partition read
//! * Mass erase and page erase
//! * Read/write protection changes, forwarded to the board
//! * Board specific special commands
//!
//! ### Limitations
//!
//! * At most 7 memories and 15 layout partitions.
//!
//! * DFU transfer size is limited to what `usb-device` supports
//! for control endpoint transfers, which is `128` bytes by default.
//!
//! * Writes into the external memory window must go forward, sectors are
//! erased once per session.
//!
//! ## Example
//!
//! ```no_run
//! use core::cell::RefCell;
//! use core::convert::Infallible;
//! use phaseboot::*;
//! use phaseboot::mem::{AreaType, Capabilities, MemoryDescriptor, MemoryDriver};
//! # struct Uart;
//! # impl embedded_io::ErrorType for Uart { type Error = Infallible; }
//! # impl embedded_io::Read for Uart {
//! #     fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> { Ok(buf.len()) }
//! # }
//! # impl embedded_io::Write for Uart {
//! #     fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> { Ok(buf.len()) }
//! #     fn flush(&mut self) -> Result<(), Infallible> { Ok(()) }
//! # }
//!
//! struct Ram(RefCell<[u8; 1024]>);
//!
//! impl MemoryDriver for Ram {
//!     fn capabilities(&self) -> Capabilities {
//!         Capabilities::READ | Capabilities::WRITE | Capabilities::JUMP
//!     }
//!
//!     fn read(&self, address: u32) -> u8 {
//!         self.0.borrow()[(address - 0x2000_0000) as usize]
//!     }
//!
//!     fn write(&self, address: u32, data: &[u8]) {
//!         let offset = (address - 0x2000_0000) as usize;
//!         self.0.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
//!     }
//! }
//!
//! struct MyBoard;
//!
//! impl Board for MyBoard {
//!     const FLASHLAYOUT_ADDRESS: u32 = 0x2000_0000;
//!     const FLASH_LOADER_WRITE_ADDRESS: u32 = 0x2000_0100;
//!     const RAM_WRITE_ADDRESS: u32 = 0x2000_0200;
//!     const EXT_MEMORY_START_ADDRESS: u32 = 0x7000_0000;
//!     const EXT_MEMORY_END_ADDRESS: u32 = 0x7FFF_FFFF;
//!     const EXT_MEMORY_SECTOR_SIZE: u32 = 0x1000;
//!     const OTP_ADDRESS: u32 = 0x0BFA_0000;
//!     const OTP_VERSION: u32 = 0x0100_0000;
//!     const DEFAULT_MEMORY_ADDRESS: u32 = 0x0800_0000;
//!     const FLASH_PAGE_SIZE: u32 = 0x2000;
//!     const DEVICE_ID: u16 = 0x0482;
//! }
//!
//! let ram = Ram(RefCell::new([0; 1024]));
//! let mut registry = MemoryRegistry::new();
//! registry
//!     .register(MemoryDescriptor::new(0x2000_0000, 1024, AreaType::Ram, &ram))
//!     .unwrap();
//!
//! let mut bootloader = SerialDispatcher::new(Uart, MyBoard, registry);
//! loop {
//!     match bootloader.poll() {
//!         Ok(Flow::Continue) => {}
//!         Ok(Flow::Jump(address)) => {
//!             bootloader.registry().jump_to_address(address);
//!             break;
//!         }
//!         Err(_) => break,
//!     }
//! }
//! ```
//!

pub mod board;
/// USB DFU transport
pub mod class;
pub mod error;
pub mod layout;
pub mod mem;
pub mod otp;
pub mod phase;
pub mod serial;
pub mod session;

#[doc(inline)]
pub use crate::board::Board;
#[doc(inline)]
pub use crate::class::{DFUBoard, DFUClass};
#[doc(inline)]
pub use crate::error::{Error, LayoutError};
#[doc(inline)]
pub use crate::mem::MemoryRegistry;
#[doc(inline)]
pub use crate::serial::SerialDispatcher;
#[doc(inline)]
pub use crate::session::{DownloadSession, Flow};
