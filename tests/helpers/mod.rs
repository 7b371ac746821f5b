#![allow(dead_code)]
use std::cell::{Cell, RefCell};

use phaseboot::board::{SpecialCommand, SpecialReply};
use phaseboot::mem::{AreaType, Capabilities, MemoryDescriptor, MemoryDriver};
use phaseboot::{Board, DFUBoard, Error, MemoryRegistry};
use usb_device::class::UsbClass;
use usbd_class_tester::prelude::*;

// State
pub const APP_IDLE: u8 = 0;
pub const APP_DETACH: u8 = 1;
pub const DFU_IDLE: u8 = 2;
pub const DFU_DNLOAD_SYNC: u8 = 3;
pub const DFU_DN_BUSY: u8 = 4;
pub const DFU_DNLOAD_IDLE: u8 = 5;
pub const DFU_MANIFEST_SYNC: u8 = 6;
pub const DFU_MANIFEST: u8 = 7;
pub const DFU_MANIFEST_WAIT_RESET: u8 = 8;
pub const DFU_UPLOAD_IDLE: u8 = 9;
pub const DFU_ERROR: u8 = 10;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR_TARGET: u8 = 0x01;
pub const STATUS_ERR_FILE: u8 = 0x02;
pub const STATUS_ERR_WRITE: u8 = 0x03;
pub const STATUS_ERR_ERASE: u8 = 0x04;
pub const STATUS_ERR_CHECK_ERASED: u8 = 0x05;
pub const STATUS_ERR_PROG: u8 = 0x06;
pub const STATUS_ERR_VERIFY: u8 = 0x07;
pub const STATUS_ERR_ADDRESS: u8 = 0x08;
pub const STATUS_ERR_NOTDONE: u8 = 0x09;
pub const STATUS_ERR_FIRMWARE: u8 = 0x0A;
pub const STATUS_ERR_VENDOR: u8 = 0x0B;
pub const STATUS_ERR_USBR: u8 = 0x0C;
pub const STATUS_ERR_POR: u8 = 0x0D;
pub const STATUS_ERR_UNKNOWN: u8 = 0x0E;
pub const STATUS_ERR_STALLED_PKT: u8 = 0x0F;

// Memory map
pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: u32 = 0x8000;
pub const PAGE_SIZE: u32 = 0x800;
pub const RAM_BASE: u32 = 0x2000_0000;
pub const RAM_SIZE: u32 = 0x1_0000;
pub const LOADER_ADDRESS: u32 = 0x2000_4000;
pub const RAM_WRITE_ADDRESS: u32 = 0x2000_8000;
pub const EXT_BASE: u32 = 0x7000_0000;
pub const EXT_SIZE: u32 = 0x1_0000;
pub const SECTOR_SIZE: u32 = 0x1000;
pub const OTP_BASE: u32 = 0x0BFA_0000;
pub const OTP_SIZE: u32 = 0x200;
pub const OTP_VERSION: u32 = 0x0100_0000;
pub const UNDEF: u32 = 0xFFFF_FFFF;

pub const SPECIAL_OPCODE: u16 = 0x0102;
pub const EXTENDED_SPECIAL_OPCODE: u16 = 0x0203;

/// Memory backed by a host buffer that records what the core asked for.
pub struct SimMemory {
    base: u32,
    caps: Capabilities,
    data: RefCell<Vec<u8>>,
    pub init_ok: Cell<bool>,
    pub inits: Cell<usize>,
    pub writes: Cell<usize>,
    pub erases: RefCell<Vec<(u32, u32)>>,
    pub mass_erases: Cell<usize>,
    pub jumps: RefCell<Vec<u32>>,
    /// Address whose byte is stored inverted, to fail verification
    pub stuck: Cell<Option<u32>>,
}

impl SimMemory {
    pub fn new(base: u32, size: u32, caps: Capabilities) -> Self {
        Self {
            base,
            caps,
            data: RefCell::new(vec![0xFF; size as usize]),
            init_ok: Cell::new(true),
            inits: Cell::new(0),
            writes: Cell::new(0),
            erases: RefCell::new(Vec::new()),
            mass_erases: Cell::new(0),
            jumps: RefCell::new(Vec::new()),
            stuck: Cell::new(None),
        }
    }

    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    pub fn bytes(&self, address: u32, len: usize) -> Vec<u8> {
        let offset = (address - self.base) as usize;
        self.data.borrow()[offset..offset + len].to_vec()
    }

    pub fn fill(&self, address: u32, bytes: &[u8]) {
        let offset = (address - self.base) as usize;
        self.data.borrow_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn erase_count(&self) -> usize {
        self.erases.borrow().len()
    }
}

impl MemoryDriver for SimMemory {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn init(&self, _address: u32) -> bool {
        self.inits.set(self.inits.get() + 1);
        self.init_ok.get()
    }

    fn read(&self, address: u32) -> u8 {
        let offset = (address - self.base) as usize;
        self.data.borrow().get(offset).copied().unwrap_or(0)
    }

    fn write(&self, address: u32, data: &[u8]) {
        self.writes.set(self.writes.get() + 1);
        let offset = (address - self.base) as usize;
        let mut mem = self.data.borrow_mut();
        mem[offset..offset + data.len()].copy_from_slice(data);
        if let Some(stuck) = self.stuck.get() {
            if stuck >= address && stuck < address + data.len() as u32 {
                let i = (stuck - self.base) as usize;
                mem[i] = !mem[i];
            }
        }
    }

    fn sector_erase(&self, start: u32, end: u32) {
        self.erases.borrow_mut().push((start, end));
        let from = (start - self.base) as usize;
        let to = (end - self.base) as usize;
        self.data.borrow_mut()[from..to].fill(0xFF);
    }

    fn mass_erase(&self, _address: u32) {
        self.mass_erases.set(self.mass_erases.get() + 1);
        self.data.borrow_mut().fill(0xFF);
    }

    fn verify(&self, address: u32, data: &[u8], _seed: u32) -> u32 {
        let offset = (address - self.base) as usize;
        let mem = self.data.borrow();
        data.iter()
            .zip(&mem[offset..])
            .position(|(a, b)| a != b)
            .map_or(0, |i| address + i as u32)
    }

    fn jump_to(&self, address: u32) {
        self.jumps.borrow_mut().push(address);
    }
}

/// The memories of the test board.
#[derive(Clone, Copy)]
pub struct Memories {
    pub flash: &'static SimMemory,
    pub ram: &'static SimMemory,
    pub ext: &'static SimMemory,
    pub otp: &'static SimMemory,
}

impl Memories {
    pub fn new() -> Self {
        Self {
            flash: SimMemory::new(FLASH_BASE, FLASH_SIZE, Capabilities::all()).leak(),
            ram: SimMemory::new(
                RAM_BASE,
                RAM_SIZE,
                Capabilities::INIT
                    | Capabilities::READ
                    | Capabilities::WRITE
                    | Capabilities::JUMP,
            )
            .leak(),
            ext: SimMemory::new(
                EXT_BASE,
                EXT_SIZE,
                Capabilities::INIT
                    | Capabilities::READ
                    | Capabilities::WRITE
                    | Capabilities::SECTOR_ERASE
                    | Capabilities::VERIFY,
            )
            .leak(),
            otp: SimMemory::new(OTP_BASE, OTP_SIZE, Capabilities::READ | Capabilities::WRITE)
                .leak(),
        }
    }

    pub fn registry(&self) -> MemoryRegistry<'static> {
        let mut registry = MemoryRegistry::new();
        registry
            .register(MemoryDescriptor::new(FLASH_BASE, FLASH_SIZE, AreaType::Flash, self.flash))
            .unwrap();
        registry
            .register(MemoryDescriptor::new(RAM_BASE, RAM_SIZE, AreaType::Ram, self.ram))
            .unwrap();
        registry
            .register(MemoryDescriptor::new(EXT_BASE, EXT_SIZE, AreaType::Flash, self.ext))
            .unwrap();
        registry
            .register(MemoryDescriptor::new(OTP_BASE, OTP_SIZE, AreaType::Otp, self.otp))
            .unwrap();
        registry
    }
}

#[derive(Default)]
pub struct TestBoard {
    pub protected: bool,
    pub write_protected: Vec<u8>,
    pub specials: Vec<SpecialCommand>,
}

impl Board for TestBoard {
    const FLASHLAYOUT_ADDRESS: u32 = RAM_BASE;
    const FLASH_LOADER_WRITE_ADDRESS: u32 = LOADER_ADDRESS;
    const RAM_WRITE_ADDRESS: u32 = RAM_WRITE_ADDRESS;
    const EXT_MEMORY_START_ADDRESS: u32 = EXT_BASE;
    const EXT_MEMORY_END_ADDRESS: u32 = EXT_BASE + EXT_SIZE - 1;
    const EXT_MEMORY_SECTOR_SIZE: u32 = SECTOR_SIZE;
    const OTP_ADDRESS: u32 = OTP_BASE;
    const OTP_VERSION: u32 = OTP_VERSION;
    const DEFAULT_MEMORY_ADDRESS: u32 = FLASH_BASE;
    const FLASH_PAGE_SIZE: u32 = PAGE_SIZE;
    const DEVICE_ID: u16 = 0x0482;
    const SPECIAL_OPCODES: &'static [u16] = &[SPECIAL_OPCODE];
    const EXTENDED_SPECIAL_OPCODES: &'static [u16] = &[EXTENDED_SPECIAL_OPCODE];

    fn readout_protected(&self) -> bool {
        self.protected
    }

    fn set_readout_protection(&mut self, enable: bool) -> Result<(), Error> {
        self.protected = enable;
        Ok(())
    }

    fn set_write_protection(&mut self, enable: bool, sectors: &[u8]) -> Result<(), Error> {
        if enable {
            self.write_protected = sectors.to_vec();
        } else {
            self.write_protected.clear();
        }
        Ok(())
    }

    fn special_command(&mut self, command: &SpecialCommand) -> Result<SpecialReply, Error> {
        self.specials.push(command.clone());
        let mut reply = SpecialReply::new();
        for b in command.buffer1.iter().rev() {
            reply.push(*b).unwrap();
        }
        Ok(reply)
    }
}

impl DFUBoard for TestBoard {
    const BLOCK_PROGRAM_TIME_MS: u32 = 5;
    const PAGE_ERASE_TIME_MS: u32 = 10;
    const FULL_ERASE_TIME_MS: u32 = 20;
    const MANIFESTATION_TIME_MS: u32 = 0x123;
    const TRANSFER_SIZE: u16 = 128;
}

/// Layout with Phase3, Phase4 and Phase5 partitions.
pub const LAYOUT: &str = "#Opt\tId\tName\tType\tIP\tOffset\n\
P\t0x03\tssbl\tBinary\tnone\t0x0\n\
P\t0x04\tfip\tFIP\tnor\t0x2000\n\
P\t0x05\tdata\tBinary\tnor\t0x8000\n";

/// Layout payload as the host sends it: signature, then text.
pub fn layout_payload(text: &str) -> Vec<u8> {
    let mut payload = vec![0xA5; 256];
    payload.extend_from_slice(text.as_bytes());
    payload
}

/// OTP partition payload: header then `words`.
pub fn otp_payload(version: u32, global_state: u32, words: &[u32]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&version.to_le_bytes());
    payload.extend_from_slice(&global_state.to_le_bytes());
    for w in words {
        payload.extend_from_slice(&w.to_le_bytes());
    }
    payload
}

pub trait DeviceExt<C> {
    fn upload(&mut self, cls: &mut C, block_num: u16, length: usize) -> AnyResult<Vec<u8>>;

    fn read(
        &mut self,
        cls: &mut C,
        req: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> AnyResult<Vec<u8>>;
    fn write(
        &mut self,
        cls: &mut C,
        req: u8,
        value: u16,
        index: u16,
        length: u16,
        data: &[u8],
    ) -> AnyResult<Vec<u8>>;

    fn set_alternate(&mut self, cls: &mut C, alt: u8) -> AnyResult<Vec<u8>>;
    fn download(&mut self, cls: &mut C, block_num: u16, data: &[u8]) -> AnyResult<Vec<u8>>;
    fn get_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;
    fn clear_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;
    fn get_state(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;
    fn abort(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;
}

impl<'a, C, M> DeviceExt<C> for Device<'a, C, M>
where
    C: UsbClass<EmulatedUsbBus>,
    M: UsbDeviceCtx<C<'a> = C>,
{
    fn read(
        &mut self,
        cls: &mut C,
        req: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> AnyResult<Vec<u8>> {
        self.control_read(
            cls,
            CtrRequestType::to_host().class().interface(),
            req,
            value,
            index,
            length,
        )
    }

    fn write(
        &mut self,
        cls: &mut C,
        req: u8,
        value: u16,
        index: u16,
        length: u16,
        data: &[u8],
    ) -> AnyResult<Vec<u8>> {
        self.control_write(
            cls,
            CtrRequestType::to_device().class().interface(),
            req,
            value,
            index,
            length,
            data,
        )
    }

    fn set_alternate(&mut self, cls: &mut C, alt: u8) -> AnyResult<Vec<u8>> {
        // SET_INTERFACE
        self.control_write(
            cls,
            CtrRequestType::to_device().standard().interface(),
            0x0B,
            alt as u16,
            0,
            0,
            &[],
        )
    }

    fn download(&mut self, cls: &mut C, block_num: u16, data: &[u8]) -> AnyResult<Vec<u8>> {
        if data.len() > u16::MAX as usize {
            return Err(AnyUsbError::DataConversion);
        }
        self.write(cls, 0x1, block_num, 0, data.len() as u16, data)
    }

    fn upload(&mut self, cls: &mut C, block_num: u16, length: usize) -> AnyResult<Vec<u8>> {
        if length > u16::MAX as usize {
            return Err(AnyUsbError::DataConversion);
        }
        self.read(cls, 0x2, block_num, 0, length as u16)
    }

    fn get_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.read(cls, 0x3, 0, 0, 6)
    }

    fn clear_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.write(cls, 0x4, 0, 0, 0, &[])
    }

    fn get_state(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.read(cls, 0x5, 0, 0, 1)
    }

    fn abort(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.write(cls, 0x6, 0, 0, 0, &[])
    }
}

pub fn status(status: u8, poll_timeout: u32, state: u8) -> [u8; 6] {
    let t = poll_timeout.to_le_bytes();
    [status, t[0], t[1], t[2], state, 0]
}
