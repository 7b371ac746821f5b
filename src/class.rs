use core::cmp::min;
use core::marker::PhantomData;
use heapless::Vec;
use log::{debug, info, warn};
use usb_device::{class_prelude::*, control::Request, LangID};

use crate::board::Board;
use crate::error::Error;
use crate::mem::{AreaType, Dispatch, MemoryRegistry};
use crate::phase::Phase;
use crate::session::DownloadSession;

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
const USB_SUBCLASS_DFU: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

const DFU_DNLOAD: u8 = 0x01;
const DFU_UPLOAD: u8 = 0x02;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_CLRSTATUS: u8 = 0x04;
const DFU_GETSTATE: u8 = 0x05;
const DFU_ABORT: u8 = 0x06;

const DESC_DESCTYPE_DFU: u8 = 0x21;

/// Number of alternate settings, one per addressable phase.
pub const ALTERNATES: usize = 6;

/// Largest supported [`TRANSFER_SIZE`](DFUBoard::TRANSFER_SIZE).
pub const MAX_TRANSFER_SIZE: usize = 1024;

/// Size of the phase reply on the command alternate.
const PHASE_REPLY_SIZE: usize = 9;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
enum DFUState {
    /// Device is running its normal application.
    #[allow(dead_code)]
    AppIdle = 0,
    /// Device is running its normal application, has received the DFU_DETACH request, and is waiting for a USB reset.
    #[allow(dead_code)]
    AppDetach = 1,
    /// Device is operating in the DFU mode and is waiting for requests.
    DfuIdle = 2,
    /// Device has received a block and is waiting for the host to solicit the status via DFU_GETSTATUS.
    DfuDnloadSync = 3,
    /// Device is programming a control-write block into its nonvolatile memories.
    DfuDnBusy = 4,
    /// Device is processing a download operation. Expecting DFU_DNLOAD requests.
    DfuDnloadIdle = 5,
    /// Device has received the final block and waits for DFU_GETSTATUS to begin manifestation.
    DfuManifestSync = 6,
    /// Device is in the Manifestation phase.
    DfuManifest = 7,
    /// Device has programmed its memories and is waiting for a USB reset or a power on reset.
    DfuManifestWaitReset = 8,
    /// The device is processing an upload operation. Expecting DFU_UPLOAD requests.
    DfuUploadIdle = 9,
    /// An error has occurred. Awaiting the DFU_CLRSTATUS request.
    DfuError = 10,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
enum DFUStatusCode {
    /// No error condition is present.
    OK = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File is for this device but fails some vendor-specific verification test.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase function failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    #[allow(dead_code)]
    ErrCheckErased = 0x05,
    /// Program memory function failed.
    #[allow(dead_code)]
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Cannot program memory due to received address that is out of range.
    ErrAddress = 0x08,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    #[allow(dead_code)]
    ErrNotdone = 0x09,
    /// Device’s firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    ErrFirmware = 0x0A,
    /// iString indicates a vendor-specific error.
    ErrVendor = 0x0B,
    /// Device detected unexpected USB reset signaling.
    ErrUsbr = 0x0C,
    /// Device detected unexpected power on reset.
    ErrPOR = 0x0D,
    /// Something went wrong, but the device does not know what it was.
    ErrUnknown = 0x0E,
    /// Device stalled an unexpected request.
    ErrStalledPkt = 0x0F,
}

#[repr(u8)]
enum DnloadCommand {
    GetCommands = 0x00,
    SetAddressPointer = 0x21,
    Erase = 0x41,
    ReadUnprotect = 0x92,
}

impl From<Error> for DFUStatusCode {
    fn from(e: Error) -> Self {
        match e {
            Error::ChecksumMismatch
            | Error::InvalidLength
            | Error::Layout(_)
            | Error::OtpVersionMismatch { .. }
            | Error::OtpWriteAborted => DFUStatusCode::ErrFile,
            Error::UnsupportedSubcommand
            | Error::UnsupportedInterface
            | Error::MemoryInitFailure => DFUStatusCode::ErrTarget,
            Error::AddressOutOfRange | Error::OutOfOrderWrite => DFUStatusCode::ErrAddress,
            Error::VerifyMismatch { .. } => DFUStatusCode::ErrVerify,
            Error::MissingCapability => DFUStatusCode::ErrWrite,
            Error::ReadoutProtected => DFUStatusCode::ErrVendor,
            Error::CapacityExceeded | Error::OverlappingRange => DFUStatusCode::ErrUnknown,
        }
    }
}

/// USB specific settings on top of [`Board`].
///
/// Timing constants are reported to the host in `DFU_GETSTATUS` replies,
/// the host waits that long before its next request.
pub trait DFUBoard: Board {
    /// Interface string of each alternate setting, in alternate order:
    /// flash layout, Phase3, Phase4, command, OTP, Phase5.
    ///
    /// Strings follow the `@name/address/area` form dfu-util understands.
    const ALT_STRINGS: [&'static str; ALTERNATES] = [
        "@FlashLayout /0x00/1*1Ke",
        "@Phase3 /0x03/1*16Me",
        "@Phase4 /0x04/1*16Me",
        "@virtual /0xF1/1*512Ba",
        "@OTP /0xF2/1*1Ke",
        "@Phase5 /0x05/1*16Me",
    ];

    /// If set, DFU descriptor will have *bitCanDnload* bit set. Default is `true`.
    const HAS_DOWNLOAD: bool = true;

    /// If set, DFU descriptor will have *bitCanUpload* bit set. Default is `true`.
    const HAS_UPLOAD: bool = true;

    /// If set, DFU descriptor will have *bitManifestationTolerant* bit set. Default is `true`.
    const MANIFESTATION_TOLERANT: bool = true;

    /// Time in milliseconds needed to program one block of [`TRANSFER_SIZE`](DFUBoard::TRANSFER_SIZE) bytes.
    const BLOCK_PROGRAM_TIME_MS: u32;

    /// Time in milliseconds needed to erase one page.
    const PAGE_ERASE_TIME_MS: u32;

    /// Time in milliseconds needed to erase the default memory.
    const FULL_ERASE_TIME_MS: u32;

    /// Time in milliseconds the host waits after the final zero length download. Default is `1` ms.
    const MANIFESTATION_TIME_MS: u32 = 1;

    /// wDetachTimeOut field in DFU descriptor. Default value: `250` ms.
    const DETACH_TIMEOUT: u16 = 250;

    /// Maximum transfer size. Default value: `128` bytes.
    ///
    /// **Warning**: must be less or equal of `usb-device`'s control endpoint buffer size,
    /// and at most [`MAX_TRANSFER_SIZE`].
    const TRANSFER_SIZE: u16 = 128;

    /// Called every time when USB is reset.
    fn usb_reset(&mut self) {}
}

/// Phase addressed by an alternate setting.
pub fn alternate_phase(alt: u8) -> Phase {
    match alt {
        0 => Phase::FlashLayout,
        1 => Phase::Phase3,
        2 => Phase::Phase4,
        3 => Phase::Cmd,
        4 => Phase::Otp,
        5 => Phase::Phase5,
        _ => Phase::End,
    }
}

/// DFU class that runs the download session over USB.
pub struct DFUClass<'d, B: UsbBus, P: DFUBoard> {
    if_num: InterfaceNumber,
    alt: u8,
    status: DFUStatus,
    alt_strings: [StringIndex; ALTERNATES],
    _bus: PhantomData<B>,
    board: P,
    registry: MemoryRegistry<'d>,
    session: DownloadSession<P>,
    buffer: Vec<u8, MAX_TRANSFER_SIZE>,
    phase_reported: bool,
    jump: Option<u32>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Command {
    None,
    EraseAll,
    EraseBlock(u32),
    SetAddressPointer(u32),
    ReadUnprotect,
    WriteMemory { block_num: u16, len: u16 },
    LeaveDFU,
}

#[derive(Clone, Copy)]
struct DFUStatus {
    status: DFUStatusCode,
    poll_timeout: u32,
    state: DFUState,
    address_pointer: u32,
    command: Command,
    pending: Command,
}

impl DFUStatus {
    pub fn new(addr: u32) -> Self {
        Self {
            status: DFUStatusCode::OK,
            poll_timeout: 0,
            state: DFUState::DfuIdle,
            address_pointer: addr,
            command: Command::None,
            pending: Command::None,
        }
    }

    fn new_state_ok(&mut self, state: DFUState) {
        self.new_state_status(state, DFUStatusCode::OK);
    }

    fn new_state_status(&mut self, state: DFUState, status: DFUStatusCode) {
        self.status = status;
        self.state = state;
    }

    fn fail(&mut self, e: Error) {
        warn!("dfu: {}", e);
        self.new_state_status(DFUState::DfuError, e.into());
    }

    fn state(&self) -> DFUState {
        self.state
    }
}

impl From<DFUStatus> for [u8; 6] {
    fn from(dfu: DFUStatus) -> Self {
        let t = dfu.poll_timeout.to_le_bytes();
        [
            // bStatus
            dfu.status as u8,
            // bwPollTimeout
            t[0],
            t[1],
            t[2],
            // bState
            dfu.state as u8,
            // iString
            0,
        ]
    }
}

impl<B: UsbBus, P: DFUBoard> UsbClass<B> for DFUClass<'_, B, P> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        for (alt, string) in self.alt_strings.iter().enumerate() {
            writer.interface_alt(
                self.if_num,
                alt as u8,
                USB_CLASS_APPLICATION_SPECIFIC,
                USB_SUBCLASS_DFU,
                USB_PROTOCOL_DFU_MODE,
                Some(*string),
            )?;
        }

        // DFU Functional descriptor
        writer.write(
            DESC_DESCTYPE_DFU,
            &[
                // bmAttributes
                // Bit 3: bitWillDetach
                0x8 |
                    // Bit 2: bitManifestationTolerant
                    (if P::MANIFESTATION_TOLERANT {0x4} else {0}) |
                    // Bit 1: bitCanUpload
                    (if P::HAS_UPLOAD {0x2} else {0}) |
                    // Bit 0: bitCanDnload
                    (if P::HAS_DOWNLOAD {0x1} else {0}),
                // wDetachTimeOut
                (P::DETACH_TIMEOUT & 0xff) as u8,
                (P::DETACH_TIMEOUT >> 8) as u8,
                // wTransferSize
                (P::TRANSFER_SIZE & 0xff) as u8,
                (P::TRANSFER_SIZE >> 8) as u8,
                // bcdDFUVersion
                0x1a,
                0x01,
            ],
        )
    }

    fn get_string(&self, index: StringIndex, _lang_id: LangID) -> Option<&str> {
        self.alt_strings
            .iter()
            .position(|s| *s == index)
            .map(|alt| P::ALT_STRINGS[alt])
    }

    fn get_alt_setting(&mut self, interface: InterfaceNumber) -> Option<u8> {
        if interface == self.if_num {
            Some(self.alt)
        } else {
            None
        }
    }

    fn set_alt_setting(&mut self, interface: InterfaceNumber, alternative: u8) -> bool {
        if interface == self.if_num && (alternative as usize) < ALTERNATES {
            debug!("dfu: alternate {}", alternative);
            self.alt = alternative;
            true
        } else {
            false
        }
    }

    // Handle control requests to the host.
    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if req.request_type != control::RequestType::Class {
            return;
        }

        if req.recipient != control::Recipient::Interface {
            return;
        }

        if req.index != u8::from(self.if_num) as u16 {
            return;
        }

        match req.request {
            DFU_UPLOAD => {
                self.upload(xfer, req);
            }
            DFU_GETSTATUS => {
                self.get_status(xfer, req);
            }
            DFU_GETSTATE => {
                self.get_state(xfer, req);
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }

    // Handle a control request from the host.
    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if req.request_type != control::RequestType::Class {
            return;
        }

        if req.recipient != control::Recipient::Interface {
            return;
        }

        if req.index != u8::from(self.if_num) as u16 {
            return;
        }

        match req.request {
            DFU_DNLOAD => {
                self.download(xfer, req);
            }
            DFU_CLRSTATUS => {
                self.clear_status(xfer);
            }
            DFU_ABORT => {
                self.abort(xfer);
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }

    fn reset(&mut self) {
        // may not return
        self.board.usb_reset();

        match self.status.state() {
            DFUState::DfuUploadIdle
            | DFUState::DfuDnloadIdle
            | DFUState::DfuDnloadSync
            | DFUState::DfuDnBusy
            | DFUState::DfuError
            | DFUState::DfuManifest
            | DFUState::DfuManifestSync => {
                self.status
                    .new_state_status(DFUState::DfuError, DFUStatusCode::ErrUsbr);
            }
            DFUState::DfuIdle
            | DFUState::AppDetach
            | DFUState::AppIdle
            | DFUState::DfuManifestWaitReset => {}
        }
    }

    fn poll(&mut self) {
        self.update_impl();
    }
}

impl<'d, B: UsbBus, P: DFUBoard> DFUClass<'d, B, P> {
    /// Creates a new DFUClass serving `registry` with a fresh session.
    pub fn new(alloc: &UsbBusAllocator<B>, board: P, registry: MemoryRegistry<'d>) -> Self {
        debug_assert!(P::TRANSFER_SIZE as usize <= MAX_TRANSFER_SIZE);
        Self {
            if_num: alloc.interface(),
            alt: 0,
            status: DFUStatus::new(P::DEFAULT_MEMORY_ADDRESS),
            alt_strings: core::array::from_fn(|_| alloc.string()),
            _bus: PhantomData,
            board,
            registry,
            session: DownloadSession::new(),
            buffer: Vec::new(),
            phase_reported: false,
            jump: None,
        }
    }

    /// Set DFU error state to "Device detected unexpected power on reset"
    /// instead of the usual `dfuIdle`.
    pub fn set_unexpected_reset_state(&mut self) {
        self.status
            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrPOR);
    }

    /// Set DFU error state to "Device’s firmware is corrupt"
    /// instead of the usual `dfuIdle`.
    pub fn set_firmware_corrupted_state(&mut self) {
        self.status
            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrFirmware);
    }

    /// Return current Address Pointer value.
    pub fn get_address_pointer(&self) -> u32 {
        self.status.address_pointer
    }

    /// Current alternate setting.
    pub fn alternate(&self) -> u8 {
        self.alt
    }

    /// Session state.
    pub fn session(&self) -> &DownloadSession<P> {
        &self.session
    }

    /// Registered memories.
    pub fn registry(&self) -> &MemoryRegistry<'d> {
        &self.registry
    }

    /// Board hooks.
    pub fn board(&self) -> &P {
        &self.board
    }

    /// Address to start once the host left DFU mode.
    ///
    /// The main loop should stop polling USB and hand control to
    /// [`MemoryRegistry::jump_to_address`] with the returned value.
    pub fn take_jump(&mut self) -> Option<u32> {
        self.jump.take()
    }

    fn clear_status(&mut self, xfer: ControlOut<B>) {
        match self.status.state() {
            DFUState::DfuError => {
                self.status.command = Command::None;
                self.status.pending = Command::None;
                self.status.new_state_ok(DFUState::DfuIdle);
                xfer.accept().ok();
            }
            _ => {
                self.status
                    .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
                xfer.reject().ok();
            }
        }
    }

    fn abort(&mut self, xfer: ControlOut<B>) {
        match self.status.state() {
            DFUState::DfuIdle
            | DFUState::DfuUploadIdle
            | DFUState::DfuDnloadIdle
            | DFUState::DfuDnloadSync
            | DFUState::DfuManifestSync => {
                self.status.command = Command::None;
                self.status.pending = Command::None;
                self.status.new_state_ok(DFUState::DfuIdle);
                xfer.accept().ok();
            }
            DFUState::AppDetach
            | DFUState::AppIdle
            | DFUState::DfuDnBusy
            | DFUState::DfuManifest
            | DFUState::DfuManifestWaitReset
            | DFUState::DfuError => {
                xfer.reject().ok();
            }
        }
    }

    fn download(&mut self, xfer: ControlOut<B>, req: Request) {
        let initial_state = self.status.state();

        if initial_state != DFUState::DfuIdle && initial_state != DFUState::DfuDnloadIdle {
            self.status
                .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
            xfer.reject().ok();
            return;
        }

        if req.length == 0 {
            self.status.command = Command::LeaveDFU;
            self.status.new_state_ok(DFUState::DfuManifestSync);
            xfer.accept().ok();
            return;
        }

        if req.value > 1 {
            let data = xfer.data();
            if !data.is_empty() {
                self.buffer.clear();
                if self.buffer.extend_from_slice(data).is_err() {
                    self.status
                        .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
                    xfer.reject().ok();
                    return;
                }
                self.status.command = Command::WriteMemory {
                    block_num: req.value - 2,
                    len: data.len() as u16,
                };
                self.status.new_state_ok(DFUState::DfuDnloadSync);
                xfer.accept().ok();
                return;
            }
        } else if req.value == 0 {
            let data = xfer.data();
            let command = match data {
                [c, a0, a1, a2, a3] if *c == DnloadCommand::SetAddressPointer as u8 => {
                    Some(Command::SetAddressPointer(u32::from_le_bytes([*a0, *a1, *a2, *a3])))
                }
                [c, a0, a1, a2, a3] if *c == DnloadCommand::Erase as u8 => {
                    Some(Command::EraseBlock(u32::from_le_bytes([*a0, *a1, *a2, *a3])))
                }
                [c] if *c == DnloadCommand::Erase as u8 => Some(Command::EraseAll),
                [c] if *c == DnloadCommand::ReadUnprotect as u8 => Some(Command::ReadUnprotect),
                _ => None,
            };
            if let Some(command) = command {
                self.status.command = command;
                self.status.new_state_ok(DFUState::DfuDnloadSync);
                xfer.accept().ok();
                return;
            }
        }

        self.status
            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
        xfer.reject().ok();
    }

    fn upload(&mut self, xfer: ControlIn<B>, req: Request) {
        let initial_state = self.status.state();

        if initial_state != DFUState::DfuIdle && initial_state != DFUState::DfuUploadIdle {
            self.status
                .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
            xfer.reject().ok();
            return;
        }

        if req.value == 0 {
            // Get command
            let commands = [
                DnloadCommand::GetCommands as u8,
                DnloadCommand::SetAddressPointer as u8,
                DnloadCommand::Erase as u8,
                DnloadCommand::ReadUnprotect as u8,
            ];

            if req.length as usize >= commands.len() {
                self.status.new_state_ok(DFUState::DfuIdle);
                xfer.accept_with(&commands).ok();
                return;
            }
        } else if req.value > 1 {
            let block_num = req.value - 2;
            let transfer_size = min(min(P::TRANSFER_SIZE, req.length) as usize, MAX_TRANSFER_SIZE);

            let filled = match alternate_phase(self.alt) {
                Phase::Cmd => self.fill_phase_reply(),
                Phase::Otp => self.fill_otp(block_num, transfer_size),
                phase => self.fill_memory(phase, block_num, transfer_size),
            };

            match filled {
                Ok(()) => {
                    if self.buffer.len() < P::TRANSFER_SIZE as usize {
                        // short frame, back to idle
                        self.status.new_state_ok(DFUState::DfuIdle);
                    } else {
                        self.status.new_state_ok(DFUState::DfuUploadIdle);
                    }
                    let len = min(self.buffer.len(), req.length as usize);
                    xfer.accept_with(&self.buffer[..len]).ok();
                }
                Err(e) => {
                    self.status.fail(e);
                    xfer.reject().ok();
                }
            }
            return;
        }

        self.status
            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
        xfer.reject().ok();
    }

    /// Phase reply: id, destination, then four reserved bytes.
    ///
    /// Phases come in pairs of reads, the first read of a pair moves the
    /// session to the next phase, the second reports it again.
    fn fill_phase_reply(&mut self) -> Result<(), Error> {
        let step = if self.phase_reported {
            self.phase_reported = false;
            self.session.current()
        } else {
            let step = self.session.next_phase(&self.registry)?;
            info!("dfu: phase 0x{:02X} at 0x{:08X}", step.phase.id(), step.destination);
            self.phase_reported = true;
            step
        };

        let mut reply = [0u8; PHASE_REPLY_SIZE];
        reply[0] = step.phase.id();
        reply[1..5].copy_from_slice(&step.destination.to_le_bytes());
        self.buffer.clear();
        self.buffer
            .extend_from_slice(&reply)
            .map_err(|_| Error::InvalidLength)
    }

    fn fill_otp(&mut self, block_num: u16, transfer_size: usize) -> Result<(), Error> {
        self.buffer.clear();
        let mut words = transfer_size / 4;
        if block_num == 0 {
            let (version, global_state) = self.session.otp_begin_read(&self.registry);
            self.push_word(version)?;
            self.push_word(global_state)?;
            words = words.saturating_sub(2);
        }
        for _ in 0..words {
            let word = self.session.otp_next_word(&self.registry);
            self.push_word(word)?;
        }
        Ok(())
    }

    fn push_word(&mut self, word: u32) -> Result<(), Error> {
        self.buffer
            .extend_from_slice(&word.to_le_bytes())
            .map_err(|_| Error::InvalidLength)
    }

    fn fill_memory(&mut self, phase: Phase, block_num: u16, transfer_size: usize) -> Result<(), Error> {
        if self.board.readout_protected() {
            return Err(Error::ReadoutProtected);
        }
        let address = self
            .session
            .destination(phase)
            .checked_add(block_num as u32 * transfer_size as u32)
            .ok_or(Error::AddressOutOfRange)?;
        let index = self
            .registry
            .memory_index(address)
            .ok_or(Error::AddressOutOfRange)?;

        self.buffer.clear();
        for i in 0..transfer_size {
            let byte = self.registry.read(address.wrapping_add(i as u32), index);
            self.buffer.push(byte).map_err(|_| Error::InvalidLength)?;
        }
        Ok(())
    }

    fn get_state(&mut self, xfer: ControlIn<B>, req: Request) {
        // return current state, without any state transition
        if req.length > 0 {
            let v = self.status.state() as u8;
            xfer.accept_with(&[v]).ok();
        } else {
            self.status
                .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
            xfer.reject().ok();
        }
    }

    fn get_status(&mut self, xfer: ControlIn<B>, req: Request) {
        if req.length >= 6 && self.process() {
            self.status.poll_timeout = self.expected_timeout();
            let v: [u8; 6] = self.status.into();
            xfer.accept_with(&v).ok();
            return;
        }

        self.status
            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrStalledPkt);
        xfer.reject().ok();
    }

    fn expected_timeout(&self) -> u32 {
        match self.status.pending {
            Command::WriteMemory { .. } => P::BLOCK_PROGRAM_TIME_MS,
            Command::EraseAll => P::FULL_ERASE_TIME_MS,
            Command::EraseBlock(_) => P::PAGE_ERASE_TIME_MS,
            Command::LeaveDFU => P::MANIFESTATION_TIME_MS,
            _ => 0,
        }
    }

    fn write_block(&mut self, block_num: u16, len: usize) -> Result<(), Error> {
        if self.board.readout_protected() {
            return Err(Error::ReadoutProtected);
        }
        let data = &self.buffer[..len];
        let first = block_num == 0;

        match alternate_phase(self.alt) {
            Phase::Otp => self
                .session
                .otp_write(&self.registry, first, data)
                .map(|_| ()),
            Phase::FlashLayout => {
                let offset = self.session.take_offset(Phase::FlashLayout, len, first);
                self.session.ingest_layout(offset as usize, data)
            }
            phase @ (Phase::Phase3 | Phase::Phase4 | Phase::Phase5) => {
                let offset = self.session.take_offset(phase, len, first);
                let address = self
                    .session
                    .destination(phase)
                    .checked_add(offset)
                    .ok_or(Error::AddressOutOfRange)?;
                if phase == Phase::Phase4 && first && !self.registry.init(address) {
                    return Err(Error::MemoryInitFailure);
                }
                self.session.program(&self.registry, address, data)
            }
            _ => Err(Error::UnsupportedSubcommand),
        }
    }

    fn update_impl(&mut self) {
        match self.status.pending {
            Command::EraseAll => match self.registry.mass_erase(P::DEFAULT_MEMORY_ADDRESS) {
                Dispatch::Done => self.status.new_state_ok(DFUState::DfuDnloadSync),
                Dispatch::Skipped => self
                    .status
                    .new_state_status(DFUState::DfuError, DFUStatusCode::ErrErase),
            },
            Command::EraseBlock(address) => {
                if self.registry.address_area(address) == AreaType::Error {
                    self.status
                        .new_state_status(DFUState::DfuError, DFUStatusCode::ErrAddress);
                } else {
                    let end = address.saturating_add(P::FLASH_PAGE_SIZE);
                    match self.registry.sector_erase(address, address, end) {
                        Dispatch::Done => self.status.new_state_ok(DFUState::DfuDnloadSync),
                        Dispatch::Skipped => self
                            .status
                            .new_state_status(DFUState::DfuError, DFUStatusCode::ErrErase),
                    }
                }
            }
            Command::LeaveDFU => {
                let address = self.status.address_pointer;
                if self.registry.check_jump_address(address) {
                    info!("dfu: leave, start image at 0x{:08X}", address);
                    self.jump = Some(address);
                    if P::MANIFESTATION_TOLERANT {
                        self.status.new_state_ok(DFUState::DfuManifestSync)
                    } else {
                        self.status.new_state_ok(DFUState::DfuManifestWaitReset)
                    }
                } else {
                    warn!("dfu: nothing to start at 0x{:08X}", address);
                    self.status
                        .new_state_status(DFUState::DfuError, DFUStatusCode::ErrTarget);
                }
            }
            Command::ReadUnprotect => match self.board.set_readout_protection(false) {
                Ok(()) => self.status.new_state_ok(DFUState::DfuDnloadSync),
                Err(e) => {
                    warn!("dfu: read unprotect: {}", e);
                    self.status
                        .new_state_status(DFUState::DfuError, DFUStatusCode::ErrVendor)
                }
            },
            Command::WriteMemory { block_num, len } => {
                match self.write_block(block_num, len as usize) {
                    Ok(()) => self.status.new_state_ok(DFUState::DfuDnloadSync),
                    Err(e) => self.status.fail(e),
                }
            }
            Command::SetAddressPointer(p) => {
                self.status.address_pointer = p;
                self.status.new_state_ok(DFUState::DfuDnloadSync)
            }
            Command::None => {}
        }
        self.status.pending = Command::None;
    }

    fn process(&mut self) -> bool {
        let initial_state = self.status.state();
        if initial_state == DFUState::DfuDnloadSync {
            match self.status.command {
                Command::WriteMemory { .. }
                | Command::SetAddressPointer(_)
                | Command::ReadUnprotect
                | Command::EraseAll
                | Command::EraseBlock(_) => {
                    self.status.pending = self.status.command;
                    self.status.command = Command::None;
                    self.status.new_state_ok(DFUState::DfuDnBusy);
                }
                _ => {
                    self.status.new_state_ok(DFUState::DfuDnloadIdle);
                }
            }
        } else if initial_state == DFUState::DfuManifestSync {
            match self.status.command {
                Command::None => {
                    if P::MANIFESTATION_TOLERANT {
                        // Leave manifestation, back to Idle
                        self.status.new_state_ok(DFUState::DfuIdle);
                    }
                }
                _ => {
                    // Start manifestation
                    self.status.pending = self.status.command;
                    self.status.command = Command::None;
                    self.status.new_state_ok(DFUState::DfuManifest);
                }
            }
        } else if initial_state == DFUState::DfuDnBusy {
            return false;
        }

        true
    }
}
