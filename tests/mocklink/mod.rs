#![allow(dead_code)]
//! Scripted byte link and host side framing for serial tests.
use std::collections::VecDeque;

use embedded_io::{ErrorKind, ErrorType, Read, Write};

/// Link fed with the whole host script up front.
///
/// Reads return `Ok(0)` once the script is exhausted, which the
/// dispatcher sees as a closed link.
#[derive(Default)]
pub struct MockLink {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    pub flushes: usize,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the device to read.
    pub fn push(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    /// Bytes written by the device since the last call.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl ErrorType for MockLink {
    type Error = ErrorKind;
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.flushes += 1;
        Ok(())
    }
}

pub const ACK: u8 = 0x79;
pub const NACK: u8 = 0x1F;

pub fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Opcode and its complement.
pub fn command(opcode: u8) -> Vec<u8> {
    vec![opcode, !opcode]
}

/// Big-endian address and checksum.
pub fn address(raw: u32) -> Vec<u8> {
    let mut frame = raw.to_be_bytes().to_vec();
    frame.push(xor(&frame));
    frame
}

/// OTP partition address for `packet`.
pub fn otp_address(packet: u32) -> Vec<u8> {
    address(0xF200_0000 | packet)
}

/// Length byte (`len - 1`) and its complement.
pub fn length(len: usize) -> Vec<u8> {
    let n = (len - 1) as u8;
    vec![n, !n]
}

/// `N`, `N + 1` data bytes and the XOR of all of them.
pub fn data(bytes: &[u8]) -> Vec<u8> {
    let n = (bytes.len() - 1) as u8;
    let mut frame = vec![n];
    frame.extend_from_slice(bytes);
    frame.push(n ^ xor(bytes));
    frame
}

/// Two byte big-endian length, the bytes and the XOR of everything.
pub fn buffer(bytes: &[u8]) -> Vec<u8> {
    let mut frame = (bytes.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(bytes);
    frame.push(xor(&frame));
    frame
}

/// Full download command: opcode, address, data.
pub fn download(raw: u32, bytes: &[u8]) -> Vec<u8> {
    let mut script = command(0x31);
    script.extend(address(raw));
    script.extend(data(bytes));
    script
}

/// GetPhase reply for `phase` at `destination`.
pub fn phase_reply(phase: u8, destination: u32) -> Vec<u8> {
    let d = destination.to_le_bytes();
    vec![ACK, 6, phase, d[0], d[1], d[2], d[3], 1, 0, ACK]
}
