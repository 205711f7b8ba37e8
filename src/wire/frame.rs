//! Request and response frames
//!
//! Request layout (native byte order, `FRAME_SIZE` bytes):
//!
//! ```text
//! 0   uid            u32
//! 4   device index   u32
//! 8   tv_sec         i64
//! 16  tv_usec        i64
//! 24  payload length u32
//! 28  reserved       u32
//! 32  payload        PAYLOAD_CAPACITY bytes, zero padded
//! ```
//!
//! Response layout: `uid: u32, verdict: u32`.

use super::{Timeval, VerdictCode};
use crate::{Error, Result};

/// Largest datagram the channel delivers atomically (PIPE_BUF)
pub const FRAME_SIZE: usize = 4096;

/// Fixed request header size
pub const HEADER_SIZE: usize = 32;

/// Payload bytes a single request can carry
pub const PAYLOAD_CAPACITY: usize = FRAME_SIZE - HEADER_SIZE;

/// Response frame size (fixed)
pub const RESPONSE_SIZE: usize = 8;

/// Snapshot of one intercepted packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub uid: u32,
    pub indev: u32,
    pub timestamp: Timeval,
    payload: Vec<u8>,
}

impl PacketRecord {
    /// Build a record, copying at most `PAYLOAD_CAPACITY` bytes of payload
    pub fn new(uid: u32, indev: u32, timestamp: Timeval, payload: &[u8]) -> Self {
        let len = payload.len().min(PAYLOAD_CAPACITY);
        Self {
            uid,
            indev,
            timestamp,
            payload: payload[..len].to_vec(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encode as a full request frame
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; FRAME_SIZE];
        buffer[0..4].copy_from_slice(&self.uid.to_ne_bytes());
        buffer[4..8].copy_from_slice(&self.indev.to_ne_bytes());
        buffer[8..16].copy_from_slice(&self.timestamp.sec.to_ne_bytes());
        buffer[16..24].copy_from_slice(&self.timestamp.usec.to_ne_bytes());
        buffer[24..28].copy_from_slice(&(self.payload.len() as u32).to_ne_bytes());
        buffer[HEADER_SIZE..HEADER_SIZE + self.payload.len()].copy_from_slice(&self.payload);
        buffer
    }
}

/// Parsed request frame (zero-copy reference)
#[derive(Debug)]
pub struct RequestFrame<'a> {
    buffer: &'a [u8],
}

impl<'a> RequestFrame<'a> {
    /// Parse a request datagram; anything but exactly `FRAME_SIZE` bytes is rejected
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() != FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "request frame is {} bytes, expected {}",
                buffer.len(),
                FRAME_SIZE
            )));
        }

        let frame = Self { buffer };
        if frame.payload_len() > PAYLOAD_CAPACITY {
            return Err(Error::Protocol(format!(
                "payload length {} exceeds capacity {}",
                frame.payload_len(),
                PAYLOAD_CAPACITY
            )));
        }

        Ok(frame)
    }

    pub fn uid(&self) -> u32 {
        u32::from_ne_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ])
    }

    pub fn indev(&self) -> u32 {
        u32::from_ne_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ])
    }

    pub fn timestamp(&self) -> Timeval {
        let mut sec = [0u8; 8];
        let mut usec = [0u8; 8];
        sec.copy_from_slice(&self.buffer[8..16]);
        usec.copy_from_slice(&self.buffer[16..24]);
        Timeval::new(i64::from_ne_bytes(sec), i64::from_ne_bytes(usec))
    }

    pub fn payload_len(&self) -> usize {
        u32::from_ne_bytes([
            self.buffer[24],
            self.buffer[25],
            self.buffer[26],
            self.buffer[27],
        ]) as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..HEADER_SIZE + self.payload_len()]
    }

    pub fn to_record(&self) -> PacketRecord {
        PacketRecord::new(self.uid(), self.indev(), self.timestamp(), self.payload())
    }
}

/// Verdict response from the decision process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    pub uid: u32,
    pub code: VerdictCode,
}

impl ResponseFrame {
    pub fn new(uid: u32, code: impl Into<VerdictCode>) -> Self {
        Self {
            uid,
            code: code.into(),
        }
    }

    /// Parse a response datagram; short or oversized datagrams are errors
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() != RESPONSE_SIZE {
            return Err(Error::Protocol(format!(
                "response frame is {} bytes, expected {}",
                buffer.len(),
                RESPONSE_SIZE
            )));
        }

        let uid = u32::from_ne_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        let code = u32::from_ne_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);

        Ok(Self {
            uid,
            code: VerdictCode::from_u32(code),
        })
    }

    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let mut buffer = [0u8; RESPONSE_SIZE];
        buffer[0..4].copy_from_slice(&self.uid.to_ne_bytes());
        buffer[4..8].copy_from_slice(&self.code.as_u32().to_ne_bytes());
        buffer
    }
}
