//! Loss worker frame format
//!
//! Layout: [Header][JSON payload][CRC32]
//! The checksum covers header and payload, little-endian throughout.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read};
use thiserror::Error;

/// Magic bytes: "SLW1"
pub const MAGIC: [u8; 4] = *b"SLW1";

/// Current frame version
pub const VERSION: u16 = 1;

/// Upper bound on a payload, keeps a corrupt length from allocating wildly
pub const MAX_PAYLOAD: u32 = 1 << 30;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid magic: {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported frame version: {0}")]
    BadVersion(u16),
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),
    #[error("frame truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("payload of {0} bytes exceeds limit")]
    TooLarge(u32),
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("payload json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Frame kind discriminant
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    Failure = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::Failure),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub kind: u8,
    pub payload_len: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 11; // 4 + 2 + 1 + 4

    pub fn new(kind: FrameKind, payload_len: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            kind: kind as u8,
            payload_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.kind;
        buf[7..11].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < Self::SIZE {
            return Err(FrameError::Truncated {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            kind: bytes[6],
            payload_len: u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]),
        })
    }

    pub fn validate(&self) -> Result<FrameKind, FrameError> {
        if self.magic != MAGIC {
            return Err(FrameError::BadMagic(self.magic));
        }
        if self.version != VERSION {
            return Err(FrameError::BadVersion(self.version));
        }
        if self.payload_len > MAX_PAYLOAD {
            return Err(FrameError::TooLarge(self.payload_len));
        }
        FrameKind::try_from(self.kind)
    }
}

/// One message exchanged with the loss worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode<T: Serialize>(kind: FrameKind, value: &T) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(value)?;
        if payload.len() > MAX_PAYLOAD as usize {
            return Err(FrameError::TooLarge(u32::MAX));
        }
        Ok(Self { kind, payload })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = FrameHeader::new(self.kind, self.payload.len() as u32);
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + self.payload.len() + 4);
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse exactly one frame; trailing bytes are rejected
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::from_bytes(data)?;
        let kind = header.validate()?;

        let expected = FrameHeader::SIZE + header.payload_len as usize + 4;
        if data.len() != expected {
            return Err(FrameError::Truncated {
                expected,
                actual: data.len(),
            });
        }

        let body_end = expected - 4;
        let expected_crc = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        let actual_crc = crc32fast::hash(&data[..body_end]);
        if actual_crc != expected_crc {
            return Err(FrameError::Checksum {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        Ok(Self {
            kind,
            payload: data[FrameHeader::SIZE..body_end].to_vec(),
        })
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, FrameError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::from_bytes(&data)
    }
}
