use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
};

use crate::{buffer::BufferError, error::ProtocolError};

use super::Command;

pub const CPROTO_MAGIC: u32 = 0xEEDD1132;
pub const CPROTO_VERSION: u16 = 0x104;
pub const CPROTO_MIN_VERSION: u16 = 0x104;
pub const CPROTO_VERSION_MASK: u16 = 0x3FF;
pub const CPROTO_COMPRESSION_FLAG: u16 = 1 << 10;

pub const HEADER_SIZE: usize = 16;
pub const MAX_BODY_SIZE: usize = 1 << 30;

pub(crate) fn header_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub command: u16,
    pub body_size: u32,
    pub seq: u32,
}

impl FrameHeader {
    pub fn new(command: Command, body_size: u32, seq: u32) -> Self {
        Self {
            magic: CPROTO_MAGIC,
            version: CPROTO_VERSION,
            command: command.into(),
            body_size,
            seq,
        }
    }

    pub fn proto_version(&self) -> u16 {
        self.version & CPROTO_VERSION_MASK
    }

    pub fn compressed(&self) -> bool {
        self.version & CPROTO_COMPRESSION_FLAG != 0
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.magic != CPROTO_MAGIC {
            return Err(ProtocolError::BadMagic { found: self.magic });
        }
        if self.proto_version() < CPROTO_MIN_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: self.proto_version(),
                min: CPROTO_MIN_VERSION,
            });
        }
        if self.compressed() {
            return Err(ProtocolError::Compressed);
        }
        if self.body_size as usize > MAX_BODY_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.body_size as usize,
                limit: MAX_BODY_SIZE,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE], ProtocolError> {
        let mut out = [0u8; HEADER_SIZE];
        bincode::encode_into_slice(*self, &mut out, header_config())?;
        Ok(out)
    }

    /// Decodes and validates a header. Fails before looking at any body.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let (header, _): (FrameHeader, usize) =
            bincode::decode_from_slice(bytes, header_config())?;
        header.validate()?;
        Ok(header)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command, seq: u32, body: Vec<u8>) -> Result<Self, ProtocolError> {
        if body.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                limit: MAX_BODY_SIZE,
            });
        }
        Ok(Self {
            header: FrameHeader::new(command, body.len() as u32, seq),
            body,
        })
    }

    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    pub fn command(&self) -> Result<Command, ProtocolError> {
        Command::try_from(self.header.command)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.header.to_bytes()?);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let head: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(BufferError::Underflow {
                position: 0,
                length: bytes.len(),
                need: HEADER_SIZE,
            })?;
        let header = FrameHeader::from_bytes(head)?;

        let end = HEADER_SIZE + header.body_size as usize;
        let body = bytes.get(HEADER_SIZE..end).ok_or(BufferError::Underflow {
            position: HEADER_SIZE,
            length: bytes.len(),
            need: header.body_size as usize,
        })?;

        Ok(Self {
            header,
            body: body.to_vec(),
        })
    }
}
