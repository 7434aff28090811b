use std::io::{self, Read, Write};

use log::trace;
use thiserror::Error;

use crate::error::ProtocolError;

use super::{
    Frame,
    frame::{FrameHeader, HEADER_SIZE},
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
}

/// Reads and writes whole frames over a byte stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        trace!(
            "writing frame seq={} command={} size={}",
            frame.header.seq, frame.header.command, frame.header.body_size
        );
        self.stream.write_all(&frame.header.to_bytes()?)?;
        self.stream.write_all(&frame.body)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        let mut head = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut head)?;
        let header = FrameHeader::from_bytes(&head)?;

        let mut body = vec![0u8; header.body_size as usize];
        self.stream.read_exact(&mut body)?;
        trace!(
            "read frame seq={} command={} size={}",
            header.seq, header.command, header.body_size
        );
        Ok(Frame { header, body })
    }
}
