//! Line codec for the receiver's telnet protocol.
//!
//! The receiver terminates every command and event with a carriage return.
//! Reads may carry several lines or only part of one, so the decoder buffers
//! until a terminator arrives. Both `\r` and `\n` are accepted as terminators
//! and empty lines are skipped.
//!
//! ```text
//! "MV35\rMU"  ->  "MV35"      (then waits)
//! "OFF\r"     ->  "MUOFF"
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum accepted line length in bytes
pub const MAX_LINE_LENGTH: usize = 4096;

/// Terminator appended to outbound commands
pub const LINE_TERMINATOR: u8 = b'\r';

/// Codec splitting the byte stream into text lines.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Bytes already scanned for a terminator
    scanned: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let terminator = src[self.scanned..]
                .iter()
                .position(|b| *b == b'\r' || *b == b'\n');

            let Some(offset) = terminator else {
                self.scanned = src.len();
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong(src.len()));
                }
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            let line = src.split_to(end);
            src.advance(1);

            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_LINE_LENGTH {
                return Err(CodecError::LineTooLong(line.len()));
            }

            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(LINE_TERMINATOR);
        Ok(())
    }
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Line too long: {0} bytes (max: {MAX_LINE_LENGTH})")]
    LineTooLong(usize),
}
