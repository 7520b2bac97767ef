//! Record framing: CRLF-delimited byte records.
//!
//! Splits an inbound byte stream at LF, stripping a preceding CR when
//! present. A bare LF is accepted as a terminator for robustness; a CR
//! alone never terminates a record. Records are bytes; no UTF-8
//! interpretation happens here. Outbound CRLF termination is appended by
//! the connection write path, so callers pass bare lines.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Splits the read buffer into line records with a length cap.
pub struct LineCodec {
    max_len: usize,
    // Index up to which the buffer has already been scanned for LF.
    next_index: usize,
}

impl LineCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len, next_index: 0 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("record exceeds {0} bytes")]
    Oversize(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        match buf[self.next_index..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let pos = self.next_index + offset;
                if pos > self.max_len {
                    return Err(FramingError::Oversize(self.max_len));
                }
                let mut line = buf.split_to(pos + 1);
                self.next_index = 0;
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Ok(Some(line.freeze()))
            }
            None => {
                if buf.len() > self.max_len {
                    return Err(FramingError::Oversize(self.max_len));
                }
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        // A trailing partial record with no terminator is discarded.
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None => {
                buf.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}
