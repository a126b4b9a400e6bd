//! Length + crc32c framing for channel packets.
//!
//! Layout: `u32 LE length | u32 LE crc32c(body) | body`.

use std::io::{self, Read, Write};

use crc32c::crc32c;
use thiserror::Error;

use crate::core::error::details::FrameTooLargeDetails;
use crate::core::{ErrorPayload, ProtocolErrorCode};

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    CrcMismatch { expected: u32, got: u32 },
}

impl FrameError {
    /// Payload to send before closing, or `None` when the transport itself
    /// failed and nothing can be sent.
    pub fn as_error_payload(&self) -> Option<ErrorPayload> {
        match self {
            FrameError::Io(_) => None,
            FrameError::TooLarge {
                max_frame_bytes,
                got_bytes,
            } => Some(
                ErrorPayload::new(
                    ProtocolErrorCode::FrameTooLarge,
                    "frame exceeds max_frame_bytes",
                    false,
                )
                .with_details(FrameTooLargeDetails {
                    max_frame_bytes: *max_frame_bytes as u64,
                    got_bytes: *got_bytes as u64,
                }),
            ),
            FrameError::LengthInvalid { .. } | FrameError::CrcMismatch { .. } => Some(
                ErrorPayload::new(ProtocolErrorCode::MalformedPayload, self.to_string(), false),
            ),
        }
    }
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Reads one frame. `Ok(None)` is a clean end of stream between frames.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if !read_full(&mut self.reader, &mut header, "frame header truncated")? {
            return Ok(None);
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            return Err(FrameError::LengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut body = vec![0u8; length];
        if !read_full(&mut self.reader, &mut body, "frame body truncated")? {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "frame body missing").into());
        }

        let got = crc32c(&body);
        if got != expected {
            return Err(FrameError::CrcMismatch { expected, got });
        }
        Ok(Some(body))
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }
}

/// Fills `buf` completely. Returns `false` on EOF before the first byte.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], truncated: &str) -> io::Result<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = match reader.read(&mut buf[read..]) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if n == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, truncated.to_string()));
        }
        read += n;
    }
    Ok(true)
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::LengthInvalid {
            reason: "frame length cannot be zero".to_string(),
        });
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::LengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc32c(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}
