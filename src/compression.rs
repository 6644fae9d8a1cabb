//! Transport decompression for binary gateway frames.
//!
//! The gateway negotiates transport compression through the `compress` query
//! parameter. The decompression context is owned by the connection and
//! survives across messages: with `zlib-stream` the server sends one endless
//! deflate stream, flushing at message boundaries, so the inflate state must
//! carry over from frame to frame. Text frames never pass through the codec.

use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::{DataFormat, MZError, MZFlush, MZStatus};

use crate::error::Error;

/// Transport compression negotiated with the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    /// No transport compression; binary frames pass through untouched.
    #[default]
    None,
    /// Shared-context zlib across the whole connection.
    ZlibStream,
}

impl Compression {
    /// Value for the `compress` query parameter, if one is sent at all.
    pub(crate) fn query_value(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::ZlibStream => Some("zlib-stream"),
        }
    }

    /// Fresh decompression context for one connection attempt.
    pub(crate) fn decompressor(self) -> Box<dyn Decompressor> {
        match self {
            Compression::None => Box::new(Identity),
            Compression::ZlibStream => Box::new(ZlibStream::new()),
        }
    }
}

/// Stateful frame decompressor. One instance per connection.
pub(crate) trait Decompressor: Send {
    fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>, Error>;
}

struct Identity;

impl Decompressor for Identity {
    fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(input.to_vec())
    }
}

struct ZlibStream {
    state: Box<InflateState>,
}

impl ZlibStream {
    fn new() -> Self {
        Self {
            state: InflateState::new_boxed(DataFormat::Zlib),
        }
    }
}

impl Decompressor for ZlibStream {
    fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(input.len().saturating_mul(3));
        let mut buf = [0u8; 16 * 1024];
        let mut consumed = 0;

        loop {
            let result = inflate(&mut self.state, &input[consumed..], &mut buf, MZFlush::None);
            out.extend_from_slice(&buf[..result.bytes_written]);
            consumed += result.bytes_consumed;

            match result.status {
                Ok(MZStatus::StreamEnd) => return Ok(out),
                Ok(MZStatus::Ok) => {
                    // Loop again while there is pending input or the output
                    // buffer filled up exactly.
                    if consumed >= input.len() && result.bytes_written < buf.len() {
                        return Ok(out);
                    }
                    if result.bytes_consumed == 0 && result.bytes_written == 0 {
                        return Err(Error::Decompress("inflate made no progress".to_owned()));
                    }
                }
                Ok(status) => {
                    return Err(Error::Decompress(format!("unexpected status {status:?}")))
                }
                Err(MZError::Buf) if consumed >= input.len() => return Ok(out),
                Err(err) => return Err(Error::Decompress(format!("{err:?}"))),
            }
        }
    }
}
