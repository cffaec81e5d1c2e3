//! Version dispatch and the incremental parsing interface consumed by
//! the convergence-layer RX path.

use crate::bundle::{Bundle, ProtocolVersion};
use crate::{bundle6, bundle7, Error, Result};

/// Serializes a bundle in its wire format through `write`.
///
/// Bytes already emitted are not undone on failure; the transport must
/// reset the connection in that case.
pub fn serialize(
    bundle: &Bundle,
    write: &mut dyn FnMut(&[u8]) -> std::io::Result<()>,
) -> Result<()> {
    match bundle.version {
        ProtocolVersion::V6 => bundle6::serialize(bundle, write),
        ProtocolVersion::V7 => bundle7::serialize(bundle, write),
    }
}

/// Serializes a bundle into a fresh buffer.
pub fn serialize_to_vec(bundle: &Bundle) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bundle.payload_length() as usize + 64);
    serialize(bundle, &mut |chunk| {
        out.extend_from_slice(chunk);
        Ok(())
    })?;
    Ok(out)
}

/// Number of bytes the bundle occupies on the wire.
pub fn serialized_size(bundle: &Bundle) -> usize {
    serialize_to_vec(bundle).map(|v| v.len()).unwrap_or(0)
}

/// Parses one complete bundle, auto-detecting the protocol version from
/// the first byte (BPv6 starts with 0x06, BPv7 with a CBOR array head).
pub fn parse(data: &[u8]) -> Result<(Bundle, usize)> {
    match data.first() {
        None => Err(Error::Incomplete(1)),
        Some(6) => bundle6::parse(data),
        Some(_) => bundle7::parse(data),
    }
}

/// Outcome of feeding a chunk to a [`BundleParser`].
#[derive(Debug)]
pub struct ReadResult {
    /// How many bytes of the supplied chunk were consumed.
    pub consumed: usize,
    pub status: ParseStatus,
}

#[derive(Debug)]
pub enum ParseStatus {
    /// More input is required; `hint` is a lower bound on the number of
    /// missing bytes (useful for bulk payload reads).
    NeedMore { hint: usize },
    /// A complete bundle was assembled.
    Done(Box<Bundle>),
    /// The input is not a valid bundle; reset the parser and the
    /// transport framing.
    Error,
}

/// Incremental bundle parser: buffers chunks until a complete bundle of
/// the selected version can be decoded.
#[derive(Debug, Default)]
pub struct BundleParser {
    buf: Vec<u8>,
    version: Option<ProtocolVersion>,
    poisoned: bool,
}

impl BundleParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// A parser fixed to one protocol version (rejects the other).
    pub fn for_version(version: ProtocolVersion) -> Self {
        Self {
            buf: Vec::new(),
            version: Some(version),
            poisoned: false,
        }
    }

    /// Discards all buffered state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.poisoned = false;
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feeds a chunk. At most one bundle is returned per call; pass an
    /// empty chunk to continue draining buffered data.
    pub fn parse(&mut self, chunk: &[u8]) -> ReadResult {
        if self.poisoned {
            return ReadResult {
                consumed: 0,
                status: ParseStatus::Error,
            };
        }
        self.buf.extend_from_slice(chunk);
        let attempt = match (self.version, self.buf.first()) {
            (_, None) => Err(Error::Incomplete(1)),
            (Some(ProtocolVersion::V6), _) => bundle6::parse(&self.buf),
            (Some(ProtocolVersion::V7), _) => bundle7::parse(&self.buf),
            (None, Some(_)) => parse(&self.buf),
        };
        match attempt {
            Ok((bundle, used)) => {
                self.buf.drain(..used);
                ReadResult {
                    consumed: chunk.len(),
                    status: ParseStatus::Done(Box::new(bundle)),
                }
            }
            Err(Error::Incomplete(hint)) => ReadResult {
                consumed: chunk.len(),
                status: ParseStatus::NeedMore { hint },
            },
            Err(_) => {
                self.poisoned = true;
                ReadResult {
                    consumed: chunk.len(),
                    status: ParseStatus::Error,
                }
            }
        }
    }
}
